//! Unit-tagged scalar measurements.
//!
//! Every sample flowing through the pipeline is a `Measurement`: a scalar
//! with a display unit and a base unit. Device-side unit conversion happens
//! outside this crate; by the time data reaches the controller both the
//! display quantity and its base-unit equivalent are fixed.

use serde::{Deserialize, Serialize};

/// A scalar with a display unit and a base-unit quantity.
///
/// `quantity` is expressed in `display_unit` (e.g. `1.5 mV`);
/// `quantity_in_base_unit` is the same physical value in `base_unit`
/// (e.g. `0.0015 V`). For unscaled units the two quantities are equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    quantity: f64,
    display_unit: String,
    base_unit: String,
    quantity_in_base_unit: f64,
}

impl Measurement {
    /// A measurement whose display unit is already the base unit.
    pub fn new(quantity: f64, unit: impl Into<String>) -> Self {
        let unit = unit.into();
        Self {
            quantity,
            display_unit: unit.clone(),
            base_unit: unit,
            quantity_in_base_unit: quantity,
        }
    }

    /// A measurement in a scaled display unit with an explicit base-unit
    /// quantity (conversion is the caller's concern).
    pub fn with_base_unit(
        quantity: f64,
        display_unit: impl Into<String>,
        base_unit: impl Into<String>,
        quantity_in_base_unit: f64,
    ) -> Self {
        Self {
            quantity,
            display_unit: display_unit.into(),
            base_unit: base_unit.into(),
            quantity_in_base_unit,
        }
    }

    pub fn quantity(&self) -> f64 {
        self.quantity
    }

    pub fn display_unit(&self) -> &str {
        &self.display_unit
    }

    pub fn base_unit(&self) -> &str {
        &self.base_unit
    }

    pub fn quantity_in_base_unit(&self) -> f64 {
        self.quantity_in_base_unit
    }
}

impl std::fmt::Display for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.quantity, self.display_unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unscaled_measurement() {
        let m = Measurement::new(2.5, "V");
        assert_eq!(m.quantity(), 2.5);
        assert_eq!(m.display_unit(), "V");
        assert_eq!(m.base_unit(), "V");
        assert_eq!(m.quantity_in_base_unit(), 2.5);
    }

    #[test]
    fn test_scaled_measurement() {
        let m = Measurement::with_base_unit(1.5, "mV", "V", 0.0015);
        assert_eq!(m.quantity(), 1.5);
        assert_eq!(m.display_unit(), "mV");
        assert_eq!(m.quantity_in_base_unit(), 0.0015);
        assert_eq!(m.to_string(), "1.5 mV");
    }
}
