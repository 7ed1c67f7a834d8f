//! External device registry types.
//!
//! A device is a stimulator or recorder attached to the acquisition
//! hardware. Concrete drivers live outside this crate; the controller only
//! sees the `ExternalDevice` seam. Devices are unique by name within a
//! controller and carry a weak back-pointer to it, which `validate`
//! self-heals if it drifts.

use crate::controller::Controller;
use crate::epoch::Background;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

/// Identity key for a device: `(name, manufacturer)`.
///
/// Epoch maps and the persistor address devices through this key rather
/// than through driver handles, so relations never create ownership
/// cycles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceRef {
    pub name: String,
    pub manufacturer: String,
}

impl DeviceRef {
    pub fn new(name: impl Into<String>, manufacturer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manufacturer: manufacturer.into(),
        }
    }
}

impl std::fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.manufacturer)
    }
}

/// A stimulator or recorder attached to the acquisition pipeline.
pub trait ExternalDevice: Send + Sync {
    fn name(&self) -> &str;

    fn manufacturer(&self) -> &str;

    fn device_ref(&self) -> DeviceRef {
        DeviceRef::new(self.name(), self.manufacturer())
    }

    /// Binds the device to its owning controller. Called by
    /// `Controller::add_device` and again by `validate` when the
    /// back-pointer has drifted.
    fn bind_controller(&self, controller: &Arc<Controller>);

    /// The owning controller, if still alive and bound.
    fn controller(&self) -> Option<Arc<Controller>>;

    /// Steady-state output applied when no stimulus is present.
    fn background(&self) -> Option<Background>;

    /// Device-specific wire-up checks.
    fn validate(&self) -> std::result::Result<(), String> {
        if self.name().is_empty() {
            return Err("device name must not be empty".to_string());
        }
        if self.controller().is_none() {
            return Err(format!(
                "device '{}' is not bound to a controller",
                self.name()
            ));
        }
        Ok(())
    }
}

/// A plain named device with an optional background and no unit
/// conversion.
pub struct GenericDevice {
    name: String,
    manufacturer: String,
    background: Mutex<Option<Background>>,
    controller: Mutex<Weak<Controller>>,
}

impl GenericDevice {
    pub fn new(name: impl Into<String>, manufacturer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manufacturer: manufacturer.into(),
            background: Mutex::new(None),
            controller: Mutex::new(Weak::new()),
        }
    }

    pub fn with_background(self, background: Background) -> Self {
        *self.background.lock() = Some(background);
        self
    }

    pub fn set_background(&self, background: Background) {
        *self.background.lock() = Some(background);
    }
}

impl ExternalDevice for GenericDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    fn bind_controller(&self, controller: &Arc<Controller>) {
        *self.controller.lock() = Arc::downgrade(controller);
    }

    fn controller(&self) -> Option<Arc<Controller>> {
        self.controller.lock().upgrade()
    }

    fn background(&self) -> Option<Background> {
        self.background.lock().clone()
    }
}

impl std::fmt::Debug for GenericDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericDevice")
            .field("name", &self.name)
            .field("manufacturer", &self.manufacturer)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ref_display() {
        let d = DeviceRef::new("amp", "Axon");
        assert_eq!(d.to_string(), "amp (Axon)");
    }

    #[test]
    fn test_unbound_device_fails_validation() {
        let device = GenericDevice::new("amp", "Axon");
        let err = device.validate().unwrap_err();
        assert!(err.contains("not bound"));
    }

    #[test]
    fn test_background_round_trip() {
        use crate::measurement::Measurement;
        let device = GenericDevice::new("led", "Thor").with_background(Background::new(
            Measurement::new(0.0, "V"),
            Measurement::new(1000.0, "Hz"),
        ));
        assert_eq!(device.background().unwrap().value().quantity(), 0.0);
    }
}
