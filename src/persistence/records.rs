//! Fixed record layouts shared across the file.
//!
//! These compound types are part of the persisted format and are pinned at
//! file creation; widening any field is a format change and requires a
//! version bump.

use crate::error::{DaqError, Result};
use crate::measurement::Measurement;
use chrono::{DateTime, FixedOffset};
use hdf5::types::{FixedAscii, VarLenAscii};
use hdf5::H5Type;

use super::time;

/// File-level `version` attribute value written at creation; any other
/// value is a hard open failure.
pub const FILE_VERSION: u32 = 2;

/// Width of the fixed unit field in a persisted measurement.
pub const UNIT_FIELD_LEN: usize = 10;

/// Chunk length of the extensible `notes` dataset.
pub(crate) const NOTES_CHUNK_LEN: usize = 64;

/// `(ticks, offsetHours)` timestamp compound.
#[derive(H5Type, Clone, Copy, Debug, PartialEq)]
#[repr(C)]
pub struct DateTimeOffsetRecord {
    pub ticks: i64,
    pub offset_hours: f64,
}

impl DateTimeOffsetRecord {
    pub fn from_date_time(time: &DateTime<FixedOffset>) -> Self {
        Self {
            ticks: time::to_ticks(time),
            offset_hours: time::offset_hours(time),
        }
    }

    pub fn to_date_time(&self) -> Result<DateTime<FixedOffset>> {
        time::from_ticks(self.ticks, self.offset_hours)
    }
}

/// One row of the extensible `notes` dataset.
#[derive(H5Type, Clone, Debug)]
#[repr(C)]
pub struct NoteRecord {
    pub time: DateTimeOffsetRecord,
    pub text: VarLenAscii,
}

/// One row of a `data` dataset: `(double quantity, char unit[10])`.
///
/// The unit field is ASCII truncated to 10 bytes with no NUL guarantee;
/// readers stop at a NUL or at 10 bytes.
#[derive(H5Type, Clone, Debug)]
#[repr(C)]
pub struct MeasurementRecord {
    pub quantity: f64,
    pub units: FixedAscii<UNIT_FIELD_LEN>,
}

impl MeasurementRecord {
    /// Silently truncates the display unit to the fixed field width.
    pub fn from_measurement(m: &Measurement) -> Result<Self> {
        Ok(Self {
            quantity: m.quantity(),
            units: truncated_unit(m.display_unit())?,
        })
    }

    pub fn to_measurement(&self) -> Measurement {
        Measurement::new(self.quantity, self.units.as_str())
    }
}

pub(crate) fn truncated_unit(unit: &str) -> Result<FixedAscii<UNIT_FIELD_LEN>> {
    let bytes = unit.as_bytes();
    let n = bytes.len().min(UNIT_FIELD_LEN);
    FixedAscii::from_ascii(&bytes[..n]).map_err(|_| DaqError::NonAscii(unit.to_string()))
}

pub(crate) fn var_ascii(text: &str) -> Result<VarLenAscii> {
    VarLenAscii::from_ascii(text).map_err(|_| DaqError::NonAscii(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_fits() {
        let record = MeasurementRecord::from_measurement(&Measurement::new(1.5, "mV")).unwrap();
        assert_eq!(record.units.as_str(), "mV");
        assert_eq!(record.to_measurement(), Measurement::new(1.5, "mV"));
    }

    #[test]
    fn test_unit_truncates_at_ten_bytes() {
        let record =
            MeasurementRecord::from_measurement(&Measurement::new(1.0, "microsiemens")).unwrap();
        assert_eq!(record.units.as_str(), "microsieme");
    }

    #[test]
    fn test_non_ascii_unit_is_rejected() {
        assert!(matches!(
            MeasurementRecord::from_measurement(&Measurement::new(1.0, "µV")),
            Err(DaqError::NonAscii(_))
        ));
    }

    #[test]
    fn test_date_time_record_round_trip() {
        let t: DateTime<FixedOffset> = "2024-03-01T08:00:00+02:00".parse().unwrap();
        let record = DateTimeOffsetRecord::from_date_time(&t);
        assert_eq!(record.offset_hours, 2.0);
        assert_eq!(record.to_date_time().unwrap(), t);
    }
}
