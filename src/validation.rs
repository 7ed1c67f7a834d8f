//! Epoch shape and wire-up checks.
//!
//! Run before an epoch is enqueued or started, so malformed trials fail
//! fast on the caller's thread instead of mid-acquisition.

use crate::epoch::Epoch;

/// Validates the shape of an epoch.
///
/// Rejects an indefinite epoch that registers responses, and any stimulus
/// whose duration does not exactly equal the epoch's (both the
/// definite/indefinite flag and the tick count must match).
pub fn validate_epoch(epoch: &Epoch) -> Result<(), String> {
    if epoch.duration().is_indefinite() && epoch.response_count() > 0 {
        return Err("an indefinite epoch cannot register responses".to_string());
    }
    for (device, slot) in epoch.stimuli() {
        let stimulus_duration = slot.stimulus().duration();
        if stimulus_duration != epoch.duration() {
            return Err(format!(
                "stimulus '{}' for device '{}' does not span the epoch ({:?} != {:?})",
                slot.stimulus().stimulus_id(),
                device,
                stimulus_duration,
                epoch.duration()
            ));
        }
    }
    Ok(())
}
