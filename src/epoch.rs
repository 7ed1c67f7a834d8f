//! Per-trial experiment containers.
//!
//! An `Epoch` is one experimental trial: the outgoing stimulus associated
//! with each device, the incoming response buffer for each recording
//! device, the background applied when no stimulus is present, and the
//! protocol parameters describing the trial. The controller installs one
//! epoch at a time and drives data in and out of it; once every response
//! buffer spans the epoch duration the trial is complete.

use crate::device::DeviceRef;
use crate::io_data::IoData;
use crate::measurement::Measurement;
use crate::parameter::{ConfigurationSpan, NodeConfiguration, PropertyValue};
use chrono::{DateTime, FixedOffset};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tracing::trace;

/// The intended length of an epoch.
///
/// Indefinite epochs run until cancelled and never register responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpochDuration {
    Definite(Duration),
    Indefinite,
}

impl EpochDuration {
    pub fn is_indefinite(&self) -> bool {
        matches!(self, Self::Indefinite)
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Definite(d) => Some(*d),
            Self::Indefinite => None,
        }
    }
}

/// The outgoing data source bound to one device for the span of an epoch.
///
/// This is the seam to the stimulus-generation library: the controller only
/// needs identity, timing, and a way to draw the next block of samples.
pub trait Stimulus: Send {
    /// Identifier of the generator that produced this stimulus.
    fn stimulus_id(&self) -> &str;

    /// Display units of the generated samples.
    fn units(&self) -> &str;

    fn sample_rate(&self) -> &Measurement;

    fn duration(&self) -> EpochDuration;

    /// Generator parameters, persisted verbatim with the epoch.
    fn parameters(&self) -> &BTreeMap<String, PropertyValue>;

    /// Draws the next block of at most `requested` worth of samples.
    ///
    /// Returns a positive-duration chunk no longer than `requested` (the
    /// exact length is the stimulus's discretion), or `None` once the
    /// stimulus is exhausted.
    fn pull_data(&mut self, requested: Duration) -> Option<IoData>;
}

/// A stimulus backed by a pre-rendered sample vector.
pub struct PreloadedStimulus {
    stimulus_id: String,
    units: String,
    sample_rate: Measurement,
    parameters: BTreeMap<String, PropertyValue>,
    samples: Vec<Measurement>,
    cursor: usize,
}

impl PreloadedStimulus {
    pub fn new(
        stimulus_id: impl Into<String>,
        units: impl Into<String>,
        sample_rate: Measurement,
        samples: Vec<Measurement>,
    ) -> Self {
        Self {
            stimulus_id: stimulus_id.into(),
            units: units.into(),
            sample_rate,
            parameters: BTreeMap::new(),
            samples,
            cursor: 0,
        }
    }

    pub fn with_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    fn rate_hz(&self) -> f64 {
        self.sample_rate.quantity_in_base_unit()
    }
}

impl Stimulus for PreloadedStimulus {
    fn stimulus_id(&self) -> &str {
        &self.stimulus_id
    }

    fn units(&self) -> &str {
        &self.units
    }

    fn sample_rate(&self) -> &Measurement {
        &self.sample_rate
    }

    fn duration(&self) -> EpochDuration {
        EpochDuration::Definite(Duration::from_secs_f64(
            self.samples.len() as f64 / self.rate_hz(),
        ))
    }

    fn parameters(&self) -> &BTreeMap<String, PropertyValue> {
        &self.parameters
    }

    fn pull_data(&mut self, requested: Duration) -> Option<IoData> {
        let remaining = self.samples.len() - self.cursor;
        if remaining == 0 {
            return None;
        }
        let wanted = (requested.as_secs_f64() * self.rate_hz()).round() as usize;
        let n = wanted.clamp(1, remaining);
        let block = self.samples[self.cursor..self.cursor + n].to_vec();
        self.cursor += n;
        Some(IoData::new(block, self.sample_rate.clone()))
    }
}

/// A stimulus together with the configuration spans logged while it was
/// being emitted.
pub struct StimulusSlot {
    stimulus: Box<dyn Stimulus>,
    output_spans: Vec<ConfigurationSpan>,
}

impl StimulusSlot {
    pub fn stimulus(&self) -> &dyn Stimulus {
        self.stimulus.as_ref()
    }

    pub fn output_spans(&self) -> &[ConfigurationSpan] {
        &self.output_spans
    }
}

/// Incoming sample buffer for one recording device.
pub struct Response {
    sample_rate: Measurement,
    samples: Vec<Measurement>,
    duration: Duration,
    input_time: Option<DateTime<FixedOffset>>,
    spans: Vec<ConfigurationSpan>,
}

impl Response {
    pub fn new(sample_rate: Measurement) -> Self {
        Self {
            sample_rate,
            samples: Vec::new(),
            duration: Duration::ZERO,
            input_time: None,
            spans: Vec::new(),
        }
    }

    pub fn sample_rate(&self) -> &Measurement {
        &self.sample_rate
    }

    pub fn samples(&self) -> &[Measurement] {
        &self.samples
    }

    /// Cumulative duration of everything appended so far.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Arrival time of the first appended chunk.
    pub fn input_time(&self) -> Option<DateTime<FixedOffset>> {
        self.input_time
    }

    pub fn configuration_spans(&self) -> &[ConfigurationSpan] {
        &self.spans
    }

    fn append(&mut self, data: IoData, at: DateTime<FixedOffset>) {
        self.input_time.get_or_insert(at);
        self.duration += data.duration();
        self.spans.push(ConfigurationSpan::new(
            data.duration(),
            data.node_configurations().to_vec(),
        ));
        self.samples.extend(data.into_samples());
    }
}

/// Steady-state output applied on a device in the absence of a stimulus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Background {
    value: Measurement,
    sample_rate: Measurement,
}

impl Background {
    pub fn new(value: Measurement, sample_rate: Measurement) -> Self {
        Self { value, sample_rate }
    }

    pub fn value(&self) -> &Measurement {
        &self.value
    }

    pub fn sample_rate(&self) -> &Measurement {
        &self.sample_rate
    }
}

/// One experimental trial.
///
/// Constructed and wired up (stimuli, responses, backgrounds, parameters)
/// before being handed to the controller; during the run the controller
/// mutates it only through the per-device locks held inside, so distinct
/// devices never contend.
pub struct Epoch {
    protocol_id: String,
    duration: EpochDuration,
    protocol_parameters: BTreeMap<String, PropertyValue>,
    keywords: BTreeSet<String>,
    start_time: Mutex<Option<DateTime<FixedOffset>>>,
    stimuli: HashMap<DeviceRef, Mutex<StimulusSlot>>,
    responses: HashMap<DeviceRef, Mutex<Response>>,
    backgrounds: HashMap<DeviceRef, Background>,
}

impl Epoch {
    pub fn new(protocol_id: impl Into<String>, duration: EpochDuration) -> Self {
        Self {
            protocol_id: protocol_id.into(),
            duration,
            protocol_parameters: BTreeMap::new(),
            keywords: BTreeSet::new(),
            start_time: Mutex::new(None),
            stimuli: HashMap::new(),
            responses: HashMap::new(),
            backgrounds: HashMap::new(),
        }
    }

    pub fn protocol_id(&self) -> &str {
        &self.protocol_id
    }

    pub fn duration(&self) -> EpochDuration {
        self.duration
    }

    pub fn protocol_parameters(&self) -> &BTreeMap<String, PropertyValue> {
        &self.protocol_parameters
    }

    pub fn keywords(&self) -> &BTreeSet<String> {
        &self.keywords
    }

    pub fn add_parameter(&mut self, key: impl Into<String>, value: impl Into<PropertyValue>) {
        self.protocol_parameters.insert(key.into(), value.into());
    }

    pub fn add_keyword(&mut self, keyword: impl Into<String>) {
        self.keywords.insert(keyword.into());
    }

    pub fn add_stimulus(&mut self, device: DeviceRef, stimulus: Box<dyn Stimulus>) {
        self.stimuli.insert(
            device,
            Mutex::new(StimulusSlot {
                stimulus,
                output_spans: Vec::new(),
            }),
        );
    }

    pub fn add_response(&mut self, device: DeviceRef, sample_rate: Measurement) {
        self.responses
            .insert(device, Mutex::new(Response::new(sample_rate)));
    }

    pub fn add_background(&mut self, device: DeviceRef, background: Background) {
        self.backgrounds.insert(device, background);
    }

    /// Stamped by the controller when the run starts.
    pub fn set_start_time(&self, time: DateTime<FixedOffset>) {
        *self.start_time.lock() = Some(time);
    }

    pub fn start_time(&self) -> Option<DateTime<FixedOffset>> {
        *self.start_time.lock()
    }

    pub fn has_stimulus(&self, device: &DeviceRef) -> bool {
        self.stimuli.contains_key(device)
    }

    pub fn has_response(&self, device: &DeviceRef) -> bool {
        self.responses.contains_key(device)
    }

    pub fn response_count(&self) -> usize {
        self.responses.len()
    }

    /// Draws the next outgoing block for `device` from its stimulus.
    ///
    /// Returns `None` when the device has no stimulus in this epoch (or its
    /// stimulus is exhausted); otherwise a positive-duration chunk no
    /// longer than `requested`.
    pub fn pull_output_data(&self, device: &DeviceRef, requested: Duration) -> Option<IoData> {
        let slot = self.stimuli.get(device)?;
        slot.lock().stimulus.pull_data(requested)
    }

    /// Appends `head` to the device's response buffer.
    ///
    /// The controller's split arithmetic guarantees the buffer never grows
    /// past the epoch duration.
    pub fn append_response_data(
        &self,
        device: &DeviceRef,
        head: IoData,
        at: DateTime<FixedOffset>,
    ) {
        if let Some(response) = self.responses.get(device) {
            response.lock().append(head, at);
        } else {
            trace!(device = %device, "no response registered; data dropped");
        }
    }

    /// Cumulative response duration for `device`, if one is registered.
    pub fn response_duration(&self, device: &DeviceRef) -> Option<Duration> {
        self.responses.get(device).map(|r| r.lock().duration())
    }

    /// Logs a configuration span against the device's stimulus output.
    ///
    /// No-op once the epoch is complete or when the device has no stimulus.
    pub fn record_output_configuration(
        &self,
        device: &DeviceRef,
        output_time: DateTime<FixedOffset>,
        duration: Duration,
        nodes: Vec<NodeConfiguration>,
    ) {
        if self.is_complete() {
            return;
        }
        if let Some(slot) = self.stimuli.get(device) {
            trace!(device = %device, at = %output_time, "recording output configuration span");
            slot.lock()
                .output_spans
                .push(ConfigurationSpan::new(duration, nodes));
        }
    }

    /// True once every registered response spans the epoch duration.
    ///
    /// An indefinite epoch is never complete. Completion is monotonic:
    /// response buffers only grow.
    pub fn is_complete(&self) -> bool {
        match self.duration {
            EpochDuration::Indefinite => false,
            EpochDuration::Definite(total) => self
                .responses
                .values()
                .all(|r| r.lock().duration() >= total),
        }
    }

    pub fn stimuli(&self) -> impl Iterator<Item = (&DeviceRef, MutexGuard<'_, StimulusSlot>)> {
        self.stimuli.iter().map(|(d, slot)| (d, slot.lock()))
    }

    pub fn responses(&self) -> impl Iterator<Item = (&DeviceRef, MutexGuard<'_, Response>)> {
        self.responses.iter().map(|(d, r)| (d, r.lock()))
    }

    pub fn backgrounds(&self) -> &HashMap<DeviceRef, Background> {
        &self.backgrounds
    }
}

impl std::fmt::Debug for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Epoch")
            .field("protocol_id", &self.protocol_id)
            .field("duration", &self.duration)
            .field("stimuli", &self.stimuli.len())
            .field("responses", &self.responses.len())
            .field("backgrounds", &self.backgrounds.len())
            .finish()
    }
}
