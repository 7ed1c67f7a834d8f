//! Time-bounded, splittable chunks of measurement data.
//!
//! `IoData` is the unit of exchange between the controller and device
//! streams: a run of samples at a fixed rate, optionally tagged with the
//! pipeline-node configuration that was active while the data was produced.
//! Chunk boundaries carry no meaning; the controller reconciles them
//! against epoch boundaries with `split`.

use crate::measurement::Measurement;
use crate::parameter::NodeConfiguration;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A time-bounded sequence of measurements at a fixed sample rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IoData {
    samples: Vec<Measurement>,
    sample_rate: Measurement,
    node_configurations: Vec<NodeConfiguration>,
}

impl IoData {
    /// A chunk with no pipeline configuration attached.
    ///
    /// `sample_rate` is in Hz; its base-unit quantity must be positive.
    pub fn new(samples: Vec<Measurement>, sample_rate: Measurement) -> Self {
        Self::with_configuration(samples, sample_rate, Vec::new())
    }

    /// A chunk tagged with the pipeline-node configuration active while it
    /// was produced.
    pub fn with_configuration(
        samples: Vec<Measurement>,
        sample_rate: Measurement,
        node_configurations: Vec<NodeConfiguration>,
    ) -> Self {
        debug_assert!(sample_rate.quantity_in_base_unit() > 0.0);
        Self {
            samples,
            sample_rate,
            node_configurations,
        }
    }

    pub fn samples(&self) -> &[Measurement] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<Measurement> {
        self.samples
    }

    pub fn sample_rate(&self) -> &Measurement {
        &self.sample_rate
    }

    pub fn node_configurations(&self) -> &[NodeConfiguration] {
        &self.node_configurations
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    fn rate_hz(&self) -> f64 {
        self.sample_rate.quantity_in_base_unit()
    }

    /// Span covered by the chunk: `len / sample_rate`.
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.rate_hz())
    }

    /// Number of samples covered by `span` at this chunk's rate, clamped
    /// to the chunk length.
    fn samples_for(&self, span: Duration) -> usize {
        let n = (span.as_secs_f64() * self.rate_hz()).round() as usize;
        n.min(self.samples.len())
    }

    /// Splits the chunk at `at`, returning `(head, rest)`.
    ///
    /// `head.duration()` equals `at` clamped to the chunk's duration, and
    /// `rest` carries the remainder; the concatenation of the two sample
    /// sequences equals the original. Both halves keep the sample rate and
    /// the node configuration.
    pub fn split(self, at: Duration) -> (IoData, IoData) {
        let n = self.samples_for(at);
        let mut head_samples = self.samples;
        let rest_samples = head_samples.split_off(n);
        let head = IoData::with_configuration(
            head_samples,
            self.sample_rate.clone(),
            self.node_configurations.clone(),
        );
        let rest =
            IoData::with_configuration(rest_samples, self.sample_rate, self.node_configurations);
        (head, rest)
    }
}
