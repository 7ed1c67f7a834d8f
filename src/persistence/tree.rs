//! Typed views over the containment tree.
//!
//! Each wrapper adds the accessors of one entity kind on top of
//! `PersistentEntity`; containment is resolved through the file itself, so
//! handles stay cheap and never form ownership cycles. Back-references
//! (EpochGroup → Source, IO entity → Device) resolve hard links.

use crate::error::Result;
use crate::measurement::Measurement;
use crate::parameter::{ConfigurationSpan, NodeConfiguration, PropertyValue};
use chrono::{DateTime, FixedOffset};
use hdf5::Group;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::time::Duration;

use super::entity::{
    read_bag_attrs, read_str_attr, read_time_attrs, write_f64_attr, PersistentEntity,
};
use super::records::MeasurementRecord;

/// Lists the entity children of `parent`'s `container` subgroup; an absent
/// container reads as empty.
pub(crate) fn children(parent: &Group, container: &str) -> Result<Vec<PersistentEntity>> {
    let Ok(container) = parent.group(container) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for name in container.member_names()? {
        // Containers hold only entity groups; skip stray datasets.
        let Ok(child) = container.group(&name) else {
            continue;
        };
        out.push(PersistentEntity::attach(child)?);
    }
    Ok(out)
}

macro_rules! entity_wrapper {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $name(pub(crate) PersistentEntity);

        impl Deref for $name {
            type Target = PersistentEntity;

            fn deref(&self) -> &PersistentEntity {
                &self.0
            }
        }
    };
}

entity_wrapper! {
    /// Root of the containment tree.
    PersistentExperiment
}
entity_wrapper! {
    /// A stimulator or recorder, unique per experiment by
    /// `(name, manufacturer)`.
    PersistentDevice
}
entity_wrapper! {
    /// Hierarchical identifier for the physical origin of the data.
    PersistentSource
}
entity_wrapper! {
    /// A labeled logical block of epoch blocks, bound to a source.
    PersistentEpochGroup
}
entity_wrapper! {
    /// A contiguous run of epochs sharing one protocol id.
    PersistentEpochBlock
}
entity_wrapper! {
    /// One persisted trial snapshot.
    PersistentEpoch
}
entity_wrapper! {
    /// Steady-state output recorded for one device.
    PersistentBackground
}
entity_wrapper! {
    /// Recorded input data for one device.
    PersistentResponse
}
entity_wrapper! {
    /// Stimulus identity and parameters for one device (sample data is
    /// regenerable and not persisted).
    PersistentStimulus
}

impl PersistentExperiment {
    pub fn purpose(&self) -> Result<String> {
        read_str_attr(self.group(), "purpose")
    }

    pub fn devices(&self) -> Result<Vec<PersistentDevice>> {
        Ok(children(self.group(), "devices")?
            .into_iter()
            .map(PersistentDevice)
            .collect())
    }

    pub fn device(&self, name: &str, manufacturer: &str) -> Result<Option<PersistentDevice>> {
        for device in self.devices()? {
            if device.name()? == name && device.manufacturer()? == manufacturer {
                return Ok(Some(device));
            }
        }
        Ok(None)
    }

    pub fn sources(&self) -> Result<Vec<PersistentSource>> {
        Ok(children(self.group(), "sources")?
            .into_iter()
            .map(PersistentSource)
            .collect())
    }

    pub fn epoch_groups(&self) -> Result<Vec<PersistentEpochGroup>> {
        Ok(children(self.group(), "epochGroups")?
            .into_iter()
            .map(PersistentEpochGroup)
            .collect())
    }
}

impl PersistentDevice {
    pub fn name(&self) -> Result<String> {
        read_str_attr(self.group(), "name")
    }

    pub fn manufacturer(&self) -> Result<String> {
        read_str_attr(self.group(), "manufacturer")
    }
}

impl PersistentSource {
    pub fn label(&self) -> Result<String> {
        read_str_attr(self.group(), "label")
    }

    pub fn sources(&self) -> Result<Vec<PersistentSource>> {
        Ok(children(self.group(), "sources")?
            .into_iter()
            .map(PersistentSource)
            .collect())
    }

    /// Epoch groups bound to this source, resolved through the hard-linked
    /// back-references.
    pub fn epoch_groups(&self) -> Result<Vec<PersistentEpochGroup>> {
        Ok(children(self.group(), "epochGroups")?
            .into_iter()
            .map(PersistentEpochGroup)
            .collect())
    }

    /// True when this source, or any source nested below it, is still
    /// referenced by an epoch group.
    pub(crate) fn has_epoch_group_references(&self) -> Result<bool> {
        if !self.epoch_groups()?.is_empty() {
            return Ok(true);
        }
        for nested in self.sources()? {
            if nested.has_epoch_group_references()? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl PersistentEpochGroup {
    pub fn label(&self) -> Result<String> {
        read_str_attr(self.group(), "label")
    }

    /// The source this group is bound to.
    pub fn source(&self) -> Result<PersistentSource> {
        let group = self.group().group("source")?;
        Ok(PersistentSource(PersistentEntity::attach(group)?))
    }

    pub fn epoch_groups(&self) -> Result<Vec<PersistentEpochGroup>> {
        Ok(children(self.group(), "epochGroups")?
            .into_iter()
            .map(PersistentEpochGroup)
            .collect())
    }

    pub fn epoch_blocks(&self) -> Result<Vec<PersistentEpochBlock>> {
        Ok(children(self.group(), "epochBlocks")?
            .into_iter()
            .map(PersistentEpochBlock)
            .collect())
    }
}

impl PersistentEpochBlock {
    pub fn protocol_id(&self) -> Result<String> {
        read_str_attr(self.group(), "protocolID")
    }

    pub fn epochs(&self) -> Result<Vec<PersistentEpoch>> {
        Ok(children(self.group(), "epochs")?
            .into_iter()
            .map(PersistentEpoch)
            .collect())
    }
}

impl PersistentEpoch {
    pub fn protocol_id(&self) -> Result<String> {
        read_str_attr(self.group(), "protocolID")
    }

    pub fn protocol_parameters(&self) -> Result<BTreeMap<String, PropertyValue>> {
        let Ok(bag) = self.group().group("protocolParameters") else {
            return Ok(BTreeMap::new());
        };
        read_bag_attrs(&bag)
    }

    pub fn backgrounds(&self) -> Result<Vec<PersistentBackground>> {
        Ok(children(self.group(), "backgrounds")?
            .into_iter()
            .map(PersistentBackground)
            .collect())
    }

    pub fn responses(&self) -> Result<Vec<PersistentResponse>> {
        Ok(children(self.group(), "responses")?
            .into_iter()
            .map(PersistentResponse)
            .collect())
    }

    pub fn stimuli(&self) -> Result<Vec<PersistentStimulus>> {
        Ok(children(self.group(), "stimuli")?
            .into_iter()
            .map(PersistentStimulus)
            .collect())
    }
}

fn linked_device(entity: &PersistentEntity) -> Result<PersistentDevice> {
    let group = entity.group().group("device")?;
    Ok(PersistentDevice(PersistentEntity::attach(group)?))
}

fn read_rate(group: &Group) -> Result<Measurement> {
    let rate = group.attr("sampleRate")?.read_scalar::<f64>()?;
    let units = read_str_attr(group, "sampleRateUnits")?;
    Ok(Measurement::new(rate, units))
}

impl PersistentBackground {
    pub fn value(&self) -> Result<Measurement> {
        let value = self.group().attr("value")?.read_scalar::<f64>()?;
        let units = read_str_attr(self.group(), "valueUnits")?;
        Ok(Measurement::new(value, units))
    }

    pub fn sample_rate(&self) -> Result<Measurement> {
        read_rate(self.group())
    }

    pub fn device(&self) -> Result<PersistentDevice> {
        linked_device(self)
    }
}

impl PersistentResponse {
    pub fn sample_rate(&self) -> Result<Measurement> {
        read_rate(self.group())
    }

    pub fn input_time(&self) -> Result<Option<DateTime<FixedOffset>>> {
        read_time_attrs(self.group(), "inputTime")
    }

    /// The recorded samples, with units re-read from the fixed 10-byte
    /// field.
    pub fn data(&self) -> Result<Vec<Measurement>> {
        let dataset = self.group().dataset("data")?;
        Ok(dataset
            .read_raw::<MeasurementRecord>()?
            .iter()
            .map(MeasurementRecord::to_measurement)
            .collect())
    }

    pub fn configuration_spans(&self) -> Result<Vec<ConfigurationSpan>> {
        read_configuration_spans(self.group())
    }

    pub fn device(&self) -> Result<PersistentDevice> {
        linked_device(self)
    }
}

impl PersistentStimulus {
    pub fn stimulus_id(&self) -> Result<String> {
        read_str_attr(self.group(), "stimulusID")
    }

    pub fn units(&self) -> Result<String> {
        read_str_attr(self.group(), "units")
    }

    pub fn sample_rate(&self) -> Result<Measurement> {
        read_rate(self.group())
    }

    pub fn parameters(&self) -> Result<BTreeMap<String, PropertyValue>> {
        let Ok(bag) = self.group().group("parameters") else {
            return Ok(BTreeMap::new());
        };
        read_bag_attrs(&bag)
    }

    pub fn configuration_spans(&self) -> Result<Vec<ConfigurationSpan>> {
        read_configuration_spans(self.group())
    }

    pub fn device(&self) -> Result<PersistentDevice> {
        linked_device(self)
    }
}

// ---------------------------------------------------------------------
// Configuration spans
// ---------------------------------------------------------------------

/// Writes the ordered span list under a `dataConfigurationSpans` subgroup:
/// `span_<n>` groups carrying `index`, `startTimeSeconds` (cumulative) and
/// `timeSpanSeconds`, with one subgroup per pipeline node.
pub(crate) fn write_configuration_spans(
    parent: &Group,
    spans: &[ConfigurationSpan],
) -> Result<()> {
    let container = parent.create_group("dataConfigurationSpans")?;
    let mut start_seconds = 0.0f64;
    for (index, span) in spans.iter().enumerate() {
        let group = container.create_group(&format!("span_{index}"))?;
        group
            .new_attr::<u32>()
            .create("index")?
            .write_scalar(&(index as u32))?;
        write_f64_attr(&group, "startTimeSeconds", start_seconds)?;
        write_f64_attr(&group, "timeSpanSeconds", span.duration.as_secs_f64())?;
        for node in &span.nodes {
            let node_group = group.create_group(&node.name)?;
            for (key, value) in &node.parameters {
                super::entity::write_property_attr(&node_group, key, value)?;
            }
        }
        start_seconds += span.duration.as_secs_f64();
    }
    Ok(())
}

/// Reads spans back in ascending `index` order; an absent container reads
/// as empty.
pub(crate) fn read_configuration_spans(parent: &Group) -> Result<Vec<ConfigurationSpan>> {
    let Ok(container) = parent.group("dataConfigurationSpans") else {
        return Ok(Vec::new());
    };
    let mut spans = Vec::new();
    for name in container.member_names()? {
        let group = container.group(&name)?;
        let index = group.attr("index")?.read_scalar::<u32>()?;
        let seconds = group.attr("timeSpanSeconds")?.read_scalar::<f64>()?;
        let mut nodes = Vec::new();
        for node_name in group.member_names()? {
            let node_group = group.group(&node_name)?;
            nodes.push(NodeConfiguration {
                name: node_name,
                parameters: read_bag_attrs(&node_group)?,
            });
        }
        spans.push((
            index,
            ConfigurationSpan::new(Duration::from_secs_f64(seconds), nodes),
        ));
    }
    spans.sort_by_key(|(index, _)| *index);
    Ok(spans.into_iter().map(|(_, span)| span).collect())
}
