//! The hierarchical epoch persistor session.
//!
//! One session owns one HDF5 file and tracks the open traversal state: a
//! LIFO stack of open epoch groups and at most one open epoch block.
//! Completed epochs are serialized into the open block; deletion refuses
//! anything the open state still points at. All writes go straight to the
//! file in schema order.

use crate::device::DeviceRef;
use crate::epoch::Epoch;
use crate::error::{DaqError, Result};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset};
use hdf5::File;
use parking_lot::Mutex;
use std::path::Path;
use tracing::{debug, info};

use super::entity::{write_bag, write_f64_attr, write_str_attr, write_time_attrs, PersistentEntity};
use super::records::{MeasurementRecord, FILE_VERSION};
use super::tree::{
    write_configuration_spans, PersistentDevice, PersistentEpoch, PersistentEpochBlock,
    PersistentEpochGroup, PersistentExperiment, PersistentSource,
};

struct Session {
    file: File,
    experiment: PersistentExperiment,
    open_groups: Vec<PersistentEpochGroup>,
    open_block: Option<PersistentEpochBlock>,
}

/// Durable session over one experiment file.
pub struct H5EpochPersistor {
    inner: Mutex<Session>,
}

impl H5EpochPersistor {
    /// Creates a new experiment file.
    ///
    /// Fails if `path` already exists. Writes the file-level `version`
    /// attribute and inserts the root experiment group.
    pub fn create(
        path: &Path,
        purpose: &str,
        start_time: DateTime<FixedOffset>,
    ) -> Result<Self> {
        if path.exists() {
            return Err(DaqError::FileAlreadyExists(path.to_path_buf()));
        }
        let file = File::create(path)?;
        file.new_attr::<u32>()
            .create("version")?
            .write_scalar(&FILE_VERSION)?;

        let entity = PersistentEntity::create(&file, "experiment")?;
        write_str_attr(entity.group(), "purpose", purpose)?;
        write_time_attrs(entity.group(), "startTime", &start_time)?;
        for container in ["devices", "sources", "epochGroups"] {
            entity.group().create_group(container)?;
        }
        info!(path = %path.display(), "created experiment file");

        Ok(Self {
            inner: Mutex::new(Session {
                file,
                experiment: PersistentExperiment(entity),
                open_groups: Vec::new(),
                open_block: None,
            }),
        })
    }

    /// Opens an existing experiment file.
    ///
    /// Fails when the file is missing, lacks the `version` attribute,
    /// carries a mismatched version, or does not have exactly one
    /// top-level group.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DaqError::FileNotFound(path.to_path_buf()));
        }
        let file = File::open_rw(path)?;

        let Ok(version_attr) = file.attr("version") else {
            return Err(DaqError::State(format!(
                "{} has no version attribute",
                path.display()
            )));
        };
        let found = version_attr.read_scalar::<u32>()?;
        if found != FILE_VERSION {
            return Err(DaqError::VersionMismatch {
                found,
                expected: FILE_VERSION,
            });
        }

        let mut roots = file.member_names()?;
        if roots.len() != 1 {
            return Err(DaqError::State(format!(
                "expected exactly one top-level group, found {}",
                roots.len()
            )));
        }
        let root = file.group(&roots.remove(0))?;
        let experiment = PersistentExperiment(PersistentEntity::attach(root)?);
        debug!(path = %path.display(), "opened experiment file");

        Ok(Self {
            inner: Mutex::new(Session {
                file,
                experiment,
                open_groups: Vec::new(),
                open_block: None,
            }),
        })
    }

    pub fn experiment(&self) -> PersistentExperiment {
        self.inner.lock().experiment.clone()
    }

    /// Top of the open-group stack, if any.
    pub fn open_epoch_group(&self) -> Option<PersistentEpochGroup> {
        self.inner.lock().open_groups.last().cloned()
    }

    pub fn open_epoch_block(&self) -> Option<PersistentEpochBlock> {
        self.inner.lock().open_block.clone()
    }

    /// Adds a device to the experiment; `(name, manufacturer)` must be
    /// unique.
    pub fn add_device(&self, name: &str, manufacturer: &str) -> Result<PersistentDevice> {
        let session = self.inner.lock();
        if session.experiment.device(name, manufacturer)?.is_some() {
            return Err(DaqError::DuplicatePersistedDevice {
                name: name.to_string(),
                manufacturer: manufacturer.to_string(),
            });
        }
        Self::create_device(&session.experiment, name, manufacturer)
    }

    fn create_device(
        experiment: &PersistentExperiment,
        name: &str,
        manufacturer: &str,
    ) -> Result<PersistentDevice> {
        let container = experiment.group().group("devices")?;
        let entity = PersistentEntity::create(&container, name)?;
        write_str_attr(entity.group(), "name", name)?;
        write_str_attr(entity.group(), "manufacturer", manufacturer)?;
        Ok(PersistentDevice(entity))
    }

    /// Locates a device by identity, creating it if the experiment has not
    /// seen it yet.
    fn intern_device(
        experiment: &PersistentExperiment,
        device: &DeviceRef,
    ) -> Result<PersistentDevice> {
        match experiment.device(&device.name, &device.manufacturer)? {
            Some(existing) => Ok(existing),
            None => {
                debug!(device = %device, "interning device observed in epoch");
                Self::create_device(experiment, &device.name, &device.manufacturer)
            }
        }
    }

    /// Inserts a source under `parent`, or under the experiment when
    /// `parent` is `None`.
    pub fn add_source(
        &self,
        label: &str,
        parent: Option<&PersistentSource>,
    ) -> Result<PersistentSource> {
        let session = self.inner.lock();
        let container = match parent {
            Some(source) => source.group().group("sources")?,
            None => session.experiment.group().group("sources")?,
        };
        let entity = PersistentEntity::create(&container, label)?;
        write_str_attr(entity.group(), "label", label)?;
        for child in ["sources", "epochGroups"] {
            entity.group().create_group(child)?;
        }
        Ok(PersistentSource(entity))
    }

    /// Begins an epoch group under the top of the open stack (or the
    /// experiment), pushes it, and hard-links it back from the source's
    /// `epochGroups`.
    pub fn begin_epoch_group(
        &self,
        label: &str,
        source: &PersistentSource,
        start_time: DateTime<FixedOffset>,
    ) -> Result<PersistentEpochGroup> {
        let mut session = self.inner.lock();
        let parent = match session.open_groups.last() {
            Some(group) => group.group().clone(),
            None => session.experiment.group().clone(),
        };
        let container = parent.group("epochGroups")?;
        let entity = PersistentEntity::create(&container, label)?;
        write_str_attr(entity.group(), "label", label)?;
        write_time_attrs(entity.group(), "startTime", &start_time)?;
        for child in ["epochGroups", "epochBlocks"] {
            entity.group().create_group(child)?;
        }

        session
            .file
            .link_hard(&source.path(), &format!("{}/source", entity.path()))?;
        session.file.link_hard(
            &entity.path(),
            &format!("{}/epochGroups/{}", source.path(), entity.link_name()),
        )?;

        let group = PersistentEpochGroup(entity);
        session.open_groups.push(group.clone());
        info!(label, "began epoch group");
        Ok(group)
    }

    /// Stamps the top group's end time and pops it. Fails with no open
    /// group or while a block is still open.
    pub fn end_epoch_group(&self, end_time: DateTime<FixedOffset>) -> Result<()> {
        let mut session = self.inner.lock();
        if session.open_block.is_some() {
            return Err(DaqError::State(
                "an epoch block is still open".to_string(),
            ));
        }
        let Some(group) = session.open_groups.pop() else {
            return Err(DaqError::State("no open epoch group".to_string()));
        };
        group.set_end_time(end_time)?;
        info!(label = %group.label()?, "ended epoch group");
        Ok(())
    }

    /// Begins an epoch block in the open group. Fails with no open group
    /// or when a block is already open.
    pub fn begin_epoch_block(
        &self,
        protocol_id: &str,
        start_time: DateTime<FixedOffset>,
    ) -> Result<PersistentEpochBlock> {
        let mut session = self.inner.lock();
        if session.open_block.is_some() {
            return Err(DaqError::State(
                "an epoch block is already open".to_string(),
            ));
        }
        let Some(group) = session.open_groups.last() else {
            return Err(DaqError::State("no open epoch group".to_string()));
        };
        let container = group.group().group("epochBlocks")?;
        let entity = PersistentEntity::create(&container, protocol_id)?;
        write_str_attr(entity.group(), "protocolID", protocol_id)?;
        write_time_attrs(entity.group(), "startTime", &start_time)?;
        entity.group().create_group("epochs")?;

        let block = PersistentEpochBlock(entity);
        session.open_block = Some(block.clone());
        info!(protocol = protocol_id, "began epoch block");
        Ok(block)
    }

    /// Stamps the open block's end time and closes it.
    pub fn end_epoch_block(&self, end_time: DateTime<FixedOffset>) -> Result<()> {
        let mut session = self.inner.lock();
        let Some(block) = session.open_block.take() else {
            return Err(DaqError::State("no open epoch block".to_string()));
        };
        block.set_end_time(end_time)?;
        info!(protocol = %block.protocol_id()?, "ended epoch block");
        Ok(())
    }

    /// Commits a completed epoch into the open block.
    ///
    /// Fails with no open block or when the epoch's protocol id does not
    /// match the block's. Devices observed in the epoch are interned into
    /// the experiment by `(name, manufacturer)`.
    pub fn serialize(&self, epoch: &Epoch) -> Result<PersistentEpoch> {
        let session = self.inner.lock();
        let Some(block) = session.open_block.as_ref() else {
            return Err(DaqError::State("no open epoch block".to_string()));
        };
        let block_protocol = block.protocol_id()?;
        if block_protocol != epoch.protocol_id() {
            return Err(DaqError::State(format!(
                "epoch protocol '{}' does not match open block '{}'",
                epoch.protocol_id(),
                block_protocol
            )));
        }

        let container = block.group().group("epochs")?;
        let entity = PersistentEntity::create(&container, "epoch")?;
        write_str_attr(entity.group(), "protocolID", epoch.protocol_id())?;

        let start_time = epoch
            .start_time()
            .ok_or_else(|| DaqError::State("epoch has no start time".to_string()))?;
        write_time_attrs(entity.group(), "startTime", &start_time)?;
        if let Some(duration) = epoch.duration().as_duration() {
            let end_time = start_time
                + ChronoDuration::from_std(duration)
                    .map_err(|e| DaqError::State(format!("epoch duration out of range: {e}")))?;
            write_time_attrs(entity.group(), "endTime", &end_time)?;
        }

        write_bag(
            entity.group(),
            "protocolParameters",
            epoch.protocol_parameters(),
        )?;
        if !epoch.keywords().is_empty() {
            entity.write_keywords(epoch.keywords())?;
        }

        let backgrounds = entity.group().create_group("backgrounds")?;
        for (device_ref, background) in epoch.backgrounds() {
            let device = Self::intern_device(&session.experiment, device_ref)?;
            let child = PersistentEntity::create(&backgrounds, &device_ref.name)?;
            write_f64_attr(child.group(), "value", background.value().quantity())?;
            write_str_attr(child.group(), "valueUnits", background.value().display_unit())?;
            write_rate_attrs(&child, background.sample_rate())?;
            link_device(&session.file, &child, &device)?;
        }

        let stimuli = entity.group().create_group("stimuli")?;
        for (device_ref, slot) in epoch.stimuli() {
            let device = Self::intern_device(&session.experiment, device_ref)?;
            let stimulus = slot.stimulus();
            let child = PersistentEntity::create(&stimuli, &device_ref.name)?;
            write_str_attr(child.group(), "stimulusID", stimulus.stimulus_id())?;
            write_str_attr(child.group(), "units", stimulus.units())?;
            write_rate_attrs(&child, stimulus.sample_rate())?;
            write_bag(child.group(), "parameters", stimulus.parameters())?;
            write_configuration_spans(child.group(), slot.output_spans())?;
            link_device(&session.file, &child, &device)?;
        }

        let responses = entity.group().create_group("responses")?;
        for (device_ref, response) in epoch.responses() {
            let device = Self::intern_device(&session.experiment, device_ref)?;
            let child = PersistentEntity::create(&responses, &device_ref.name)?;
            write_rate_attrs(&child, response.sample_rate())?;
            if let Some(input_time) = response.input_time() {
                write_time_attrs(child.group(), "inputTime", &input_time)?;
            }
            let records = response
                .samples()
                .iter()
                .map(MeasurementRecord::from_measurement)
                .collect::<Result<Vec<_>>>()?;
            child
                .group()
                .new_dataset::<MeasurementRecord>()
                .shape(records.len())
                .create("data")?
                .write(&records)?;
            write_configuration_spans(child.group(), response.configuration_spans())?;
            link_device(&session.file, &child, &device)?;
        }

        info!(protocol = epoch.protocol_id(), "persisted epoch");
        Ok(PersistentEpoch(entity))
    }

    /// Deletes an entity from the tree.
    ///
    /// Refuses the experiment, any epoch group on the open stack, and the
    /// open block. A source is only deletable once no epoch group
    /// references it (recursively through nested sources). Deleting an
    /// epoch group removes its source back-link first.
    pub fn delete(&self, entity: &PersistentEntity) -> Result<()> {
        let session = self.inner.lock();
        if entity.uuid() == session.experiment.uuid() {
            return Err(DaqError::DeleteRefused(
                "the experiment cannot be deleted".to_string(),
            ));
        }
        if session.open_groups.iter().any(|g| g.uuid() == entity.uuid()) {
            return Err(DaqError::DeleteRefused(
                "the epoch group is on the open stack".to_string(),
            ));
        }
        if session
            .open_block
            .as_ref()
            .is_some_and(|b| b.uuid() == entity.uuid())
        {
            return Err(DaqError::DeleteRefused(
                "the epoch block is open".to_string(),
            ));
        }

        let path = entity.path();
        let container = path
            .rsplit('/')
            .nth(1)
            .unwrap_or_default()
            .to_string();
        match container.as_str() {
            "sources" => {
                let source = PersistentSource(entity.clone());
                if source.has_epoch_group_references()? {
                    return Err(DaqError::DeleteRefused(format!(
                        "source '{}' is still referenced by epoch groups",
                        source.label()?
                    )));
                }
            }
            "epochGroups" => {
                let group = PersistentEpochGroup(entity.clone());
                if let Ok(source) = group.source() {
                    let back_link =
                        format!("{}/epochGroups/{}", source.path(), entity.link_name());
                    let _ = session.file.unlink(&back_link);
                }
            }
            _ => {}
        }

        debug!(path = %path, "deleting entity");
        session.file.unlink(&path)?;
        Ok(())
    }

    /// Ends any open block, unwinds the open-group stack, stamps the
    /// experiment's end time. The file handle is released when the
    /// persistor is dropped.
    pub fn close(&self, end_time: DateTime<FixedOffset>) -> Result<()> {
        let mut session = self.inner.lock();
        if let Some(block) = session.open_block.take() {
            block.set_end_time(end_time)?;
        }
        while let Some(group) = session.open_groups.pop() {
            group.set_end_time(end_time)?;
        }
        session.experiment.set_end_time(end_time)?;
        info!("closed experiment session");
        Ok(())
    }
}

impl std::fmt::Debug for H5EpochPersistor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let session = self.inner.lock();
        f.debug_struct("H5EpochPersistor")
            .field("open_groups", &session.open_groups.len())
            .field("open_block", &session.open_block.is_some())
            .finish()
    }
}

fn write_rate_attrs(entity: &PersistentEntity, rate: &crate::measurement::Measurement) -> Result<()> {
    write_f64_attr(entity.group(), "sampleRate", rate.quantity())?;
    write_str_attr(entity.group(), "sampleRateUnits", rate.display_unit())?;
    Ok(())
}

fn link_device(file: &File, entity: &PersistentEntity, device: &PersistentDevice) -> Result<()> {
    file.link_hard(&device.path(), &format!("{}/device", entity.path()))?;
    Ok(())
}
