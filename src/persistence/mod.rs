//! Hierarchical experiment persistence.
//!
//! A write-through, tree-structured store over one HDF5 file with a strict
//! containment schema: Experiment → Sources, Devices, EpochGroups → nested
//! EpochGroups, EpochBlocks → Epochs → Backgrounds, Stimuli, Responses and
//! protocol parameters. Every entity is identified by a v4 UUID and can
//! carry keywords, properties, and append-only notes. Cross-references
//! (EpochGroup ↔ Source, IO entity → Device) are hard links, never copies.
//!
//! The store makes no ACID claims: writes land in schema order and a crash
//! mid-`serialize` can leave a partial epoch in the file.

mod entity;
mod persistor;
mod records;
mod time;
mod tree;

pub use entity::{Note, PersistentEntity};
pub use persistor::H5EpochPersistor;
pub use records::{DateTimeOffsetRecord, MeasurementRecord, NoteRecord, FILE_VERSION};
pub use time::{from_ticks, offset_hours, to_ticks};
pub use tree::{
    PersistentBackground, PersistentDevice, PersistentEpoch, PersistentEpochBlock,
    PersistentEpochGroup, PersistentExperiment, PersistentResponse, PersistentSource,
    PersistentStimulus,
};
