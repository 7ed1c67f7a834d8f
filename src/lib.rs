//! # Epoch DAQ Core Library
//!
//! This crate is the core of an epoch-oriented data-acquisition runtime: a
//! real-time controller that coordinates a bidirectional pipeline between
//! a driving host and external laboratory devices, and a hierarchical
//! persistor that commits completed trials (epochs) to a structured HDF5
//! file. Concrete hardware drivers, stimulus generation, and configuration
//! parsing live outside this crate and plug in through the `DaqController`,
//! `Stimulus`, and `ExternalDevice` seams.
//!
//! ## Crate Structure
//!
//! - **`clock`**: The injectable `Clock` trait with system and manual
//!   implementations. The controller never reads the system clock directly.
//! - **`controller`**: The epoch runtime. Pulls stimulus data on demand,
//!   routes incoming samples into per-device response buffers with exact
//!   temporal boundaries, detects completion, and dispatches persistence
//!   on a serial worker.
//! - **`device`**: The `ExternalDevice` seam and the `DeviceRef` identity
//!   key used throughout the epoch maps and the persistor.
//! - **`epoch`**: Per-trial containers: stimuli, response buffers,
//!   backgrounds, protocol parameters, and completion tracking.
//! - **`error`**: The `DaqError` enum consolidating shape, state, and
//!   runtime failures.
//! - **`events`**: The controller event taxonomy and the serially
//!   dispatched observer registry.
//! - **`io_data`**: Time-bounded, splittable measurement chunks.
//! - **`measurement`**: Unit-tagged scalars.
//! - **`parameter`**: Scalar parameter values, pipeline-node configuration
//!   bags, and configuration spans.
//! - **`persistence`**: The hierarchical experiment store over HDF5:
//!   entity tree, fixed record layouts, and the session persistor.
//! - **`validation`**: Epoch shape checks run before anything is enqueued.
//! - **`worker`**: The single-consumer serial task queue backing epoch
//!   persistence.

pub mod clock;
pub mod controller;
pub mod device;
pub mod epoch;
pub mod error;
pub mod events;
pub mod io_data;
pub mod measurement;
pub mod parameter;
pub mod persistence;
pub mod validation;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{Controller, DaqController};
pub use device::{DeviceRef, ExternalDevice, GenericDevice};
pub use epoch::{Background, Epoch, EpochDuration, PreloadedStimulus, Response, Stimulus};
pub use error::{DaqError, Result};
pub use events::{ControllerEvent, ControllerEventKind};
pub use io_data::IoData;
pub use measurement::Measurement;
pub use parameter::{ConfigurationSpan, NodeConfiguration, PropertyValue};
pub use persistence::H5EpochPersistor;
