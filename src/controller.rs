//! The epoch runtime.
//!
//! The controller coordinates one epoch at a time between the acquisition
//! hardware and the current `Epoch`: it supplies stimulus data on demand
//! (`pull_output_data`), routes incoming device samples into the correct
//! response buffers with exact temporal boundaries (`push_input_data`),
//! detects completion, and hands finished epochs to the persistor on a
//! dedicated single-worker queue so blocking file I/O never stalls
//! acquisition.
//!
//! # Threading
//!
//! `run_epoch` blocks its caller until the DAQ stops. The DAQ drives
//! `pull_output_data` and `push_input_data` from its own input/output
//! threads. Each device has its own input lane behind its own lock, so
//! different devices never contend; the current epoch swaps atomically at
//! run boundaries.

use crate::clock::Clock;
use crate::device::{DeviceRef, ExternalDevice};
use crate::epoch::Epoch;
use crate::error::{DaqError, Result};
use crate::events::{ControllerEvent, ControllerEventKind, EventDispatcher};
use crate::io_data::IoData;
use crate::parameter::NodeConfiguration;
use crate::persistence::H5EpochPersistor;
use crate::validation::validate_epoch;
use crate::worker::{SerialTaskQueue, TaskHandle};
use chrono::{DateTime, FixedOffset};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// The seam to concrete DAQ hardware drivers.
///
/// `start` runs the acquisition process on the calling thread until the
/// hardware stops; a clean stop returns `Ok` and an exceptional stop
/// returns the driver error. `request_stop` is the cooperative stop
/// signal and may be called from any thread.
pub trait DaqController: Send + Sync {
    fn start(&self) -> anyhow::Result<()>;

    fn request_stop(&self);
}

/// Per-device holding area for incoming data that has not yet been routed
/// into the current epoch.
#[derive(Default)]
struct InputLane {
    /// Leftover head of a chunk that did not fit the previous epoch
    /// iteration; consumed before the queue.
    fragment: Option<IoData>,
    queue: VecDeque<IoData>,
}

/// Deterministic, event-driven pull/push coordinator for epochs.
pub struct Controller {
    clock: Arc<dyn Clock>,
    daq: Arc<dyn DaqController>,
    devices: RwLock<Vec<Arc<dyn ExternalDevice>>>,
    current_epoch: RwLock<Option<Arc<Epoch>>>,
    epoch_queue: Mutex<VecDeque<Arc<Epoch>>>,
    input_lanes: Mutex<HashMap<DeviceRef, Arc<Mutex<InputLane>>>>,
    events: EventDispatcher,
    persistence: SerialTaskQueue,
    active_persistor: Mutex<Option<Arc<H5EpochPersistor>>>,
    pending_saves: Mutex<Vec<TaskHandle>>,
    /// Set once the running epoch's persistence task has been submitted;
    /// re-entrant completion observations must not double-submit.
    epoch_persisted: AtomicBool,
}

impl Controller {
    pub fn new(daq: Arc<dyn DaqController>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            daq,
            devices: RwLock::new(Vec::new()),
            current_epoch: RwLock::new(None),
            epoch_queue: Mutex::new(VecDeque::new()),
            input_lanes: Mutex::new(HashMap::new()),
            events: EventDispatcher::new(),
            persistence: SerialTaskQueue::new("epoch-persistence"),
            active_persistor: Mutex::new(None),
            pending_saves: Mutex::new(Vec::new()),
            epoch_persisted: AtomicBool::new(true),
        })
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Subscribes an observer to the controller event stream.
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&ControllerEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.events.subscribe(observer);
    }

    /// Registers a device. Fails on a duplicate name; binds the device's
    /// back-pointer to this controller. Devices are never implicitly
    /// removed.
    pub fn add_device(self: &Arc<Self>, device: Arc<dyn ExternalDevice>) -> Result<()> {
        let mut devices = self.devices.write();
        if devices.iter().any(|d| d.name() == device.name()) {
            return Err(DaqError::DuplicateDevice {
                name: device.name().to_string(),
            });
        }
        device.bind_controller(self);
        debug!(device = device.name(), "device registered");
        devices.push(device);
        Ok(())
    }

    pub fn devices(&self) -> Vec<Arc<dyn ExternalDevice>> {
        self.devices.read().clone()
    }

    pub fn device(&self, name: &str) -> Option<Arc<dyn ExternalDevice>> {
        self.devices.read().iter().find(|d| d.name() == name).cloned()
    }

    /// Validates the controller wire-up.
    ///
    /// Each device whose back-pointer has drifted is rebound to this
    /// controller (self-heal), then validated recursively.
    pub fn validate(self: &Arc<Self>) -> Result<()> {
        let devices = self.devices.read().clone();
        for device in &devices {
            let bound = device
                .controller()
                .is_some_and(|c| Arc::ptr_eq(&c, self));
            if !bound {
                debug!(
                    device = device.name(),
                    "rebinding drifted controller back-pointer"
                );
                device.bind_controller(self);
            }
            device.validate().map_err(DaqError::Validation)?;
        }
        Ok(())
    }

    /// Shape-validates the epoch and appends it to the queue.
    pub fn enqueue_epoch(&self, epoch: Arc<Epoch>) -> Result<()> {
        validate_epoch(&epoch).map_err(DaqError::Validation)?;
        self.epoch_queue.lock().push_back(epoch);
        Ok(())
    }

    pub fn current_epoch(&self) -> Option<Arc<Epoch>> {
        self.current_epoch.read().clone()
    }

    /// Supplies the next outgoing block for `device`.
    ///
    /// Returns `None` with no current epoch; otherwise delegates to the
    /// epoch, which returns a positive-duration chunk no longer than
    /// `requested`.
    pub fn pull_output_data(&self, device: &DeviceRef, requested: Duration) -> Option<IoData> {
        let epoch = self.current_epoch()?;
        epoch.pull_output_data(device, requested)
    }

    /// Logs a span of emitted stimulus configuration against the current
    /// epoch. No-op without a current epoch or once it is complete.
    pub fn did_output_data(
        &self,
        device: &DeviceRef,
        output_time: DateTime<FixedOffset>,
        duration: Duration,
        nodes: Vec<NodeConfiguration>,
    ) {
        if let Some(epoch) = self.current_epoch() {
            epoch.record_output_configuration(device, output_time, duration, nodes);
        }
    }

    /// Accepts a chunk of incoming data from a device.
    ///
    /// Emits `ReceivedInputData`, then routes the chunk into the current
    /// epoch's response buffer for the device under the device's lane
    /// lock. Chunks for devices with no registered response are discarded
    /// after the event; leftover data past the epoch boundary is retained
    /// as the lane fragment or left queued.
    pub fn push_input_data(self: &Arc<Self>, device: &DeviceRef, data: IoData) {
        self.events.emit(
            self.clock.now(),
            ControllerEventKind::ReceivedInputData {
                device: device.clone(),
                duration: data.duration(),
            },
        );

        let Some(epoch) = self.current_epoch() else {
            trace!(device = %device, "no current epoch; chunk discarded");
            return;
        };
        if !epoch.has_response(device) {
            trace!(device = %device, "no response registered; chunk discarded");
            return;
        }
        // Shape validation bars responses on indefinite epochs.
        let Some(total) = epoch.duration().as_duration() else {
            return;
        };

        let lane = self.lane(device);
        {
            let mut lane = lane.lock();
            lane.queue.push_back(data);
            let now = self.clock.now();

            if let Some(fragment) = lane.fragment.take() {
                let filled = epoch.response_duration(device).unwrap_or_default();
                let (head, rest) = fragment.split(total.saturating_sub(filled));
                if !head.is_empty() {
                    epoch.append_response_data(device, head, now);
                }
                if !rest.is_empty() {
                    lane.fragment = Some(rest);
                }
            }

            loop {
                let filled = epoch.response_duration(device).unwrap_or_default();
                if filled >= total {
                    break;
                }
                let Some(chunk) = lane.queue.pop_front() else {
                    break;
                };
                // The fragment is always drained before the queue; a
                // leftover here is programmer error.
                assert!(
                    lane.fragment.is_none(),
                    "input lane fragment must be drained before the queue"
                );
                let (head, rest) = chunk.split(total - filled);
                if !head.is_empty() {
                    epoch.append_response_data(device, head, now);
                }
                if !rest.is_empty() {
                    lane.fragment = Some(rest);
                }
            }
        }

        self.events.emit(
            self.clock.now(),
            ControllerEventKind::PushedInputData {
                epoch: epoch.clone(),
            },
        );
        self.complete_if_ready(&epoch);
    }

    /// First completion observation per run: stop the DAQ and submit the
    /// persistence task. The atomic flag keeps re-entrant observations
    /// from double-submitting.
    fn complete_if_ready(self: &Arc<Self>, epoch: &Arc<Epoch>) {
        if !epoch.is_complete() {
            return;
        }
        if self.epoch_persisted.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            protocol = epoch.protocol_id(),
            "epoch complete; requesting DAQ stop"
        );
        self.daq.request_stop();

        let persistor = self.active_persistor.lock().clone();
        let controller = Arc::downgrade(self);
        let epoch = epoch.clone();
        let handle = self.persistence.submit(move || {
            let Some(controller) = controller.upgrade() else {
                return Ok(());
            };
            if let Some(persistor) = persistor {
                persistor.serialize(&epoch)?;
                controller.events.emit(
                    controller.clock.now(),
                    ControllerEventKind::SavedEpoch {
                        epoch: epoch.clone(),
                    },
                );
            }
            controller.events.emit(
                controller.clock.now(),
                ControllerEventKind::CompletedEpoch { epoch },
            );
            Ok(())
        });
        self.pending_saves.lock().push(handle);
    }

    /// Runs one epoch to completion (or discard).
    ///
    /// Blocking entry point: validates, installs the epoch, stamps its
    /// start time from the controller clock, starts the DAQ, and returns
    /// only after the DAQ stops and any pending persistence work settled.
    /// In-flight input left in the lanes is dropped at teardown.
    ///
    /// A DAQ exceptional stop discards the epoch and surfaces as
    /// `ExceptionalStop`; persistence failures surface as a `Persistence`
    /// aggregate.
    pub fn run_epoch(
        self: &Arc<Self>,
        epoch: Arc<Epoch>,
        persistor: Option<Arc<H5EpochPersistor>>,
    ) -> Result<()> {
        self.validate()?;
        validate_epoch(&epoch).map_err(DaqError::Validation)?;

        *self.active_persistor.lock() = persistor;
        self.epoch_persisted.store(false, Ordering::SeqCst);
        self.clear_input_lanes();
        epoch.set_start_time(self.clock.now());
        *self.current_epoch.write() = Some(epoch.clone());
        info!(protocol = epoch.protocol_id(), "starting epoch run");

        let daq_result = self.daq.start();

        // Claim the completion flag so a straggler push thread can no
        // longer submit persistence for this run, then drop in-flight
        // input.
        let completed = self.epoch_persisted.swap(true, Ordering::SeqCst);
        self.clear_input_lanes();
        {
            let mut current = self.current_epoch.write();
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &epoch)) {
                *current = None;
            }
        }

        let handles: Vec<TaskHandle> = std::mem::take(&mut *self.pending_saves.lock());
        let mut save_errors = Vec::new();
        for handle in handles {
            if let Err(e) = handle.wait() {
                save_errors.push(e);
            }
        }
        *self.active_persistor.lock() = None;

        if !completed {
            self.events.emit(
                self.clock.now(),
                ControllerEventKind::DiscardedEpoch {
                    epoch: epoch.clone(),
                },
            );
        }

        match daq_result {
            Err(e) => {
                warn!(
                    protocol = epoch.protocol_id(),
                    error = %e,
                    "DAQ stopped exceptionally; epoch discarded"
                );
                Err(DaqError::ExceptionalStop(format!("{e:#}")))
            }
            Ok(()) => {
                if save_errors.is_empty() {
                    Ok(())
                } else {
                    Err(DaqError::Persistence(save_errors))
                }
            }
        }
    }

    /// Abandons the current epoch in favor of the next queued one.
    ///
    /// Fails with an empty queue. Emits `NextEpochRequested`, installs the
    /// popped epoch as current, and requests DAQ stop; the abandoned run
    /// emits `DiscardedEpoch` on its way out of `run_epoch`, and the
    /// caller restarts acquisition for the new current epoch.
    pub fn next_epoch(&self) -> Result<()> {
        let next = self
            .epoch_queue
            .lock()
            .pop_front()
            .ok_or(DaqError::EmptyEpochQueue)?;
        info!(protocol = next.protocol_id(), "advancing to next queued epoch");
        self.events
            .emit(self.clock.now(), ControllerEventKind::NextEpochRequested);
        *self.current_epoch.write() = Some(next);
        self.daq.request_stop();
        Ok(())
    }

    /// Abandons the current epoch and stops acquisition.
    pub fn cancel_epoch(&self) {
        debug!("epoch cancellation requested");
        self.daq.request_stop();
    }

    /// Opens (or creates) the persistor selected by the file suffix and
    /// begins an epoch group in it, bound to the source labeled
    /// `source_label` (created under the experiment if absent).
    ///
    /// Only the hierarchical `.h5`/`.hdf5` backend lives in this crate;
    /// other suffixes belong to external persistors.
    pub fn begin_epoch_group(
        &self,
        path: &Path,
        purpose: &str,
        label: &str,
        source_label: &str,
    ) -> Result<Arc<H5EpochPersistor>> {
        let suffix = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let persistor = match suffix {
            "h5" | "hdf5" => {
                if path.exists() {
                    H5EpochPersistor::open(path)?
                } else {
                    H5EpochPersistor::create(path, purpose, self.clock.now())?
                }
            }
            other => {
                return Err(DaqError::State(format!(
                    "no persistor backend for '.{other}' files"
                )))
            }
        };

        let source = match persistor
            .experiment()
            .sources()?
            .into_iter()
            .find(|s| s.label().map(|l| l == source_label).unwrap_or(false))
        {
            Some(source) => source,
            None => persistor.add_source(source_label, None)?,
        };
        persistor.begin_epoch_group(label, &source, self.clock.now())?;
        Ok(Arc::new(persistor))
    }

    /// Ends the persistor's open epoch group, stamped with the controller
    /// clock.
    pub fn end_epoch_group(&self, persistor: &H5EpochPersistor) -> Result<()> {
        persistor.end_epoch_group(self.clock.now())
    }

    fn lane(&self, device: &DeviceRef) -> Arc<Mutex<InputLane>> {
        self.input_lanes
            .lock()
            .entry(device.clone())
            .or_default()
            .clone()
    }

    fn clear_input_lanes(&self) {
        for lane in self.input_lanes.lock().values() {
            let mut lane = lane.lock();
            lane.fragment = None;
            lane.queue.clear();
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("devices", &self.devices.read().len())
            .field("queued_epochs", &self.epoch_queue.lock().len())
            .field("running", &self.current_epoch.read().is_some())
            .finish()
    }
}
