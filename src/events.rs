//! Controller event taxonomy and observer fan-out.
//!
//! Observers subscribe with a plain callback and receive every event in
//! the order it was raised. Dispatch is serial under a single lock, so
//! callbacks are never concurrent with each other; a failing observer is
//! logged and never aborts acquisition.

use crate::device::DeviceRef;
use crate::epoch::Epoch;
use chrono::{DateTime, FixedOffset};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// What happened, with the payload observers need.
#[derive(Clone)]
pub enum ControllerEventKind {
    /// A device pushed a chunk at the controller (raised before routing,
    /// so it fires even when the chunk is discarded).
    ReceivedInputData { device: DeviceRef, duration: Duration },
    /// Input was routed into the current epoch's response buffers.
    PushedInputData { epoch: Arc<Epoch> },
    /// The persistor committed the epoch.
    SavedEpoch { epoch: Arc<Epoch> },
    /// The epoch finished (persisted if a persistor was supplied).
    CompletedEpoch { epoch: Arc<Epoch> },
    /// The epoch was abandoned; nothing was persisted.
    DiscardedEpoch { epoch: Arc<Epoch> },
    /// `next_epoch` was requested.
    NextEpochRequested,
}

impl ControllerEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReceivedInputData { .. } => "ReceivedInputData",
            Self::PushedInputData { .. } => "PushedInputData",
            Self::SavedEpoch { .. } => "SavedEpoch",
            Self::CompletedEpoch { .. } => "CompletedEpoch",
            Self::DiscardedEpoch { .. } => "DiscardedEpoch",
            Self::NextEpochRequested => "NextEpochRequested",
        }
    }
}

impl std::fmt::Debug for ControllerEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An event stamped with the controller clock at dispatch time.
#[derive(Debug, Clone)]
pub struct ControllerEvent {
    pub timestamp: DateTime<FixedOffset>,
    pub kind: ControllerEventKind,
}

type Observer = Box<dyn Fn(&ControllerEvent) -> anyhow::Result<()> + Send>;

/// Serially-dispatched observer list.
#[derive(Default)]
pub struct EventDispatcher {
    observers: Mutex<Vec<Observer>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&ControllerEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.observers.lock().push(Box::new(observer));
    }

    /// Fans the event out to every observer, in subscription order, under
    /// the dispatch lock. Observer errors are logged and swallowed.
    pub fn emit(&self, timestamp: DateTime<FixedOffset>, kind: ControllerEventKind) {
        let event = ControllerEvent { timestamp, kind };
        let observers = self.observers.lock();
        for observer in observers.iter() {
            if let Err(e) = observer(&event) {
                warn!(event = event.kind.name(), error = %e, "observer failed; continuing");
            }
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("observers", &self.observers.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn now() -> DateTime<FixedOffset> {
        "2024-01-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_dispatch_order_matches_subscription_order() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let log = log.clone();
            dispatcher.subscribe(move |_| {
                log.lock().push(tag);
                Ok(())
            });
        }

        dispatcher.emit(now(), ControllerEventKind::NextEpochRequested);
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_observer_error_does_not_stop_fanout() {
        let dispatcher = EventDispatcher::new();
        let calls = Arc::new(AtomicUsize::new(0));

        dispatcher.subscribe(|_| anyhow::bail!("observer exploded"));
        let counter = calls.clone();
        dispatcher.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.emit(now(), ControllerEventKind::NextEpochRequested);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
