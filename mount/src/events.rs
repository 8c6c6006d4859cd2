//! Fan-out of telemetry events to registered subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use wire::messages::{PositionReport, StatusReport};

/// Events pushed by the firmware.
#[derive(Debug, Clone, PartialEq)]
pub enum MountEvent {
    /// Encoder positions, arcseconds per axis.
    Position(PositionReport),
    /// Periodic telemetry.
    Status(StatusReport),
    /// The firmware lost its position reference; a re-alignment is needed
    /// before celestial tracking can be trusted again.
    ReferenceLost,
}

/// Handle for deregistering a subscriber.
pub type CallbackId = u64;

/// Subscriber callback. Invoked on the receiver thread in wire order, so
/// keep it quick; hand heavy work to another thread.
pub type EventCallback = Arc<dyn Fn(&MountEvent) + Send + Sync>;

#[derive(Default)]
pub(crate) struct EventBus {
    inner: Mutex<BusInner>,
}

#[derive(Default)]
struct BusInner {
    next_id: CallbackId,
    callbacks: HashMap<CallbackId, EventCallback>,
}

impl EventBus {
    pub(crate) fn subscribe(&self, callback: EventCallback) -> CallbackId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.callbacks.insert(id, callback);
        id
    }

    pub(crate) fn unsubscribe(&self, id: CallbackId) -> bool {
        self.inner.lock().unwrap().callbacks.remove(&id).is_some()
    }

    /// Deliver `event` to every subscriber. Callbacks run without the
    /// registry lock held, so a subscriber may (de)register from inside one.
    pub(crate) fn emit(&self, event: &MountEvent) {
        let snapshot: Vec<EventCallback> = {
            let inner = self.inner.lock().unwrap();
            inner.callbacks.values().cloned().collect()
        };
        for callback in snapshot {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_subscribe_emit_unsubscribe() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_clone = Arc::clone(&hits);
        let id = bus.subscribe(Arc::new(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        }));

        bus.emit(&MountEvent::ReferenceLost);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(&MountEvent::ReferenceLost);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_emit_with_no_subscribers_is_fine() {
        let bus = EventBus::default();
        bus.emit(&MountEvent::Position(PositionReport { x: 1, y: 2, z: 3 }));
    }
}
