//! Observer events for catalog activity.
//!
//! Provides `CatalogEvent` for UI/monitoring and `EventBus` for subscriptions.
//! The bus is shared as `Arc<EventBus>` so observers may live on other tasks.

use crate::PeerId;
use crate::locator::ContentId;
use crate::peers::{ConnectionDirection, DisconnectReason};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by a [`Node`](crate::Node).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CatalogEvent {
    /// An entry was stored (new or replacing an older version).
    EntryAccepted {
        source_locator: String,
        content_id: ContentId,
        created_at: u64,
        /// Sending peer; `None` for local publishes.
        from: Option<PeerId>,
    },
    /// A presence record went online or offline.
    PresenceChanged {
        identity: String,
        peer_id: Option<PeerId>,
        online: bool,
        timestamp: u64,
    },
    /// Handshake completed on a session.
    SessionOpened {
        session_id: String,
        peer_id: PeerId,
        identity: String,
        direction: ConnectionDirection,
    },
    SessionClosed {
        session_id: String,
        peer_id: Option<PeerId>,
        reason: DisconnectReason,
    },
    /// Inbound frame decoded.
    MessageReceived {
        /// Wire `type` tag (e.g. "entry", "announce").
        message_type: String,
        /// Frame size in bytes.
        size: usize,
        /// Milliseconds since Unix epoch.
        timestamp: u64,
    },
    /// Outbound frame handed to at least one channel.
    MessageSent {
        message_type: String,
        size: usize,
        timestamp: u64,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Hold this value to keep receiving events, drop it (or let it go out of
/// scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(CatalogEvent) + Send + Sync>;

/// Event bus for publishing catalog events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(CatalogEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds the read lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: CatalogEvent) {
        // Snapshot so a callback may subscribe without deadlocking.
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn presence_event(online: bool) -> CatalogEvent {
        CatalogEvent::PresenceChanged {
            identity: "alice".into(),
            peer_id: None,
            online,
            timestamp: 1000,
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(presence_event(true));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));

        {
            let count_clone = Arc::clone(&count);
            let _sub = bus.subscribe(move |_| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(presence_event(true));
            assert_eq!(bus.subscriber_count(), 1);
        }

        bus.emit(presence_event(false));
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_partial_unsubscribe() {
        let bus = Arc::new(EventBus::new());
        let seen1 = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::new(Mutex::new(Vec::new()));

        let s1 = Arc::clone(&seen1);
        let sub1 = bus.subscribe(move |e| s1.lock().unwrap().push(e));
        let s2 = Arc::clone(&seen2);
        let _sub2 = bus.subscribe(move |e| s2.lock().unwrap().push(e));

        bus.emit(presence_event(true));
        drop(sub1);
        bus.emit(presence_event(false));

        assert_eq!(seen1.lock().unwrap().len(), 1);
        assert_eq!(seen2.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_callback_may_subscribe() {
        let bus = Arc::new(EventBus::new());
        let inner_subs = Arc::new(Mutex::new(Vec::new()));

        let bus_clone = Arc::clone(&bus);
        let subs_clone = Arc::clone(&inner_subs);
        let _sub = bus.subscribe(move |_| {
            let sub = bus_clone.subscribe(|_| {});
            subs_clone.lock().unwrap().push(sub);
        });

        bus.emit(presence_event(true));
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_event_serialization() {
        let event = CatalogEvent::MessageReceived {
            message_type: "entry".into(),
            size: 1024,
            timestamp: 1234567890,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"messageReceived\""));
        assert!(json.contains("\"messageType\":\"entry\""));
        assert!(json.contains("\"size\":1024"));
    }
}
