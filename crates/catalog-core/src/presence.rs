//! Presence tracking by identity.
//!
//! The local identity is seeded online at construction and never goes
//! offline. Remote identities go online on handshake and offline when
//! their session closes.

use crate::PeerId;
use crate::events::{CatalogEvent, EventBus};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use tracing::info;

const SECOND_MS: u64 = 1000;
const MINUTE_SECS: u64 = 60;
const HOUR_SECS: u64 = 60 * MINUTE_SECS;
const DAY_SECS: u64 = 24 * HOUR_SECS;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub identity: String,
    pub peer_id: PeerId,
    pub online: bool,
    /// Milliseconds since Unix epoch.
    pub last_seen: u64,
}

/// Coarse "last seen" bucket for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastSeen {
    OnlineNow,
    /// Under a minute ago.
    JustNow,
    Minutes(u64),
    Hours(u64),
    Days(u64),
}

impl LastSeen {
    fn bucket(elapsed_ms: u64) -> Self {
        let seconds = elapsed_ms / SECOND_MS;
        if seconds < MINUTE_SECS {
            Self::JustNow
        } else if seconds < HOUR_SECS {
            Self::Minutes(seconds / MINUTE_SECS)
        } else if seconds < DAY_SECS {
            Self::Hours(seconds / HOUR_SECS)
        } else {
            Self::Days(seconds / DAY_SECS)
        }
    }
}

impl Display for LastSeen {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let (n, unit) = match self {
            Self::OnlineNow => return f.write_str("Online now"),
            Self::JustNow => return f.write_str("Just now"),
            Self::Minutes(n) => (n, "minute"),
            Self::Hours(n) => (n, "hour"),
            Self::Days(n) => (n, "day"),
        };
        let plural = if *n == 1 { "" } else { "s" };
        write!(f, "{n} {unit}{plural} ago")
    }
}

pub struct PresenceTracker {
    self_identity: String,
    records: HashMap<String, PresenceRecord>,
    events: Option<Arc<EventBus>>,
}

impl PresenceTracker {
    pub fn new(self_identity: impl Into<String>, self_peer: PeerId, now: u64) -> Self {
        let self_identity = self_identity.into();
        let mut records = HashMap::new();
        records.insert(
            self_identity.clone(),
            PresenceRecord {
                identity: self_identity.clone(),
                peer_id: self_peer,
                online: true,
                last_seen: now,
            },
        );
        Self {
            self_identity,
            records,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn self_identity(&self) -> &str {
        &self.self_identity
    }

    fn is_self(&self, identity: &str) -> bool {
        identity == self.self_identity
    }

    /// Mark `identity` online behind `peer_id`.
    ///
    /// A remote peer claiming the local identity only refreshes last-seen;
    /// the self record keeps the local peer ID.
    pub fn set_online(&mut self, identity: &str, peer_id: PeerId, now: u64) {
        if self.is_self(identity) {
            self.update_last_seen(identity, now);
            return;
        }

        info!("{} is now ONLINE ({})", identity, peer_id.short());
        self.records.insert(
            identity.to_string(),
            PresenceRecord {
                identity: identity.to_string(),
                peer_id,
                online: true,
                last_seen: now,
            },
        );
        self.emit(identity, Some(peer_id), true, now);
    }

    /// Mark `identity` offline. Returns false for self and unknown identities.
    pub fn set_offline(&mut self, identity: &str, now: u64) -> bool {
        if self.is_self(identity) {
            return false;
        }
        let Some(record) = self.records.get_mut(identity) else {
            return false;
        };

        info!("{} is now OFFLINE", identity);
        record.online = false;
        record.last_seen = now;
        let peer_id = record.peer_id;
        self.emit(identity, Some(peer_id), false, now);
        true
    }

    /// Refresh last-seen for an online identity.
    pub fn update_last_seen(&mut self, identity: &str, now: u64) {
        if let Some(record) = self.records.get_mut(identity) {
            if record.online {
                record.last_seen = now;
            }
        }
    }

    pub fn is_online(&self, identity: &str) -> bool {
        self.is_self(identity) || self.records.get(identity).is_some_and(|r| r.online)
    }

    /// `None` if the identity has never been seen.
    pub fn get_last_seen(&self, identity: &str, now: u64) -> Option<LastSeen> {
        if self.is_self(identity) {
            return Some(LastSeen::OnlineNow);
        }
        let record = self.records.get(identity)?;
        if record.online {
            return Some(LastSeen::OnlineNow);
        }
        Some(LastSeen::bucket(now.saturating_sub(record.last_seen)))
    }

    /// Reverse lookup; a linear scan over the records.
    pub fn get_user_by_peer_id(&self, peer_id: PeerId) -> Option<&str> {
        self.records
            .values()
            .find(|r| r.peer_id == peer_id)
            .map(|r| r.identity.as_str())
    }

    /// All records, sorted by identity.
    pub fn records(&self) -> Vec<PresenceRecord> {
        let mut records: Vec<PresenceRecord> = self.records.values().cloned().collect();
        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        records
    }

    fn emit(&self, identity: &str, peer_id: Option<PeerId>, online: bool, timestamp: u64) {
        if let Some(events) = &self.events {
            events.emit(CatalogEvent::PresenceChanged {
                identity: identity.to_string(),
                peer_id,
                online,
                timestamp,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    const ME: &str = "swift-otter";

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(ME, PeerId::from(1), 0)
    }

    fn bob() -> PeerId {
        PeerId::from(2)
    }

    // ==================== Self ====================

    #[test]
    fn test_self_is_always_online() {
        let mut presence = tracker();
        assert!(presence.is_online(ME));
        assert!(!presence.set_offline(ME, 10));
        assert!(presence.is_online(ME));
        assert_eq!(presence.get_last_seen(ME, 999_999_999), Some(LastSeen::OnlineNow));
        assert_eq!(presence.get_user_by_peer_id(PeerId::from(1)), Some(ME));
    }

    #[test]
    fn test_remote_claiming_self_identity_keeps_self_record() {
        let mut presence = tracker();
        presence.set_online(ME, bob(), 50);
        assert_eq!(presence.get_user_by_peer_id(bob()), None);
        assert_eq!(presence.get_user_by_peer_id(PeerId::from(1)), Some(ME));
    }

    // ==================== Remote ====================

    #[test]
    fn test_online_offline_cycle() {
        let mut presence = tracker();
        assert!(!presence.is_online("bob"));
        assert_eq!(presence.get_last_seen("bob", 0), None);

        presence.set_online("bob", bob(), 1000);
        assert!(presence.is_online("bob"));
        assert_eq!(presence.get_user_by_peer_id(bob()), Some("bob"));

        assert!(presence.set_offline("bob", 2000));
        assert!(!presence.is_online("bob"));
        assert_eq!(presence.records().len(), 2);
    }

    #[test]
    fn test_set_offline_unknown_is_noop() {
        let mut presence = tracker();
        assert!(!presence.set_offline("nobody", 5));
    }

    #[test]
    fn test_update_last_seen_only_while_online() {
        let mut presence = tracker();
        presence.set_online("bob", bob(), 1000);
        presence.update_last_seen("bob", 1500);
        presence.set_offline("bob", 2000);
        presence.update_last_seen("bob", 9000);

        let record = presence.records().into_iter().find(|r| r.identity == "bob").unwrap();
        assert_eq!(record.last_seen, 2000);
    }

    #[test]
    fn test_last_seen_buckets() {
        let mut presence = tracker();
        presence.set_online("bob", bob(), 0);
        assert_eq!(presence.get_last_seen("bob", 10_000_000), Some(LastSeen::OnlineNow));

        presence.set_offline("bob", 0);
        assert_eq!(presence.get_last_seen("bob", 59_999), Some(LastSeen::JustNow));
        assert_eq!(presence.get_last_seen("bob", 60_000), Some(LastSeen::Minutes(1)));
        assert_eq!(presence.get_last_seen("bob", 3_599_999), Some(LastSeen::Minutes(59)));
        assert_eq!(presence.get_last_seen("bob", 3_600_000), Some(LastSeen::Hours(1)));
        assert_eq!(presence.get_last_seen("bob", 86_400_000), Some(LastSeen::Days(1)));
        assert_eq!(presence.get_last_seen("bob", 3 * 86_400_000), Some(LastSeen::Days(3)));
    }

    #[test]
    fn test_last_seen_display() {
        assert_eq!(LastSeen::OnlineNow.to_string(), "Online now");
        assert_eq!(LastSeen::JustNow.to_string(), "Just now");
        assert_eq!(LastSeen::Minutes(1).to_string(), "1 minute ago");
        assert_eq!(LastSeen::Minutes(5).to_string(), "5 minutes ago");
        assert_eq!(LastSeen::Hours(3).to_string(), "3 hours ago");
        assert_eq!(LastSeen::Days(1).to_string(), "1 day ago");
    }

    #[test]
    fn test_presence_events() {
        let events = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = events.subscribe(move |e| {
            if let CatalogEvent::PresenceChanged { identity, online, .. } = e {
                seen_clone.lock().unwrap().push((identity, online));
            }
        });

        let mut presence = tracker().with_events(Arc::clone(&events));
        presence.set_online("bob", bob(), 1);
        presence.set_offline("bob", 2);
        presence.set_offline(ME, 3);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("bob".to_string(), true), ("bob".to_string(), false)]
        );
    }
}
