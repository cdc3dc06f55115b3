//! catalog-core: Shared Rust library for gossip replication of a content catalog.
//!
//! This crate provides the core functionality for:
//! - The content entry data model and locator-derived content IDs
//! - Wire protocol between peers (tagged JSON messages, compact binary entries)
//! - Peer session registry with fan-out broadcast
//! - Content index of which peer claims to hold what
//! - Gossip engine with last-writer-wins merge over a pluggable store
//! - Presence tracking for peer identities
//! - `Node`, the owned service object tying the components together

pub mod content_index;
pub mod entry;
pub mod events;
pub mod gossip;
pub mod locator;
pub mod node;
pub mod peer_id;
pub mod peers;
pub mod presence;
pub mod protocol;
pub mod store;
pub mod time;
pub mod transport;

pub use content_index::{ContentIndex, IndexStats};
pub use entry::{ContentEntry, EntryId};
pub use events::{CatalogEvent, EventBus, Subscription};
pub use gossip::{GossipEngine, GossipError, ReceiveOutcome};
pub use locator::ContentId;
pub use node::{Node, NodeConfig, NodeError, SearchResults};
pub use peer_id::{PeerId, PeerIdError};
pub use peers::{
    ConnectionDirection, DisconnectReason, DuplicateCheck, PeerRegistry, PeerSession, SessionOpen,
    SessionState, check_duplicate_session,
};
pub use presence::{LastSeen, PresenceRecord, PresenceTracker};
pub use protocol::{CodecError, EntryCodec, ProtocolError, WireMessage};
pub use store::{ContentStats, EntryStore, InMemoryStore, StatsStore, StoreError, UpsertOutcome};
pub use transport::{Channel, MemoryChannel, PeerDirectory, PeerInfo, TransportError};
