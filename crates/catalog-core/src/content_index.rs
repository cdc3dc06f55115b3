//! Content index: which peers claim to hold which content.
//!
//! A flat local cache filled by `announce` messages. Claims are trusted as
//! received and dropped when the claiming peer's session closes.

use crate::PeerId;
use crate::locator::ContentId;
use crate::peers::PeerRegistry;
use crate::protocol::WireMessage;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

/// Counters for the console and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStats {
    /// Distinct content IDs with at least one holder.
    pub total_content: usize,
    /// Content this node announced itself.
    pub my_content: usize,
    /// Distinct holders across the index, self included.
    pub total_peers: usize,
}

pub struct ContentIndex {
    local_peer: PeerId,
    holders: HashMap<ContentId, HashSet<PeerId>>,
    my_content: HashSet<ContentId>,
}

impl ContentIndex {
    pub fn new(local_peer: PeerId) -> Self {
        Self {
            local_peer,
            holders: HashMap::new(),
            my_content: HashSet::new(),
        }
    }

    /// Claim `content_id` for this node and tell every open session.
    pub async fn announce_content(
        &mut self,
        content_id: ContentId,
        registry: &mut PeerRegistry,
    ) -> usize {
        info!("Announcing content: {}", content_id);
        self.holders
            .entry(content_id.clone())
            .or_default()
            .insert(self.local_peer);
        self.my_content.insert(content_id.clone());

        registry.broadcast(&self.announcement(content_id)).await
    }

    /// Record a remote claim. Returns true if it was new.
    pub fn handle_announcement(&mut self, content_id: ContentId, peer_id: PeerId) -> bool {
        let added = self.holders.entry(content_id.clone()).or_default().insert(peer_id);
        if added {
            debug!("Peer {} has: {}", peer_id.short(), content_id);
        }
        added
    }

    /// Cached holders of `content_id`, sorted. May include peers that have
    /// since lost the content.
    pub fn find_peers(&self, content_id: &ContentId) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .holders
            .get(content_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        peers.sort();
        peers
    }

    /// Ask every open session who holds `content_id`.
    pub async fn query_content(&self, content_id: ContentId, registry: &mut PeerRegistry) -> usize {
        debug!("Querying peers for: {}", content_id);
        registry
            .broadcast(&WireMessage::Query {
                content_id,
                requester_id: self.local_peer,
            })
            .await
    }

    /// Answer a query with our own announce, unicast, if we hold the content.
    pub async fn handle_query(
        &self,
        content_id: ContentId,
        requester_id: PeerId,
        registry: &mut PeerRegistry,
    ) -> bool {
        if !self.my_content.contains(&content_id) {
            return false;
        }
        debug!("Have {}, telling {}", content_id, requester_id.short());
        registry
            .send_to_peer(requester_id, &self.announcement(content_id))
            .await
    }

    /// Push every self-announced content ID to a newly opened peer.
    pub async fn bootstrap_peer(&self, peer_id: PeerId, registry: &mut PeerRegistry) -> usize {
        let mut sent = 0;
        for content_id in &self.my_content {
            if registry
                .send_to_peer(peer_id, &self.announcement(content_id.clone()))
                .await
            {
                sent += 1;
            } else {
                break;
            }
        }
        if sent > 0 {
            debug!("Bootstrapped {} with {} announcements", peer_id.short(), sent);
        }
        sent
    }

    /// Forget every claim made by `peer_id`. Returns how many were removed.
    pub fn remove_peer(&mut self, peer_id: PeerId) -> usize {
        let mut removed = 0;
        self.holders.retain(|_, peers| {
            if peers.remove(&peer_id) {
                removed += 1;
            }
            !peers.is_empty()
        });
        removed
    }

    pub fn my_content(&self) -> &HashSet<ContentId> {
        &self.my_content
    }

    pub fn stats(&self) -> IndexStats {
        let distinct: HashSet<&PeerId> = self.holders.values().flatten().collect();
        IndexStats {
            total_content: self.holders.len(),
            my_content: self.my_content.len(),
            total_peers: distinct.len(),
        }
    }

    fn announcement(&self, content_id: ContentId) -> WireMessage {
        WireMessage::Announce {
            content_id,
            peer_id: self.local_peer,
        }
    }
}
