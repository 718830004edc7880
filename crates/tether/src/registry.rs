use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use transport_session::Peer;
use uuid::Uuid;

/// Change in the connectable state of a peer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAvailability {
    pub peer_identifier: Uuid,
    pub generation: u64,
    pub available: bool,
}

impl PeerAvailability {
    fn new(peer: Peer, available: bool) -> Self {
        Self {
            peer_identifier: peer.uuid(),
            generation: peer.generation(),
            available,
        }
    }
}

/// Latest known generation of a peer identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer: Peer,
    pub available: bool,
}

#[derive(Debug)]
struct PeerEntry {
    latest: u64,
    available: bool,
}

/// Tracks discovered peers by identity and generation.
///
/// Only the highest generation seen for an identity is ever connectable;
/// notifications about older generations are ignored.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<Uuid, PeerEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a discovered peer; returns the event to raise, if any.
    pub fn peer_found(&mut self, peer: Peer) -> Option<PeerAvailability> {
        let entry = self.peers.entry(peer.uuid()).or_insert(PeerEntry {
            latest: peer.generation(),
            available: false,
        });
        if peer.generation() < entry.latest {
            return None;
        }
        if peer.generation() == entry.latest && entry.available {
            return None;
        }
        entry.latest = peer.generation();
        entry.available = true;
        Some(PeerAvailability::new(peer, true))
    }

    /// Records a lost peer; only the latest generation can become unavailable.
    pub fn peer_lost(&mut self, peer: Peer) -> Option<PeerAvailability> {
        let entry = self.peers.get_mut(&peer.uuid())?;
        if peer.generation() != entry.latest || !entry.available {
            return None;
        }
        entry.available = false;
        Some(PeerAvailability::new(peer, false))
    }

    pub fn last_generation_peer(&self, uuid: Uuid) -> Option<PeerRecord> {
        self.peers.get(&uuid).map(|entry| PeerRecord {
            peer: Peer::with_generation(uuid, entry.latest),
            available: entry.available,
        })
    }

    pub fn connectable_peer(&self, uuid: Uuid) -> Option<Peer> {
        self.last_generation_peer(uuid)
            .filter(|record| record.available)
            .map(|record| record.peer)
    }

    pub fn available_peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .peers
            .iter()
            .filter(|(_, entry)| entry.available)
            .map(|(uuid, entry)| Peer::with_generation(*uuid, entry.latest))
            .collect();
        peers.sort();
        peers
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sighting_raises_available_event() {
        let mut registry = PeerRegistry::new();
        let peer = Peer::new();
        let event = registry.peer_found(peer).expect("event");
        assert!(event.available);
        assert_eq!(event.peer_identifier, peer.uuid());
        assert_eq!(registry.available_peers(), vec![peer]);
    }

    #[test]
    fn duplicate_sighting_is_suppressed() {
        let mut registry = PeerRegistry::new();
        let peer = Peer::new();
        assert!(registry.peer_found(peer).is_some());
        assert!(registry.peer_found(peer).is_none());
    }

    #[test]
    fn newer_generation_supersedes_and_stale_is_ignored() {
        let mut registry = PeerRegistry::new();
        let first = Peer::new();
        let second = first.next_generation().expect("next generation");

        assert!(registry.peer_found(first).is_some());
        let event = registry.peer_found(second).expect("new generation event");
        assert_eq!(event.generation, second.generation());

        assert!(registry.peer_found(first).is_none());
        assert!(registry.peer_lost(first).is_none());
        assert_eq!(registry.connectable_peer(first.uuid()), Some(second));
    }

    #[test]
    fn stale_generation_after_newer_is_never_connectable() {
        let mut registry = PeerRegistry::new();
        let first = Peer::new();
        let second = first.next_generation().expect("next generation");
        assert!(registry.peer_found(second).is_some());
        assert!(registry.peer_found(first).is_none());
        assert_eq!(
            registry.last_generation_peer(first.uuid()).map(|r| r.peer),
            Some(second)
        );
    }

    #[test]
    fn losing_latest_generation_raises_one_unavailable_event() {
        let mut registry = PeerRegistry::new();
        let peer = Peer::new();
        registry.peer_found(peer);

        let event = registry.peer_lost(peer).expect("lost event");
        assert!(!event.available);
        assert!(registry.peer_lost(peer).is_none());
        assert!(registry.connectable_peer(peer.uuid()).is_none());

        let record = registry.last_generation_peer(peer.uuid()).expect("record");
        assert!(!record.available);
    }

    #[test]
    fn unknown_peer_has_no_record() {
        let mut registry = PeerRegistry::new();
        assert!(registry.last_generation_peer(Uuid::new_v4()).is_none());
        assert!(registry.peer_lost(Peer::new()).is_none());
    }

    #[test]
    fn generations_stay_monotonic_across_restarts() {
        let mut registry = PeerRegistry::new();
        let mut peer = Peer::new();
        let mut seen = Vec::new();

        for _ in 0..32 {
            registry.peer_found(peer);
            let latest = registry
                .last_generation_peer(peer.uuid())
                .expect("record")
                .peer
                .generation();
            seen.push(latest);
            peer = peer.next_generation().expect("next generation");
        }

        assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(
            registry.last_generation_peer(peer.uuid()).map(|r| r.peer.generation()),
            seen.last().copied()
        );
    }

    #[test]
    fn clear_forgets_everything() {
        let mut registry = PeerRegistry::new();
        registry.peer_found(Peer::new());
        registry.clear();
        assert!(registry.available_peers().is_empty());
    }
}
