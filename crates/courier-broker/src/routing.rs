//! The peer-id routing cache.

use std::{collections::HashMap, sync::RwLock};

use uuid::Uuid;

/// Map from a *logical* target peer id (a client behind a proxy or
/// multiplexer, as seen by distant peers) to the *physical* peer id of the
/// proxy connection that reaches it.
///
/// A peer that has connected directly to this broker must be absent from the
/// table; the backend dissociates on direct connect.
#[derive(Debug, Default)]
pub struct PeerIdRoutingCache {
    routing_table: RwLock<HashMap<Uuid, Uuid>>,
}

impl PeerIdRoutingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn associate_target_peer_id(&self, source_peer_id: Uuid, target_peer_id: Uuid) {
        self.routing_table
            .write()
            .unwrap()
            .insert(target_peer_id, source_peer_id);
    }

    /// Remove the mapping; `false` when none existed (not an error).
    pub fn dissociate_target_peer_id(&self, target_peer_id: Uuid) -> bool {
        self.routing_table
            .write()
            .unwrap()
            .remove(&target_peer_id)
            .is_some()
    }

    /// The physical peer id reaching `target_peer_id`, when routed.
    pub fn try_resolve_target_peer_id(&self, target_peer_id: Uuid) -> Option<Uuid> {
        self.routing_table
            .read()
            .unwrap()
            .get(&target_peer_id)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.routing_table.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn associate_resolve_dissociate() {
        let cache = PeerIdRoutingCache::new();
        let source = Uuid::new_v4();
        let target = Uuid::new_v4();

        assert_eq!(cache.try_resolve_target_peer_id(target), None);

        cache.associate_target_peer_id(source, target);
        assert_eq!(cache.try_resolve_target_peer_id(target), Some(source));

        assert!(cache.dissociate_target_peer_id(target));
        assert!(!cache.dissociate_target_peer_id(target));
        assert_eq!(cache.try_resolve_target_peer_id(target), None);
    }

    #[test]
    fn reassociation_overwrites_the_source() {
        let cache = PeerIdRoutingCache::new();
        let target = Uuid::new_v4();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        cache.associate_target_peer_id(first, target);
        cache.associate_target_peer_id(second, target);
        assert_eq!(cache.try_resolve_target_peer_id(target), Some(second));
    }
}
