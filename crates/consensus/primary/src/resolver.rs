//! Replica resolution from static configuration.

use ds_config::Parameters;
use ds_types::{GroupId, PeerAddress, ReplicaResolver};
use std::collections::BTreeSet;
use tracing::warn;

/// [ReplicaResolver] for a fixed group.
///
/// Replicas are kept sorted and deduplicated.
#[derive(Clone, Debug)]
pub struct StaticReplicaResolver {
    group_id: GroupId,
    replicas: Vec<PeerAddress>,
}

impl StaticReplicaResolver {
    /// Create a new instance of Self.
    pub fn new(group_id: GroupId, replicas: impl IntoIterator<Item = PeerAddress>) -> Self {
        let replicas: BTreeSet<_> = replicas.into_iter().collect();
        Self { group_id, replicas: replicas.into_iter().collect() }
    }

    /// Resolver for the group and replicas named in `parameters`.
    pub fn from_parameters(parameters: &Parameters) -> Self {
        Self::new(parameters.group_id.clone(), parameters.replicas.iter().copied())
    }
}

impl ReplicaResolver for StaticReplicaResolver {
    fn current_replicas(&self, group_id: &GroupId) -> Vec<PeerAddress> {
        if group_id != &self.group_id {
            warn!(target: "datastream::session", %group_id, "no replicas for unknown group");
            return Vec::new();
        }
        self.replicas.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn peer(port: u16) -> PeerAddress {
        PeerAddress::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn test_replicas_sorted_and_unique() {
        let group = GroupId::new("g");
        let resolver = StaticReplicaResolver::new(group.clone(), [peer(3), peer(1), peer(3)]);
        assert_eq!(resolver.current_replicas(&group), vec![peer(1), peer(3)]);
        assert!(resolver.current_replicas(&GroupId::new("other")).is_empty());
    }
}
