use crate::replica::peer_client::{PeerClient, PeerConnectError};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Identifies a peer of a cell.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        ReplicaId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MemberInfo {
    pub replica_id: ReplicaId,
    pub ip: Ipv4Addr,
    pub port: u16,
}

#[derive(Clone)]
pub(crate) struct Peer {
    pub(crate) member: MemberInfo,
    pub(crate) client: PeerClient,
}

/// Static cluster membership as seen from one replica.
pub(crate) struct ClusterTracker {
    my_member: MemberInfo,
    peers: BTreeMap<ReplicaId, Peer>,
}

impl ClusterTracker {
    /// Clients connect lazily, so this succeeds while peers are still down.
    pub(crate) fn create_valid_cluster(
        my_member: MemberInfo,
        cluster_members: Vec<MemberInfo>,
    ) -> Result<Self, PeerConnectError> {
        let mut peers = BTreeMap::new();
        for member in cluster_members {
            if member.replica_id == my_member.replica_id {
                continue;
            }
            let client = PeerClient::new(&member)?;
            peers.insert(member.replica_id.clone(), Peer { member, client });
        }

        Ok(ClusterTracker { my_member, peers })
    }

    pub(crate) fn my_replica_id(&self) -> &ReplicaId {
        &self.my_member.replica_id
    }

    pub(crate) fn contains_member(&self, id: &ReplicaId) -> bool {
        self.member(id).is_some()
    }

    pub(crate) fn member(&self, id: &ReplicaId) -> Option<&MemberInfo> {
        if &self.my_member.replica_id == id {
            Some(&self.my_member)
        } else {
            self.peers.get(id).map(|p| &p.member)
        }
    }

    pub(crate) fn peer(&self, id: &ReplicaId) -> Option<&Peer> {
        self.peers.get(id)
    }

    pub(crate) fn iter_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub(crate) fn peer_ids(&self) -> Vec<ReplicaId> {
        self.peers.keys().cloned().collect()
    }

    pub(crate) fn num_voting_replicas(&self) -> usize {
        self.peers.len() + 1
    }
}
