use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ChunkRegistryConfig {
    /// A node silent for longer than this goes offline and its replicas count as missing.
    pub node_lease_timeout: Duration,
    /// Placement never puts more replicas of one chunk into a rack. Rack-less nodes are exempt.
    pub max_replicas_per_rack: usize,
    /// How often the leader proposes a lease check.
    pub lease_check_period: Duration,
}

impl ChunkRegistryConfig {
    pub(crate) fn node_lease_timeout_millis(&self) -> u64 {
        self.node_lease_timeout.as_millis() as u64
    }
}

impl Default for ChunkRegistryConfig {
    fn default() -> Self {
        ChunkRegistryConfig {
            node_lease_timeout: Duration::from_secs(30),
            max_replicas_per_rack: 1,
            lease_check_period: Duration::from_secs(5),
        }
    }
}
