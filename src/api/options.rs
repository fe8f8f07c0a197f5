use crate::chunk_server::ChunkRegistryConfig;
use crate::replica::{ReplicaOptions, SnapshotThreshold};
use crate::scheduler::SchedulerConfig;
use crate::snapshot::{BackoffOptions, DownloadOptions};
use std::convert::TryFrom;
use tokio::time::Duration;

/// Tuning knobs of a cell. Every field is optional; unset fields take the defaults below.
#[derive(Clone, Default)]
pub struct HydraOptions {
    pub leader_heartbeat_duration: Option<Duration>,
    pub follower_min_timeout: Option<Duration>,
    pub follower_max_timeout: Option<Duration>,
    pub leader_append_entries_timeout: Option<Duration>,
    /// How long a proposal may wait for its quorum before failing with `CommitTimeout`.
    pub commit_timeout: Option<Duration>,
    /// Votes needed to commit or elect. Defaults to a majority of the cluster.
    pub quorum: Option<usize>,
    pub max_entries_per_append: Option<usize>,
    /// Take a snapshot every N applied mutations. `Some(0)` turns snapshots off.
    pub snapshot_every_mutations: Option<u64>,
    pub snapshots_to_keep: Option<usize>,
    pub snapshot_download_block_size: Option<u64>,
    pub snapshot_download_rpc_timeout: Option<Duration>,
    pub snapshot_download_backoff: Option<BackoffOptions>,
    pub segment_max_bytes: Option<u64>,
    pub max_concurrent_heartbeats: Option<usize>,
    pub scheduler: Option<SchedulerConfig>,
    pub chunk_registry: Option<ChunkRegistryConfig>,
}

#[derive(Clone, Debug)]
pub(super) struct HydraOptionsValidated {
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
    pub leader_append_entries_timeout: Duration,
    pub commit_timeout: Duration,
    pub quorum: Option<usize>,
    pub max_entries_per_append: usize,
    pub snapshot_threshold: SnapshotThreshold,
    pub snapshots_to_keep: usize,
    pub snapshot_download: DownloadOptions,
    pub segment_max_bytes: u64,
    pub max_concurrent_heartbeats: usize,
    pub scheduler: SchedulerConfig,
    pub chunk_registry: ChunkRegistryConfig,
}

impl HydraOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.leader_heartbeat_duration >= self.follower_min_timeout {
            return Err("Follower minimum timeout must be greater than leader's heartbeat");
        }
        if self.follower_min_timeout >= self.follower_max_timeout {
            return Err("Follower minimum timeout must be less than maximum timeout");
        }
        if self.leader_append_entries_timeout >= self.follower_min_timeout {
            return Err("Leader's AppendEntries RPC timeout must be less than the follower's heartbeat timeout");
        }
        if self.quorum == Some(0) {
            return Err("Quorum must be positive");
        }
        if self.max_entries_per_append == 0 {
            return Err("Max entries per append must be positive");
        }
        if self.snapshots_to_keep == 0 {
            return Err("At least one snapshot must be kept");
        }
        if self.snapshot_download.block_size == 0 {
            return Err("Snapshot download block size must be positive");
        }
        if self.segment_max_bytes == 0 {
            return Err("Log segment size must be positive");
        }
        if self.max_concurrent_heartbeats == 0 {
            return Err("Max concurrent heartbeats must be positive");
        }
        if self.scheduler.max_tasks_per_operation == 0 {
            return Err("Max tasks per operation must be positive");
        }
        if self.chunk_registry.max_replicas_per_rack == 0 {
            return Err("Max replicas per rack must be positive");
        }
        if self.chunk_registry.lease_check_period >= self.chunk_registry.node_lease_timeout {
            return Err("Node lease check period must be less than the node lease timeout");
        }

        Ok(())
    }

    /// Quorum for a cluster of `num_voting_replicas`. An explicit quorum must still be a majority,
    /// or two leaders could commit conflicting entries.
    pub(super) fn resolve_quorum(&self, num_voting_replicas: usize) -> Result<usize, &'static str> {
        let majority = num_voting_replicas / 2 + 1;
        match self.quorum {
            None => Ok(majority),
            Some(q) if q < majority => Err("Quorum must be a majority of the cluster"),
            Some(q) if q > num_voting_replicas => Err("Quorum can't exceed cluster size"),
            Some(q) => Ok(q),
        }
    }

    pub(super) fn replica_options(&self, quorum: usize) -> ReplicaOptions {
        ReplicaOptions {
            leader_heartbeat_duration: self.leader_heartbeat_duration,
            follower_min_timeout: self.follower_min_timeout,
            follower_max_timeout: self.follower_max_timeout,
            append_entries_timeout: self.leader_append_entries_timeout,
            commit_timeout: self.commit_timeout,
            quorum,
            max_entries_per_append: self.max_entries_per_append,
            snapshot_threshold: self.snapshot_threshold,
            snapshots_to_keep: self.snapshots_to_keep,
            snapshot_download: self.snapshot_download.clone(),
        }
    }
}

impl TryFrom<HydraOptions> for HydraOptionsValidated {
    type Error = &'static str;

    fn try_from(options: HydraOptions) -> Result<Self, Self::Error> {
        let snapshot_threshold = match options.snapshot_every_mutations.unwrap_or(10_000) {
            0 => SnapshotThreshold::Off,
            n => SnapshotThreshold::Mutations(n),
        };

        let values = HydraOptionsValidated {
            leader_heartbeat_duration: options.leader_heartbeat_duration.unwrap_or(Duration::from_millis(100)),
            follower_min_timeout: options.follower_min_timeout.unwrap_or(Duration::from_millis(500)),
            follower_max_timeout: options.follower_max_timeout.unwrap_or(Duration::from_millis(1500)),
            leader_append_entries_timeout: options
                .leader_append_entries_timeout
                .unwrap_or(Duration::from_millis(300)),
            commit_timeout: options.commit_timeout.unwrap_or(Duration::from_secs(5)),
            quorum: options.quorum,
            max_entries_per_append: options.max_entries_per_append.unwrap_or(64),
            snapshot_threshold,
            snapshots_to_keep: options.snapshots_to_keep.unwrap_or(2),
            snapshot_download: DownloadOptions {
                block_size: options.snapshot_download_block_size.unwrap_or(1 << 20),
                rpc_timeout: options.snapshot_download_rpc_timeout.unwrap_or(Duration::from_secs(5)),
                backoff: options.snapshot_download_backoff.unwrap_or_default(),
            },
            segment_max_bytes: options.segment_max_bytes.unwrap_or(64 << 20),
            max_concurrent_heartbeats: options.max_concurrent_heartbeats.unwrap_or(32),
            scheduler: options.scheduler.unwrap_or_default(),
            chunk_registry: options.chunk_registry.unwrap_or_default(),
        };

        values.validate()?;
        Ok(values)
    }
}
