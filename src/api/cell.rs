use crate::actor::{ActorClient, ReplicaActor};
use crate::api::options::HydraOptionsValidated;
use crate::api::{HeartbeatError, HeartbeatGate, HydraOptions, MutationCommitter};
use crate::automaton::{encode_message, CompositeAutomaton, RegistrationError};
use crate::chunk_server::{ChunkRegistry, LeaseChecker, NODE_HEARTBEAT};
use crate::commitlog::{SegmentedDiskLog, StorageConfig};
use crate::payloads::{ReqChunkNodeHeartbeat, ReqExecNodeHeartbeat, RspChunkNodeHeartbeat, RspExecNodeHeartbeat};
use crate::replica::{
    ClusterTracker, CommitMutationError, FileLocalState, MemberInfo, MutationResponse, PeerConnectError, QueryError,
    Replica, ReplicaConfig, ReplicaDiagnostics, ReplicaId, ReplicaRecoveryError, ReplicaStatusListener,
};
use crate::scheduler::{Scheduler, EXEC_NODE_HEARTBEAT};
use crate::server::{RpcServer, RpcServerShutdownHandle};
use crate::snapshot::{FileSnapshotStore, SnapshotStore};
use crate::transaction_supervisor::{MonotonicTimestampProvider, TransactionManager, TransactionSupervisor};
use crate::{replica, server};
use std::convert::TryFrom;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

pub struct HydraCellConfig {
    pub my_replica_id: String,
    pub cluster_members: Vec<MemberInfo>,
    /// Holds the mutation log, the term/vote file and local snapshots. Created if missing.
    pub data_directory: PathBuf,
    pub logger: slog::Logger,
    pub options: HydraOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum CellCreationError {
    #[error("Invalid cluster info")]
    InvalidClusterInfo(#[from] PeerConnectError),
    #[error("Illegal options for configuring cell: {0}")]
    IllegalOptions(String),
    #[error("Local storage initialization failure")]
    StorageInitialization(#[from] io::Error),
    #[error("Replica recovery failure")]
    Recovery(#[from] ReplicaRecoveryError),
    #[error("Automaton part registration failure")]
    PartRegistration(#[from] RegistrationError),
    #[error("My replica ID not in cluster config")]
    MeNotInCluster,
}

/// One member of a replicated cell. Dropping it without `shutdown()` leaves the replica running
/// until the runtime goes away.
pub struct HydraCell {
    logger: slog::Logger,
    actor_client: ActorClient,
    committer: Arc<dyn MutationCommitter>,
    transaction_supervisor: TransactionSupervisor,
    status_listener: ReplicaStatusListener,
    heartbeat_gate: Arc<HeartbeatGate>,
    server_shutdown_handle: RpcServerShutdownHandle,
}

pub async fn try_create_hydra_cell(config: HydraCellConfig) -> Result<HydraCell, CellCreationError> {
    let root_logger = config.logger;

    let options = HydraOptionsValidated::try_from(config.options)
        .map_err(|e| CellCreationError::IllegalOptions(e.to_string()))?;

    let my_member_info = my_info(&config.my_replica_id, &config.cluster_members)
        .cloned()
        .ok_or(CellCreationError::MeNotInCluster)?;
    let my_server_addr = rpc_server_addr(&my_member_info);

    let cluster_tracker = ClusterTracker::create_valid_cluster(my_member_info, config.cluster_members)?;
    let quorum = options
        .resolve_quorum(cluster_tracker.num_voting_replicas())
        .map_err(|e| CellCreationError::IllegalOptions(e.to_string()))?;

    let data_directory = config.data_directory;
    let mutation_log = SegmentedDiskLog::open(StorageConfig {
        directory: data_directory.join("changelog"),
        segment_max_bytes: options.segment_max_bytes,
    })?;
    std::fs::create_dir_all(&data_directory)?;
    let local_state = FileLocalState::open(
        data_directory.join("local_state"),
        ReplicaId::new(config.my_replica_id.clone()),
    )?;
    let snapshot_store: Arc<dyn SnapshotStore> = Arc::new(FileSnapshotStore::open(data_directory.join("snapshots"))?);

    let mut automaton = CompositeAutomaton::new();
    automaton.register_part(Box::new(TransactionManager::new(root_logger.clone())))?;
    automaton.register_part(Box::new(Scheduler::new(root_logger.clone(), options.scheduler.clone())))?;
    automaton.register_part(Box::new(ChunkRegistry::new(
        root_logger.clone(),
        options.chunk_registry.clone(),
    )))?;

    let (actor_client, actor_queue_rx) = ActorClient::new(64);

    let (replica, status_listener) = Replica::new(ReplicaConfig {
        logger: root_logger.clone(),
        cluster_tracker,
        mutation_log,
        local_state,
        snapshot_store: snapshot_store.clone(),
        automaton,
        actor_client: actor_client.weak(),
        options: options.replica_options(quorum),
    })?;

    let replica_actor = ReplicaActor::new(root_logger.clone(), actor_queue_rx, replica);
    tokio::spawn(replica_actor.run_event_loop());

    let heartbeat_gate = Arc::new(HeartbeatGate::new(options.max_concurrent_heartbeats));
    let (server_shutdown_handle, server_shutdown_signal) = server::shutdown_signal();
    let rpc_server = RpcServer::new(
        root_logger.clone(),
        actor_client.weak(),
        snapshot_store,
        heartbeat_gate.clone(),
    );
    tokio::spawn(rpc_server.run(my_server_addr, server_shutdown_signal));

    LeaseChecker::spawn(
        root_logger.clone(),
        Arc::new(actor_client.weak()),
        status_listener.clone(),
        options.chunk_registry.lease_check_period,
    );

    let committer: Arc<dyn MutationCommitter> = Arc::new(actor_client.clone());
    let transaction_supervisor = TransactionSupervisor::new(
        root_logger.clone(),
        committer.clone(),
        Arc::new(MonotonicTimestampProvider::new()),
    );

    slog::info!(root_logger, "Cell started"; "Quorum" => quorum, "DataDirectory" => ?data_directory);

    Ok(HydraCell {
        logger: root_logger,
        actor_client,
        committer,
        transaction_supervisor,
        status_listener,
        heartbeat_gate,
        server_shutdown_handle,
    })
}

impl HydraCell {
    pub fn committer(&self) -> Arc<dyn MutationCommitter> {
        self.committer.clone()
    }

    pub fn transaction_supervisor(&self) -> &TransactionSupervisor {
        &self.transaction_supervisor
    }

    pub fn status_listener(&self) -> ReplicaStatusListener {
        self.status_listener.clone()
    }

    pub async fn diagnose(&self) -> Result<ReplicaDiagnostics, replica::ActorExited> {
        self.actor_client.diagnose().await
    }

    pub async fn commit_mutation(
        &self,
        mutation_type: &str,
        payload: Vec<u8>,
    ) -> Result<MutationResponse, CommitMutationError> {
        self.committer.commit_mutation(mutation_type, payload).await
    }

    pub async fn query(&self, query_type: &str, payload: Vec<u8>) -> Result<Vec<u8>, QueryError> {
        self.committer.query(query_type, payload).await
    }

    pub async fn exec_node_heartbeat(
        &self,
        request: ReqExecNodeHeartbeat,
    ) -> Result<RspExecNodeHeartbeat, HeartbeatError> {
        self.heartbeat_gate
            .commit_heartbeat(self.committer.as_ref(), EXEC_NODE_HEARTBEAT, encode_message(&request))
            .await
    }

    pub async fn chunk_node_heartbeat(
        &self,
        request: ReqChunkNodeHeartbeat,
    ) -> Result<RspChunkNodeHeartbeat, HeartbeatError> {
        self.heartbeat_gate
            .commit_heartbeat(self.committer.as_ref(), NODE_HEARTBEAT, encode_message(&request))
            .await
    }

    /// Stops serving peers, then stops the replica. Pending proposals fail with `Stopped`.
    pub async fn shutdown(self) {
        self.server_shutdown_handle.shutdown();
        if self.actor_client.shutdown().await.is_err() {
            slog::warn!(self.logger, "Replica event loop had already exited");
        }
    }
}

fn my_info<'a>(my_replica_id: &str, cluster_members: &'a [MemberInfo]) -> Option<&'a MemberInfo> {
    cluster_members
        .iter()
        .find(|member| member.replica_id.as_str() == my_replica_id)
}

fn rpc_server_addr(member_info: &MemberInfo) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(member_info.ip, member_info.port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn member(id: &str, port: u16) -> MemberInfo {
        MemberInfo {
            replica_id: ReplicaId::new(id),
            ip: Ipv4Addr::LOCALHOST,
            port,
        }
    }

    fn config(my_replica_id: &str, data_directory: PathBuf, options: HydraOptions) -> HydraCellConfig {
        HydraCellConfig {
            my_replica_id: my_replica_id.to_string(),
            cluster_members: vec![member("r1", 47101), member("r2", 47102), member("r3", 47103)],
            data_directory,
            logger: slog::Logger::root(slog::Discard, slog::o!()),
            options,
        }
    }

    #[test]
    fn finds_my_member_info() {
        let members = vec![member("r1", 1), member("r2", 2)];
        assert_eq!(my_info("r2", &members).map(|m| m.port), Some(2));
        assert!(my_info("r9", &members).is_none());
    }

    #[tokio::test]
    async fn rejects_replica_outside_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let result = try_create_hydra_cell(config("r9", dir.path().to_path_buf(), HydraOptions::default())).await;
        assert!(matches!(result, Err(CellCreationError::MeNotInCluster)));
    }

    #[tokio::test]
    async fn rejects_minority_quorum() {
        let dir = tempfile::tempdir().unwrap();
        let options = HydraOptions {
            quorum: Some(1),
            ..HydraOptions::default()
        };
        let result = try_create_hydra_cell(config("r1", dir.path().to_path_buf(), options)).await;
        assert!(matches!(result, Err(CellCreationError::IllegalOptions(_))));
    }
}
