use hydra::{
    ChunkReplicaRef, CommitMutationError, HydraCell, HydraCellConfig, HydraOptions, MemberInfo, ReplicaId,
    ReplicaState, ReqChunkNodeHeartbeat, ReqCreateChunk, ReqExecNodeHeartbeat, ReqRegisterExecNode, ReqRegisterNode,
    ReqStartOperation, Resources, TransactionState, TransactionSupervisorError, CREATE_CHUNK, NO_SUCH_TRANSACTION,
    REGISTER_EXEC_NODE, REGISTER_NODE, START_OPERATION,
};
use slog::Drain;
use std::error::Error;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::time::{Duration, Instant};

const NUM_MEMBERS: usize = 3;
// Small enough that the leader compacts away entries the stopped follower never saw.
const SNAPSHOT_EVERY: u64 = 4;

#[tokio::test]
async fn transactions_commit_through_the_replicated_log() -> Result<(), Box<dyn Error>> {
    let dirs = data_dirs()?;
    let mut cells = start_cluster(48100, &dirs, None).await?;
    let leader_idx = wait_for_leader(&cells, Duration::from_secs(10)).await;
    let leader = cells[leader_idx].as_ref().unwrap();
    let supervisor = leader.transaction_supervisor();

    let start_timestamp = supervisor.start_transaction("tx-1").await?;
    let prepare_timestamp = supervisor.generate_timestamp();
    assert!(prepare_timestamp > start_timestamp);
    supervisor
        .prepare_transaction_commit("tx-1", true, prepare_timestamp)
        .await?;
    supervisor
        .commit_transaction("tx-1", supervisor.generate_timestamp())
        .await?;
    assert_eq!(supervisor.transaction_state("tx-1").await?, Some(TransactionState::Committed));

    // Errors committed into the log come back to the caller.
    match supervisor.commit_transaction("tx-missing", supervisor.generate_timestamp()).await {
        Err(TransactionSupervisorError::Transaction(e)) => assert_eq!(e.code, NO_SUCH_TRANSACTION),
        other => panic!("Expected a transaction error, got {:?}", other),
    }

    // Every follower applies the same outcome.
    for (i, cell) in cells.iter().enumerate() {
        if i == leader_idx {
            continue;
        }
        let follower = cell.as_ref().unwrap().transaction_supervisor();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if follower.transaction_state("tx-1").await? == Some(TransactionState::Committed) {
                break;
            }
            assert!(Instant::now() < deadline, "Follower {} never applied the commit", i);
            sleep_ms(50).await;
        }
    }

    shutdown_all(&mut cells).await;
    Ok(())
}

#[tokio::test]
async fn node_heartbeats_are_served_by_the_leader() -> Result<(), Box<dyn Error>> {
    let dirs = data_dirs()?;
    let mut cells = start_cluster(48200, &dirs, None).await?;
    let leader_idx = wait_for_leader(&cells, Duration::from_secs(10)).await;
    let leader = cells[leader_idx].as_ref().unwrap();

    // Exec node gets the operation's jobs on its first heartbeat.
    let limits = Resources {
        user_slots: 4,
        cpu: 4,
        ..Default::default()
    };
    leader
        .commit_mutation(
            REGISTER_EXEC_NODE,
            hydra::encode_message(&ReqRegisterExecNode {
                node_id: "exec-1".into(),
                tags: vec![],
                resource_limits: Some(limits.clone()),
            }),
        )
        .await?
        .result?;
    leader
        .commit_mutation(
            START_OPERATION,
            hydra::encode_message(&ReqStartOperation {
                operation_id: "op".into(),
                pool: String::new(),
                weight: 1.0,
                tag_filter: vec![],
                task_count: 2,
                task_resources: Some(Resources {
                    user_slots: 1,
                    cpu: 1,
                    ..Default::default()
                }),
            }),
        )
        .await?
        .result?;
    let rsp = leader
        .exec_node_heartbeat(ReqExecNodeHeartbeat {
            node_id: "exec-1".into(),
            jobs: vec![],
            resource_limits: Some(limits),
        })
        .await?;
    assert!(!rsp.disable_jobs);
    assert_eq!(rsp.jobs_to_start.len(), 2);

    // Under-replicated chunk gets a replication job on its only holder.
    for node_id in &["data-1", "data-2", "data-3"] {
        leader
            .commit_mutation(
                REGISTER_NODE,
                hydra::encode_message(&ReqRegisterNode {
                    node_id: node_id.to_string(),
                    rack: String::new(),
                    total_space: 1 << 30,
                }),
            )
            .await?
            .result?;
    }
    leader
        .commit_mutation(
            CREATE_CHUNK,
            hydra::encode_message(&ReqCreateChunk {
                chunk_id: "chunk-1".into(),
                replication_factor: 2,
                data_parts: 0,
                parity_parts: 0,
                replicas: vec![ChunkReplicaRef {
                    node_id: "data-1".into(),
                    replica_index: 0,
                }],
            }),
        )
        .await?
        .result?;
    let rsp = leader
        .chunk_node_heartbeat(ReqChunkNodeHeartbeat {
            node_id: "data-1".into(),
            ..Default::default()
        })
        .await?;
    assert_eq!(rsp.jobs_to_start.len(), 1);
    assert_eq!(rsp.jobs_to_start[0].chunk_id, "chunk-1");
    assert_eq!(rsp.jobs_to_start[0].target_nodes.len(), 1);
    assert_ne!(rsp.jobs_to_start[0].target_nodes[0], "data-1");

    // Followers redirect proposals.
    let follower = cells
        .iter()
        .enumerate()
        .find(|(i, _)| *i != leader_idx)
        .and_then(|(_, cell)| cell.as_ref())
        .unwrap();
    match follower.commit_mutation(REGISTER_NODE, vec![]).await {
        Err(CommitMutationError::LeaderRedirect(info)) => {
            assert_eq!(info.replica_id, ReplicaId::new(repl_id(leader_idx)))
        }
        other => panic!("Expected a redirect, got {:?}", other),
    }

    shutdown_all(&mut cells).await;
    Ok(())
}

#[tokio::test]
async fn restarted_follower_catches_up_to_identical_state() -> Result<(), Box<dyn Error>> {
    let port_base = 48300;
    let dirs = data_dirs()?;
    let mut cells = start_cluster(port_base, &dirs, Some(SNAPSHOT_EVERY)).await?;
    let leader_idx = wait_for_leader(&cells, Duration::from_secs(10)).await;
    let follower_idx = (leader_idx + 1) % NUM_MEMBERS;

    cells[follower_idx].take().unwrap().shutdown().await;
    // Let the stopped server release its port.
    sleep_ms(200).await;

    {
        let supervisor = cells[leader_idx].as_ref().unwrap().transaction_supervisor();
        for i in 0..5 {
            let transaction_id = format!("tx-{}", i);
            supervisor.start_transaction(&transaction_id).await?;
            if i % 2 == 0 {
                supervisor
                    .prepare_transaction_commit(&transaction_id, true, supervisor.generate_timestamp())
                    .await?;
                supervisor
                    .commit_transaction(&transaction_id, supervisor.generate_timestamp())
                    .await?;
            } else {
                supervisor.abort_transaction(&transaction_id, false).await?;
            }
        }
    }

    cells[follower_idx] = Some(start_cell(port_base, follower_idx, &dirs[follower_idx], Some(SNAPSHOT_EVERY)).await?);

    let leader = cells[leader_idx].as_ref().unwrap();
    let restarted = cells[follower_idx].as_ref().unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let leader_diagnostics = leader.diagnose().await?;
        let follower_diagnostics = restarted.diagnose().await?;
        if follower_diagnostics.last_applied_index == leader_diagnostics.last_applied_index
            && follower_diagnostics.status.state == ReplicaState::Following
        {
            assert_eq!(follower_diagnostics.state_hash, leader_diagnostics.state_hash);
            break;
        }
        assert!(Instant::now() < deadline, "Restarted follower never caught up");
        sleep_ms(50).await;
    }

    assert_eq!(
        restarted.transaction_supervisor().transaction_state("tx-4").await?,
        Some(TransactionState::Committed)
    );
    assert_eq!(
        restarted.transaction_supervisor().transaction_state("tx-3").await?,
        Some(TransactionState::Aborted)
    );

    shutdown_all(&mut cells).await;
    Ok(())
}

fn data_dirs() -> std::io::Result<Vec<TempDir>> {
    (0..NUM_MEMBERS).map(|_| tempfile::tempdir()).collect()
}

async fn start_cluster(
    port_base: u16,
    dirs: &[TempDir],
    snapshot_every_mutations: Option<u64>,
) -> Result<Vec<Option<HydraCell>>, Box<dyn Error>> {
    let mut cells = Vec::with_capacity(NUM_MEMBERS);
    for (i, dir) in dirs.iter().enumerate() {
        cells.push(Some(start_cell(port_base, i, dir, snapshot_every_mutations).await?));
    }
    Ok(cells)
}

async fn start_cell(
    port_base: u16,
    id: usize,
    dir: &TempDir,
    snapshot_every_mutations: Option<u64>,
) -> Result<HydraCell, Box<dyn Error>> {
    let cell = hydra::try_create_hydra_cell(config(port_base, id, dir.path(), snapshot_every_mutations)).await?;
    Ok(cell)
}

fn config(
    port_base: u16,
    id: usize,
    data_directory: &Path,
    snapshot_every_mutations: Option<u64>,
) -> HydraCellConfig {
    let heartbeat_duration = Duration::from_millis(50);
    HydraCellConfig {
        my_replica_id: repl_id(id),
        cluster_members: (0..NUM_MEMBERS).map(|i| member_info(port_base, i)).collect(),
        data_directory: PathBuf::from(data_directory),
        logger: create_root_logger_for_stdout(repl_id(id)),
        options: HydraOptions {
            leader_heartbeat_duration: Some(heartbeat_duration),
            follower_min_timeout: Some(heartbeat_duration * 6),
            follower_max_timeout: Some(heartbeat_duration * 12),
            leader_append_entries_timeout: Some(heartbeat_duration * 4),
            snapshot_every_mutations,
            ..HydraOptions::default()
        },
    }
}

fn member_info(port_base: u16, id: usize) -> MemberInfo {
    MemberInfo {
        replica_id: ReplicaId::new(repl_id(id)),
        ip: Ipv4Addr::LOCALHOST,
        port: port_base + id as u16,
    }
}

fn repl_id(id: usize) -> String {
    format!("replica-{}", id)
}

async fn wait_for_leader(cells: &[Option<HydraCell>], timeout: Duration) -> usize {
    let deadline = Instant::now() + timeout;
    loop {
        for (i, cell) in cells.iter().enumerate() {
            if let Some(cell) = cell {
                if let Ok(diagnostics) = cell.diagnose().await {
                    if diagnostics.status.state == ReplicaState::Leading {
                        return i;
                    }
                }
            }
        }
        assert!(Instant::now() < deadline, "No leader elected within {:?}", timeout);
        sleep_ms(50).await;
    }
}

async fn shutdown_all(cells: &mut Vec<Option<HydraCell>>) {
    for cell in cells.iter_mut() {
        if let Some(cell) = cell.take() {
            cell.shutdown().await;
        }
    }
}

fn create_root_logger_for_stdout(replica_id: String) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("ReplicaId" => replica_id))
}

async fn sleep_ms(millis: u64) {
    tokio::time::sleep(Duration::from_millis(millis)).await;
}
