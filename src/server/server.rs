use crate::actor::WeakActorClient;
use crate::api::{HeartbeatError, HeartbeatGate, MutationCommitter};
use crate::automaton::encode_message;
use crate::commitlog::Index;
use crate::grpc::grpc_hydra_server::{GrpcHydra, GrpcHydraServer};
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_node_heartbeat_error, proto_node_heartbeat_result, proto_read_snapshot_error,
    proto_read_snapshot_result, proto_request_vote_error, proto_request_vote_result, ProtoAppendEntriesError,
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoAppendEntriesSuccess, ProtoClientNotInCluster,
    ProtoClientStaleTerm, ProtoGetLatestSnapshotIdReq, ProtoGetLatestSnapshotIdResult, ProtoInstallSnapshotError,
    ProtoInstallSnapshotReq, ProtoInstallSnapshotResult, ProtoInstallSnapshotSuccess, ProtoNoSuchSnapshot,
    ProtoNodeHeartbeatError, ProtoNodeHeartbeatReq, ProtoNodeHeartbeatResult, ProtoNodeHeartbeatSuccess,
    ProtoNotLeader, ProtoReadSnapshotError, ProtoReadSnapshotReq, ProtoReadSnapshotResult, ProtoRequestVoteError,
    ProtoRequestVoteReq, ProtoRequestVoteResult, ProtoRequestVoteSuccess, ProtoResources, ProtoServerFault,
    ProtoServerMissingPreviousLog, ProtoSnapshotBlock, ProtoStartJob, ProtoThrottled,
};
use crate::payloads::{ExecJobStatus, ReqExecNodeHeartbeat, Resources, RspExecNodeHeartbeat};
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, CommitMutationError, InstallSnapshotError,
    InstallSnapshotInput, InstallSnapshotOutput, MutationRecord, ReplicaId, RequestVoteError, RequestVoteInput,
    RequestVoteOutput, Term,
};
use crate::scheduler::EXEC_NODE_HEARTBEAT;
use crate::server::RpcServerShutdownSignal;
use crate::snapshot::SnapshotStore;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// RpcServer is the type that implements the Hydra gRPC interface: peer traffic of the consensus
/// protocol, snapshot transfer, and exec node heartbeats.
pub struct RpcServer {
    logger: slog::Logger,
    local_replica: WeakActorClient,
    snapshot_store: Arc<dyn SnapshotStore>,
    heartbeat_gate: Arc<HeartbeatGate>,
}

impl RpcServer {
    pub(crate) fn new(
        logger: slog::Logger,
        local_replica: WeakActorClient,
        snapshot_store: Arc<dyn SnapshotStore>,
        heartbeat_gate: Arc<HeartbeatGate>,
    ) -> Self {
        RpcServer {
            logger,
            local_replica,
            snapshot_store,
            heartbeat_gate,
        }
    }

    pub(crate) async fn run(self, socket_addr: SocketAddr, shutdown_signal: RpcServerShutdownSignal) {
        let logger = self.logger.clone();
        slog::info!(logger, "Listening on '{:?}'", socket_addr);

        let result = Server::builder()
            .add_service(GrpcHydraServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown_signal)
            .await;

        slog::info!(logger, "Server run() has exited: {:?}", result);
    }

    async fn handle_request_vote(&self, rpc_request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        let app_input = Self::convert_request_vote_input(rpc_request)?;
        let app_result = self.local_replica.request_vote(app_input).await;
        let rpc_reply = Self::convert_request_vote_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_request_vote_input(rpc_request: ProtoRequestVoteReq) -> Result<RequestVoteInput, Status> {
        let candidate_last_log_entry =
            Self::convert_log_entry_metadata(rpc_request.last_log_entry_term, rpc_request.last_log_entry_index)?;

        Ok(RequestVoteInput {
            candidate_term: Term::new(rpc_request.term),
            candidate_id: ReplicaId::new(rpc_request.client_node_id),
            candidate_last_log_entry,
        })
    }

    fn convert_request_vote_result(app_result: Result<RequestVoteOutput, RequestVoteError>) -> ProtoRequestVoteResult {
        let vote_error = |message: &str| ProtoRequestVoteResult {
            result: Some(proto_request_vote_result::Result::Err(ProtoRequestVoteError {
                err: Some(proto_request_vote_error::Err::ServerFault(ProtoServerFault {
                    message: message.to_string(),
                })),
            })),
        };

        match app_result {
            Ok(ok) => ProtoRequestVoteResult {
                result: Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                    vote_granted: ok.vote_granted,
                    current_term: ok.current_term.as_u64(),
                })),
            },
            // A candidate outside the cluster gets no term to compare against.
            Err(RequestVoteError::CandidateNotInCluster) => ProtoRequestVoteResult {
                result: Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                    vote_granted: false,
                    current_term: 0,
                })),
            },
            Err(RequestVoteError::ServerIoError(_)) => vote_error("Local IO failure"),
            Err(RequestVoteError::ActorExited) => vote_error("Server internal replica task has exited"),
        }
    }

    async fn handle_append_entries(
        &self,
        rpc_request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        let app_input = Self::convert_append_entries_input(rpc_request)?;
        let app_result = self.local_replica.append_entries(app_input).await;
        let rpc_reply = Self::convert_append_entries_result(app_result);
        Ok(rpc_reply)
    }

    fn convert_append_entries_input(rpc_request: ProtoAppendEntriesReq) -> Result<AppendEntriesInput, Status> {
        let leader_previous_log_entry = Self::convert_log_entry_metadata(
            rpc_request.previous_log_entry_term,
            rpc_request.previous_log_entry_index,
        )?;

        let leader_commit_index = Index::from_u64(rpc_request.commit_index);

        let mut new_entries = Vec::with_capacity(rpc_request.new_entries.len());
        for proto_entry in rpc_request.new_entries {
            if proto_entry.term == 0 {
                return Err(Status::invalid_argument("Log entry with term 0"));
            }
            new_entries.push(MutationRecord {
                term: Term::new(proto_entry.term),
                timestamp: proto_entry.timestamp,
                mutation_type: proto_entry.mutation_type,
                payload: Bytes::from(proto_entry.payload),
            })
        }

        Ok(AppendEntriesInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.client_node_id),
            leader_previous_log_entry,
            leader_commit_index,
            new_entries,
        })
    }

    fn convert_log_entry_metadata(log_entry_term: u64, log_entry_index: u64) -> Result<Option<(Term, Index)>, Status> {
        match (log_entry_term, log_entry_index) {
            (0, 0) => Ok(None),
            (0, _) => Err(Status::invalid_argument(
                "PreviousLogEntryTerm 0 and PreviousLogEntryIndex non-0",
            )),
            (_, 0) => Err(Status::invalid_argument(
                "PreviousLogEntryIndex 0 and PreviousLogEntryTerm non-0",
            )),
            (term, index) => Ok(Some((Term::new(term), Index::new(index)))),
        }
    }

    fn convert_append_entries_result(
        app_result: Result<AppendEntriesOutput, AppendEntriesError>,
    ) -> ProtoAppendEntriesResult {
        let append_error = |err: proto_append_entries_error::Err| ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(err),
            })),
        };

        match app_result {
            Ok(_) => ProtoAppendEntriesResult {
                result: Some(proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {})),
            },
            Err(AppendEntriesError::ClientNotInCluster) => append_error(
                proto_append_entries_error::Err::ClientNotInCluster(ProtoClientNotInCluster {}),
            ),
            Err(AppendEntriesError::ClientTermOutOfDate(term_info)) => {
                append_error(proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                }))
            }
            Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index }) => append_error(
                proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_index: last_log_index.map(|i| i.as_u64()).unwrap_or(0),
                }),
            ),
            Err(AppendEntriesError::ServerIoError(_)) => {
                append_error(proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                    message: "Local IO failure".to_string(),
                }))
            }
            Err(AppendEntriesError::ActorExited) => {
                append_error(proto_append_entries_error::Err::ServerFault(ProtoServerFault {
                    message: "Server internal replica task has exited".to_string(),
                }))
            }
        }
    }

    async fn handle_install_snapshot(
        &self,
        rpc_request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResult, Status> {
        let snapshot_id = Index::from_u64(rpc_request.snapshot_id)
            .ok_or_else(|| Status::invalid_argument("SnapshotId 0"))?;
        let app_input = InstallSnapshotInput {
            leader_term: Term::new(rpc_request.term),
            leader_id: ReplicaId::new(rpc_request.client_node_id),
            snapshot_id,
        };
        let app_result = self.local_replica.install_snapshot(app_input).await;
        Ok(Self::convert_install_snapshot_result(app_result))
    }

    fn convert_install_snapshot_result(
        app_result: Result<InstallSnapshotOutput, InstallSnapshotError>,
    ) -> ProtoInstallSnapshotResult {
        let install_error = |err: proto_install_snapshot_error::Err| ProtoInstallSnapshotResult {
            result: Some(proto_install_snapshot_result::Result::Err(ProtoInstallSnapshotError {
                err: Some(err),
            })),
        };

        match app_result {
            Ok(output) => ProtoInstallSnapshotResult {
                result: Some(proto_install_snapshot_result::Result::Ok(ProtoInstallSnapshotSuccess {
                    installed: output.installed,
                    last_included_index: output.last_included_index.map(|i| i.as_u64()).unwrap_or(0),
                })),
            },
            Err(InstallSnapshotError::ClientNotInCluster) => install_error(
                proto_install_snapshot_error::Err::ClientNotInCluster(ProtoClientNotInCluster {}),
            ),
            Err(InstallSnapshotError::ClientTermOutOfDate(term_info)) => {
                install_error(proto_install_snapshot_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: term_info.current_term.as_u64(),
                }))
            }
            Err(InstallSnapshotError::ServerIoError(_)) => {
                install_error(proto_install_snapshot_error::Err::ServerFault(ProtoServerFault {
                    message: "Local IO failure".to_string(),
                }))
            }
            Err(InstallSnapshotError::ActorExited) => {
                install_error(proto_install_snapshot_error::Err::ServerFault(ProtoServerFault {
                    message: "Server internal replica task has exited".to_string(),
                }))
            }
        }
    }

    async fn handle_get_latest_snapshot_id(
        &self,
        rpc_request: ProtoGetLatestSnapshotIdReq,
    ) -> Result<ProtoGetLatestSnapshotIdResult, Status> {
        let store = self.snapshot_store.clone();
        let max_snapshot_id = Index::from_u64(rpc_request.max_snapshot_id);
        let latest = tokio::task::spawn_blocking(move || store.latest_snapshot_id(max_snapshot_id))
            .await
            .map_err(|e| Status::internal(e.to_string()))?
            .map_err(|e| Status::internal(e.to_string()))?;

        Ok(ProtoGetLatestSnapshotIdResult {
            snapshot_id: latest.map(|i| i.as_u64()).unwrap_or(0),
        })
    }

    async fn handle_read_snapshot(&self, rpc_request: ProtoReadSnapshotReq) -> Result<ProtoReadSnapshotResult, Status> {
        let read_error = |err: proto_read_snapshot_error::Err| ProtoReadSnapshotResult {
            result: Some(proto_read_snapshot_result::Result::Err(ProtoReadSnapshotError {
                err: Some(err),
            })),
        };
        let snapshot_id = match Index::from_u64(rpc_request.snapshot_id) {
            Some(snapshot_id) => snapshot_id,
            None => return Ok(read_error(proto_read_snapshot_error::Err::NoSuchSnapshot(ProtoNoSuchSnapshot {}))),
        };

        let store = self.snapshot_store.clone();
        let block = tokio::task::spawn_blocking(move || {
            store.read_block(snapshot_id, rpc_request.offset, rpc_request.length)
        })
        .await
        .map_err(|e| Status::internal(e.to_string()))?;

        Ok(match block {
            Ok(Some(block)) => ProtoReadSnapshotResult {
                result: Some(proto_read_snapshot_result::Result::Ok(ProtoSnapshotBlock {
                    data: block.data,
                    total_length: block.total_length,
                })),
            },
            Ok(None) => read_error(proto_read_snapshot_error::Err::NoSuchSnapshot(ProtoNoSuchSnapshot {})),
            Err(e) => {
                slog::warn!(self.logger, "Failed to read snapshot block: {:?}", e; "SnapshotId" => ?snapshot_id);
                read_error(proto_read_snapshot_error::Err::ServerFault(ProtoServerFault {
                    message: "Local IO failure".to_string(),
                }))
            }
        })
    }

    async fn handle_heartbeat(&self, rpc_request: ProtoNodeHeartbeatReq) -> Result<ProtoNodeHeartbeatResult, Status> {
        let request = ReqExecNodeHeartbeat {
            node_id: rpc_request.node_id,
            jobs: rpc_request
                .job_statuses
                .into_iter()
                .map(|status| ExecJobStatus {
                    job_id: status.job_id,
                    state: status.state,
                })
                .collect(),
            resource_limits: rpc_request.resource_limits.map(convert_proto_resources),
        };

        let committer: &dyn MutationCommitter = &self.local_replica;
        let app_result = self
            .heartbeat_gate
            .commit_heartbeat(committer, EXEC_NODE_HEARTBEAT, encode_message(&request))
            .await;
        Ok(Self::convert_heartbeat_result(app_result))
    }

    fn convert_heartbeat_result(app_result: Result<RspExecNodeHeartbeat, HeartbeatError>) -> ProtoNodeHeartbeatResult {
        let heartbeat_error = |err: proto_node_heartbeat_error::Err| ProtoNodeHeartbeatResult {
            result: Some(proto_node_heartbeat_result::Result::Err(ProtoNodeHeartbeatError {
                err: Some(err),
            })),
        };

        let rsp = match app_result {
            Ok(rsp) => rsp,
            Err(HeartbeatError::Throttled) => {
                return heartbeat_error(proto_node_heartbeat_error::Err::Throttled(ProtoThrottled {}))
            }
            Err(HeartbeatError::Commit(CommitMutationError::LeaderRedirect(leader))) => {
                return heartbeat_error(proto_node_heartbeat_error::Err::NotLeader(ProtoNotLeader {
                    leader_id: leader.replica_id.into_inner(),
                }))
            }
            Err(HeartbeatError::Commit(CommitMutationError::NoLeader)) => {
                return heartbeat_error(proto_node_heartbeat_error::Err::NotLeader(ProtoNotLeader {
                    leader_id: String::new(),
                }))
            }
            Err(e) => {
                return heartbeat_error(proto_node_heartbeat_error::Err::ServerFault(ProtoServerFault {
                    message: e.to_string(),
                }))
            }
        };

        ProtoNodeHeartbeatResult {
            result: Some(proto_node_heartbeat_result::Result::Ok(ProtoNodeHeartbeatSuccess {
                disable_jobs: rsp.disable_jobs,
                jobs_to_start: rsp
                    .jobs_to_start
                    .into_iter()
                    .map(|job| ProtoStartJob {
                        job_id: job.job_id,
                        operation_id: job.operation_id,
                        resources: job.resources.map(convert_resources),
                    })
                    .collect(),
                jobs_to_abort: rsp.jobs_to_abort,
            })),
        }
    }
}

fn convert_proto_resources(r: ProtoResources) -> Resources {
    Resources {
        user_slots: r.user_slots,
        cpu: r.cpu,
        memory: r.memory,
        disk_quota: r.disk_quota,
        gpu: r.gpu,
    }
}

fn convert_resources(r: Resources) -> ProtoResources {
    ProtoResources {
        user_slots: r.user_slots,
        cpu: r.cpu,
        memory: r.memory,
        disk_quota: r.disk_quota,
        gpu: r.gpu,
    }
}

#[async_trait::async_trait]
impl GrpcHydra for RpcServer {
    async fn request_vote(
        &self,
        rpc_request_wrapped: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_request_vote(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn append_entries(
        &self,
        rpc_request_wrapped: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - AppendEntries with {} entries", rpc_request.new_entries.len());
        let rpc_result = self.handle_append_entries(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn install_snapshot(
        &self,
        rpc_request_wrapped: Request<ProtoInstallSnapshotReq>,
    ) -> Result<Response<ProtoInstallSnapshotResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_install_snapshot(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }

    async fn get_latest_snapshot_id(
        &self,
        rpc_request_wrapped: Request<ProtoGetLatestSnapshotIdReq>,
    ) -> Result<Response<ProtoGetLatestSnapshotIdResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();
        self.handle_get_latest_snapshot_id(rpc_request).await.map(Response::new)
    }

    async fn read_snapshot(
        &self,
        rpc_request_wrapped: Request<ProtoReadSnapshotReq>,
    ) -> Result<Response<ProtoReadSnapshotResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        self.handle_read_snapshot(rpc_request).await.map(Response::new)
    }

    async fn heartbeat(
        &self,
        rpc_request_wrapped: Request<ProtoNodeHeartbeatReq>,
    ) -> Result<Response<ProtoNodeHeartbeatResult>, Status> {
        let rpc_request = rpc_request_wrapped.into_inner();

        slog::debug!(self.logger, "ServerWire - {:?}", rpc_request);
        let rpc_result = self.handle_heartbeat(rpc_request).await;
        slog::debug!(self.logger, "ServerWire - {:?}", rpc_result);

        rpc_result.map(Response::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automaton::MutationError;
    use crate::replica::LeaderRedirectInfo;
    use crate::payloads::StartedJob;
    use std::net::Ipv4Addr;

    #[test]
    fn log_entry_metadata_must_be_all_or_nothing() {
        assert_eq!(RpcServer::convert_log_entry_metadata(0, 0).unwrap(), None);
        assert!(RpcServer::convert_log_entry_metadata(0, 3).is_err());
        assert!(RpcServer::convert_log_entry_metadata(3, 0).is_err());
        assert_eq!(
            RpcServer::convert_log_entry_metadata(2, 7).unwrap(),
            Some((Term::new(2), Index::new(7)))
        );
    }

    fn heartbeat_err(result: ProtoNodeHeartbeatResult) -> proto_node_heartbeat_error::Err {
        match result.result {
            Some(proto_node_heartbeat_result::Result::Err(ProtoNodeHeartbeatError { err: Some(err) })) => err,
            other => panic!("Expected an error, got {:?}", other),
        }
    }

    #[test]
    fn heartbeat_errors_map_to_wire_errors() {
        let throttled = RpcServer::convert_heartbeat_result(Err(HeartbeatError::Throttled));
        assert!(matches!(heartbeat_err(throttled), proto_node_heartbeat_error::Err::Throttled(_)));

        let redirect = RpcServer::convert_heartbeat_result(Err(HeartbeatError::Commit(
            CommitMutationError::LeaderRedirect(LeaderRedirectInfo {
                replica_id: ReplicaId::new("r2"),
                ip: Ipv4Addr::LOCALHOST,
                port: 4000,
            }),
        )));
        match heartbeat_err(redirect) {
            proto_node_heartbeat_error::Err::NotLeader(not_leader) => assert_eq!(not_leader.leader_id, "r2"),
            other => panic!("Expected NotLeader, got {:?}", other),
        }

        let rejected = RpcServer::convert_heartbeat_result(Err(HeartbeatError::Rejected(MutationError::new(
            2001,
            "No such exec node n9",
        ))));
        assert!(matches!(heartbeat_err(rejected), proto_node_heartbeat_error::Err::ServerFault(_)));
    }

    #[test]
    fn heartbeat_response_is_translated() {
        let rsp = RspExecNodeHeartbeat {
            disable_jobs: true,
            jobs_to_start: vec![StartedJob {
                job_id: "op/1".into(),
                operation_id: "op".into(),
                resources: Some(Resources {
                    user_slots: 1,
                    cpu: 2,
                    ..Default::default()
                }),
            }],
            jobs_to_abort: vec!["op/0".into()],
        };
        let result = RpcServer::convert_heartbeat_result(Ok(rsp));

        match result.result {
            Some(proto_node_heartbeat_result::Result::Ok(ok)) => {
                assert!(ok.disable_jobs);
                assert_eq!(ok.jobs_to_start[0].job_id, "op/1");
                assert_eq!(ok.jobs_to_start[0].resources.as_ref().map(|r| r.cpu), Some(2));
                assert_eq!(ok.jobs_to_abort, vec!["op/0".to_string()]);
            }
            other => panic!("Expected success, got {:?}", other),
        }
    }
}
