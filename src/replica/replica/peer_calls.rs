use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_install_snapshot_error,
    proto_install_snapshot_result, proto_request_vote_error, proto_request_vote_result, ProtoAppendEntriesReq,
    ProtoAppendEntriesResult, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult, ProtoRequestVoteReq,
    ProtoRequestVoteResult,
};
use crate::replica::local_state::Term;
use crate::replica::peer_client::PeerClient;
use crate::replica::peers::ReplicaId;
use crate::replica::replica_api::{
    ReplicationAck, ReplicationDescriptor, ReplicationReplyError, ReplicationReplyFromPeer, RequestVoteReplyFromPeer,
    RequestVoteResult,
};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tonic::Status;

type RpcReply<T> = Result<Result<T, Status>, Elapsed>;

#[allow(clippy::too_many_arguments)]
pub(super) async fn call_peer_request_vote(
    logger: slog::Logger,
    peer_client: PeerClient,
    peer_id: ReplicaId,
    rpc_request: ProtoRequestVoteReq,
    rpc_timeout: Duration,
    delay: Option<Duration>,
    callback: WeakActorClient,
    term: Term,
) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }

    slog::debug!(logger, "ClientWire - {:?}", rpc_request);
    let rpc_reply = tokio::time::timeout(rpc_timeout, peer_client.request_vote(rpc_request)).await;
    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

    let callback_input = RequestVoteReplyFromPeer {
        peer_id,
        term,
        result: convert_request_vote_rpc_reply(&logger, rpc_reply),
    };

    callback.notify_request_vote_reply(callback_input).await;
}

fn convert_request_vote_rpc_reply(
    logger: &slog::Logger,
    rpc_reply: RpcReply<ProtoRequestVoteResult>,
) -> RequestVoteResult {
    match rpc_reply {
        Ok(Ok(rpc_result)) => match rpc_result.result {
            Some(proto_request_vote_result::Result::Ok(success_reply)) => {
                if success_reply.vote_granted {
                    RequestVoteResult::VoteGranted
                } else {
                    RequestVoteResult::VoteNotGranted {
                        peer_term: Term::new(success_reply.current_term),
                    }
                }
            }
            Some(proto_request_vote_result::Result::Err(err)) => match err.err {
                Some(proto_request_vote_error::Err::ServerFault(fault)) => {
                    slog::warn!(logger, "RequestVote Service Fault: {:?}", fault.message);
                    RequestVoteResult::RetryableFailure
                }
                None => RequestVoteResult::MalformedReply,
            },
            None => RequestVoteResult::MalformedReply,
        },
        Ok(Err(rpc_status)) => {
            slog::debug!(logger, "Un-modeled failure from RequestVote RPC call: {:?}", rpc_status);
            RequestVoteResult::RetryableFailure
        }
        Err(_timeout) => RequestVoteResult::RetryableFailure,
    }
}

pub(super) async fn call_peer_append_entries(
    logger: slog::Logger,
    peer_client: PeerClient,
    rpc_request: ProtoAppendEntriesReq,
    rpc_timeout: Duration,
    callback: WeakActorClient,
    descriptor: ReplicationDescriptor,
) {
    slog::debug!(logger, "ClientWire - AppendEntries with {} entries", rpc_request.new_entries.len());
    let rpc_reply = tokio::time::timeout(rpc_timeout, peer_client.append_entries(rpc_request)).await;
    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

    let callback_input = ReplicationReplyFromPeer {
        descriptor,
        result: convert_append_entries_rpc_reply(rpc_reply),
    };

    callback.notify_replication_reply(callback_input).await;
}

fn convert_append_entries_rpc_reply(
    rpc_reply: RpcReply<ProtoAppendEntriesResult>,
) -> Result<ReplicationAck, ReplicationReplyError> {
    let rpc_result = unwrap_rpc_reply(rpc_reply, "AppendEntries")?;
    match rpc_result.result {
        Some(proto_append_entries_result::Result::Ok(_)) => Ok(ReplicationAck::Appended),
        Some(proto_append_entries_result::Result::Err(err)) => match err.err {
            Some(proto_append_entries_error::Err::ServerFault(payload)) => Err(
                ReplicationReplyError::RetryableFailure(format!("Explicit server fault: {:?}", payload.message)),
            ),
            Some(proto_append_entries_error::Err::StaleTerm(payload)) => Err(ReplicationReplyError::StaleTerm {
                new_term: Term::new(payload.current_term),
            }),
            Some(proto_append_entries_error::Err::MissingLog(payload)) => {
                Err(ReplicationReplyError::PeerMissingPreviousLogEntry {
                    last_log_index: Index::from_u64(payload.last_log_index),
                })
            }
            Some(proto_append_entries_error::Err::ClientNotInCluster(_)) => {
                // Retry in case peer is out of date. Not expecting this in practice.
                Err(ReplicationReplyError::RetryableFailure(
                    "Peer doesn't think we're in the cluster".into(),
                ))
            }
            None => Err(ReplicationReplyError::RetryableFailure(
                "Malformed AppendEntries Err".into(),
            )),
        },
        None => Err(ReplicationReplyError::RetryableFailure(
            "Malformed AppendEntries Result".into(),
        )),
    }
}

pub(super) async fn call_peer_install_snapshot(
    logger: slog::Logger,
    peer_client: PeerClient,
    rpc_request: ProtoInstallSnapshotReq,
    rpc_timeout: Duration,
    callback: WeakActorClient,
    descriptor: ReplicationDescriptor,
) {
    slog::debug!(logger, "ClientWire - {:?}", rpc_request);
    let rpc_reply = tokio::time::timeout(rpc_timeout, peer_client.install_snapshot(rpc_request)).await;
    slog::debug!(logger, "ClientWire - {:?}", rpc_reply);

    let callback_input = ReplicationReplyFromPeer {
        descriptor,
        result: convert_install_snapshot_rpc_reply(rpc_reply),
    };

    callback.notify_replication_reply(callback_input).await;
}

fn convert_install_snapshot_rpc_reply(
    rpc_reply: RpcReply<ProtoInstallSnapshotResult>,
) -> Result<ReplicationAck, ReplicationReplyError> {
    let rpc_result = unwrap_rpc_reply(rpc_reply, "InstallSnapshot")?;
    match rpc_result.result {
        Some(proto_install_snapshot_result::Result::Ok(success)) => {
            if success.installed {
                Ok(ReplicationAck::SnapshotInstalled {
                    last_included_index: Index::from_u64(success.last_included_index),
                })
            } else {
                Ok(ReplicationAck::SnapshotInstalling)
            }
        }
        Some(proto_install_snapshot_result::Result::Err(err)) => match err.err {
            Some(proto_install_snapshot_error::Err::ServerFault(payload)) => Err(
                ReplicationReplyError::RetryableFailure(format!("Explicit server fault: {:?}", payload.message)),
            ),
            Some(proto_install_snapshot_error::Err::StaleTerm(payload)) => Err(ReplicationReplyError::StaleTerm {
                new_term: Term::new(payload.current_term),
            }),
            Some(proto_install_snapshot_error::Err::ClientNotInCluster(_)) => Err(
                ReplicationReplyError::RetryableFailure("Peer doesn't think we're in the cluster".into()),
            ),
            None => Err(ReplicationReplyError::RetryableFailure(
                "Malformed InstallSnapshot Err".into(),
            )),
        },
        None => Err(ReplicationReplyError::RetryableFailure(
            "Malformed InstallSnapshot Result".into(),
        )),
    }
}

fn unwrap_rpc_reply<T>(rpc_reply: RpcReply<T>, rpc_name: &str) -> Result<T, ReplicationReplyError> {
    match rpc_reply {
        Ok(Ok(rpc_result)) => Ok(rpc_result),
        Ok(Err(rpc_status)) => Err(ReplicationReplyError::RetryableFailure(format!(
            "Un-modeled failure from {} RPC call: {:?}",
            rpc_name, rpc_status
        ))),
        Err(_timeout) => Err(ReplicationReplyError::RetryableFailure(format!(
            "Timed out calling {}",
            rpc_name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grpc::{
        ProtoAppendEntriesError, ProtoAppendEntriesSuccess, ProtoClientStaleTerm, ProtoInstallSnapshotSuccess,
        ProtoRequestVoteSuccess, ProtoServerMissingPreviousLog,
    };

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn append_error(err: proto_append_entries_error::Err) -> RpcReply<ProtoAppendEntriesResult> {
        Ok(Ok(ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(err),
            })),
        }))
    }

    #[test]
    fn vote_rejection_carries_peer_term() {
        let reply = Ok(Ok(ProtoRequestVoteResult {
            result: Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess {
                vote_granted: false,
                current_term: 7,
            })),
        }));
        assert!(matches!(
            convert_request_vote_rpc_reply(&logger(), reply),
            RequestVoteResult::VoteNotGranted { peer_term } if peer_term == Term::new(7)
        ));

        let unavailable = Ok(Err(Status::unavailable("down")));
        assert!(matches!(
            convert_request_vote_rpc_reply(&logger(), unavailable),
            RequestVoteResult::RetryableFailure
        ));
    }

    #[test]
    fn append_entries_errors_map_to_replication_errors() {
        let ok = Ok(Ok(ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {})),
        }));
        assert!(matches!(convert_append_entries_rpc_reply(ok), Ok(ReplicationAck::Appended)));

        let stale = append_error(proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
            current_term: 4,
        }));
        assert!(matches!(
            convert_append_entries_rpc_reply(stale),
            Err(ReplicationReplyError::StaleTerm { new_term }) if new_term == Term::new(4)
        ));

        // 0 means the peer's log is empty.
        let empty = append_error(proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
            last_log_index: 0,
        }));
        assert!(matches!(
            convert_append_entries_rpc_reply(empty),
            Err(ReplicationReplyError::PeerMissingPreviousLogEntry { last_log_index: None })
        ));

        let malformed = Ok(Ok(ProtoAppendEntriesResult { result: None }));
        assert!(matches!(
            convert_append_entries_rpc_reply(malformed),
            Err(ReplicationReplyError::RetryableFailure(_))
        ));
    }

    #[test]
    fn install_snapshot_distinguishes_installing_from_installed() {
        let reply = |installed, last_included_index| {
            Ok(Ok(ProtoInstallSnapshotResult {
                result: Some(proto_install_snapshot_result::Result::Ok(ProtoInstallSnapshotSuccess {
                    installed,
                    last_included_index,
                })),
            }))
        };

        assert!(matches!(
            convert_install_snapshot_rpc_reply(reply(false, 0)),
            Ok(ReplicationAck::SnapshotInstalling)
        ));
        assert!(matches!(
            convert_install_snapshot_rpc_reply(reply(true, 12)),
            Ok(ReplicationAck::SnapshotInstalled { last_included_index: Some(i) }) if i == Index::new(12)
        ));
    }
}
