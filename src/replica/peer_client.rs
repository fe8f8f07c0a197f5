use crate::commitlog::Index;
use crate::grpc::grpc_hydra_client::GrpcHydraClient;
use crate::grpc::{
    proto_read_snapshot_error, proto_read_snapshot_result, ProtoAppendEntriesReq, ProtoAppendEntriesResult,
    ProtoGetLatestSnapshotIdReq, ProtoInstallSnapshotReq, ProtoInstallSnapshotResult, ProtoReadSnapshotReq,
    ProtoRequestVoteReq, ProtoRequestVoteResult,
};
use crate::replica::peers::{MemberInfo, ReplicaId};
use crate::snapshot::{SnapshotBlock, SnapshotPeer, SnapshotPeerError};
use tonic::codegen::http::uri;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

#[derive(Debug, thiserror::Error)]
pub enum PeerConnectError {
    #[error("Invalid peer uri")]
    InvalidUri(#[from] uri::InvalidUri),
    #[error("Failed to set up peer channel")]
    Transport(#[from] tonic::transport::Error),
}

/// gRPC client to one peer. Cheap to clone; clones share the underlying channel.
#[derive(Clone)]
pub(crate) struct PeerClient {
    peer_id: ReplicaId,
    inner: GrpcHydraClient<Channel>,
}

impl PeerClient {
    pub(crate) fn new(member: &MemberInfo) -> Result<Self, PeerConnectError> {
        let ip_octets = member.ip.octets();
        let url = format!(
            "http://{}.{}.{}.{}:{}",
            ip_octets[0], ip_octets[1], ip_octets[2], ip_octets[3], member.port
        );
        let channel = Endpoint::from_shared(url)?.connect_lazy()?;

        Ok(PeerClient {
            peer_id: member.replica_id.clone(),
            inner: GrpcHydraClient::new(channel),
        })
    }

    pub(crate) async fn request_vote(&self, request: ProtoRequestVoteReq) -> Result<ProtoRequestVoteResult, Status> {
        let mut client = self.inner.clone();
        client.request_vote(request).await.map(|r| r.into_inner())
    }

    pub(crate) async fn append_entries(
        &self,
        request: ProtoAppendEntriesReq,
    ) -> Result<ProtoAppendEntriesResult, Status> {
        let mut client = self.inner.clone();
        client.append_entries(request).await.map(|r| r.into_inner())
    }

    pub(crate) async fn install_snapshot(
        &self,
        request: ProtoInstallSnapshotReq,
    ) -> Result<ProtoInstallSnapshotResult, Status> {
        let mut client = self.inner.clone();
        client.install_snapshot(request).await.map(|r| r.into_inner())
    }
}

#[async_trait::async_trait]
impl SnapshotPeer for PeerClient {
    fn peer_id(&self) -> &str {
        self.peer_id.as_str()
    }

    async fn latest_snapshot_id(&self, max_snapshot_id: Option<Index>) -> Result<Option<Index>, SnapshotPeerError> {
        let mut client = self.inner.clone();
        let request = ProtoGetLatestSnapshotIdReq {
            max_snapshot_id: max_snapshot_id.map(|i| i.as_u64()).unwrap_or(0),
        };
        let reply = client
            .get_latest_snapshot_id(request)
            .await
            .map_err(|status| SnapshotPeerError::Rpc(status.to_string()))?
            .into_inner();

        Ok(Index::from_u64(reply.snapshot_id))
    }

    async fn read_snapshot(
        &self,
        snapshot_id: Index,
        offset: u64,
        length: u64,
    ) -> Result<Option<SnapshotBlock>, SnapshotPeerError> {
        let mut client = self.inner.clone();
        let request = ProtoReadSnapshotReq {
            snapshot_id: snapshot_id.as_u64(),
            offset,
            length,
        };
        let reply = client
            .read_snapshot(request)
            .await
            .map_err(|status| SnapshotPeerError::Rpc(status.to_string()))?
            .into_inner();

        match reply.result {
            Some(proto_read_snapshot_result::Result::Ok(block)) => Ok(Some(SnapshotBlock {
                data: block.data,
                total_length: block.total_length,
            })),
            Some(proto_read_snapshot_result::Result::Err(err)) => match err.err {
                Some(proto_read_snapshot_error::Err::NoSuchSnapshot(_)) => Ok(None),
                Some(proto_read_snapshot_error::Err::ServerFault(fault)) => Err(SnapshotPeerError::Rpc(fault.message)),
                None => Err(SnapshotPeerError::Rpc("Malformed ReadSnapshot error".to_string())),
            },
            None => Err(SnapshotPeerError::Rpc("Malformed ReadSnapshot reply".to_string())),
        }
    }
}
