// -- shared --

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoServerFault {
    #[prost(string, tag = "1")]
    pub message: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoClientStaleTerm {
    #[prost(uint64, tag = "1")]
    pub current_term: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoClientNotInCluster {}
// -- RequestVote --

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteReq {
    #[prost(string, tag = "1")]
    pub client_node_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(uint64, tag = "3")]
    pub last_log_entry_index: u64,
    #[prost(uint64, tag = "4")]
    pub last_log_entry_term: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteResult {
    #[prost(oneof = "proto_request_vote_result::Result", tags = "1, 2")]
    pub result: ::core::option::Option<proto_request_vote_result::Result>,
}
/// Nested message and enum types in `ProtoRequestVoteResult`.
pub mod proto_request_vote_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoRequestVoteSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoRequestVoteError),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteSuccess {
    #[prost(bool, tag = "1")]
    pub vote_granted: bool,
    /// Lets a candidate with a stale term step down.
    #[prost(uint64, tag = "2")]
    pub current_term: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoRequestVoteError {
    #[prost(oneof = "proto_request_vote_error::Err", tags = "1")]
    pub err: ::core::option::Option<proto_request_vote_error::Err>,
}
/// Nested message and enum types in `ProtoRequestVoteError`.
pub mod proto_request_vote_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag = "1")]
        ServerFault(super::ProtoServerFault),
    }
}
// -- AppendEntries --

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoLogEntry {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub timestamp: u64,
    #[prost(string, tag = "3")]
    pub mutation_type: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesReq {
    #[prost(string, tag = "1")]
    pub client_node_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(uint64, tag = "3")]
    pub commit_index: u64,
    #[prost(uint64, tag = "4")]
    pub previous_log_entry_term: u64,
    #[prost(uint64, tag = "5")]
    pub previous_log_entry_index: u64,
    #[prost(message, repeated, tag = "6")]
    pub new_entries: ::prost::alloc::vec::Vec<ProtoLogEntry>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesResult {
    #[prost(oneof = "proto_append_entries_result::Result", tags = "1, 2")]
    pub result: ::core::option::Option<proto_append_entries_result::Result>,
}
/// Nested message and enum types in `ProtoAppendEntriesResult`.
pub mod proto_append_entries_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoAppendEntriesSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoAppendEntriesError),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesSuccess {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoServerMissingPreviousLog {
    /// 0 if the server's log is empty.
    #[prost(uint64, tag = "1")]
    pub last_log_index: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoAppendEntriesError {
    #[prost(oneof = "proto_append_entries_error::Err", tags = "1, 2, 3, 4")]
    pub err: ::core::option::Option<proto_append_entries_error::Err>,
}
/// Nested message and enum types in `ProtoAppendEntriesError`.
pub mod proto_append_entries_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag = "1")]
        ServerFault(super::ProtoServerFault),
        #[prost(message, tag = "2")]
        StaleTerm(super::ProtoClientStaleTerm),
        #[prost(message, tag = "3")]
        MissingLog(super::ProtoServerMissingPreviousLog),
        #[prost(message, tag = "4")]
        ClientNotInCluster(super::ProtoClientNotInCluster),
    }
}
// -- InstallSnapshot --

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotReq {
    #[prost(string, tag = "1")]
    pub client_node_id: ::prost::alloc::string::String,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(uint64, tag = "3")]
    pub snapshot_id: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotResult {
    #[prost(oneof = "proto_install_snapshot_result::Result", tags = "1, 2")]
    pub result: ::core::option::Option<proto_install_snapshot_result::Result>,
}
/// Nested message and enum types in `ProtoInstallSnapshotResult`.
pub mod proto_install_snapshot_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoInstallSnapshotSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoInstallSnapshotError),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotSuccess {
    /// false while the download is still running.
    #[prost(bool, tag = "1")]
    pub installed: bool,
    #[prost(uint64, tag = "2")]
    pub last_included_index: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoInstallSnapshotError {
    #[prost(oneof = "proto_install_snapshot_error::Err", tags = "1, 2, 3")]
    pub err: ::core::option::Option<proto_install_snapshot_error::Err>,
}
/// Nested message and enum types in `ProtoInstallSnapshotError`.
pub mod proto_install_snapshot_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag = "1")]
        ServerFault(super::ProtoServerFault),
        #[prost(message, tag = "2")]
        StaleTerm(super::ProtoClientStaleTerm),
        #[prost(message, tag = "3")]
        ClientNotInCluster(super::ProtoClientNotInCluster),
    }
}
// -- Snapshot transfer --

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoGetLatestSnapshotIdReq {
    /// 0 means unbounded.
    #[prost(uint64, tag = "1")]
    pub max_snapshot_id: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoGetLatestSnapshotIdResult {
    /// 0 means no snapshot.
    #[prost(uint64, tag = "1")]
    pub snapshot_id: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoReadSnapshotReq {
    #[prost(uint64, tag = "1")]
    pub snapshot_id: u64,
    #[prost(uint64, tag = "2")]
    pub offset: u64,
    #[prost(uint64, tag = "3")]
    pub length: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoReadSnapshotResult {
    #[prost(oneof = "proto_read_snapshot_result::Result", tags = "1, 2")]
    pub result: ::core::option::Option<proto_read_snapshot_result::Result>,
}
/// Nested message and enum types in `ProtoReadSnapshotResult`.
pub mod proto_read_snapshot_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoSnapshotBlock),
        #[prost(message, tag = "2")]
        Err(super::ProtoReadSnapshotError),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoSnapshotBlock {
    #[prost(bytes = "vec", tag = "1")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub total_length: u64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoNoSuchSnapshot {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoReadSnapshotError {
    #[prost(oneof = "proto_read_snapshot_error::Err", tags = "1, 2")]
    pub err: ::core::option::Option<proto_read_snapshot_error::Err>,
}
/// Nested message and enum types in `ProtoReadSnapshotError`.
pub mod proto_read_snapshot_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag = "1")]
        ServerFault(super::ProtoServerFault),
        #[prost(message, tag = "2")]
        NoSuchSnapshot(super::ProtoNoSuchSnapshot),
    }
}
// -- Exec node heartbeat --

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoResources {
    #[prost(int64, tag = "1")]
    pub user_slots: i64,
    #[prost(int64, tag = "2")]
    pub cpu: i64,
    #[prost(int64, tag = "3")]
    pub memory: i64,
    #[prost(int64, tag = "4")]
    pub disk_quota: i64,
    #[prost(int64, tag = "5")]
    pub gpu: i64,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoJobStatus {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
    /// 1 = Running, 2 = Completed, 3 = Failed, 4 = Aborted
    #[prost(uint32, tag = "2")]
    pub state: u32,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoNodeHeartbeatReq {
    #[prost(string, tag = "1")]
    pub node_id: ::prost::alloc::string::String,
    #[prost(message, repeated, tag = "2")]
    pub job_statuses: ::prost::alloc::vec::Vec<ProtoJobStatus>,
    #[prost(message, optional, tag = "3")]
    pub resource_limits: ::core::option::Option<ProtoResources>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoStartJob {
    #[prost(string, tag = "1")]
    pub job_id: ::prost::alloc::string::String,
    #[prost(string, tag = "2")]
    pub operation_id: ::prost::alloc::string::String,
    #[prost(message, optional, tag = "3")]
    pub resources: ::core::option::Option<ProtoResources>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoNodeHeartbeatSuccess {
    #[prost(bool, tag = "1")]
    pub disable_jobs: bool,
    #[prost(message, repeated, tag = "2")]
    pub jobs_to_start: ::prost::alloc::vec::Vec<ProtoStartJob>,
    #[prost(string, repeated, tag = "3")]
    pub jobs_to_abort: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoNotLeader {
    #[prost(string, tag = "1")]
    pub leader_id: ::prost::alloc::string::String,
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoThrottled {}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoNodeHeartbeatError {
    #[prost(oneof = "proto_node_heartbeat_error::Err", tags = "1, 2, 3")]
    pub err: ::core::option::Option<proto_node_heartbeat_error::Err>,
}
/// Nested message and enum types in `ProtoNodeHeartbeatError`.
pub mod proto_node_heartbeat_error {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Err {
        #[prost(message, tag = "1")]
        ServerFault(super::ProtoServerFault),
        #[prost(message, tag = "2")]
        NotLeader(super::ProtoNotLeader),
        #[prost(message, tag = "3")]
        Throttled(super::ProtoThrottled),
    }
}
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ProtoNodeHeartbeatResult {
    #[prost(oneof = "proto_node_heartbeat_result::Result", tags = "1, 2")]
    pub result: ::core::option::Option<proto_node_heartbeat_result::Result>,
}
/// Nested message and enum types in `ProtoNodeHeartbeatResult`.
pub mod proto_node_heartbeat_result {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Result {
        #[prost(message, tag = "1")]
        Ok(super::ProtoNodeHeartbeatSuccess),
        #[prost(message, tag = "2")]
        Err(super::ProtoNodeHeartbeatError),
    }
}
#[doc = r" Generated client implementations."]
pub mod grpc_hydra_client {
    #![allow(unused_variables, dead_code, missing_docs)]
    use tonic::codegen::*;
    #[doc = " Peer-to-peer protocol of a replicated cell, plus the exec node heartbeat endpoint served by the"]
    #[doc = " cell's leader."]
    pub struct GrpcHydraClient<T> {
        inner: tonic::client::Grpc<T>,
    }
    impl GrpcHydraClient<tonic::transport::Channel> {
        #[doc = r" Attempt to create a new client by connecting to a given endpoint."]
        pub async fn connect<D>(dst: D) -> Result<Self, tonic::transport::Error>
        where
            D: std::convert::TryInto<tonic::transport::Endpoint>,
            D::Error: Into<StdError>,
        {
            let conn = tonic::transport::Endpoint::new(dst)?.connect().await?;
            Ok(Self::new(conn))
        }
    }
    impl<T> GrpcHydraClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::ResponseBody: Body + HttpBody + Send + 'static,
        T::Error: Into<StdError>,
        <T::ResponseBody as HttpBody>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            let inner = tonic::client::Grpc::new(inner);
            Self { inner }
        }
        pub fn with_interceptor(inner: T, interceptor: impl Into<tonic::Interceptor>) -> Self {
            let inner = tonic::client::Grpc::with_interceptor(inner, interceptor);
            Self { inner }
        }
        pub async fn request_vote(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoRequestVoteReq>,
        ) -> Result<tonic::Response<super::ProtoRequestVoteResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/hydra.GrpcHydra/RequestVote");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn append_entries(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoAppendEntriesReq>,
        ) -> Result<tonic::Response<super::ProtoAppendEntriesResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/hydra.GrpcHydra/AppendEntries");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn install_snapshot(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoInstallSnapshotReq>,
        ) -> Result<tonic::Response<super::ProtoInstallSnapshotResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/hydra.GrpcHydra/InstallSnapshot");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn get_latest_snapshot_id(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoGetLatestSnapshotIdReq>,
        ) -> Result<tonic::Response<super::ProtoGetLatestSnapshotIdResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/hydra.GrpcHydra/GetLatestSnapshotId");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn read_snapshot(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoReadSnapshotReq>,
        ) -> Result<tonic::Response<super::ProtoReadSnapshotResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/hydra.GrpcHydra/ReadSnapshot");
            self.inner.unary(request.into_request(), path, codec).await
        }
        pub async fn heartbeat(
            &mut self,
            request: impl tonic::IntoRequest<super::ProtoNodeHeartbeatReq>,
        ) -> Result<tonic::Response<super::ProtoNodeHeartbeatResult>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/hydra.GrpcHydra/Heartbeat");
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
    impl<T: Clone> Clone for GrpcHydraClient<T> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }
    impl<T> std::fmt::Debug for GrpcHydraClient<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "GrpcHydraClient {{ ... }}")
        }
    }
}
#[doc = r" Generated server implementations."]
pub mod grpc_hydra_server {
    #![allow(unused_variables, dead_code, missing_docs)]
    use tonic::codegen::*;
    #[doc = "Generated trait containing gRPC methods that should be implemented for use with GrpcHydraServer."]
    #[async_trait]
    pub trait GrpcHydra: Send + Sync + 'static {
        async fn request_vote(
            &self,
            request: tonic::Request<super::ProtoRequestVoteReq>,
        ) -> Result<tonic::Response<super::ProtoRequestVoteResult>, tonic::Status>;
        async fn append_entries(
            &self,
            request: tonic::Request<super::ProtoAppendEntriesReq>,
        ) -> Result<tonic::Response<super::ProtoAppendEntriesResult>, tonic::Status>;
        async fn install_snapshot(
            &self,
            request: tonic::Request<super::ProtoInstallSnapshotReq>,
        ) -> Result<tonic::Response<super::ProtoInstallSnapshotResult>, tonic::Status>;
        async fn get_latest_snapshot_id(
            &self,
            request: tonic::Request<super::ProtoGetLatestSnapshotIdReq>,
        ) -> Result<tonic::Response<super::ProtoGetLatestSnapshotIdResult>, tonic::Status>;
        async fn read_snapshot(
            &self,
            request: tonic::Request<super::ProtoReadSnapshotReq>,
        ) -> Result<tonic::Response<super::ProtoReadSnapshotResult>, tonic::Status>;
        async fn heartbeat(
            &self,
            request: tonic::Request<super::ProtoNodeHeartbeatReq>,
        ) -> Result<tonic::Response<super::ProtoNodeHeartbeatResult>, tonic::Status>;
    }
    #[doc = " Peer-to-peer protocol of a replicated cell, plus the exec node heartbeat endpoint served by the"]
    #[doc = " cell's leader."]
    #[derive(Debug)]
    pub struct GrpcHydraServer<T: GrpcHydra> {
        inner: _Inner<T>,
    }
    struct _Inner<T>(Arc<T>, Option<tonic::Interceptor>);
    impl<T: GrpcHydra> GrpcHydraServer<T> {
        pub fn new(inner: T) -> Self {
            let inner = Arc::new(inner);
            let inner = _Inner(inner, None);
            Self { inner }
        }
        pub fn with_interceptor(inner: T, interceptor: impl Into<tonic::Interceptor>) -> Self {
            let inner = Arc::new(inner);
            let inner = _Inner(inner, Some(interceptor.into()));
            Self { inner }
        }
    }
    impl<T, B> Service<http::Request<B>> for GrpcHydraServer<T>
    where
        T: GrpcHydra,
        B: HttpBody + Send + Sync + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = Never;
        type Future = BoxFuture<Self::Response, Self::Error>;
        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            let inner = self.inner.clone();
            match req.uri().path() {
                "/hydra.GrpcHydra/RequestVote" => {
                    #[allow(non_camel_case_types)]
                    struct RequestVoteSvc<T: GrpcHydra>(pub Arc<T>);
                    impl<T: GrpcHydra> tonic::server::UnaryService<super::ProtoRequestVoteReq> for RequestVoteSvc<T> {
                        type Response = super::ProtoRequestVoteResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoRequestVoteReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).request_vote(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = RequestVoteSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/hydra.GrpcHydra/AppendEntries" => {
                    #[allow(non_camel_case_types)]
                    struct AppendEntriesSvc<T: GrpcHydra>(pub Arc<T>);
                    impl<T: GrpcHydra> tonic::server::UnaryService<super::ProtoAppendEntriesReq>
                        for AppendEntriesSvc<T>
                    {
                        type Response = super::ProtoAppendEntriesResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoAppendEntriesReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).append_entries(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = AppendEntriesSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/hydra.GrpcHydra/InstallSnapshot" => {
                    #[allow(non_camel_case_types)]
                    struct InstallSnapshotSvc<T: GrpcHydra>(pub Arc<T>);
                    impl<T: GrpcHydra> tonic::server::UnaryService<super::ProtoInstallSnapshotReq>
                        for InstallSnapshotSvc<T>
                    {
                        type Response = super::ProtoInstallSnapshotResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoInstallSnapshotReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).install_snapshot(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = InstallSnapshotSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/hydra.GrpcHydra/GetLatestSnapshotId" => {
                    #[allow(non_camel_case_types)]
                    struct GetLatestSnapshotIdSvc<T: GrpcHydra>(pub Arc<T>);
                    impl<T: GrpcHydra>
                        tonic::server::UnaryService<super::ProtoGetLatestSnapshotIdReq>
                        for GetLatestSnapshotIdSvc<T>
                    {
                        type Response = super::ProtoGetLatestSnapshotIdResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoGetLatestSnapshotIdReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).get_latest_snapshot_id(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = GetLatestSnapshotIdSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/hydra.GrpcHydra/ReadSnapshot" => {
                    #[allow(non_camel_case_types)]
                    struct ReadSnapshotSvc<T: GrpcHydra>(pub Arc<T>);
                    impl<T: GrpcHydra> tonic::server::UnaryService<super::ProtoReadSnapshotReq> for ReadSnapshotSvc<T> {
                        type Response = super::ProtoReadSnapshotResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoReadSnapshotReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).read_snapshot(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = ReadSnapshotSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                "/hydra.GrpcHydra/Heartbeat" => {
                    #[allow(non_camel_case_types)]
                    struct HeartbeatSvc<T: GrpcHydra>(pub Arc<T>);
                    impl<T: GrpcHydra> tonic::server::UnaryService<super::ProtoNodeHeartbeatReq> for HeartbeatSvc<T> {
                        type Response = super::ProtoNodeHeartbeatResult;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;
                        fn call(
                            &mut self,
                            request: tonic::Request<super::ProtoNodeHeartbeatReq>,
                        ) -> Self::Future {
                            let inner = self.0.clone();
                            let fut = async move { (*inner).heartbeat(request).await };
                            Box::pin(fut)
                        }
                    }
                    let inner = self.inner.clone();
                    let fut = async move {
                        let interceptor = inner.1.clone();
                        let inner = inner.0;
                        let method = HeartbeatSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = if let Some(interceptor) = interceptor {
                            tonic::server::Grpc::with_interceptor(codec, interceptor)
                        } else {
                            tonic::server::Grpc::new(codec)
                        };
                        let res = grpc.unary(method, req).await;
                        Ok(res)
                    };
                    Box::pin(fut)
                }
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", "12")
                        .header("content-type", "application/grpc")
                        .body(tonic::body::BoxBody::empty())
                        .unwrap())
                }),
            }
        }
    }
    impl<T: GrpcHydra> Clone for GrpcHydraServer<T> {
        fn clone(&self) -> Self {
            let inner = self.inner.clone();
            Self { inner }
        }
    }
    impl<T: GrpcHydra> Clone for _Inner<T> {
        fn clone(&self) -> Self {
            Self(self.0.clone(), self.1.clone())
        }
    }
    impl<T: std::fmt::Debug> std::fmt::Debug for _Inner<T> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self.0)
        }
    }
    impl<T: GrpcHydra> tonic::transport::NamedService for GrpcHydraServer<T> {
        const NAME: &'static str = "hydra.GrpcHydra";
    }
}
