//! gRPC server implementation for the etcd v3 API.
//!
//! Services are hand-written tonic `Service`s that route on the request path
//! and do their own 5-byte gRPC framing, so no proto codegen is needed.
//! `KV.Range` and `KV.Txn` go to the [`LimitedServer`]; a handful of
//! Lease/Cluster/Maintenance calls are answered locally and the rest are
//! rejected as unsupported.

use super::errors::to_status;
use super::limited::{LimitedServer, RAFT_TERM};
use super::proto;
use crate::core::config::ListenerConfig;
use crate::core::error::{StatebaseError, StatebaseResult};
use bytes::{BufMut, Bytes, BytesMut};
use http_body_util::BodyExt;
use prost::Message;
use std::future::Future;
use std::marker::PhantomData;
use std::net::SocketAddr;
use tokio::sync::watch;
use tonic::codegen::http::{header, HeaderMap, HeaderValue, StatusCode};
use tonic::Status;

/// etcd server version reported by `Maintenance.Status`.
pub const ETCD_VERSION: &str = "3.5.13";

/// Client URL reported when the request carries no authority.
pub const DEFAULT_CLIENT_URL: &str = "http://127.0.0.1:2379";

/// Methods that exist upstream but are deliberately not served.
const UNSUPPORTED_METHODS: &[&str] = &[
    "/etcdserverpb.Lease/LeaseRevoke",
    "/etcdserverpb.Lease/LeaseKeepAlive",
    "/etcdserverpb.Lease/LeaseTimeToLive",
    "/etcdserverpb.Lease/LeaseLeases",
    "/etcdserverpb.Cluster/MemberAdd",
    "/etcdserverpb.Cluster/MemberRemove",
    "/etcdserverpb.Cluster/MemberUpdate",
    "/etcdserverpb.Cluster/MemberPromote",
    "/etcdserverpb.Maintenance/Alarm",
    "/etcdserverpb.Maintenance/Defragment",
    "/etcdserverpb.Maintenance/Hash",
    "/etcdserverpb.Maintenance/HashKV",
    "/etcdserverpb.Maintenance/Snapshot",
    "/etcdserverpb.Maintenance/MoveLeader",
    "/etcdserverpb.Maintenance/Downgrade",
];

/// Shared state for the gRPC services.
#[derive(Debug, Clone)]
pub struct SharedState {
    /// Request translator over the backend.
    pub server: LimitedServer,
    /// Member name reported by MemberList.
    pub member_name: String,
    /// Scheme used to build client URLs from a plain authority.
    pub scheme: &'static str,
}

impl SharedState {
    /// Create the shared state for a listener.
    pub fn new(server: LimitedServer, listener: &ListenerConfig) -> Self {
        Self {
            server,
            member_name: listener.member_name.clone(),
            scheme: if listener.has_tls() { "https" } else { "http" },
        }
    }

    async fn current_header(&self) -> StatebaseResult<proto::ResponseHeader> {
        let revision = self.server.current_revision().await?;
        Ok(self.server.header().at(revision))
    }

    /// Handle a direct Compact RPC: acknowledged, nothing is removed.
    pub fn compact(&self, req: proto::CompactionRequest) -> proto::CompactionResponse {
        proto::CompactionResponse {
            header: Some(self.server.header().at(req.revision)),
        }
    }

    /// Handle LeaseGrant: leases are not tracked, the ID echoes the TTL.
    pub async fn lease_grant(
        &self,
        req: proto::LeaseGrantRequest,
    ) -> StatebaseResult<proto::LeaseGrantResponse> {
        Ok(proto::LeaseGrantResponse {
            header: Some(self.current_header().await?),
            id: req.ttl,
            ttl: req.ttl,
            error: String::new(),
        })
    }

    /// Handle MemberList: this process as the single member.
    pub async fn member_list(
        &self,
        authority: Option<&str>,
    ) -> StatebaseResult<proto::MemberListResponse> {
        let urls = client_urls(authority, self.scheme);
        let header = self.current_header().await?;
        Ok(proto::MemberListResponse {
            members: vec![proto::Member {
                id: header.member_id,
                name: self.member_name.clone(),
                peer_urls: urls.clone(),
                client_urls: urls,
                is_learner: false,
            }],
            header: Some(header),
        })
    }

    /// Handle Status.
    pub async fn status(&self) -> StatebaseResult<proto::StatusResponse> {
        let header = self.current_header().await?;
        let db_size = self.server.db_size().await?;
        Ok(proto::StatusResponse {
            version: ETCD_VERSION.to_string(),
            db_size,
            leader: header.member_id,
            raft_index: header.revision.max(0) as u64,
            raft_term: RAFT_TERM,
            raft_applied_index: header.revision.max(0) as u64,
            errors: vec![],
            db_size_in_use: db_size,
            is_learner: false,
            header: Some(header),
        })
    }
}

/// Client URLs for the request's `:authority`.
///
/// etcd 3.5 clients send `#initially=[a;b]` listing every endpoint they were
/// configured with; each entry becomes one URL.
pub fn client_urls(authority: Option<&str>, scheme: &str) -> Vec<String> {
    let Some(authority) = authority.filter(|a| !a.is_empty()) else {
        return vec![DEFAULT_CLIENT_URL.to_string()];
    };

    let with_scheme = |endpoint: &str| {
        if endpoint.contains("://") {
            endpoint.to_string()
        } else {
            format!("{}://{}", scheme, endpoint)
        }
    };

    if let Some(list) = authority
        .strip_prefix("#initially=[")
        .and_then(|rest| rest.strip_suffix(']'))
    {
        let urls: Vec<String> = list
            .split(';')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(with_scheme)
            .collect();
        if urls.is_empty() {
            return vec![DEFAULT_CLIENT_URL.to_string()];
        }
        return urls;
    }

    vec![with_scheme(authority)]
}

/// Decode gRPC message from body bytes (strips the 5-byte header).
#[allow(clippy::result_large_err)]
pub fn decode_grpc_message<M: Message + Default>(body: &Bytes) -> Result<M, Status> {
    if body.len() < 5 {
        return Err(Status::invalid_argument("gRPC message too short"));
    }

    if body[0] != 0 {
        return Err(Status::unimplemented("compressed gRPC messages"));
    }
    let len = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;

    if body.len() < 5 + len {
        return Err(Status::invalid_argument(format!(
            "gRPC message truncated: expected {} bytes, got {}",
            len,
            body.len() - 5
        )));
    }

    let msg_bytes = &body[5..5 + len];
    M::decode(msg_bytes).map_err(|e| Status::invalid_argument(format!("decode error: {}", e)))
}

/// Encode gRPC message to bytes (adds the 5-byte header).
pub fn encode_grpc_message<M: Message>(msg: &M) -> Bytes {
    let encoded = msg.encode_to_vec();
    let len = encoded.len() as u32;

    let mut buf = BytesMut::with_capacity(5 + encoded.len());
    buf.put_u8(0); // not compressed
    buf.put_u32(len);
    buf.put_slice(&encoded);
    buf.freeze()
}

/// A gRPC body that includes trailers with grpc-status.
struct GrpcBody {
    data: Option<Bytes>,
    trailers_sent: bool,
}

impl http_body::Body for GrpcBody {
    type Data = Bytes;
    type Error = Status;

    fn poll_frame(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Result<http_body::Frame<Self::Data>, Self::Error>>> {
        if let Some(data) = self.data.take() {
            return std::task::Poll::Ready(Some(Ok(http_body::Frame::data(data))));
        }
        if !self.trailers_sent {
            self.trailers_sent = true;
            let mut trailers = HeaderMap::new();
            trailers.insert("grpc-status", HeaderValue::from_static("0"));
            return std::task::Poll::Ready(Some(Ok(http_body::Frame::trailers(trailers))));
        }
        std::task::Poll::Ready(None)
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none() && self.trailers_sent
    }
}

type HttpResponse = tonic::codegen::http::Response<tonic::body::BoxBody>;

/// Build a gRPC response with proper headers and trailers.
fn grpc_response(body: Bytes) -> HttpResponse {
    let grpc_body = GrpcBody {
        data: Some(body),
        trailers_sent: false,
    };

    let mut response = tonic::codegen::http::Response::new(tonic::body::BoxBody::new(grpc_body));
    *response.status_mut() = StatusCode::OK;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/grpc"),
    );
    response
}

/// Build a gRPC error response.
fn grpc_error_response(status: Status) -> HttpResponse {
    status.into_http()
}

fn error_response(path: &str, err: StatebaseError) -> HttpResponse {
    match err {
        StatebaseError::Database(_) | StatebaseError::Internal { .. } => {
            tracing::warn!(path, error = %err, "request failed");
        }
        _ => tracing::debug!(path, error = %err, "request rejected"),
    }
    grpc_error_response(to_status(&err))
}

async fn unary<Req, Resp, F, Fut>(path: &str, body: &Bytes, handler: F) -> HttpResponse
where
    Req: Message + Default,
    Resp: Message,
    F: FnOnce(Req) -> Fut,
    Fut: Future<Output = StatebaseResult<Resp>>,
{
    match decode_grpc_message::<Req>(body) {
        Ok(req) => match handler(req).await {
            Ok(resp) => grpc_response(encode_grpc_message(&resp)),
            Err(err) => error_response(path, err),
        },
        Err(status) => grpc_error_response(status),
    }
}

/// Route one unary call by its full method path.
async fn dispatch(state: SharedState, path: &str, authority: Option<&str>, body: Bytes) -> HttpResponse {
    match path {
        "/etcdserverpb.KV/Range" => unary(path, &body, |req| state.server.range(req)).await,
        "/etcdserverpb.KV/Txn" => unary(path, &body, |req| state.server.txn(req)).await,
        "/etcdserverpb.KV/Put" => error_response(path, StatebaseError::unsupported("put")),
        "/etcdserverpb.KV/DeleteRange" => {
            error_response(path, StatebaseError::unsupported("delete range"))
        }
        "/etcdserverpb.KV/Compact" => {
            unary(path, &body, |req| std::future::ready(Ok(state.compact(req)))).await
        }
        "/etcdserverpb.Lease/LeaseGrant" => unary(path, &body, |req| state.lease_grant(req)).await,
        "/etcdserverpb.Cluster/MemberList" => {
            unary(path, &body, |_: proto::MemberListRequest| state.member_list(authority)).await
        }
        "/etcdserverpb.Maintenance/Status" => {
            unary(path, &body, |_: proto::StatusRequest| state.status()).await
        }
        _ if UNSUPPORTED_METHODS.contains(&path) => {
            let method = path.rsplit('/').next().unwrap_or(path);
            error_response(path, StatebaseError::unsupported(method))
        }
        _ => {
            tracing::warn!(path, "unknown etcd method");
            grpc_error_response(Status::unimplemented(format!("Unknown method: {}", path)))
        }
    }
}

// ============================================================================
// Tonic Service Wrappers
// ============================================================================

/// Fully qualified name of one etcd gRPC service.
pub trait EtcdServiceName: Send + Sync + 'static {
    const NAME: &'static str;
}

/// `etcdserverpb.KV`
#[derive(Debug)]
pub enum KvApi {}
/// `etcdserverpb.Lease`
#[derive(Debug)]
pub enum LeaseApi {}
/// `etcdserverpb.Cluster`
#[derive(Debug)]
pub enum ClusterApi {}
/// `etcdserverpb.Maintenance`
#[derive(Debug)]
pub enum MaintenanceApi {}

impl EtcdServiceName for KvApi {
    const NAME: &'static str = "etcdserverpb.KV";
}
impl EtcdServiceName for LeaseApi {
    const NAME: &'static str = "etcdserverpb.Lease";
}
impl EtcdServiceName for ClusterApi {
    const NAME: &'static str = "etcdserverpb.Cluster";
}
impl EtcdServiceName for MaintenanceApi {
    const NAME: &'static str = "etcdserverpb.Maintenance";
}

/// One etcd service registered with tonic's router.
pub struct EtcdServer<S> {
    state: SharedState,
    _service: PhantomData<fn() -> S>,
}

impl<S> EtcdServer<S> {
    pub fn new(state: SharedState) -> Self {
        Self {
            state,
            _service: PhantomData,
        }
    }
}

impl<S> Clone for EtcdServer<S> {
    fn clone(&self) -> Self {
        Self::new(self.state.clone())
    }
}

impl<S: EtcdServiceName> tonic::server::NamedService for EtcdServer<S> {
    const NAME: &'static str = S::NAME;
}

impl<S, B> tonic::codegen::Service<tonic::codegen::http::Request<B>> for EtcdServer<S>
where
    S: EtcdServiceName,
    B: tonic::codegen::Body + Send + 'static,
    B::Data: Into<Bytes> + Send,
    B::Error: Into<tonic::codegen::StdError> + Send + 'static,
{
    type Response = HttpResponse;
    type Error = std::convert::Infallible;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: tonic::codegen::http::Request<B>) -> Self::Future {
        let state = self.state.clone();
        let path = req.uri().path().to_string();
        let authority = req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                req.headers()
                    .get(header::HOST)
                    .and_then(|h| h.to_str().ok())
                    .map(str::to_string)
            });

        Box::pin(async move {
            // Read body frame by frame; a unary call carries one message.
            let body = req.into_body();
            let mut data = BytesMut::new();
            let mut pinned_body = std::pin::pin!(body);

            loop {
                match pinned_body.as_mut().frame().await {
                    Some(Ok(frame)) => {
                        if frame.is_data() {
                            if let Ok(chunk) = frame.into_data() {
                                let chunk_bytes: Bytes = chunk.into();
                                data.extend_from_slice(&chunk_bytes);
                                // 1 byte compressed flag + 4 bytes length + message
                                if data.len() >= 5 {
                                    let msg_len =
                                        u32::from_be_bytes([data[1], data[2], data[3], data[4]])
                                            as usize;
                                    if data.len() >= 5 + msg_len {
                                        break;
                                    }
                                }
                            }
                        } else if frame.is_trailers() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let err: tonic::codegen::StdError = e.into();
                        tracing::warn!(path = %path, error = %err, "error reading request body");
                        return Ok(grpc_error_response(Status::internal(
                            "failed to read request body",
                        )));
                    }
                    None => break,
                }
            }

            tracing::trace!(service = S::NAME, path = %path, body_len = data.len(), "handling request");
            Ok(dispatch(state, &path, authority.as_deref(), data.freeze()).await)
        })
    }
}

/// gRPC server for the etcd v3 API.
pub struct EtcdGrpcServer {
    /// Bind address.
    bind_addr: SocketAddr,
    /// Listener settings (TLS, timeout).
    listener: ListenerConfig,
    /// Shared state.
    state: SharedState,
    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl EtcdGrpcServer {
    /// Create a new gRPC server.
    pub fn new(
        bind_addr: SocketAddr,
        listener: ListenerConfig,
        server: LimitedServer,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let state = SharedState::new(server, &listener);
        Self {
            bind_addr,
            listener,
            state,
            shutdown_rx,
        }
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Get a reference to the shared state.
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    async fn tls_config(&self) -> StatebaseResult<Option<tonic::transport::ServerTlsConfig>> {
        use tonic::transport::{Certificate, Identity, ServerTlsConfig};

        let (Some(chain_path), Some(key_path)) =
            (&self.listener.tls_chain_path, &self.listener.tls_key_path)
        else {
            return Ok(None);
        };

        let read = |path: String| async move {
            tokio::fs::read(&path)
                .await
                .map_err(|e| StatebaseError::internal(format!("failed to read {}: {}", path, e)))
        };

        let identity = Identity::from_pem(read(chain_path.clone()).await?, read(key_path.clone()).await?);
        let mut tls = ServerTlsConfig::new().identity(identity);
        if let Some(ref ca_path) = self.listener.client_ca_path {
            tls = tls.client_ca_root(Certificate::from_pem(read(ca_path.clone()).await?));
        }
        Ok(Some(tls))
    }

    /// Run the gRPC server until the shutdown signal fires.
    pub async fn run(self) -> StatebaseResult<()> {
        use tonic::transport::Server;

        let addr = self.bind_addr;
        let mut builder = Server::builder().timeout(self.listener.request_timeout());
        if let Some(tls) = self.tls_config().await? {
            builder = builder
                .tls_config(tls)
                .map_err(|e| StatebaseError::internal(format!("invalid TLS configuration: {}", e)))?;
        }

        tracing::info!(
            %addr,
            tls = self.listener.has_tls(),
            mtls = self.listener.client_ca_path.is_some(),
            "starting etcd gRPC server"
        );

        let router = builder
            .add_service(EtcdServer::<KvApi>::new(self.state.clone()))
            .add_service(EtcdServer::<LeaseApi>::new(self.state.clone()))
            .add_service(EtcdServer::<ClusterApi>::new(self.state.clone()))
            .add_service(EtcdServer::<MaintenanceApi>::new(self.state.clone()));

        let mut shutdown_rx = self.shutdown_rx;
        router
            .serve_with_shutdown(addr, async move {
                while !*shutdown_rx.borrow() {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                tracing::info!("gRPC server shutting down");
            })
            .await
            .map_err(|e| StatebaseError::internal(format!("gRPC server error: {}", e)))?;

        Ok(())
    }
}
