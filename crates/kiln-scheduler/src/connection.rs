//! WebSocket connections: handshake parsing and per-role socket loops.
//!
//! Every connection gets a bounded outbound queue ([`Peer`]) drained by a
//! writer task, and a reader loop that decodes frames for its role and
//! forwards them to the scheduler actor. The reader never touches shared
//! state directly.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use kiln_proto::{
    headers, BinaryRun, Codec, CompileRequest, MonitorEvent, MonitorMessage, MonitorReply, ProtocolError,
    SchedulerMessage, UploadMessage, WorkerMessage,
};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::api::AppState;
use crate::auth::{self, AuthError, UserStore};
use crate::peer::{ConnectionId, Outbound, Peer};
use crate::registry::{WorkerKey, WorkerRegistration};
use crate::scheduler::SchedulerHandle;

/// How long a finished reader waits for its writer to flush.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// Rejected upgrade request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("missing header {0}")]
    Missing(&'static str),

    #[error("invalid header {header}: {value}")]
    Invalid { header: &'static str, value: String },
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, self.to_string()).into_response()
    }
}

fn header(headers: &HeaderMap, name: &'static str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

fn parsed<T: std::str::FromStr>(headers: &HeaderMap, name: &'static str) -> Result<Option<T>, HandshakeError> {
    match header(headers, name) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| HandshakeError::Invalid { header: name, value }),
    }
}

/// Builds a worker registration from its upgrade headers.
///
/// The worker is keyed by the address it connected from and the port it
/// declares for job traffic.
pub fn worker_registration(headers: &HeaderMap, ip: IpAddr) -> Result<WorkerRegistration, HandshakeError> {
    let port: u16 = parsed(headers, headers::PORT)?.ok_or(HandshakeError::Missing(headers::PORT))?;
    let slots: u32 = parsed(headers, headers::SLOTS)?.unwrap_or(1);

    let mut registration = WorkerRegistration::new(WorkerKey::new(ip.to_canonical(), port), slots);
    registration.name = header(headers, headers::NAME);
    registration.hostname = header(headers, headers::HOSTNAME);
    registration.system = header(headers, headers::SYSTEM);
    registration.version = header(headers, headers::VERSION);
    registration.environments = header(headers, headers::ENVIRONMENTS)
        .map(|list| {
            list.split(';')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    Ok(registration)
}

/// Builds a compile request from its upgrade headers.
pub fn compile_request(headers: &HeaderMap) -> Result<CompileRequest, HandshakeError> {
    let environment = header(headers, headers::ENVIRONMENT).ok_or(HandshakeError::Missing(headers::ENVIRONMENT))?;
    Ok(CompileRequest {
        environment,
        source_file: header(headers, headers::SOURCE_FILE),
        client_name: header(headers, headers::CLIENT_NAME),
        client_hostname: header(headers, headers::CLIENT_HOSTNAME),
        affinity: header(headers, headers::WORKER),
    })
}

pub async fn worker_upgrade(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let registration = match worker_registration(&headers, addr.ip()) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(peer = %addr, error = %e, "Rejected worker handshake");
            return e.into_response();
        }
    };
    ws.on_upgrade(move |socket| serve_worker(socket, state, registration))
}

pub async fn compile_upgrade(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let request = match compile_request(&headers) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(peer = %addr, error = %e, "Rejected compile handshake");
            return e.into_response();
        }
    };
    let ip = addr.ip().to_canonical();
    ws.on_upgrade(move |socket| serve_compile(socket, state, ip, request))
}

pub async fn monitor_upgrade(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = addr.ip().to_canonical();
    ws.on_upgrade(move |socket| serve_monitor(socket, state, ip))
}

/// A socket split into an outbound peer, its writer task and the inbound
/// stream.
struct Connection {
    peer: Peer,
    stream: SplitStream<WebSocket>,
    writer: tokio::task::JoinHandle<()>,
}

impl Connection {
    fn open(socket: WebSocket, capacity: usize) -> Self {
        let (peer, rx) = Peer::channel(capacity);
        let (sink, stream) = socket.split();
        let writer = tokio::spawn(write_loop(sink, rx, peer.id));
        Self { peer, stream, writer }
    }

    /// Next frame worth handling. `None` on close or socket error.
    async fn next(&mut self) -> Option<Message> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Ok(message) => return Some(message),
                Err(e) => {
                    tracing::debug!(conn = %self.peer.id, error = %e, "Socket error");
                    return None;
                }
            }
        }
    }

    fn reject(&self, error: &ProtocolError) {
        tracing::warn!(conn = %self.peer.id, error = %error, "Protocol error");
        self.peer.send_message(SchedulerMessage::error(error));
        self.peer.close();
    }

    async fn finish(self) {
        let Self { peer, mut writer, .. } = self;
        drop(peer);
        if tokio::time::timeout(WRITER_DRAIN, &mut writer).await.is_err() {
            writer.abort();
        }
    }
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>, id: ConnectionId) {
    while let Some(frame) = rx.recv().await {
        let encoded = match frame {
            Outbound::Scheduler(message) => Codec::encode(&message),
            Outbound::Monitor(event) => Codec::encode(&event),
            Outbound::Reply(reply) => Codec::encode(&reply),
            Outbound::Binary(data) => {
                if sink.send(Message::Binary(data)).await.is_err() {
                    break;
                }
                continue;
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };
        match encoded {
            Ok(text) => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::error!(conn = %id, error = %e, "Failed to encode outbound message"),
        }
    }
    let _ = sink.close().await;
    tracing::trace!(conn = %id, "Writer stopped");
}

async fn serve_worker(socket: WebSocket, state: Arc<AppState>, registration: WorkerRegistration) {
    let mut conn = Connection::open(socket, state.channel_capacity);
    let id = conn.peer.id;
    let handle = &state.scheduler;
    tracing::debug!(conn = %id, worker = %registration.key, "Worker socket open");

    if handle.worker_connected(registration, conn.peer.clone()).await.is_err() {
        conn.finish().await;
        return;
    }

    while let Some(message) = conn.next().await {
        let decoded = match message {
            Message::Text(text) => Codec::decode::<WorkerMessage>(text.as_str()),
            Message::Binary(data) => Err(ProtocolError::UnexpectedBinary(data.len())),
            _ => continue,
        };
        match decoded {
            Ok(message) => {
                if handle.worker_message(id, message).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                conn.reject(&e);
                break;
            }
        }
    }

    let _ = handle.worker_disconnected(id).await;
    conn.finish().await;
}

async fn serve_compile(socket: WebSocket, state: Arc<AppState>, ip: IpAddr, request: CompileRequest) {
    let mut conn = Connection::open(socket, state.channel_capacity);
    let id = conn.peer.id;
    let handle = &state.scheduler;
    tracing::debug!(conn = %id, %ip, environment = %request.environment, "Compile socket open");

    if handle.compile_requested(conn.peer.clone(), ip, request).await.is_err() {
        conn.finish().await;
        return;
    }

    let mut run = BinaryRun::new();
    while let Some(message) = conn.next().await {
        let step = match message {
            Message::Text(text) => upload_message(handle, id, &mut run, text.as_str()).await,
            Message::Binary(data) => match run.accept(data.len()) {
                Ok(last) => handle.upload_chunk(id, data, last).await.map_err(UploadStep::Stop),
                Err(e) => Err(UploadStep::Reject(e)),
            },
            _ => continue,
        };
        match step {
            Ok(()) => {}
            Err(UploadStep::Reject(e)) => {
                conn.reject(&e);
                break;
            }
            Err(UploadStep::Stop(e)) => {
                tracing::debug!(conn = %id, error = %e, "Upload ended");
                break;
            }
        }
    }

    let _ = handle.requester_disconnected(id).await;
    conn.finish().await;
}

enum UploadStep {
    /// Malformed traffic from the requester.
    Reject(ProtocolError),
    /// The scheduler refused or finished the transfer and has already told
    /// the requester.
    Stop(crate::error::SchedulerError),
}

async fn upload_message(
    handle: &SchedulerHandle,
    id: ConnectionId,
    run: &mut BinaryRun,
    text: &str,
) -> Result<(), UploadStep> {
    run.ensure_idle().map_err(UploadStep::Reject)?;
    match Codec::decode::<UploadMessage>(text).map_err(UploadStep::Reject)? {
        UploadMessage::UploadEnvironment(descriptor) => {
            handle.upload_started(id, descriptor).await.map_err(UploadStep::Stop)
        }
        UploadMessage::UploadEnvironmentData { bytes, last } => run.open(bytes, last).map_err(UploadStep::Reject),
    }
}

async fn serve_monitor(socket: WebSocket, state: Arc<AppState>, ip: IpAddr) {
    let mut conn = Connection::open(socket, state.channel_capacity);
    let id = conn.peer.id;
    let mut session = MonitorSession::new(state.scheduler.clone(), state.users.clone(), ip);
    tracing::debug!(conn = %id, %ip, "Monitor socket open");

    conn.peer.send(Outbound::Monitor(MonitorEvent::Hello {
        nonce: session.nonce().to_owned(),
    }));
    if state.scheduler.monitor_connected(conn.peer.clone()).await.is_err() {
        conn.finish().await;
        return;
    }

    while let Some(message) = conn.next().await {
        let decoded = match message {
            Message::Text(text) => Codec::decode::<MonitorMessage>(text.as_str()),
            Message::Binary(data) => Err(ProtocolError::UnexpectedBinary(data.len())),
            _ => continue,
        };
        match decoded {
            Ok(request) => {
                let reply = session.respond(request).await;
                conn.peer.send(Outbound::Reply(reply));
            }
            Err(e) => {
                conn.reject(&e);
                break;
            }
        }
    }

    let _ = state.scheduler.monitor_disconnected(id).await;
    conn.finish().await;
}

/// Per-connection monitor state: the login nonce and who is signed in.
pub struct MonitorSession {
    scheduler: SchedulerHandle,
    users: Arc<UserStore>,
    ip: IpAddr,
    nonce: String,
    user: Option<String>,
}

impl MonitorSession {
    pub fn new(scheduler: SchedulerHandle, users: Arc<UserStore>, ip: IpAddr) -> Self {
        Self {
            scheduler,
            users,
            ip,
            nonce: auth::nonce(),
            user: None,
        }
    }

    /// Nonce sent in the `hello` event; cookie logins sign it.
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn require_login(&self, request: &'static str) -> Result<(), AuthError> {
        match self.user {
            Some(_) => Ok(()),
            None => Err(AuthError::Unauthenticated(request)),
        }
    }

    /// Answers one monitor request.
    pub async fn respond(&mut self, request: MonitorMessage) -> MonitorReply {
        let kind = request.reply_kind();
        match request {
            MonitorMessage::ReadConfiguration => match self.scheduler.read_configuration().await {
                Ok(configuration) => MonitorReply::ok(kind).with_configuration(configuration),
                Err(e) => MonitorReply::failed(kind, e),
            },
            MonitorMessage::WriteConfiguration(change) => {
                if let Err(e) = self.require_login("writeConfiguration") {
                    return MonitorReply::failed(kind, e);
                }
                match self.scheduler.write_configuration(change).await {
                    Ok(()) => MonitorReply::ok(kind),
                    Err(e) => MonitorReply::failed(kind, e),
                }
            }
            MonitorMessage::ListUsers => {
                if let Err(e) = self.require_login("listUsers") {
                    return MonitorReply::failed(kind, e);
                }
                match self.users.list().await {
                    Ok(users) => MonitorReply::ok(kind).with_users(users),
                    Err(e) => MonitorReply::failed(kind, e),
                }
            }
            MonitorMessage::AddUser { user, password } => {
                match self.users.add_user(&user, &password, self.ip).await {
                    Ok(session) => MonitorReply::ok(kind).with_session(session.user, Some(session.cookie)),
                    Err(e) => MonitorReply::failed(kind, e),
                }
            }
            MonitorMessage::RemoveUser { user } => {
                if let Err(e) = self.require_login("removeUser") {
                    return MonitorReply::failed(kind, e);
                }
                match self.users.remove_user(&user).await {
                    Ok(()) => MonitorReply::ok(kind).with_session(user, None),
                    Err(e) => MonitorReply::failed(kind, e),
                }
            }
            MonitorMessage::Login(login) => {
                self.user = None;
                match self.users.login(&login, &self.nonce, self.ip).await {
                    Ok(session) => {
                        tracing::info!(user = %session.user, ip = %self.ip, "Monitor logged in");
                        self.user = Some(session.user.clone());
                        MonitorReply::ok(kind).with_session(session.user, Some(session.cookie))
                    }
                    Err(e) => {
                        tracing::warn!(user = %login.user, ip = %self.ip, error = %e, "Monitor login failed");
                        MonitorReply::failed(kind, e)
                    }
                }
            }
        }
    }
}
