//! Common test utilities for scheduler integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

pub mod fixtures;

use bytes::Bytes;
use kiln_proto::{CompileRequest, EnvironmentDescriptor, SchedulerMessage};
use kiln_scheduler::{
    api::AppState, ConnectionId, Outbound, Peer, Scheduler, SchedulerConfig, SchedulerHandle, UserStore,
    WorkerRegistration,
};
use kiln_state::{KvBackend, MemoryKv};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const CLIENT_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20));
pub const SYSTEM: &str = "Linux x86_64";

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A running scheduler task over a temporary environments directory and an
/// in-memory key-value store.
pub struct TestScheduler {
    pub handle: SchedulerHandle,
    pub kv: Arc<dyn KvBackend>,
    pub config: SchedulerConfig,
    pub shutdown: CancellationToken,
    dir: TempDir,
}

impl TestScheduler {
    /// Starts a scheduler with default configuration.
    pub async fn start() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Starts a scheduler after letting the caller adjust the configuration.
    pub async fn with_config(adjust: impl FnOnce(&mut SchedulerConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SchedulerConfig::default();
        config.storage.environments_dir = dir.path().join("environments");
        config.storage.database_path = dir.path().join("db.json");
        adjust(&mut config);

        let kv: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let (scheduler, handle) = Scheduler::bootstrap(&config, kv.clone()).await.unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(scheduler.run(shutdown.clone()));

        Self {
            handle,
            kv,
            config,
            shutdown,
            dir,
        }
    }

    pub fn environments_dir(&self) -> std::path::PathBuf {
        self.config.storage.environments_dir.clone()
    }

    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState {
            scheduler: self.handle.clone(),
            users: Arc::new(UserStore::new(self.kv.clone())),
            channel_capacity: self.config.connection.channel_capacity,
            shutdown: self.shutdown.clone(),
        })
    }

    /// Connects a fake worker and waits until the scheduler has seen it.
    pub async fn connect_worker(&self, registration: WorkerRegistration) -> (Peer, mpsc::Receiver<Outbound>) {
        self.connect_worker_with_capacity(registration, 64).await
    }

    /// Connects a fake worker whose outbound queue holds only `capacity`
    /// frames, as a worker that reads slowly would.
    pub async fn connect_worker_with_capacity(
        &self,
        registration: WorkerRegistration,
        capacity: usize,
    ) -> (Peer, mpsc::Receiver<Outbound>) {
        let (peer, rx) = Peer::channel(capacity);
        self.handle.worker_connected(registration, peer.clone()).await.unwrap();
        self.barrier().await;
        (peer, rx)
    }

    /// Opens a compile connection for `request`.
    pub async fn request(&self, request: CompileRequest) -> (Peer, mpsc::Receiver<Outbound>) {
        let (peer, rx) = Peer::channel(64);
        self.handle.compile_requested(peer.clone(), CLIENT_IP, request).await.unwrap();
        (peer, rx)
    }

    /// Runs a whole upload of `data` for `hash` and waits for it to land.
    pub async fn upload(&self, hash: &str, data: &[u8]) {
        let (peer, mut rx) = self.request(CompileRequest::new(hash)).await;
        match recv(&mut rx).await {
            Outbound::Scheduler(SchedulerMessage::NeedsEnvironment { environment }) => assert_eq!(environment, hash),
            other => panic!("expected needsEnvironment, got {other:?}"),
        }

        self.handle
            .upload_started(peer.id, EnvironmentDescriptor::new(hash, SYSTEM))
            .await
            .unwrap();
        self.handle
            .upload_chunk(peer.id, Bytes::copy_from_slice(data), true)
            .await
            .unwrap();
        assert!(matches!(recv(&mut rx).await, Outbound::Close));
        self.handle.requester_disconnected(peer.id).await.unwrap();
    }

    /// Waits until every command sent so far has been handled.
    pub async fn barrier(&self) {
        self.handle.cluster_info().await.unwrap();
    }

    pub async fn disconnect_worker(&self, connection: ConnectionId) {
        self.handle.worker_disconnected(connection).await.unwrap();
        self.barrier().await;
    }
}

impl Drop for TestScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Receives the next outbound frame, failing the test on timeout.
pub async fn recv(rx: &mut mpsc::Receiver<Outbound>) -> Outbound {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for outbound frame")
        .expect("outbound queue closed")
}

/// Receives the next scheduler message, failing on any other frame.
pub async fn recv_message(rx: &mut mpsc::Receiver<Outbound>) -> SchedulerMessage {
    match recv(rx).await {
        Outbound::Scheduler(message) => message,
        other => panic!("expected scheduler message, got {other:?}"),
    }
}

/// Asserts nothing is queued right now.
pub fn assert_idle(rx: &mut mpsc::Receiver<Outbound>) {
    if let Ok(frame) = rx.try_recv() {
        panic!("unexpected frame: {frame:?}");
    }
}
