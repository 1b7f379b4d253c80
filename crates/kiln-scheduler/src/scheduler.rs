//! The scheduler task.
//!
//! One task owns the registry, environment store, compatibility graph,
//! upload locks, and job accounting. Connections and HTTP handlers reach it
//! through a [`SchedulerHandle`]; commands are handled strictly one at a
//! time, so no two mutations interleave. Disk and key-value I/O is awaited
//! inside the task. Outbound traffic never blocks the task: requesters and
//! monitors get frames through their bounded queues, workers through their
//! [`WorkerOutbox`].

use bytes::Bytes;
use kiln_proto::{
    Assignment, CompileRequest, Configuration, ConfigurationChange, EnvironmentDescriptor, MonitorEvent,
    ProtocolError, QuitRequest, SchedulerMessage, WorkerMessage,
};
use kiln_state::KvBackend;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::compat::{CompatibilityGraph, PairChange};
use crate::config::SchedulerConfig;
use crate::dispatch::{Dispatcher, PendingEnvironments, Requester};
use crate::environments::{EnvironmentStore, EnvironmentWriter, StoredEnvironment};
use crate::error::{Result, SchedulerError};
use crate::eviction::{CacheEntry, EvictionPolicy};
use crate::monitor::MonitorHub;
use crate::outbox::WorkerOutbox;
use crate::peer::{ConnectionId, Peer};
use crate::placement::CapacityScore;
use crate::registry::{WorkerKey, WorkerRegistration, WorkerRegistry, WorkerView};
use crate::sync::SyncPlan;

const COMMAND_QUEUE: usize = 1024;

/// Requests handled by the scheduler task.
#[derive(Debug)]
pub enum Command {
    WorkerConnected {
        registration: WorkerRegistration,
        peer: Peer,
    },
    WorkerMessage {
        connection: ConnectionId,
        message: WorkerMessage,
    },
    WorkerDisconnected {
        connection: ConnectionId,
    },
    CompileRequested {
        peer: Peer,
        ip: IpAddr,
        request: CompileRequest,
    },
    UploadStarted {
        connection: ConnectionId,
        descriptor: EnvironmentDescriptor,
        reply: oneshot::Sender<Result<()>>,
    },
    UploadChunk {
        connection: ConnectionId,
        data: Bytes,
        last: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    RequesterDisconnected {
        connection: ConnectionId,
    },
    MonitorConnected {
        peer: Peer,
    },
    MonitorDisconnected {
        connection: ConnectionId,
    },
    ReadConfiguration {
        reply: oneshot::Sender<Configuration>,
    },
    WriteConfiguration {
        change: ConfigurationChange,
        reply: oneshot::Sender<Result<()>>,
    },
    ListWorkers {
        reply: oneshot::Sender<Vec<WorkerView>>,
    },
    ClusterInfo {
        reply: oneshot::Sender<ClusterInfo>,
    },
    QuitWorkers {
        request: QuitRequest,
        reply: oneshot::Sender<usize>,
    },
    PurgeEnvironments {
        reply: oneshot::Sender<Result<usize>>,
    },
    PushFinished {
        connection: ConnectionId,
        hash: String,
    },
}

/// Environment cache contents and usage.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentInventory {
    pub environments: Vec<StoredEnvironment>,
    pub max_size_bytes: Option<u64>,
    pub used_size_bytes: u64,
}

/// Cluster overview.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    pub version: &'static str,
    pub environments: EnvironmentInventory,
    pub workers: usize,
    pub active_jobs: usize,
    pub pending_uploads: usize,
    pub monitors: usize,
}

/// Cloneable sender side of the scheduler task.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

impl SchedulerHandle {
    /// Sends a command without waiting for a reply.
    pub async fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).await.map_err(|_| SchedulerError::Unavailable)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| SchedulerError::Unavailable)
    }

    pub async fn worker_connected(&self, registration: WorkerRegistration, peer: Peer) -> Result<()> {
        self.send(Command::WorkerConnected { registration, peer }).await
    }

    pub async fn worker_message(&self, connection: ConnectionId, message: WorkerMessage) -> Result<()> {
        self.send(Command::WorkerMessage { connection, message }).await
    }

    pub async fn worker_disconnected(&self, connection: ConnectionId) -> Result<()> {
        self.send(Command::WorkerDisconnected { connection }).await
    }

    pub async fn compile_requested(&self, peer: Peer, ip: IpAddr, request: CompileRequest) -> Result<()> {
        self.send(Command::CompileRequested { peer, ip, request }).await
    }

    pub async fn upload_started(&self, connection: ConnectionId, descriptor: EnvironmentDescriptor) -> Result<()> {
        self.request(|reply| Command::UploadStarted {
            connection,
            descriptor,
            reply,
        })
        .await?
    }

    /// Appends a chunk to the connection's upload. Resolves once the chunk
    /// is on disk.
    pub async fn upload_chunk(&self, connection: ConnectionId, data: Bytes, last: bool) -> Result<()> {
        self.request(|reply| Command::UploadChunk {
            connection,
            data,
            last,
            reply,
        })
        .await?
    }

    pub async fn requester_disconnected(&self, connection: ConnectionId) -> Result<()> {
        self.send(Command::RequesterDisconnected { connection }).await
    }

    pub async fn monitor_connected(&self, peer: Peer) -> Result<()> {
        self.send(Command::MonitorConnected { peer }).await
    }

    pub async fn monitor_disconnected(&self, connection: ConnectionId) -> Result<()> {
        self.send(Command::MonitorDisconnected { connection }).await
    }

    pub async fn read_configuration(&self) -> Result<Configuration> {
        self.request(|reply| Command::ReadConfiguration { reply }).await
    }

    pub async fn write_configuration(&self, change: ConfigurationChange) -> Result<()> {
        self.request(|reply| Command::WriteConfiguration { change, reply })
            .await?
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerView>> {
        self.request(|reply| Command::ListWorkers { reply }).await
    }

    pub async fn cluster_info(&self) -> Result<ClusterInfo> {
        self.request(|reply| Command::ClusterInfo { reply }).await
    }

    /// Asks every worker to quit. Returns how many were asked.
    pub async fn quit_workers(&self, request: QuitRequest) -> Result<usize> {
        self.request(|reply| Command::QuitWorkers { request, reply }).await
    }

    /// Deletes every stored environment. Returns how many were removed.
    pub async fn purge_environments(&self) -> Result<usize> {
        self.request(|reply| Command::PurgeEnvironments { reply }).await?
    }
}

/// An upload negotiated with a requester.
#[derive(Debug)]
struct Upload {
    hash: String,
    peer: Peer,
    writer: Option<EnvironmentWriter>,
}

/// The scheduler task's state.
pub struct Scheduler {
    registry: WorkerRegistry,
    worker_keys: HashMap<ConnectionId, WorkerKey>,
    store: EnvironmentStore,
    graph: CompatibilityGraph,
    kv: Arc<dyn KvBackend>,
    dispatcher: Dispatcher,
    pending: PendingEnvironments,
    uploads: HashMap<ConnectionId, Upload>,
    outboxes: HashMap<ConnectionId, WorkerOutbox>,
    monitors: MonitorHub,
    eviction: EvictionPolicy,
    push_chunk_size: usize,
    rx: mpsc::Receiver<Command>,
    commands: mpsc::WeakSender<Command>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.registry.len())
            .field("environments", &self.store.len())
            .field("dispatcher", &self.dispatcher)
            .field("monitors", &self.monitors.len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Creates the task state and its handle.
    pub fn new(
        config: &SchedulerConfig,
        store: EnvironmentStore,
        graph: CompatibilityGraph,
        kv: Arc<dyn KvBackend>,
    ) -> (Self, SchedulerHandle) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let dispatcher = Dispatcher::new(
            Box::new(CapacityScore::new(config.dispatch.max_parallelism)),
            config.dispatch.keepalive_window,
        );
        let push_chunk_size = usize::try_from(config.connection.push_chunk_size.as_u64()).unwrap_or(usize::MAX);

        let scheduler = Self {
            registry: WorkerRegistry::new(),
            worker_keys: HashMap::new(),
            store,
            graph,
            kv,
            dispatcher,
            pending: PendingEnvironments::new(),
            uploads: HashMap::new(),
            outboxes: HashMap::new(),
            monitors: MonitorHub::new(),
            eviction: EvictionPolicy::new(config.storage.max_cache_size.map(|s| s.as_u64())),
            push_chunk_size: push_chunk_size.max(1),
            rx,
            commands: tx.downgrade(),
        };
        (scheduler, SchedulerHandle { tx })
    }

    /// Loads persisted state and prepares the task: environment store,
    /// initial eviction pass, then the compatibility graph.
    pub async fn bootstrap(config: &SchedulerConfig, kv: Arc<dyn KvBackend>) -> Result<(Self, SchedulerHandle)> {
        let store = EnvironmentStore::load(&config.storage.environments_dir).await?;
        let (mut scheduler, handle) = Self::new(config, store, CompatibilityGraph::new(), kv);
        scheduler.evict().await;
        scheduler.graph = CompatibilityGraph::load(scheduler.kv.as_ref()).await?;
        Ok((scheduler, handle))
    }

    /// Handles commands until every handle is dropped or `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!(
            algorithm = self.dispatcher.algorithm_name(),
            environments = self.store.len(),
            "Scheduler running"
        );
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.handle(command).await,
                    None => break,
                },
            }
        }
        self.abandon_uploads().await;
        tracing::info!("Scheduler stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::WorkerConnected { registration, peer } => self.worker_connected(registration, peer),
            Command::WorkerMessage { connection, message } => self.worker_message(connection, message),
            Command::WorkerDisconnected { connection } => self.worker_disconnected(connection),
            Command::CompileRequested { peer, ip, request } => self.compile_requested(peer, ip, &request),
            Command::UploadStarted {
                connection,
                descriptor,
                reply,
            } => {
                let result = self.upload_started(connection, descriptor).await;
                let _ = reply.send(result);
            }
            Command::UploadChunk {
                connection,
                data,
                last,
                reply,
            } => {
                let result = self.upload_chunk(connection, &data, last).await;
                let _ = reply.send(result);
            }
            Command::RequesterDisconnected { connection } => self.requester_disconnected(connection).await,
            Command::MonitorConnected { peer } => {
                let workers: Vec<_> = self.registry.iter().map(|w| w.summary()).collect();
                self.monitors.subscribe(peer, workers);
            }
            Command::MonitorDisconnected { connection } => {
                self.monitors.unsubscribe(connection);
            }
            Command::ReadConfiguration { reply } => {
                let _ = reply.send(Configuration {
                    compatible_hashes: self.graph.edges().clone(),
                });
            }
            Command::WriteConfiguration { change, reply } => {
                let result = self.write_configuration(&change).await;
                let _ = reply.send(result);
            }
            Command::ListWorkers { reply } => {
                let _ = reply.send(self.registry.iter().map(|w| w.view()).collect());
            }
            Command::ClusterInfo { reply } => {
                let _ = reply.send(self.cluster_info());
            }
            Command::QuitWorkers { request, reply } => {
                let _ = reply.send(self.quit_workers(request));
            }
            Command::PurgeEnvironments { reply } => {
                let result = self.store.purge_all().await;
                if result.is_ok() {
                    self.sync_all();
                }
                let _ = reply.send(result);
            }
            Command::PushFinished { connection, hash } => {
                if let Some(outbox) = self.outboxes.get_mut(&connection) {
                    outbox.finished(&hash);
                }
            }
        }
    }

    // Workers

    fn worker_connected(&mut self, registration: WorkerRegistration, peer: Peer) {
        let key = registration.key;
        let connection = peer.id;
        // The replaced connection keeps running until it closes; its reports
        // must not reach the new entry.
        if let Some(previous) = self.registry.get(&key).map(|w| w.peer.id) {
            self.worker_keys.remove(&previous);
            self.outboxes.remove(&previous);
        }
        self.outboxes.insert(
            connection,
            WorkerOutbox::spawn(peer.clone(), self.push_chunk_size, self.commands.clone()),
        );
        let summary = self.registry.register(registration.into_info(peer));
        self.worker_keys.insert(connection, key);

        tracing::info!(
            worker = %key,
            conn = %connection,
            name = summary.name.as_deref().unwrap_or(""),
            hostname = summary.hostname.as_deref().unwrap_or(""),
            environments = summary.environments.len(),
            workers = self.registry.len(),
            "Worker connected"
        );
        self.monitors.publish(&MonitorEvent::WorkerAdded(summary));
        self.sync_worker(&key);
    }

    fn worker_message(&mut self, connection: ConnectionId, message: WorkerMessage) {
        let Some(key) = self.worker_keys.get(&connection).copied() else {
            tracing::debug!(conn = %connection, "Message from unregistered worker connection");
            return;
        };
        if self.registry.get(&key).map(|w| w.peer.id) != Some(connection) {
            tracing::debug!(conn = %connection, worker = %key, "Message from replaced worker connection");
            return;
        }

        match message {
            WorkerMessage::Environments { environments } => {
                if self.registry.update_environments(&key, environments) {
                    self.sync_worker(&key);
                }
            }
            WorkerMessage::Load { measure } => {
                self.registry.update_load(&key, measure);
            }
            WorkerMessage::JobFinished(job) => {
                if self.registry.record_job_finished(&key, &job) {
                    tracing::info!(
                        worker = %key,
                        job = job.id,
                        compile_ms = job.compile_duration,
                        upload_ms = job.upload_duration,
                        "Worker performed a job"
                    );
                    self.monitors.publish(&MonitorEvent::JobFinished(job));
                }
            }
            WorkerMessage::JobAborted { id } => {
                if self.registry.record_job_aborted(&key, id) {
                    self.monitors.publish(&MonitorEvent::JobAborted { id });
                }
            }
        }
    }

    fn worker_disconnected(&mut self, connection: ConnectionId) {
        self.outboxes.remove(&connection);
        let Some(key) = self.worker_keys.remove(&connection) else {
            return;
        };
        if let Some(info) = self.registry.unregister(&key, connection) {
            tracing::info!(worker = %key, workers = self.registry.len(), "Worker disconnected");
            self.monitors.publish(&MonitorEvent::WorkerRemoved(info.summary()));
        }
    }

    /// Reconciles one worker against the cluster's complete set.
    fn sync_worker(&mut self, key: &WorkerKey) {
        let cluster = self.store.hashes();
        let Some(worker) = self.registry.get_mut(key) else {
            return;
        };
        let Some(outbox) = self.outboxes.get_mut(&worker.peer.id) else {
            return;
        };

        let plan = SyncPlan::compute(&cluster, &worker.environments);
        if plan.is_empty() {
            return;
        }
        tracing::debug!(worker = %key, needs = ?plan.needs, unwanted = ?plan.unwanted, "Synchronising worker");

        if !plan.unwanted.is_empty() {
            let message = SchedulerMessage::DropEnvironments {
                environments: plan.unwanted.clone(),
            };
            if !outbox.send_message(message) {
                return;
            }
            for hash in &plan.unwanted {
                worker.environments.remove(hash);
            }
        }

        for hash in plan.needs {
            if outbox.is_pushing(&hash) {
                continue;
            }
            if let Some(environment) = self.store.get(&hash) {
                outbox.push(environment.clone());
            }
        }
    }

    fn sync_all(&mut self) {
        let keys: Vec<WorkerKey> = self.registry.iter().map(|w| w.key).collect();
        for key in keys {
            self.sync_worker(&key);
        }
    }

    // Requesters

    fn compile_requested(&mut self, peer: Peer, ip: IpAddr, request: &CompileRequest) {
        let hash = request.environment.as_str();
        tracing::debug!(
            client = %ip,
            conn = %peer.id,
            environment = %hash,
            hostname = request.client_hostname.as_deref().unwrap_or(""),
            "Compile request"
        );

        if !self.store.has(hash) {
            if !self.pending.try_acquire(hash, peer.id) {
                tracing::info!(client = %ip, environment = %hash, "Upload already pending, asking client to retry");
                peer.send_message(SchedulerMessage::Assignment(Assignment::empty()));
                return;
            }
            tracing::info!(client = %ip, environment = %hash, "Asking client to upload environment");
            peer.send_message(SchedulerMessage::NeedsEnvironment {
                environment: hash.to_owned(),
            });
            self.uploads.insert(
                peer.id,
                Upload {
                    hash: hash.to_owned(),
                    peer,
                    writer: None,
                },
            );
            return;
        }

        let requester = Requester { connection: peer.id, ip };
        let outcome = self
            .dispatcher
            .dispatch(&mut self.registry, &self.graph, request, &requester);
        peer.send_message(SchedulerMessage::Assignment(outcome.assignment));
        if let Some(started) = outcome.started {
            self.monitors.publish(&MonitorEvent::JobStarted(started));
        }
    }

    async fn upload_started(&mut self, connection: ConnectionId, descriptor: EnvironmentDescriptor) -> Result<()> {
        let result = self.try_upload_started(connection, descriptor).await;
        if let Err(e) = &result {
            self.fail_upload(connection, e).await;
        }
        result
    }

    async fn try_upload_started(&mut self, connection: ConnectionId, descriptor: EnvironmentDescriptor) -> Result<()> {
        let upload = self
            .uploads
            .get(&connection)
            .ok_or_else(|| ProtocolError::InvalidPayload {
                kind: "uploadEnvironment".into(),
                reason: "no environment was requested on this connection".into(),
            })?;
        if upload.writer.is_some() {
            return Err(ProtocolError::InvalidPayload {
                kind: "uploadEnvironment".into(),
                reason: "upload already started".into(),
            }
            .into());
        }
        if upload.hash != descriptor.hash {
            return Err(ProtocolError::InvalidDescriptor(format!(
                "requested {} but received {}",
                upload.hash, descriptor.hash
            ))
            .into());
        }

        let hash = descriptor.hash.clone();
        let writer = self
            .store
            .prepare(descriptor)
            .await?
            .ok_or_else(|| SchedulerError::DuplicateTransfer(hash.clone()))?;

        tracing::info!(conn = %connection, hash = %hash, "Upload started");
        if let Some(upload) = self.uploads.get_mut(&connection) {
            upload.writer = Some(writer);
        }
        Ok(())
    }

    async fn upload_chunk(&mut self, connection: ConnectionId, data: &[u8], last: bool) -> Result<()> {
        let result = self.try_upload_chunk(connection, data, last).await;
        if let Err(e) = &result {
            self.fail_upload(connection, e).await;
        }
        result
    }

    async fn try_upload_chunk(&mut self, connection: ConnectionId, data: &[u8], last: bool) -> Result<()> {
        let writer = self
            .uploads
            .get_mut(&connection)
            .and_then(|u| u.writer.as_mut())
            .ok_or(ProtocolError::UnexpectedBinary(data.len()))?;
        writer.append(data).await?;

        if !last {
            return Ok(());
        }

        let Some(Upload {
            hash,
            peer,
            writer: Some(writer),
        }) = self.uploads.remove(&connection)
        else {
            return Ok(());
        };

        let completed = self.store.complete(writer).await.map(|e| e.size);
        self.pending.release(&hash, connection);
        let size = match completed {
            Ok(size) => size,
            Err(e) => {
                tracing::error!(conn = %connection, hash = %hash, error = %e, "Failed to store environment");
                peer.send_message(SchedulerMessage::error(&e));
                peer.close();
                return Err(e);
            }
        };

        peer.close();
        tracing::info!(conn = %connection, hash = %hash, size, "Upload complete");

        self.evict().await;
        self.sync_all();
        Ok(())
    }

    /// Ends a failed upload: partial data discarded, lock released, error
    /// sent, connection closed.
    async fn fail_upload(&mut self, connection: ConnectionId, error: &SchedulerError) {
        let Some(upload) = self.uploads.remove(&connection) else {
            return;
        };
        tracing::warn!(conn = %connection, hash = %upload.hash, error = %error, "Upload failed");
        if let Some(writer) = upload.writer {
            self.store.discard(writer).await;
        }
        self.pending.release(&upload.hash, connection);
        upload.peer.send_message(SchedulerMessage::error(error));
        upload.peer.close();
    }

    async fn requester_disconnected(&mut self, connection: ConnectionId) {
        if let Some(job) = self.dispatcher.release(&mut self.registry, connection) {
            tracing::debug!(conn = %connection, job = job.id, "Requester gone, job released");
        }

        if let Some(upload) = self.uploads.remove(&connection) {
            let interrupted = SchedulerError::TransferInterrupted(upload.hash.clone());
            if let Some(writer) = upload.writer {
                tracing::info!(conn = %connection, error = %interrupted, "Discarding upload");
                self.store.discard(writer).await;
            }
            self.pending.release(&upload.hash, connection);
        }
    }

    async fn abandon_uploads(&mut self) {
        let connections: Vec<ConnectionId> = self.uploads.keys().copied().collect();
        for connection in connections {
            self.requester_disconnected(connection).await;
        }
    }

    // Cache

    /// Runs the eviction policy, re-synchronising workers if anything went.
    pub async fn evict(&mut self) -> Vec<String> {
        let entries: Vec<CacheEntry> = self
            .store
            .list()
            .into_iter()
            .map(|e| CacheEntry {
                hash: e.descriptor.hash.clone(),
                size: e.size,
                created: e.created,
            })
            .collect();

        let mut purged = Vec::new();
        for hash in self.eviction.select_victims(&entries) {
            match self.store.remove(&hash).await {
                Ok(true) => {
                    tracing::info!(hash = %hash, "Purged environment over cache budget");
                    purged.push(hash);
                }
                Ok(false) => {}
                Err(e) => tracing::error!(hash = %hash, error = %e, "Failed to purge environment"),
            }
        }

        if !purged.is_empty() {
            self.sync_all();
        }
        purged
    }

    // Monitors and admin

    async fn write_configuration(&mut self, change: &ConfigurationChange) -> Result<()> {
        let change = PairChange::parse(change)?;
        let mut next = self.graph.clone();
        next.apply(&change);
        next.persist(self.kv.as_ref()).await?;
        self.graph = next;
        tracing::info!(change = ?change, "Compatibility graph updated");
        Ok(())
    }

    fn cluster_info(&self) -> ClusterInfo {
        ClusterInfo {
            version: env!("CARGO_PKG_VERSION"),
            environments: self.inventory(),
            workers: self.registry.len(),
            active_jobs: self.dispatcher.active_jobs(),
            pending_uploads: self.pending.len(),
            monitors: self.monitors.len(),
        }
    }

    fn inventory(&self) -> EnvironmentInventory {
        EnvironmentInventory {
            environments: self.store.list().into_iter().cloned().collect(),
            max_size_bytes: self.eviction.max_size(),
            used_size_bytes: self.store.total_size(),
        }
    }

    fn quit_workers(&self, request: QuitRequest) -> usize {
        let mut sent = 0;
        self.registry.for_each(|worker| {
            let queued = self
                .outboxes
                .get(&worker.peer.id)
                .is_some_and(|outbox| outbox.send_message(SchedulerMessage::Quit(request)));
            if queued {
                sent += 1;
            }
        });
        tracing::info!(code = request.code, purge = request.purge_environments, workers = sent, "Asked workers to quit");
        sent
    }

    /// Hashes of every complete environment.
    pub fn environments(&self) -> BTreeSet<String> {
        self.store.hashes()
    }
}
