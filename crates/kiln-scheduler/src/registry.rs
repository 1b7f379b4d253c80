//! Worker registry for tracking connected workers.

use chrono::{DateTime, Utc};
use kiln_proto::{JobFinished, WorkerSummary};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use crate::peer::{ConnectionId, Peer};

/// Worker identity: the address it connected from plus the port it serves
/// compile jobs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerKey {
    pub ip: IpAddr,
    pub port: u16,
}

impl WorkerKey {
    #[must_use]
    pub const fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SocketAddr::new(self.ip, self.port).fmt(f)
    }
}

/// Worker registry.
///
/// Owned by the scheduler task; never shared.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerKey, WorkerInfo>,
}

impl WorkerRegistry {
    /// Creates a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a worker, replacing any worker with the same key.
    ///
    /// Returns the projection to announce as `workerAdded`.
    pub fn register(&mut self, info: WorkerInfo) -> WorkerSummary {
        let summary = info.summary();
        if let Some(previous) = self.workers.insert(info.key, info) {
            tracing::warn!(
                worker = %previous.key,
                replaced = %previous.peer.id,
                "Worker key re-registered, replacing previous connection"
            );
        }
        summary
    }

    /// Removes a worker if it is still owned by `connection`.
    ///
    /// A connection that lost its key to a newer registration leaves the
    /// newer worker in place.
    pub fn unregister(&mut self, key: &WorkerKey, connection: ConnectionId) -> Option<WorkerInfo> {
        match self.workers.get(key) {
            Some(info) if info.peer.id == connection => self.workers.remove(key),
            _ => None,
        }
    }

    pub fn get(&self, key: &WorkerKey) -> Option<&WorkerInfo> {
        self.workers.get(key)
    }

    pub fn get_mut(&mut self, key: &WorkerKey) -> Option<&mut WorkerInfo> {
        self.workers.get_mut(key)
    }

    /// Looks up the worker registered by a given connection.
    pub fn find_by_connection(&self, connection: ConnectionId) -> Option<&WorkerInfo> {
        self.workers.values().find(|w| w.peer.id == connection)
    }

    pub fn for_each(&self, mut f: impl FnMut(&WorkerInfo)) {
        self.workers.values().for_each(|w| f(w));
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerInfo> {
        self.workers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerInfo> {
        self.workers.values_mut()
    }

    /// Replaces a worker's reported environment set.
    pub fn update_environments<I>(&mut self, key: &WorkerKey, hashes: I) -> bool
    where
        I: IntoIterator<Item = String>,
    {
        let Some(worker) = self.workers.get_mut(key) else {
            return false;
        };
        worker.environments = hashes.into_iter().collect();
        true
    }

    /// Records a load report. Values outside `0.0..=1.0` are clamped.
    pub fn update_load(&mut self, key: &WorkerKey, measure: f64) -> bool {
        let Some(worker) = self.workers.get_mut(key) else {
            return false;
        };
        worker.load = if measure.is_nan() { 0.0 } else { measure.clamp(0.0, 1.0) };
        true
    }

    /// Binds a job to the worker.
    pub fn record_job_started(&mut self, key: &WorkerKey, now: DateTime<Utc>) -> bool {
        let Some(worker) = self.workers.get_mut(key) else {
            return false;
        };
        worker.active_clients = worker.active_clients.saturating_add(1);
        worker.stats.jobs_scheduled += 1;
        worker.stats.last_job = Some(now);
        true
    }

    /// Accumulates the statistics a worker reports for a finished job.
    pub fn record_job_finished(&mut self, key: &WorkerKey, job: &JobFinished) -> bool {
        let Some(worker) = self.workers.get_mut(key) else {
            return false;
        };
        let stats = &mut worker.stats;
        stats.jobs_performed += 1;
        stats.total_compile_ms = stats.total_compile_ms.saturating_add(job.compile_duration);
        stats.total_upload_ms = stats.total_upload_ms.saturating_add(job.upload_duration);
        stats.total_cpp_bytes = stats.total_cpp_bytes.saturating_add(job.cpp_size);
        true
    }

    pub fn record_job_aborted(&mut self, key: &WorkerKey, id: i32) -> bool {
        let Some(worker) = self.workers.get_mut(key) else {
            return false;
        };
        worker.stats.jobs_aborted += 1;
        tracing::debug!(worker = %key, job = id, "Job aborted");
        true
    }

    /// Unbinds a job from the worker.
    pub fn release(&mut self, key: &WorkerKey) -> bool {
        let Some(worker) = self.workers.get_mut(key) else {
            return false;
        };
        worker.active_clients = worker.active_clients.saturating_sub(1);
        true
    }

    /// Returns the number of registered workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns true if no workers are registered.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Attributes a worker declares when it connects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRegistration {
    pub key: WorkerKey,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub system: Option<String>,
    pub version: Option<String>,
    pub slots: u32,
    pub environments: Vec<String>,
}

impl WorkerRegistration {
    pub fn new(key: WorkerKey, slots: u32) -> Self {
        Self {
            key,
            name: None,
            hostname: None,
            system: None,
            version: None,
            slots,
            environments: Vec::new(),
        }
    }

    pub fn into_info(self, peer: Peer) -> WorkerInfo {
        let mut info = WorkerInfo::new(self.key, peer, self.slots);
        info.name = self.name;
        info.hostname = self.hostname;
        info.system = self.system;
        info.version = self.version;
        info.environments = self.environments.into_iter().collect();
        info
    }
}

/// Worker information.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub key: WorkerKey,
    /// Connection that registered this worker.
    pub peer: Peer,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub system: Option<String>,
    /// Reported client version.
    pub version: Option<String>,
    /// Declared concurrent job capacity.
    pub slots: u32,
    /// Jobs currently bound to this worker.
    pub active_clients: u32,
    /// Rolling load, 0.0 idle to 1.0 saturated.
    pub load: f64,
    pub environments: BTreeSet<String>,
    pub stats: WorkerStats,
    pub created: DateTime<Utc>,
}

impl WorkerInfo {
    pub fn new(key: WorkerKey, peer: Peer, slots: u32) -> Self {
        Self {
            key,
            peer,
            name: None,
            hostname: None,
            system: None,
            version: None,
            slots,
            active_clients: 0,
            load: 0.0,
            environments: BTreeSet::new(),
            stats: WorkerStats::default(),
            created: Utc::now(),
        }
    }

    /// True if `target` names this worker by address or name.
    pub fn matches(&self, target: &str) -> bool {
        self.key.ip.to_string() == target || self.name.as_deref() == Some(target)
    }

    /// Projection announced to monitors.
    pub fn summary(&self) -> WorkerSummary {
        WorkerSummary {
            ip: self.key.ip.to_string(),
            port: self.key.port,
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            system: self.system.clone(),
            slots: self.slots,
            jobs_performed: self.stats.jobs_performed,
            compile_speed: self.stats.compile_speed(),
            upload_speed: self.stats.upload_speed(),
            created: self.created,
            version: self.version.clone(),
            environments: self.environments.iter().cloned().collect(),
        }
    }

    /// Full projection served by the inspection API.
    pub fn view(&self) -> WorkerView {
        WorkerView {
            ip: self.key.ip.to_string(),
            port: self.key.port,
            name: self.name.clone(),
            hostname: self.hostname.clone(),
            system: self.system.clone(),
            version: self.version.clone(),
            slots: self.slots,
            active_clients: self.active_clients,
            load: self.load,
            jobs_scheduled: self.stats.jobs_scheduled,
            jobs_performed: self.stats.jobs_performed,
            jobs_aborted: self.stats.jobs_aborted,
            compile_speed: self.stats.compile_speed(),
            upload_speed: self.stats.upload_speed(),
            last_job: self.stats.last_job,
            created: self.created,
            environments: self.environments.iter().cloned().collect(),
        }
    }
}

/// Running per-worker statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub jobs_scheduled: u64,
    pub jobs_performed: u64,
    pub jobs_aborted: u64,
    /// Milliseconds.
    pub total_compile_ms: u64,
    /// Milliseconds.
    pub total_upload_ms: u64,
    pub total_cpp_bytes: u64,
    /// `None` until the first dispatch.
    pub last_job: Option<DateTime<Utc>>,
}

impl WorkerStats {
    /// Jobs performed per second of compile time.
    #[must_use]
    pub fn compile_speed(&self) -> f64 {
        per_second(self.jobs_performed, self.total_compile_ms)
    }

    /// Jobs performed per second of upload time.
    #[must_use]
    pub fn upload_speed(&self) -> f64 {
        per_second(self.jobs_performed, self.total_upload_ms)
    }
}

#[allow(clippy::cast_precision_loss)]
fn per_second(jobs: u64, total_ms: u64) -> f64 {
    if total_ms == 0 {
        return 0.0;
    }
    jobs as f64 / (total_ms as f64 / 1000.0)
}

/// Worker projection for the `/workers` endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerView {
    pub ip: String,
    pub port: u16,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub system: Option<String>,
    pub version: Option<String>,
    pub slots: u32,
    pub active_clients: u32,
    pub load: f64,
    pub jobs_scheduled: u64,
    pub jobs_performed: u64,
    pub jobs_aborted: u64,
    pub compile_speed: f64,
    pub upload_speed: f64,
    pub last_job: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub environments: Vec<String>,
}
