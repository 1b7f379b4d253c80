//! Dispatch engine: matching compile requests to workers.

use chrono::Utc;
use kiln_proto::{Assignment, ClientInfo, CompileRequest, JobStarted, WorkerEndpoint};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::compat::CompatibilityGraph;
use crate::peer::ConnectionId;
use crate::placement::{PlacementAlgorithm, PlacementRequest};
use crate::registry::{WorkerKey, WorkerRegistry};

/// Job id allocator.
///
/// Ids increase by one and wrap to 0 instead of reaching `i32::MAX`, so an
/// id is never negative and never equals the signed 32-bit maximum.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobIds {
    last: i32,
}

impl JobIds {
    #[must_use]
    pub const fn new() -> Self {
        Self { last: 0 }
    }

    /// Resumes allocation after `last`.
    #[must_use]
    pub const fn starting_after(last: i32) -> Self {
        Self { last }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> i32 {
        let next = self.last.saturating_add(1);
        self.last = if next >= i32::MAX || next < 0 { 0 } else { next };
        self.last
    }
}

/// Remembers which requester addresses were recently told to arm their
/// local concurrency limiter.
///
/// The first dispatch to an address raises the flag; every later dispatch
/// within the window pushes the expiry out without raising it again.
#[derive(Debug)]
pub struct KeepaliveTracker {
    window: Duration,
    expiries: HashMap<IpAddr, Instant>,
}

impl KeepaliveTracker {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            expiries: HashMap::new(),
        }
    }

    /// Records a dispatch to `ip` at `now`. Returns true if the flag must be
    /// raised.
    pub fn touch(&mut self, ip: IpAddr, now: Instant) -> bool {
        self.expiries.retain(|_, expiry| *expiry > now);
        let raise = !self.expiries.contains_key(&ip);
        self.expiries.insert(ip, now + self.window);
        raise
    }

    pub fn len(&self) -> usize {
        self.expiries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expiries.is_empty()
    }
}

/// At most one in-flight upload per environment hash.
#[derive(Debug, Default)]
pub struct PendingEnvironments {
    owners: HashMap<String, ConnectionId>,
}

impl PendingEnvironments {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the lock for `hash` on behalf of `owner`. Fails if held.
    pub fn try_acquire(&mut self, hash: &str, owner: ConnectionId) -> bool {
        if self.owners.contains_key(hash) {
            return false;
        }
        self.owners.insert(hash.to_owned(), owner);
        true
    }

    /// Releases the lock if `owner` holds it.
    pub fn release(&mut self, hash: &str, owner: ConnectionId) -> bool {
        if self.owners.get(hash) == Some(&owner) {
            self.owners.remove(hash);
            return true;
        }
        false
    }

    pub fn is_pending(&self, hash: &str) -> bool {
        self.owners.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// A job bound to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveJob {
    pub id: i32,
    pub worker: WorkerKey,
}

/// Result of a dispatch attempt.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub assignment: Assignment,
    /// Set when a worker was bound.
    pub started: Option<JobStarted>,
}

/// Requester identity as seen by the dispatcher.
#[derive(Debug, Clone)]
pub struct Requester {
    pub connection: ConnectionId,
    pub ip: IpAddr,
}

/// Worker selection plus in-flight job accounting.
pub struct Dispatcher {
    algorithm: Box<dyn PlacementAlgorithm>,
    job_ids: JobIds,
    keepalive: KeepaliveTracker,
    active: HashMap<ConnectionId, ActiveJob>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("algorithm", &self.algorithm.name())
            .field("job_ids", &self.job_ids)
            .field("active", &self.active.len())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(algorithm: Box<dyn PlacementAlgorithm>, keepalive_window: Duration) -> Self {
        Self {
            algorithm,
            job_ids: JobIds::new(),
            keepalive: KeepaliveTracker::new(keepalive_window),
            active: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_job_ids(mut self, job_ids: JobIds) -> Self {
        self.job_ids = job_ids;
        self
    }

    /// Selects a worker for a request whose environment is known to the
    /// cluster, binding the job to it on success.
    pub fn dispatch(
        &mut self,
        registry: &mut WorkerRegistry,
        graph: &CompatibilityGraph,
        request: &CompileRequest,
        requester: &Requester,
    ) -> DispatchOutcome {
        let placement = PlacementRequest {
            environments: graph.expand(&request.environment),
            affinity: request.affinity.clone(),
        };

        let selected = {
            let workers: Vec<_> = registry.iter().collect();
            self.algorithm.select_worker(&placement, &workers)
        };

        let mut assignment = Assignment::empty();
        assignment.maintain_semaphores = self.keepalive.touch(requester.ip, Instant::now());

        let Some(key) = selected else {
            tracing::info!(
                client = %requester.ip,
                environment = %request.environment,
                "No worker available"
            );
            return DispatchOutcome {
                assignment,
                started: None,
            };
        };

        // A connection carries one job; rebinding releases the previous one.
        self.release(registry, requester.connection);

        registry.record_job_started(&key, Utc::now());
        let id = self.job_ids.next();
        self.active.insert(requester.connection, ActiveJob { id, worker: key });

        let Some(worker) = registry.get(&key) else {
            return DispatchOutcome {
                assignment,
                started: None,
            };
        };

        tracing::info!(
            job = id,
            client = %requester.ip,
            source_file = request.source_file.as_deref().unwrap_or(""),
            worker = %key,
            active_jobs = self.active.len(),
            "Dispatched job"
        );

        assignment.id = Some(id);
        assignment.ip = Some(key.ip.to_string());
        assignment.hostname = worker.hostname.clone();
        assignment.port = Some(key.port);

        let started = JobStarted {
            id,
            client: ClientInfo {
                hostname: request.client_hostname.clone(),
                ip: requester.ip.to_string(),
                name: request.client_name.clone(),
            },
            source_file: request.source_file.clone(),
            worker: WorkerEndpoint {
                hostname: worker.hostname.clone(),
                ip: key.ip.to_string(),
                name: worker.name.clone(),
                port: key.port,
            },
        };

        DispatchOutcome {
            assignment,
            started: Some(started),
        }
    }

    /// Unbinds the job held by a requester connection.
    ///
    /// Safe to call any number of times; only the first call after a bind
    /// decrements the counters.
    pub fn release(&mut self, registry: &mut WorkerRegistry, connection: ConnectionId) -> Option<ActiveJob> {
        let job = self.active.remove(&connection)?;
        registry.release(&job.worker);
        tracing::debug!(job = job.id, worker = %job.worker, active_jobs = self.active.len(), "Released job");
        Some(job)
    }

    /// Global count of jobs bound to workers.
    pub fn active_jobs(&self) -> usize {
        self.active.len()
    }

    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.name()
    }
}
