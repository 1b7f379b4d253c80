//! Placement algorithms for worker selection.

use std::cmp::Ordering;

use crate::registry::{WorkerInfo, WorkerKey};

/// What a job needs from a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementRequest {
    /// Acceptable environment hashes: the requested one first, then every
    /// compatible substitute.
    pub environments: Vec<String>,
    /// Worker address or name the job asked for.
    pub affinity: Option<String>,
}

impl PlacementRequest {
    /// True if the worker holds any acceptable environment.
    pub fn is_eligible(&self, worker: &WorkerInfo) -> bool {
        self.environments.iter().any(|h| worker.environments.contains(h))
    }

    fn is_preferred(&self, worker: &WorkerInfo) -> bool {
        self.affinity.as_deref().is_some_and(|target| worker.matches(target))
    }
}

/// Trait for placement algorithms.
pub trait PlacementAlgorithm: Send + Sync {
    /// Selects a worker for the request.
    ///
    /// Returns `None` if no registered worker holds an acceptable
    /// environment.
    fn select_worker(&self, request: &PlacementRequest, workers: &[&WorkerInfo]) -> Option<WorkerKey>;

    /// Returns the algorithm name.
    fn name(&self) -> &'static str;
}

/// Capacity-and-load scoring.
///
/// Each eligible worker scores `available * (1 - load)` where `available` is
/// its free slots capped at `max_parallelism`. A worker named by the job's
/// affinity scores infinitely high. Ties go first to a worker that still has
/// a free slot, then to the one whose last job is oldest (a worker that never
/// ran a job counts as oldest).
#[derive(Debug, Clone, Copy)]
pub struct CapacityScore {
    max_parallelism: u32,
}

impl CapacityScore {
    #[must_use]
    pub const fn new(max_parallelism: u32) -> Self {
        Self { max_parallelism }
    }

    /// Free slots credited to a worker; negative when over-subscribed.
    #[must_use]
    pub fn available(&self, worker: &WorkerInfo) -> i64 {
        let free = i64::from(worker.slots) - i64::from(worker.active_clients);
        free.min(i64::from(self.max_parallelism))
    }

    /// Score ignoring affinity.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn score(&self, worker: &WorkerInfo) -> f64 {
        self.available(worker) as f64 * (1.0 - worker.load.clamp(0.0, 1.0))
    }
}

impl Default for CapacityScore {
    fn default() -> Self {
        Self::new(4)
    }
}

struct Scored<'a> {
    worker: &'a WorkerInfo,
    score: f64,
    has_room: bool,
}

impl Scored<'_> {
    /// True if `self` should replace `best`.
    fn beats(&self, best: &Self) -> bool {
        match self.score.partial_cmp(&best.score) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Less) => false,
            _ => {
                if self.has_room != best.has_room {
                    return self.has_room;
                }
                self.worker.stats.last_job < best.worker.stats.last_job
            }
        }
    }
}

impl PlacementAlgorithm for CapacityScore {
    fn select_worker(&self, request: &PlacementRequest, workers: &[&WorkerInfo]) -> Option<WorkerKey> {
        let mut best: Option<Scored<'_>> = None;

        for &worker in workers {
            if !request.is_eligible(worker) {
                continue;
            }
            let candidate = Scored {
                worker,
                score: if request.is_preferred(worker) {
                    f64::INFINITY
                } else {
                    self.score(worker)
                },
                has_room: self.available(worker) > 0,
            };
            match &best {
                Some(current) if !candidate.beats(current) => {}
                _ => best = Some(candidate),
            }
        }

        best.map(|b| b.worker.key)
    }

    fn name(&self) -> &'static str {
        "capacity_score"
    }
}
