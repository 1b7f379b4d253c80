//! Messages sent by workers.

use serde::{Deserialize, Serialize};

use crate::codec::Envelope;
use crate::types::JobFinished;

/// Worker → Scheduler messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerMessage {
    /// Full list of environment hashes the worker currently holds.
    Environments { environments: Vec<String> },
    /// Periodic load report, 0.0 (idle) to 1.0 (saturated).
    Load { measure: f64 },
    /// A job finished on the worker.
    JobFinished(JobFinished),
    /// A job was aborted on the worker.
    JobAborted { id: i32 },
}

impl Envelope for WorkerMessage {
    const TYPES: &'static [&'static str] = &["environments", "load", "jobFinished", "jobAborted"];
}
