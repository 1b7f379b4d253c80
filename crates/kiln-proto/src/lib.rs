//! Wire protocol types for kiln peer communication.
//!
//! Every peer talks to the scheduler over a WebSocket. The role of the peer is
//! fixed at connect time (`/worker`, `/compile`, `/monitor`), and each role
//! has its own closed set of message types:
//!
//! - **Worker → Scheduler**: [`WorkerMessage`]
//! - **Requester → Scheduler**: [`UploadMessage`]
//! - **Monitor → Scheduler**: [`MonitorMessage`]
//! - **Scheduler → Worker/Requester**: [`SchedulerMessage`]
//! - **Scheduler → Monitor**: [`MonitorEvent`], [`MonitorReply`]
//!
//! # Wire Format
//!
//! Structured messages are JSON text frames tagged by a `type` field:
//!
//! ```text
//! {"type":"uploadEnvironmentData","bytes":65536,"last":false}
//! ```
//!
//! Binary payloads (environment archives) travel as binary frames. A
//! structured message declaring `bytes` opens a run, and the following binary
//! frames are consumed against it before text parsing resumes. See
//! [`BinaryRun`].

pub mod codec;
mod compile;
mod error;
mod monitor;
mod types;
mod worker;

pub use codec::{BinaryRun, Codec, Envelope, MAX_BINARY_RUN_SIZE, MAX_TEXT_MESSAGE_SIZE};
pub use compile::{Assignment, CompileRequest, EnvironmentTransfer, QuitRequest, SchedulerMessage, UploadMessage};
pub use error::ProtocolError;
pub use monitor::{
    ClientInfo, ConfigurationChange, LoginRequest, MonitorEvent, MonitorMessage, MonitorReply, ReplyKind,
    WorkerEndpoint,
};
pub use types::{Configuration, EnvironmentDescriptor, JobFinished, JobStarted, WorkerSummary, DEFAULT_VARIANT};
pub use worker::WorkerMessage;

/// Request header names used during the WebSocket handshake.
pub mod headers {
    /// Port the worker accepts compile jobs on.
    pub const PORT: &str = "x-kiln-port";
    /// `;`-separated environment hashes a worker holds.
    pub const ENVIRONMENTS: &str = "x-kiln-environments";
    /// Declared slot capacity of a worker.
    pub const SLOTS: &str = "x-kiln-slots";
    /// Human name of a worker.
    pub const NAME: &str = "x-kiln-name";
    /// Hostname of a worker.
    pub const HOSTNAME: &str = "x-kiln-hostname";
    /// System/architecture string reported by a worker.
    pub const SYSTEM: &str = "x-kiln-system";
    /// Client software version reported by a worker.
    pub const VERSION: &str = "x-kiln-version";

    /// Environment hash a compile request requires.
    pub const ENVIRONMENT: &str = "x-kiln-environment";
    /// Source file being compiled.
    pub const SOURCE_FILE: &str = "x-kiln-sourcefile";
    /// Name of the requesting client.
    pub const CLIENT_NAME: &str = "x-kiln-client-name";
    /// Hostname of the requesting client.
    pub const CLIENT_HOSTNAME: &str = "x-kiln-client-hostname";
    /// Explicit worker affinity (address or name).
    pub const WORKER: &str = "x-kiln-worker";
}
