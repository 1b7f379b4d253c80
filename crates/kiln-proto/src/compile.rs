//! Compile requester messages and scheduler replies.

use serde::{Deserialize, Serialize};

use crate::codec::Envelope;
use crate::types::EnvironmentDescriptor;

/// A compile request, assembled from handshake headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileRequest {
    /// Environment hash the job requires.
    pub environment: String,
    /// Source file being compiled.
    pub source_file: Option<String>,
    /// Name of the requesting client.
    pub client_name: Option<String>,
    /// Hostname of the requesting client.
    pub client_hostname: Option<String>,
    /// Worker address or name the job should prefer.
    pub affinity: Option<String>,
}

impl CompileRequest {
    /// Creates a request for an environment with no other attributes.
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            environment: environment.into(),
            source_file: None,
            client_name: None,
            client_hostname: None,
            affinity: None,
        }
    }

    /// Sets the worker affinity.
    #[must_use]
    pub fn with_affinity(mut self, affinity: impl Into<String>) -> Self {
        self.affinity = Some(affinity.into());
        self
    }

    /// Sets the source file.
    #[must_use]
    pub fn with_source_file(mut self, source_file: impl Into<String>) -> Self {
        self.source_file = Some(source_file.into());
        self
    }
}

/// Requester → Scheduler messages (environment upload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UploadMessage {
    /// Announces the environment about to be uploaded.
    UploadEnvironment(EnvironmentDescriptor),
    /// Header for the next `bytes` of binary frames.
    UploadEnvironmentData { bytes: u64, last: bool },
}

impl Envelope for UploadMessage {
    const TYPES: &'static [&'static str] = &["uploadEnvironment", "uploadEnvironmentData"];
}

/// Worker assignment sent in reply to a compile request.
///
/// An assignment with no worker fields means no worker was available; the
/// client decides whether to retry or build locally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Asks the requester to arm its local concurrency limiter.
    #[serde(default, rename = "maintain_semaphores", skip_serializing_if = "std::ops::Not::not")]
    pub maintain_semaphores: bool,
}

impl Assignment {
    /// An assignment carrying no worker.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if a worker was assigned.
    #[must_use]
    pub const fn is_assigned(&self) -> bool {
        self.id.is_some()
    }
}

/// Header of an environment archive pushed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentTransfer {
    #[serde(flatten)]
    pub descriptor: EnvironmentDescriptor,
    /// Archive size; this many binary bytes follow.
    pub bytes: u64,
}

/// Asks a worker to shut down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuitRequest {
    pub code: i32,
    pub purge_environments: bool,
}

/// Scheduler → Worker/Requester messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SchedulerMessage {
    /// The requester must upload the environment before it can be scheduled.
    NeedsEnvironment { environment: String },
    /// Worker assignment for a compile request.
    #[serde(rename = "slave")]
    Assignment(Assignment),
    /// The worker should delete these environments.
    DropEnvironments { environments: Vec<String> },
    /// An environment archive follows as binary frames.
    Environment(EnvironmentTransfer),
    /// The worker should exit.
    Quit(QuitRequest),
    /// The peer violated the protocol or the request failed.
    Error { error: String },
}

impl SchedulerMessage {
    /// Creates an error envelope.
    pub fn error(error: impl ToString) -> Self {
        Self::Error {
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::Codec;

    #[test]
    fn empty_assignment_is_bare_envelope() {
        let text = Codec::encode(&SchedulerMessage::Assignment(Assignment::empty())).unwrap();
        assert_eq!(text, r#"{"type":"slave"}"#);
    }

    #[test]
    fn assignment_carries_worker_and_hint() {
        let assignment = Assignment {
            id: Some(12),
            ip: Some("10.0.0.4".into()),
            hostname: Some("builder-4".into()),
            port: Some(8096),
            maintain_semaphores: true,
        };
        let value: serde_json::Value =
            serde_json::from_str(&Codec::encode(&SchedulerMessage::Assignment(assignment)).unwrap()).unwrap();
        assert_eq!(value["type"], "slave");
        assert_eq!(value["id"], 12);
        assert_eq!(value["port"], 8096);
        assert_eq!(value["maintain_semaphores"], true);
    }

    #[test]
    fn upload_data_header_decodes() {
        let msg: UploadMessage =
            Codec::decode(r#"{"type":"uploadEnvironmentData","bytes":4096,"last":true}"#).unwrap();
        assert_eq!(msg, UploadMessage::UploadEnvironmentData { bytes: 4096, last: true });
    }

    #[test]
    fn environment_transfer_flattens_descriptor() {
        let msg = SchedulerMessage::Environment(EnvironmentTransfer {
            descriptor: EnvironmentDescriptor::new("abc", "x86_64"),
            bytes: 10,
        });
        let value: serde_json::Value = serde_json::from_str(&Codec::encode(&msg).unwrap()).unwrap();
        assert_eq!(value["type"], "environment");
        assert_eq!(value["hash"], "abc");
        assert_eq!(value["bytes"], 10);
    }

    #[test]
    fn quit_uses_camel_case() {
        let msg = SchedulerMessage::Quit(QuitRequest {
            code: 3,
            purge_environments: true,
        });
        let text = Codec::encode(&msg).unwrap();
        assert!(text.contains(r#""purgeEnvironments":true"#));
    }
}
