//! Monitor protocol: lifecycle events and administrative requests.

use serde::{Deserialize, Serialize};

use crate::codec::Envelope;
use crate::types::{Configuration, JobFinished, JobStarted, WorkerSummary};

/// Requesting client, as shown to monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub hostname: Option<String>,
    pub ip: String,
    pub name: Option<String>,
}

/// Worker endpoint, as shown to monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerEndpoint {
    pub hostname: Option<String>,
    pub ip: String,
    pub name: Option<String>,
    pub port: u16,
}

/// Scheduler → Monitor lifecycle events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MonitorEvent {
    /// First message on every monitor connection.
    Hello { nonce: String },
    WorkerAdded(WorkerSummary),
    WorkerRemoved(WorkerSummary),
    JobStarted(JobStarted),
    JobFinished(JobFinished),
    JobAborted { id: i32 },
}

/// A change to the compatibility graph.
///
/// Exactly one of `add` and `remove` must be present, holding a pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationChange {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub add: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove: Option<Vec<String>>,
}

/// Login credentials: a password, or an HMAC of the session nonce keyed by a
/// previously issued cookie.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

/// Monitor → Scheduler requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MonitorMessage {
    ReadConfiguration,
    WriteConfiguration(ConfigurationChange),
    ListUsers,
    AddUser {
        #[serde(default)]
        user: String,
        #[serde(default)]
        password: String,
    },
    RemoveUser {
        #[serde(default)]
        user: String,
    },
    Login(LoginRequest),
}

impl Envelope for MonitorMessage {
    const TYPES: &'static [&'static str] = &[
        "readConfiguration",
        "writeConfiguration",
        "listUsers",
        "addUser",
        "removeUser",
        "login",
    ];
}

impl MonitorMessage {
    /// The reply kind answering this request.
    #[must_use]
    pub const fn reply_kind(&self) -> ReplyKind {
        match self {
            Self::ReadConfiguration => ReplyKind::ReadConfiguration,
            Self::WriteConfiguration(_) => ReplyKind::WriteConfiguration,
            Self::ListUsers => ReplyKind::ListUsers,
            Self::AddUser { .. } => ReplyKind::AddUser,
            Self::RemoveUser { .. } => ReplyKind::RemoveUser,
            Self::Login(_) => ReplyKind::Login,
        }
    }
}

/// Which request a [`MonitorReply`] answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReplyKind {
    ReadConfiguration,
    WriteConfiguration,
    ListUsers,
    AddUser,
    RemoveUser,
    Login,
}

/// Reply to a monitor request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorReply {
    #[serde(rename = "type")]
    pub kind: ReplyKind,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<Configuration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
}

impl MonitorReply {
    /// A successful reply with no payload.
    #[must_use]
    pub const fn ok(kind: ReplyKind) -> Self {
        Self {
            kind,
            success: true,
            error: None,
            configuration: None,
            users: None,
            user: None,
            cookie: None,
        }
    }

    /// A failed reply.
    pub fn failed(kind: ReplyKind, error: impl ToString) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::ok(kind)
        }
    }

    /// Attaches the scheduler configuration.
    #[must_use]
    pub fn with_configuration(mut self, configuration: Configuration) -> Self {
        self.configuration = Some(configuration);
        self
    }

    /// Attaches a user list.
    #[must_use]
    pub fn with_users(mut self, users: Vec<String>) -> Self {
        self.users = Some(users);
        self
    }

    /// Attaches the acting user and an issued session cookie.
    #[must_use]
    pub fn with_session(mut self, user: impl Into<String>, cookie: Option<String>) -> Self {
        self.user = Some(user.into());
        self.cookie = cookie;
        self
    }
}
