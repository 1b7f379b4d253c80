//! Shared protocol data types.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::monitor::{ClientInfo, WorkerEndpoint};

/// Variant used when an uploader does not name one.
pub const DEFAULT_VARIANT: &str = "default";

/// Identity and metadata of an environment archive.
///
/// The three parts form the on-disk name `hash:system:variant.tar.gz`, so
/// none of them may contain a separator or path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    /// Content hash of the toolchain.
    pub hash: String,
    /// Architecture/system the toolchain targets.
    pub system: String,
    /// Free-form variant tag.
    #[serde(default = "default_variant")]
    pub variant: String,
}

fn default_variant() -> String {
    DEFAULT_VARIANT.to_owned()
}

impl EnvironmentDescriptor {
    /// Creates a descriptor with the default variant.
    pub fn new(hash: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            system: system.into(),
            variant: default_variant(),
        }
    }

    /// Sets the variant.
    #[must_use]
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = variant.into();
        self
    }

    /// Validates that every part is usable as a file name component.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        for (field, value) in [
            ("hash", &self.hash),
            ("system", &self.system),
            ("variant", &self.variant),
        ] {
            if value.is_empty() {
                return Err(ProtocolError::InvalidDescriptor(format!("{field} is empty")));
            }
            if value
                .chars()
                .any(|c| matches!(c, ':' | '/' | '\\' | '\0') || c.is_control())
                || value == "."
                || value == ".."
            {
                return Err(ProtocolError::InvalidDescriptor(format!(
                    "{field} contains a forbidden character: {value:?}"
                )));
            }
        }
        Ok(())
    }

    /// Archive file name for this descriptor.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}:{}:{}.tar.gz", self.hash, self.system, self.variant)
    }

    /// Parses an archive file name produced by [`Self::file_name`].
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".tar.gz")?;
        let mut parts = stem.split(':');
        let descriptor = Self {
            hash: parts.next()?.to_owned(),
            system: parts.next()?.to_owned(),
            variant: parts.next()?.to_owned(),
        };
        if parts.next().is_some() || descriptor.validate().is_err() {
            return None;
        }
        Some(descriptor)
    }
}

/// Summarised projection of a worker sent to monitors.
///
/// Carries derived speeds rather than the raw statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    pub ip: String,
    pub port: u16,
    pub name: Option<String>,
    pub hostname: Option<String>,
    pub system: Option<String>,
    pub slots: u32,
    pub jobs_performed: u64,
    /// Jobs performed per second of total compile time.
    pub compile_speed: f64,
    /// Jobs performed per second of total upload time.
    pub upload_speed: f64,
    pub created: DateTime<Utc>,
    pub version: Option<String>,
    pub environments: Vec<String>,
}

/// A dispatched job, as announced to monitors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStarted {
    pub id: i32,
    pub client: ClientInfo,
    pub source_file: Option<String>,
    pub worker: WorkerEndpoint,
}

/// Outcome metrics of a finished job, reported by a worker.
///
/// Durations are in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFinished {
    pub id: i32,
    #[serde(default)]
    pub cpp_size: u64,
    #[serde(default)]
    pub compile_duration: u64,
    #[serde(default)]
    pub upload_duration: u64,
}

/// Readable scheduler configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    pub compatible_hashes: BTreeMap<String, BTreeSet<String>>,
}
