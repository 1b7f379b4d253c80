//! Content-addressed environment archive store.
//!
//! Archives live in a single directory as `hash:system:variant.tar.gz`. An
//! upload writes to `<name>.partial` and is renamed into place on completion,
//! so a complete archive is never observed half-written. Leftover partial
//! files from a previous run are deleted on load.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use kiln_proto::{EnvironmentDescriptor, EnvironmentTransfer, SchedulerMessage};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Result, SchedulerError};
use crate::peer::{Outbound, Peer};

const PARTIAL_SUFFIX: &str = ".partial";

/// A complete, servable archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredEnvironment {
    #[serde(flatten)]
    pub descriptor: EnvironmentDescriptor,
    pub size: u64,
    pub created: DateTime<Utc>,
    #[serde(skip)]
    pub path: PathBuf,
}

/// Write target for an archive being received.
#[derive(Debug)]
pub struct EnvironmentWriter {
    descriptor: EnvironmentDescriptor,
    partial: PathBuf,
    file: File,
    written: u64,
}

impl EnvironmentWriter {
    /// Appends a chunk. Chunks must arrive in order; the caller awaits each
    /// append before accepting the next.
    pub async fn append(&mut self, chunk: &[u8]) -> Result<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| SchedulerError::storage(&self.partial, e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn descriptor(&self) -> &EnvironmentDescriptor {
        &self.descriptor
    }

    pub fn hash(&self) -> &str {
        &self.descriptor.hash
    }

    /// Bytes appended so far.
    pub const fn written(&self) -> u64 {
        self.written
    }
}

/// Environment archive store.
#[derive(Debug)]
pub struct EnvironmentStore {
    dir: PathBuf,
    complete: BTreeMap<String, StoredEnvironment>,
    receiving: HashSet<String>,
}

impl EnvironmentStore {
    /// Loads the store from `dir`, creating it if needed.
    pub async fn load(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SchedulerError::storage(&dir, e))?;

        let mut complete = BTreeMap::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| SchedulerError::storage(&dir, e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SchedulerError::storage(&dir, e))?
        {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.ends_with(PARTIAL_SUFFIX) {
                tracing::info!(file = %name, "Removing leftover partial environment");
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(file = %name, error = %e, "Failed to remove partial environment");
                }
                continue;
            }

            let Some(descriptor) = EnvironmentDescriptor::from_file_name(name) else {
                tracing::debug!(file = %name, "Ignoring unrecognised file in environments directory");
                continue;
            };

            let metadata = entry
                .metadata()
                .await
                .map_err(|e| SchedulerError::storage(&path, e))?;
            let created = metadata
                .created()
                .or_else(|_| metadata.modified())
                .map_or_else(|_| Utc::now(), DateTime::<Utc>::from);

            complete.insert(
                descriptor.hash.clone(),
                StoredEnvironment {
                    descriptor,
                    size: metadata.len(),
                    created,
                    path,
                },
            );
        }

        tracing::info!(dir = %dir.display(), count = complete.len(), "Loaded environments");

        Ok(Self {
            dir,
            complete,
            receiving: HashSet::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// True if a complete archive with this hash is stored.
    pub fn has(&self, hash: &str) -> bool {
        self.complete.contains_key(hash)
    }

    /// True if an upload of this hash is in progress.
    pub fn is_receiving(&self, hash: &str) -> bool {
        self.receiving.contains(hash)
    }

    pub fn get(&self, hash: &str) -> Option<&StoredEnvironment> {
        self.complete.get(hash)
    }

    /// Creates a write target for an incoming archive.
    ///
    /// Returns `Ok(None)` if the hash is already complete or being received;
    /// the caller treats that as a duplicate transfer.
    pub async fn prepare(&mut self, descriptor: EnvironmentDescriptor) -> Result<Option<EnvironmentWriter>> {
        descriptor.validate()?;
        if self.has(&descriptor.hash) || self.is_receiving(&descriptor.hash) {
            return Ok(None);
        }

        let partial = self
            .dir
            .join(format!("{}{PARTIAL_SUFFIX}", descriptor.file_name()));
        self.receiving.insert(descriptor.hash.clone());

        match File::create(&partial).await {
            Ok(file) => {
                tracing::debug!(hash = %descriptor.hash, "Receiving environment");
                Ok(Some(EnvironmentWriter {
                    descriptor,
                    partial,
                    file,
                    written: 0,
                }))
            }
            Err(e) => {
                self.receiving.remove(&descriptor.hash);
                Err(SchedulerError::storage(&partial, e))
            }
        }
    }

    /// Moves a received archive into place and records it as complete.
    ///
    /// On failure the partial data is deleted and the hash is released.
    pub async fn complete(&mut self, writer: EnvironmentWriter) -> Result<&StoredEnvironment> {
        let hash = writer.descriptor.hash.clone();
        self.receiving.remove(&hash);

        let EnvironmentWriter {
            descriptor,
            partial,
            mut file,
            ..
        } = writer;

        let path = self.dir.join(descriptor.file_name());
        let finished = async {
            file.flush().await.map_err(|e| SchedulerError::storage(&partial, e))?;
            file.sync_all()
                .await
                .map_err(|e| SchedulerError::storage(&partial, e))?;
            drop(file);
            tokio::fs::rename(&partial, &path)
                .await
                .map_err(|e| SchedulerError::storage(&path, e))?;
            tokio::fs::metadata(&path)
                .await
                .map_err(|e| SchedulerError::storage(&path, e))
        }
        .await;

        let metadata = match finished {
            Ok(metadata) => metadata,
            Err(e) => {
                remove_quietly(&partial).await;
                return Err(e);
            }
        };

        tracing::info!(hash = %hash, size = metadata.len(), "Environment complete");

        let entry = self.complete.entry(hash).or_insert(StoredEnvironment {
            descriptor,
            size: 0,
            created: Utc::now(),
            path,
        });
        entry.size = metadata.len();
        Ok(entry)
    }

    /// Abandons a transfer, deleting its partial data.
    pub async fn discard(&mut self, writer: EnvironmentWriter) {
        self.receiving.remove(writer.hash());
        tracing::info!(hash = %writer.hash(), written = writer.written, "Discarding partial environment");
        let EnvironmentWriter { partial, file, .. } = writer;
        drop(file);
        remove_quietly(&partial).await;
    }

    /// Removes a complete archive.
    pub async fn remove(&mut self, hash: &str) -> Result<bool> {
        let Some(entry) = self.complete.remove(hash) else {
            return Ok(false);
        };
        match tokio::fs::remove_file(&entry.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(SchedulerError::storage(&entry.path, e)),
        }
        tracing::info!(hash = %hash, size = entry.size, "Removed environment");
        Ok(true)
    }

    /// Removes every complete archive. Returns the number removed.
    pub async fn purge_all(&mut self) -> Result<usize> {
        let hashes: Vec<String> = self.complete.keys().cloned().collect();
        let mut removed = 0;
        for hash in hashes {
            if self.remove(&hash).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Complete archives, ordered by hash.
    pub fn list(&self) -> Vec<&StoredEnvironment> {
        self.complete.values().collect()
    }

    /// Hashes of every complete archive.
    pub fn hashes(&self) -> BTreeSet<String> {
        self.complete.keys().cloned().collect()
    }

    pub fn total_size(&self) -> u64 {
        self.complete.values().map(|e| e.size).sum()
    }

    pub fn len(&self) -> usize {
        self.complete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.complete.is_empty()
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove file");
        }
    }
}

/// Streams a stored archive to a worker: an `environment` header followed by
/// the archive as binary frames of at most `chunk_size` bytes.
///
/// Returns early without error if the worker disconnects mid-push.
pub async fn push_environment(peer: Peer, environment: StoredEnvironment, chunk_size: usize) -> Result<()> {
    let hash = environment.descriptor.hash.clone();
    let mut file = File::open(&environment.path)
        .await
        .map_err(|e| SchedulerError::storage(&environment.path, e))?;

    let header = SchedulerMessage::Environment(EnvironmentTransfer {
        descriptor: environment.descriptor,
        bytes: environment.size,
    });
    if !peer.send_blocking(Outbound::Scheduler(header)).await {
        return Ok(());
    }

    let mut remaining = environment.size;
    let mut buf = vec![0u8; chunk_size.max(1)];
    while remaining > 0 {
        let want = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
        let read = file
            .read(&mut buf[..want])
            .await
            .map_err(|e| SchedulerError::storage(&environment.path, e))?;
        if read == 0 {
            return Err(SchedulerError::storage(
                &environment.path,
                std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
            ));
        }
        if !peer
            .send_blocking(Outbound::Binary(Bytes::copy_from_slice(&buf[..read])))
            .await
        {
            tracing::debug!(hash = %hash, conn = %peer.id, "Worker went away during push");
            return Ok(());
        }
        remaining -= read as u64;
    }

    tracing::debug!(hash = %hash, conn = %peer.id, "Pushed environment");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn descriptor(hash: &str) -> EnvironmentDescriptor {
        EnvironmentDescriptor::new(hash, "x86_64")
    }

    #[tokio::test]
    async fn prepare_append_complete() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = EnvironmentStore::load(dir.path()).await.unwrap();

        let mut writer = store.prepare(descriptor("abc")).await.unwrap().unwrap();
        assert!(store.is_receiving("abc"));
        assert!(!store.has("abc"));

        writer.append(b"hello ").await.unwrap();
        writer.append(b"world").await.unwrap();
        let entry = store.complete(writer).await.unwrap();
        assert_eq!(entry.size, 11);

        assert!(store.has("abc"));
        assert!(!store.is_receiving("abc"));
        assert!(dir.path().join("abc:x86_64:default.tar.gz").exists());
        assert!(!dir.path().join("abc:x86_64:default.tar.gz.partial").exists());
    }

    #[tokio::test]
    async fn duplicate_prepare_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = EnvironmentStore::load(dir.path()).await.unwrap();

        let writer = store.prepare(descriptor("abc")).await.unwrap().unwrap();
        assert!(store.prepare(descriptor("abc")).await.unwrap().is_none());

        store.complete(writer).await.unwrap();
        assert!(store.prepare(descriptor("abc")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn discard_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = EnvironmentStore::load(dir.path()).await.unwrap();

        let mut writer = store.prepare(descriptor("abc")).await.unwrap().unwrap();
        writer.append(b"partial").await.unwrap();
        store.discard(writer).await;

        assert!(!store.has("abc"));
        assert!(!store.is_receiving("abc"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);

        // The hash can be uploaded again.
        assert!(store.prepare(descriptor("abc")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn invalid_descriptor_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = EnvironmentStore::load(dir.path()).await.unwrap();

        let err = store.prepare(descriptor("../escape")).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Protocol(_)));
    }

    #[tokio::test]
    async fn load_discovers_archives_and_drops_partials() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("aaa:x86_64:default.tar.gz"), b"12345").unwrap();
        std::fs::write(dir.path().join("bbb:arm64:clang.tar.gz.partial"), b"12").unwrap();
        std::fs::write(dir.path().join("README"), b"not an archive").unwrap();

        let store = EnvironmentStore::load(dir.path()).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("aaa").unwrap().size, 5);
        assert_eq!(store.total_size(), 5);
        assert!(!dir.path().join("bbb:arm64:clang.tar.gz.partial").exists());
        assert!(dir.path().join("README").exists());
    }

    #[tokio::test]
    async fn remove_and_purge() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("aaa:x86_64:default.tar.gz"), b"1").unwrap();
        std::fs::write(dir.path().join("bbb:x86_64:default.tar.gz"), b"2").unwrap();
        let mut store = EnvironmentStore::load(dir.path()).await.unwrap();

        assert!(store.remove("aaa").await.unwrap());
        assert!(!store.remove("aaa").await.unwrap());
        assert_eq!(store.hashes(), BTreeSet::from(["bbb".to_string()]));

        assert_eq!(store.purge_all().await.unwrap(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn push_streams_header_then_chunks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("aaa:x86_64:default.tar.gz"), b"0123456789").unwrap();
        let store = EnvironmentStore::load(dir.path()).await.unwrap();
        let environment = store.get("aaa").unwrap().clone();

        let (peer, mut rx) = Peer::channel(16);
        push_environment(peer, environment, 4).await.unwrap();

        match rx.recv().await.unwrap() {
            Outbound::Scheduler(SchedulerMessage::Environment(transfer)) => {
                assert_eq!(transfer.descriptor.hash, "aaa");
                assert_eq!(transfer.bytes, 10);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let mut received = Vec::new();
        while let Ok(Outbound::Binary(chunk)) = rx.try_recv() {
            assert!(chunk.len() <= 4);
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"0123456789");
    }

    #[tokio::test]
    async fn push_to_departed_worker_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("aaa:x86_64:default.tar.gz"), b"0123456789").unwrap();
        let store = EnvironmentStore::load(dir.path()).await.unwrap();
        let environment = store.get("aaa").unwrap().clone();

        let (peer, rx) = Peer::channel(1);
        drop(rx);
        push_environment(peer, environment, 4).await.unwrap();
    }
}
