//! Ordered delivery to worker connections.
//!
//! Everything the scheduler tells a worker goes through that connection's
//! [`WorkerOutbox`]: drop instructions, archive pushes and quit requests. One
//! task per connection drains it in order, so an archive's header and binary
//! frames are never interleaved with another archive or a control message.
//! Control messages wait for room in the peer queue rather than being dropped.

use kiln_proto::SchedulerMessage;
use std::collections::HashSet;
use tokio::sync::mpsc;

use crate::environments::{push_environment, StoredEnvironment};
use crate::peer::{Outbound, Peer};
use crate::scheduler::Command;

#[derive(Debug)]
enum Delivery {
    Message(SchedulerMessage),
    Environment(StoredEnvironment),
}

/// Queue of deliveries for one worker connection.
///
/// Dropping the outbox stops its task after the delivery in progress.
#[derive(Debug)]
pub struct WorkerOutbox {
    tx: mpsc::UnboundedSender<Delivery>,
    pushing: HashSet<String>,
}

impl WorkerOutbox {
    /// Spawns the delivery task for `peer`.
    ///
    /// Each finished push is reported back as [`Command::PushFinished`].
    pub fn spawn(peer: Peer, chunk_size: usize, commands: mpsc::WeakSender<Command>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain(peer, rx, chunk_size, commands));
        Self {
            tx,
            pushing: HashSet::new(),
        }
    }

    /// Queues a message behind any pending pushes. Returns `false` once the
    /// worker has gone away.
    pub fn send_message(&self, message: SchedulerMessage) -> bool {
        self.tx.send(Delivery::Message(message)).is_ok()
    }

    /// Queues an archive push unless one for the same hash is already queued.
    pub fn push(&mut self, environment: StoredEnvironment) -> bool {
        let hash = environment.descriptor.hash.clone();
        if self.pushing.contains(&hash) {
            return false;
        }
        if self.tx.send(Delivery::Environment(environment)).is_err() {
            return false;
        }
        self.pushing.insert(hash);
        true
    }

    pub fn is_pushing(&self, hash: &str) -> bool {
        self.pushing.contains(hash)
    }

    pub fn finished(&mut self, hash: &str) {
        self.pushing.remove(hash);
    }
}

async fn drain(
    peer: Peer,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    chunk_size: usize,
    commands: mpsc::WeakSender<Command>,
) {
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Message(message) => {
                if !peer.send_blocking(Outbound::Scheduler(message)).await {
                    break;
                }
            }
            Delivery::Environment(environment) => {
                let hash = environment.descriptor.hash.clone();
                if let Err(e) = push_environment(peer.clone(), environment, chunk_size).await {
                    tracing::warn!(conn = %peer.id, hash = %hash, error = %e, "Environment push failed");
                }
                if let Some(tx) = commands.upgrade() {
                    let _ = tx
                        .send(Command::PushFinished {
                            connection: peer.id,
                            hash,
                        })
                        .await;
                }
                if peer.is_closed() {
                    break;
                }
            }
        }
    }
    tracing::debug!(conn = %peer.id, "Worker outbox closed");
}
