//! Connection identity and outbound queues.

use bytes::Bytes;
use kiln_proto::{MonitorEvent, MonitorReply, SchedulerMessage};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Process-unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocates the next identifier.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A frame queued for a peer's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Scheduler(SchedulerMessage),
    Monitor(MonitorEvent),
    Reply(MonitorReply),
    Binary(Bytes),
    /// Flush what is queued, then close the connection.
    Close,
}

/// Handle on a connected peer's outbound queue.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
}

impl Peer {
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Outbound>) -> Self {
        Self { id, tx }
    }

    /// Creates a peer with a fresh identifier and its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(ConnectionId::next(), tx), rx)
    }

    /// Queues a frame without waiting.
    ///
    /// Returns `false` once the peer has gone away. A full queue drops the
    /// frame and keeps the peer.
    pub fn send(&self, frame: Outbound) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(conn = %self.id, "Outbound queue full, dropping frame");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub fn send_message(&self, message: SchedulerMessage) -> bool {
        self.send(Outbound::Scheduler(message))
    }

    pub fn close(&self) -> bool {
        self.send(Outbound::Close)
    }

    /// Queues a frame, waiting for room. Worker outboxes send through this so
    /// that no archive chunk or control message is lost.
    pub async fn send_blocking(&self, frame: Outbound) -> bool {
        self.tx.send(frame).await.is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
