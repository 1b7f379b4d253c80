//! Lifecycle event fan-out to passive monitors.

use kiln_proto::{MonitorEvent, WorkerSummary};

use crate::peer::{ConnectionId, Outbound, Peer};

/// Connected monitors.
///
/// Delivery is fire-and-forget through each monitor's bounded queue. A full
/// queue drops the event for that monitor only; a closed one unsubscribes it.
#[derive(Debug, Default)]
pub struct MonitorHub {
    subscribers: Vec<Peer>,
}

impl MonitorHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a monitor after replaying the current workers to it as
    /// `workerAdded` events.
    pub fn subscribe<I>(&mut self, peer: Peer, workers: I)
    where
        I: IntoIterator<Item = WorkerSummary>,
    {
        for summary in workers {
            if !peer.send(Outbound::Monitor(MonitorEvent::WorkerAdded(summary))) {
                return;
            }
        }
        tracing::debug!(conn = %peer.id, monitors = self.subscribers.len() + 1, "Monitor subscribed");
        self.subscribers.push(peer);
    }

    pub fn unsubscribe(&mut self, connection: ConnectionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|p| p.id != connection);
        before != self.subscribers.len()
    }

    /// Sends an event to every monitor.
    pub fn publish(&mut self, event: &MonitorEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        self.subscribers
            .retain(|peer| peer.send(Outbound::Monitor(event.clone())));
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
