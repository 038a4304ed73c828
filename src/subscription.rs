//! Subscription lifecycle and the shared ingest queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::debug;

use crate::event::Event;
use crate::filter::Filter;
use crate::relay::{ConnState, RelayConnection};
use crate::wire::ClientRequest;

/// What a subscription delivers into the shared queue, paired with the
/// relay URI it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    EventAppeared(Event),
    Eose(String),
    Closed(String, String),
}

pub type IngestItem = (String, SubscriptionEvent);
pub type IngestSender = mpsc::UnboundedSender<IngestItem>;
pub type IngestReceiver = mpsc::UnboundedReceiver<IngestItem>;

/// Subscription state as seen from this side of the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubState {
    Open,
    EoseSeen,
    Closed,
}

/// Book-keeping for one `(relay, sub_id)` pair.
#[derive(Debug, Clone)]
pub struct SubEntry {
    pub relay: String,
    pub filters: Vec<Filter>,
    pub state: SubState,
    pub event_count: u64,
    pub byte_count: u64,
}

/// Registry shared between the manager and the relay tasks that feed it.
/// Lock scope is a few map operations; it is never held across awaits.
#[derive(Clone, Default)]
pub struct SubRegistry {
    inner: Arc<Mutex<HashMap<String, SubEntry>>>,
}

impl SubRegistry {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SubEntry>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, sub_id: &str) -> Option<SubEntry> {
        self.lock().get(sub_id).cloned()
    }

    /// Open subscriptions on one relay, for replay after a reconnect.
    pub fn open_on(&self, relay: &str) -> Vec<(String, Vec<Filter>)> {
        self.lock()
            .iter()
            .filter(|(_, e)| e.relay == relay && e.state != SubState::Closed)
            .map(|(id, e)| (id.clone(), e.filters.clone()))
            .collect()
    }

    pub fn ids_on(&self, relay: &str) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, e)| e.relay == relay)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub(crate) fn insert(&self, sub_id: String, entry: SubEntry) {
        self.lock().insert(sub_id, entry);
    }

    pub(crate) fn remove(&self, sub_id: &str) {
        self.lock().remove(sub_id);
    }

    /// Called from the owning relay task for each EVENT frame.
    pub(crate) fn record_event(&self, sub_id: &str, frame_bytes: usize) {
        if let Some(entry) = self.lock().get_mut(sub_id) {
            entry.event_count += 1;
            entry.byte_count += frame_bytes as u64;
        }
    }

    pub(crate) fn mark(&self, sub_id: &str, state: SubState) {
        if let Some(entry) = self.lock().get_mut(sub_id) {
            entry.state = state;
        }
    }
}

/// Allocates subscription ids and drives REQ/CLOSE on relay connections.
#[derive(Clone)]
pub struct SubscriptionManager {
    registry: SubRegistry,
    queue_tx: IngestSender,
}

/// Subscription setup failures.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SubscribeError {
    #[error("relay {0} is not connected")]
    NotConnected(String),
    #[error("relay {0} refused the request")]
    SendFailed(String),
}

impl SubscriptionManager {
    /// Build the manager together with the single consumer end of the
    /// ingest queue.
    pub fn new() -> (SubscriptionManager, IngestReceiver) {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        (
            SubscriptionManager {
                registry: SubRegistry::default(),
                queue_tx,
            },
            queue_rx,
        )
    }

    pub fn registry(&self) -> SubRegistry {
        self.registry.clone()
    }

    pub fn queue_sender(&self) -> IngestSender {
        self.queue_tx.clone()
    }

    /// Open a subscription on a connected relay and return its id.
    pub fn subscribe(
        &self,
        conn: &RelayConnection,
        filters: Vec<Filter>,
    ) -> Result<String, SubscribeError> {
        if conn.state() != ConnState::Connected {
            return Err(SubscribeError::NotConnected(conn.uri().to_string()));
        }
        let sub_id = new_sub_id();
        self.registry.insert(
            sub_id.clone(),
            SubEntry {
                relay: conn.uri().to_string(),
                filters: filters.clone(),
                state: SubState::Open,
                event_count: 0,
                byte_count: 0,
            },
        );
        let sent = conn.send(ClientRequest::Req {
            sub_id: sub_id.clone(),
            filters,
        });
        if !sent {
            self.registry.remove(&sub_id);
            return Err(SubscribeError::SendFailed(conn.uri().to_string()));
        }
        debug!(relay = conn.uri(), sub_id, "subscribed");
        Ok(sub_id)
    }

    /// Close one subscription. Idempotent: unknown ids are a no-op.
    pub fn stop(&self, conn: &RelayConnection, sub_id: &str) {
        if self.registry.get(sub_id).is_none() {
            return;
        }
        let _ = conn.send(ClientRequest::Close {
            sub_id: sub_id.to_string(),
        });
        self.registry.remove(sub_id);
        debug!(relay = conn.uri(), sub_id, "unsubscribed");
    }

    /// Close every subscription on one relay.
    pub fn stop_all(&self, conn: &RelayConnection) {
        for sub_id in self.registry.ids_on(conn.uri()) {
            self.stop(conn, &sub_id);
        }
    }
}

/// 16 lowercase hex characters from 64 bits of entropy.
fn new_sub_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}
