use std::{collections::HashMap, fmt};

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::{ChannelError, Result},
    message::{Envelope, QueueType},
};

/// Opaque identifier for one logical stream on a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(String);

impl StreamId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Default)]
struct StreamEntry {
    bound_to: Option<String>,
    consumer: Option<RouteConsumer>,
}

struct RouteConsumer {
    route: String,
    sender: mpsc::Sender<Envelope>,
}

#[derive(Default)]
struct RegistryState {
    streams: HashMap<StreamId, StreamEntry>,
    // Per route, the index of the point-to-point consumer to try first.
    next_consumer: HashMap<String, usize>,
}

/// Table of the streams open on one connection.
///
/// Owned by the connection rather than shared process-wide, so every test (and every
/// connection) starts from an empty table.
pub struct StreamRegistry {
    state: Mutex<RegistryState>,
    max_streams: Option<usize>,
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::with_max_streams(None)
    }

    /// A registry that refuses new streams once `max_streams` are open.
    pub fn with_max_streams(max_streams: Option<usize>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            max_streams,
        }
    }

    pub fn max_streams(&self) -> Option<usize> {
        self.max_streams
    }

    /// Register `id` unless it is already present. Returns whether it was inserted.
    ///
    /// The duplicate check, the capacity check and the insert happen under one lock.
    pub async fn try_insert(&self, id: &StreamId) -> Result<bool> {
        let mut state = self.state.lock().await;
        if state.streams.contains_key(id) {
            return Ok(false);
        }
        if let Some(limit) = self.max_streams {
            if state.streams.len() >= limit {
                return Err(ChannelError::TooManyStreams { limit });
            }
        }
        state.streams.insert(id.clone(), StreamEntry::default());
        Ok(true)
    }

    /// Remove `id`, returning how many streams remain, or `None` if it was unknown.
    pub async fn remove(&self, id: &StreamId) -> Option<usize> {
        let mut state = self.state.lock().await;
        state.streams.remove(id).map(|_| state.streams.len())
    }

    pub async fn contains(&self, id: &StreamId) -> bool {
        self.state.lock().await.streams.contains_key(id)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.streams.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.streams.is_empty()
    }

    pub async fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.state.lock().await.streams.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn bound_to(&self, id: &StreamId) -> Option<String> {
        let state = self.state.lock().await;
        state.streams.get(id).and_then(|entry| entry.bound_to.clone())
    }

    pub(crate) async fn bind(&self, id: &StreamId, queue: &str) -> bool {
        let mut state = self.state.lock().await;
        match state.streams.get_mut(id) {
            Some(entry) => {
                entry.bound_to = Some(queue.to_string());
                true
            }
            None => false,
        }
    }

    /// Attach an inbound queue for `route` to the stream, replacing any earlier one.
    pub(crate) async fn subscribe(
        &self,
        id: &StreamId,
        route: &str,
        capacity: usize,
    ) -> Option<mpsc::Receiver<Envelope>> {
        let mut state = self.state.lock().await;
        let entry = state.streams.get_mut(id)?;
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        entry.consumer = Some(RouteConsumer {
            route: route.to_string(),
            sender,
        });
        Some(receiver)
    }

    pub(crate) async fn unsubscribe(&self, id: &StreamId) {
        if let Some(entry) = self.state.lock().await.streams.get_mut(id) {
            entry.consumer = None;
        }
    }

    /// Hand an inbound envelope to the streams consuming its route.
    ///
    /// `PUBSUB` envelopes go to every consumer. `P2P` envelopes go to exactly one,
    /// rotating through the consumers and skipping full or closed queues. Never
    /// blocks the reader: a full inbound queue drops the envelope for that stream.
    pub(crate) async fn dispatch(&self, envelope: Envelope) -> usize {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let mut consumers: Vec<_> = state
            .streams
            .iter()
            .filter_map(|(id, entry)| {
                entry
                    .consumer
                    .as_ref()
                    .filter(|consumer| consumer.route == envelope.route)
                    .map(|consumer| (id, &consumer.sender))
            })
            .collect();
        consumers.sort_by(|a, b| a.0.cmp(b.0));

        match envelope.queue_type {
            QueueType::PubSub => consumers
                .iter()
                .filter(|(id, sender)| offer(id, sender, &envelope))
                .count(),
            QueueType::PointToPoint => {
                let count = consumers.len();
                let start = state.next_consumer.get(&envelope.route).copied().unwrap_or(0);
                for offset in 0..count {
                    let index = (start + offset) % count;
                    let (id, sender) = consumers[index];
                    if offer(id, sender, &envelope) {
                        state.next_consumer.insert(envelope.route.clone(), index + 1);
                        return 1;
                    }
                }
                if count > 0 {
                    warn!(route = %envelope.route, "no consumer accepted point-to-point message");
                }
                0
            }
        }
    }

    /// Drop every subscription so consumers observe the end of their stream.
    pub(crate) async fn close_subscriptions(&self) {
        for entry in self.state.lock().await.streams.values_mut() {
            entry.consumer = None;
        }
    }

    pub(crate) async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.streams.clear();
        state.next_consumer.clear();
    }
}

fn offer(id: &StreamId, sender: &mpsc::Sender<Envelope>, envelope: &Envelope) -> bool {
    match sender.try_send(envelope.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(stream = %id, route = %envelope.route, "inbound queue full, dropping message");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(stream = %id, route = %envelope.route, "consumer went away");
            false
        }
    }
}
