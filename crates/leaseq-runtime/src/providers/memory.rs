//! In-memory visibility-timeout queue engine.
//!
//! Each queue owns two [`VisibilitySet`]s: pending messages waiting to be
//! delivered and in-flight messages leased to a consumer. A pull promotes
//! expired leases back to pending, takes the earliest visible message and
//! moves it to in-flight with a new lease expiry. All of that happens under a
//! single per-queue mutex, so two concurrent pulls can never lease the same
//! message. The registry lock is only held long enough to find or create a
//! queue; operations on different queues do not contend.
//!
//! The engine is also the materialised view behind
//! [`FileQueue`](crate::providers::FileQueue), which feeds it through the
//! `apply_*` replay entry points.

use crate::client::QueueProvider;
use crate::clock::Clock;
use crate::error::QueueError;
use crate::message::{
    DeleteOutcome, DeleteRequest, HandleGenerator, Message, PullRequest, PushRequest, QueueName,
    UuidHandleGenerator, VisibilityTimeout,
};
use crate::provider::ProviderType;
use crate::visibility::VisibilitySet;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Internal state for a single queue
#[derive(Debug, Default)]
struct QueueState {
    pending: VisibilitySet,
    in_flight: VisibilitySet,
}

impl QueueState {
    /// Move every lease that expired at or before `now_ms` back to pending.
    ///
    /// Stops at the first lease still in the future; everything after it
    /// expires later.
    fn promote_expired(&mut self, now_ms: i64) -> usize {
        let mut promoted = 0;
        while let Some(message) = self.in_flight.pop_due(now_ms) {
            self.pending.insert(message);
            promoted += 1;
        }
        promoted
    }
}

type SharedQueue = Arc<Mutex<QueueState>>;

fn lock_queue(queue: &SharedQueue) -> MutexGuard<'_, QueueState> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Point-in-time copy of a queue's contents, each set in visibility order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub pending: Vec<Message>,
    pub in_flight: Vec<Message>,
}

impl QueueSnapshot {
    /// Handles in each set, ignoring timestamps
    pub fn handles(&self) -> (Vec<String>, Vec<String>) {
        fn pick(set: &[Message]) -> Vec<String> {
            set.iter().map(|m| m.handle.clone()).collect()
        }
        (pick(&self.pending), pick(&self.in_flight))
    }
}

// ============================================================================
// InMemoryQueue
// ============================================================================

/// In-memory visibility-timeout queue engine
pub struct InMemoryQueue {
    queues: RwLock<HashMap<QueueName, SharedQueue>>,
    clock: Arc<dyn Clock>,
    handles: Arc<dyn HandleGenerator>,
}

impl InMemoryQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_handle_generator(clock, Arc::new(UuidHandleGenerator))
    }

    pub fn with_handle_generator(clock: Arc<dyn Clock>, handles: Arc<dyn HandleGenerator>) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            clock,
            handles,
        }
    }

    fn queue(&self, name: &QueueName) -> Option<SharedQueue> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn queue_or_create(&self, name: &QueueName) -> SharedQueue {
        if let Some(queue) = self.queue(name) {
            return queue;
        }
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(queues.entry(name.clone()).or_insert_with(|| {
            debug!(queue = %name, "Creating queue");
            Arc::new(Mutex::new(QueueState::default()))
        }))
    }

    fn all_queues(&self) -> Vec<(QueueName, SharedQueue)> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, queue)| (name.clone(), Arc::clone(queue)))
            .collect()
    }

    /// Current time according to the engine's clock
    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Build the message a push would store, without storing it
    fn new_message(
        &self,
        uri: &QueueName,
        content: String,
        handle: Option<String>,
    ) -> Message {
        let handle = handle
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| self.handles.next_handle());
        Message::new(uri.clone(), handle, content, self.clock.now_ms())
    }

    /// Push a message, visible immediately. Creates the queue on first use.
    pub fn push(&self, uri: &QueueName, content: String, handle: Option<String>) -> Message {
        let message = self.new_message(uri, content, handle);
        debug!(queue = %uri, handle = %message.handle, "Pushing message");
        self.apply_push(message.clone());
        message
    }

    /// Lease the earliest visible message, if any.
    ///
    /// Returns `Ok(None)` when the queue is empty or nothing is visible yet.
    pub fn pull(
        &self,
        uri: &QueueName,
        timeout: VisibilityTimeout,
    ) -> Result<Option<Message>, QueueError> {
        Ok(self.lease(uri, timeout)?.map(|(message, _)| message))
    }

    /// As [`pull`](Self::pull), also returning the visibility timestamp the
    /// message had while pending
    pub(crate) fn lease(
        &self,
        uri: &QueueName,
        timeout: VisibilityTimeout,
    ) -> Result<Option<(Message, i64)>, QueueError> {
        let queue = self.queue(uri).ok_or_else(|| QueueError::QueueNotFound {
            queue_name: uri.to_string(),
        })?;

        let mut state = lock_queue(&queue);
        let now = self.clock.now_ms();

        let promoted = state.promote_expired(now);
        if promoted > 0 {
            debug!(
                queue = %uri,
                promoted,
                pending = state.pending.len(),
                "Returned expired leases to pending"
            );
        }

        if state.pending.is_empty() {
            return Ok(None);
        }
        let Some(mut message) = state.pending.pop_due(now) else {
            return Ok(None);
        };

        let visible_since = message.visibility_timestamp;
        message.visibility_timestamp = now + timeout.as_millis();
        state.in_flight.insert(message.clone());

        debug!(
            queue = %uri,
            handle = %message.handle,
            lease_expires_at = message.visibility_timestamp,
            "Leased message"
        );
        Ok(Some((message, visible_since)))
    }

    /// Delete a leased message while its lease is still live.
    ///
    /// A lapsed lease is left alone: the message already belongs to the next
    /// consumer.
    pub fn delete(&self, message: &Message) -> Result<DeleteOutcome, QueueError> {
        let queue = self
            .queue(&message.uri)
            .ok_or_else(|| QueueError::QueueNotFound {
                queue_name: message.uri.to_string(),
            })?;

        let mut state = lock_queue(&queue);
        let now = self.clock.now_ms();

        let outcome = match state.in_flight.get(&message.handle) {
            None => DeleteOutcome::NotInFlight,
            Some(current) if current.visibility_timestamp > now => {
                state.in_flight.remove(&message.handle);
                DeleteOutcome::Deleted
            }
            Some(_) => DeleteOutcome::LeaseExpired,
        };

        match outcome {
            DeleteOutcome::Deleted => {
                info!(queue = %message.uri, handle = %message.handle, "Deleted message")
            }
            DeleteOutcome::LeaseExpired => {
                debug!(queue = %message.uri, handle = %message.handle, "Lease expired, not deleting")
            }
            _ => debug!(queue = %message.uri, handle = %message.handle, "Handle not in flight"),
        }
        Ok(outcome)
    }

    /// Promote expired leases for one queue; returns how many moved
    pub fn promote_expired(&self, uri: &QueueName) -> usize {
        match self.queue(uri) {
            Some(queue) => lock_queue(&queue).promote_expired(self.clock.now_ms()),
            None => 0,
        }
    }

    /// Promote expired leases in every known queue
    pub fn promote_all(&self) -> usize {
        self.all_queues()
            .iter()
            .map(|(_, queue)| lock_queue(queue).promote_expired(self.clock.now_ms()))
            .sum()
    }

    // ------------------------------------------------------------------------
    // Replay entry points
    // ------------------------------------------------------------------------

    /// Insert an already-built message into pending, keeping its handle.
    ///
    /// A handle already held by the queue is replaced.
    pub fn apply_push(&self, message: Message) {
        let queue = self.queue_or_create(&message.uri);
        let mut state = lock_queue(&queue);
        state.in_flight.remove(&message.handle);
        state.pending.insert(message);
    }

    /// Record a lease taken elsewhere, using the lease expiry in `message`
    pub fn apply_pull(&self, message: Message) {
        let queue = self.queue_or_create(&message.uri);
        let mut state = lock_queue(&queue);
        state.pending.remove(&message.handle);
        state.in_flight.remove(&message.handle);
        state.in_flight.insert(message);
    }

    /// Replay a delete issued at `recorded_at`.
    ///
    /// Only removes the lease `message` was pulled under, and only when the
    /// delete was issued before that lease expired.
    pub fn apply_delete(&self, message: &Message, recorded_at: i64) -> DeleteOutcome {
        let Some(queue) = self.queue(&message.uri) else {
            warn!(queue = %message.uri, handle = %message.handle, "Delete for unknown queue ignored");
            return DeleteOutcome::NotInFlight;
        };

        let mut state = lock_queue(&queue);
        match state.in_flight.get(&message.handle) {
            Some(current)
                if current.visibility_timestamp == message.visibility_timestamp
                    && recorded_at <= message.visibility_timestamp =>
            {
                state.in_flight.remove(&message.handle);
                DeleteOutcome::Deleted
            }
            Some(_) => DeleteOutcome::LeaseExpired,
            None => DeleteOutcome::NotInFlight,
        }
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn snapshot(&self, uri: &QueueName) -> Option<QueueSnapshot> {
        let queue = self.queue(uri)?;
        let state = lock_queue(&queue);
        Some(QueueSnapshot {
            pending: state.pending.iter().cloned().collect(),
            in_flight: state.in_flight.iter().cloned().collect(),
        })
    }

    /// Names of every queue created so far, sorted
    pub fn queue_names(&self) -> Vec<QueueName> {
        let mut names: Vec<_> = self.all_queues().into_iter().map(|(n, _)| n).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for InMemoryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryQueue")
            .field("queues", &self.queue_names())
            .finish()
    }
}

#[async_trait]
impl QueueProvider for InMemoryQueue {
    async fn send_message(&self, request: &PushRequest) -> Result<Message, QueueError> {
        request.validate()?;
        let uri = request.queue_name()?;
        Ok(self.push(
            &uri,
            request.content.clone(),
            request.explicit_handle().map(str::to_string),
        ))
    }

    async fn receive_message(&self, request: &PullRequest) -> Result<Option<Message>, QueueError> {
        let uri = request.queue_name()?;
        let timeout = request.visibility_timeout()?;
        self.pull(&uri, timeout)
    }

    async fn delete_message(&self, request: &DeleteRequest) -> Result<DeleteOutcome, QueueError> {
        request.validate()?;
        self.delete(&request.message)
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}
