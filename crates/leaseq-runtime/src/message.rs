//! Message types for queue operations including core domain identifiers.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default lease length applied when a pull does not ask for one
pub const DEFAULT_VISIBILITY_TIMEOUT_SECS: u32 = 30;

/// Shortest lease a consumer may request
pub const MIN_VISIBILITY_TIMEOUT_SECS: u32 = 30;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name (the queue "uri")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() {
            return Err(ValidationError::Required {
                field: "uri".to_string(),
            });
        }

        if name.contains(['\n', '\r']) {
            return Err(ValidationError::InvalidFormat {
                field: "uri".to_string(),
                message: "line breaks are not allowed".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for QueueName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

/// Lease length for a pulled message, in whole seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VisibilityTimeout(u32);

impl VisibilityTimeout {
    pub fn from_secs(secs: u32) -> Result<Self, ValidationError> {
        if secs < MIN_VISIBILITY_TIMEOUT_SECS {
            return Err(ValidationError::OutOfRange {
                field: "visibility_timeout".to_string(),
                message: format!(
                    "cannot be less than {} seconds",
                    MIN_VISIBILITY_TIMEOUT_SECS
                ),
            });
        }
        Ok(Self(secs))
    }

    pub fn as_secs(&self) -> u32 {
        self.0
    }

    pub fn as_millis(&self) -> i64 {
        i64::from(self.0) * 1000
    }
}

impl Default for VisibilityTimeout {
    fn default() -> Self {
        Self(DEFAULT_VISIBILITY_TIMEOUT_SECS)
    }
}

// ============================================================================
// Handle Generation
// ============================================================================

/// Source of consumer-facing handles for messages pushed without one
pub trait HandleGenerator: Send + Sync {
    fn next_handle(&self) -> String;
}

/// Random v4 UUID handles
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidHandleGenerator;

impl HandleGenerator for UuidHandleGenerator {
    fn next_handle(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Predictable `<prefix>-<n>` handles, mostly for tests
#[derive(Debug)]
pub struct SequentialHandleGenerator {
    prefix: String,
    next: AtomicU64,
}

impl SequentialHandleGenerator {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            next: AtomicU64::new(1),
        }
    }
}

impl HandleGenerator for SequentialHandleGenerator {
    fn next_handle(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message held by a queue.
///
/// `visibility_timestamp` is the time (ms) at which the message becomes
/// deliverable while pending, and the lease expiry while in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub uri: QueueName,
    pub handle: String,
    pub content: String,
    pub visibility_timestamp: i64,
}

impl Message {
    pub fn new(uri: QueueName, handle: String, content: String, visibility_timestamp: i64) -> Self {
        Self {
            uri,
            handle,
            content,
            visibility_timestamp,
        }
    }
}

/// Result of a delete call. None of these are errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// The lease was live and the message is gone
    Deleted,
    /// The handle was leased but the lease had already lapsed
    LeaseExpired,
    /// No in-flight message carries this handle
    NotInFlight,
    /// Written to the durable log; takes effect when the log is replayed
    Recorded,
}

impl DeleteOutcome {
    pub fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Push a message onto a queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub uri: String,
    pub content: String,
    pub handle: Option<String>,
}

impl PushRequest {
    pub fn new(uri: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            content: content.into(),
            handle: None,
        }
    }

    /// Use a caller-chosen handle instead of a generated one
    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.uri.is_empty() {
            return Err(ValidationError::Required {
                field: "uri".to_string(),
            });
        }
        if self.content.is_empty() {
            return Err(ValidationError::Required {
                field: "content".to_string(),
            });
        }
        Ok(())
    }

    pub fn queue_name(&self) -> Result<QueueName, ValidationError> {
        QueueName::new(self.uri.clone())
    }

    /// The supplied handle, treating an empty string as absent
    pub fn explicit_handle(&self) -> Option<&str> {
        self.handle.as_deref().filter(|h| !h.is_empty())
    }
}

/// Pull the next visible message from a queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub uri: String,
    pub visibility_timeout_secs: u32,
}

impl PullRequest {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            visibility_timeout_secs: DEFAULT_VISIBILITY_TIMEOUT_SECS,
        }
    }

    pub fn with_visibility_timeout(mut self, secs: u32) -> Self {
        self.visibility_timeout_secs = secs;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.queue_name()?;
        self.visibility_timeout()?;
        Ok(())
    }

    pub fn queue_name(&self) -> Result<QueueName, ValidationError> {
        QueueName::new(self.uri.clone())
    }

    pub fn visibility_timeout(&self) -> Result<VisibilityTimeout, ValidationError> {
        VisibilityTimeout::from_secs(self.visibility_timeout_secs)
    }
}

/// Delete a previously pulled message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub message: Message,
}

impl DeleteRequest {
    pub fn new(message: Message) -> Self {
        Self { message }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.message.handle.is_empty() {
            return Err(ValidationError::Required {
                field: "handle".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
