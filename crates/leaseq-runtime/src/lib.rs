//! # Leaseq Runtime
//!
//! Visibility-timeout message queues: a pulled message is leased to its
//! consumer and becomes invisible to others until it is deleted or the lease
//! expires, after which it is delivered again.
//!
//! This library provides:
//! - An in-memory engine with per-queue pending and in-flight sets
//! - A durable, append-only log shared by cooperating processes, replayed
//!   into a private in-memory view on every pull
//! - An Amazon SQS adapter behind the same contract
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`clock`] - Time sources, including a controllable test clock
//! - [`message`] - Messages, queue names and request DTOs
//! - [`visibility`] - Messages ordered by visibility timestamp
//! - [`journal`] - Log record codec
//! - [`lock`] - Cross-process log lock
//! - [`providers`] - In-memory, durable log and SQS implementations
//! - [`provider`] - Provider types and configuration
//! - [`client`] - Client traits and implementations

pub mod client;
pub mod clock;
pub mod error;
pub mod journal;
pub mod lock;
pub mod message;
pub mod provider;
pub mod providers;
pub mod visibility;

pub use client::{QueueClient, QueueClientFactory, QueueProvider, StandardQueueClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ClockError, ConfigurationError, QueueError, ValidationError};
pub use journal::{LogRecord, Operation, RECORD_SEPARATOR};
pub use message::{
    DeleteOutcome, DeleteRequest, HandleGenerator, Message, PullRequest, PushRequest, QueueName,
    SequentialHandleGenerator, UuidHandleGenerator, VisibilityTimeout,
    DEFAULT_VISIBILITY_TIMEOUT_SECS, MIN_VISIBILITY_TIMEOUT_SECS,
};
pub use provider::{AwsSqsConfig, FileConfig, ProviderConfig, ProviderType, QueueConfig};
pub use providers::{FileQueue, InMemoryQueue, QueueSnapshot, ReplayReport, SqsQueue};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
