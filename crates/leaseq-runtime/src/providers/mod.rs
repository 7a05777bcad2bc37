//! Queue provider implementations.
//!
//! This module contains the concrete implementations of the `QueueProvider`
//! trait: the in-memory engine, the durable log built on top of it, and the
//! SQS adapter.

pub mod file;
pub mod memory;
pub mod sqs;

pub use file::{Cursor, FileQueue, ReplayReport};
pub use memory::{InMemoryQueue, QueueSnapshot};
pub use sqs::{SqsError, SqsQueue};
