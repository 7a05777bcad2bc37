//! Client traits and implementations for queue operations.
//!
//! [`QueueProvider`] is the backend seam: the in-memory engine, the durable
//! log and the SQS adapter all implement it. [`QueueClient`] is what callers
//! use; [`StandardQueueClient`] validates every request and fills in defaults
//! before handing it to a provider.

use crate::clock::{Clock, SystemClock};
use crate::error::QueueError;
use crate::message::{DeleteOutcome, DeleteRequest, Message, PullRequest, PushRequest};
use crate::provider::{ProviderConfig, ProviderType, QueueConfig};
use crate::providers::{FileQueue, InMemoryQueue, SqsQueue};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Caller-facing queue contract
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Push `content` onto queue `uri`, creating the queue if needed.
    ///
    /// Fails with `InvalidRequest` if `uri` or `content` is empty.
    async fn push(
        &self,
        uri: &str,
        content: &str,
        handle: Option<&str>,
    ) -> Result<Message, QueueError>;

    /// Lease the next visible message. `None` for the timeout uses the
    /// configured default.
    ///
    /// Returns `Ok(None)` when nothing is visible; fails with `QueueNotFound`
    /// if the queue was never created.
    async fn pull(
        &self,
        uri: &str,
        visibility_timeout_secs: Option<u32>,
    ) -> Result<Option<Message>, QueueError>;

    /// Delete a pulled message. Races with lease expiry are reported in the
    /// outcome, not as errors.
    async fn delete(&self, message: &Message) -> Result<DeleteOutcome, QueueError>;

    fn provider_type(&self) -> ProviderType;
}

/// Backend implementing queue operations
#[async_trait]
pub trait QueueProvider: Send + Sync {
    async fn send_message(&self, request: &PushRequest) -> Result<Message, QueueError>;

    async fn receive_message(&self, request: &PullRequest) -> Result<Option<Message>, QueueError>;

    async fn delete_message(&self, request: &DeleteRequest) -> Result<DeleteOutcome, QueueError>;

    fn provider_type(&self) -> ProviderType;
}

/// Factory for creating queue clients
pub struct QueueClientFactory;

impl QueueClientFactory {
    /// Create a client for the configured provider, using the system clock
    pub async fn create_client(config: QueueConfig) -> Result<Box<dyn QueueClient>, QueueError> {
        Self::create_client_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn create_client_with_clock(
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Box<dyn QueueClient>, QueueError> {
        config.validate()?;
        let provider = Self::create_provider(&config, clock)?;
        info!(provider = ?provider.provider_type(), "Created queue client");
        Ok(Box::new(StandardQueueClient::new(provider, config)))
    }

    /// Build the provider named by `config.provider`
    pub fn create_provider(
        config: &QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Box<dyn QueueProvider>, QueueError> {
        let provider: Box<dyn QueueProvider> = match &config.provider {
            ProviderConfig::InMemory => Box::new(InMemoryQueue::new(clock)),
            ProviderConfig::File(file_config) => {
                Box::new(FileQueue::from_config(file_config, clock)?)
            }
            ProviderConfig::AwsSqs(aws_config) => Box::new(SqsQueue::new(aws_config.clone(), clock)?),
        };
        Ok(provider)
    }

    /// In-memory client driven by `clock`
    pub fn create_test_client(clock: Arc<dyn Clock>) -> Box<dyn QueueClient> {
        let config = QueueConfig {
            provider: ProviderConfig::InMemory,
            ..QueueConfig::default()
        };
        Box::new(StandardQueueClient::new(
            Box::new(InMemoryQueue::new(clock)),
            config,
        ))
    }
}

/// Standard queue client implementation
pub struct StandardQueueClient {
    provider: Box<dyn QueueProvider>,
    config: QueueConfig,
}

impl StandardQueueClient {
    pub fn new(provider: Box<dyn QueueProvider>, config: QueueConfig) -> Self {
        Self { provider, config }
    }
}

#[async_trait]
impl QueueClient for StandardQueueClient {
    async fn push(
        &self,
        uri: &str,
        content: &str,
        handle: Option<&str>,
    ) -> Result<Message, QueueError> {
        let mut request = PushRequest::new(uri, content);
        if let Some(handle) = handle {
            request = request.with_handle(handle);
        }
        request.validate()?;
        self.provider.send_message(&request).await
    }

    async fn pull(
        &self,
        uri: &str,
        visibility_timeout_secs: Option<u32>,
    ) -> Result<Option<Message>, QueueError> {
        let request = PullRequest::new(uri).with_visibility_timeout(
            visibility_timeout_secs.unwrap_or(self.config.default_visibility_timeout_secs),
        );
        request.validate()?;
        self.provider.receive_message(&request).await
    }

    async fn delete(&self, message: &Message) -> Result<DeleteOutcome, QueueError> {
        let request = DeleteRequest::new(message.clone());
        request.validate()?;
        self.provider.delete_message(&request).await
    }

    fn provider_type(&self) -> ProviderType {
        self.provider.provider_type()
    }
}
