//! Broker abstraction the publisher talks through.
//!
//! The traits mirror the small slice of AMQP the publisher needs: open a
//! connection, open a confirm channel on it, declare the target queue, publish
//! and wait for the broker's acknowledgement. [`amqp`] provides the real
//! implementation; tests substitute a recording fake via
//! [`ConnectionFactory`].

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub mod amqp;
#[cfg(test)]
pub(crate) mod mock;

/// Declaration options for the target queue. Queues are always durable; the
/// priority-queue preset (`x-max-priority`) is merged with any caller-supplied
/// arguments, caller values winning on collision.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    pub max_priority: u8,
    pub arguments: BTreeMap<String, serde_json::Value>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_priority: 10,
            arguments: BTreeMap::new(),
        }
    }
}

/// Per-message broker properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    pub persistent: bool,
    pub priority: u8,
}

/// Opens broker connections. Injected into the publisher so tests can swap in
/// a fake; the default is [`amqp::AmqpConnectionFactory`].
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, crate::Error>;
}

#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Opens a channel in confirm mode.
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, crate::Error>;

    /// Token cancelled when the connection closes or errors.
    fn closed(&self) -> CancellationToken;

    async fn close(&self) -> Result<(), crate::Error>;
}

#[async_trait]
pub trait Channel: Send + Sync + 'static {
    async fn declare_queue(&self, queue: &str, options: &QueueOptions)
        -> Result<(), crate::Error>;

    /// Transmits one message and waits for the broker's confirmation. An
    /// explicit broker rejection surfaces as
    /// [`Error::DeliveryRejected`](crate::Error).
    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), crate::Error>;

    fn is_open(&self) -> bool;

    /// Token cancelled when the channel closes or errors.
    fn closed(&self) -> CancellationToken;

    async fn close(&self) -> Result<(), crate::Error>;
}
