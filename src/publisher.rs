//! Confirmed publishing to one durable priority queue.
//!
//! The publisher connects lazily: the first publish (or an explicit
//! [`QueuePublisher::ensure_connected`]) establishes the connection and
//! confirm channel, asserts the queue, and caches the pair. Establishment is
//! single-flight — concurrent publishes arriving while it is in progress park
//! on the same attempt instead of opening duplicate connections. Once a
//! channel is ready, publishes run concurrently without mutual ordering
//! guarantees.
//!
//! There is no retry, buffering, or deadline: a failed publish surfaces to
//! its caller, the cached state is cleared, and the next call starts a fresh
//! attempt.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use serde::Serialize;
use snafu::ResultExt;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error};

use crate::{
    broker::{
        amqp::AmqpConnectionFactory, Channel, Connection, ConnectionFactory, PublishProperties,
        QueueOptions,
    },
    metadata::{Envelope, MessageMetadata, MetadataOverrides, Priority},
    ConnectCanceledSnafu, EncodeMessageSnafu, ShutdownSnafu,
};

/// Per-call publish options. Metadata fields left unset are generated fresh;
/// `persistent` falls back to the publisher-level default (true unless
/// configured otherwise).
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub metadata: MetadataOverrides,
    pub persistent: Option<bool>,
}

pub struct QueuePublisherBuilder {
    url: String,
    queue: String,
    queue_options: QueueOptions,
    persistent: bool,
    priority: Option<Priority>,
    factory: Arc<dyn ConnectionFactory>,
}

impl QueuePublisherBuilder {
    /// Caps the queue's `x-max-priority` argument (default 10).
    pub fn max_priority(mut self, max_priority: u8) -> Self {
        self.queue_options.max_priority = max_priority;
        self
    }

    /// Adds an extra queue-declaration argument, overriding the preset on
    /// name collision.
    pub fn queue_argument(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.queue_options.arguments.insert(name.into(), value);
        self
    }

    /// Default persistence flag for every publish (default true).
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Fixes the broker-level priority of every publish. When unset, each
    /// message is published at its own metadata priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Stores configuration only; no connection is made until the first
    /// publish or [`QueuePublisher::ensure_connected`].
    pub fn build(self) -> QueuePublisher {
        QueuePublisher {
            url: self.url,
            queue: self.queue,
            queue_options: self.queue_options,
            persistent: self.persistent,
            priority: self.priority,
            factory: self.factory,
            state: Arc::new(Mutex::new(ChannelState::Disconnected)),
            generation: AtomicU64::new(0),
        }
    }
}

/// Publishes stamped messages to one named durable queue and waits for the
/// broker's confirmation of each.
pub struct QueuePublisher {
    url: String,
    queue: String,
    queue_options: QueueOptions,
    persistent: bool,
    priority: Option<Priority>,
    factory: Arc<dyn ConnectionFactory>,
    state: Arc<Mutex<ChannelState>>,
    generation: AtomicU64,
}

enum ChannelState {
    Disconnected,
    /// An establishment attempt is in flight; parked callers receive the
    /// outcome over these senders.
    Connecting(Vec<oneshot::Sender<Result<ReadyChannel, crate::Error>>>),
    Ready(ReadyChannel),
}

#[derive(Clone)]
struct ReadyChannel {
    generation: u64,
    connection: Arc<dyn Connection>,
    channel: Arc<dyn Channel>,
}

impl QueuePublisher {
    pub fn builder(url: impl Into<String>, queue: impl Into<String>) -> QueuePublisherBuilder {
        QueuePublisherBuilder {
            url: url.into(),
            queue: queue.into(),
            queue_options: QueueOptions::default(),
            persistent: true,
            priority: None,
            factory: Arc::new(AmqpConnectionFactory),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stamps `payload` with metadata, publishes it, and waits for the
    /// broker's confirmation. Resolves with the fully stamped envelope so the
    /// caller can log the correlation id.
    ///
    /// On success exactly one message was enqueued on the broker; on failure
    /// none was, and the caller decides whether to retry.
    #[tracing::instrument(skip(self, payload, options), fields(queue = %self.queue))]
    pub async fn publish<T: Serialize>(
        &self,
        payload: T,
        options: PublishOptions,
    ) -> Result<Envelope<T>, crate::Error> {
        let metadata = MessageMetadata::with_overrides(options.metadata);
        let envelope = Envelope { metadata, payload };

        let ready = self.ready_channel().await?;

        let body = serde_json::to_vec(&envelope).context(EncodeMessageSnafu)?;
        let properties = PublishProperties {
            persistent: options.persistent.unwrap_or(self.persistent),
            priority: self
                .priority
                .unwrap_or(envelope.metadata.priority)
                .value(),
        };
        ready.channel.publish(&self.queue, &body, &properties).await?;

        debug!(correlation_id = %envelope.metadata.correlation_id, "publish confirmed");
        Ok(envelope)
    }

    /// Explicit warm-up: establishes and caches the connection and channel
    /// without publishing anything.
    pub async fn ensure_connected(&self) -> Result<(), crate::Error> {
        self.ready_channel().await.map(|_| ())
    }

    /// Best-effort, idempotent teardown. The channel and connection are
    /// closed independently; a failure closing one does not prevent the
    /// other, and neither failure surfaces. A publisher that never connected
    /// closes as a no-op.
    #[tracing::instrument(skip(self), fields(queue = %self.queue))]
    pub async fn close(&self) {
        let previous = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut *state, ChannelState::Disconnected)
        };
        match previous {
            ChannelState::Ready(ready) => {
                if let Err(e) = ready.channel.close().await {
                    debug!("ignoring channel close error: {e}");
                }
                if let Err(e) = ready.connection.close().await {
                    debug!("ignoring connection close error: {e}");
                }
            }
            // Parked callers observe shutdown when their senders drop.
            ChannelState::Connecting(_) | ChannelState::Disconnected => {}
        }
    }

    /// Returns the cached ready channel, parking on an in-flight attempt or
    /// initiating one as needed.
    async fn ready_channel(&self) -> Result<ReadyChannel, crate::Error> {
        let waiter = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, ChannelState::Disconnected) {
                ChannelState::Ready(ready) => {
                    if ready.channel.is_open() {
                        *state = ChannelState::Ready(ready.clone());
                        return Ok(ready);
                    }
                    // Channel died without the watcher having run yet.
                    *state = ChannelState::Connecting(Vec::new());
                    None
                }
                ChannelState::Connecting(mut waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    *state = ChannelState::Connecting(waiters);
                    Some(rx)
                }
                ChannelState::Disconnected => {
                    *state = ChannelState::Connecting(Vec::new());
                    None
                }
            }
        };
        match waiter {
            Some(rx) => match rx.await {
                Ok(result) => result,
                Err(_) => ShutdownSnafu.fail(),
            },
            None => self.connect().await,
        }
    }

    /// Performs the establishment attempt this caller initiated and settles
    /// every caller parked on it. On failure the slot returns to
    /// `Disconnected` so the next call retries fresh; parked callers receive
    /// `ConnectCanceled` while the initiator keeps the real error.
    async fn connect(&self) -> Result<ReadyChannel, crate::Error> {
        match self.establish().await {
            Ok(ready) => {
                let mut state = self.state.lock().await;
                match std::mem::replace(&mut *state, ChannelState::Disconnected) {
                    ChannelState::Connecting(mut waiters) => {
                        for waiter in waiters.drain(..) {
                            waiter.send(Ok(ready.clone())).ok();
                        }
                        *state = ChannelState::Ready(ready.clone());
                    }
                    // close() raced the attempt; leave the slot as it set it.
                    other => *state = other,
                }
                Ok(ready)
            }
            Err(e) => {
                let mut state = self.state.lock().await;
                if let ChannelState::Connecting(mut waiters) =
                    std::mem::replace(&mut *state, ChannelState::Disconnected)
                {
                    for waiter in waiters.drain(..) {
                        waiter.send(ConnectCanceledSnafu.fail()).ok();
                    }
                }
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<ReadyChannel, crate::Error> {
        let connection = self.factory.connect(&self.url).await?;
        let channel = connection.open_channel().await?;
        channel.declare_queue(&self.queue, &self.queue_options).await?;

        let ready = ReadyChannel {
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
            connection,
            channel,
        };
        self.spawn_close_watcher(ready.clone());
        Ok(ready)
    }

    /// Watches the connection's and channel's close signals and clears the
    /// cached state so the next publish re-establishes from scratch. The
    /// generation guard keeps a stale watcher from clobbering a newer
    /// connection.
    fn spawn_close_watcher(&self, ready: ReadyChannel) {
        let state = Arc::clone(&self.state);
        let queue = self.queue.clone();
        let connection_closed = ready.connection.closed();
        let channel_closed = ready.channel.closed();
        let generation = ready.generation;
        tokio::spawn(async move {
            tokio::select! {
                _ = connection_closed.cancelled() => {}
                _ = channel_closed.cancelled() => {}
            }
            let mut state = state.lock().await;
            if let ChannelState::Ready(current) = &*state {
                if current.generation == generation {
                    error!(queue = %queue, "broker connection lost, reconnecting on next publish");
                    *state = ChannelState::Disconnected;
                }
            }
        });
    }
}
