//! Queue publishing for out-of-process ingestion workers.
//!
//! Request handlers hand work items (fetch-beatmap, fetch-match, fetch-player,
//! automation checks) to broker queues consumed elsewhere. This crate owns the
//! two pieces that need care:
//!
//! * [`QueuePublisher`] — a confirmed publisher bound to one durable priority
//!   queue, with lazy single-flight connection establishment and self-healing
//!   reconnection after a broker-side close.
//! * [`RateLimiter`] — a fixed-window limiter that throttles arbitrary async
//!   work to N executions per window while keeping strict submission order.
//!
//! Neither component retries, buffers, or applies deadlines; a failed publish
//! surfaces to its caller and the next call starts from a clean slate.

#![forbid(unsafe_code)]

use snafu::{Location, Snafu};

pub mod broker;
pub mod limiter;
pub mod metadata;
pub mod publisher;

pub use broker::{PublishProperties, QueueOptions};
pub use limiter::RateLimiter;
pub use metadata::{Envelope, MessageMetadata, MetadataOverrides, Priority};
pub use publisher::{PublishOptions, QueuePublisher};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("invalid configuration: {message}"))]
    InvalidConfig {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("broker connect error"))]
    Connect {
        #[snafu(source)]
        error: Box<dyn std::error::Error + Send + Sync + 'static>,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("open channel error"))]
    OpenChannel {
        #[snafu(source)]
        error: Box<dyn std::error::Error + Send + Sync + 'static>,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("declare queue {queue} error"))]
    DeclareQueue {
        queue: String,
        #[snafu(source)]
        error: Box<dyn std::error::Error + Send + Sync + 'static>,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("transmit to queue {queue} error"))]
    Transmit {
        queue: String,
        #[snafu(source)]
        error: Box<dyn std::error::Error + Send + Sync + 'static>,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("broker rejected message on queue {queue}"))]
    DeliveryRejected {
        queue: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("close error"))]
    Close {
        #[snafu(source)]
        error: Box<dyn std::error::Error + Send + Sync + 'static>,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("encode message error"))]
    EncodeMessage {
        source: serde_json::Error,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("shared connection attempt failed"))]
    ConnectCanceled {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("shutdown"))]
    Shutdown {
        #[snafu(implicit)]
        location: Location,
    },
}
