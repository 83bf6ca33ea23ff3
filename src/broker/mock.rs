//! Recording broker doubles for publisher tests.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use snafu::IntoError;
use tokio_util::sync::CancellationToken;

use crate::{ConnectSnafu, DeliveryRejectedSnafu};

use super::{Channel, Connection, ConnectionFactory, PublishProperties, QueueOptions};

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PublishedMessage {
    pub queue: String,
    pub body: Vec<u8>,
    pub properties: PublishProperties,
}

#[derive(Default)]
pub(crate) struct MockFactory {
    connections: Mutex<Vec<Arc<MockConnection>>>,
    connect_attempts: AtomicUsize,
    fail_next_connect: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn fail_next_connect(&self) {
        self.fail_next_connect.store(true, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = Some(delay);
    }

    pub fn last_connection(&self) -> Arc<MockConnection> {
        self.connections
            .lock()
            .unwrap()
            .last()
            .expect("no connection established")
            .clone()
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn Connection>, crate::Error> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(ConnectSnafu.into_error(Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock broker unreachable",
            ))));
        }
        let connection = Arc::new(MockConnection {
            channels: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
            close_calls: AtomicUsize::new(0),
        });
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

pub(crate) struct MockConnection {
    channels: Mutex<Vec<Arc<MockChannel>>>,
    token: CancellationToken,
    close_calls: AtomicUsize,
}

impl MockConnection {
    /// Simulates the broker dropping the connection: fires the close signal
    /// without marking channels closed, exercising the watcher path.
    pub fn kill(&self) {
        self.token.cancel();
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn last_channel(&self) -> Arc<MockChannel> {
        self.channels
            .lock()
            .unwrap()
            .last()
            .expect("no channel opened")
            .clone()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, crate::Error> {
        let channel = Arc::new(MockChannel {
            declared: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
            token: self.token.child_token(),
            reject_next: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        });
        self.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    fn closed(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn close(&self) -> Result<(), crate::Error> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) struct MockChannel {
    declared: Mutex<Vec<(String, QueueOptions)>>,
    published: Mutex<Vec<PublishedMessage>>,
    open: AtomicBool,
    token: CancellationToken,
    reject_next: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockChannel {
    /// Simulates a channel-level close that lapin would only reveal through
    /// channel status, not a connection error.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn reject_next(&self) {
        self.reject_next.store(true, Ordering::SeqCst);
    }

    pub fn declared(&self) -> Vec<(String, QueueOptions)> {
        self.declared.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for MockChannel {
    async fn declare_queue(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<(), crate::Error> {
        self.declared
            .lock()
            .unwrap()
            .push((queue.to_string(), options.clone()));
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), crate::Error> {
        if self.reject_next.swap(false, Ordering::SeqCst) {
            return DeliveryRejectedSnafu { queue }.fail();
        }
        self.published.lock().unwrap().push(PublishedMessage {
            queue: queue.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn closed(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn close(&self) -> Result<(), crate::Error> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
