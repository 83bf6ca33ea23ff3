//! AMQP 0.9.1 implementation of the broker traits, backed by `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, ConnectionProperties,
};
use snafu::IntoError;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::{
    CloseSnafu, ConnectSnafu, DeclareQueueSnafu, DeliveryRejectedSnafu, OpenChannelSnafu,
    TransmitSnafu,
};

use super::{Channel, Connection, ConnectionFactory, PublishProperties, QueueOptions};

const REPLY_SUCCESS: u16 = 200;

/// The default [`ConnectionFactory`]: real AMQP connections with publisher
/// confirms enabled on every channel.
#[derive(Debug, Default)]
pub struct AmqpConnectionFactory;

#[async_trait]
impl ConnectionFactory for AmqpConnectionFactory {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>, crate::Error> {
        let connection = lapin::Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| ConnectSnafu.into_error(Box::new(e)))?;

        let token = CancellationToken::new();
        {
            let token = token.clone();
            connection.on_error(move |e| {
                error!("broker connection error: {e}");
                token.cancel();
            });
        }

        Ok(Arc::new(AmqpConnection { connection, token }))
    }
}

struct AmqpConnection {
    connection: lapin::Connection,
    token: CancellationToken,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, crate::Error> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| OpenChannelSnafu.into_error(Box::new(e)))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| OpenChannelSnafu.into_error(Box::new(e)))?;
        Ok(Arc::new(AmqpChannel {
            channel,
            // lapin reports transport failures on the connection; a
            // channel-only close is caught by the is_open check instead.
            token: self.token.child_token(),
        }))
    }

    fn closed(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn close(&self) -> Result<(), crate::Error> {
        self.connection
            .close(REPLY_SUCCESS, "")
            .await
            .map_err(|e| CloseSnafu.into_error(Box::new(e)))
    }
}

struct AmqpChannel {
    channel: lapin::Channel,
    token: CancellationToken,
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn declare_queue(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<(), crate::Error> {
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                declare_arguments(options),
            )
            .await
            .map_err(|e| DeclareQueueSnafu { queue }.into_error(Box::new(e)))?;
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<(), crate::Error> {
        let properties = BasicProperties::default()
            .with_delivery_mode(if properties.persistent { 2 } else { 1 })
            .with_priority(properties.priority);
        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| TransmitSnafu { queue }.into_error(Box::new(e)))?;
        match confirm
            .await
            .map_err(|e| TransmitSnafu { queue }.into_error(Box::new(e)))?
        {
            Confirmation::Nack(_) => DeliveryRejectedSnafu { queue }.fail(),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
        }
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    fn closed(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn close(&self) -> Result<(), crate::Error> {
        self.channel
            .close(REPLY_SUCCESS, "")
            .await
            .map_err(|e| CloseSnafu.into_error(Box::new(e)))
    }
}

fn declare_arguments(options: &QueueOptions) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        ShortString::from("x-max-priority"),
        AMQPValue::ShortShortUInt(options.max_priority),
    );
    for (name, value) in &options.arguments {
        arguments.insert(ShortString::from(name.clone()), amqp_value(value));
    }
    arguments
}

fn amqp_value(value: &serde_json::Value) -> AMQPValue {
    match value {
        serde_json::Value::Bool(b) => AMQPValue::Boolean(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or(0.0)),
        },
        serde_json::Value::String(s) => AMQPValue::LongString(s.clone().into()),
        _ => AMQPValue::Void,
    }
}
