// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! This module owns the broker connection and its single channel. [`AmqpBroker`]
//! establishes both for every connection epoch; [`AmqpSession`] wraps the pair,
//! declares queues, subscribes, sends acknowledgments and reports failures.
//!
//! Broker-side failures (restart, network partition, revoked credentials) arrive
//! through lapin's `on_error` callbacks. They flip the connection state to
//! `Failed` and cancel the session's `lost` token so the consumer loop gives the
//! epoch back to the reconnect loop. A failed session is closed and dropped; the
//! next epoch always opens a fresh connection and channel.

use crate::{
    broker::{Broker, ConnectionState, DeliveryAcker, DeliveryStream, Session},
    configs::{redact_url, Configs},
    errors::AmqpError,
    message::Message,
    otel,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    Channel, Connection, ConnectionProperties,
};
use opentelemetry::Context;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Reply code sent when the watcher closes the channel and connection on purpose.
pub const AMQP_REPLY_SUCCESS: u16 = 200;

/// Connection manager: opens a connection and one channel per epoch.
pub struct AmqpBroker {
    uri: String,
    address: String,
    connection_name: String,
    state: Arc<Mutex<ConnectionState>>,
}

impl AmqpBroker {
    /// Manager for the configured broker. Nothing is opened until `connect`.
    ///
    /// Only the redacted address is kept for logging; the full URI never leaves
    /// this struct.
    pub fn new(cfg: &Configs) -> Self {
        AmqpBroker {
            uri: cfg.rabbitmq.url.clone(),
            address: redact_url(&cfg.rabbitmq.url),
            connection_name: cfg.app.name.clone(),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
        }
    }

    /// Current state of the managed connection.
    pub fn state(&self) -> ConnectionState {
        current_state(&self.state)
    }

    fn transition(&self, state: ConnectionState) {
        set_state(&self.state, state);
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self) -> Result<Box<dyn Session>, AmqpError> {
        self.transition(ConnectionState::Connecting);
        info!(address = self.address, "connecting to amqp broker...");

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                self.transition(ConnectionState::Failed);
                error!(
                    error = err.to_string(),
                    address = self.address,
                    "failure to connect"
                );
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!(address = self.address, "amqp connected");

        debug!("creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                self.transition(ConnectionState::Failed);
                error!(
                    error = err.to_string(),
                    address = self.address,
                    "error to create the channel"
                );
                let _ = conn.close(AMQP_REPLY_SUCCESS, "channel failure").await;
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;
        debug!(channel = channel.id(), "channel created");

        let lost = CancellationToken::new();
        watch_failures(&conn, &channel, &lost, &self.state, &self.address);

        self.transition(ConnectionState::Connected);
        info!(address = self.address, "amqp broker connected");

        Ok(Box::new(AmqpSession {
            conn,
            channel,
            lost,
            state: self.state.clone(),
            address: self.address.clone(),
            consumer_tag: format!("{}-{}", self.connection_name, Uuid::new_v4()),
        }))
    }
}

fn watch_failures(
    conn: &Connection,
    channel: &Channel,
    lost: &CancellationToken,
    state: &Arc<Mutex<ConnectionState>>,
    address: &str,
) {
    let (token, st, addr) = (lost.clone(), state.clone(), address.to_owned());
    conn.on_error(move |err| {
        set_state(&st, ConnectionState::Failed);
        error!(error = err.to_string(), address = addr, "amqp connection failed");
        token.cancel();
    });

    let (token, st, addr) = (lost.clone(), state.clone(), address.to_owned());
    channel.on_error(move |err| {
        set_state(&st, ConnectionState::Failed);
        error!(error = err.to_string(), address = addr, "amqp channel failed");
        token.cancel();
    });
}

fn current_state(state: &Mutex<ConnectionState>) -> ConnectionState {
    match state.lock() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

fn set_state(state: &Mutex<ConnectionState>, next: ConnectionState) {
    match state.lock() {
        Ok(mut guard) => *guard = next,
        Err(poisoned) => *poisoned.into_inner() = next,
    }
}

/// A live connection and the one channel opened on it.
pub struct AmqpSession {
    conn: Connection,
    channel: Channel,
    lost: CancellationToken,
    state: Arc<Mutex<ConnectionState>>,
    address: String,
    consumer_tag: String,
}

#[async_trait]
impl DeliveryAcker for AmqpSession {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling ack msg");
                AmqpError::AckMessageError(delivery_tag)
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error whiling nack msg");
                AmqpError::NackMessageError(delivery_tag)
            })
    }

    async fn dead_letter(
        &self,
        dlq_name: &str,
        msg: &Message,
        cx: &Context,
    ) -> Result<(), AmqpError> {
        let mut headers = msg
            .properties
            .headers()
            .as_ref()
            .map(|h| h.inner().clone())
            .unwrap_or_default();

        otel::inject_context(cx, &mut headers);

        headers.insert(
            ShortString::from(AMQP_HEADERS_ORIGINAL_DELIVERY_TAG),
            AMQPValue::LongLongInt(msg.delivery_tag as i64),
        );

        let properties = msg.properties.clone().with_headers(FieldTable::from(headers));

        let confirm = self
            .channel
            .basic_publish(
                "",
                dlq_name,
                BasicPublishOptions::default(),
                &msg.payload,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), dlq = dlq_name, "error whiling sending to dlq");
                AmqpError::PublishingToDQLError(dlq_name.to_owned())
            })?;

        confirm.await.map(|_| ()).map_err(|err| {
            error!(error = err.to_string(), dlq = dlq_name, "dlq publish was not confirmed");
            AmqpError::PublishingToDQLError(dlq_name.to_owned())
        })
    }
}

/// Header recording the delivery tag of the message that was dead-lettered.
pub const AMQP_HEADERS_ORIGINAL_DELIVERY_TAG: &str = "x-original-delivery-tag";

#[async_trait]
impl Session for AmqpSession {
    async fn declare(&self, queue: &QueueDefinition) -> Result<(), AmqpError> {
        let mut names = vec![queue.name()];
        if let Some(dlq) = queue.dlq_name() {
            names.push(dlq);
        }

        for name in names {
            debug!("declaring queue: {}", name);

            match self
                .channel
                .queue_declare(
                    name,
                    QueueDeclareOptions {
                        passive: false,
                        durable: queue.is_durable(),
                        exclusive: false,
                        auto_delete: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), queue = name, "failure to declare queue");
                    Err(AmqpError::DeclareQueueError(name.to_owned()))
                }
                _ => {
                    debug!("queue: {} was declared", name);
                    Ok(())
                }
            }?;
        }

        Ok(())
    }

    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, AmqpError> {
        if let Err(err) = self
            .channel
            .basic_qos(prefetch, BasicQosOptions { global: false })
            .await
        {
            error!(error = err.to_string(), prefetch, "failure to configure qos");
            return Err(AmqpError::QoSDeclarationError(err.to_string()));
        }

        let consumer = match self
            .channel
            .basic_consume(
                queue,
                &self.consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), queue, "error to create the consumer");
                Err(AmqpError::BindingConsumerError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        debug!(queue, consumer_tag = self.consumer_tag, prefetch, "consumer registered");

        Ok(consumer
            .map(|result| {
                result
                    .map(Message::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    fn lost(&self) -> CancellationToken {
        self.lost.clone()
    }

    async fn close(&self) {
        if self.channel.status().connected() {
            if let Err(err) = self.channel.close(AMQP_REPLY_SUCCESS, "shutdown").await {
                warn!(error = err.to_string(), "failure to close channel");
            }
        }

        if self.conn.status().connected() {
            if let Err(err) = self.conn.close(AMQP_REPLY_SUCCESS, "shutdown").await {
                warn!(error = err.to_string(), "failure to close connection");
            }
        }

        if current_state(&self.state) != ConnectionState::Failed {
            set_state(&self.state, ConnectionState::Disconnected);
        }

        info!(address = self.address, "amqp connection closed");
    }
}
