// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Abstractions
//!
//! The watcher talks to the broker through these traits. [`crate::channel`]
//! implements them over `lapin`; tests implement them in memory.
//!
//! A [`Session`] is one connection epoch: a live connection together with its
//! single channel. It is created by [`Broker::connect`], used by the consumer
//! loop and closed (channel first, then connection) when the epoch ends. A
//! session is never reused once it has failed.

use crate::{errors::AmqpError, message::Message, queue::QueueDefinition};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use opentelemetry::Context;
use tokio_util::sync::CancellationToken;

#[cfg(test)]
use mockall::automock;

/// Stream of messages delivered to the watcher's consumer.
///
/// The stream ends, or yields an error, when the channel or connection goes away.
pub type DeliveryStream = BoxStream<'static, Result<Message, AmqpError>>;

/// Lifecycle of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection, before the first attempt or after a clean close
    Disconnected,
    /// A connection attempt is in progress
    Connecting,
    /// Connection and channel are open
    Connected,
    /// The last attempt was refused or the broker dropped the connection
    Failed,
}

/// Terminal acknowledgment decisions for delivered messages.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    /// Removes the message from the queue.
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    /// Rejects the message, putting it back on the queue when `requeue` is set.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    /// Publishes a copy of the message to the given dead-letter queue.
    ///
    /// `cx` is the trace context of the consumer span, propagated in the copy's
    /// headers. The original delivery still needs its own ack.
    async fn dead_letter(
        &self,
        dlq_name: &str,
        msg: &Message,
        cx: &Context,
    ) -> Result<(), AmqpError>;
}

/// One live connection and its channel.
#[async_trait]
pub trait Session: DeliveryAcker {
    /// Declares the queue (and its DLQ when configured). Idempotent.
    async fn declare(&self, queue: &QueueDefinition) -> Result<(), AmqpError>;

    /// Applies the prefetch limit and starts consuming the queue.
    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream, AmqpError>;

    /// Token cancelled once the broker reports the connection or channel as failed.
    fn lost(&self) -> CancellationToken;

    /// Closes the channel, then the connection.
    async fn close(&self);
}

/// Opens sessions against a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connects and opens exactly one channel.
    async fn connect(&self) -> Result<Box<dyn Session>, AmqpError>;
}
