// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Queue Watcher
//!
//! Three families of failures exist and each one is handled at a different level:
//!
//! - [`ConfigError`]: missing or invalid required settings. Fatal, surfaces to the
//!   process boundary and is never retried.
//! - [`AmqpError`]: broker unreachability, mid-stream disconnects and failed
//!   protocol operations. Recovered internally by the reconnect loop.
//! - [`HandlerError`]: a handler failing on one specific message. Always turned
//!   into an ack/nack decision for that message and nothing else.

use thiserror::Error;

/// Errors raised while loading or validating the watcher configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required setting is absent or blank
    #[error("missing required configuration `{0}`")]
    Missing(&'static str),

    /// A setting is present but cannot be used
    #[error("invalid configuration `{var}`: {reason}")]
    Invalid { var: &'static str, reason: String },

    /// The configuration sources could not be read or deserialized
    #[error("failure to load configuration: {0}")]
    Load(String),
}

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Every variant is transient from the watcher's point of view: the current
/// connection epoch ends and the reconnect loop takes over.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error acknowledging a message
    #[error("failure to ack message `{0}`")]
    AckMessageError(u64),

    /// Error negative-acknowledging a message
    #[error("failure to nack message `{0}`")]
    NackMessageError(u64),

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq `{0}`")]
    PublishingToDQLError(String),

    /// Error reported by the consumer stream
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Outcome of a handler that did not process its message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler reported a processing failure
    #[error("handler failed: {0}")]
    Failed(String),

    /// The payload could not be decoded into what the handler accepts
    #[error("failure to decode payload: {0}")]
    Decode(String),

    /// The handler panicked while processing the message
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// Builds a [`HandlerError::Failed`] from anything printable.
    pub fn failed(reason: impl ToString) -> Self {
        HandlerError::Failed(reason.to_string())
    }

    /// Permanent failures cannot succeed on redelivery and skip the requeue budget.
    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Decode(_))
    }
}
