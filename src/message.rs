// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivered Messages
//!
//! A [`Message`] is created by the broker on delivery, consumed once by the
//! handler and terminated by exactly one ack or nack.

use crate::errors::HandlerError;
use lapin::{
    message::Delivery,
    types::{AMQPValue, FieldTable},
    BasicProperties,
};

/// Header set by quorum queues with the number of previous delivery attempts.
pub const AMQP_HEADERS_DELIVERY_COUNT: &str = "x-delivery-count";

/// A message delivered on the watcher's channel.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Opaque payload
    pub payload: Vec<u8>,
    /// Identifier of this delivery, unique within the channel's lifetime
    pub delivery_tag: u64,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
    /// Broker properties (message id, headers, content type...)
    pub properties: BasicProperties,
}

impl Message {
    /// A first-time delivery with default properties.
    pub fn new(delivery_tag: u64, payload: impl Into<Vec<u8>>) -> Self {
        Message {
            payload: payload.into(),
            delivery_tag,
            redelivered: false,
            properties: BasicProperties::default(),
        }
    }

    /// Sets the broker's redelivery flag.
    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    /// The `message-id` property, when the publisher set one.
    pub fn message_id(&self) -> Option<String> {
        self.properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_owned())
            .filter(|id| !id.is_empty())
    }

    /// Previous delivery attempts as counted by the broker (quorum queues only).
    pub fn delivery_count(&self) -> Option<u32> {
        let headers = match self.properties.headers() {
            Some(val) => val.to_owned(),
            None => FieldTable::default(),
        };

        match headers.inner().get(AMQP_HEADERS_DELIVERY_COUNT) {
            Some(AMQPValue::LongLongInt(v)) => u32::try_from(*v).ok(),
            Some(AMQPValue::LongInt(v)) => u32::try_from(*v).ok(),
            Some(AMQPValue::LongUInt(v)) => Some(*v),
            Some(AMQPValue::ShortInt(v)) => u32::try_from(*v).ok(),
            Some(AMQPValue::ShortUInt(v)) => Some(u32::from(*v)),
            _ => None,
        }
    }

    /// Decodes the payload into the form the handler accepts.
    pub fn body(&self, binary: bool) -> Result<MessageBody<'_>, HandlerError> {
        if binary {
            return Ok(MessageBody::Binary(&self.payload));
        }

        std::str::from_utf8(&self.payload)
            .map(MessageBody::Text)
            .map_err(|err| HandlerError::Decode(err.to_string()))
    }
}

impl From<Delivery> for Message {
    fn from(delivery: Delivery) -> Self {
        Message {
            payload: delivery.data,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            properties: delivery.properties,
        }
    }
}

/// Decoded message body handed to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageBody<'a> {
    /// Payload decoded as UTF-8
    Text(&'a str),
    /// Payload as received, for handlers that opted into bytes
    Binary(&'a [u8]),
}

impl<'a> MessageBody<'a> {
    /// The body as text, or `None` for a binary body.
    pub fn as_text(&self) -> Option<&'a str> {
        match *self {
            MessageBody::Text(text) => Some(text),
            MessageBody::Binary(_) => None,
        }
    }

    /// The raw bytes, whatever the body kind.
    pub fn as_bytes(&self) -> &'a [u8] {
        match *self {
            MessageBody::Text(text) => text.as_bytes(),
            MessageBody::Binary(bytes) => bytes,
        }
    }
}
