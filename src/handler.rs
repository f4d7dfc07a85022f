// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! The handler owns the business meaning of a message. The watcher only decodes
//! the payload, calls the handler and turns its outcome into an ack or a nack.

use crate::{errors::HandlerError, message::MessageBody};
use async_trait::async_trait;
use std::future::Future;

/// Processes the body of one delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handles a decoded message body.
    ///
    /// `Ok(())` acks the message; an error nacks it, with requeue while the
    /// redelivery budget lasts.
    async fn handle(&self, body: MessageBody<'_>) -> Result<(), HandlerError>;

    /// Whether the handler wants raw bytes instead of UTF-8 text.
    fn binary(&self) -> bool {
        false
    }
}

/// Text handler backed by an async closure.
pub struct HandlerFn<F> {
    f: F,
}

/// Wraps an async closure taking the message text into a [`MessageHandler`].
///
/// ```ignore
/// let handler = handler_fn(|body: String| async move {
///     println!("{body}");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, body: MessageBody<'_>) -> Result<(), HandlerError> {
        match body.as_text() {
            Some(text) => (self.f)(text.to_owned()).await,
            None => Err(HandlerError::Decode("expected a text body".to_owned())),
        }
    }
}
