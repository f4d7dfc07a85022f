// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! Processing of one delivered message, from decoding to its acknowledgment:
//!
//! 1. Decode the payload (UTF-8 text unless the handler asked for bytes)
//! 2. Run the handler inside a consumer span, catching panics
//! 3. On success, ack
//! 4. On failure, nack with requeue while the redelivery budget lasts
//! 5. Past the budget, apply the [`FailurePolicy`]: dead-letter then ack, or
//!    ack and log
//!
//! Every path ends in exactly one terminal decision for the delivery.

use crate::{
    broker::DeliveryAcker,
    configs::{FailurePolicy, RabbitMQConfigs},
    errors::{AmqpError, HandlerError},
    handler::MessageHandler,
    message::Message,
    otel,
    queue::QueueDefinition,
};
use futures_util::FutureExt;
use opentelemetry::{
    global::BoxedTracer,
    trace::{Status, TraceContextExt},
    Context,
};
use std::{
    any::Any,
    borrow::Cow,
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    panic::AssertUnwindSafe,
    sync::Mutex,
};
use tracing::{debug, error, warn};

/// Upper bound on messages tracked at once. Entries are dropped on every terminal
/// decision, so the bound only matters when other consumers take over messages
/// this one saw fail.
pub const MAX_TRACKED_MESSAGES: usize = 10_000;

/// Terminal acknowledgment decision taken for a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Processed and removed from the queue
    Acked,
    /// Rejected and put back on the queue for another attempt
    Requeued,
    /// Copied to the dead-letter queue and removed from the main queue
    DeadLettered,
    /// Removed from the queue without being processed successfully
    Discarded,
}

/// How failed messages are retried and where they end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Failed attempts requeued before `failure_policy` applies
    pub max_redeliveries: u32,
    pub failure_policy: FailurePolicy,
    /// Destination of dead-lettered copies; `None` falls back to discarding
    pub dlq_name: Option<String>,
}

impl DeliveryPolicy {
    /// Policy of the configured queue; dead-lettering needs the queue's DLQ.
    pub fn new(cfg: &RabbitMQConfigs, queue: &QueueDefinition) -> Self {
        DeliveryPolicy {
            max_redeliveries: cfg.max_redeliveries,
            failure_policy: cfg.failure_policy,
            dlq_name: queue.dlq_name().map(str::to_owned),
        }
    }
}

/// Counts failed attempts per message across redeliveries.
///
/// The broker hands out a new delivery tag on every redelivery, so the count is
/// keyed by message identity: the `message-id` property, or a hash of the payload.
#[derive(Debug, Default)]
pub struct RedeliveryTracker {
    failures: HashMap<String, u32>,
}

impl RedeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(msg: &Message) -> String {
        match msg.message_id() {
            Some(id) => format!("id:{id}"),
            None => {
                let mut hasher = DefaultHasher::new();
                msg.payload.hash(&mut hasher);
                format!("payload:{:016x}", hasher.finish())
            }
        }
    }

    /// Records one more failure and returns the number of failed attempts so far.
    ///
    /// The broker's own `x-delivery-count` wins when present. A first-time
    /// delivery resets any stale count.
    pub fn record_failure(&mut self, msg: &Message) -> u32 {
        let key = Self::key(msg);

        if !msg.redelivered {
            self.failures.remove(&key);
        }

        if !self.failures.contains_key(&key) && self.failures.len() >= MAX_TRACKED_MESSAGES {
            warn!(
                tracked = self.failures.len(),
                "too many messages tracked for redelivery, resetting counts"
            );
            self.failures.clear();
        }

        let count = self.failures.entry(key).or_insert(0);
        *count = match msg.delivery_count() {
            Some(previous) => (*count).max(previous) + 1,
            None => *count + 1,
        };
        *count
    }

    /// Drops the count of a message that reached a terminal decision.
    pub fn forget(&mut self, msg: &Message) {
        self.failures.remove(&Self::key(msg));
    }

    /// Number of messages with at least one recorded failure.
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    /// Whether no failure is being tracked.
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Consumes one delivered message and issues its acknowledgment decision.
///
/// Handler failures and panics never escape: they become a nack or a
/// dead-letter. An error is returned only when the acknowledgment itself could
/// not be sent, which means the channel is gone and the broker will redeliver.
pub async fn consume<A>(
    tracer: &BoxedTracer,
    acker: &A,
    handler: &dyn MessageHandler,
    tracker: &Mutex<RedeliveryTracker>,
    policy: &DeliveryPolicy,
    msg: &Message,
) -> Result<Decision, AmqpError>
where
    A: DeliveryAcker + ?Sized,
{
    let cx = otel::consumer_context(&msg.properties, tracer, "consume");
    let span = cx.span();

    debug!(
        delivery_tag = msg.delivery_tag,
        redelivered = msg.redelivered,
        "received message"
    );

    let result = dispatch(handler, msg).await;

    let decision = match result {
        Ok(()) => {
            debug!(delivery_tag = msg.delivery_tag, "message successfully processed");
            acker.ack(msg.delivery_tag).await?;
            lock(tracker).forget(msg);
            Decision::Acked
        }
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from(err.to_string()),
            });
            on_failure(acker, tracker, policy, msg, &err, &cx).await?
        }
    };

    if decision == Decision::Acked {
        span.set_status(Status::Ok);
    }
    span.end();

    Ok(decision)
}

/// Decodes the payload and runs the handler, turning panics into failures.
async fn dispatch(handler: &dyn MessageHandler, msg: &Message) -> Result<(), HandlerError> {
    let body = msg.body(handler.binary())?;

    match AssertUnwindSafe(handler.handle(body)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::Panicked(panic_message(panic))),
    }
}

async fn on_failure<A>(
    acker: &A,
    tracker: &Mutex<RedeliveryTracker>,
    policy: &DeliveryPolicy,
    msg: &Message,
    err: &HandlerError,
    cx: &Context,
) -> Result<Decision, AmqpError>
where
    A: DeliveryAcker + ?Sized,
{
    let attempts = lock(tracker).record_failure(msg);

    if !err.is_permanent() && attempts <= policy.max_redeliveries {
        warn!(
            error = err.to_string(),
            delivery_tag = msg.delivery_tag,
            attempts,
            max_redeliveries = policy.max_redeliveries,
            "error whiling handling msg, requeuing for latter"
        );
        acker.nack(msg.delivery_tag, true).await?;
        return Ok(Decision::Requeued);
    }

    let decision = match (&policy.failure_policy, &policy.dlq_name) {
        (FailurePolicy::DeadLetter, Some(dlq_name)) => {
            error!(
                error = err.to_string(),
                delivery_tag = msg.delivery_tag,
                attempts,
                dlq = dlq_name,
                "too many attempts, sending to dlq"
            );

            if acker.dead_letter(dlq_name, msg, cx).await.is_err() {
                // keep the message rather than lose it; it comes back and tries the dlq again
                acker.nack(msg.delivery_tag, true).await?;
                return Ok(Decision::Requeued);
            }

            acker.ack(msg.delivery_tag).await?;
            Decision::DeadLettered
        }
        _ => {
            error!(
                error = err.to_string(),
                delivery_tag = msg.delivery_tag,
                attempts,
                payload_bytes = msg.payload.len(),
                "too many attempts, discarding message"
            );
            acker.ack(msg.delivery_tag).await?;
            Decision::Discarded
        }
    };

    lock(tracker).forget(msg);
    Ok(decision)
}

fn lock(tracker: &Mutex<RedeliveryTracker>) -> std::sync::MutexGuard<'_, RedeliveryTracker> {
    match tracker.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        return (*msg).to_owned();
    }

    match panic.downcast::<String>() {
        Ok(msg) => *msg,
        Err(_) => "unknown panic".to_owned(),
    }
}
