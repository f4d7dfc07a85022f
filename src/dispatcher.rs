// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Loop
//!
//! Runs one connection epoch of consumption: declares the durable queue,
//! subscribes with the configured prefetch and dispatches deliveries to the
//! handler until the session fails or shutdown is requested.
//!
//! Up to `prefetch` handler invocations run at once. With the default prefetch
//! of 1, messages are processed strictly one at a time in delivery order.

use crate::{
    broker::Session,
    consumer::{consume, DeliveryPolicy, RedeliveryTracker},
    errors::AmqpError,
    handler::MessageHandler,
    otel,
    queue::QueueDefinition,
};
use futures_util::{future, StreamExt};
use opentelemetry::global;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why a consumption epoch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// Shutdown was requested; in-flight messages were allowed to finish
    Shutdown,
    /// The connection or channel went away, or an acknowledgment could not be sent
    ConnectionLost(AmqpError),
}

/// Everything the consumer loop needs besides the session and the handler.
pub struct Dispatcher {
    queue: QueueDefinition,
    prefetch: u16,
    policy: DeliveryPolicy,
    tracker: Mutex<RedeliveryTracker>,
}

impl Dispatcher {
    /// A zero `prefetch` is raised to 1. Redelivery counts live as long as the
    /// dispatcher, across connection epochs.
    pub fn new(queue: QueueDefinition, prefetch: u16, policy: DeliveryPolicy) -> Self {
        Dispatcher {
            queue,
            prefetch: prefetch.max(1),
            policy,
            tracker: Mutex::new(RedeliveryTracker::new()),
        }
    }

    /// The watched queue.
    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    /// Declares the queue, subscribes and consumes until the session ends.
    ///
    /// `on_subscribed` runs once the broker accepted the subscription.
    pub async fn watch(
        &self,
        session: &dyn Session,
        handler: Arc<dyn MessageHandler>,
        shutdown: &CancellationToken,
        on_subscribed: impl FnOnce(),
    ) -> WatchOutcome {
        if let Err(err) = session.declare(&self.queue).await {
            return WatchOutcome::ConnectionLost(err);
        }

        let deliveries = match session.subscribe(self.queue.name(), self.prefetch).await {
            Ok(stream) => stream,
            Err(err) => return WatchOutcome::ConnectionLost(err),
        };

        on_subscribed();
        info!(
            queue = self.queue.name(),
            prefetch = self.prefetch,
            "watching queue"
        );

        let lost = session.lost();
        let stop = {
            let (shutdown, lost) = (shutdown.clone(), lost.clone());
            async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {},
                    _ = lost.cancelled() => {},
                }
            }
        };

        let failure: Mutex<Option<AmqpError>> = Mutex::new(None);
        let tracer = global::tracer(otel::TRACER_NAME);

        deliveries
            .take_until(stop)
            .take_while(|result| {
                if let Err(err) = result {
                    error!(error = err.to_string(), "errors consume msg");
                    record_failure(&failure, err.clone());
                }
                future::ready(result.is_ok())
            })
            .filter_map(|result| future::ready(result.ok()))
            .for_each_concurrent(usize::from(self.prefetch), |msg| {
                let (handler, tracer, failure, lost) = (handler.clone(), &tracer, &failure, &lost);
                async move {
                    match consume(
                        tracer,
                        session,
                        handler.as_ref(),
                        &self.tracker,
                        &self.policy,
                        &msg,
                    )
                    .await
                    {
                        Ok(decision) => {
                            debug!(delivery_tag = msg.delivery_tag, ?decision, "message settled")
                        }
                        Err(err) => {
                            error!(error = err.to_string(), "error consume msg");
                            record_failure(failure, err);
                            // without acknowledgments the channel is useless; end the epoch
                            lost.cancel();
                        }
                    }
                }
            })
            .await;

        if shutdown.is_cancelled() {
            info!(queue = self.queue.name(), "consumer stopped");
            return WatchOutcome::Shutdown;
        }

        let err = take_failure(&failure).unwrap_or_else(|| {
            AmqpError::ConsumerError("delivery stream closed by the broker".to_owned())
        });
        warn!(error = err.to_string(), queue = self.queue.name(), "consumer lost");
        WatchOutcome::ConnectionLost(err)
    }
}

fn record_failure(slot: &Mutex<Option<AmqpError>>, err: AmqpError) {
    let mut guard = match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.get_or_insert(err);
}

fn take_failure(slot: &Mutex<Option<AmqpError>>) -> Option<AmqpError> {
    match slot.lock() {
        Ok(mut guard) => guard.take(),
        Err(poisoned) => poisoned.into_inner().take(),
    }
}
