// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Watcher Service
//!
//! Composition root of the consumer: wires the connection manager, the consumer
//! loop and the reconnect backoff together, and runs them on a dedicated tokio
//! task so the host process keeps serving other work (the health endpoint).
//!
//! The reconnect loop is iterative. Each turn is one connection epoch:
//!
//! ```text
//! connect -> declare queue -> subscribe -> consume ... failure -> sleep(backoff) -> connect
//! ```
//!
//! Process-wide states:
//!
//! ```text
//! Init -> Connecting -> Consuming -> Reconnecting -> Consuming -> ... -> ShuttingDown -> Stopped
//! ```

use crate::{
    backoff::Backoff,
    broker::Broker,
    channel::AmqpBroker,
    configs::Configs,
    consumer::DeliveryPolicy,
    dispatcher::{Dispatcher, WatchOutcome},
    errors::ConfigError,
    handler::MessageHandler,
    queue::QueueDefinition,
};
use serde::Serialize;
use std::{fmt, sync::Arc};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Lifecycle of the watcher process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatcherState {
    Init,
    Connecting,
    Consuming,
    Reconnecting,
    ShuttingDown,
    Stopped,
}

impl fmt::Display for WatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WatcherState::Init => "init",
            WatcherState::Connecting => "connecting",
            WatcherState::Consuming => "consuming",
            WatcherState::Reconnecting => "reconnecting",
            WatcherState::ShuttingDown => "shutting_down",
            WatcherState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Long-running consumer of one durable queue.
pub struct WatcherService {
    configs: Configs,
    broker: Arc<dyn Broker>,
    handler: Arc<dyn MessageHandler>,
    shutdown: CancellationToken,
    state: watch::Sender<WatcherState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WatcherService {
    /// Creates a watcher consuming from the RabbitMQ broker named in `configs`.
    pub fn new(configs: Configs, handler: Arc<dyn MessageHandler>) -> Self {
        let broker = Arc::new(AmqpBroker::new(&configs));
        Self::with_broker(configs, broker, handler)
    }

    /// Creates a watcher on top of any [`Broker`] implementation.
    pub fn with_broker(
        configs: Configs,
        broker: Arc<dyn Broker>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (state, _) = watch::channel(WatcherState::Init);

        WatcherService {
            configs,
            broker,
            handler,
            shutdown: CancellationToken::new(),
            state,
            task: Mutex::new(None),
        }
    }

    /// Validates the configuration and starts the reconnect loop in the background.
    ///
    /// Returns as soon as the loop is spawned. A configuration error is returned
    /// before any connection attempt; the caller is expected to treat it as fatal.
    pub async fn start(&self) -> Result<(), ConfigError> {
        if let Err(err) = self.configs.validate() {
            error!(error = err.to_string(), "invalid watcher configuration");
            return Err(err);
        }

        let mut task = self.task.lock().await;
        if task.is_some() {
            warn!("watcher already started");
            return Ok(());
        }

        let queue = QueueDefinition::from(&self.configs.rabbitmq);
        let policy = DeliveryPolicy::new(&self.configs.rabbitmq, &queue);
        let dispatcher = Dispatcher::new(queue, self.configs.rabbitmq.prefetch, policy);

        info!(
            address = self.configs.redacted_url(),
            queue = self.configs.rabbitmq.queue,
            prefetch = self.configs.rabbitmq.prefetch,
            "starting queue watcher"
        );

        *task = Some(tokio::spawn(run(
            self.broker.clone(),
            dispatcher,
            self.handler.clone(),
            self.configs.backoff,
            self.shutdown.clone(),
            self.state.clone(),
        )));

        Ok(())
    }

    /// Stops the watcher: no further connection attempts, in-flight messages
    /// finish, then the channel and connection are closed.
    pub async fn stop(&self) {
        self.shutdown.cancel();

        let handle = self.task.lock().await.take();
        match handle {
            Some(handle) => {
                if let Err(err) = handle.await {
                    error!(error = err.to_string(), "watcher task failure");
                }
            }
            None => {
                self.state.send_replace(WatcherState::Stopped);
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe(&self) -> watch::Receiver<WatcherState> {
        self.state.subscribe()
    }

    /// Configuration the watcher was built with.
    pub fn configs(&self) -> &Configs {
        &self.configs
    }
}

/// The reconnect loop: one connection epoch per turn, until shutdown.
async fn run(
    broker: Arc<dyn Broker>,
    dispatcher: Dispatcher,
    handler: Arc<dyn MessageHandler>,
    backoff: Backoff,
    shutdown: CancellationToken,
    state: watch::Sender<WatcherState>,
) {
    let mut failures: u32 = 0;
    let mut next = WatcherState::Connecting;

    while !shutdown.is_cancelled() {
        state.send_replace(next);

        let connected = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = broker.connect() => result,
        };

        let err = match connected {
            Ok(session) => {
                let outcome = dispatcher
                    .watch(session.as_ref(), handler.clone(), &shutdown, || {
                        failures = 0;
                        state.send_replace(WatcherState::Consuming);
                    })
                    .await;

                if outcome == WatchOutcome::Shutdown {
                    state.send_replace(WatcherState::ShuttingDown);
                }
                session.close().await;

                match outcome {
                    WatchOutcome::Shutdown => break,
                    WatchOutcome::ConnectionLost(err) => err,
                }
            }
            Err(err) => err,
        };

        failures = failures.saturating_add(1);
        next = WatcherState::Reconnecting;
        state.send_replace(next);

        let delay = backoff.next_delay(failures);
        warn!(
            error = err.to_string(),
            queue = dispatcher.queue().name(),
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "broker unavailable, reconnecting later"
        );

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {},
        }
    }

    state.send_replace(WatcherState::ShuttingDown);
    state.send_replace(WatcherState::Stopped);
    info!(queue = dispatcher.queue().name(), "queue watcher stopped");
}
