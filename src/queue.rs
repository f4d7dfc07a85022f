// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! The watcher consumes one durable queue and, when poison messages are
//! dead-lettered, publishes to a sibling `<queue>-dlq`. No arguments are attached
//! to the main queue, so re-declaring a queue an operator already created is a
//! no-op on the broker instead of a `PRECONDITION_FAILED`.

use crate::configs::{FailurePolicy, RabbitMQConfigs};

/// Definition of a RabbitMQ queue the watcher declares before consuming.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) dlq_name: Option<String>,
}

impl QueueDefinition {
    /// Creates a new, non-durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
            dlq_name: None,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Adds a Dead Letter Queue (DLQ) named after the queue with a "-dlq" suffix.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Name the queue is declared and consumed under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the queue survives a broker restart.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Name of the dead-letter queue, declared next to this one when set.
    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }
}

impl From<&RabbitMQConfigs> for QueueDefinition {
    fn from(cfg: &RabbitMQConfigs) -> Self {
        let def = QueueDefinition::new(&cfg.queue).durable();

        match cfg.failure_policy {
            FailurePolicy::DeadLetter => def.with_dlq(),
            FailurePolicy::Discard => def,
        }
    }
}
