// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

#[cfg(test)]
mod testing;

pub mod backoff;
pub mod broker;
pub mod channel;
pub mod configs;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod handler;
pub mod health;
pub mod logging;
pub mod message;
pub mod queue;
pub mod watcher;
