// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconnect Backoff
//!
//! Pure strategy deciding how long the watcher waits before the next connection
//! attempt. It never gives up: the watcher is an unattended background worker
//! and nobody is waiting on a response.

use rand::Rng;
use std::time::Duration;

/// Delay the watcher applies between two connection attempts when nothing else
/// is configured.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Delay strategy between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Always wait the same amount of time.
    Fixed(Duration),

    /// Double the delay on each attempt, starting at `base`, never above `max`.
    ///
    /// With `jitter` the computed delay is replaced by a random value in
    /// `[ceil(delay / 2), delay]`, which keeps a fleet of watchers from reconnecting
    /// in lockstep after a broker restart.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(DEFAULT_RETRY_DELAY)
    }
}

impl Backoff {
    /// Builds the strategy from the configured delays.
    ///
    /// A cap that is not greater than the base delay means a fixed delay.
    pub fn from_delays(base: Duration, max: Duration, jitter: bool) -> Self {
        if max > base {
            Backoff::Exponential { base, max, jitter }
        } else {
            Backoff::Fixed(base)
        }
    }

    /// Configured delay before the first retry, before any jitter.
    pub fn base_delay(&self) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, .. } => base,
        }
    }

    /// Delay to wait before the connection attempt following the `attempt`-th
    /// consecutive failure (1-based).
    pub fn next_delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max, jitter } => {
                let exp = attempt.saturating_sub(1).min(31);
                let delay = base
                    .checked_mul(1u32 << exp)
                    .map_or(max, |d| d.min(max));

                if !jitter || delay.is_zero() {
                    return delay;
                }

                // never below half the delay, and never zero for a non-zero delay
                let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                let floor = millis.div_ceil(2).max(1).min(millis);
                Duration::from_millis(rand::thread_rng().gen_range(floor..=millis))
            }
        }
    }
}
