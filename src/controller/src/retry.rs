// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Exponential backoff with a ceiling and bounded jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Configures backoff behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// The delay before the first retry.
    pub initial: Duration,
    /// The multiplier applied to the delay after each retry.
    pub factor: f64,
    /// The ceiling on the computed delay, before jitter.
    pub cap: Duration,
    /// The fraction of the delay used as the jitter band. A delay `d`
    /// becomes a uniform sample from `[d * (1 - jitter), d * (1 + jitter)]`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

/// Tracks the backoff state for one retried operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Creates a backoff in its initial state.
    pub fn new(config: BackoffConfig) -> Backoff {
        Backoff { config, attempt: 0 }
    }

    /// Returns the number of failures recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Records a failure and returns the delay to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .config
            .factor
            .powi(i32::try_from(self.attempt.min(63)).expect("bounded above"));
        self.attempt += 1;
        let base = self.config.initial.as_secs_f64() * exp;
        let capped = base.min(self.config.cap.as_secs_f64());
        let jittered = if self.config.jitter > 0.0 {
            let band = capped * self.config.jitter;
            capped - band + rand::thread_rng().gen::<f64>() * band * 2.0
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Resets the backoff after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(8),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let mut backoff = Backoff::new(config());
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        // Capped from here on.
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new(config());
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_band() {
        let mut backoff = Backoff::new(BackoffConfig {
            jitter: 0.25,
            ..config()
        });
        for _ in 0..32 {
            let delay = backoff.next_delay().as_secs_f64();
            assert!(delay <= 8.0 * 1.25, "delay {delay} outside jitter band");
        }
    }
}
