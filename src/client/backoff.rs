// src/client/backoff.rs

use crate::config::BackoffConfig;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Exponential backoff with multiplicative jitter.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
    rng: SmallRng,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial,
            config,
            attempts: 0,
            rng: SmallRng::from_entropy(),
        }
    }

    /// The delay before the next attempt. Grows the base delay by the
    /// multiplier up to the cap; jitter is applied on top of the base.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = base.mul_f64(self.config.multiplier).min(self.config.max);
        self.attempts = self.attempts.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        base.mul_f64(1.0 + self.rng.gen_range(-jitter..=jitter))
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.attempts = 0;
    }
}

