/*
 *
 * Copyright 2026 roam authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Exponential backoff between connection attempts.

use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

/// Parameters of the exponential backoff schedule.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Wait after the first failure.
    pub base_delay: Duration,
    /// Growth factor applied after every failed attempt; at least 1.
    pub multiplier: f64,
    /// Randomization factor applied to each delay, in `[0, 1]`.
    pub jitter: f64,
    /// Upper bound on the delay.
    pub max_delay: Duration,
}

/// The connection-backoff defaults: 1s base, 1.6x growth, +/-20% jitter,
/// capped at 120s.
pub const DEFAULT_BACKOFF_CONFIG: BackoffConfig = BackoffConfig {
    base_delay: Duration::from_secs(1),
    multiplier: 1.6,
    jitter: 0.2,
    max_delay: Duration::from_secs(120),
};

/// How long a connection must stay ready for the backoff schedule to be
/// reset to its base delay.
pub(crate) const BACKOFF_READY_RESET_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    /// The next delay before jitter; kept in float seconds to avoid
    /// accumulating rounding error.
    next_delay_secs: Mutex<f64>,
}

impl BackoffConfig {
    fn validate(&self) -> Result<(), &'static str> {
        if self.base_delay > self.max_delay {
            return Err("base_delay must not exceed max_delay");
        }
        if self.multiplier < 1.0 {
            return Err("multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("jitter must be within [0, 1]");
        }
        Ok(())
    }
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Result<Self, &'static str> {
        config.validate()?;
        let next_delay_secs = config.base_delay.as_secs_f64();
        Ok(ExponentialBackoff {
            config,
            next_delay_secs: Mutex::new(next_delay_secs),
        })
    }

    /// Restarts the schedule from the base delay.
    pub fn reset(&self) {
        *self.next_delay_secs.lock() = self.config.base_delay.as_secs_f64();
    }

    /// Returns the delay to wait before the next attempt and advances the
    /// schedule.
    pub fn backoff_duration(&self) -> Duration {
        let mut next_delay = self.next_delay_secs.lock();
        let jittered = *next_delay
            * (1.0 + self.config.jitter * rand::thread_rng().gen_range(-1.0..=1.0));
        *next_delay = self
            .config
            .max_delay
            .as_secs_f64()
            .min(*next_delay * self.config.multiplier);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(ExponentialBackoff::new(BackoffConfig {
            base_delay: Duration::from_secs(100),
            max_delay: Duration::from_secs(10),
            ..DEFAULT_BACKOFF_CONFIG
        })
        .is_err());
        assert!(ExponentialBackoff::new(BackoffConfig {
            multiplier: 0.5,
            ..DEFAULT_BACKOFF_CONFIG
        })
        .is_err());
        assert!(ExponentialBackoff::new(BackoffConfig {
            jitter: 1.5,
            ..DEFAULT_BACKOFF_CONFIG
        })
        .is_err());
    }

    #[test]
    fn schedule_grows_caps_and_resets() {
        let backoff = ExponentialBackoff::new(BackoffConfig {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
            max_delay: Duration::from_secs(6),
        })
        .unwrap();
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(1));
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(2));
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(4));
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(6));
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(6));

        backoff.reset();
        assert_eq!(backoff.backoff_duration(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = ExponentialBackoff::new(DEFAULT_BACKOFF_CONFIG.clone()).unwrap();
        for _ in 0..32 {
            backoff.reset();
            let delay = backoff.backoff_duration().as_secs_f64();
            assert!((0.8..=1.2).contains(&delay), "delay {delay} out of range");
        }
    }
}
