//! Configuration for the client and its watch stream.

use rand::Rng;
use std::time::Duration;

/// Configuration for a [`crate::Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Reconnect backoff for the watch stream.
    pub backoff: BackoffConfig,
    /// How long a default-source `get` waits for a server-confirmed result.
    pub get_timeout: Duration,
    /// Capacity of each [`crate::SnapshotStream`] queue.
    pub listener_capacity: usize,
    /// How long `shutdown` waits for pending writes to be acknowledged.
    pub shutdown_flush_timeout: Duration,
}

impl ClientConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            get_timeout: Duration::from_secs(10),
            listener_capacity: 64,
            shutdown_flush_timeout: Duration::from_secs(2),
        }
    }

    /// Sets the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the `get` timeout.
    pub fn with_get_timeout(mut self, timeout: Duration) -> Self {
        self.get_timeout = timeout;
        self
    }

    /// Sets the snapshot stream capacity. Zero is treated as one.
    pub fn with_listener_capacity(mut self, capacity: usize) -> Self {
        self.listener_capacity = capacity.max(1);
        self
    }

    /// Sets the shutdown flush timeout.
    pub fn with_shutdown_flush_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_flush_timeout = timeout;
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential reconnect backoff with random jitter.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay, before jitter.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Maximum jitter as a fraction of the delay (0.0 disables jitter).
    pub jitter: f64,
}

impl BackoffConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            multiplier: 1.5,
            jitter: 0.25,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the multiplier, clamped to at least `1.0`.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    /// Sets the jitter fraction, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 is immediate.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = if self.jitter > 0.0 {
            capped * rand::thread_rng().gen_range(0.0..=self.jitter)
        } else {
            0.0
        };
        // Out-of-range field values fall back to the cap.
        Duration::try_from_secs_f64(capped + jitter).unwrap_or(self.max_delay)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new()
    }
}
