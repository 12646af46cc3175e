use std::time::Duration;

/// Output format for [`crate::logging::init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, one event per line.
    #[default]
    Pretty,
    /// Newline-delimited JSON.
    Json,
}

/// Re-dispatch policy applied by [`crate::middleware::RetryLayer`] to faults
/// the transient-error strategy classifies as retryable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for any single delay.
    pub max_backoff: Duration,
    /// Growth factor applied to the delay after every retry.
    pub multiplier: u32,
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            multiplier: 2,
        }
    }
}

/// Engine-level configuration.
///
/// Controls broker parallelism, retry behavior, and log output.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of concurrent consumer loops a broker runs.
    pub degree_of_parallelism: usize,
    /// Retry behavior for transient faults.
    pub retry: RetryPolicy,
    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            degree_of_parallelism: 4,
            retry: RetryPolicy::default(),
            log_format: LogFormat::default(),
        }
    }
}
