use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ConfigError;

/// Exponential backoff for reflector retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    /// Failures tolerated before the first successful list. `None` retries forever.
    pub max_initial_retries: Option<u32>,
    /// Consecutive failures tolerated once synced. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(800),
            max: Duration::from_secs(30),
            factor: 2.0,
            max_initial_retries: Some(10),
            max_retries: None,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Whether `failures` consecutive failures exceed the policy.
    pub fn exhausted(&self, failures: u32, synced_once: bool) -> bool {
        let limit = if synced_once { self.max_retries } else { self.max_initial_retries };
        limit.map(|l| failures > l).unwrap_or(false)
    }
}

/// Runtime knobs for one informer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformerConfig {
    /// Bound of the queue between reflector and processing loop.
    pub queue_capacity: usize,
    /// Re-deliver every cached object as an update at this interval.
    pub resync_period: Option<Duration>,
    pub backoff: BackoffPolicy,
}

impl Default for InformerConfig {
    fn default() -> Self {
        Self { queue_capacity: 2048, resync_period: Some(Duration::from_secs(3600)), backoff: BackoffPolicy::default() }
    }
}

impl InformerConfig {
    /// Defaults overridden by `KINFORMER_*` environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<usize>("KINFORMER_QUEUE_CAP") {
            cfg.queue_capacity = v;
        }
        if let Some(v) = env_parse::<u64>("KINFORMER_RESYNC_SECS") {
            cfg.resync_period = if v == 0 { None } else { Some(Duration::from_secs(v)) };
        }
        if let Some(v) = env_parse::<u64>("KINFORMER_BACKOFF_INITIAL_MS") {
            cfg.backoff.initial = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("KINFORMER_BACKOFF_MAX_SECS") {
            cfg.backoff.max = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u32>("KINFORMER_MAX_INITIAL_RETRIES") {
            cfg.backoff.max_initial_retries = Some(v);
        }
        if let Some(v) = env_parse::<u32>("KINFORMER_MAX_RETRIES") {
            cfg.backoff.max_retries = Some(v);
        }
        cfg
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be > 0".into()));
        }
        if self.backoff.factor < 1.0 {
            return Err(ConfigError::Invalid("backoff factor must be >= 1".into()));
        }
        if self.backoff.initial.is_zero() {
            return Err(ConfigError::Invalid("backoff initial must be > 0".into()));
        }
        if self.backoff.initial > self.backoff.max {
            return Err(ConfigError::Invalid("backoff initial exceeds max".into()));
        }
        if matches!(self.resync_period, Some(d) if d.is_zero()) {
            return Err(ConfigError::Invalid("resync period must be > 0 (use None to disable)".into()));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
