//! Backoff strategies.
//!
//! Two collaborators in this workspace need "wait a bit, then try again"
//! arithmetic: the Pool's circuit breaker (recovery timeout before a
//! half-open probe) and the Scheduler (repacing a claim attempt after a
//! transient executor failure). Both share this module rather than hand
//! rolling their own delay math.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay grows across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// No delay - retry immediately.
    Immediate,
    /// Delay doubles each attempt (default).
    #[default]
    Exponential,
    /// Delay increases linearly with the attempt count.
    Linear,
    /// Same delay every attempt.
    Constant,
}

/// Configuration for a backoff sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub base_delay: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub max_delay: Duration,
    /// Jitter factor in `[0.0, 1.0]`; 0 disables jitter entirely.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.3,
        }
    }
}

fn default_jitter() -> f64 {
    0.3
}

/// The fixed recovery-timeout flavor of backoff used by the circuit
/// breaker: a single, un-jittered wait after the configured number of
/// consecutive failures, per §4.1.
impl BackoffConfig {
    pub fn circuit_recovery(recovery_timeout: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Constant,
            base_delay: recovery_timeout,
            max_delay: recovery_timeout,
            jitter: 0.0,
        }
    }
}

/// Compute the delay before the `attempt`-th retry (1-indexed).
pub fn calculate_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        BackoffStrategy::Immediate => Duration::ZERO,
        BackoffStrategy::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        BackoffStrategy::Linear => config.base_delay.saturating_mul(attempt.max(1)),
        BackoffStrategy::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Jitter factor of 0.5 means delay * (0.5 to 1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter_range = 2.0 * jitter;
    let random_factor = 1.0 - jitter + (rand::random::<f64>() * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round().max(0.0) as u64;
    Duration::from_millis(millis)
}

pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}
