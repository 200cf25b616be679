//! Config - 検証済みの実行時設定
//!
//! 環境変数や CLI 引数の読み込みはバイナリ側の責務です。
//! ここでは値の組と検証だけを持ちます。

use std::time::Duration;

use crate::app::controller::ControllerSettings;
use crate::app::retry::RetryPolicy;
use crate::domain::RelayError;
use crate::impls::DEFAULT_CACHE_TTL;
use crate::ports::{DEFAULT_RESULT_PREFIX, DEFAULT_TASK_QUEUE};

pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
pub struct QueueSettings {
    pub task_queue: String,
    pub result_prefix: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            task_queue: DEFAULT_TASK_QUEUE.to_string(),
            result_prefix: DEFAULT_RESULT_PREFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencySettings {
    pub min: usize,
    pub max: usize,
    pub initial: usize,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            min: 1,
            max: 8,
            initial: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelayConfig {
    pub queues: QueueSettings,
    pub concurrency: ConcurrencySettings,
    pub controller: ControllerSettings,
    /// Max wait for the next result envelope on the dispatcher side.
    pub stream_timeout: Duration,
    pub cache_ttl: Option<Duration>,
    pub backend_retry: RetryPolicy,
    pub broker_retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queues: QueueSettings::default(),
            concurrency: ConcurrencySettings::default(),
            controller: ControllerSettings::default(),
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            cache_ttl: Some(DEFAULT_CACHE_TTL),
            backend_retry: RetryPolicy::default(),
            broker_retry: RetryPolicy::default(),
        }
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        let c = &self.concurrency;
        if c.min == 0 {
            return Err(invalid("min concurrency must be at least 1"));
        }
        if !(c.min <= c.initial && c.initial <= c.max) {
            return Err(RelayError::Config(format!(
                "concurrency must satisfy min <= initial <= max (got {} / {} / {})",
                c.min, c.initial, c.max
            )));
        }
        if self.queues.task_queue.is_empty() {
            return Err(invalid("task queue name is empty"));
        }
        if self.queues.result_prefix.is_empty() {
            return Err(invalid("result queue prefix is empty"));
        }
        if self.stream_timeout.is_zero() {
            return Err(invalid("stream timeout must be non-zero"));
        }
        if self.backend_retry.max_attempts == 0 || self.broker_retry.max_attempts == 0 {
            return Err(invalid("retry attempts must be at least 1"));
        }
        self.controller.validate()
    }
}

fn invalid(message: &str) -> RelayError {
    RelayError::Config(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        RelayConfig::default().validate().unwrap();
    }

    #[test]
    fn initial_outside_bounds_is_rejected() {
        let mut config = RelayConfig::default();
        config.concurrency = ConcurrencySettings {
            min: 2,
            max: 4,
            initial: 5,
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min <= initial <= max"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = RelayConfig::default();
        config.stream_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(RelayError::Config(_))));
    }

    #[test]
    fn inverted_thresholds_are_rejected() {
        let mut config = RelayConfig::default();
        config.controller.cpu_low = 90.0;
        assert!(config.validate().is_err());
    }
}
