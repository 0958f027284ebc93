//! Exchange selection.
//!
//! The application describes the exchange it wants as JSON and
//! [`ExchangeConfig::build`] assembles it:
//!
//! ```json
//! { "type": "hashed", "local_bypass": true,
//!   "shards": [ { "type": "wire", "host": "10.0.0.5", "port": 7400 },
//!               { "type": "wire", "host": "10.0.0.6", "port": 7400 } ] }
//! ```

use std::{path::Path, sync::Arc, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    error::FatalHook,
    exchange::{
        bypass::LocalBypassExchange, hashed::HashedExchange, local::LocalExchange,
        wire::WireExchange, SharedExchange,
    },
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("invalid exchange config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("hashed exchange needs at least one shard")]
    NoShards,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(flatten)]
    pub backend: Backend,

    /// Wrap the backend in a [`LocalBypassExchange`].
    #[serde(default)]
    pub local_bypass: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backend {
    Local,
    Hashed { shards: Vec<Backend> },
    Wire(WireConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl WireConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            retry: RetryPolicy::default(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection retry schedule for the wire client.
///
/// The delay after failed attempt `n` (1-based) is
/// `min(initial + step * (n - 1), max)` plus up to `jitter` of random slack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub delay_step_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 100,
            delay_step_ms: 250,
            max_delay_ms: 2_000,
            jitter_ms: 100,
            connect_timeout_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Backoff before the attempt that follows failed attempt `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let steps = u64::from(attempt.saturating_sub(1));
        let base = self
            .initial_delay_ms
            .saturating_add(self.delay_step_ms.saturating_mul(steps))
            .min(self.max_delay_ms);
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        Duration::from_millis(base + jitter)
    }
}

impl ExchangeConfig {
    pub fn local() -> Self {
        Self {
            backend: Backend::Local,
            local_bypass: false,
        }
    }

    pub fn wire(host: impl Into<String>, port: u16) -> Self {
        Self {
            backend: Backend::Wire(WireConfig::new(host, port)),
            local_bypass: false,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Builds the exchange with the process-terminating fatal hook.
    ///
    /// Wire backends spawn their driver task, so this must run inside a
    /// Tokio runtime.
    pub fn build(&self) -> Result<SharedExchange, ConfigError> {
        self.build_with_fatal_hook(FatalHook::default())
    }

    pub fn build_with_fatal_hook(&self, fatal: FatalHook) -> Result<SharedExchange, ConfigError> {
        let exchange = self.backend.build(&fatal)?;
        if self.local_bypass {
            Ok(Arc::new(LocalBypassExchange::new(exchange)))
        } else {
            Ok(exchange)
        }
    }
}

impl Backend {
    fn build(&self, fatal: &FatalHook) -> Result<SharedExchange, ConfigError> {
        match self {
            Backend::Local => Ok(Arc::new(LocalExchange::new())),
            Backend::Hashed { shards } => {
                let shards = shards
                    .iter()
                    .map(|shard| shard.build(fatal))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Arc::new(HashedExchange::new(shards)?))
            }
            Backend::Wire(wire) => Ok(Arc::new(WireExchange::connect(
                wire.clone(),
                fatal.clone(),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_config() {
        let config = ExchangeConfig::from_json(r#"{ "type": "local" }"#).unwrap();
        assert_eq!(config, ExchangeConfig::local());
    }

    #[test]
    fn parses_wire_config_with_partial_retry_policy() {
        let config = ExchangeConfig::from_json(
            r#"{ "type": "wire", "host": "10.1.2.3", "port": 7400,
                 "local_bypass": true, "retry": { "max_attempts": 3 } }"#,
        )
        .unwrap();

        assert!(config.local_bypass);
        let Backend::Wire(wire) = config.backend else {
            panic!("expected wire backend");
        };
        assert_eq!(wire.addr(), "10.1.2.3:7400");
        assert_eq!(wire.retry.max_attempts, 3);
        assert_eq!(wire.retry.max_delay_ms, RetryPolicy::default().max_delay_ms);
    }

    #[test]
    fn parses_nested_hashed_config() {
        let config = ExchangeConfig::from_json(
            r#"{ "type": "hashed", "shards": [
                   { "type": "local" },
                   { "type": "wire", "host": "h", "port": 1 } ] }"#,
        )
        .unwrap();

        match config.backend {
            Backend::Hashed { shards } => {
                assert_eq!(shards.len(), 2);
                assert_eq!(shards[0], Backend::Local);
                assert!(matches!(&shards[1], Backend::Wire(wire) if wire.port == 1));
            }
            other => panic!("unexpected backend {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_backend_type() {
        assert!(matches!(
            ExchangeConfig::from_json(r#"{ "type": "carrier-pigeon" }"#),
            Err(ConfigError::Json(_))
        ));
    }

    #[test]
    fn empty_hashed_config_fails_to_build() {
        let config = ExchangeConfig {
            backend: Backend::Hashed { shards: Vec::new() },
            local_bypass: false,
        };
        assert!(matches!(config.build(), Err(ConfigError::NoShards)));
    }

    #[test]
    fn delays_grow_linearly_up_to_the_cap() {
        let policy = RetryPolicy {
            initial_delay_ms: 100,
            delay_step_ms: 400,
            max_delay_ms: 1_000,
            jitter_ms: 0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(500));
        assert_eq!(policy.delay_after(3), Duration::from_millis(900));
        assert_eq!(policy.delay_after(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay_after(40), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter_ms: 50,
            ..RetryPolicy::default()
        };
        for _ in 0..100 {
            let delay = policy.delay_after(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
