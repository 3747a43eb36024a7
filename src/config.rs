//! Configuration for the integration event bus.
//!
//! Supports YAML file and environment variable overrides.

use serde::Deserialize;
use std::path::Path;

/// Bus configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Broker connection configuration.
    pub amqp: AmqpSettings,
    /// Consumer queue configuration.
    pub consumer: ConsumerSettings,
    /// Outbox relay/sweeper configuration.
    pub outbox: OutboxSettings,
}

/// Broker connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    /// AMQP connection URL.
    pub url: String,
    /// Exchange name for publishing events.
    pub exchange: String,
    /// Connection attempts per `try_connect` call before giving up.
    /// Delay between attempts doubles each time; keep this below ~6.
    pub max_connect_attempts: u32,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchange: "caravel.events".to_string(),
            max_connect_attempts: 5,
        }
    }
}

/// Consumer queue configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Durable queue name for this subscriber group.
    pub queue: String,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            queue: "caravel".to_string(),
        }
    }
}

/// Outbox sweep configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    /// Interval in seconds between background sweep runs.
    pub sweep_interval_secs: u64,
    /// Maximum entries re-relayed per sweep run.
    pub sweep_batch_size: u32,
    /// Age in seconds after which an unsent entry counts as stalled.
    pub stalled_after_secs: u64,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 5,
            sweep_batch_size: 100,
            stalled_after_secs: 30,
        }
    }
}

impl BusConfig {
    /// Load configuration from file and environment.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Config file
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CARAVEL_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            Self::from_file(&config_path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.to_string(), e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("CARAVEL_AMQP_URL") {
            self.amqp.url = url;
        }

        if let Ok(exchange) = std::env::var("CARAVEL_EXCHANGE") {
            self.amqp.exchange = exchange;
        }

        if let Ok(attempts) = std::env::var("CARAVEL_MAX_CONNECT_ATTEMPTS") {
            if let Ok(n) = attempts.parse() {
                self.amqp.max_connect_attempts = n;
            }
        }

        if let Ok(queue) = std::env::var("CARAVEL_QUEUE") {
            self.consumer.queue = queue;
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{0}': {1}")]
    FileRead(String, String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BusConfig::default();
        assert_eq!(config.amqp.url, "amqp://localhost:5672");
        assert_eq!(config.amqp.exchange, "caravel.events");
        assert_eq!(config.amqp.max_connect_attempts, 5);
        assert_eq!(config.consumer.queue, "caravel");
        assert_eq!(config.outbox.sweep_interval_secs, 5);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
amqp:
  url: amqp://rabbit.internal:5672
  exchange: clinic.events
  max_connect_attempts: 3

consumer:
  queue: scheduling-service

outbox:
  sweep_interval_secs: 10
  sweep_batch_size: 50
  stalled_after_secs: 60
"#;

        let config: BusConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.amqp.url, "amqp://rabbit.internal:5672");
        assert_eq!(config.amqp.exchange, "clinic.events");
        assert_eq!(config.amqp.max_connect_attempts, 3);
        assert_eq!(config.consumer.queue, "scheduling-service");
        assert_eq!(config.outbox.sweep_batch_size, 50);
        assert_eq!(config.outbox.stalled_after_secs, 60);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
consumer:
  queue: billing-service
"#;
        let config: BusConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.consumer.queue, "billing-service");
        assert_eq!(config.amqp.url, "amqp://localhost:5672");
    }
}
