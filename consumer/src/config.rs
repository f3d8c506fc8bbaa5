//! Configuration management for the user-sync consumer.
//!
//! Loads configuration from environment variables (optionally seeded from a `.env` file).
//! Connection settings are required; everything else has a default.

use std::time::Duration;
use thiserror::Error;
use user_sync_projections::{PoisonPolicy, ProcessorConfig};
use user_sync_redpanda::DEFAULT_CONSUMER_GROUP;

/// Topic the MongoDB connector publishes `productionData.users` changes to.
pub const DEFAULT_TOPIC: &str = "mongo.productionData.users";

/// Errors raised while reading configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is not set
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    /// A variable is set to a value that cannot be used
    #[error("Invalid value {value:?} for {name}: {reason}")]
    Invalid {
        /// Variable name
        name: &'static str,
        /// The offending value
        value: String,
        /// What was expected
        reason: &'static str,
    },
}

/// Application configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// `PostgreSQL` configuration
    pub postgres: PostgresConfig,
    /// Kafka/Redpanda configuration
    pub kafka: KafkaConfig,
    /// Processing loop configuration
    pub processing: ProcessingConfig,
}

/// `PostgreSQL` configuration
#[derive(Clone, PartialEq, Eq)]
pub struct PostgresConfig {
    /// Connection URL (`POSTGRES_CONNECTION_STRING`)
    pub url: String,
    /// Pool size (`DATABASE_MAX_CONNECTIONS`, default 5)
    pub max_connections: u32,
    /// Apply migrations on startup (`RUN_MIGRATIONS`, default true)
    pub run_migrations: bool,
}

impl std::fmt::Debug for PostgresConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("run_migrations", &self.run_migrations)
            .finish()
    }
}

/// Kafka/Redpanda configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KafkaConfig {
    /// Broker addresses, comma-separated (`KAFKA_BOOTSTRAP_SERVERS`)
    pub bootstrap_servers: String,
    /// Change topic (`KAFKA_TOPIC`)
    pub topic: String,
    /// Consumer group (`KAFKA_GROUP_ID`)
    pub group_id: String,
    /// Start position for a group without offsets (`KAFKA_AUTO_OFFSET_RESET`)
    pub auto_offset_reset: String,
}

/// Processing loop configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingConfig {
    /// Poll timeout (`POLL_TIMEOUT_MS`, default 2000)
    pub poll_timeout: Duration,
    /// Park undecodable messages after this many attempts (`DEAD_LETTER_AFTER`, unset means
    /// retry forever)
    pub dead_letter_after: Option<u32>,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or a value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a required variable is missing or a value is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|value| !value.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };
        let optional = |name: &'static str, default: &str| {
            lookup(name).unwrap_or_else(|| default.to_string())
        };

        let auto_offset_reset = optional("KAFKA_AUTO_OFFSET_RESET", "earliest");
        if !matches!(auto_offset_reset.as_str(), "earliest" | "latest" | "error") {
            return Err(ConfigError::Invalid {
                name: "KAFKA_AUTO_OFFSET_RESET",
                value: auto_offset_reset,
                reason: "expected earliest, latest or error",
            });
        }

        let dead_letter_after = match lookup("DEAD_LETTER_AFTER") {
            None => None,
            Some(value) => match value.parse::<u32>() {
                Ok(attempts) if attempts > 0 => Some(attempts),
                _ => {
                    return Err(ConfigError::Invalid {
                        name: "DEAD_LETTER_AFTER",
                        value,
                        reason: "expected a positive attempt count",
                    });
                }
            },
        };

        Ok(Self {
            postgres: PostgresConfig {
                url: required("POSTGRES_CONNECTION_STRING")?,
                max_connections: parse_number(&lookup, "DATABASE_MAX_CONNECTIONS", 5)?,
                run_migrations: parse_bool(&lookup, "RUN_MIGRATIONS", true)?,
            },
            kafka: KafkaConfig {
                bootstrap_servers: required("KAFKA_BOOTSTRAP_SERVERS")?,
                topic: optional("KAFKA_TOPIC", DEFAULT_TOPIC),
                group_id: optional("KAFKA_GROUP_ID", DEFAULT_CONSUMER_GROUP),
                auto_offset_reset,
            },
            processing: ProcessingConfig {
                poll_timeout: Duration::from_millis(parse_number(&lookup, "POLL_TIMEOUT_MS", 2000)?),
                dead_letter_after,
            },
        })
    }

    /// The processing loop settings.
    #[must_use]
    pub fn processor_config(&self) -> ProcessorConfig {
        let poison = self
            .processing
            .dead_letter_after
            .map_or(PoisonPolicy::RetryForever, |max_attempts| {
                PoisonPolicy::DeadLetter { max_attempts }
            });

        ProcessorConfig::default()
            .with_poll_timeout(self.processing.poll_timeout)
            .with_poison_policy(poison)
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            value,
            reason: "expected a non-negative integer",
        }),
    }
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match lookup(name).as_deref().map(str::trim) {
        None => Ok(default),
        Some("true" | "1" | "yes") => Ok(true),
        Some("false" | "0" | "no") => Ok(false),
        Some(other) => Err(ConfigError::Invalid {
            name,
            value: other.to_string(),
            reason: "expected true or false",
        }),
    }
}
