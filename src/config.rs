// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Settings
//!
//! All settings come from environment variables, read through the `config`
//! crate. Every variable is optional; missing ones take the defaults below.
//!
//! | Variable | Default |
//! |---|---|
//! | `AMQP_URI` | built from the `RABBITMQ_*` variables |
//! | `RABBITMQ_HOST` / `RABBITMQ_PORT` | `localhost` / `5672` |
//! | `RABBITMQ_USER` / `RABBITMQ_PASSWORD` | `guest` / `guest` |
//! | `RABBITMQ_VHOST` | `/` |
//! | `APP_NAME` | `rabbitmq-logs` |
//! | `WORKER_ID` | process id |
//! | `SERVICE_NAME` | none |
//! | `PREFETCH_COUNT` | `1` |
//! | `MAX_REDELIVERIES` | `3` |
//! | `ERROR_QUEUE_MESSAGE_TTL_MS` | none |
//! | `FAILURE_LEDGER_TTL_SECS` | `600` |
//! | `CONNECT_MAX_ATTEMPTS` | `5` |
//! | `CONNECT_BACKOFF_BASE_MS` / `CONNECT_BACKOFF_CAP_MS` | `1000` / `30000` |
//! | `MAX_RETRY_COUNT` | `5` |
//! | `PUBLISH_BACKOFF_BASE_MS` | `500` |
//! | `CONFIRM_TIMEOUT_MS` | `5000` |
//! | `IDEMPOTENCY_BACKEND` | `memory` (or `redis`) |
//! | `IDEMPOTENCY_TTL_SECS` | `3600` |
//! | `REDIS_URL` | none, required by the redis backend |
//! | `PROCESSING_UNIT_MS` | `1000` |
//! | `PRODUCER_MESSAGE_COUNT` | `10` |
//! | `LOG_LEVEL` | `info` |

use crate::{
    consumer::{DEFAULT_LEDGER_TTL, DEFAULT_MAX_REDELIVERIES},
    errors::AmqpError,
    idempotency::{
        IdempotencyStore, InMemoryIdempotencyStore, RedisIdempotencyStore, DEFAULT_SWEEP_INTERVAL,
    },
    publisher::DEFAULT_CONFIRM_TIMEOUT,
    retry::{Backoff, RetryPolicy},
};
use config::{Config, Environment};
use serde::Deserialize;
use std::{str::FromStr, sync::Arc, time::Duration};
use tracing::{error, info};

/// Raw environment, every key optional.
#[derive(Debug, Default, Deserialize)]
struct EnvSettings {
    amqp_uri: Option<String>,
    rabbitmq_host: Option<String>,
    rabbitmq_port: Option<u16>,
    rabbitmq_user: Option<String>,
    rabbitmq_password: Option<String>,
    rabbitmq_vhost: Option<String>,
    app_name: Option<String>,
    worker_id: Option<String>,
    service_name: Option<String>,
    prefetch_count: Option<u16>,
    max_redeliveries: Option<u32>,
    error_queue_message_ttl_ms: Option<i32>,
    failure_ledger_ttl_secs: Option<u64>,
    connect_max_attempts: Option<u32>,
    connect_backoff_base_ms: Option<u64>,
    connect_backoff_cap_ms: Option<u64>,
    max_retry_count: Option<u32>,
    publish_backoff_base_ms: Option<u64>,
    confirm_timeout_ms: Option<u64>,
    idempotency_backend: Option<String>,
    idempotency_ttl_secs: Option<u64>,
    redis_url: Option<String>,
    processing_unit_ms: Option<u64>,
    producer_message_count: Option<usize>,
    log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSettings {
    pub name: String,
    pub worker_id: String,
    pub service_name: Option<String>,
    pub log_level: String,
    /// Processing time of a LOW severity error
    pub processing_unit: Duration,
    pub producer_message_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RabbitMqSettings {
    uri: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub connect_retry: RetryPolicy,
}

impl RabbitMqSettings {
    /// The AMQP URI to connect to, `AMQP_URI` taking precedence.
    pub fn uri(&self) -> String {
        if let Some(uri) = &self.uri {
            return uri.clone();
        }

        let vhost = match self.vhost.as_str() {
            "/" | "" => "%2f".to_owned(),
            other => other.trim_start_matches('/').replace('/', "%2f"),
        };

        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, vhost
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherSettings {
    pub retry: RetryPolicy,
    pub confirm_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub prefetch_count: u16,
    pub max_redeliveries: u32,
    pub error_queue_message_ttl_ms: Option<i32>,
    /// How long a failed attempt is remembered for a message that does not come back
    pub failure_ledger_ttl: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdempotencyBackend {
    Memory,
    Redis,
}

impl FromStr for IdempotencyBackend {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "in-memory" => Ok(IdempotencyBackend::Memory),
            "redis" => Ok(IdempotencyBackend::Redis),
            other => Err(AmqpError::ConfigError(format!(
                "unknown idempotency backend `{other}`"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencySettings {
    pub backend: IdempotencyBackend,
    pub ttl: Duration,
    pub redis_url: Option<String>,
}

impl IdempotencySettings {
    /// Creates the configured store. The in-memory store gets a periodic sweeper.
    pub async fn build_store(&self) -> Result<Arc<dyn IdempotencyStore>, AmqpError> {
        match self.backend {
            IdempotencyBackend::Memory => {
                let store = Arc::new(InMemoryIdempotencyStore::new(self.ttl));
                store.clone().spawn_sweeper(DEFAULT_SWEEP_INTERVAL);
                info!("using in-memory idempotency store");
                Ok(store)
            }
            IdempotencyBackend::Redis => {
                let Some(url) = &self.redis_url else {
                    return Err(AmqpError::ConfigError(
                        "REDIS_URL is required by the redis idempotency backend".to_owned(),
                    ));
                };
                let store = RedisIdempotencyStore::connect(url, self.ttl).await?;
                info!("using redis idempotency store");
                Ok(Arc::new(store))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub app: AppSettings,
    pub rabbitmq: RabbitMqSettings,
    pub publisher: PublisherSettings,
    pub consumer: ConsumerSettings,
    pub idempotency: IdempotencySettings,
}

impl Settings {
    /// Reads the settings from the process environment.
    pub fn load() -> Result<Settings, AmqpError> {
        let env = Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize::<EnvSettings>())
            .map_err(|err| {
                error!(error = err.to_string(), "failure to read configuration");
                AmqpError::ConfigError(err.to_string())
            })?;

        Self::from_env(env)
    }

    fn from_env(env: EnvSettings) -> Result<Settings, AmqpError> {
        let prefetch_count = env.prefetch_count.unwrap_or(1);
        if prefetch_count == 0 {
            return Err(AmqpError::ConfigError(
                "PREFETCH_COUNT must be at least 1".to_owned(),
            ));
        }

        let max_retry_count = env.max_retry_count.unwrap_or(5);
        if max_retry_count == 0 {
            return Err(AmqpError::ConfigError(
                "MAX_RETRY_COUNT must be at least 1".to_owned(),
            ));
        }

        let backend = match env.idempotency_backend.as_deref() {
            Some(value) => value.parse()?,
            None => IdempotencyBackend::Memory,
        };

        let millis = |value: Option<u64>, default: u64| Duration::from_millis(value.unwrap_or(default));

        Ok(Settings {
            app: AppSettings {
                name: env.app_name.unwrap_or_else(|| "rabbitmq-logs".to_owned()),
                worker_id: env
                    .worker_id
                    .unwrap_or_else(|| std::process::id().to_string()),
                service_name: env.service_name,
                log_level: env.log_level.unwrap_or_else(|| "info".to_owned()),
                processing_unit: millis(env.processing_unit_ms, 1000),
                producer_message_count: env.producer_message_count.unwrap_or(10),
            },
            rabbitmq: RabbitMqSettings {
                uri: env.amqp_uri,
                host: env.rabbitmq_host.unwrap_or_else(|| "localhost".to_owned()),
                port: env.rabbitmq_port.unwrap_or(5672),
                user: env.rabbitmq_user.unwrap_or_else(|| "guest".to_owned()),
                password: env.rabbitmq_password.unwrap_or_else(|| "guest".to_owned()),
                vhost: env.rabbitmq_vhost.unwrap_or_else(|| "/".to_owned()),
                connect_retry: RetryPolicy::new(
                    env.connect_max_attempts.unwrap_or(5),
                    Backoff::Exponential {
                        base: millis(env.connect_backoff_base_ms, 1000),
                        cap: millis(env.connect_backoff_cap_ms, 30_000),
                    },
                ),
            },
            publisher: PublisherSettings {
                retry: RetryPolicy::new(
                    max_retry_count,
                    Backoff::Linear {
                        base: millis(env.publish_backoff_base_ms, 500),
                    },
                ),
                confirm_timeout: env
                    .confirm_timeout_ms
                    .map_or(DEFAULT_CONFIRM_TIMEOUT, Duration::from_millis),
            },
            consumer: ConsumerSettings {
                prefetch_count,
                max_redeliveries: env
                    .max_redeliveries
                    .unwrap_or(DEFAULT_MAX_REDELIVERIES)
                    .max(1),
                error_queue_message_ttl_ms: env.error_queue_message_ttl_ms,
                failure_ledger_ttl: env
                    .failure_ledger_ttl_secs
                    .map_or(DEFAULT_LEDGER_TTL, Duration::from_secs),
            },
            idempotency: IdempotencySettings {
                backend,
                ttl: Duration::from_secs(env.idempotency_ttl_secs.unwrap_or(3600)),
                redis_url: env.redis_url,
            },
        })
    }
}
