// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Client Configuration
//!
//! Broker connection settings and the knobs of the retry and supervision
//! loops. Values come from `Default`, from a deserialised document, or from
//! `RABBITMQ_*` environment variables (a `.env` file is honoured).

use crate::backoff::RetryPolicy;
use serde::Deserialize;
use std::{env, str::FromStr, time::Duration};
use thiserror::Error;

/// Prefix of the environment variables read by [`RabbitMQConfigs::from_env`]
pub const ENV_PREFIX: &str = "RABBITMQ_";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}")]
    InvalidValue { key: String, value: String },
}

/// Connection and supervision settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    /// Connection name shown in the broker management UI
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub heartbeat_secs: u16,
    /// Bound on a single connect attempt
    pub connection_timeout_ms: u64,
    /// Connect retries for consumers; publishers always use 0
    pub max_retry_connect: u32,
    /// How long a caller waits for another caller's in-flight connect
    pub connect_wait_ms: u64,
    pub backoff_step_ms: u64,
    pub backoff_jitter_ms: u64,
    pub backoff_cap_ms: u64,
    /// Run the dead-letter worker in its own task; when false the host calls
    /// `consume_dead_letter` itself
    pub isolate_dead_letter: bool,
    pub monitor_interval_ms: u64,
    pub dead_letter_retry_delay_ms: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            app_name: "rabbitmq-resilience".to_owned(),
            host: "127.0.0.1".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            heartbeat_secs: 60,
            connection_timeout_ms: 3_000,
            max_retry_connect: 5,
            connect_wait_ms: 5_000,
            backoff_step_ms: 5_000,
            backoff_jitter_ms: 5_000,
            backoff_cap_ms: 60_000,
            isolate_dead_letter: true,
            monitor_interval_ms: 1_000,
            dead_letter_retry_delay_ms: 3_000,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl RabbitMQConfigs {
    /// Loads `.env` if present, then overrides defaults with `RABBITMQ_*`
    /// variables (`RABBITMQ_HOST`, `RABBITMQ_PORT`, `RABBITMQ_MAX_RETRY_CONNECT`, ...).
    pub fn from_env() -> Result<RabbitMQConfigs, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<RabbitMQConfigs, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = RabbitMQConfigs::default();
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("APP_NAME") {
            cfg.app_name = v;
        }
        if let Some(v) = var("HOST") {
            cfg.host = v;
        }
        if let Some(v) = var("USER") {
            cfg.user = v;
        }
        if let Some(v) = var("PASSWORD") {
            cfg.password = v;
        }
        if let Some(v) = var("VHOST") {
            cfg.vhost = v;
        }
        parse_into(&var, "PORT", &mut cfg.port)?;
        parse_into(&var, "HEARTBEAT", &mut cfg.heartbeat_secs)?;
        parse_into(&var, "CONNECTION_TIMEOUT_MS", &mut cfg.connection_timeout_ms)?;
        parse_into(&var, "MAX_RETRY_CONNECT", &mut cfg.max_retry_connect)?;
        parse_into(&var, "CONNECT_WAIT_MS", &mut cfg.connect_wait_ms)?;
        parse_into(&var, "BACKOFF_STEP_MS", &mut cfg.backoff_step_ms)?;
        parse_into(&var, "BACKOFF_JITTER_MS", &mut cfg.backoff_jitter_ms)?;
        parse_into(&var, "BACKOFF_CAP_MS", &mut cfg.backoff_cap_ms)?;
        parse_into(&var, "ISOLATE_DEAD_LETTER", &mut cfg.isolate_dead_letter)?;
        parse_into(&var, "MONITOR_INTERVAL_MS", &mut cfg.monitor_interval_ms)?;
        parse_into(
            &var,
            "DEAD_LETTER_RETRY_DELAY_MS",
            &mut cfg.dead_letter_retry_delay_ms,
        )?;
        parse_into(&var, "SHUTDOWN_GRACE_MS", &mut cfg.shutdown_grace_ms)?;

        Ok(cfg)
    }

    /// AMQP URI with heartbeat and connect timeout query parameters.
    pub fn uri(&self) -> String {
        let vhost = if self.vhost == "/" {
            "%2f".to_owned()
        } else {
            self.vhost.trim_start_matches('/').to_owned()
        };

        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}&connection_timeout={}",
            self.user,
            self.password,
            self.host,
            self.port,
            vhost,
            self.heartbeat_secs,
            self.connection_timeout_ms
        )
    }

    /// Retry policy used by consumers.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retry_connect)
            .step(Duration::from_millis(self.backoff_step_ms))
            .jitter(Duration::from_millis(self.backoff_jitter_ms))
            .cap(Duration::from_millis(self.backoff_cap_ms))
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn connect_wait(&self) -> Duration {
        Duration::from_millis(self.connect_wait_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms.max(1))
    }

    pub fn dead_letter_retry_delay(&self) -> Duration {
        Duration::from_millis(self.dead_letter_retry_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn parse_into<T, F>(var: &F, name: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = var(name) else {
        return Ok(());
    };

    match value.trim().parse::<T>() {
        Ok(parsed) => {
            *target = parsed;
            Ok(())
        }
        Err(_) => Err(ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{name}"),
            value,
        }),
    }
}
