use std::env;
use std::time::Duration;

use crate::adapters::ApiEndpoints;
use crate::error::{EngineError, Result};
use crate::models::message::IdentityShape;

/// Runtime settings, read from the environment (after `.env` is loaded).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub bind_addr: String,
    /// Public origin the platforms call back, e.g. `https://bots.example.com`.
    pub public_base_url: Option<String>,
    pub http_timeout: Duration,
    pub cache_ttl_secs: u64,
    pub stream_key: String,
    pub consumer_group: String,
    pub consumer_name: String,
    /// Overrides every adapter's identity shape when set.
    pub chat_identity: Option<IdentityShape>,
    pub endpoints: ApiEndpoints,
    pub messenger_app_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            redis_url: "redis://localhost:6379".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            public_base_url: None,
            http_timeout: Duration::from_secs(10),
            cache_ttl_secs: 300,
            stream_key: "chatflow:queue:incoming".to_string(),
            consumer_group: "chatflow_core_group".to_string(),
            consumer_name: "core_worker_1".to_string(),
            chat_identity: None,
            endpoints: ApiEndpoints::default(),
            messenger_app_secret: None,
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn number<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EngineError::config(format!("{key} must be a number, got {raw:?}"))),
        None => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let optional = |key: &str| non_blank(lookup(key));
        let defaults = Config::default();

        let database_url = optional("DATABASE_URL")
            .ok_or_else(|| EngineError::config("DATABASE_URL must be set"))?;
        let chat_identity = optional("CHAT_IDENTITY")
            .map(|raw| raw.parse::<IdentityShape>())
            .transpose()?;

        let endpoints = ApiEndpoints {
            telegram: optional("TELEGRAM_API_BASE").unwrap_or(defaults.endpoints.telegram),
            kik: optional("KIK_API_BASE").unwrap_or(defaults.endpoints.kik),
            messenger: optional("MESSENGER_API_BASE").unwrap_or(defaults.endpoints.messenger),
        };

        Ok(Self {
            database_url,
            redis_url: optional("REDIS_URL").unwrap_or(defaults.redis_url),
            bind_addr: optional("BIND_ADDR").unwrap_or(defaults.bind_addr),
            public_base_url: optional("PUBLIC_BASE_URL").map(|u| u.trim_end_matches('/').to_string()),
            http_timeout: Duration::from_secs(number(
                "HTTP_TIMEOUT_SECS",
                optional("HTTP_TIMEOUT_SECS"),
                defaults.http_timeout.as_secs(),
            )?),
            cache_ttl_secs: number("CACHE_TTL_SECS", optional("CACHE_TTL_SECS"), defaults.cache_ttl_secs)?,
            stream_key: optional("STREAM_KEY").unwrap_or(defaults.stream_key),
            consumer_group: optional("CONSUMER_GROUP").unwrap_or(defaults.consumer_group),
            consumer_name: optional("CONSUMER_NAME").unwrap_or(defaults.consumer_name),
            chat_identity,
            endpoints,
            messenger_app_secret: optional("MESSENGER_APP_SECRET"),
        })
    }
}
