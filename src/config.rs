use std::{env, str::FromStr};

use crate::{error::EngineError, policy::Policy};

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    /// Agent admin API base URL. `None` runs control calls in simulated mode.
    pub agent_admin_url: Option<String>,
    pub agent_admin_api_key: Option<String>,
    pub agent_request_timeout_secs: u64,
    pub webhook_api_key: String,
    pub webhook_api_key_header: String,
    pub webhook_workers: usize,
    pub webhook_queue_depth: usize,
    pub control_max_retries: u32,
    pub control_retry_base_ms: u64,
    pub control_retry_max_ms: u64,
    pub admin_user: String,
    pub admin_key: String,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub jwt_ttl_minutes: i64,
    pub policy: Policy,
}

impl Config {
    pub fn from_env() -> Result<Self, EngineError> {
        let config = Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:5000".to_string()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/endorser.db".to_string()),
            agent_admin_url: env::var("AGENT_ADMIN_URL")
                .ok()
                .map(|v| v.trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty()),
            agent_admin_api_key: env::var("AGENT_ADMIN_API_KEY").ok(),
            agent_request_timeout_secs: parsed("AGENT_REQUEST_TIMEOUT_SECS", 10),
            webhook_api_key: env::var("WEBHOOK_API_KEY").unwrap_or_default(),
            webhook_api_key_header: env::var("WEBHOOK_API_KEY_HEADER")
                .unwrap_or_else(|_| "x-api-key".to_string())
                .to_ascii_lowercase(),
            webhook_workers: parsed("WEBHOOK_WORKERS", 16),
            webhook_queue_depth: parsed("WEBHOOK_QUEUE_DEPTH", 1024),
            control_max_retries: parsed("CONTROL_MAX_RETRIES", 4),
            control_retry_base_ms: parsed("CONTROL_RETRY_BASE_MS", 250),
            control_retry_max_ms: parsed("CONTROL_RETRY_MAX_MS", 5_000),
            admin_user: env::var("ENDORSER_API_ADMIN_USER").unwrap_or_else(|_| "endorser".to_string()),
            admin_key: env::var("ENDORSER_API_ADMIN_KEY").unwrap_or_default(),
            jwt_secret: env::var("JWT_SECRET").unwrap_or_default(),
            jwt_issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "endorser-engine".to_string()),
            jwt_audience: env::var("JWT_AUDIENCE").unwrap_or_else(|_| "endorser-review-api".to_string()),
            jwt_ttl_minutes: parsed("JWT_ACCESS_TOKEN_EXPIRE_MINUTES", 300),
            policy: Policy::from_env()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.webhook_api_key.trim().is_empty() {
            return Err(EngineError::Configuration(
                "WEBHOOK_API_KEY must be set".to_string(),
            ));
        }
        if self.jwt_secret.len() < 16 {
            return Err(EngineError::Configuration(
                "JWT_SECRET must be at least 16 characters".to_string(),
            ));
        }
        if self.admin_key.trim().is_empty() {
            return Err(EngineError::Configuration(
                "ENDORSER_API_ADMIN_KEY must be set".to_string(),
            ));
        }
        if self.webhook_workers == 0 || self.webhook_queue_depth == 0 {
            return Err(EngineError::Configuration(
                "WEBHOOK_WORKERS and WEBHOOK_QUEUE_DEPTH must be positive".to_string(),
            ));
        }
        if self.control_max_retries == 0 {
            return Err(EngineError::Configuration(
                "CONTROL_MAX_RETRIES must be at least 1".to_string(),
            ));
        }
        self.policy.validate()
    }
}

fn parsed<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
