use secrecy::SecretString;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::Level;

use synapse_core::{EnterpriseContext, SessionOptions, UserRole, ids};

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
    #[error("Invalid session options: {0}")]
    Session(#[from] synapse_core::ConfigError),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub service_url: String,
    pub api_key: SecretString,
    pub user_id: String,
    pub user_role: UserRole,
    pub company_id: Option<String>,
    pub company_name: Option<String>,
    pub permissions: BTreeSet<String>,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub error_retry_delay: Option<Duration>,
    pub sample_rate: u32,
    pub log_level: Level,
}

fn required(name: &str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(name.to_string())),
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match optional(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        None => Ok(default),
    }
}

fn flag(name: &str, default: bool) -> Result<bool, ConfigError> {
    match optional(name) {
        Some(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue(
                name.to_string(),
                format!("'{}' is not a boolean", raw),
            )),
        },
        None => Ok(default),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let service_url = required("SYNAPSE_URL")?;
        let api_key = SecretString::from(required("SYNAPSE_API_KEY")?);

        let user_id = optional("SYNAPSE_USER_ID").unwrap_or_else(|| "console-user".to_string());
        let user_role = parsed("SYNAPSE_USER_ROLE", UserRole::Employee)?;
        let company_id = optional("SYNAPSE_COMPANY_ID");
        let company_name = optional("SYNAPSE_COMPANY_NAME");
        let permissions = optional("SYNAPSE_PERMISSIONS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let auto_reconnect = flag("SYNAPSE_AUTO_RECONNECT", true)?;
        let max_reconnect_attempts = parsed("SYNAPSE_MAX_RECONNECT_ATTEMPTS", 5u32)?;
        let reconnect_delay =
            Duration::from_millis(parsed("SYNAPSE_RECONNECT_DELAY_MS", 2000u64)?);
        let error_retry_delay = optional("SYNAPSE_ERROR_RETRY_MS")
            .map(|raw| {
                raw.trim().parse::<u64>().map(Duration::from_millis).map_err(|_| {
                    ConfigError::InvalidValue(
                        "SYNAPSE_ERROR_RETRY_MS".to_string(),
                        format!("'{}' is not a number of milliseconds", raw),
                    )
                })
            })
            .transpose()?;
        let sample_rate = parsed("SYNAPSE_SAMPLE_RATE", 16000u32)?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            service_url,
            api_key,
            user_id,
            user_role,
            company_id,
            company_name,
            permissions,
            auto_reconnect,
            max_reconnect_attempts,
            reconnect_delay,
            error_retry_delay,
            sample_rate,
            log_level,
        })
    }

    /// Builds validated session options with a fresh session id.
    pub fn session_options(&self) -> Result<SessionOptions, ConfigError> {
        let mut context =
            EnterpriseContext::new(self.user_id.clone(), self.user_role, ids::session_id());
        context.company_id = self.company_id.clone();
        context.company_name = self.company_name.clone();
        context.permissions = self.permissions.clone();

        let mut options = SessionOptions::new(self.service_url.clone(), self.api_key.clone(), context);
        options.auto_reconnect = self.auto_reconnect;
        options.max_reconnect_attempts = self.max_reconnect_attempts;
        options.reconnect_delay = self.reconnect_delay;
        options.error_retry_delay = self.error_retry_delay;
        options.audio.sample_rate = self.sample_rate;
        options.validate()?;
        Ok(options)
    }
}
