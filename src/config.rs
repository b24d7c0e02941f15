//! Process configuration.
//!
//! Loaded once from environment variables at startup. Everything an operator edits
//! at runtime (credential, database descriptor) lives in [`crate::settings`] instead.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::agent::BackoffPolicy;

/// Fallback platform base URL used when the settings file does not override it.
pub const DEFAULT_AGENT_SERVICE_URL: &str = "https://tu-api-gateway.com/api/agent-service";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to resolve working directory: {0}")]
    WorkingDir(#[from] std::io::Error),
}

/// Runtime configuration for the agent process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding `.sitelink/settings.json`
    pub working_dir: PathBuf,
    /// Control API bind host
    pub host: String,
    /// Control API bind port
    pub port: u16,
    /// Platform base URL used when settings carry none
    pub agent_service_url: String,
    /// Bounded wait for a single `/listen` request
    pub poll_timeout: Duration,
    /// Bounded wait for a single `/submit-result` request
    pub submit_timeout: Duration,
    /// Delay applied after a failed poll
    pub backoff: BackoffPolicy,
    /// Optional bearer token guarding the control API
    pub control_token: Option<String>,
}

impl Config {
    /// Build the configuration from environment variables.
    ///
    /// - `WORKING_DIR` (default: current directory)
    /// - `HOST` / `PORT` (default: `127.0.0.1` / `7331`)
    /// - `AGENT_SERVICE_URL`
    /// - `POLL_TIMEOUT_SECS` (default: 60)
    /// - `SUBMIT_TIMEOUT_SECS` (default: 30)
    /// - `RETRY_BACKOFF_SECS` (default: 15)
    /// - `RETRY_BACKOFF_MAX_SECS` (switches to exponential backoff when set)
    /// - `CONTROL_API_TOKEN`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let working_dir = match var("WORKING_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir()?,
        };

        let agent_service_url =
            var("AGENT_SERVICE_URL").unwrap_or_else(|| DEFAULT_AGENT_SERVICE_URL.to_string());
        validate_base_url("AGENT_SERVICE_URL", &agent_service_url)?;

        let interval = Duration::from_secs(parse_num(
            "RETRY_BACKOFF_SECS",
            var("RETRY_BACKOFF_SECS"),
            15,
        )?);
        let backoff = match var("RETRY_BACKOFF_MAX_SECS") {
            Some(raw) => BackoffPolicy::Exponential {
                initial: interval,
                max: Duration::from_secs(parse_num("RETRY_BACKOFF_MAX_SECS", Some(raw), 0)?),
            },
            None => BackoffPolicy::Fixed(interval),
        };

        Ok(Self {
            working_dir,
            host: var("HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_num("PORT", var("PORT"), 7331)?,
            agent_service_url,
            poll_timeout: Duration::from_secs(parse_num(
                "POLL_TIMEOUT_SECS",
                var("POLL_TIMEOUT_SECS"),
                60,
            )?),
            submit_timeout: Duration::from_secs(parse_num(
                "SUBMIT_TIMEOUT_SECS",
                var("SUBMIT_TIMEOUT_SECS"),
                30,
            )?),
            backoff,
            control_token: var("CONTROL_API_TOKEN"),
        })
    }

    /// Path of the persisted settings file.
    pub fn settings_path(&self) -> PathBuf {
        self.working_dir.join(".sitelink").join("settings.json")
    }
}

/// Reject base URLs that reqwest could never reach.
pub fn validate_base_url(name: &'static str, raw: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw).map_err(|e| ConfigError::InvalidValue {
        name,
        value: raw.to_string(),
        reason: e.to_string(),
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::InvalidValue {
            name,
            value: raw.to_string(),
            reason: format!("unsupported scheme '{}'", other),
        }),
    }
}

fn parse_num<T>(name: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(value) => value.parse::<T>().map_err(|e| ConfigError::InvalidValue {
            name,
            value: value.clone(),
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("WORKING_DIR", "/tmp/site")])).unwrap();
        assert_eq!(config.working_dir, PathBuf::from("/tmp/site"));
        assert_eq!(config.port, 7331);
        assert_eq!(config.agent_service_url, DEFAULT_AGENT_SERVICE_URL);
        assert_eq!(config.poll_timeout, Duration::from_secs(60));
        assert_eq!(config.backoff, BackoffPolicy::Fixed(Duration::from_secs(15)));
        assert!(config.control_token.is_none());
        assert_eq!(
            config.settings_path(),
            PathBuf::from("/tmp/site/.sitelink/settings.json")
        );
    }

    #[test]
    fn test_exponential_backoff_from_env() {
        let config = Config::from_lookup(lookup(&[
            ("WORKING_DIR", "/tmp"),
            ("RETRY_BACKOFF_SECS", "5"),
            ("RETRY_BACKOFF_MAX_SECS", "120"),
        ]))
        .unwrap();
        assert_eq!(
            config.backoff,
            BackoffPolicy::Exponential {
                initial: Duration::from_secs(5),
                max: Duration::from_secs(120),
            }
        );
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = Config::from_lookup(lookup(&[("WORKING_DIR", "/tmp"), ("PORT", "http")]))
            .unwrap_err();
        assert!(err.to_string().contains("PORT"));

        let err = Config::from_lookup(lookup(&[
            ("WORKING_DIR", "/tmp"),
            ("AGENT_SERVICE_URL", "ftp://example.com"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }
}
