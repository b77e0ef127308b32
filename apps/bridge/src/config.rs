use std::{
    env,
    net::{AddrParseError, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use levias_token::DEFAULT_TOKEN_PATH;
use thiserror::Error;

/// Largest server-side watch lifetime the API server honours without
/// closing the stream early.
const MAX_WATCH_TIMEOUT_SECONDS: u32 = 294;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadinessStrategy {
    Watch,
    Poll,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    /// `None` means the issuer is read from our own service credential at startup.
    pub issuer: Option<String>,
    pub audiences: Vec<String>,
    pub jwks_url: Option<String>,
    pub jwks_cache_ttl: Duration,
    pub service_token_path: PathBuf,
    pub readiness_strategy: ReadinessStrategy,
    pub readiness_timeout: Duration,
    pub watch_timeout_seconds: u32,
    pub poll_interval: Duration,
    pub exec_session_ttl: Duration,
    pub placeholder_containers: Vec<String>,
    pub log_format: LogFormat,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid LEVIAS_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid LEVIAS_JWKS_CACHE_TTL_SECONDS: {0}")]
    InvalidJwksCacheTtl(String),
    #[error("invalid LEVIAS_READINESS_STRATEGY: {0}")]
    InvalidReadinessStrategy(String),
    #[error("invalid LEVIAS_READINESS_TIMEOUT_SECONDS: {0}")]
    InvalidReadinessTimeout(String),
    #[error("invalid LEVIAS_WATCH_TIMEOUT_SECONDS: {0}")]
    InvalidWatchTimeout(String),
    #[error("invalid LEVIAS_POLL_INTERVAL_MS: {0}")]
    InvalidPollInterval(String),
    #[error("invalid LEVIAS_EXEC_SESSION_TTL_SECONDS: {0}")]
    InvalidExecSessionTtl(String),
    #[error("invalid LEVIAS_LOG_FORMAT: {0}")]
    InvalidLogFormat(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = lookup("LEVIAS_BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()?;
        let service_name =
            lookup("LEVIAS_SERVICE_NAME").unwrap_or_else(|| "levias-bridge".to_string());
        let issuer = non_empty(lookup("LEVIAS_ISSUER"));
        let audiences = lookup("LEVIAS_AUDIENCE")
            .map(|raw| split_list(&raw))
            .unwrap_or_default();
        let jwks_url = non_empty(lookup("LEVIAS_JWKS_URL"));
        let jwks_cache_ttl = Duration::from_secs(
            parse_u64(&lookup, "LEVIAS_JWKS_CACHE_TTL_SECONDS", 300)
                .map_err(ConfigError::InvalidJwksCacheTtl)?,
        );
        let service_token_path = lookup("LEVIAS_SERVICE_TOKEN_PATH")
            .map_or_else(|| PathBuf::from(DEFAULT_TOKEN_PATH), PathBuf::from);
        let readiness_strategy = parse_readiness_strategy(
            lookup("LEVIAS_READINESS_STRATEGY")
                .unwrap_or_else(|| "watch".to_string())
                .as_str(),
        )?;
        let readiness_timeout = Duration::from_secs(
            parse_u64(&lookup, "LEVIAS_READINESS_TIMEOUT_SECONDS", 120)
                .map_err(ConfigError::InvalidReadinessTimeout)?,
        );
        let watch_timeout_seconds = parse_u64(&lookup, "LEVIAS_WATCH_TIMEOUT_SECONDS", 60)
            .map_err(ConfigError::InvalidWatchTimeout)?;
        if watch_timeout_seconds == 0 || watch_timeout_seconds > u64::from(MAX_WATCH_TIMEOUT_SECONDS)
        {
            return Err(ConfigError::InvalidWatchTimeout(format!(
                "must be between 1 and {MAX_WATCH_TIMEOUT_SECONDS}, got {watch_timeout_seconds}"
            )));
        }
        let poll_interval = parse_u64(&lookup, "LEVIAS_POLL_INTERVAL_MS", 1_000)
            .map_err(ConfigError::InvalidPollInterval)?;
        if poll_interval == 0 {
            return Err(ConfigError::InvalidPollInterval(
                "must be greater than zero".to_string(),
            ));
        }
        let exec_session_ttl = Duration::from_secs(
            parse_u64(&lookup, "LEVIAS_EXEC_SESSION_TTL_SECONDS", 3_600)
                .map_err(ConfigError::InvalidExecSessionTtl)?,
        );
        let placeholder_containers = lookup("LEVIAS_PLACEHOLDER_CONTAINERS")
            .map_or_else(
                || vec!["buildx_buildkit_default".to_string()],
                |raw| split_list(&raw),
            );
        let log_format = match lookup("LEVIAS_LOG_FORMAT")
            .unwrap_or_else(|| "text".to_string())
            .trim()
            .to_ascii_lowercase()
            .as_str()
        {
            "text" | "" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => return Err(ConfigError::InvalidLogFormat(other.to_string())),
        };

        Ok(Self {
            service_name,
            bind_addr,
            issuer,
            audiences,
            jwks_url,
            jwks_cache_ttl,
            service_token_path,
            readiness_strategy,
            readiness_timeout,
            watch_timeout_seconds: watch_timeout_seconds as u32,
            poll_interval: Duration::from_millis(poll_interval),
            exec_session_ttl,
            placeholder_containers,
            log_format,
        })
    }

    /// Accepted audiences, falling back to the issuer the way cluster
    /// service-account tokens are minted by default.
    #[must_use]
    pub fn effective_audiences(&self, issuer: &str) -> Vec<String> {
        if self.audiences.is_empty() {
            vec![issuer.to_string()]
        } else {
            self.audiences.clone()
        }
    }
}

fn parse_readiness_strategy(raw: &str) -> Result<ReadinessStrategy, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "watch" => Ok(ReadinessStrategy::Watch),
        "poll" => Ok(ReadinessStrategy::Poll),
        other => Err(ConfigError::InvalidReadinessStrategy(other.to_string())),
    }
}

fn parse_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<u64, String> {
    match lookup(key) {
        Some(raw) => raw.trim().parse::<u64>().map_err(|error| error.to_string()),
        None => Ok(default),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{Config, ConfigError, LogFormat, ReadinessStrategy};

    fn config_from(values: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let values: HashMap<String, String> = values
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        Config::from_lookup(|key| values.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let config = config_from(&[]).expect("default config");
        assert_eq!(config.bind_addr.to_string(), "0.0.0.0:8080");
        assert_eq!(config.service_name, "levias-bridge");
        assert!(config.issuer.is_none());
        assert_eq!(config.readiness_strategy, ReadinessStrategy::Watch);
        assert_eq!(config.watch_timeout_seconds, 60);
        assert_eq!(config.poll_interval.as_millis(), 1_000);
        assert_eq!(config.exec_session_ttl.as_secs(), 3_600);
        assert_eq!(config.placeholder_containers, vec!["buildx_buildkit_default"]);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(
            config.effective_audiences("https://kubernetes.default.svc"),
            vec!["https://kubernetes.default.svc"]
        );
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("LEVIAS_ISSUER", " https://issuer.example "),
            ("LEVIAS_AUDIENCE", "levias, api"),
            ("LEVIAS_READINESS_STRATEGY", "POLL"),
            ("LEVIAS_POLL_INTERVAL_MS", "250"),
            ("LEVIAS_PLACEHOLDER_CONTAINERS", "a,,b"),
            ("LEVIAS_LOG_FORMAT", "json"),
        ])
        .expect("config");
        assert_eq!(config.issuer.as_deref(), Some("https://issuer.example"));
        assert_eq!(config.audiences, vec!["levias", "api"]);
        assert_eq!(config.readiness_strategy, ReadinessStrategy::Poll);
        assert_eq!(config.poll_interval.as_millis(), 250);
        assert_eq!(config.placeholder_containers, vec!["a", "b"]);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.effective_audiences("ignored"), vec!["levias", "api"]);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            config_from(&[("LEVIAS_BIND_ADDR", "not-an-addr")]),
            Err(ConfigError::BindAddrParse(_))
        ));
        assert!(matches!(
            config_from(&[("LEVIAS_READINESS_STRATEGY", "spin")]),
            Err(ConfigError::InvalidReadinessStrategy(_))
        ));
        assert!(matches!(
            config_from(&[("LEVIAS_WATCH_TIMEOUT_SECONDS", "600")]),
            Err(ConfigError::InvalidWatchTimeout(_))
        ));
        assert!(matches!(
            config_from(&[("LEVIAS_POLL_INTERVAL_MS", "0")]),
            Err(ConfigError::InvalidPollInterval(_))
        ));
        assert!(matches!(
            config_from(&[("LEVIAS_LOG_FORMAT", "xml")]),
            Err(ConfigError::InvalidLogFormat(_))
        ));
    }
}
