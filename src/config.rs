use std::{env, time::Duration};

use thiserror::Error;

use crate::{
    hostname::HostnameMethod,
    watcher::config::{normalize_watch_list, DEFAULT_METRICS_BUFFER_LIMIT, DEFAULT_POLL_INTERVAL},
};

pub const UNITS_VAR: &str = "SYSD_WATCH_UNITS";
pub const POLL_INTERVAL_VAR: &str = "SYSD_WATCH_POLL_INTERVAL";
pub const BUFFER_LIMIT_VAR: &str = "SYSD_WATCH_BUFFER_LIMIT";
pub const HOSTNAME_METHOD_VAR: &str = "SYSD_WATCH_HOSTNAME_METHOD";
pub const CALL_TIMEOUT_VAR: &str = "SYSD_WATCH_CALL_TIMEOUT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub units: Vec<String>,
    pub poll_interval: Duration,
    pub metrics_buffer_limit: usize,
    pub hostname_method: HostnameMethod,
    pub call_timeout: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("SYSD_WATCH_POLL_INTERVAL must be a positive number of seconds")]
    InvalidPollInterval,
    #[error("SYSD_WATCH_BUFFER_LIMIT must be a positive integer")]
    InvalidBufferLimit,
    #[error("SYSD_WATCH_HOSTNAME_METHOD must be one of OS, FQDN, RFQDN, CMD, ENV")]
    InvalidHostnameMethod,
    #[error("SYSD_WATCH_CALL_TIMEOUT must be a positive number of seconds")]
    InvalidCallTimeout,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            units: Vec::new(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            metrics_buffer_limit: DEFAULT_METRICS_BUFFER_LIMIT,
            hostname_method: HostnameMethod::default(),
            call_timeout: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let units = non_empty_var(UNITS_VAR)
            .map(|value| normalize_watch_list(value.split(',')))
            .unwrap_or_default();
        let poll_interval = non_empty_var(POLL_INTERVAL_VAR)
            .map(|value| parse_seconds(&value).ok_or(ConfigError::InvalidPollInterval))
            .transpose()?
            .unwrap_or(defaults.poll_interval);
        let metrics_buffer_limit = non_empty_var(BUFFER_LIMIT_VAR)
            .map(|value| {
                value
                    .parse::<usize>()
                    .ok()
                    .filter(|limit| *limit > 0)
                    .ok_or(ConfigError::InvalidBufferLimit)
            })
            .transpose()?
            .unwrap_or(defaults.metrics_buffer_limit);
        let hostname_method = non_empty_var(HOSTNAME_METHOD_VAR)
            .map(|value| {
                value
                    .parse::<HostnameMethod>()
                    .map_err(|_| ConfigError::InvalidHostnameMethod)
            })
            .transpose()?
            .unwrap_or(defaults.hostname_method);
        let call_timeout = non_empty_var(CALL_TIMEOUT_VAR)
            .map(|value| parse_seconds(&value).ok_or(ConfigError::InvalidCallTimeout))
            .transpose()?;

        Ok(Self {
            units,
            poll_interval,
            metrics_buffer_limit,
            hostname_method,
            call_timeout,
        })
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_seconds(value: &str) -> Option<Duration> {
    value
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
}
