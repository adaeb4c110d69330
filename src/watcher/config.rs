use std::time::Duration;

use crate::hostname::{HostnameMethod, DEFAULT_HOSTNAME_TIMEOUT};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_METRICS_BUFFER_LIMIT: usize = 10_000;
pub const DEFAULT_UNIT_SUFFIX: &str = ".service";

/// Settings owned by a single `Watcher`; frozen once a loop starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    pub watch_list: Vec<String>,
    pub poll_interval: Duration,
    pub metrics_buffer_limit: usize,
    pub hostname_method: HostnameMethod,
    pub hostname_timeout: Duration,
}

impl WatchConfig {
    pub fn new<I, S>(units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            watch_list: normalize_watch_list(units),
            poll_interval: DEFAULT_POLL_INTERVAL,
            metrics_buffer_limit: DEFAULT_METRICS_BUFFER_LIMIT,
            hostname_method: HostnameMethod::default(),
            hostname_timeout: DEFAULT_HOSTNAME_TIMEOUT,
        }
    }

    pub fn is_watched(&self, unit: &str) -> bool {
        self.watch_list.iter().any(|watched| watched == unit)
    }
}

/// Appends `.service` to names without a type suffix and drops duplicates,
/// keeping the first occurrence. Blank entries are ignored.
pub fn normalize_watch_list<I, S>(units: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut normalized: Vec<String> = Vec::new();
    for unit in units {
        let unit = unit.as_ref().trim();
        if unit.is_empty() {
            continue;
        }

        let unit = if unit.contains('.') {
            unit.to_string()
        } else {
            format!("{unit}{DEFAULT_UNIT_SUFFIX}")
        };
        if !normalized.contains(&unit) {
            normalized.push(unit);
        }
    }
    normalized
}
