use std::sync::Arc;

pub mod adapter;
pub mod config;
pub mod errors;
pub mod hostname;
pub mod logging;
pub mod pattern;
pub mod shell;
pub mod systemd_client;
pub mod value;
pub mod watcher;

pub use adapter::{SystemdAdapter, UnitProvider};
pub use errors::WatchError;
pub use hostname::HostnameMethod;
pub use systemd_client::{DbusSystemdClient, UnitStatus};
pub use value::{PropertyMap, PropertyValue};
pub use watcher::{UnitEvent, WatchHandle, WatchMode, Watcher};

use config::Config;

/// Wires a watcher for the local system bus from process configuration.
pub fn build_watcher(config: &Config) -> Watcher {
    let mut client = DbusSystemdClient::new();
    if let Some(timeout) = config.call_timeout {
        client = client.with_call_timeout(timeout);
    }
    build_watcher_with(config, Arc::new(SystemdAdapter::new(client)))
}

pub fn build_watcher_with(config: &Config, provider: Arc<dyn UnitProvider>) -> Watcher {
    Watcher::new(&config.units, provider)
        .with_poll_interval(config.poll_interval)
        .with_metrics_buffer_limit(config.metrics_buffer_limit)
        .with_hostname_method(config.hostname_method)
}
