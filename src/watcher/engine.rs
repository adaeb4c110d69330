use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    adapter::{SystemdAdapter, UnitProvider, WATCHABLE_STATES},
    errors::WatchError,
    hostname::{HostnameMethod, HostnameResolver, StrategyResolver, FALLBACK_HOSTNAME},
    systemd_client::DbusSystemdClient,
    watcher::{config::WatchConfig, event::UnitEvent},
};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Poll,
    Subscribe,
}

/// Output side of a running watch loop.
///
/// Both receivers yield `None` once the loop has ended, whether it was
/// cancelled or stopped on a configuration error.
#[derive(Debug)]
pub struct WatchHandle {
    pub events: mpsc::Receiver<UnitEvent>,
    pub errors: mpsc::Receiver<WatchError>,
    pub task: JoinHandle<()>,
}

pub struct Watcher {
    config: WatchConfig,
    provider: Arc<dyn UnitProvider>,
    resolver: Option<Arc<dyn HostnameResolver>>,
}

impl Watcher {
    pub fn new<I, S>(units: I, provider: Arc<dyn UnitProvider>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            config: WatchConfig::new(units),
            provider,
            resolver: None,
        }
    }

    /// Watches units on the local systemd instance over the system bus.
    pub fn system<I, S>(units: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(
            units,
            Arc::new(SystemdAdapter::new(DbusSystemdClient::new())),
        )
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    /// Capacity of each output channel; producers wait once it is full.
    pub fn with_metrics_buffer_limit(mut self, limit: usize) -> Self {
        self.config.metrics_buffer_limit = limit.max(1);
        self
    }

    pub fn with_hostname_method(mut self, method: HostnameMethod) -> Self {
        self.config.hostname_method = method;
        self
    }

    pub fn with_hostname_timeout(mut self, timeout: Duration) -> Self {
        self.config.hostname_timeout = timeout;
        self
    }

    /// Replaces the strategy-based resolver built from the hostname settings.
    pub fn with_hostname_resolver(mut self, resolver: Arc<dyn HostnameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub fn poll(self, cancel: CancellationToken) -> WatchHandle {
        self.start(WatchMode::Poll, cancel)
    }

    pub fn subscribe(self, cancel: CancellationToken) -> WatchHandle {
        self.start(WatchMode::Subscribe, cancel)
    }

    pub fn start(self, mode: WatchMode, cancel: CancellationToken) -> WatchHandle {
        let capacity = self.config.metrics_buffer_limit;
        let (event_tx, events) = mpsc::channel(capacity);
        let (error_tx, errors) = mpsc::channel(capacity);

        let resolver = self.resolver.unwrap_or_else(|| {
            Arc::new(StrategyResolver::new(
                self.config.hostname_method,
                self.config.hostname_timeout,
            ))
        });
        let watch_loop = WatchLoop {
            config: self.config,
            provider: self.provider,
            resolver,
            events: event_tx,
            errors: error_tx,
            cancel,
        };
        let task = tokio::spawn(watch_loop.run(mode));

        WatchHandle {
            events,
            errors,
            task,
        }
    }
}

struct WatchLoop {
    config: WatchConfig,
    provider: Arc<dyn UnitProvider>,
    resolver: Arc<dyn HostnameResolver>,
    events: mpsc::Sender<UnitEvent>,
    errors: mpsc::Sender<WatchError>,
    cancel: CancellationToken,
}

impl WatchLoop {
    async fn run(self, mode: WatchMode) {
        info!(
            mode = ?mode,
            units = ?self.config.watch_list,
            interval_ms = self.config.poll_interval.as_millis(),
            "watch loop starting"
        );

        match self.cancellable(self.validate_watch_list()).await {
            None => return,
            Some(Err(err)) => {
                warn!(error = %err, "watch list rejected");
                self.report(err).await;
                return;
            }
            Some(Ok(())) => {}
        }

        match mode {
            WatchMode::Poll => self.poll().await,
            WatchMode::Subscribe => self.subscribe().await,
        }
        info!(mode = ?mode, "watch loop stopped");
    }

    async fn validate_watch_list(&self) -> Result<(), WatchError> {
        if self.config.watch_list.is_empty() {
            return Err(WatchError::NoUnits);
        }

        for unit in &self.config.watch_list {
            let matched = self
                .provider
                .list_units_by_pattern(&WATCHABLE_STATES, &[unit.as_str()])
                .await?;
            if matched.is_empty() {
                return Err(WatchError::unit_not_found(unit.as_str()));
            }
        }
        Ok(())
    }

    async fn poll(&self) {
        let mut ticker = time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if self.cancellable(ticker.tick()).await.is_none() {
                return;
            }

            for unit in &self.config.watch_list {
                let fetched = self
                    .cancellable(self.provider.get_properties_for_unit(unit))
                    .await;
                let properties = match fetched {
                    None => return,
                    Some(Ok(properties)) => properties,
                    Some(Err(err)) => {
                        warn!(unit = %unit, error = %err, "failed to fetch unit properties");
                        if !self.report(err).await {
                            return;
                        }
                        continue;
                    }
                };

                let host_name = self.host_name().await;
                if !self.emit(UnitEvent::new(unit.as_str(), properties, host_name)).await {
                    return;
                }
            }
        }
    }

    async fn subscribe(&self) {
        let capacity = self.config.metrics_buffer_limit;
        let (update_tx, mut updates) = mpsc::channel(capacity);
        let (manager_error_tx, mut manager_errors) = mpsc::channel(capacity);

        let subscribed = self
            .cancellable(
                self.provider
                    .subscribe_to_property_changes(update_tx, manager_error_tx),
            )
            .await;
        match subscribed {
            None => return,
            Some(Err(err)) => {
                warn!(error = %err, "property change subscription failed");
                self.report(err).await;
                return;
            }
            Some(Ok(())) => info!("subscribed to unit property changes"),
        }

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                Some(err) = manager_errors.recv() => {
                    warn!(error = %err, "systemd reported a subscription error");
                    if !self.report(err).await {
                        return;
                    }
                }
                update = updates.recv() => {
                    let Some(update) = update else {
                        // no reconnect is attempted; the error stream carries the cause
                        warn!("property change stream ended");
                        return;
                    };
                    if !self.config.is_watched(&update.unit_name) {
                        continue;
                    }

                    let host_name = self.host_name().await;
                    let event = UnitEvent::new(update.unit_name, update.changed, host_name);
                    if !self.emit(event).await {
                        return;
                    }
                }
            }
        }
    }

    async fn host_name(&self) -> String {
        match self.resolver.resolve().await {
            Ok(name) if !name.is_empty() => name,
            Ok(_) => FALLBACK_HOSTNAME.to_string(),
            Err(err) => {
                debug!(error = %err, "hostname resolution failed, using fallback");
                FALLBACK_HOSTNAME.to_string()
            }
        }
    }

    /// Returns false once the loop should stop.
    async fn emit(&self, event: UnitEvent) -> bool {
        match self.cancellable(self.events.send(event)).await {
            Some(Ok(())) => true,
            Some(Err(_)) => {
                info!("event receiver dropped");
                false
            }
            None => false,
        }
    }

    /// Returns false only when the loop was cancelled while waiting.
    async fn report(&self, err: WatchError) -> bool {
        match self.cancellable(self.errors.send(err)).await {
            Some(Ok(())) => true,
            Some(Err(unsent)) => {
                warn!(error = %unsent.0, "error receiver dropped");
                true
            }
            None => false,
        }
    }

    async fn cancellable<F: Future>(&self, future: F) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            output = future => Some(output),
        }
    }
}
