use std::{collections::HashMap, fmt::Write as _, future::Future, time::Duration};

use async_trait::async_trait;
use futures_lite::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use zbus::{
    message::Type as MessageType,
    zvariant::{OwnedObjectPath, OwnedValue},
    Connection, MatchRule, Message, MessageStream, Proxy,
};

use crate::{
    errors::WatchError,
    value::{property_map_from_dbus, PropertyMap, PropertyValue},
};

const DESTINATION: &str = "org.freedesktop.systemd1";
const MANAGER_PATH: &str = "/org/freedesktop/systemd1";
const MANAGER_INTERFACE: &str = "org.freedesktop.systemd1.Manager";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
const UNIT_PATH_NAMESPACE: &str = "/org/freedesktop/systemd1/unit";
pub const UNIT_INTERFACE: &str = "org.freedesktop.systemd1.Unit";
/// Empty interface name; `GetAll` then returns every interface on the object.
pub const ALL_INTERFACES: &str = "";

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct UnitStatus {
    pub name: String,
    pub description: String,
    pub load_state: String,
    pub active_state: String,
    pub sub_state: String,
    pub followed: String,
    pub path: String,
    pub job_id: u32,
    pub job_type: String,
    pub job_path: String,
}

type ListUnitRecord = (
    String,
    String,
    String,
    String,
    String,
    String,
    OwnedObjectPath,
    u32,
    String,
    OwnedObjectPath,
);

impl From<ListUnitRecord> for UnitStatus {
    fn from(
        (
            name,
            description,
            load_state,
            active_state,
            sub_state,
            followed,
            unit_path,
            job_id,
            job_type,
            job_path,
        ): ListUnitRecord,
    ) -> Self {
        Self {
            name,
            description,
            load_state,
            active_state,
            sub_state,
            followed,
            path: unit_path.as_str().to_string(),
            job_id,
            job_type,
            job_path: job_path.as_str().to_string(),
        }
    }
}

/// A change notification for one unit, as reported by the manager.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertiesUpdate {
    pub unit_name: String,
    pub changed: PropertyMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Start,
    Stop,
    Restart,
    Reload,
}

impl JobKind {
    pub fn method(self) -> &'static str {
        match self {
            Self::Start => "StartUnit",
            Self::Stop => "StopUnit",
            Self::Restart => "RestartUnit",
            Self::Reload => "ReloadUnit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job: String,
    pub result: String,
}

/// Raw manager calls, one per D-Bus method the adapter relies on.
#[async_trait]
pub trait ManagerBus: Send + Sync {
    async fn list_units(&self) -> Result<Vec<UnitStatus>, WatchError>;

    async fn list_units_by_patterns(
        &self,
        states: &[&str],
        patterns: &[&str],
    ) -> Result<Vec<UnitStatus>, WatchError>;

    async fn get_all_properties(
        &self,
        unit: &str,
        interface: &str,
    ) -> Result<PropertyMap, WatchError>;

    async fn get_property(
        &self,
        unit: &str,
        interface: &str,
        property: &str,
    ) -> Result<PropertyValue, WatchError>;

    /// Queues a job in `replace` mode and waits for its `JobRemoved` signal.
    async fn run_job(&self, job: JobKind, unit: &str) -> Result<JobOutcome, WatchError>;

    async fn reload(&self) -> Result<(), WatchError>;

    async fn manager_version(&self) -> Result<String, WatchError>;

    async fn subscribe_properties(
        &self,
        updates: mpsc::Sender<PropertiesUpdate>,
        errors: mpsc::Sender<WatchError>,
    ) -> Result<(), WatchError>;

    async fn close(&self);
}

#[derive(Default)]
struct BusState {
    connection: Option<Connection>,
    subscribed: bool,
}

/// System bus client for systemd; connects on first use.
#[derive(Default)]
pub struct DbusSystemdClient {
    state: Mutex<BusState>,
    call_timeout: Option<Duration>,
}

impl DbusSystemdClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds every primitive call. Job completion waits are never bounded.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    async fn connection(&self) -> Result<Connection, WatchError> {
        let mut state = self.state.lock().await;
        connect_locked(&mut state).await
    }

    async fn ensure_subscribed(&self) -> Result<(), WatchError> {
        let mut state = self.state.lock().await;
        if state.subscribed {
            return Ok(());
        }

        let connection = connect_locked(&mut state).await?;
        let proxy = manager_proxy(&connection).await?;
        let subscribed: zbus::Result<()> = proxy.call("Subscribe", &()).await;
        match subscribed {
            Ok(()) => {}
            Err(err) if err.to_string().contains("AlreadySubscribed") => {}
            Err(err) => return Err(WatchError::manager("Subscribe", err)),
        }
        state.subscribed = true;
        Ok(())
    }

    async fn bounded<F, T>(&self, operation: &'static str, call: F) -> Result<T, WatchError>
    where
        F: Future<Output = Result<T, WatchError>>,
    {
        match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| WatchError::Timeout { operation })?,
            None => call.await,
        }
    }

    async fn read_property(
        &self,
        path: String,
        interface: &str,
        property: &str,
    ) -> Result<OwnedValue, WatchError> {
        let connection = self.connection().await?;
        let proxy = properties_proxy(&connection, path).await?;
        proxy
            .call("Get", &(interface, property))
            .await
            .map_err(|err| WatchError::manager("Get", err))
    }
}

async fn connect_locked(state: &mut BusState) -> Result<Connection, WatchError> {
    if let Some(connection) = state.connection.as_ref() {
        return Ok(connection.clone());
    }

    let connection = Connection::system()
        .await
        .map_err(WatchError::connection)?;
    debug!("connected to system dbus");
    state.connection = Some(connection.clone());
    Ok(connection)
}

async fn manager_proxy(connection: &Connection) -> Result<Proxy<'static>, WatchError> {
    Proxy::new(connection, DESTINATION, MANAGER_PATH, MANAGER_INTERFACE)
        .await
        .map_err(|err| WatchError::manager("manager proxy", err))
}

async fn properties_proxy(
    connection: &Connection,
    path: String,
) -> Result<Proxy<'static>, WatchError> {
    Proxy::new(connection, DESTINATION, path, PROPERTIES_INTERFACE)
        .await
        .map_err(|err| WatchError::manager("properties proxy", err))
}

#[async_trait]
impl ManagerBus for DbusSystemdClient {
    async fn list_units(&self) -> Result<Vec<UnitStatus>, WatchError> {
        self.bounded("ListUnits", async {
            let connection = self.connection().await?;
            let proxy = manager_proxy(&connection).await?;
            let rows: Vec<ListUnitRecord> = proxy
                .call("ListUnits", &())
                .await
                .map_err(|err| WatchError::manager("ListUnits", err))?;
            Ok::<_, WatchError>(rows.into_iter().map(UnitStatus::from).collect())
        })
        .await
    }

    async fn list_units_by_patterns(
        &self,
        states: &[&str],
        patterns: &[&str],
    ) -> Result<Vec<UnitStatus>, WatchError> {
        self.bounded("ListUnitsByPatterns", async {
            let connection = self.connection().await?;
            let proxy = manager_proxy(&connection).await?;
            let rows: Vec<ListUnitRecord> = proxy
                .call("ListUnitsByPatterns", &(states.to_vec(), patterns.to_vec()))
                .await
                .map_err(|err| WatchError::manager("ListUnitsByPatterns", err))?;
            Ok::<_, WatchError>(rows.into_iter().map(UnitStatus::from).collect())
        })
        .await
    }

    async fn get_all_properties(
        &self,
        unit: &str,
        interface: &str,
    ) -> Result<PropertyMap, WatchError> {
        self.bounded("GetAll", async {
            let connection = self.connection().await?;
            let proxy = properties_proxy(&connection, unit_object_path(unit)).await?;
            let raw: HashMap<String, OwnedValue> = proxy
                .call("GetAll", &(interface,))
                .await
                .map_err(|err| WatchError::manager("GetAll", err))?;
            Ok::<_, WatchError>(property_map_from_dbus(raw))
        })
        .await
    }

    async fn get_property(
        &self,
        unit: &str,
        interface: &str,
        property: &str,
    ) -> Result<PropertyValue, WatchError> {
        self.bounded("Get", async {
            let value = self
                .read_property(unit_object_path(unit), interface, property)
                .await?;
            Ok::<_, WatchError>(PropertyValue::from(&value))
        })
        .await
    }

    async fn run_job(&self, job: JobKind, unit: &str) -> Result<JobOutcome, WatchError> {
        let operation = job.method();
        let (proxy, removed) = self
            .bounded(operation, async {
                self.ensure_subscribed().await?;
                let connection = self.connection().await?;
                let proxy = manager_proxy(&connection).await?;
                // opened before queueing the job so a fast completion is not missed
                let removed = proxy
                    .receive_signal("JobRemoved")
                    .await
                    .map_err(|err| WatchError::manager(operation, err))?;
                Ok::<_, WatchError>((proxy, removed))
            })
            .await?;

        let job_path = self
            .bounded(operation, async {
                let queued: zbus::Result<OwnedObjectPath> =
                    proxy.call(operation, &(unit, "replace")).await;
                queued.map_err(|err| WatchError::manager(operation, err))
            })
            .await?;
        debug!(unit, job = %job_path.as_str(), "job queued");

        let mut removed = std::pin::pin!(removed);
        while let Some(message) = removed.next().await {
            let Ok((_id, path, _unit, result)) = message
                .body()
                .deserialize::<(u32, OwnedObjectPath, String, String)>()
            else {
                continue;
            };
            if path == job_path {
                return Ok(JobOutcome {
                    job: path.as_str().to_string(),
                    result,
                });
            }
        }

        Err(WatchError::manager(
            operation,
            "JobRemoved stream ended before the job completed",
        ))
    }

    async fn reload(&self) -> Result<(), WatchError> {
        self.bounded("Reload", async {
            let connection = self.connection().await?;
            let proxy = manager_proxy(&connection).await?;
            let reloaded: zbus::Result<()> = proxy.call("Reload", &()).await;
            reloaded.map_err(|err| WatchError::manager("Reload", err))
        })
        .await
    }

    async fn manager_version(&self) -> Result<String, WatchError> {
        self.bounded("Version", async {
            let value = self
                .read_property(MANAGER_PATH.to_string(), MANAGER_INTERFACE, "Version")
                .await?;
            String::try_from(value).map_err(|err| WatchError::manager("Version", err))
        })
        .await
    }

    async fn subscribe_properties(
        &self,
        updates: mpsc::Sender<PropertiesUpdate>,
        errors: mpsc::Sender<WatchError>,
    ) -> Result<(), WatchError> {
        let stream = self
            .bounded("PropertiesChanged", async {
                self.ensure_subscribed().await?;
                let connection = self.connection().await?;
                let rule = properties_changed_rule()
                    .map_err(|err| WatchError::manager("PropertiesChanged", err))?;
                MessageStream::for_match_rule(rule, &connection, None)
                    .await
                    .map_err(|err| WatchError::manager("PropertiesChanged", err))
            })
            .await?;

        tokio::spawn(forward_property_changes(stream, updates, errors));
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock().await;
        state.subscribed = false;
        let Some(connection) = state.connection.take() else {
            return;
        };
        if let Err(err) = connection.close().await {
            warn!(error = %err, "failed to close system dbus connection");
        }
    }
}

fn properties_changed_rule() -> zbus::Result<MatchRule<'static>> {
    Ok(MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender(DESTINATION)?
        .interface(PROPERTIES_INTERFACE)?
        .member("PropertiesChanged")?
        .path_namespace(UNIT_PATH_NAMESPACE)?
        .build())
}

async fn forward_property_changes(
    stream: MessageStream,
    updates: mpsc::Sender<PropertiesUpdate>,
    errors: mpsc::Sender<WatchError>,
) {
    let mut stream = std::pin::pin!(stream);
    loop {
        let next = tokio::select! {
            _ = updates.closed() => break,
            next = stream.next() => next,
        };

        let delivered = match next {
            Some(Ok(message)) => match parse_properties_changed(&message) {
                Some(update) => updates.send(update).await.is_ok(),
                None => true,
            },
            Some(Err(err)) => errors
                .send(WatchError::manager("PropertiesChanged", err))
                .await
                .is_ok(),
            None => {
                let _ = errors.send(WatchError::SubscriptionClosed).await;
                false
            }
        };
        if !delivered {
            break;
        }
    }
    debug!("property change forwarding stopped");
}

fn parse_properties_changed(message: &Message) -> Option<PropertiesUpdate> {
    let header = message.header();
    let path = header.path()?;
    let (interface, changed, _invalidated): (String, HashMap<String, OwnedValue>, Vec<String>) =
        message.body().deserialize().ok()?;
    if interface != UNIT_INTERFACE {
        return None;
    }

    Some(PropertiesUpdate {
        unit_name: unit_name_from_path(path.as_str())?,
        changed: property_map_from_dbus(changed),
    })
}

/// Escapes a unit name into its object path,
/// e.g. "docker.service" -> "/org/freedesktop/systemd1/unit/docker_2eservice"
pub fn unit_object_path(unit: &str) -> String {
    let mut path = format!("{UNIT_PATH_NAMESPACE}/");
    if unit.is_empty() {
        path.push('_');
        return path;
    }

    for (index, byte) in unit.bytes().enumerate() {
        if byte.is_ascii_alphanumeric() && !(index == 0 && byte.is_ascii_digit()) {
            path.push(char::from(byte));
        } else {
            let _ = write!(path, "_{byte:02x}");
        }
    }
    path
}

pub fn unit_name_from_path(path: &str) -> Option<String> {
    let label = path.strip_prefix(UNIT_PATH_NAMESPACE)?.strip_prefix('/')?;
    if label.is_empty() || label.contains('/') {
        return None;
    }
    if label == "_" {
        return Some(String::new());
    }

    let bytes = label.as_bytes();
    let mut name = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'_' {
            let hex = label.get(index + 1..index + 3)?;
            name.push(u8::from_str_radix(hex, 16).ok()?);
            index += 3;
        } else {
            name.push(bytes[index]);
            index += 1;
        }
    }
    String::from_utf8(name).ok()
}

/// Maps a unit type such as "service" or "Service" to its systemd interface.
pub fn unit_type_interface(unit_type: &str) -> String {
    let mut chars = unit_type.chars();
    match chars.next() {
        Some(first) => format!(
            "org.freedesktop.systemd1.{}{}",
            first.to_ascii_uppercase(),
            chars.as_str().to_ascii_lowercase()
        ),
        None => UNIT_INTERFACE.to_string(),
    }
}
