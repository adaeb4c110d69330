//! Service-manager capability surface used by the watch engine
//!
//! `SystemdAdapter` layers version detection, listing strategy selection and
//! job bookkeeping on top of a raw `ManagerBus`.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, info};

use crate::{
    errors::WatchError,
    pattern::UnitPatternMatcher,
    systemd_client::{
        unit_type_interface, JobKind, ManagerBus, PropertiesUpdate, UnitStatus, ALL_INTERFACES,
    },
    value::{PropertyMap, PropertyValue},
};

/// Every state a watched unit may legitimately be in.
pub const WATCHABLE_STATES: [&str; 7] = [
    "active",
    "activating",
    "failed",
    "inactive",
    "deactivating",
    "maintenance",
    "reloading",
];

/// First systemd release with `ListUnitsByPatterns`.
pub const NATIVE_PATTERN_LISTING_VERSION: u32 = 230;

#[async_trait]
pub trait UnitProvider: Send + Sync {
    async fn list_units_by_pattern(
        &self,
        states: &[&str],
        patterns: &[&str],
    ) -> Result<Vec<UnitStatus>, WatchError>;

    async fn get_properties_for_unit(&self, unit: &str) -> Result<PropertyMap, WatchError>;

    async fn get_properties_for_unit_type(
        &self,
        unit: &str,
        unit_type: &str,
    ) -> Result<PropertyMap, WatchError>;

    async fn get_property(&self, unit: &str, property: &str) -> Result<PropertyValue, WatchError>;

    async fn start_service(&self, unit: &str) -> Result<(), WatchError>;

    async fn stop_service(&self, unit: &str) -> Result<(), WatchError>;

    async fn reload_service(&self, unit: &str) -> Result<(), WatchError>;

    async fn restart_service(&self, unit: &str) -> Result<UnitStatus, WatchError>;

    async fn reload_daemon(&self) -> Result<(), WatchError>;

    async fn get_version(&self) -> Result<u32, WatchError>;

    async fn subscribe_to_property_changes(
        &self,
        updates: mpsc::Sender<PropertiesUpdate>,
        errors: mpsc::Sender<WatchError>,
    ) -> Result<(), WatchError>;

    async fn close(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingStrategy {
    Native,
    ClientSideGlob,
}

/// What the connected manager can do, resolved once per adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerCapability {
    pub version: u32,
    pub listing: ListingStrategy,
}

impl ManagerCapability {
    pub fn from_version(version: u32) -> Self {
        let listing = if version >= NATIVE_PATTERN_LISTING_VERSION {
            ListingStrategy::Native
        } else {
            ListingStrategy::ClientSideGlob
        };
        Self { version, listing }
    }
}

static VERSION_PATTERN: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\d{3}"));

/// Extracts the major version, the first run of three digits, from a
/// version string such as "systemd 249 (249.11-0ubuntu3.12)".
pub fn parse_manager_version(version: &str) -> Result<u32, WatchError> {
    let invalid = || WatchError::Version {
        version: version.to_string(),
    };
    let pattern = VERSION_PATTERN.as_ref().map_err(|_| invalid())?;
    let major = pattern.find(version).ok_or_else(invalid)?;
    major.as_str().parse::<u32>().map_err(|_| invalid())
}

pub struct SystemdAdapter<B> {
    bus: B,
    capability: OnceCell<ManagerCapability>,
}

impl<B: ManagerBus> SystemdAdapter<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            capability: OnceCell::new(),
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub async fn capability(&self) -> Result<ManagerCapability, WatchError> {
        self.capability
            .get_or_try_init(|| async {
                let raw = self.bus.manager_version().await?;
                let capability = ManagerCapability::from_version(parse_manager_version(&raw)?);
                info!(
                    version = capability.version,
                    listing = ?capability.listing,
                    "detected systemd manager"
                );
                Ok::<_, WatchError>(capability)
            })
            .await
            .copied()
    }

    async fn run_job(&self, job: JobKind, unit: &str) -> Result<(), WatchError> {
        let outcome = self.bus.run_job(job, unit).await?;
        debug!(unit, job = %outcome.job, result = %outcome.result, "job finished");
        if outcome.result != "done" {
            return Err(WatchError::JobFailed {
                unit: unit.to_string(),
                job: outcome.job,
                result: outcome.result,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl<B: ManagerBus> UnitProvider for SystemdAdapter<B> {
    async fn list_units_by_pattern(
        &self,
        states: &[&str],
        patterns: &[&str],
    ) -> Result<Vec<UnitStatus>, WatchError> {
        match self.capability().await?.listing {
            ListingStrategy::Native => self.bus.list_units_by_patterns(states, patterns).await,
            ListingStrategy::ClientSideGlob => {
                let matcher = UnitPatternMatcher::new(states, patterns)?;
                Ok(matcher.filter(self.bus.list_units().await?))
            }
        }
    }

    async fn get_properties_for_unit(&self, unit: &str) -> Result<PropertyMap, WatchError> {
        self.bus.get_all_properties(unit, ALL_INTERFACES).await
    }

    async fn get_properties_for_unit_type(
        &self,
        unit: &str,
        unit_type: &str,
    ) -> Result<PropertyMap, WatchError> {
        self.bus
            .get_all_properties(unit, &unit_type_interface(unit_type))
            .await
    }

    async fn get_property(&self, unit: &str, property: &str) -> Result<PropertyValue, WatchError> {
        let unit_type = unit.rsplit_once('.').map_or("service", |(_, suffix)| suffix);
        self.bus
            .get_property(unit, &unit_type_interface(unit_type), property)
            .await
    }

    async fn start_service(&self, unit: &str) -> Result<(), WatchError> {
        self.run_job(JobKind::Start, unit).await
    }

    async fn stop_service(&self, unit: &str) -> Result<(), WatchError> {
        self.run_job(JobKind::Stop, unit).await
    }

    async fn reload_service(&self, unit: &str) -> Result<(), WatchError> {
        self.run_job(JobKind::Reload, unit).await
    }

    async fn restart_service(&self, unit: &str) -> Result<UnitStatus, WatchError> {
        self.run_job(JobKind::Restart, unit).await?;
        self.list_units_by_pattern(&WATCHABLE_STATES, &[unit])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| WatchError::unit_not_found(unit))
    }

    async fn reload_daemon(&self) -> Result<(), WatchError> {
        self.bus.reload().await
    }

    async fn get_version(&self) -> Result<u32, WatchError> {
        Ok(self.capability().await?.version)
    }

    async fn subscribe_to_property_changes(
        &self,
        updates: mpsc::Sender<PropertiesUpdate>,
        errors: mpsc::Sender<WatchError>,
    ) -> Result<(), WatchError> {
        self.bus.subscribe_properties(updates, errors).await
    }

    async fn close(&self) {
        self.bus.close().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::systemd_client::JobOutcome;

    struct FakeBus {
        version: String,
        units: Vec<UnitStatus>,
        job_result: String,
        version_calls: AtomicUsize,
        native_calls: AtomicUsize,
        list_all_calls: AtomicUsize,
        jobs: Mutex<Vec<(JobKind, String)>>,
        interfaces: Mutex<Vec<String>>,
    }

    impl FakeBus {
        fn new(version: &str) -> Self {
            Self {
                version: version.to_string(),
                units: vec![
                    unit("foobar.service", "active", "running"),
                    unit("baz.service", "active", "running"),
                    unit("cron.service", "failed", "failed"),
                ],
                job_result: "done".to_string(),
                version_calls: AtomicUsize::new(0),
                native_calls: AtomicUsize::new(0),
                list_all_calls: AtomicUsize::new(0),
                jobs: Mutex::new(Vec::new()),
                interfaces: Mutex::new(Vec::new()),
            }
        }
    }

    fn unit(name: &str, active_state: &str, sub_state: &str) -> UnitStatus {
        UnitStatus {
            name: name.to_string(),
            load_state: "loaded".to_string(),
            active_state: active_state.to_string(),
            sub_state: sub_state.to_string(),
            ..UnitStatus::default()
        }
    }

    #[async_trait]
    impl ManagerBus for FakeBus {
        async fn list_units(&self) -> Result<Vec<UnitStatus>, WatchError> {
            self.list_all_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.units.clone())
        }

        async fn list_units_by_patterns(
            &self,
            _states: &[&str],
            patterns: &[&str],
        ) -> Result<Vec<UnitStatus>, WatchError> {
            self.native_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .units
                .iter()
                .filter(|unit| patterns.contains(&unit.name.as_str()))
                .cloned()
                .collect())
        }

        async fn get_all_properties(
            &self,
            _unit: &str,
            interface: &str,
        ) -> Result<PropertyMap, WatchError> {
            self.interfaces
                .lock()
                .expect("interfaces lock")
                .push(interface.to_string());
            Ok(PropertyMap::new())
        }

        async fn get_property(
            &self,
            _unit: &str,
            interface: &str,
            _property: &str,
        ) -> Result<PropertyValue, WatchError> {
            self.interfaces
                .lock()
                .expect("interfaces lock")
                .push(interface.to_string());
            Ok(PropertyValue::UInt32(42))
        }

        async fn run_job(&self, job: JobKind, unit: &str) -> Result<JobOutcome, WatchError> {
            self.jobs
                .lock()
                .expect("jobs lock")
                .push((job, unit.to_string()));
            Ok(JobOutcome {
                job: "/org/freedesktop/systemd1/job/7".to_string(),
                result: self.job_result.clone(),
            })
        }

        async fn reload(&self) -> Result<(), WatchError> {
            Ok(())
        }

        async fn manager_version(&self) -> Result<String, WatchError> {
            self.version_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.version.clone())
        }

        async fn subscribe_properties(
            &self,
            _updates: mpsc::Sender<PropertiesUpdate>,
            _errors: mpsc::Sender<WatchError>,
        ) -> Result<(), WatchError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    #[test]
    fn parses_major_version_from_version_strings() {
        assert_eq!(parse_manager_version("249"), Ok(249));
        assert_eq!(
            parse_manager_version("systemd 255 (255.4-1ubuntu8)"),
            Ok(255)
        );
        assert_eq!(parse_manager_version("v2551"), Ok(255));
    }

    #[test]
    fn version_pattern_is_shared_across_calls() {
        let compiled: *const Regex = VERSION_PATTERN.as_ref().expect("pattern compiles");
        assert_eq!(parse_manager_version("systemd 219"), Ok(219));
        assert_eq!(parse_manager_version("systemd 256"), Ok(256));
        let reused: *const Regex = VERSION_PATTERN.as_ref().expect("pattern compiles");
        assert!(std::ptr::eq(compiled, reused));
    }

    #[test]
    fn rejects_version_strings_without_three_digits() {
        assert_eq!(
            parse_manager_version("systemd 99"),
            Err(WatchError::Version {
                version: "systemd 99".to_string()
            })
        );
    }

    #[test]
    fn capability_threshold_is_inclusive() {
        assert_eq!(
            ManagerCapability::from_version(230).listing,
            ListingStrategy::Native
        );
        assert_eq!(
            ManagerCapability::from_version(229).listing,
            ListingStrategy::ClientSideGlob
        );
    }

    #[tokio::test]
    async fn version_230_uses_native_listing() {
        let adapter = SystemdAdapter::new(FakeBus::new("230"));
        let units = adapter
            .list_units_by_pattern(&WATCHABLE_STATES, &["baz.service"])
            .await
            .expect("listing succeeds");

        assert_eq!(units.len(), 1);
        assert_eq!(adapter.bus().native_calls.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.bus().list_all_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn version_229_filters_client_side() {
        let adapter = SystemdAdapter::new(FakeBus::new("systemd 229"));
        let units = adapter
            .list_units_by_pattern(&["active"], &["foo*"])
            .await
            .expect("listing succeeds");

        assert_eq!(units.len(), 1);
        assert_eq!(units[0].name, "foobar.service");
        assert_eq!(adapter.bus().native_calls.load(Ordering::SeqCst), 0);
        assert_eq!(adapter.bus().list_all_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn version_is_queried_once() {
        let adapter = SystemdAdapter::new(FakeBus::new("systemd 252"));
        for _ in 0..3 {
            adapter
                .list_units_by_pattern(&WATCHABLE_STATES, &["baz.service"])
                .await
                .expect("listing succeeds");
        }

        assert_eq!(adapter.get_version().await, Ok(252));
        assert_eq!(adapter.bus().version_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unparsable_version_fails_listing() {
        let adapter = SystemdAdapter::new(FakeBus::new("unknown"));
        let err = adapter
            .list_units_by_pattern(&WATCHABLE_STATES, &["baz.service"])
            .await
            .expect_err("listing must fail without a version");
        assert!(matches!(err, WatchError::Version { .. }));
    }

    #[tokio::test]
    async fn restart_returns_current_status() {
        let adapter = SystemdAdapter::new(FakeBus::new("252"));
        let status = adapter
            .restart_service("cron.service")
            .await
            .expect("restart succeeds");

        assert_eq!(status.name, "cron.service");
        assert_eq!(
            adapter.bus().jobs.lock().expect("jobs lock").as_slice(),
            &[(JobKind::Restart, "cron.service".to_string())]
        );
    }

    #[tokio::test]
    async fn restart_of_unknown_unit_fails_after_job() {
        let adapter = SystemdAdapter::new(FakeBus::new("252"));
        let err = adapter
            .restart_service("missing.service")
            .await
            .expect_err("lookup must fail");
        assert_eq!(err, WatchError::unit_not_found("missing.service"));
    }

    #[tokio::test]
    async fn failed_jobs_are_reported() {
        let mut bus = FakeBus::new("252");
        bus.job_result = "failed".to_string();
        let adapter = SystemdAdapter::new(bus);

        let err = adapter
            .start_service("cron.service")
            .await
            .expect_err("failed job must surface");
        assert!(matches!(err, WatchError::JobFailed { ref result, .. } if result == "failed"));
    }

    #[tokio::test]
    async fn property_reads_target_the_expected_interfaces() {
        let adapter = SystemdAdapter::new(FakeBus::new("252"));
        adapter
            .get_properties_for_unit("ssh.service")
            .await
            .expect("all properties");
        adapter
            .get_properties_for_unit_type("ssh.service", "Service")
            .await
            .expect("type properties");
        adapter
            .get_property("ssh.socket", "NAccepted")
            .await
            .expect("single property");

        assert_eq!(
            adapter
                .bus()
                .interfaces
                .lock()
                .expect("interfaces lock")
                .as_slice(),
            &[
                String::new(),
                "org.freedesktop.systemd1.Service".to_string(),
                "org.freedesktop.systemd1.Socket".to_string(),
            ]
        );
    }
}
