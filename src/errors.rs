use std::fmt::Display;

use thiserror::Error;

/// Errors surfaced by the adapter and published on a watch loop's error stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WatchError {
    #[error("no systemd services were provided")]
    NoUnits,
    #[error("{unit} unit listed cannot be found")]
    UnitNotFound { unit: String },
    #[error("failed to connect to system dbus: {message}")]
    Connection { message: String },
    #[error("systemd {operation} failed: {message}")]
    Manager {
        operation: &'static str,
        message: String,
    },
    #[error("systemd {operation} timed out")]
    Timeout { operation: &'static str },
    #[error("couldn't parse systemd version string '{version}'")]
    Version { version: String },
    #[error("invalid unit pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("job {job} for {unit} finished with result '{result}'")]
    JobFailed {
        unit: String,
        job: String,
        result: String,
    },
    #[error("property change subscription closed")]
    SubscriptionClosed,
}

impl WatchError {
    pub fn connection(err: impl Display) -> Self {
        Self::Connection {
            message: err.to_string(),
        }
    }

    pub fn manager(operation: &'static str, err: impl Display) -> Self {
        Self::Manager {
            operation,
            message: err.to_string(),
        }
    }

    pub fn unit_not_found(unit: impl Into<String>) -> Self {
        Self::UnitNotFound { unit: unit.into() }
    }

    /// True for errors that stop a watch loop before it produces any event.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::NoUnits | Self::UnitNotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::WatchError;

    #[test]
    fn messages_name_the_offending_unit() {
        let err = WatchError::unit_not_found("nginx.service");
        assert_eq!(err.to_string(), "nginx.service unit listed cannot be found");
        assert!(err.is_configuration());
    }

    #[test]
    fn manager_errors_are_not_configuration_errors() {
        let err = WatchError::manager("GetAll", "access denied");
        assert_eq!(err.to_string(), "systemd GetAll failed: access denied");
        assert!(!err.is_configuration());
    }
}
