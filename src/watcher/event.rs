use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::value::PropertyMap;

/// One observation of a watched unit's properties.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitEvent {
    /// Capture time in milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub unit_name: String,
    pub property_changes: PropertyMap,
    pub host_name: String,
}

impl UnitEvent {
    /// Stamps the event with the current wall-clock time.
    pub fn new(
        unit_name: impl Into<String>,
        property_changes: PropertyMap,
        host_name: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            unit_name: unit_name.into(),
            property_changes,
            host_name: host_name.into(),
        }
    }

    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::UnitEvent;
    use crate::value::{PropertyMap, PropertyValue};

    #[test]
    fn serializes_with_plain_property_values() {
        let mut properties = PropertyMap::new();
        properties.insert(
            "ActiveState".to_string(),
            PropertyValue::Str("active".to_string()),
        );
        properties.insert("NRestarts".to_string(), PropertyValue::UInt32(2));

        let mut event = UnitEvent::new("ssh.service", properties, "web-01");
        event.timestamp = 1_772_150_400_000;

        assert_eq!(
            serde_json::to_value(&event).expect("serializable"),
            json!({
                "timestamp": 1_772_150_400_000_i64,
                "unit_name": "ssh.service",
                "property_changes": {"ActiveState": "active", "NRestarts": 2},
                "host_name": "web-01"
            })
        );
        assert_eq!(
            event
                .captured_at()
                .expect("valid timestamp")
                .timestamp_millis(),
            1_772_150_400_000
        );
    }
}
