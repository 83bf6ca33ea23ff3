//! Common message fields stamped onto every published work item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Broker-level message priority.
///
/// The numeric values are part of the wire format and match the queue's
/// `x-max-priority` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 5,
    High = 10,
}

impl Priority {
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(Priority::Low),
            5 => Ok(Priority::Normal),
            10 => Ok(Priority::High),
            other => Err(serde::de::Error::custom(format!(
                "unknown priority value: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Metadata carried by every message: when it was requested, a correlation id
/// for tracing it through the ingestion pipeline, and its priority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub requested_at: DateTime<Utc>,
    pub correlation_id: Uuid,
    pub priority: Priority,
}

impl MessageMetadata {
    /// Builds a complete metadata set, filling every field the caller left
    /// unset with a fresh default: now, a new v4 uuid, normal priority.
    pub fn with_overrides(overrides: MetadataOverrides) -> Self {
        Self {
            requested_at: overrides.requested_at.unwrap_or_else(Utc::now),
            correlation_id: overrides.correlation_id.unwrap_or_else(Uuid::new_v4),
            priority: overrides.priority.unwrap_or_default(),
        }
    }
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self::with_overrides(MetadataOverrides::default())
    }
}

/// Per-call partial override of the generated metadata.
#[derive(Debug, Clone, Default)]
pub struct MetadataOverrides {
    pub requested_at: Option<DateTime<Utc>>,
    pub correlation_id: Option<Uuid>,
    pub priority: Option<Priority>,
}

/// A fully stamped message: metadata and application payload flattened into
/// one JSON object. Payload field names must not collide with the metadata
/// field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(flatten)]
    pub metadata: MessageMetadata,
    #[serde(flatten)]
    pub payload: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_filled() {
        let metadata = MessageMetadata::with_overrides(MetadataOverrides::default());
        assert_eq!(metadata.priority, Priority::Normal);
        assert!(!metadata.correlation_id.is_nil());
    }

    #[test]
    fn correlation_ids_are_distinct() {
        let a = MessageMetadata::default();
        let b = MessageMetadata::default();
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn overrides_win_over_defaults() {
        let at = "2024-03-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let id = Uuid::new_v4();
        let metadata = MessageMetadata::with_overrides(MetadataOverrides {
            requested_at: Some(at),
            correlation_id: Some(id),
            priority: Some(Priority::High),
        });
        assert_eq!(metadata.requested_at, at);
        assert_eq!(metadata.correlation_id, id);
        assert_eq!(metadata.priority, Priority::High);
    }

    #[test]
    fn priority_serializes_as_integer() {
        assert_eq!(serde_json::to_string(&Priority::Low).unwrap(), "0");
        assert_eq!(serde_json::to_string(&Priority::Normal).unwrap(), "5");
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "10");
        assert_eq!(serde_json::from_str::<Priority>("10").unwrap(), Priority::High);
        assert!(serde_json::from_str::<Priority>("3").is_err());
    }

    #[test]
    fn envelope_flattens_metadata_and_payload() {
        #[derive(Serialize)]
        struct Payload {
            r#type: &'static str,
            beatmap_id: u64,
        }
        let envelope = Envelope {
            metadata: MessageMetadata::default(),
            payload: Payload {
                r#type: "beatmap",
                beatmap_id: 1234,
            },
        };
        let value = serde_json::to_value(&envelope).unwrap();
        let object = value.as_object().unwrap();
        assert!(object.contains_key("requestedAt"));
        assert!(object.contains_key("correlationId"));
        assert_eq!(object["priority"], 5);
        assert_eq!(object["type"], "beatmap");
        assert_eq!(object["beatmap_id"], 1234);
    }
}
