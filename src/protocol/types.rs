//! Message types and priorities for the agent protocol.

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

/// Well-known envelope types.
pub mod message_types {
    /// A raw message from a user, as received at ingestion.
    pub const USER_COMMUNICATION: &str = "USER_COMMUNICATION";
    /// A worker finished classifying a user message.
    pub const MESSAGE_ANALYZED: &str = "MESSAGE_ANALYZED";
    /// Text to be delivered back to a user.
    pub const USER_RESPONSE: &str = "USER_RESPONSE";
    /// A deferred message could not be processed.
    pub const PROCESSING_ERROR: &str = "PROCESSING_ERROR";
    /// A per-user agent was registered.
    pub const USER_ADDED: &str = "USER_ADDED";
    /// A per-user agent was removed.
    pub const USER_REMOVED: &str = "USER_REMOVED";
}

/// Message priority. Lower weight means more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Priority {
    Critical = 1,
    High = 2,
    #[default]
    Medium = 3,
    Low = 4,
}

impl Priority {
    /// Routing weight: critical=1 … low=4.
    pub fn weight(self) -> u32 {
        self as u32
    }

    /// Map a numeric weight; anything outside 1..=4 is medium.
    pub fn from_weight(weight: i64) -> Self {
        match weight {
            1 => Priority::Critical,
            2 => Priority::High,
            3 => Priority::Medium,
            4 => Priority::Low,
            _ => Priority::Medium,
        }
    }

    /// Map an urgency label such as "high"; unknown labels are medium.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_lowercase().as_str() {
            "critical" => Priority::Critical,
            "high" => Priority::High,
            "medium" => Priority::Medium,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

// Accepts 1..=4, a label, or null. Anything unrecognized degrades to medium
// instead of rejecting the whole envelope.
impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct PriorityVisitor;

        impl<'de> Visitor<'de> for PriorityVisitor {
            type Value = Priority;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a priority number or label")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Priority, E> {
                Ok(Priority::from_weight(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Priority, E> {
                Ok(Priority::from_weight(i64::try_from(v).unwrap_or(0)))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Priority, E> {
                if v.fract() == 0.0 {
                    Ok(Priority::from_weight(v as i64))
                } else {
                    Ok(Priority::Medium)
                }
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Priority, E> {
                Ok(Priority::from_label(v))
            }

            fn visit_bool<E: de::Error>(self, _: bool) -> Result<Priority, E> {
                Ok(Priority::Medium)
            }

            fn visit_unit<E: de::Error>(self) -> Result<Priority, E> {
                Ok(Priority::Medium)
            }

            fn visit_none<E: de::Error>(self) -> Result<Priority, E> {
                Ok(Priority::Medium)
            }
        }

        deserializer.deserialize_any(PriorityVisitor)
    }
}
