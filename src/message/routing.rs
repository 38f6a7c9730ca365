use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::runner::error::WorkerError;

/// Message priority tiers.
///
/// Tiers are visited in a weighted-random order by polling consumers, so a
/// higher tier is favoured but never starves a lower one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    /// Stable tier index: `High = 0`, `Medium = 1`, `Low = 2`.
    pub fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Medium
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(WorkerError::Validation(format!("unknown priority: {other}"))),
        }
    }
}

/// Identity and addressing of a message.
///
/// Construction validates every name, so a `RoutingKey` that exists is always
/// safe to splice into backend resource names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRoutingKey")]
pub struct RoutingKey {
    id: String,
    topic: String,
    queue: String,
    priority: Priority,
}

#[derive(Deserialize)]
struct RawRoutingKey {
    id: String,
    topic: String,
    queue: String,
    priority: Priority,
}

impl TryFrom<RawRoutingKey> for RoutingKey {
    type Error = WorkerError;

    fn try_from(raw: RawRoutingKey) -> Result<Self, Self::Error> {
        RoutingKey::new(raw.id, raw.topic, raw.queue, raw.priority)
    }
}

impl RoutingKey {
    pub fn new(
        id: impl Into<String>,
        topic: impl Into<String>,
        queue: impl Into<String>,
        priority: Priority,
    ) -> Result<Self, WorkerError> {
        let id = id.into();
        let topic = topic.into();
        let queue = queue.into();
        validate_id(&id)?;
        validate_name("topic", &topic)?;
        validate_name("queue", &queue)?;
        Ok(Self {
            id,
            topic,
            queue,
            priority,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn encode(&self) -> Result<String, WorkerError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(encoded: &str) -> Result<Self, WorkerError> {
        Ok(serde_json::from_str(encoded)?)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}#{}", self.queue, self.topic, self.priority, self.id)
    }
}

/// Generate a fresh message id (UUID v4, hyphen-free).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Ids may be any non-empty run of letters, digits, `_` and `-`.
pub fn validate_id(id: &str) -> Result<(), WorkerError> {
    if id.is_empty() || !id.chars().all(is_name_char) {
        return Err(WorkerError::Validation(format!("invalid message id: {id:?}")));
    }
    Ok(())
}

/// Topic and queue names follow the id grammar and must not start with a digit.
pub fn validate_name(kind: &str, name: &str) -> Result<(), WorkerError> {
    let starts_with_digit = name.chars().next().is_some_and(|c| c.is_ascii_digit());
    if name.is_empty() || starts_with_digit || !name.chars().all(is_name_char) {
        return Err(WorkerError::Validation(format!("invalid {kind} name: {name:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rejects_malformed_names() {
        assert!(RoutingKey::new("abc", "1topic", "q", Priority::Low).is_err());
        assert!(RoutingKey::new("abc", "topic", "9q", Priority::Low).is_err());
        assert!(RoutingKey::new("a:b", "topic", "q", Priority::Low).is_err());
        assert!(RoutingKey::new("", "topic", "q", Priority::Low).is_err());
        assert!(RoutingKey::new("abc", "to pic", "q", Priority::Low).is_err());
        assert!(RoutingKey::new("123", "_topic", "q-1", Priority::Low).is_ok());
    }

    #[test]
    fn decoding_revalidates_names() {
        let bad = r#"{"id":"x","topic":"0bad","queue":"q","priority":"high"}"#;
        assert!(RoutingKey::decode(bad).is_err());
    }

    #[test]
    fn priority_parses_from_wire_names() {
        for p in Priority::ALL {
            assert_eq!(p.as_str().parse::<Priority>().unwrap(), p);
        }
        assert!("urgent".parse::<Priority>().is_err());
    }

    fn priority_strategy() -> impl Strategy<Value = Priority> {
        prop_oneof![Just(Priority::High), Just(Priority::Medium), Just(Priority::Low)]
    }

    proptest! {
        #[test]
        fn routing_key_survives_encoding(
            id in "[A-Za-z0-9_-]{1,32}",
            topic in "[A-Za-z_-][A-Za-z0-9_-]{0,24}",
            queue in "[A-Za-z_-][A-Za-z0-9_-]{0,24}",
            priority in priority_strategy(),
        ) {
            let key = RoutingKey::new(id, topic, queue, priority).unwrap();
            let decoded = RoutingKey::decode(&key.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, key);
        }
    }
}
