use serde::{Deserialize, Serialize};

use crate::message::parameters::Parameters;
use crate::message::routing::{validate_id, Priority, RoutingKey};
use crate::runner::error::WorkerError;

const ARGS_REFERENCE_FIELD: &str = "__args_bucket_id";

/// The unit moved through a broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "Envelope", try_from = "Envelope")]
pub struct Message {
    pub key: RoutingKey,
    pub payload: String,
    pub parameters: Parameters,
}

/// Backend-independent wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    id: String,
    topic: String,
    queue: String,
    priority: Priority,
    payload: String,
    parameters: Parameters,
}

impl From<Message> for Envelope {
    fn from(message: Message) -> Self {
        Self {
            id: message.key.id().to_string(),
            topic: message.key.topic().to_string(),
            queue: message.key.queue().to_string(),
            priority: message.key.priority(),
            payload: message.payload,
            parameters: message.parameters,
        }
    }
}

impl TryFrom<Envelope> for Message {
    type Error = WorkerError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        let key = RoutingKey::new(
            envelope.id,
            envelope.topic,
            envelope.queue,
            envelope.priority,
        )?;
        Ok(Message {
            key,
            payload: envelope.payload,
            parameters: envelope.parameters,
        })
    }
}

impl Message {
    pub fn new(key: RoutingKey, payload: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            key,
            payload: payload.into(),
            parameters,
        }
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    pub fn encode(&self) -> Result<String, WorkerError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(encoded: &str) -> Result<Self, WorkerError> {
        Ok(serde_json::from_str(encoded)?)
    }

    pub fn decode_bytes(encoded: &[u8]) -> Result<Self, WorkerError> {
        Ok(serde_json::from_slice(encoded)?)
    }
}

/// Payload standing in for arguments stored in a bucket under `bucket_id`.
pub fn args_reference(bucket_id: &str) -> Result<String, WorkerError> {
    validate_id(bucket_id)?;
    Ok(serde_json::json!({ ARGS_REFERENCE_FIELD: bucket_id }).to_string())
}

/// Bucket id if `payload` is an indirection reference rather than inline data.
pub fn parse_args_reference(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }
    object
        .get(ARGS_REFERENCE_FIELD)?
        .as_str()
        .map(str::to_string)
}
