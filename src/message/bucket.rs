use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::runner::error::WorkerError;

/// Arguments stored out-of-band and referenced from a message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgsBucket {
    pub data: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, with = "seconds")]
    pub ttl: Option<Duration>,
}

/// Outcome of one job execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBucket {
    /// Converted handler output, or the stringified error on failure.
    pub data: String,
    pub started_when: DateTime<Utc>,
    pub finished_when: DateTime<Utc>,
    pub success: bool,
    /// Error kind when `success` is false.
    #[serde(default)]
    pub exception: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, with = "seconds")]
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Bucket {
    Args(ArgsBucket),
    Result(ResultBucket),
}

impl ArgsBucket {
    pub fn new(data: impl Into<String>, ttl: Option<Duration>) -> Self {
        Self {
            data: data.into(),
            timestamp: Utc::now(),
            ttl,
        }
    }
}

impl Bucket {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Bucket::Args(b) => b.timestamp,
            Bucket::Result(b) => b.timestamp,
        }
    }

    pub fn ttl(&self) -> Option<Duration> {
        match self {
            Bucket::Args(b) => b.ttl,
            Bucket::Result(b) => b.ttl,
        }
    }

    pub fn is_overdue(&self) -> bool {
        self.is_overdue_at(Utc::now())
    }

    /// Same rule as message parameters: strictly after `timestamp + ttl`.
    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        let Some(ttl) = self.ttl() else {
            return false;
        };
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.timestamp().checked_add_signed(ttl))
            .is_some_and(|deadline| now > deadline)
    }

    pub fn into_args(self) -> Result<ArgsBucket, WorkerError> {
        match self {
            Bucket::Args(b) => Ok(b),
            Bucket::Result(_) => Err(WorkerError::Bucket(
                "expected an args bucket, found a result bucket".to_string(),
            )),
        }
    }

    pub fn into_result(self) -> Result<ResultBucket, WorkerError> {
        match self {
            Bucket::Result(b) => Ok(b),
            Bucket::Args(_) => Err(WorkerError::Bucket(
                "expected a result bucket, found an args bucket".to_string(),
            )),
        }
    }

    pub fn encode(&self) -> Result<String, WorkerError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(encoded: &str) -> Result<Self, WorkerError> {
        Ok(serde_json::from_str(encoded)?)
    }
}

mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(d)?
            .map(|v| Duration::try_from_secs_f64(v).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn bucket_overdue_follows_ttl() {
        let mut bucket = ArgsBucket::new("[1,2]", Some(Duration::from_secs(5)));
        bucket.timestamp = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let bucket = Bucket::Args(bucket);
        let base = bucket.timestamp();
        assert!(!bucket.is_overdue_at(base + chrono::Duration::seconds(5)));
        assert!(bucket.is_overdue_at(base + chrono::Duration::seconds(6)));
    }

    #[test]
    fn bucket_kind_is_checked() {
        let bucket = Bucket::Args(ArgsBucket::new("x", None));
        let decoded = Bucket::decode(&bucket.encode().unwrap()).unwrap();
        assert!(decoded.clone().into_args().is_ok());
        assert!(matches!(decoded.into_result(), Err(WorkerError::Bucket(_))));
    }
}
