use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::message::routing::validate_id;
use crate::runner::error::WorkerError;

/// Default hard deadline for one handler invocation.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetriesProperties {
    pub max_amount: u32,
    pub already_tried: u32,
}

/// Where (and for how long) the outcome of a job is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultProperties {
    pub id: String,
    pub ttl: Option<Duration>,
}

/// Scheduling knobs. At most one of `defer_by` and `cron` may be set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DelayProperties {
    pub delay_until: Option<DateTime<Utc>>,
    pub defer_by: Option<Duration>,
    pub cron: Option<String>,
    pub next_execution_time: Option<DateTime<Utc>>,
}

impl DelayProperties {
    pub fn is_recurring(&self) -> bool {
        self.defer_by.is_some() || self.cron.is_some()
    }
}

/// Execution parameters travelling with every message.
///
/// Values are never mutated in place once enqueued: [`Parameters::for_retry`]
/// and [`Parameters::for_reschedule`] return fresh copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "EncodedParameters", try_from = "EncodedParameters")]
pub struct Parameters {
    pub execution_timeout: Duration,
    pub retries: RetriesProperties,
    pub result: Option<ResultProperties>,
    pub delay: DelayProperties,
    pub timestamp: DateTime<Utc>,
    pub ttl: Option<Duration>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self::new()
    }
}

impl Parameters {
    pub fn new() -> Self {
        Self {
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            retries: RetriesProperties::default(),
            result: None,
            delay: DelayProperties::default(),
            timestamp: Utc::now(),
            ttl: None,
        }
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_amount: u32) -> Self {
        self.retries.max_amount = max_amount;
        self
    }

    pub fn with_result(mut self, result: ResultProperties) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_delay(mut self, delay: DelayProperties) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.execution_timeout.is_zero() {
            return Err(WorkerError::Validation(
                "execution_timeout must be positive".to_string(),
            ));
        }
        if self.delay.defer_by.is_some() && self.delay.cron.is_some() {
            return Err(WorkerError::Validation(
                "defer_by and cron are mutually exclusive".to_string(),
            ));
        }
        if self.delay.defer_by.is_some_and(|d| d.is_zero()) {
            return Err(WorkerError::Validation("defer_by must be positive".to_string()));
        }
        if let Some(expression) = &self.delay.cron {
            parse_cron(expression)?;
        }
        if let Some(result) = &self.result {
            validate_id(&result.id)?;
        }
        Ok(())
    }

    pub fn is_overdue(&self) -> bool {
        self.is_overdue_at(Utc::now())
    }

    /// `true` only strictly after `timestamp + ttl`; never when `ttl` is unset.
    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        let Some(ttl) = self.ttl else {
            return false;
        };
        match chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.timestamp.checked_add_signed(ttl))
        {
            Some(deadline) => now > deadline,
            None => false,
        }
    }

    /// Next due time derived from `delay_until`, then `defer_by`, then `cron`.
    ///
    /// `delay_until` only counts while it is still in the future. `defer_by`
    /// advances `timestamp` by whole periods until the result is past `now`.
    pub fn compute_next_execution_time(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, WorkerError> {
        if let Some(until) = self.delay.delay_until {
            if until > now {
                return Ok(Some(until));
            }
        }
        if let Some(period) = self.delay.defer_by {
            let period_ms = i64::try_from(period.as_millis()).unwrap_or(i64::MAX).max(1);
            let elapsed_ms = (now - self.timestamp).num_milliseconds();
            let steps = if elapsed_ms < 0 {
                1
            } else {
                elapsed_ms / period_ms + 1
            };
            let next = steps
                .checked_mul(period_ms)
                .and_then(|offset| {
                    self.timestamp
                        .checked_add_signed(chrono::Duration::milliseconds(offset))
                });
            return Ok(next);
        }
        if let Some(expression) = &self.delay.cron {
            let schedule = parse_cron(expression)?;
            return Ok(schedule.after(&now).next());
        }
        Ok(None)
    }

    /// Due time used when placing the message: `Some` only when it lies in the future.
    pub fn due_time(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, WorkerError> {
        let due = match self.delay.next_execution_time {
            Some(next) => Some(next),
            None => self.compute_next_execution_time(now)?,
        };
        Ok(due.filter(|due| *due > now))
    }

    /// Copy prepared for another attempt after `backoff`.
    pub fn for_retry(&self, backoff: Duration, now: DateTime<Utc>) -> Parameters {
        let mut next = self.clone();
        next.retries.already_tried = self.retries.already_tried.saturating_add(1);
        next.delay.next_execution_time = chrono::Duration::from_std(backoff)
            .ok()
            .and_then(|backoff| now.checked_add_signed(backoff))
            .or(Some(now));
        next
    }

    /// Copy prepared for the next occurrence of a recurring schedule.
    pub fn for_reschedule(&self, now: DateTime<Utc>) -> Result<Parameters, WorkerError> {
        let mut next = self.clone();
        next.retries.already_tried = 0;
        next.timestamp = now;
        next.delay.next_execution_time = None;
        next.delay.next_execution_time = next.compute_next_execution_time(now)?;
        Ok(next)
    }

    pub fn encode(&self) -> Result<String, WorkerError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(encoded: &str) -> Result<Self, WorkerError> {
        Ok(serde_json::from_str(encoded)?)
    }
}

/// Cron expressions accept the classic five fields or the six/seven-field
/// form with seconds.
pub(crate) fn parse_cron(expression: &str) -> Result<cron::Schedule, WorkerError> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| WorkerError::Validation(format!("invalid cron expression {expression:?}: {e}")))
}

/// Flat wire form: ISO-8601 timestamps, durations as floating-point seconds.
#[derive(Debug, Serialize, Deserialize)]
struct EncodedParameters {
    execution_timeout: f64,
    retries_max_amount: u32,
    retries_already_tried: u32,
    #[serde(default)]
    result_id: Option<String>,
    #[serde(default)]
    result_ttl: Option<f64>,
    #[serde(default)]
    delay_until: Option<DateTime<Utc>>,
    #[serde(default)]
    defer_by: Option<f64>,
    #[serde(default)]
    cron: Option<String>,
    #[serde(default)]
    next_execution_time: Option<DateTime<Utc>>,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    ttl: Option<f64>,
}

impl From<Parameters> for EncodedParameters {
    fn from(p: Parameters) -> Self {
        let (result_id, result_ttl) = match p.result {
            Some(result) => (Some(result.id), result.ttl.map(|d| d.as_secs_f64())),
            None => (None, None),
        };
        Self {
            execution_timeout: p.execution_timeout.as_secs_f64(),
            retries_max_amount: p.retries.max_amount,
            retries_already_tried: p.retries.already_tried,
            result_id,
            result_ttl,
            delay_until: p.delay.delay_until,
            defer_by: p.delay.defer_by.map(|d| d.as_secs_f64()),
            cron: p.delay.cron,
            next_execution_time: p.delay.next_execution_time,
            timestamp: p.timestamp,
            ttl: p.ttl.map(|d| d.as_secs_f64()),
        }
    }
}

fn seconds(field: &str, value: f64) -> Result<Duration, WorkerError> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| WorkerError::Validation(format!("invalid {field} seconds {value}: {e}")))
}

impl TryFrom<EncodedParameters> for Parameters {
    type Error = WorkerError;

    fn try_from(e: EncodedParameters) -> Result<Self, Self::Error> {
        let result = match e.result_id {
            Some(id) => Some(ResultProperties {
                id,
                ttl: e.result_ttl.map(|v| seconds("result_ttl", v)).transpose()?,
            }),
            None => None,
        };
        let parameters = Parameters {
            execution_timeout: seconds("execution_timeout", e.execution_timeout)?,
            retries: RetriesProperties {
                max_amount: e.retries_max_amount,
                already_tried: e.retries_already_tried,
            },
            result,
            delay: DelayProperties {
                delay_until: e.delay_until,
                defer_by: e.defer_by.map(|v| seconds("defer_by", v)).transpose()?,
                cron: e.cron,
                next_execution_time: e.next_execution_time,
            },
            timestamp: e.timestamp,
            ttl: e.ttl.map(|v| seconds("ttl", v)).transpose()?,
        };
        parameters.validate()?;
        Ok(parameters)
    }
}
