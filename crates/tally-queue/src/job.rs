//! Job definitions

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::backend::QueueError;

/// Job Identifier, formatted as `<type>_<createdAtMs>_<suffix>`
pub type JobId = String;

/// Attempts allowed when the producer does not say otherwise
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const ID_SUFFIX_LEN: usize = 9;

/// Job Status
///
/// Each status corresponds to exactly one ordering index in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Eligible for dequeue
    Waiting,
    /// Scheduled for a later time (initial delay or retry backoff)
    Delayed,
    /// Claimed by a worker
    Active,
    /// Handler succeeded
    Completed,
    /// Attempts exhausted
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Waiting,
        JobStatus::Delayed,
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed records only leave the store through cleanup.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "waiting" => Ok(Self::Waiting),
            "delayed" => Ok(Self::Delayed),
            "active" | "processing" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(QueueError::InvalidArgument(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }
}

/// Retry backoff strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    Fixed {
        #[serde(rename = "delay")]
        delay_ms: u64,
    },
    /// `min(2^attempt * base_ms, max_ms)`
    Exponential {
        #[serde(rename = "delay")]
        base_ms: u64,
        #[serde(rename = "maxDelay", default = "default_max_backoff_ms")]
        max_ms: u64,
    },
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base_ms: 1_000,
            max_ms: default_max_backoff_ms(),
        }
    }
}

impl BackoffStrategy {
    /// Delay before the retry that follows failure number `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential { base_ms, max_ms } => {
                let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
                Duration::from_millis(base_ms.saturating_mul(factor).min(*max_ms))
            }
        }
    }
}

/// Scheduling options supplied by a producer.
///
/// Unset fields fall back to the queue defaults: priority 0, no delay,
/// [`DEFAULT_MAX_ATTEMPTS`] and exponential backoff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(rename = "delay", skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffStrategy>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_ms = Some(delay.as_millis() as u64);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Fill every unset field from `defaults`; fields already set win.
    pub fn or_defaults(self, defaults: JobOptions) -> Self {
        Self {
            priority: self.priority.or(defaults.priority),
            delay_ms: self.delay_ms.or(defaults.delay_ms),
            max_attempts: self.max_attempts.or(defaults.max_attempts),
            backoff: self.backoff.or(defaults.backoff),
        }
    }
}

/// A persisted job record
///
/// Field names on the wire follow the layout shared with existing producers
/// (`type`, `data`, `delay`, camelCase timestamps).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(rename = "data")]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: i32,
    #[serde(rename = "delay", default)]
    pub delay_ms: u64,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    pub status: JobStatus,
    #[serde(default)]
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_completed_at: Option<DateTime<Utc>>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl JobRecord {
    /// Build a fresh record; the status reflects whether a delay was requested.
    pub fn new(
        job_type: &str,
        payload: serde_json::Value,
        options: &JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        let delay_ms = options.delay_ms.unwrap_or(0);
        Self {
            id: generate_job_id(job_type, now),
            job_type: job_type.to_string(),
            payload,
            priority: options.priority.unwrap_or(0),
            delay_ms,
            attempts: 0,
            max_attempts: options.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            backoff: options.backoff.unwrap_or_default(),
            status: if delay_ms > 0 {
                JobStatus::Delayed
            } else {
                JobStatus::Waiting
            },
            progress: 0,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            processing_completed_at: None,
        }
    }

    /// Earliest time the initial run may start.
    pub fn scheduled_at(&self) -> DateTime<Utc> {
        self.created_at + ChronoDuration::milliseconds(self.delay_ms as i64)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Generate `<type>_<epochMs>_<9 lowercase alphanumerics>`.
pub fn generate_job_id(job_type: &str, now: DateTime<Utc>) -> JobId {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(ID_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("{}_{}_{}", job_type, now.timestamp_millis(), suffix)
}

/// Clamp a reported progress value into `0..=100`.
pub fn clamp_progress(pct: i64) -> u8 {
    pct.clamp(0, 100) as u8
}
