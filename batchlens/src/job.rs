//! The job record tracked for every submitted error description.
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analyzer::Analysis;

/// Opaque identifier of a submitted job.
///
/// Ids are handed out by the [`crate::store::JobStore`] in increasing order and are never reused,
/// even after a record has been pruned.
#[derive(Debug, Eq, PartialEq, Ord, PartialOrd, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct JobId(u64);

const JOB_ID_PREFIX: &str = "job-";

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<JobId> for u64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.to_string()
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{JOB_ID_PREFIX}{}", self.0)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid job id: {0:?}")]
pub struct ParseJobIdError(String);

impl FromStr for JobId {
    type Err = ParseJobIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_prefix(JOB_ID_PREFIX)
            .and_then(|n| n.parse().ok())
            .map(Self)
            .ok_or_else(|| ParseJobIdError(s.to_owned()))
    }
}

impl TryFrom<String> for JobId {
    type Error = ParseJobIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Lifecycle state of a [`JobRecord`].
///
/// ```text
/// Pending -> Analyzing -> Completed
///               |-------> Pending   (retry scheduled)
///               |-------> Failed    (retries exhausted)
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Analyzing,
    Completed,
    Failed,
}

impl JobStatus {
    /// `true` for states from which no further transition happens.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// `true` for states reported by [`crate::store::JobStore::list_pending`].
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending | Self::Analyzing)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(status)
    }
}

/// A snapshot of a single analysis request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// The error description exactly as it was submitted.
    pub input: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Set on the first claim and kept across retries.
    pub started_at: Option<DateTime<Utc>>,
    /// Set when the record reaches [`JobStatus::Completed`] or a terminal [`JobStatus::Failed`].
    pub completed_at: Option<DateTime<Utc>>,
    /// Present if and only if the status is [`JobStatus::Completed`].
    pub result: Option<Analysis>,
    /// Reason of the last failure. Cleared when a retry is scheduled.
    pub error_message: Option<String>,
    pub retry_count: u32,
    /// Every failed attempt, oldest first.
    pub failures: Vec<AttemptFailure>,
}

impl JobRecord {
    pub(crate) fn new(id: JobId, input: String) -> Self {
        Self {
            id,
            input,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error_message: None,
            retry_count: 0,
            failures: vec![],
        }
    }

    /// The attempt number of the current (or next) analysis, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }
}

/// A failed analysis attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub attempt: u32,
    pub error_type: String,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn job_id_display_round_trips() {
        let id = JobId::from(42);

        assert_eq!(id.to_string(), "job-42");
        assert_eq!("job-42".parse::<JobId>(), Ok(id));
    }

    #[test]
    fn job_id_rejects_foreign_tokens() {
        assert!("42".parse::<JobId>().is_err());
        assert!("job-".parse::<JobId>().is_err());
        assert!("job--1".parse::<JobId>().is_err());
    }

    #[test]
    fn job_id_serializes_as_token() {
        let json = serde_json::to_string(&JobId::from(7)).unwrap();

        assert_eq!(json, "\"job-7\"");
        assert_eq!(serde_json::from_str::<JobId>(&json).unwrap(), JobId::from(7));
    }

    #[test]
    fn new_record_is_pending() {
        let record = JobRecord::new(1.into(), "NullReferenceException at Foo.Bar".to_owned());

        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.attempt(), 1);
        assert!(record.result.is_none());
        assert!(record.started_at.is_none());
        assert!(record.completed_at.is_none());
    }

    #[test]
    fn status_classification() {
        assert!(JobStatus::Pending.is_pending());
        assert!(JobStatus::Analyzing.is_pending());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Analyzing.is_terminal());
    }
}
