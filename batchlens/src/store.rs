//! The job registry.
//!
//! [`JobStore`] is the single source of truth for job records. The dispatcher selects work from
//! it and the analysis worker moves records through their lifecycle using the `mark_job_*`
//! transitions. The dispatcher only releases records a worker left analyzing.
//!
//! Batchlens ships [`memory::InMemoryJobStore`]. Other implementations can be checked against the
//! expected semantics using [`crate::test_suite`].
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::{
    analyzer::{Analysis, AnalysisError},
    job::{JobId, JobRecord, JobStatus},
    pruner::Pruner,
};

pub mod memory;
#[doc(hidden)]
pub mod testing;

/// Storage for [`JobRecord`]s.
///
/// Only [`JobStore::query`] and the mutating operations have to be implemented, the read helpers
/// used by the dispatcher are derived from [`JobStore::query`]. Implementations backed by an
/// index should override them.
///
/// A store is driven by a single dispatcher: at the start of each dispatch tick no worker owns a
/// record, so anything still [`JobStatus::Analyzing`] is handed back with
/// [`JobStore::mark_job_released`].
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new [`JobStatus::Pending`] record for the given error description.
    ///
    /// Blank descriptions are rejected with [`StoreError::BlankInput`].
    async fn enqueue(&self, input: String) -> Result<JobId, StoreError>;

    /// Claim a pending job for analysis: `Pending -> Analyzing`.
    ///
    /// Sets `started_at` on the first claim. Returns the record as claimed. Any other source
    /// status is rejected with [`StoreError::InvalidTransition`], which is what guarantees that
    /// only one worker owns a record at a time.
    async fn mark_job_analyzing(&self, id: JobId) -> Result<JobRecord, StoreError>;

    /// `Analyzing -> Completed` with the given result.
    async fn mark_job_completed(&self, id: JobId, analysis: Analysis) -> Result<(), StoreError>;

    /// `Analyzing -> Pending` after a failed attempt that will be retried.
    async fn mark_job_retryable(&self, id: JobId, error: AttemptError) -> Result<(), StoreError>;

    /// `Analyzing -> Failed` after the final failed attempt.
    async fn mark_job_failed(&self, id: JobId, error: AttemptError) -> Result<(), StoreError>;

    /// `Analyzing -> Pending` without recording a failed attempt.
    ///
    /// Hands a claimed job back when its outcome could not be recorded. `retry_count` and the
    /// failure history are left as they are.
    async fn mark_job_released(&self, id: JobId) -> Result<(), StoreError>;

    /// Remove terminal records matching the pruner, returning how many were removed.
    async fn prune(&self, pruner: &Pruner) -> Result<usize, StoreError>;

    /// All records matching the query, in no particular order.
    async fn query(&self, query: Query) -> Result<Vec<JobRecord>, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.query(Query::IdEquals(id)).await?.into_iter().next())
    }

    /// Every record that is [`JobStatus::Pending`] or [`JobStatus::Analyzing`], oldest first.
    async fn list_pending(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut jobs = self
            .query(Query::Or(vec![
                Query::StatusEqual(JobStatus::Pending),
                Query::StatusEqual(JobStatus::Analyzing),
            ]))
            .await?;
        sort_by_creation(&mut jobs);
        Ok(jobs)
    }

    /// Up to `limit` of the oldest [`JobStatus::Pending`] records.
    ///
    /// This is a selection, the records stay pending until claimed.
    async fn pending_batch(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        let mut jobs = self.query(Query::StatusEqual(JobStatus::Pending)).await?;
        sort_by_creation(&mut jobs);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn summary(&self) -> Result<StatusSummary, StoreError> {
        Ok(self
            .query(Query::All)
            .await?
            .iter()
            .fold(StatusSummary::default(), |mut summary, job| {
                summary.record(job.status);
                summary
            }))
    }
}

pub(crate) fn sort_by_creation(jobs: &mut [JobRecord]) {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

/// A filter over job records.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    All,
    Not(Box<Query>),
    And(Vec<Query>),
    Or(Vec<Query>),
    IdEquals(JobId),
    IdIn(Vec<JobId>),
    StatusEqual(JobStatus),
    CreatedBefore(DateTime<Utc>),
    CompletedBefore(DateTime<Utc>),
}

impl Query {
    pub fn matches(&self, job: &JobRecord) -> bool {
        match self {
            Self::All => true,
            Self::Not(inner) => !inner.matches(job),
            Self::And(inner) => inner.iter().all(|query| query.matches(job)),
            Self::Or(inner) => inner.iter().any(|query| query.matches(job)),
            Self::IdEquals(id) => job.id == *id,
            Self::IdIn(ids) => ids.contains(&job.id),
            Self::StatusEqual(status) => job.status == *status,
            Self::CreatedBefore(at) => job.created_at < *at,
            Self::CompletedBefore(at) => job.completed_at.is_some_and(|completed| completed < *at),
        }
    }
}

/// The failure of a single analysis attempt, as reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptError {
    pub error_type: &'static str,
    pub message: String,
}

impl From<AnalysisError> for AttemptError {
    fn from(value: AnalysisError) -> Self {
        Self {
            error_type: value.error_type(),
            message: value.to_string(),
        }
    }
}

/// Number of records in each status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSummary {
    pub pending: usize,
    pub analyzing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusSummary {
    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Analyzing => self.analyzing += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.analyzing + self.completed + self.failed
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("Error description must not be blank")]
    BlankInput,
    #[error("Job store in bad state")]
    BadState,
}
