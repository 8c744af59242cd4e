//! Provides an in memory implementation of [`JobStore`].
//!
//! Records live for the lifetime of the process (or until removed by a configured
//! [`crate::pruner::RetentionPolicy`]); nothing is persisted.
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    analyzer::Analysis,
    job::{AttemptFailure, JobId, JobRecord, JobStatus},
    pruner::{PruneBy, Pruner},
};

use super::{AttemptError, JobStore, Query, StoreError};

/// An in memory implementation of [`JobStore`].
///
/// Cloning is cheap and every clone shares the same records.
///
/// Ids are assigned under the write lock, so key order is enqueue order.
#[derive(Clone, Default, Debug)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<BTreeMap<JobId, JobRecord>>>,
    id_counter: Arc<AtomicU64>,
}

impl InMemoryJobStore {
    /// Creates a new, empty, instance of [`InMemoryJobStore`].
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> JobId {
        (self.id_counter.fetch_add(1, Ordering::SeqCst) + 1).into()
    }

    fn update<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut JobRecord) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        match jobs.get_mut(&id) {
            None => Err(StoreError::JobNotFound(id)),
            Some(job) => f(job),
        }
    }
}

impl AttemptError {
    fn into_attempt_failure(self, attempt: u32) -> AttemptFailure {
        AttemptFailure {
            attempt,
            error_type: self.error_type.to_owned(),
            message: self.message,
            recorded_at: Utc::now(),
        }
    }
}

impl JobRecord {
    fn expect_status(&self, from: JobStatus, to: JobStatus) -> Result<(), StoreError> {
        if self.status == from {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            })
        }
    }

    fn mark_job_analyzing(&mut self) -> Result<(), StoreError> {
        self.expect_status(JobStatus::Pending, JobStatus::Analyzing)?;
        self.started_at.get_or_insert_with(Utc::now);
        self.status = JobStatus::Analyzing;
        Ok(())
    }

    fn mark_job_completed(&mut self, analysis: Analysis) -> Result<(), StoreError> {
        self.expect_status(JobStatus::Analyzing, JobStatus::Completed)?;
        self.result = Some(analysis);
        self.error_message = None;
        self.completed_at = Some(Utc::now());
        self.status = JobStatus::Completed;
        Ok(())
    }

    fn mark_job_retryable(&mut self, error: AttemptError) -> Result<(), StoreError> {
        self.expect_status(JobStatus::Analyzing, JobStatus::Pending)?;
        self.failures
            .push(error.into_attempt_failure(self.attempt()));
        self.retry_count += 1;
        self.error_message = None;
        self.status = JobStatus::Pending;
        Ok(())
    }

    fn mark_job_released(&mut self) -> Result<(), StoreError> {
        self.expect_status(JobStatus::Analyzing, JobStatus::Pending)?;
        self.status = JobStatus::Pending;
        Ok(())
    }

    fn mark_job_failed(&mut self, error: AttemptError) -> Result<(), StoreError> {
        self.expect_status(JobStatus::Analyzing, JobStatus::Failed)?;
        self.error_message = Some(error.message.clone());
        self.failures
            .push(error.into_attempt_failure(self.attempt()));
        self.retry_count += 1;
        self.completed_at = Some(Utc::now());
        self.status = JobStatus::Failed;
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, input: String) -> Result<JobId, StoreError> {
        if input.trim().is_empty() {
            return Err(StoreError::BlankInput);
        }
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let id = self.next_id();
        jobs.insert(id, JobRecord::new(id, input));
        Ok(id)
    }

    async fn mark_job_analyzing(&self, id: JobId) -> Result<JobRecord, StoreError> {
        self.update(id, |job| {
            job.mark_job_analyzing()?;
            Ok(job.clone())
        })
    }

    async fn mark_job_completed(&self, id: JobId, analysis: Analysis) -> Result<(), StoreError> {
        self.update(id, |job| job.mark_job_completed(analysis))
    }

    async fn mark_job_retryable(&self, id: JobId, error: AttemptError) -> Result<(), StoreError> {
        self.update(id, |job| job.mark_job_retryable(error))
    }

    async fn mark_job_failed(&self, id: JobId, error: AttemptError) -> Result<(), StoreError> {
        self.update(id, |job| job.mark_job_failed(error))
    }

    async fn mark_job_released(&self, id: JobId) -> Result<(), StoreError> {
        self.update(id, |job| job.mark_job_released())
    }

    async fn prune(&self, pruner: &Pruner) -> Result<usize, StoreError> {
        if !pruner.is_effective() {
            return Ok(0);
        }
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let before = jobs.len();
        match pruner.prune_by {
            PruneBy::MaxAge(age) => {
                let cutoff = Utc::now() - age;
                jobs.retain(|_, job| {
                    job.status != pruner.status
                        || job.completed_at.is_some_and(|completed| completed > cutoff)
                });
            }
            PruneBy::MaxLength(length) => {
                let mut finished = jobs
                    .values()
                    .filter(|job| job.status == pruner.status)
                    .map(|job| (job.completed_at, job.id))
                    .collect::<Vec<_>>();
                finished.sort_unstable_by(|a, b| b.cmp(a));
                finished.into_iter().skip(length).for_each(|(_, id)| {
                    jobs.remove(&id);
                });
            }
        }
        Ok(before - jobs.len())
    }

    async fn query(&self, query: Query) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .values()
            .filter(|job| query.matches(job))
            .cloned()
            .collect())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .get(&id)
            .cloned())
    }

    async fn pending_batch(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .values()
            .filter(|job| job.status == JobStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_suite;
    use assert_matches::assert_matches;

    test_suite!(for: InMemoryJobStore::new());

    #[tokio::test]
    async fn ids_are_not_reused_after_pruning() {
        let store = InMemoryJobStore::new();
        let first = store.enqueue("first".to_owned()).await.unwrap();
        store.mark_job_analyzing(first).await.unwrap();
        store
            .mark_job_completed(first, Analysis::mock_analysis())
            .await
            .unwrap();
        store
            .prune(&Pruner::max_length(0, JobStatus::Completed))
            .await
            .unwrap();

        let second = store.enqueue("second".to_owned()).await.unwrap();

        assert!(second > first);
        assert_matches!(store.get(first).await, Ok(None));
    }

    #[tokio::test]
    async fn pending_batch_skips_claimed_jobs_in_enqueue_order() {
        let store = InMemoryJobStore::new();
        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(store.enqueue(format!("Batch job {n} failed")).await.unwrap());
        }
        store.mark_job_analyzing(ids[0]).await.unwrap();
        store.mark_job_analyzing(ids[2]).await.unwrap();

        let batch = store.pending_batch(2).await.unwrap();

        let selected: Vec<_> = batch.iter().map(|job| job.id).collect();
        assert_eq!(selected, [ids[1], ids[3]]);
        assert!(store.pending_batch(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clones_share_records() {
        let store = InMemoryJobStore::new();
        let clone = store.clone();

        let id = store.enqueue("Timeout in GL posting".to_owned()).await.unwrap();

        assert_eq!(clone.get(id).await.unwrap().unwrap().input, "Timeout in GL posting");
    }

    #[tokio::test]
    async fn badstate_errors() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue("data".to_owned()).await.unwrap();
        let error = AttemptError {
            error_type: "custom",
            message: "Error Message".to_owned(),
        };

        tokio::task::spawn({
            let store = store.clone();
            async move {
                let _guard = store.jobs.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(
            store.enqueue("data".to_owned()).await,
            Err(StoreError::BadState)
        );
        assert_matches!(store.mark_job_analyzing(id).await, Err(StoreError::BadState));
        assert_matches!(
            store.mark_job_completed(id, Analysis::mock_analysis()).await,
            Err(StoreError::BadState)
        );
        assert_matches!(
            store.mark_job_retryable(id, error.clone()).await,
            Err(StoreError::BadState)
        );
        assert_matches!(
            store.mark_job_failed(id, error).await,
            Err(StoreError::BadState)
        );
        assert_matches!(store.mark_job_released(id).await, Err(StoreError::BadState));
        assert_matches!(
            store
                .prune(&Pruner::max_length(0, JobStatus::Failed))
                .await,
            Err(StoreError::BadState)
        );
        assert_matches!(store.get(id).await, Err(StoreError::BadState));
        assert_matches!(store.list_pending().await, Err(StoreError::BadState));
        assert_matches!(store.pending_batch(10).await, Err(StoreError::BadState));
    }
}
