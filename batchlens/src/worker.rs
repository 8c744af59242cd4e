//! Runs one analysis attempt for a job and applies the retry policy.
use std::{future::Future, sync::Arc, time::Duration};

use tokio::task::JoinError;
use tracing::{instrument, Instrument};

use crate::{
    analyzer::{Analysis, AnalysisError, Analyzer},
    backoff::{BackoffStrategy, Strategy},
    config::DispatcherConfig,
    job::JobId,
    store::{AttemptError, JobStore, StoreError},
};

/// How often the worker tries to record the outcome of an attempt before giving up on it.
const RECORD_ATTEMPTS: u32 = 3;
const RECORD_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How a single [`AnalysisWorker::process`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// The job could not be claimed, e.g. because it is no longer pending.
    Skipped,
    Completed,
    /// The attempt failed and the job is pending again.
    Retried,
    /// The final attempt failed.
    Failed,
    /// The outcome could not be recorded. The job was handed back as pending if possible,
    /// otherwise the next dispatch tick releases it.
    Unrecorded,
}

/// Moves a pending job through one analysis attempt.
///
/// The worker claims the job (`Pending -> Analyzing`), calls the [`Analyzer`] and records the
/// outcome. When the attempt fails and retries remain, the job is put back to pending and the
/// worker waits for the backoff before returning, so a caller holding a
/// [`crate::limiter::Slot`] keeps it for the whole delay.
///
/// A write the store rejects with a bad state is retried a few times. If the outcome still cannot
/// be recorded, the job is released back to pending without counting the attempt.
pub struct AnalysisWorker<S: JobStore> {
    store: Arc<S>,
    analyzer: Arc<dyn Analyzer>,
    max_retries: u32,
    backoff: BackoffStrategy,
    timeout: Option<Duration>,
}

impl<S> Clone for AnalysisWorker<S>
where
    S: JobStore,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            analyzer: self.analyzer.clone(),
            max_retries: self.max_retries,
            backoff: self.backoff,
            timeout: self.timeout,
        }
    }
}

impl<S> AnalysisWorker<S>
where
    S: JobStore + 'static,
{
    pub fn new(store: Arc<S>, analyzer: Arc<dyn Analyzer>, config: &DispatcherConfig) -> Self {
        Self {
            store,
            analyzer,
            max_retries: config.max_retries,
            backoff: config.backoff,
            timeout: config.analysis_timeout,
        }
    }

    #[instrument(skip_all, fields(%job_id))]
    pub async fn process(&self, job_id: JobId) -> WorkOutcome {
        let job = match self.store.mark_job_analyzing(job_id).await {
            Ok(job) => job,
            Err(err) => {
                tracing::warn!(?err, "Could not claim job {job_id}, skipping: {err}");
                return WorkOutcome::Skipped;
            }
        };
        tracing::debug!(attempt = job.attempt(), "Analyzing job {job_id}");

        match self.analyze(job.input).await {
            Ok(analysis) => self.handle_job_complete(job_id, analysis).await,
            Err(error) => {
                self.handle_job_error(job_id, job.retry_count + 1, error)
                    .await
            }
        }
    }

    async fn analyze(&self, input: String) -> Result<Analysis, AnalysisError> {
        let analyzer = self.analyzer.clone();
        let timeout = self.timeout;
        let call = async move {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, analyzer.analyze(&input))
                    .await
                    .unwrap_or_else(|_elapsed| Err(AnalysisError::Timeout(limit))),
                None => analyzer.analyze(&input).await,
            }
        };
        tokio::spawn(call.in_current_span())
            .await
            .unwrap_or_else(|error| Err(error.into()))
    }

    async fn handle_job_complete(&self, job_id: JobId, analysis: Analysis) -> WorkOutcome {
        tracing::debug!(category = %analysis.category, "Job {job_id} complete");
        let recorded = self
            .record(job_id, "completed", || {
                self.store.mark_job_completed(job_id, analysis.clone())
            })
            .await;
        match recorded {
            Ok(()) => WorkOutcome::Completed,
            Err(_) => self.release(job_id).await,
        }
    }

    async fn handle_job_error(
        &self,
        job_id: JobId,
        retry_count: u32,
        error: AnalysisError,
    ) -> WorkOutcome {
        let error = AttemptError::from(error);
        if retry_count >= self.max_retries {
            tracing::error!(
                retry_count,
                error_type = error.error_type,
                "Job {job_id} failed and will not be retried: {}",
                error.message
            );
            let recorded = self
                .record(job_id, "failed", || {
                    self.store.mark_job_failed(job_id, error.clone())
                })
                .await;
            match recorded {
                Ok(()) => WorkOutcome::Failed,
                Err(_) => self.release(job_id).await,
            }
        } else {
            let delay = self.backoff.backoff(retry_count);
            tracing::warn!(
                retry_count,
                error_type = error.error_type,
                "Job {job_id} failed and will be retried in {delay:?}: {}",
                error.message
            );
            let recorded = self
                .record(job_id, "retryable", || {
                    self.store.mark_job_retryable(job_id, error.clone())
                })
                .await;
            if recorded.is_err() {
                return self.release(job_id).await;
            }
            tokio::time::sleep(delay).await;
            WorkOutcome::Retried
        }
    }

    /// Hand a claimed job back as pending after its outcome could not be recorded.
    async fn release(&self, job_id: JobId) -> WorkOutcome {
        let _ = self
            .record(job_id, "released", || self.store.mark_job_released(job_id))
            .await;
        WorkOutcome::Unrecorded
    }

    /// Runs a store write, retrying it while the store reports a bad state.
    async fn record<F, Fut>(&self, job_id: JobId, status: &str, write: F) -> Result<(), StoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        let mut attempt = 1;
        loop {
            let result = write().await.inspect_err(|err| {
                tracing::error!(
                    ?err,
                    attempt,
                    "Failed to mark job {job_id} as {status}, error: {err}"
                )
            });
            match result {
                Err(StoreError::BadState) if attempt < RECORD_ATTEMPTS => {
                    attempt += 1;
                    tokio::time::sleep(RECORD_RETRY_DELAY).await;
                }
                result => return result,
            }
        }
    }
}

impl From<JoinError> for AnalysisError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::Panicked(message)
    }
}
