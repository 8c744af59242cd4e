//! The supervisor loop selecting pending jobs and handing them to workers.
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    config::DispatcherConfig,
    job::JobStatus,
    limiter::{ConcurrencyLimiter, LimiterError},
    store::{JobStore, Query, StoreError},
    worker::AnalysisWorker,
};

/// A fault of a whole dispatch tick.
///
/// These never reach callers: the loop logs them and cools down before the next tick.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Failed to select or release jobs: {0}")]
    Store(#[from] StoreError),
    #[error("Failed to admit job: {0}")]
    Limiter(#[from] LimiterError),
    #[error("Worker task failed: {0}")]
    Worker(String),
}

pub(crate) struct DispatchLoop<S: JobStore> {
    store: Arc<S>,
    worker: AnalysisWorker<S>,
    limiter: ConcurrencyLimiter,
    config: DispatcherConfig,
}

impl<S> DispatchLoop<S>
where
    S: JobStore + 'static,
{
    pub(crate) fn new(
        store: Arc<S>,
        worker: AnalysisWorker<S>,
        limiter: ConcurrencyLimiter,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            worker,
            limiter,
            config,
        }
    }

    /// Runs ticks until `token` is cancelled.
    ///
    /// Cancellation is only observed between ticks, so every job claimed by a tick reaches
    /// `Pending`, `Completed` or `Failed` before the loop returns, unless the store refused every
    /// write for it.
    pub(crate) async fn run(self, token: CancellationToken) {
        loop {
            let pause = match self.tick().await {
                Ok(_) => self.config.tick_interval,
                Err(error) => {
                    tracing::error!(
                        ?error,
                        "Dispatch tick failed, resuming in {:?}: {error}",
                        self.config.fault_cooldown
                    );
                    self.config.fault_cooldown
                }
            };
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Dispatch loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Dispatches one batch of pending jobs and waits for all of them.
    ///
    /// Returns the number of jobs handed to a worker.
    #[instrument(skip(self))]
    pub(crate) async fn tick(&self) -> Result<usize, DispatchError> {
        self.release_orphans().await?;
        let batch = self.store.pending_batch(self.config.batch_size).await?;
        if batch.is_empty() {
            return Ok(0);
        }
        tracing::debug!("Dispatching {} pending jobs", batch.len());

        let handles = batch
            .into_iter()
            .map(|job| {
                let limiter = self.limiter.clone();
                let worker = self.worker.clone();
                tokio::spawn(async move {
                    let _slot = limiter.acquire().await?;
                    worker.process(job.id).await;
                    Ok::<_, DispatchError>(())
                })
            })
            .collect::<Vec<_>>();
        let count = handles.len();

        let mut fault = None;
        for result in futures::future::join_all(handles).await {
            let result = result
                .map_err(|err| DispatchError::Worker(err.to_string()))
                .and_then(|inner| inner);
            if let Err(error) = result {
                fault.get_or_insert(error);
            }
        }
        match fault {
            Some(error) => Err(error),
            None => Ok(count),
        }
    }

    /// Hands back jobs left analyzing by a worker that could not record their outcome.
    ///
    /// Every tick waits for all of its workers, so between ticks no worker owns a record.
    async fn release_orphans(&self) -> Result<(), DispatchError> {
        let orphans = self
            .store
            .query(Query::StatusEqual(JobStatus::Analyzing))
            .await?;
        for job in orphans {
            tracing::warn!(job_id = %job.id, "Releasing job {} left analyzing", job.id);
            self.store.mark_job_released(job.id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{sync::atomic::Ordering, time::Duration};

    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        analyzer::AnalysisError,
        job::JobId,
        store::memory::InMemoryJobStore,
        testing::{FlakyStore, ScriptedAnalyzer},
    };

    fn dispatch_loop<S: JobStore + 'static>(
        store: Arc<S>,
        analyzer: ScriptedAnalyzer,
        config: DispatcherConfig,
    ) -> DispatchLoop<S> {
        let worker = AnalysisWorker::new(store.clone(), Arc::new(analyzer), &config);
        let limiter = ConcurrencyLimiter::new(config.max_concurrency);
        DispatchLoop::new(store, worker, limiter, config)
    }

    async fn submit(store: &impl JobStore, count: usize) -> Vec<JobId> {
        let mut ids = Vec::new();
        for n in 0..count {
            ids.push(store.enqueue(format!("Batch job {n} failed")).await.unwrap());
        }
        ids
    }

    #[tokio::test]
    async fn empty_tick() {
        let store = Arc::new(InMemoryJobStore::new());
        let dispatch = dispatch_loop(store, ScriptedAnalyzer::new(), DispatcherConfig::new());

        assert_matches!(dispatch.tick().await, Ok(0));
    }

    #[tokio::test(start_paused = true)]
    async fn tick_processes_at_most_one_batch() {
        let store = Arc::new(InMemoryJobStore::new());
        let ids = submit(store.as_ref(), 4).await;
        let dispatch = dispatch_loop(
            store.clone(),
            ScriptedAnalyzer::new(),
            DispatcherConfig::new().with_batch_size(3),
        );

        assert_matches!(dispatch.tick().await, Ok(3));

        let pending = store.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, ids[3]);
        assert_matches!(dispatch.tick().await, Ok(1));
        assert_eq!(store.summary().await.unwrap().completed, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn never_more_than_max_concurrency_analyses() {
        let store = Arc::new(InMemoryJobStore::new());
        submit(store.as_ref(), 10).await;
        let analyzer = ScriptedAnalyzer::new().with_latency(Duration::from_secs(2));
        let dispatch = dispatch_loop(store.clone(), analyzer.clone(), DispatcherConfig::new());

        let tick = tokio::spawn(async move { dispatch.tick().await });
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let analyzing = store
                .query(Query::StatusEqual(JobStatus::Analyzing))
                .await
                .unwrap();
            assert!(analyzing.len() <= 3);
        }

        assert_matches!(tick.await, Ok(Ok(10)));
        assert_eq!(analyzer.peak_concurrency(), 3);
        assert_eq!(analyzer.calls(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_keeps_the_slot() {
        let store = Arc::new(InMemoryJobStore::new());
        let ids = submit(store.as_ref(), 2).await;
        let analyzer = ScriptedAnalyzer::new().with_script(
            "Batch job 0 failed",
            [AnalysisError::Unavailable("503".to_owned()).into()],
        );
        let dispatch = dispatch_loop(
            store.clone(),
            analyzer,
            DispatcherConfig::new().with_max_concurrency(1),
        );
        let limiter = dispatch.limiter.clone();
        let tick = tokio::spawn(async move { dispatch.tick().await });

        tokio::time::sleep(Duration::from_secs(2)).await;
        let first = store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(first.status, JobStatus::Pending);
        assert_eq!(first.retry_count, 1);
        let second = store.get(ids[1]).await.unwrap().unwrap();
        assert_eq!(second.status, JobStatus::Pending);
        assert!(second.started_at.is_none());
        assert_eq!(limiter.in_use(), 1);

        assert_matches!(tick.await, Ok(Ok(2)));
        let second = store.get(ids[1]).await.unwrap().unwrap();
        assert_eq!(second.status, JobStatus::Completed);
        assert_eq!(limiter.in_use(), 0);
    }

    #[tokio::test]
    async fn closed_limiter_is_a_loop_fault() {
        let store = Arc::new(InMemoryJobStore::new());
        let ids = submit(store.as_ref(), 1).await;
        let dispatch =
            dispatch_loop(store.clone(), ScriptedAnalyzer::new(), DispatcherConfig::new());
        dispatch.limiter.close();

        assert_matches!(
            dispatch.tick().await,
            Err(DispatchError::Limiter(LimiterError::Closed))
        );
        let job = store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_resumes_after_selection_fault() {
        let store = Arc::new(FlakyStore::default().failing_selections(1));
        let ids = submit(store.as_ref(), 2).await;
        let config = DispatcherConfig::new();
        let dispatch = dispatch_loop(store.clone(), ScriptedAnalyzer::new(), config.clone());
        let token = CancellationToken::new();
        let handle = tokio::spawn(dispatch.run(token.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.selections.load(Ordering::SeqCst), 1);
        assert_eq!(store.summary().await.unwrap().pending, 2);

        tokio::time::sleep(config.fault_cooldown).await;
        assert_eq!(store.selections.load(Ordering::SeqCst), 2);
        for id in ids {
            let job = store.get(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn loop_keeps_polling_for_new_jobs() {
        let store = Arc::new(InMemoryJobStore::new());
        let config = DispatcherConfig::new();
        let dispatch = dispatch_loop(store.clone(), ScriptedAnalyzer::new(), config.clone());
        let token = CancellationToken::new();
        let handle = tokio::spawn(dispatch.run(token.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let id = store.enqueue("Late arrival".to_owned()).await.unwrap();
        tokio::time::sleep(config.tick_interval).await;

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_waits_for_the_running_tick() {
        let store = Arc::new(InMemoryJobStore::new());
        let ids = submit(store.as_ref(), 2).await;
        let analyzer = ScriptedAnalyzer::new().with_latency(Duration::from_secs(30));
        let dispatch = dispatch_loop(store.clone(), analyzer, DispatcherConfig::new());
        let token = CancellationToken::new();
        let handle = tokio::spawn(dispatch.run(token.clone()));

        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        handle.await.unwrap();

        for id in ids {
            let job = store.get(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tick_releases_jobs_left_analyzing() {
        let store = Arc::new(InMemoryJobStore::new());
        let ids = submit(store.as_ref(), 2).await;
        store.mark_job_analyzing(ids[0]).await.unwrap();
        let analyzer = ScriptedAnalyzer::new();
        let dispatch = dispatch_loop(store.clone(), analyzer.clone(), DispatcherConfig::new());

        assert_matches!(dispatch.tick().await, Ok(2));

        for id in ids {
            let job = store.get(id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Completed);
            assert_eq!(job.retry_count, 0);
        }
        assert_eq!(analyzer.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unrecorded_completion_is_analyzed_again() {
        let store = Arc::new(FlakyStore::default().failing_completions(4));
        let ids = submit(store.as_ref(), 1).await;
        let analyzer = ScriptedAnalyzer::new();
        let dispatch = dispatch_loop(store.clone(), analyzer.clone(), DispatcherConfig::new());
        let token = CancellationToken::new();
        let handle = tokio::spawn(dispatch.run(token.clone()));

        tokio::time::sleep(Duration::from_secs(3600)).await;

        let job = store.get(ids[0]).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 0);
        assert!(store.list_pending().await.unwrap().is_empty());
        assert_eq!(store.completions.load(Ordering::SeqCst), 5);
        assert_eq!(analyzer.calls(), 2);

        token.cancel();
        handle.await.unwrap();
    }
}
