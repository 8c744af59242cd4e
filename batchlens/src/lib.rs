//! Background analysis of ERP batch-job errors.
//!
//! Error descriptions are submitted to a [`BatchlensHandle`] and stored as [`JobRecord`]s in a
//! [`JobStore`]. A dispatch loop periodically selects the oldest pending records and hands each
//! one to a worker that asks an [`Analyzer`] to classify the error. Failed analyses are retried
//! with a backoff until the configured number of attempts has been used up.
//!
//! At most [`DispatcherConfig::max_concurrency`] analyses run at the same time. Callers never
//! wait for an analysis: they poll the record with [`BatchlensHandle::get`].
//!
//! # Example
//!
//! ```
//! # use batchlens::prelude::*;
//! # use batchlens::{store::memory::InMemoryJobStore, testing::ScriptedAnalyzer};
//! # use std::time::Duration;
//! # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
//! let handle = Batchlens::new(InMemoryJobStore::new(), ScriptedAnalyzer::new())
//!     .with_config(DispatcherConfig::new().with_tick_interval(Duration::from_millis(10)))
//!     .spawn();
//!
//! let id = handle.submit("ORA-01555: snapshot too old").await.unwrap();
//! assert_eq!(handle.get(id).await.unwrap().status, JobStatus::Pending);
//!
//! tokio::time::sleep(Duration::from_millis(50)).await;
//! assert_eq!(handle.get(id).await.unwrap().status, JobStatus::Completed);
//!
//! handle.graceful_shutdown().await.unwrap();
//! # });
//! ```
use std::sync::Arc;

pub mod analyzer;
pub mod backoff;
pub mod config;
mod dispatch;
pub mod job;
pub mod limiter;
pub mod prelude;
pub mod pruner;
pub mod store;
pub mod testing;
pub mod worker;

use analyzer::Analyzer;
use config::DispatcherConfig;
use dispatch::DispatchLoop;
use job::{JobId, JobRecord};
use limiter::ConcurrencyLimiter;
use pruner::{runner::PrunerRunner, RetentionPolicy};
use store::{JobStore, StatusSummary, StoreError};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use worker::AnalysisWorker;

pub use dispatch::DispatchError;

/// Builder for the dispatcher. Call [`Batchlens::spawn`] to start it.
pub struct Batchlens<S: JobStore> {
    store: Arc<S>,
    analyzer: Arc<dyn Analyzer>,
    config: DispatcherConfig,
    retention: Option<RetentionPolicy>,
}

impl<S> std::fmt::Debug for Batchlens<S>
where
    S: JobStore + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batchlens")
            .field("store", &self.store)
            .field("config", &self.config)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}

impl<S> Batchlens<S>
where
    S: JobStore + 'static,
{
    pub fn new(store: S, analyzer: impl Analyzer + 'static) -> Self {
        Self {
            store: Arc::new(store),
            analyzer: Arc::new(analyzer),
            config: DispatcherConfig::new(),
            retention: None,
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Periodically remove finished records, see [`crate::pruner`].
    pub fn with_retention(mut self, policy: RetentionPolicy) -> Self {
        self.retention = Some(policy);
        self
    }

    /// Start the dispatch loop, and the pruner if one was configured, on the current tokio
    /// runtime.
    ///
    /// The background tasks run until [`BatchlensHandle::graceful_shutdown`] is called. Dropping
    /// the handle leaves them running for the rest of the process.
    pub fn spawn(self) -> BatchlensHandle<S> {
        let Self {
            store,
            analyzer,
            config,
            retention,
        } = self;
        let token = CancellationToken::new();
        let limiter = ConcurrencyLimiter::new(config.max_concurrency);

        let worker = AnalysisWorker::new(store.clone(), analyzer, &config);
        tracing::info!(
            max_concurrency = config.max_concurrency,
            batch_size = config.batch_size,
            max_retries = config.max_retries,
            "Starting batchlens dispatcher, polling every {:?}",
            config.tick_interval
        );
        let dispatch = DispatchLoop::new(store.clone(), worker, limiter.clone(), config);
        let mut tasks = vec![tokio::spawn(dispatch.run(token.clone()))];

        if let Some(policy) = retention {
            tasks.push(PrunerRunner::new(store.clone(), policy).spawn(token.clone()));
        }

        BatchlensHandle {
            store,
            limiter,
            token,
            tasks,
        }
    }
}

/// Entry point for callers of a running dispatcher.
#[derive(Debug)]
pub struct BatchlensHandle<S: JobStore> {
    store: Arc<S>,
    limiter: ConcurrencyLimiter,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl<S> BatchlensHandle<S>
where
    S: JobStore,
{
    /// Register an error description for analysis.
    ///
    /// Returns as soon as the record is stored; the analysis happens in the background.
    pub async fn submit(&self, description: impl Into<String>) -> Result<JobId, BatchlensError> {
        let id = self.store.enqueue(description.into()).await?;
        tracing::debug!("Submitted job {id}");
        Ok(id)
    }

    /// The current state of a record.
    pub async fn get(&self, id: JobId) -> Result<JobRecord, BatchlensError> {
        self.store
            .get(id)
            .await?
            .ok_or(BatchlensError::JobNotFound(id))
    }

    /// All records that are pending or being analyzed, oldest first.
    pub async fn list_pending(&self) -> Result<Vec<JobRecord>, BatchlensError> {
        Ok(self.store.list_pending().await?)
    }

    pub async fn summary(&self) -> Result<StatusSummary, BatchlensError> {
        Ok(self.store.summary().await?)
    }

    /// The limiter bounding concurrent analyses, e.g. to report how many slots are in use.
    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Stop the background tasks.
    ///
    /// No new dispatch tick is started once this is called. A tick that is already running is
    /// awaited, including the backoff of any job it retries, so no record is left analyzing.
    pub async fn graceful_shutdown(self) -> Result<(), BatchlensError> {
        tracing::info!("Shutting down batchlens");
        self.token.cancel();
        futures::future::join_all(self.tasks)
            .await
            .into_iter()
            .try_for_each(|result| {
                result.map_err(|err| {
                    tracing::error!(?err, "Background task failed during shutdown: {err}");
                    BatchlensError::GracefulShutdownFailed
                })
            })
    }
}

#[derive(Debug, Error)]
pub enum BatchlensError {
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Error description must not be blank")]
    BlankDescription,
    #[error("Error communicating with the job store: {0}")]
    Store(#[source] StoreError),
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}

impl From<StoreError> for BatchlensError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::JobNotFound(id) => Self::JobNotFound(id),
            StoreError::BlankInput => Self::BlankDescription,
            error => Self::Store(error),
        }
    }
}
