//! The types most applications need, for a glob import.
pub use crate::{
    analyzer::{Analysis, AnalysisError, Analyzer},
    backoff::{BackoffStrategy, Jitter, Strategy},
    config::DispatcherConfig,
    job::{AttemptFailure, JobId, JobRecord, JobStatus},
    limiter::ConcurrencyLimiter,
    pruner::{Pruner, RetentionPolicy},
    store::{JobStore, Query, StatusSummary},
    Batchlens, BatchlensError, BatchlensHandle,
};
