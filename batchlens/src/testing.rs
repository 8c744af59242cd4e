//! Helpers for testing code built on batchlens.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::analyzer::{Analysis, AnalysisError, Analyzer};

/// What a [`ScriptedAnalyzer`] does for one call.
#[derive(Debug, Clone)]
pub enum Outcome {
    Succeed(Analysis),
    Fail(AnalysisError),
    Panic(String),
}

impl From<Analysis> for Outcome {
    fn from(value: Analysis) -> Self {
        Self::Succeed(value)
    }
}

impl From<AnalysisError> for Outcome {
    fn from(value: AnalysisError) -> Self {
        Self::Fail(value)
    }
}

#[derive(Debug, Default)]
struct Script {
    default: Option<Outcome>,
    by_input: HashMap<String, VecDeque<Outcome>>,
    calls: Vec<String>,
}

/// A fake [`Analyzer`] returning scripted outcomes.
///
/// Outcomes scripted for an input are used in order; the last one keeps being returned once the
/// rest are used up. Inputs with no script get the default outcome, which succeeds with a generic
/// analysis unless set with [`ScriptedAnalyzer::with_default`].
///
/// The analyzer also records every call and the highest number of calls that were in flight at
/// the same time.
///
/// # Example
///
/// ```
/// # use batchlens::prelude::*;
/// # use batchlens::testing::ScriptedAnalyzer;
/// # use std::time::Duration;
/// # tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap().block_on(async {
/// let analyzer = ScriptedAnalyzer::new()
///     .with_latency(Duration::from_millis(1))
///     .with_script(
///         "ORA-00060: deadlock detected",
///         [AnalysisError::Unavailable("503".to_owned()).into()],
///     );
///
/// assert!(analyzer.analyze("ORA-00060: deadlock detected").await.is_err());
/// assert!(analyzer.analyze("Disk quota exceeded").await.is_ok());
/// assert_eq!(analyzer.calls(), 2);
/// # });
/// ```
#[derive(Debug, Clone, Default)]
pub struct ScriptedAnalyzer {
    script: Arc<Mutex<Script>>,
    latency: Duration,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

impl ScriptedAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call waits this long before returning its outcome.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_default(self, outcome: impl Into<Outcome>) -> Self {
        self.lock().default = Some(outcome.into());
        self
    }

    pub fn with_script(
        self,
        input: impl Into<String>,
        outcomes: impl IntoIterator<Item = Outcome>,
    ) -> Self {
        self.lock()
            .by_input
            .insert(input.into(), outcomes.into_iter().collect());
        self
    }

    /// A fake that fails every call with the given error.
    pub fn failing(error: AnalysisError) -> Self {
        Self::new().with_default(error)
    }

    /// Total number of calls made so far.
    pub fn calls(&self) -> usize {
        self.lock().calls.len()
    }

    /// Number of calls made so far with the given input.
    pub fn calls_for(&self, input: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.as_str() == input)
            .count()
    }

    /// The highest number of calls that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_outcome(&self, description: &str) -> Outcome {
        let mut script = self.lock();
        script.calls.push(description.to_owned());
        let scripted = script.by_input.get_mut(description).and_then(|outcomes| {
            if outcomes.len() > 1 {
                outcomes.pop_front()
            } else {
                outcomes.front().cloned()
            }
        });
        scripted
            .or_else(|| script.default.clone())
            .unwrap_or_else(|| Outcome::Succeed(generic_analysis(description)))
    }
}

fn generic_analysis(description: &str) -> Analysis {
    Analysis {
        category: "Unclassified".to_owned(),
        severity: "Medium".to_owned(),
        explanation: format!("No specific explanation available for: {description}"),
        suggestions: vec!["Check the batch job logs".to_owned()],
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Analyzer for ScriptedAnalyzer {
    async fn analyze(&self, description: &str) -> Result<Analysis, AnalysisError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);

        let outcome = self.next_outcome(description);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match outcome {
            Outcome::Succeed(analysis) => Ok(analysis),
            Outcome::Fail(error) => Err(error),
            Outcome::Panic(message) => panic!("{message}"),
        }
    }
}

/// A macro for making assertions about the records held by a job store.
///
/// Assertions can be based on status, id and creation or completion time. Without a count the
/// macro asserts that at least one record matches.
///
/// # Example
///
/// ```
/// # use batchlens::prelude::*;
/// # use batchlens::assert_jobs;
/// # use chrono::Utc;
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// use batchlens::store::memory::InMemoryJobStore;
/// let store = InMemoryJobStore::new();
///
/// let id = store.enqueue("Posting period closed".to_owned()).await.unwrap();
/// store.enqueue("Lock wait timeout".to_owned()).await.unwrap();
///
/// assert_jobs!(in: store, with_id: id, with_status: JobStatus::Pending);
/// assert_jobs!(2 jobs, in: store, with_status: JobStatus::Pending);
/// assert_jobs!(0 jobs, in: store, with_status: JobStatus::Completed);
/// assert_jobs!(2 jobs, in: store, created_before: Utc::now());
/// # });
/// ```
#[macro_export]
macro_rules! assert_jobs {
    (1 job, in: $store:expr, $($tail:tt)*) => {
        $crate::assert_jobs!(@internal 1 in: $store, $($tail)*);
    };
    ($n:literal jobs, in: $store:expr, $($tail:tt)*) => {
        $crate::assert_jobs!(@internal $n in: $store, $($tail)*);
    };
    (in: $store:expr, $($tail:tt)*) => {{
        use $crate::store::{JobStore, Query};
        let mut queries = Vec::new();
        $crate::assert_jobs!(@query queries; $($tail)*);
        let jobs = $store.query(Query::And(queries)).await.unwrap();
        let all_jobs = $store.query(Query::All).await.unwrap();
        assert!(
            !jobs.is_empty(),
            "No jobs matching {}\n\nAll jobs:\n{all_jobs:#?}",
            stringify!($($tail)*)
        );
    }};
    (@internal $n:literal in: $store:expr, $($tail:tt)*) => {{
        use $crate::store::{JobStore, Query};
        let mut queries = Vec::new();
        $crate::assert_jobs!(@query queries; $($tail)*);
        let jobs = $store.query(Query::And(queries)).await.unwrap();
        let all_jobs = $store.query(Query::All).await.unwrap();
        assert!(
            jobs.len() == $n,
            "Unexpected number of jobs matching {},\n\n\
            Expected {} jobs, found {}:\n\n\
            Matching jobs:\n\
            {jobs:#?}\n\n\
            All jobs:\n\
            {all_jobs:#?}",
            stringify!($($tail)*),
            $n,
            jobs.len(),
        );
    }};
    (@query $vec:ident; with_status: $status:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::StatusEqual($status));
        $($crate::assert_jobs!(@query $vec; $($tail)*);)?
    };
    (@query $vec:ident; with_id: $id:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::IdEquals($id));
        $($crate::assert_jobs!(@query $vec; $($tail)*);)?
    };
    (@query $vec:ident; created_before: $at:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::CreatedBefore($at));
        $($crate::assert_jobs!(@query $vec; $($tail)*);)?
    };
    (@query $vec:ident; completed_before: $at:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::CompletedBefore($at));
        $($crate::assert_jobs!(@query $vec; $($tail)*);)?
    };
    (@query $vec:ident;) => {};
}

pub use assert_jobs;

/// An [`InMemoryJobStore`](crate::store::memory::InMemoryJobStore) whose first selections or
/// completion writes fail with [`StoreError::BadState`](crate::store::StoreError::BadState).
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FlakyStore {
    pub(crate) inner: crate::store::memory::InMemoryJobStore,
    selection_faults: AtomicUsize,
    completion_faults: AtomicUsize,
    pub(crate) selections: AtomicUsize,
    pub(crate) completions: AtomicUsize,
}

#[cfg(test)]
mod flaky {
    use super::*;
    use crate::{
        job::{JobId, JobRecord},
        pruner::Pruner,
        store::{AttemptError, JobStore, Query, StoreError},
    };

    impl FlakyStore {
        pub(crate) fn failing_selections(self, faults: usize) -> Self {
            self.selection_faults.store(faults, Ordering::SeqCst);
            self
        }

        pub(crate) fn failing_completions(self, faults: usize) -> Self {
            self.completion_faults.store(faults, Ordering::SeqCst);
            self
        }
    }

    fn take_fault(faults: &AtomicUsize) -> Result<(), StoreError> {
        match faults.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Err(StoreError::BadState),
            Err(_) => Ok(()),
        }
    }

    #[async_trait]
    impl JobStore for FlakyStore {
        async fn enqueue(&self, input: String) -> Result<JobId, StoreError> {
            self.inner.enqueue(input).await
        }
        async fn mark_job_analyzing(&self, id: JobId) -> Result<JobRecord, StoreError> {
            self.inner.mark_job_analyzing(id).await
        }
        async fn mark_job_completed(
            &self,
            id: JobId,
            analysis: Analysis,
        ) -> Result<(), StoreError> {
            self.completions.fetch_add(1, Ordering::SeqCst);
            take_fault(&self.completion_faults)?;
            self.inner.mark_job_completed(id, analysis).await
        }
        async fn mark_job_retryable(
            &self,
            id: JobId,
            error: AttemptError,
        ) -> Result<(), StoreError> {
            self.inner.mark_job_retryable(id, error).await
        }
        async fn mark_job_failed(&self, id: JobId, error: AttemptError) -> Result<(), StoreError> {
            self.inner.mark_job_failed(id, error).await
        }
        async fn mark_job_released(&self, id: JobId) -> Result<(), StoreError> {
            self.inner.mark_job_released(id).await
        }
        async fn prune(&self, pruner: &Pruner) -> Result<usize, StoreError> {
            self.inner.prune(pruner).await
        }
        async fn query(&self, query: Query) -> Result<Vec<JobRecord>, StoreError> {
            self.inner.query(query).await
        }
        async fn pending_batch(&self, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
            self.selections.fetch_add(1, Ordering::SeqCst);
            take_fault(&self.selection_faults)?;
            self.inner.pending_batch(limit).await
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        job::JobStatus,
        store::{memory::InMemoryJobStore, JobStore},
    };
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn scripted_outcomes_are_used_in_order() {
        let analyzer = ScriptedAnalyzer::new().with_script(
            "flaky",
            [
                AnalysisError::Unavailable("first".to_owned()).into(),
                Analysis::mock_analysis().into(),
            ],
        );

        assert_matches!(
            analyzer.analyze("flaky").await,
            Err(AnalysisError::Unavailable(message)) if message == "first"
        );
        assert_eq!(analyzer.analyze("flaky").await, Ok(Analysis::mock_analysis()));
        assert_eq!(analyzer.analyze("flaky").await, Ok(Analysis::mock_analysis()));
        assert_eq!(analyzer.calls_for("flaky"), 3);
    }

    #[tokio::test]
    async fn default_outcome() {
        let analyzer =
            ScriptedAnalyzer::failing(AnalysisError::Rejected("invalid key".to_owned()));

        assert_matches!(
            analyzer.analyze("anything").await,
            Err(AnalysisError::Rejected(_))
        );

        let analysis = ScriptedAnalyzer::new().analyze("disk full").await.unwrap();
        assert_eq!(analysis.category, "Unclassified");
        assert!(analysis.explanation.contains("disk full"));
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_peak_concurrency() {
        let analyzer = ScriptedAnalyzer::new().with_latency(Duration::from_secs(1));

        futures::future::join_all((0..4).map(|n| {
            let analyzer = analyzer.clone();
            async move { analyzer.analyze(&format!("error {n}")).await }
        }))
        .await;
        analyzer.analyze("alone").await.unwrap();

        assert_eq!(analyzer.peak_concurrency(), 4);
        assert_eq!(analyzer.calls(), 5);
    }

    #[tokio::test]
    async fn assert_jobs() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue("data".to_owned()).await.unwrap();
        store.enqueue("data2".to_owned()).await.unwrap();
        store.mark_job_analyzing(id).await.unwrap();

        assert_jobs!(in: store, with_status: JobStatus::Analyzing);
        assert_jobs!(1 job, in: store, with_id: id, with_status: JobStatus::Analyzing,);
        assert_jobs!(1 job, in: store, with_status: JobStatus::Pending);
        assert_jobs!(0 jobs, in: store, with_status: JobStatus::Failed);
        assert_jobs!(
            0 jobs,
            in: store,
            completed_before: chrono::Utc::now()
        );
    }
}
