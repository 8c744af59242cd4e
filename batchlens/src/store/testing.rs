//! Test suite for ensuring a correct implementation of a job store.
use chrono::TimeDelta;

use super::*;

impl Analysis {
    #[doc(hidden)]
    pub fn mock_analysis() -> Self {
        Self {
            category: "Code Defect".to_owned(),
            severity: "High".to_owned(),
            explanation: "A null reference was dereferenced".to_owned(),
            suggestions: vec!["Guard the lookup result".to_owned()],
        }
    }
}

fn mock_error() -> AttemptError {
    AttemptError {
        error_type: "custom",
        message: "Analyzer unavailable".to_owned(),
    }
}

/// Create test suite for batchlens job stores.
///
/// For store implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// # use batchlens::prelude::*;
/// use batchlens::test_suite;
/// use batchlens::store::memory::InMemoryJobStore;
/// test_suite!(for: InMemoryJobStore::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead:
///
/// ```ignore
/// use batchlens::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     store: StoreImplementation::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $store:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        #[$attr]
        async fn enqueue $args {
          let store = $store;
          $crate::store::testing::enqueue(store).await;
        }
        #[$attr]
        async fn enqueue_assigns_unique_ids $args {
          let store = $store;
          $crate::store::testing::enqueue_assigns_unique_ids(store).await;
        }
        #[$attr]
        async fn enqueue_rejects_blank_input $args {
          let store = $store;
          $crate::store::testing::enqueue_rejects_blank_input(store).await;
        }
        #[$attr]
        async fn get_unknown_job $args {
          let store = $store;
          $crate::store::testing::get_unknown_job(store).await;
        }
        #[$attr]
        async fn list_pending_returns_unfinished_jobs_oldest_first $args {
          let store = $store;
          $crate::store::testing::list_pending_returns_unfinished_jobs_oldest_first(store).await;
        }
        #[$attr]
        async fn pending_batch_selects_oldest_pending $args {
          let store = $store;
          $crate::store::testing::pending_batch_selects_oldest_pending(store).await;
        }
        #[$attr]
        async fn mark_job_analyzing $args {
          let store = $store;
          $crate::store::testing::mark_job_analyzing(store).await;
        }
        #[$attr]
        async fn mark_job_analyzing_only_claims_pending_jobs $args {
          let store = $store;
          $crate::store::testing::mark_job_analyzing_only_claims_pending_jobs(store).await;
        }
        #[$attr]
        async fn mark_job_analyzing_keeps_first_started_at $args {
          let store = $store;
          $crate::store::testing::mark_job_analyzing_keeps_first_started_at(store).await;
        }
        #[$attr]
        async fn mark_job_completed $args {
          let store = $store;
          $crate::store::testing::mark_job_completed(store).await;
        }
        #[$attr]
        async fn mark_job_retryable $args {
          let store = $store;
          $crate::store::testing::mark_job_retryable(store).await;
        }
        #[$attr]
        async fn mark_job_failed $args {
          let store = $store;
          $crate::store::testing::mark_job_failed(store).await;
        }
        #[$attr]
        async fn mark_job_released $args {
          let store = $store;
          $crate::store::testing::mark_job_released(store).await;
        }
        #[$attr]
        async fn mark_unknown_job $args {
          let store = $store;
          $crate::store::testing::mark_unknown_job(store).await;
        }
        #[$attr]
        async fn summary $args {
          let store = $store;
          $crate::store::testing::summary(store).await;
        }
        #[$attr]
        async fn prune_max_age $args {
          let store = $store;
          $crate::store::testing::prune_max_age(store).await;
        }
        #[$attr]
        async fn prune_max_length $args {
          let store = $store;
          $crate::store::testing::prune_max_length(store).await;
        }
        #[$attr]
        async fn prune_never_removes_unfinished_jobs $args {
          let store = $store;
          $crate::store::testing::prune_never_removes_unfinished_jobs(store).await;
        }
    };
}

pub async fn enqueue(store: impl JobStore) {
    let id = store
        .enqueue("NullReferenceException at Foo.Bar".to_owned())
        .await
        .unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.input, "NullReferenceException at Foo.Bar");
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);
    assert!(job.result.is_none());
    assert!(job.error_message.is_none());
    assert!(job.started_at.is_none());
    assert!(job.completed_at.is_none());
    assert!(job.failures.is_empty());
}

pub async fn enqueue_assigns_unique_ids(store: impl JobStore) {
    let mut ids = Vec::new();
    for n in 0..20 {
        ids.push(store.enqueue(format!("error {n}")).await.unwrap());
    }
    let mut deduplicated = ids.clone();
    deduplicated.sort();
    deduplicated.dedup();

    assert_eq!(deduplicated.len(), ids.len());
}

pub async fn enqueue_rejects_blank_input(store: impl JobStore) {
    assert!(matches!(
        store.enqueue(String::new()).await,
        Err(StoreError::BlankInput)
    ));
    assert!(matches!(
        store.enqueue(" \n\t".to_owned()).await,
        Err(StoreError::BlankInput)
    ));
    assert_eq!(store.summary().await.unwrap().total(), 0);
}

pub async fn get_unknown_job(store: impl JobStore) {
    assert!(store.get(JobId::from(404)).await.unwrap().is_none());
}

pub async fn list_pending_returns_unfinished_jobs_oldest_first(store: impl JobStore) {
    let pending = store.enqueue("pending".to_owned()).await.unwrap();
    let analyzing = store.enqueue("analyzing".to_owned()).await.unwrap();
    let completed = store.enqueue("completed".to_owned()).await.unwrap();
    let failed = store.enqueue("failed".to_owned()).await.unwrap();
    let newest = store.enqueue("newest".to_owned()).await.unwrap();

    store.mark_job_analyzing(analyzing).await.unwrap();
    store.mark_job_analyzing(completed).await.unwrap();
    store
        .mark_job_completed(completed, Analysis::mock_analysis())
        .await
        .unwrap();
    store.mark_job_analyzing(failed).await.unwrap();
    store.mark_job_failed(failed, mock_error()).await.unwrap();

    let jobs = store.list_pending().await.unwrap();

    assert_eq!(
        jobs.iter().map(|job| job.id).collect::<Vec<_>>(),
        vec![pending, analyzing, newest]
    );
    assert!(jobs.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    assert!(jobs.iter().all(|job| job.status.is_pending()));
}

pub async fn pending_batch_selects_oldest_pending(store: impl JobStore) {
    let mut ids = Vec::new();
    for n in 0..12 {
        ids.push(store.enqueue(format!("error {n}")).await.unwrap());
    }
    store.mark_job_analyzing(ids[0]).await.unwrap();

    let batch = store.pending_batch(10).await.unwrap();

    assert_eq!(
        batch.iter().map(|job| job.id).collect::<Vec<_>>(),
        ids[1..11].to_vec()
    );
    assert!(batch.iter().all(|job| job.status == JobStatus::Pending));
    assert_eq!(
        store.get(ids[1]).await.unwrap().unwrap().status,
        JobStatus::Pending
    );
}

pub async fn mark_job_analyzing(store: impl JobStore) {
    let id = store.enqueue("data".to_owned()).await.unwrap();

    let claimed = store.mark_job_analyzing(id).await.unwrap();

    assert_eq!(claimed.status, JobStatus::Analyzing);
    let started_at = claimed.started_at.unwrap();
    assert!(started_at >= claimed.created_at);
    assert_eq!(store.get(id).await.unwrap().unwrap(), claimed);
}

pub async fn mark_job_analyzing_only_claims_pending_jobs(store: impl JobStore) {
    let id = store.enqueue("data".to_owned()).await.unwrap();
    store.mark_job_analyzing(id).await.unwrap();

    assert!(matches!(
        store.mark_job_analyzing(id).await,
        Err(StoreError::InvalidTransition {
            from: JobStatus::Analyzing,
            to: JobStatus::Analyzing,
            ..
        })
    ));

    store
        .mark_job_completed(id, Analysis::mock_analysis())
        .await
        .unwrap();
    assert!(matches!(
        store.mark_job_analyzing(id).await,
        Err(StoreError::InvalidTransition {
            from: JobStatus::Completed,
            ..
        })
    ));
}

pub async fn mark_job_analyzing_keeps_first_started_at(store: impl JobStore) {
    let id = store.enqueue("data".to_owned()).await.unwrap();
    let first = store.mark_job_analyzing(id).await.unwrap();
    store.mark_job_retryable(id, mock_error()).await.unwrap();

    let second = store.mark_job_analyzing(id).await.unwrap();

    assert_eq!(second.started_at, first.started_at);
    assert_eq!(second.retry_count, 1);
}

pub async fn mark_job_completed(store: impl JobStore) {
    let id = store.enqueue("data".to_owned()).await.unwrap();
    assert!(matches!(
        store.mark_job_completed(id, Analysis::mock_analysis()).await,
        Err(StoreError::InvalidTransition {
            from: JobStatus::Pending,
            to: JobStatus::Completed,
            ..
        })
    ));
    store.mark_job_analyzing(id).await.unwrap();

    store
        .mark_job_completed(id, Analysis::mock_analysis())
        .await
        .unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result, Some(Analysis::mock_analysis()));
    assert!(job.error_message.is_none());
    let started_at = job.started_at.unwrap();
    let completed_at = job.completed_at.unwrap();
    assert!(job.created_at <= started_at);
    assert!(started_at <= completed_at);
}

pub async fn mark_job_retryable(store: impl JobStore) {
    let id = store.enqueue("data".to_owned()).await.unwrap();
    store.mark_job_analyzing(id).await.unwrap();

    store.mark_job_retryable(id, mock_error()).await.unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert!(job.error_message.is_none());
    assert!(job.completed_at.is_none());
    assert!(job.result.is_none());
    assert_eq!(job.failures.len(), 1);
    assert_eq!(job.failures[0].attempt, 1);
    assert_eq!(job.failures[0].error_type, "custom");
    assert_eq!(job.failures[0].message, "Analyzer unavailable");
}

pub async fn mark_job_failed(store: impl JobStore) {
    let id = store.enqueue("data".to_owned()).await.unwrap();
    store.mark_job_analyzing(id).await.unwrap();
    store.mark_job_retryable(id, mock_error()).await.unwrap();
    store.mark_job_analyzing(id).await.unwrap();

    store
        .mark_job_failed(
            id,
            AttemptError {
                error_type: "timeout",
                message: "last failure".to_owned(),
            },
        )
        .await
        .unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.error_message.as_deref(), Some("last failure"));
    assert!(job.result.is_none());
    assert!(job.completed_at.unwrap() >= job.started_at.unwrap());
    assert_eq!(
        job.failures
            .iter()
            .map(|failure| (failure.attempt, failure.error_type.as_str()))
            .collect::<Vec<_>>(),
        vec![(1, "custom"), (2, "timeout")]
    );
    assert!(store.pending_batch(10).await.unwrap().is_empty());
}

pub async fn mark_job_released(store: impl JobStore) {
    let id = store.enqueue("data".to_owned()).await.unwrap();
    store.mark_job_analyzing(id).await.unwrap();
    store.mark_job_retryable(id, mock_error()).await.unwrap();
    let claimed = store.mark_job_analyzing(id).await.unwrap();

    store.mark_job_released(id).await.unwrap();

    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.failures.len(), 1);
    assert_eq!(job.started_at, claimed.started_at);
    assert!(job.completed_at.is_none());
    assert_eq!(store.pending_batch(10).await.unwrap()[0].id, id);

    assert!(matches!(
        store.mark_job_released(id).await,
        Err(StoreError::InvalidTransition {
            from: JobStatus::Pending,
            to: JobStatus::Pending,
            ..
        })
    ));
}

pub async fn mark_unknown_job(store: impl JobStore) {
    let id = JobId::from(404);

    assert!(matches!(
        store.mark_job_analyzing(id).await,
        Err(StoreError::JobNotFound(missing)) if missing == id
    ));
    assert!(matches!(
        store.mark_job_completed(id, Analysis::mock_analysis()).await,
        Err(StoreError::JobNotFound(_))
    ));
    assert!(matches!(
        store.mark_job_retryable(id, mock_error()).await,
        Err(StoreError::JobNotFound(_))
    ));
    assert!(matches!(
        store.mark_job_failed(id, mock_error()).await,
        Err(StoreError::JobNotFound(_))
    ));
    assert!(matches!(
        store.mark_job_released(id).await,
        Err(StoreError::JobNotFound(_))
    ));
}

pub async fn summary(store: impl JobStore) {
    store.enqueue("pending".to_owned()).await.unwrap();
    let analyzing = store.enqueue("analyzing".to_owned()).await.unwrap();
    let completed = store.enqueue("completed".to_owned()).await.unwrap();
    store.mark_job_analyzing(analyzing).await.unwrap();
    store.mark_job_analyzing(completed).await.unwrap();
    store
        .mark_job_completed(completed, Analysis::mock_analysis())
        .await
        .unwrap();

    assert_eq!(
        store.summary().await.unwrap(),
        StatusSummary {
            pending: 1,
            analyzing: 1,
            completed: 1,
            failed: 0,
        }
    );
}

async fn finish(store: &impl JobStore, input: &str, status: JobStatus) -> JobId {
    let id = store.enqueue(input.to_owned()).await.unwrap();
    store.mark_job_analyzing(id).await.unwrap();
    match status {
        JobStatus::Completed => store
            .mark_job_completed(id, Analysis::mock_analysis())
            .await
            .unwrap(),
        _ => store.mark_job_failed(id, mock_error()).await.unwrap(),
    }
    id
}

pub async fn prune_max_age(store: impl JobStore) {
    let completed = finish(&store, "completed", JobStatus::Completed).await;
    let failed = finish(&store, "failed", JobStatus::Failed).await;

    let removed = store
        .prune(&Pruner::max_age(TimeDelta::days(1), JobStatus::Completed))
        .await
        .unwrap();
    assert_eq!(removed, 0);

    let removed = store
        .prune(&Pruner::max_age(TimeDelta::zero(), JobStatus::Completed))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(store.get(completed).await.unwrap().is_none());
    assert!(store.get(failed).await.unwrap().is_some());
}

pub async fn prune_max_length(store: impl JobStore) {
    let mut ids = Vec::new();
    for n in 0..5 {
        ids.push(finish(&store, &format!("failure {n}"), JobStatus::Failed).await);
    }
    let completed = finish(&store, "completed", JobStatus::Completed).await;

    let removed = store
        .prune(&Pruner::max_length(2, JobStatus::Failed))
        .await
        .unwrap();

    assert_eq!(removed, 3);
    let remaining = store
        .query(Query::StatusEqual(JobStatus::Failed))
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect::<Vec<_>>();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.contains(&ids[4]));
    assert!(store.get(completed).await.unwrap().is_some());
}

pub async fn prune_never_removes_unfinished_jobs(store: impl JobStore) {
    let pending = store.enqueue("pending".to_owned()).await.unwrap();
    let analyzing = store.enqueue("analyzing".to_owned()).await.unwrap();
    store.mark_job_analyzing(analyzing).await.unwrap();

    for status in [JobStatus::Pending, JobStatus::Analyzing] {
        assert_eq!(
            store.prune(&Pruner::max_length(0, status)).await.unwrap(),
            0
        );
        assert_eq!(
            store
                .prune(&Pruner::max_age(TimeDelta::zero(), status))
                .await
                .unwrap(),
            0
        );
    }

    assert!(store.get(pending).await.unwrap().is_some());
    assert!(store.get(analyzing).await.unwrap().is_some());
}
