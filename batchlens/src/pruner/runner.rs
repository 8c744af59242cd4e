use std::{ops::Sub, sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::JobStore;

use super::RetentionPolicy;

pub(crate) struct PrunerRunner<S: JobStore> {
    policy: RetentionPolicy,
    store: Arc<S>,
}

impl<S> PrunerRunner<S>
where
    S: JobStore + 'static,
{
    pub fn new(store: Arc<S>, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some(next) = self.policy.schedule.upcoming(Utc).next() else {
                    tracing::warn!("Retention schedule has no upcoming run, stopping the pruner");
                    break;
                };
                let delay = next
                    .sub(Utc::now())
                    .sub(TimeDelta::milliseconds(10))
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        self.prune().await;
                        if let Ok(delay) = (next - Utc::now()).to_std() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the job pruner");
                        break;
                    },
                }
            }
        })
    }

    pub(crate) async fn prune(&self) {
        for pruner in self.policy.pruners.iter().filter(|pruner| pruner.is_effective()) {
            match self.store.prune(pruner).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(
                    removed,
                    status = %pruner.status,
                    "Pruned {removed} {} job records",
                    pruner.status
                ),
                Err(err) => tracing::error!(?err, "Failed to prune job records with error {err}"),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use chrono::TimeDelta;

    use super::*;
    use crate::{
        analyzer::Analysis,
        job::JobStatus,
        pruner::Pruner,
        store::{memory::InMemoryJobStore, AttemptError},
    };

    async fn finished_store() -> InMemoryJobStore {
        let store = InMemoryJobStore::new();
        for n in 0..4 {
            let id = store.enqueue(format!("failure {n}")).await.unwrap();
            store.mark_job_analyzing(id).await.unwrap();
            if n % 2 == 0 {
                store
                    .mark_job_completed(id, Analysis::mock_analysis())
                    .await
                    .unwrap();
            } else {
                store
                    .mark_job_failed(
                        id,
                        AttemptError {
                            error_type: "custom",
                            message: "boom".to_owned(),
                        },
                    )
                    .await
                    .unwrap();
            }
        }
        store.enqueue("still waiting".to_owned()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn prune_applies_every_effective_pruner() {
        let store = Arc::new(finished_store().await);
        let policy = RetentionPolicy::new(cron::Schedule::from_str("0 0 * * * *").unwrap())
            .with_pruners([
                Pruner::max_length(1, JobStatus::Completed),
                Pruner::max_age(TimeDelta::zero(), JobStatus::Failed),
                Pruner::max_length(0, JobStatus::Pending),
            ]);

        PrunerRunner::new(store.clone(), policy).prune().await;

        let summary = store.summary().await.unwrap();
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.pending, 1);
    }

    #[tokio::test]
    async fn spawned_pruner_stops_on_cancellation() {
        let store = Arc::new(InMemoryJobStore::new());
        let policy = RetentionPolicy::new(cron::Schedule::from_str("0 0 0 1 1 *").unwrap());
        let token = CancellationToken::new();

        let handle = PrunerRunner::new(store, policy).spawn(token.clone());
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
