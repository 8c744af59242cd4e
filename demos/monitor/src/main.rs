use std::{str::FromStr, time::Duration};

use anyhow::Context;
use batchlens::{
    prelude::*,
    store::memory::InMemoryJobStore,
    testing::{Outcome, ScriptedAnalyzer},
};
use batchlens_openai::{OpenAiAnalyzer, OpenAiConfig};
use chrono::TimeDelta;
use tracing_subscriber::EnvFilter;

const MAX_CONCURRENCY: &str = "BATCHLENS_MAX_CONCURRENCY";
const DEFAULT_MAX_CONCURRENCY: usize = 3;
const TICK_INTERVAL_SECS: &str = "BATCHLENS_TICK_INTERVAL_SECS";
const DEFAULT_TICK_INTERVAL_SECS: u64 = 5;
const MAX_RETRIES: &str = "BATCHLENS_MAX_RETRIES";
const DEFAULT_MAX_RETRIES: u32 = 3;
const ANALYSIS_TIMEOUT_SECS: &str = "BATCHLENS_ANALYSIS_TIMEOUT_SECS";
const RETENTION_HOURS: &str = "BATCHLENS_RETENTION_HOURS";
const DEFAULT_RETENTION_HOURS: i64 = 24;

const SAMPLE_ERRORS: [&str; 6] = [
    "NullReferenceException at Finance.Posting.PostJournal(JournalHeader header)",
    "ORA-00060: deadlock detected while waiting for resource",
    "Posting period 2024/13 is closed for company code 1000",
    "Lock wait timeout exceeded; try restarting transaction",
    "System.IO.IOException: There is not enough space on the disk",
    "Material 4711 has no valuation price in plant 0001",
];

fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("Invalid value {value:?} for {name}")),
        Err(_) => Ok(default),
    }
}

fn config_from_env() -> anyhow::Result<DispatcherConfig> {
    let mut config = DispatcherConfig::new()
        .with_max_concurrency(env_or(MAX_CONCURRENCY, DEFAULT_MAX_CONCURRENCY)?)
        .with_tick_interval(Duration::from_secs(env_or(
            TICK_INTERVAL_SECS,
            DEFAULT_TICK_INTERVAL_SECS,
        )?))
        .with_max_retries(env_or(MAX_RETRIES, DEFAULT_MAX_RETRIES)?);
    if let Ok(timeout) = std::env::var(ANALYSIS_TIMEOUT_SECS) {
        let secs = timeout
            .parse()
            .with_context(|| format!("Invalid value {timeout:?} for {ANALYSIS_TIMEOUT_SECS}"))?;
        config = config.with_analysis_timeout(Duration::from_secs(secs));
    }
    Ok(config)
}

fn retention_from_env() -> anyhow::Result<RetentionPolicy> {
    let hours = env_or(RETENTION_HOURS, DEFAULT_RETENTION_HOURS)?;
    let max_age = TimeDelta::try_hours(hours)
        .with_context(|| format!("Invalid value {hours} for {RETENTION_HOURS}: out of range"))?;
    let schedule = cron::Schedule::from_str("0 */10 * * * *")?;
    Ok(RetentionPolicy::new(schedule).with_pruners([
        Pruner::max_age(max_age, JobStatus::Completed),
        Pruner::max_age(max_age, JobStatus::Failed),
    ]))
}

/// Stands in for the real analyzer when no API key is configured.
fn offline_analyzer() -> ScriptedAnalyzer {
    ScriptedAnalyzer::new()
        .with_latency(Duration::from_millis(1500))
        .with_script(
            SAMPLE_ERRORS[0],
            [Outcome::Succeed(Analysis {
                category: "Code Defect".to_owned(),
                severity: "High".to_owned(),
                explanation: "The journal header was not loaded before posting.".to_owned(),
                suggestions: vec!["Check the header lookup in PostJournal".to_owned()],
            })],
        )
        .with_script(
            SAMPLE_ERRORS[1],
            [
                AnalysisError::Unavailable("connection reset by peer".to_owned()).into(),
                Outcome::Succeed(Analysis {
                    category: "Infrastructure".to_owned(),
                    severity: "Medium".to_owned(),
                    explanation: "Two batch jobs updated the same rows in opposite order."
                        .to_owned(),
                    suggestions: vec!["Serialize the conflicting jobs".to_owned()],
                }),
            ],
        )
        .with_script(
            SAMPLE_ERRORS[5],
            [AnalysisError::Rejected("content filtered".to_owned()).into()],
        )
}

async fn run<A: Analyzer + 'static>(analyzer: A) -> anyhow::Result<()> {
    let handle = Batchlens::new(InMemoryJobStore::new(), analyzer)
        .with_config(config_from_env()?)
        .with_retention(retention_from_env()?)
        .spawn();

    for description in SAMPLE_ERRORS {
        let id = handle.submit(description).await?;
        tracing::info!("Submitted {id}: {description}");
    }

    let mut interval = tokio::time::interval(Duration::from_secs(2));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            result = tokio::signal::ctrl_c() => {
                result?;
                break;
            }
        }
        let summary = handle.summary().await?;
        tracing::info!(
            pending = summary.pending,
            analyzing = summary.analyzing,
            completed = summary.completed,
            failed = summary.failed,
            slots_in_use = handle.limiter().in_use(),
            "Dispatcher status"
        );
        if summary.pending + summary.analyzing == 0 {
            break;
        }
    }

    for job in handle.store().query(Query::All).await? {
        match (&job.result, &job.error_message) {
            (Some(analysis), _) => tracing::info!(
                "{} {}: [{} / {}] {}",
                job.id,
                job.status,
                analysis.category,
                analysis.severity,
                analysis.explanation
            ),
            (None, Some(error)) => tracing::warn!(
                "{} {} after {} attempts: {error}",
                job.id,
                job.status,
                job.retry_count
            ),
            (None, None) => tracing::info!("{} {}", job.id, job.status),
        }
    }

    handle.graceful_shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match OpenAiConfig::from_env() {
        Some(config) => {
            tracing::info!(model = %config.model, "Analyzing with {}", config.base_url);
            run(OpenAiAnalyzer::new(config)?).await
        }
        None => {
            tracing::info!("OPENAI_API_KEY is not set, using the offline analyzer");
            run(offline_analyzer()).await
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retention_hours_out_of_range() {
        std::env::set_var(RETENTION_HOURS, i64::MAX.to_string());
        let error = retention_from_env().unwrap_err();
        std::env::remove_var(RETENTION_HOURS);

        assert!(error.to_string().contains(RETENTION_HOURS));
        assert!(retention_from_env().is_ok());
    }
}
