//! Opt-in retention for finished job records.
//!
//! By default the registry keeps every record for the lifetime of the process. For long running
//! deployments a [`RetentionPolicy`] can be passed to [`crate::Batchlens::with_retention`]; it
//! runs on a [`cron::Schedule`] and applies each of its [`Pruner`]s in turn.
//!
//! Only terminal records ([`JobStatus::Completed`] and [`JobStatus::Failed`]) are ever removed,
//! and the ids of removed records are never handed out again.
//!
//! # Example
//!
//! Keep completed analyses for a week, but only the 500 most recent failures:
//!
//! ```
//! # use batchlens::prelude::*;
//! # use std::str::FromStr;
//! # use chrono::TimeDelta;
//! let policy = RetentionPolicy::new(cron::Schedule::from_str("0 0 * * * *").unwrap())
//!     .with_pruners([
//!         Pruner::max_age(TimeDelta::days(7), JobStatus::Completed),
//!         Pruner::max_length(500, JobStatus::Failed),
//!     ]);
//! ```
use chrono::TimeDelta;

pub(crate) mod runner;

use crate::job::JobStatus;

/// When and how finished records are removed.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub(crate) schedule: cron::Schedule,
    pub(crate) pruners: Vec<Pruner>,
}

impl RetentionPolicy {
    /// Create a policy running on the given schedule, with no pruners configured.
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            pruners: Vec::new(),
        }
    }

    pub fn with_pruner(mut self, pruner: Pruner) -> Self {
        self.pruners.push(pruner);
        self
    }

    pub fn with_pruners(mut self, pruners: impl IntoIterator<Item = Pruner>) -> Self {
        self.pruners.extend(pruners);
        self
    }
}

/// Removes records of one status by age or by count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pruner {
    pub status: JobStatus,
    pub prune_by: PruneBy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneBy {
    /// Remove records that finished longer ago than this.
    MaxAge(TimeDelta),
    /// Keep only this many of the most recently finished records.
    MaxLength(usize),
}

impl Pruner {
    /// Remove records with `status` that finished more than `age` ago.
    pub const fn max_age(age: TimeDelta, status: JobStatus) -> Self {
        Self {
            status,
            prune_by: PruneBy::MaxAge(age),
        }
    }

    /// Keep only the `length` most recently finished records with `status`.
    pub const fn max_length(length: usize, status: JobStatus) -> Self {
        Self {
            status,
            prune_by: PruneBy::MaxLength(length),
        }
    }

    /// Pruners targeting non-terminal statuses never remove anything.
    pub fn is_effective(&self) -> bool {
        self.status.is_terminal()
    }
}
