//! The external analysis capability.
//!
//! Batchlens treats the analyzer as an opaque dependency: given an error description it returns a
//! structured [`Analysis`] or fails with an [`AnalysisError`]. Implementations must be safe to
//! call concurrently; the dispatcher never runs more calls at once than
//! [`crate::config::DispatcherConfig::max_concurrency`].
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured explanation of a failed batch job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analysis {
    pub category: String,
    pub severity: String,
    pub explanation: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Something that can explain an error description.
///
/// # Example
///
/// ```
/// use batchlens::analyzer::{Analysis, AnalysisError, Analyzer};
///
/// struct TimeoutSpotter;
///
/// #[async_trait::async_trait]
/// impl Analyzer for TimeoutSpotter {
///     async fn analyze(&self, description: &str) -> Result<Analysis, AnalysisError> {
///         Ok(Analysis {
///             category: "Infrastructure".to_owned(),
///             severity: "Medium".to_owned(),
///             explanation: format!("{description} looks like a timeout"),
///             suggestions: vec!["Increase the batch window".to_owned()],
///         })
///     }
/// }
/// ```
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, description: &str) -> Result<Analysis, AnalysisError>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("Analyzer unavailable: {0}")]
    Unavailable(String),
    #[error("Analyzer rejected the request: {0}")]
    Rejected(String),
    #[error("Analyzer returned a malformed response: {0}")]
    Malformed(String),
    #[error("Analysis did not complete within {0:?}")]
    Timeout(Duration),
    #[error("Analyzer panicked: {0}")]
    Panicked(String),
}

impl AnalysisError {
    /// A short machine readable classification, recorded with every failed attempt.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Rejected(_) => "rejected",
            Self::Malformed(_) => "malformed",
            Self::Timeout(_) => "timeout",
            Self::Panicked(_) => "panic",
        }
    }
}
