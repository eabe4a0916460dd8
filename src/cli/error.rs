//! CLI error types and conversions

use crate::config::ConfigError;
use crate::metrics::MetricsError;
use crate::pipeline::PipelineError;
use crate::store::StoreError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Processing store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Pipeline error outside a product run (e.g. unreadable product file)
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Metrics exporter error
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// Output could not be rendered
    #[error("output error: {0}")]
    Output(String),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// At least one product ended in a failure outcome
    #[error("{failed} product(s) failed")]
    RunFailed {
        /// Products whose recorded outcome is a failure
        failed: usize,
    },
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Output(err.to_string())
    }
}
