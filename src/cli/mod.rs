//! CLI command implementations

use clap::{Parser, Subcommand, ValueEnum};
use std::path::Path;

use crate::config::PipelineConfig;
use crate::fingerprint::ProductFingerprint;

pub mod error;
pub mod release;
pub mod run;
pub mod status;
pub mod validate;

pub use error::CliError;
pub use release::ReleaseCommand;
pub use run::RunCommand;
pub use status::StatusCommand;
pub use validate::ValidateCommand;

/// Product video publisher CLI
#[derive(Parser, Debug)]
#[command(name = "product-video-publisher")]
#[command(about = "Generate product videos and publish them across platforms", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "human")]
    pub output_format: OutputFormat,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process every product once
    Run(RunCommand),

    /// Show processing records
    Status(StatusCommand),

    /// Release a stuck lock or forget a record
    Release(ReleaseCommand),

    /// Check a configuration file
    Validate(ValidateCommand),
}

/// Output format for command results
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

/// Load a configuration file and fail on validation errors
///
/// Warnings are logged and returned.
pub(crate) fn load_config(path: &Path) -> Result<(PipelineConfig, Vec<String>), CliError> {
    let config = PipelineConfig::load(path)?;
    let warnings = config.validate()?;
    for warning in &warnings {
        tracing::warn!("Configuration: {}", warning);
    }
    Ok((config, warnings))
}

/// Parse a fingerprint argument
pub(crate) fn parse_fingerprint(s: &str) -> Result<ProductFingerprint, String> {
    ProductFingerprint::parse(s).map_err(|e| e.to_string())
}
