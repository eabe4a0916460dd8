//! `validate` command: check a configuration file

use clap::Args;
use serde_json::json;
use std::path::PathBuf;

use super::{load_config, Cli, CliError, OutputFormat};

/// Validate command arguments
#[derive(Args, Debug)]
pub struct ValidateCommand {
    /// Pipeline configuration file (JSON)
    #[arg(long, default_value = "publisher.json")]
    pub config: PathBuf,
}

impl ValidateCommand {
    /// Load and validate; errors fail the command, warnings are printed
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let (config, warnings) = load_config(&self.config)?;
        let enabled_providers: Vec<&str> = config
            .providers
            .iter()
            .filter(|p| p.enabled)
            .map(|p| p.name.as_str())
            .collect();
        let enabled_targets: Vec<&str> = config
            .targets
            .iter()
            .filter(|t| t.enabled)
            .map(|t| t.name.as_str())
            .collect();

        match cli.output_format {
            OutputFormat::Json => println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "valid": true,
                    "providers": enabled_providers,
                    "targets": enabled_targets,
                    "worst_case_run_secs": config.worst_case_run().as_secs(),
                    "warnings": warnings,
                }))?
            ),
            OutputFormat::Human => {
                println!("Configuration valid: {}", self.config.display());
                println!("  Provider chain: {}", enabled_providers.join(" -> "));
                println!("  Targets: {}", enabled_targets.join(", "));
                println!(
                    "  Worst-case run: {}s (lock TTL {}s)",
                    config.worst_case_run().as_secs(),
                    config.lock.ttl_secs
                );
                for warning in &warnings {
                    println!("  warning: {warning}");
                }
            }
        }
        Ok(())
    }
}
