//! `release` command: clear a stuck lock or forget a record

use clap::Args;
use std::path::PathBuf;
use tracing::{info, warn};

use super::{load_config, parse_fingerprint, CliError};
use crate::fingerprint::ProductFingerprint;
use crate::store::{ProcessingStore, StoreError};

/// Release command arguments
#[derive(Args, Debug)]
pub struct ReleaseCommand {
    /// Pipeline configuration file (JSON)
    #[arg(long, default_value = "publisher.json")]
    pub config: PathBuf,

    /// Fingerprint to release
    #[arg(long, value_parser = parse_fingerprint)]
    pub fingerprint: ProductFingerprint,

    /// Delete the record entirely so the product is processed again
    #[arg(long, default_value_t = false)]
    pub forget: bool,
}

impl ReleaseCommand {
    /// Release the lock held on the fingerprint, or forget its record
    pub async fn execute(&self) -> Result<(), CliError> {
        let (config, _) = load_config(&self.config)?;
        let store = config.open_store()?;
        let fp = &self.fingerprint;

        if self.forget {
            if store.forget(fp).await? {
                info!(fingerprint = %fp, "Record forgotten");
                println!("Forgot {fp}");
                return Ok(());
            }
            return Err(StoreError::NotFound(fp.to_string()).into());
        }

        let record = store
            .get(fp)
            .await?
            .ok_or_else(|| StoreError::NotFound(fp.to_string()))?;
        match record.lock_owner.as_deref() {
            Some(owner) => {
                warn!(fingerprint = %fp, owner, "Releasing lock on operator request");
                store.release(fp, owner).await?;
                println!("Released {fp} (was held by {owner})");
            }
            None => println!("{fp} is not locked; nothing to release"),
        }
        Ok(())
    }
}
