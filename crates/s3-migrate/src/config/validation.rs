//! Configuration validation.

use super::Config;
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Source validation
    if config.source.bucket.is_empty() {
        return Err(MigrateError::Config("source.bucket is required".into()));
    }

    // Target validation
    if config.target.bucket.is_empty() {
        return Err(MigrateError::Config("target.bucket is required".into()));
    }

    if config.queue.name.is_empty() {
        return Err(MigrateError::Config("queue.name is required".into()));
    }

    // Cannot migrate a prefix onto itself
    if config.source.bucket == config.target.bucket
        && config.source.prefix == config.target.prefix
        && config.source.endpoint == config.target.endpoint
    {
        return Err(MigrateError::Config(
            "source and target cannot be the same bucket and prefix".into(),
        ));
    }

    if let Some(mb) = config.transfer.chunk_size_mb {
        if !(5..=5120).contains(&mb) {
            return Err(MigrateError::Config(format!(
                "transfer.chunk_size_mb must be between 5 and 5120, got {}",
                mb
            )));
        }
    }
    if let Some(threads) = config.transfer.max_threads {
        if threads == 0 {
            return Err(MigrateError::Config(
                "transfer.max_threads must be at least 1".into(),
            ));
        }
    }
    if let Some(files) = config.transfer.max_parallel_files {
        if files == 0 {
            return Err(MigrateError::Config(
                "transfer.max_parallel_files must be at least 1".into(),
            ));
        }
    }
    if config.transfer.job_timeout_secs == 0 {
        return Err(MigrateError::Config(
            "transfer.job_timeout_secs must be at least 1".into(),
        ));
    }
    Ok(())
}
