//! Configuration type definitions with auto-tuning based on system resources.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::jobsender::SenderOptions;
use crate::transfer::TransferOptions;

const MB: i64 = 1024 * 1024;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_bytes = sys.total_memory();
        let total_memory_gb = total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_bytes,
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source bucket.
    pub source: EndpointConfig,

    /// Destination bucket.
    pub target: EndpointConfig,

    /// Job queue.
    pub queue: QueueConfig,

    /// Progress ledger table.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Transfer behavior.
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.transfer = self.transfer.with_auto_tuning(&resources);
        self
    }

    pub fn sender_options(&self) -> SenderOptions {
        SenderOptions {
            src_bucket: self.source.bucket.clone(),
            src_prefix: self.source.prefix.clone(),
            des_bucket: self.target.bucket.clone(),
            des_prefix: self.target.prefix.clone(),
            ignore_patterns: self.transfer.ignore_patterns.clone(),
            version_aware: self.transfer.update_version_id,
            clean_unfinished_upload: self.transfer.clean_unfinished_upload,
        }
    }
}

/// One side of the transfer: a bucket plus how to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Bucket name.
    pub bucket: String,

    /// Key prefix, "" for the whole bucket.
    #[serde(default)]
    pub prefix: String,

    /// Bucket region.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// Custom endpoint URL for S3-compatible storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Named credentials profile. Unset means the ambient credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
}

/// Job queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue name, resolved to a URL at startup.
    pub name: String,
}

/// Progress ledger configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LedgerConfig {
    /// DynamoDB table name. Empty disables the ledger.
    #[serde(default)]
    pub table: String,
}

/// Transfer behavior. All tuning knobs are optional to distinguish
/// "not set" (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Part size in MB. Auto-tuned based on RAM if not set. Grows at
    /// runtime when an object would need more than 10,000 parts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size_mb: Option<i64>,

    /// Objects at or below this many MB skip multipart. Defaults to the
    /// chunk size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumable_threshold_mb: Option<i64>,

    /// Concurrent parts per object. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_threads: Option<usize>,

    /// Objects transferred in parallel. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_files: Option<usize>,

    /// Retries per network call before the round gives up (default: 5).
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    /// Wall-clock budget per transfer round in seconds (default: 3600).
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Recompute the aggregate checksum locally and compare it against
    /// the destination etag (default: false).
    #[serde(default)]
    pub verify_md5_twice: bool,

    /// Abort destination multipart uploads no pending job owns when
    /// sending a batch (default: false).
    #[serde(default)]
    pub clean_unfinished_upload: bool,

    /// Pin source versions in the ledger and resend overwritten
    /// objects on the next delta (default: false).
    #[serde(default)]
    pub update_version_id: bool,

    /// Read parts with an explicit source version id (default: false).
    #[serde(default)]
    pub get_object_with_version_id: bool,

    /// Destination storage class, e.g. "STANDARD_IA".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,

    /// Glob patterns for objects to skip, matched against "bucket/key".
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

fn default_max_retry() -> u32 {
    5
}

fn default_job_timeout() -> u64 {
    3600
}

// Derived Default would zero the serde-defaulted fields, so a config
// file without a transfer section must go through the same defaults.
impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_mb: None,
            resumable_threshold_mb: None,
            max_threads: None,
            max_parallel_files: None,
            max_retry: default_max_retry(),
            job_timeout_secs: default_job_timeout(),
            verify_md5_twice: false,
            clean_unfinished_upload: false,
            update_version_id: false,
            get_object_with_version_id: false,
            storage_class: None,
            ignore_patterns: Vec::new(),
        }
    }
}

impl TransferConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let ram_gb = resources.total_memory_gb;
        let cores = resources.cpu_cores;

        // Concurrent parts: one per core, 5-25 range. Part transfers
        // are network-bound, so go a little past the core count.
        if self.max_threads.is_none() {
            let threads = (cores * 2).clamp(5, 25);
            self.max_threads = Some(threads);
        }

        // Parallel objects: scale with cores, 2-10 range.
        if self.max_parallel_files.is_none() {
            let files = cores.clamp(2, 10);
            self.max_parallel_files = Some(files);
        }

        // Chunk size: scale with RAM. Every in-flight part holds one
        // chunk in memory, so base 5 MB and +5 MB per 8 GB, cap 25 MB.
        if self.chunk_size_mb.is_none() {
            let chunk = 5 + (ram_gb / 8.0) as i64 * 5;
            self.chunk_size_mb = Some(chunk.clamp(5, 25));
        }

        info!(
            "Auto-tuned config: max_threads={}, max_parallel_files={}, chunk_size_mb={}",
            self.max_threads.unwrap_or_default(),
            self.max_parallel_files.unwrap_or_default(),
            self.chunk_size_mb.unwrap_or_default(),
        );

        self
    }

    // Accessor methods that return the effective value (with fallback defaults)
    // These are used when the config hasn't been auto-tuned yet.

    pub fn get_chunk_size(&self) -> i64 {
        self.chunk_size_mb.unwrap_or(5) * MB
    }

    pub fn get_resumable_threshold(&self) -> i64 {
        self.resumable_threshold_mb
            .map(|mb| mb * MB)
            .unwrap_or_else(|| self.get_chunk_size())
    }

    pub fn get_max_threads(&self) -> usize {
        self.max_threads.unwrap_or(5)
    }

    pub fn get_max_parallel_files(&self) -> usize {
        self.max_parallel_files.unwrap_or(5)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            chunk_size: self.get_chunk_size(),
            resumable_threshold: self.get_resumable_threshold(),
            max_threads: self.get_max_threads(),
            max_retry: self.max_retry,
            job_timeout: self.job_timeout(),
            verify_md5_twice: self.verify_md5_twice,
            update_version_id: self.update_version_id,
            get_object_with_version_id: self.get_object_with_version_id,
            storage_class: self.storage_class.clone(),
            ..TransferOptions::default()
        }
    }
}
