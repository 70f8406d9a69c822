//! Progress ledger.
//!
//! The ledger is upsert-only telemetry keyed by `"src_bucket/src_key"`.
//! It pins the source version an upload was created against, records
//! per-round progress, and stores the terminal status of each job. It
//! never gates execution: a ledger write failure is logged by callers
//! and the transfer continues.

mod dynamo;
mod mem;

pub use dynamo::DynamoLedger;
pub use mem::InMemoryLedger;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

/// Final state of one job attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalStatus {
    Done,
    Err,
    Timeout,
    Quit,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Done => "DONE",
            TerminalStatus::Err => "ERR",
            TerminalStatus::Timeout => "TIMEOUT",
            TerminalStatus::Quit => "QUIT",
        }
    }
}

/// Snapshot written when a transfer round begins.
#[derive(Debug, Clone)]
pub struct RoundStart {
    /// Ledger key, `"src_bucket/src_key"` with any trailing `/` intact.
    pub key: String,
    /// Percentage of parts already committed before this round.
    pub percent: u8,
    pub size: i64,
    pub des_bucket: String,
    pub des_key: String,
    /// Source version this upload is pinned to, if versioning is on.
    pub version_id: Option<String>,
    pub worker_id: String,
    /// True on the round that created the multipart upload.
    pub first_round: bool,
}

#[async_trait]
pub trait ProgressLedger: Send + Sync {
    async fn record_round_start(&self, round: &RoundStart) -> Result<()>;

    /// Write the job's final status. `Done` also marks progress 100 and
    /// stores the destination etag.
    async fn record_terminal(
        &self,
        key: &str,
        status: TerminalStatus,
        etag: Option<&str>,
    ) -> Result<()>;

    /// Version and size pinned at upload creation, if any.
    async fn pinned_version(&self, key: &str) -> Result<Option<(String, i64)>>;

    /// Ledger key to pinned source version, for the delta comparison
    /// of version-aware job sending.
    async fn version_map(&self) -> Result<HashMap<String, String>>;
}
