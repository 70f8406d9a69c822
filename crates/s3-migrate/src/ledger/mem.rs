//! In-memory ledger used by tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

use super::{ProgressLedger, RoundStart, TerminalStatus};

#[derive(Debug, Clone, Default)]
pub struct LedgerRecord {
    pub percent: u8,
    pub size: i64,
    pub des_bucket: String,
    pub des_key: String,
    pub version_id: Option<String>,
    pub status: Option<String>,
    pub etag: Option<String>,
    pub try_times: u32,
    pub workers: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct InMemoryLedger {
    records: Mutex<HashMap<String, LedgerRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, key: &str) -> Option<LedgerRecord> {
        self.records.lock().unwrap().get(key).cloned()
    }

    /// Seed a pinned version as if an earlier worker had created the
    /// upload.
    pub fn pin_version(&self, key: &str, version_id: &str, size: i64) {
        let mut records = self.records.lock().unwrap();
        let record = records.entry(key.to_string()).or_default();
        record.version_id = Some(version_id.to_string());
        record.size = size;
    }
}

#[async_trait]
impl ProgressLedger for InMemoryLedger {
    async fn record_round_start(&self, round: &RoundStart) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let record = records.entry(round.key.clone()).or_default();
        record.percent = round.percent;
        record.size = round.size;
        record.des_bucket = round.des_bucket.clone();
        record.des_key = round.des_key.clone();
        if round.first_round {
            record.version_id = round.version_id.clone();
            record.start_time = Some(Utc::now());
        }
        record.try_times += 1;
        if !record.workers.contains(&round.worker_id) {
            record.workers.push(round.worker_id.clone());
        }
        record.status = Some("RUNNING".to_string());
        Ok(())
    }

    async fn record_terminal(
        &self,
        key: &str,
        status: TerminalStatus,
        etag: Option<&str>,
    ) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let record = records.entry(key.to_string()).or_default();
        record.status = Some(status.as_str().to_string());
        record.end_time = Some(Utc::now());
        if status == TerminalStatus::Done {
            record.percent = 100;
            record.etag = etag.map(str::to_string);
        }
        Ok(())
    }

    async fn pinned_version(&self, key: &str) -> Result<Option<(String, i64)>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .get(key)
            .and_then(|r| r.version_id.as_ref().map(|v| (v.clone(), r.size))))
    }

    async fn version_map(&self) -> Result<HashMap<String, String>> {
        let records = self.records.lock().unwrap();
        Ok(records
            .iter()
            .filter_map(|(k, r)| r.version_id.as_ref().map(|v| (k.clone(), v.clone())))
            .collect())
    }
}
