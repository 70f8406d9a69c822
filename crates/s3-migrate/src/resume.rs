//! Resume inspection for interrupted multipart uploads.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{ObjectStore, OpenUpload};

/// Linear-backoff retry schedule shared by transfer paths.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retry: u32,
    pub backoff_unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry: 5,
            backoff_unit: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retry: u32) -> Self {
        Self {
            max_retry,
            ..Self::default()
        }
    }

    /// Sleep grows linearly with the attempt number: unit, 2x unit, ...
    pub fn sleep_for(&self, attempt: u32) -> Duration {
        self.backoff_unit * (attempt + 1)
    }
}

/// Finds in-flight uploads left behind by a previous worker so a job
/// restarts from committed parts instead of from scratch.
pub struct ResumeInspector {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
}

impl ResumeInspector {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Latest open multipart upload for exactly `key`, or None when the
    /// destination has nothing in flight for it. Listing uses the key
    /// as prefix, so hits must be filtered back down to exact matches.
    pub async fn find_open_upload(&self, bucket: &str, key: &str) -> Result<Option<OpenUpload>> {
        let mut attempt = 0;
        let uploads = loop {
            match self.store.list_open_uploads(bucket, key).await {
                Ok(uploads) => break uploads,
                Err(e) if attempt < self.retry.max_retry => {
                    warn!("list uploads for {} failed, retrying: {}", key, e);
                    tokio::time::sleep(self.retry.sleep_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };
        let best = uploads
            .into_iter()
            .filter(|u| u.key == key)
            .max_by_key(|u| u.initiated);
        if let Some(upload) = &best {
            debug!(
                "found open upload {} for {} initiated {}",
                upload.upload_id, key, upload.initiated
            );
        }
        Ok(best)
    }

    /// Part numbers already committed to `upload_id`.
    pub async fn committed_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<HashSet<i32>> {
        let mut attempt = 0;
        let parts = loop {
            match self.store.list_parts(bucket, key, upload_id).await {
                Ok(parts) => break parts,
                Err(e) if attempt < self.retry.max_retry => {
                    warn!("list parts for {} failed, retrying: {}", key, e);
                    tokio::time::sleep(self.retry.sleep_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };
        Ok(parts.into_iter().map(|p| p.part_number).collect())
    }
}
