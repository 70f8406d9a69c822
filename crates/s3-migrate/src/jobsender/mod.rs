//! Comparison-driven job sending.
//!
//! Lists both buckets, diffs them, and enqueues one job per object the
//! destination is missing or holds a stale copy of. Runs once per
//! invocation; a scheduler invokes it for recurring delta migration.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{info, warn};

use crate::error::{MigrateError, Result};
use crate::job::{join_dest_key, Job};
use crate::ledger::ProgressLedger;
use crate::queue::JobQueue;
use crate::resume::RetryPolicy;
use crate::store::{ListedObject, ObjectStore};

#[derive(Debug, Clone, Default)]
pub struct SenderOptions {
    pub src_bucket: String,
    pub src_prefix: String,
    pub des_bucket: String,
    pub des_prefix: String,
    /// Glob patterns matched against `"src_bucket/src_key"`.
    pub ignore_patterns: Vec<String>,
    /// Compare source versions against the versions the ledger pinned,
    /// so an overwritten source object is resent.
    pub version_aware: bool,
    /// Abort destination multipart uploads that no pending job owns.
    pub clean_unfinished_upload: bool,
}

pub struct JobSender {
    src: Arc<dyn ObjectStore>,
    des: Arc<dyn ObjectStore>,
    queue: Arc<dyn JobQueue>,
    ledger: Arc<dyn ProgressLedger>,
    options: SenderOptions,
    retry: RetryPolicy,
}

impl JobSender {
    pub fn new(
        src: Arc<dyn ObjectStore>,
        des: Arc<dyn ObjectStore>,
        queue: Arc<dyn JobQueue>,
        ledger: Arc<dyn ProgressLedger>,
        options: SenderOptions,
    ) -> Self {
        Self {
            src,
            des,
            queue,
            ledger,
            options,
            retry: RetryPolicy::default(),
        }
    }

    /// Diff the buckets and enqueue the missing objects. Returns how
    /// many jobs were sent.
    pub async fn run(&self) -> Result<usize> {
        if !self.queue.is_empty().await? {
            return Err(MigrateError::Queue(
                "job queue still has a backlog, not sending a new batch".to_string(),
            ));
        }

        let src_objects = if self.options.version_aware {
            self.src
                .list_latest_versions(&self.options.src_bucket, &self.options.src_prefix)
                .await?
        } else {
            self.src
                .list_objects(&self.options.src_bucket, &self.options.src_prefix)
                .await?
        };
        let des_objects = self
            .des
            .list_objects(&self.options.des_bucket, &self.options.des_prefix)
            .await?;
        let des_versions = if self.options.version_aware {
            self.ledger.version_map().await?
        } else {
            HashMap::new()
        };

        let ignore = build_ignore_set(&self.options.ignore_patterns)?;
        let (jobs, ignored) =
            delta_job_list(&src_objects, &des_objects, &self.options, &ignore, &des_versions);
        info!(
            "delta: {} to send, {} ignored, {} already in destination",
            jobs.len(),
            ignored.len(),
            src_objects.len() - jobs.len() - ignored.len()
        );

        if self.options.clean_unfinished_upload {
            self.abort_orphan_uploads(&jobs).await?;
        }

        let bodies: Vec<String> = jobs
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<_, serde_json::Error>>()?;
        let mut attempt = 0;
        loop {
            match self.queue.send_batch(&bodies).await {
                Ok(()) => break,
                Err(e) if attempt < self.retry.max_retry => {
                    warn!("batch send attempt {} failed, retrying: {}", attempt, e);
                    tokio::time::sleep(self.retry.sleep_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(jobs.len())
    }

    /// Multipart uploads on the destination whose key no pending job
    /// claims are leftovers of cancelled batches; abort them so they
    /// stop accruing storage.
    async fn abort_orphan_uploads(&self, jobs: &[Job]) -> Result<()> {
        let owned: HashSet<&str> = jobs.iter().map(|j| j.des_key.as_str()).collect();
        let uploads = self
            .des
            .list_open_uploads(&self.options.des_bucket, &self.options.des_prefix)
            .await?;
        for upload in uploads {
            if owned.contains(upload.key.as_str()) {
                continue;
            }
            info!("aborting orphan upload {} on {}", upload.upload_id, upload.key);
            if let Err(e) = self
                .des
                .abort_multipart_upload(&self.options.des_bucket, &upload.key, &upload.upload_id)
                .await
            {
                warn!("abort of {} failed: {}", upload.upload_id, e);
            }
        }
        Ok(())
    }
}

fn build_ignore_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| MigrateError::Config(format!("bad ignore pattern {}: {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| MigrateError::Config(format!("ignore patterns: {}", e)))
}

/// Source objects minus what the destination already holds. An object
/// counts as present when the destination has the same relative key at
/// the same size, and, in version-aware mode, the ledger pinned the
/// same source version. Returns the jobs to send and the ignored keys.
fn delta_job_list(
    src_objects: &[ListedObject],
    des_objects: &[ListedObject],
    options: &SenderOptions,
    ignore: &GlobSet,
    des_versions: &HashMap<String, String>,
) -> (Vec<Job>, Vec<String>) {
    let des_prefix = options.des_prefix.trim_matches('/');
    let present: HashSet<(String, i64)> = des_objects
        .iter()
        .map(|o| {
            let relative = o
                .key
                .strip_prefix(des_prefix)
                .map(|k| k.trim_start_matches('/'))
                .unwrap_or(&o.key);
            (relative.to_string(), o.size)
        })
        .collect();

    let mut jobs = Vec::new();
    let mut ignored = Vec::new();
    for src in src_objects {
        let qualified = format!("{}/{}", options.src_bucket, src.key);
        if ignore.is_match(&qualified) {
            ignored.push(src.key.clone());
            continue;
        }
        if present.contains(&(src.key.clone(), src.size)) {
            let version_current = if options.version_aware {
                des_versions.get(&qualified).map(String::as_str) == src.version_id.as_deref()
            } else {
                true
            };
            if version_current {
                continue;
            }
        }
        jobs.push(Job {
            src_bucket: options.src_bucket.clone(),
            src_key: src.key.clone(),
            size: src.size,
            des_bucket: options.des_bucket.clone(),
            des_key: join_dest_key(&options.des_prefix, &src.key),
            version_id: src.version_id.clone(),
        });
    }
    (jobs, ignored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::InMemoryLedger;
    use crate::queue::InMemoryQueue;
    use crate::store::InMemoryStore;
    use bytes::Bytes;

    fn listed(key: &str, size: i64) -> ListedObject {
        ListedObject {
            key: key.to_string(),
            size,
            version_id: None,
        }
    }

    fn options() -> SenderOptions {
        SenderOptions {
            src_bucket: "src".to_string(),
            des_bucket: "des".to_string(),
            ..SenderOptions::default()
        }
    }

    #[test]
    fn delta_sends_missing_and_resized_objects() {
        let src = vec![listed("a", 10), listed("b", 20), listed("c", 30)];
        let des = vec![listed("a", 10), listed("b", 99)];
        let (jobs, ignored) =
            delta_job_list(&src, &des, &options(), &GlobSet::empty(), &HashMap::new());
        let keys: Vec<&str> = jobs.iter().map(|j| j.src_key.as_str()).collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert!(ignored.is_empty());
    }

    #[test]
    fn delta_strips_destination_prefix() {
        let mut opts = options();
        opts.des_prefix = "mirror/".to_string();
        let src = vec![listed("a", 10), listed("b", 20)];
        let des = vec![listed("mirror/a", 10)];
        let (jobs, _) = delta_job_list(&src, &des, &opts, &GlobSet::empty(), &HashMap::new());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].src_key, "b");
        assert_eq!(jobs[0].des_key, "mirror/b");
    }

    #[test]
    fn ignore_patterns_match_qualified_keys() {
        let mut opts = options();
        opts.ignore_patterns = vec!["src/logs/*".to_string(), "*/*.tmp".to_string()];
        let ignore = build_ignore_set(&opts.ignore_patterns).unwrap();
        let src = vec![listed("logs/app.log", 10), listed("scratch.tmp", 5), listed("keep", 1)];
        let (jobs, ignored) = delta_job_list(&src, &[], &opts, &ignore, &HashMap::new());
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].src_key, "keep");
        assert_eq!(ignored, vec!["logs/app.log", "scratch.tmp"]);
    }

    #[test]
    fn stale_version_is_resent() {
        let mut opts = options();
        opts.version_aware = true;
        let src = vec![ListedObject {
            key: "a".to_string(),
            size: 10,
            version_id: Some("v2".to_string()),
        }];
        let des = vec![listed("a", 10)];
        let mut versions = HashMap::new();
        versions.insert("src/a".to_string(), "v1".to_string());
        let (jobs, _) = delta_job_list(&src, &des, &opts, &GlobSet::empty(), &versions);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].version_id.as_deref(), Some("v2"));

        versions.insert("src/a".to_string(), "v2".to_string());
        let (jobs, _) = delta_job_list(&src, &des, &opts, &GlobSet::empty(), &versions);
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn run_enqueues_the_delta() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::default());
        let ledger = Arc::new(InMemoryLedger::new());
        src.insert_object("src", "a", Bytes::from_static(b"0123456789"));
        src.insert_object("src", "b", Bytes::from_static(b"0123456789"));
        des.insert_object("des", "a", Bytes::from_static(b"0123456789"));

        let sender = JobSender::new(src, des, queue.clone(), ledger, options());
        let sent = sender.run().await.unwrap();
        assert_eq!(sent, 1);
        let leased = queue.receive(10).await.unwrap();
        assert_eq!(leased.len(), 1);
        let job: Job = serde_json::from_str(&leased[0].body).unwrap();
        assert_eq!(job.src_key, "b");
    }

    #[tokio::test]
    async fn run_refuses_a_backlogged_queue() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::default());
        let ledger = Arc::new(InMemoryLedger::new());
        queue.push("one");
        queue.push("two");

        let sender = JobSender::new(src, des, queue, ledger, options());
        assert!(sender.run().await.is_err());
    }

    #[tokio::test]
    async fn orphan_uploads_are_aborted() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::default());
        let ledger = Arc::new(InMemoryLedger::new());
        src.insert_object("src", "pending", Bytes::from_static(b"0123456789"));
        des.create_multipart_upload("des", "pending", None).await.unwrap();
        des.create_multipart_upload("des", "orphan", None).await.unwrap();

        let mut opts = options();
        opts.clean_unfinished_upload = true;
        let sender = JobSender::new(src, des.clone(), queue, ledger, opts);
        sender.run().await.unwrap();
        let remaining = des.list_open_uploads("des", "").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].key, "pending");
    }
}
