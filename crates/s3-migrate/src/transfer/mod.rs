//! Transfer engine.
//!
//! One [`TransferEngine::execute`] call moves one object. Objects at or
//! below the resumable threshold go through a single GET/PUT; larger
//! objects use a resumable multipart upload driven by a bounded part
//! pool. Every outcome is reported to the progress ledger, but ledger
//! failures never fail a transfer.

mod pool;
pub mod part;

pub use part::{PartFailure, PartOutcome, PartSpec};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use md5::{Digest, Md5};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chunk::{self, ChunkPlan};
use crate::error::{MigrateError, Result};
use crate::job::Job;
use crate::ledger::{ProgressLedger, RoundStart, TerminalStatus};
use crate::resume::{ResumeInspector, RetryPolicy};
use crate::store::ObjectStore;

use part::PartContext;
use pool::{run_part_pool, RoundFailure};

/// Content-MD5 header value for a body.
pub fn content_md5(body: &Bytes) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(Md5::digest(body))
}

/// How one job ended. `Timeout` is the only retriable outcome: the
/// job loop keeps the message on the queue so another round can resume
/// from committed parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Error(String),
    Timeout,
    Quit,
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub chunk_size: i64,
    pub resumable_threshold: i64,
    pub max_threads: usize,
    pub max_retry: u32,
    pub backoff_unit: Duration,
    pub job_timeout: Duration,
    pub verify_md5_twice: bool,
    pub update_version_id: bool,
    pub get_object_with_version_id: bool,
    pub storage_class: Option<String>,
    /// Whole-object retries after an aggregate checksum mismatch.
    pub max_md5_retry: u32,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            chunk_size: 5 * 1024 * 1024,
            resumable_threshold: 5 * 1024 * 1024,
            max_threads: 5,
            max_retry: 5,
            backoff_unit: Duration::from_secs(5),
            job_timeout: Duration::from_secs(3600),
            verify_md5_twice: false,
            update_version_id: false,
            get_object_with_version_id: false,
            storage_class: None,
            max_md5_retry: 2,
        }
    }
}

impl TransferOptions {
    fn retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_retry: self.max_retry,
            backoff_unit: self.backoff_unit,
        }
    }
}

pub struct TransferEngine {
    src: Arc<dyn ObjectStore>,
    des: Arc<dyn ObjectStore>,
    ledger: Arc<dyn ProgressLedger>,
    options: TransferOptions,
    worker_id: String,
}

impl TransferEngine {
    pub fn new(
        src: Arc<dyn ObjectStore>,
        des: Arc<dyn ObjectStore>,
        ledger: Arc<dyn ProgressLedger>,
        options: TransferOptions,
        worker_id: String,
    ) -> Self {
        Self {
            src,
            des,
            ledger,
            options,
            worker_id,
        }
    }

    /// Move one object from source to destination.
    pub async fn execute(&self, job: &Job, cancel: &CancellationToken) -> Outcome {
        let outcome = if job.size <= self.options.resumable_threshold {
            self.transfer_small(job, cancel).await
        } else {
            self.transfer_multipart(job, cancel).await
        };
        let status = match &outcome {
            Outcome::Done => None, // recorded with the etag at completion
            Outcome::Error(_) => Some(TerminalStatus::Err),
            Outcome::Timeout => Some(TerminalStatus::Timeout),
            Outcome::Quit => Some(TerminalStatus::Quit),
        };
        if let Some(status) = status {
            self.record_terminal(&job.ledger_key(), status, None).await;
        }
        outcome
    }

    async fn record_terminal(&self, key: &str, status: TerminalStatus, etag: Option<&str>) {
        if let Err(e) = self.ledger.record_terminal(key, status, etag).await {
            warn!("ledger terminal write for {} failed: {}", key, e);
        }
    }

    async fn record_round(&self, round: &RoundStart) {
        if let Err(e) = self.ledger.record_round_start(round).await {
            warn!("ledger round write for {} failed: {}", round.key, e);
        }
    }

    /// Source version this transfer reads. Jobs may carry one already;
    /// otherwise the source is headed when version pinning is on.
    async fn resolve_version(&self, job: &Job) -> Option<String> {
        if let Some(v) = job.effective_version() {
            return Some(v.to_string());
        }
        if !(self.options.update_version_id || self.options.get_object_with_version_id) {
            return None;
        }
        match self.src.head_object(&job.src_bucket, &job.src_key).await {
            Ok(head) => head.version_id,
            Err(e) => {
                warn!(
                    "head {}/{} for version pin failed: {}",
                    job.src_bucket, job.src_key, e
                );
                None
            }
        }
    }

    fn read_version<'a>(&self, version: &'a Option<String>) -> Option<&'a str> {
        if self.options.get_object_with_version_id {
            version.as_deref()
        } else {
            None
        }
    }

    async fn transfer_small(&self, job: &Job, cancel: &CancellationToken) -> Outcome {
        let key = job.ledger_key();
        let version = self.resolve_version(job).await;
        self.record_round(&RoundStart {
            key: key.clone(),
            percent: 0,
            size: job.size,
            des_bucket: job.des_bucket.clone(),
            des_key: job.des_key.clone(),
            version_id: version.clone(),
            worker_id: self.worker_id.clone(),
            first_round: true,
        })
        .await;

        let retry = self.options.retry();
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Outcome::Timeout;
            }
            match self.copy_whole(job, self.read_version(&version)).await {
                Ok(etag) => {
                    info!("done: {}/{} ({} bytes)", job.src_bucket, job.src_key, job.size);
                    self.ledger_done(&key, &etag).await;
                    return Outcome::Done;
                }
                Err(e) if is_permanent(&e) => {
                    error!("quit on {}/{}: {}", job.src_bucket, job.src_key, e);
                    return Outcome::Quit;
                }
                Err(e) if attempt < retry.max_retry => {
                    warn!(
                        "copy {}/{} attempt {} failed, retrying: {}",
                        job.src_bucket, job.src_key, attempt, e
                    );
                    tokio::time::sleep(retry.sleep_for(attempt)).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("copy {}/{} retries exhausted: {}", job.src_bucket, job.src_key, e);
                    return Outcome::Timeout;
                }
            }
        }
    }

    async fn copy_whole(&self, job: &Job, version: Option<&str>) -> Result<String> {
        let body = self
            .src
            .get_object(&job.src_bucket, &job.src_key, version)
            .await?;
        let md5 = content_md5(&body);
        self.des
            .put_object(
                &job.des_bucket,
                &job.des_key,
                body,
                &md5,
                self.options.storage_class.as_deref(),
            )
            .await
    }

    async fn ledger_done(&self, key: &str, etag: &str) {
        if let Err(e) = self
            .ledger
            .record_terminal(key, TerminalStatus::Done, Some(etag))
            .await
        {
            warn!("ledger done write for {} failed: {}", key, e);
        }
    }

    async fn transfer_multipart(&self, job: &Job, cancel: &CancellationToken) -> Outcome {
        let key = job.ledger_key();
        let inspector = ResumeInspector::new(self.des.clone(), self.options.retry());

        for md5_attempt in 0..=self.options.max_md5_retry {
            if cancel.is_cancelled() {
                return Outcome::Timeout;
            }
            // A checksum retry starts over; resuming the deleted object
            // would only rebuild the mismatch.
            let resume = if md5_attempt == 0 {
                match inspector.find_open_upload(&job.des_bucket, &job.des_key).await {
                    Ok(found) => found,
                    Err(e) => {
                        // Non-timeout failure: burns a whole-object
                        // attempt, the next one starts fresh.
                        warn!("resume inspection for {} failed: {}", key, e);
                        continue;
                    }
                }
            } else {
                None
            };

            let round = match self.prepare_round(job, &inspector, resume).await {
                Ok(round) => round,
                Err(PrepareFailure::Quit) => return Outcome::Quit,
                Err(PrepareFailure::Retry) => continue,
            };
            match self.run_round(job, &key, cancel, round).await {
                RoundResult::Done(etag) => {
                    info!("done: {}/{} ({} bytes)", job.src_bucket, job.src_key, job.size);
                    self.ledger_done(&key, &etag).await;
                    return Outcome::Done;
                }
                RoundResult::Mismatch => {
                    warn!(
                        "restarting {}/{} from scratch, attempt {}",
                        job.des_bucket, job.des_key, md5_attempt + 1
                    );
                    continue;
                }
                RoundResult::Fail(outcome) => return outcome,
            }
        }
        error!(
            "object retries exhausted after {} attempts: {}/{}",
            self.options.max_md5_retry + 1,
            job.des_bucket,
            job.des_key
        );
        Outcome::Error("whole-object retries exhausted".to_string())
    }

    async fn prepare_round(
        &self,
        job: &Job,
        inspector: &ResumeInspector,
        resume: Option<crate::store::OpenUpload>,
    ) -> std::result::Result<Round, PrepareFailure> {
        let key = job.ledger_key();
        match resume {
            Some(open) => {
                let committed = match inspector
                    .committed_parts(&job.des_bucket, &job.des_key, &open.upload_id)
                    .await
                {
                    Ok(parts) => parts,
                    Err(e) => {
                        warn!("listing committed parts for {} failed: {}", key, e);
                        return Err(PrepareFailure::Retry);
                    }
                };
                // Read the pinned source version and size back so resumed
                // parts come from the same version the upload began with
                // and line up with the committed chunk plan.
                let (version, pinned_size) = if self.options.update_version_id
                    || self.options.get_object_with_version_id
                {
                    match self.ledger.pinned_version(&key).await {
                        Ok(Some((v, size))) => (Some(v), Some(size)),
                        Ok(None) => (self.resolve_version(job).await, None),
                        Err(e) => {
                            warn!("pinned version read for {} failed: {}", key, e);
                            (None, None)
                        }
                    }
                } else {
                    (None, None)
                };
                info!(
                    "resuming {}/{} with {} committed parts",
                    job.des_bucket,
                    job.des_key,
                    committed.len()
                );
                Ok(Round {
                    upload_id: open.upload_id,
                    committed,
                    version,
                    pinned_size,
                    first_round: false,
                })
            }
            None => {
                let version = self.resolve_version(job).await;
                let upload_id = match self
                    .des
                    .create_multipart_upload(
                        &job.des_bucket,
                        &job.des_key,
                        self.options.storage_class.as_deref(),
                    )
                    .await
                {
                    Ok(id) => id,
                    Err(e) if is_permanent(&e) => {
                        error!("quit creating upload for {}: {}", key, e);
                        return Err(PrepareFailure::Quit);
                    }
                    Err(e) => {
                        warn!("creating upload for {} failed: {}", key, e);
                        return Err(PrepareFailure::Retry);
                    }
                };
                Ok(Round {
                    upload_id,
                    committed: Default::default(),
                    version,
                    pinned_size: None,
                    first_round: true,
                })
            }
        }
    }

    async fn run_round(
        &self,
        job: &Job,
        key: &str,
        cancel: &CancellationToken,
        round: Round,
    ) -> RoundResult {
        let size = round.pinned_size.unwrap_or(job.size);
        let plan = chunk::plan(size, self.options.chunk_size);
        let total = plan.total_parts();
        let percent = (round.committed.len() * 100 / total.max(1)) as u8;
        self.record_round(&RoundStart {
            key: key.to_string(),
            percent,
            size,
            des_bucket: job.des_bucket.clone(),
            des_key: job.des_key.clone(),
            version_id: round.version.clone(),
            worker_id: self.worker_id.clone(),
            first_round: round.first_round,
        })
        .await;

        let specs: Vec<PartSpec> = plan
            .offsets
            .iter()
            .enumerate()
            .map(|(i, &offset)| {
                let part_number = (i + 1) as i32;
                PartSpec {
                    part_number,
                    offset,
                    dryrun: round.committed.contains(&part_number),
                }
            })
            .collect();
        let ctx = Arc::new(PartContext {
            src: self.src.clone(),
            des: self.des.clone(),
            src_bucket: job.src_bucket.clone(),
            src_key: job.src_key.clone(),
            des_bucket: job.des_bucket.clone(),
            des_key: job.des_key.clone(),
            upload_id: round.upload_id.clone(),
            version_id: self.read_version(&round.version).map(str::to_string),
            size,
            plan: plan.clone(),
            retry: self.options.retry(),
            need_digest: self.options.verify_md5_twice,
            cancel: cancel.child_token(),
        });

        let digests = match run_part_pool(
            ctx,
            specs,
            self.options.max_threads,
            self.options.job_timeout,
            cancel,
        )
        .await
        {
            Ok(digests) => digests,
            Err(RoundFailure::Quit(reason)) => {
                error!("quit on {}: {}", key, reason);
                return RoundResult::Fail(Outcome::Quit);
            }
            Err(RoundFailure::Timeout(reason)) => {
                warn!("round on {} timed out: {}", key, reason);
                return RoundResult::Fail(Outcome::Timeout);
            }
        };

        self.complete_round(job, key, &plan, &round.upload_id, digests)
            .await
    }

    /// Close out the upload: re-list parts against the store of record,
    /// complete, and optionally verify the aggregate checksum.
    async fn complete_round(
        &self,
        job: &Job,
        key: &str,
        plan: &ChunkPlan,
        upload_id: &str,
        digests: BTreeMap<i32, [u8; 16]>,
    ) -> RoundResult {
        // List from the destination rather than trusting local results:
        // a part uploaded by a previous worker counts the same as ours.
        let parts = match self.des.list_parts(&job.des_bucket, &job.des_key, upload_id).await {
            Ok(parts) => parts,
            Err(e) if store_kind_is(&e, crate::error::StoreErrorKind::NoSuchUpload) => {
                // Another worker completed this upload already.
                warn!("upload for {} vanished before complete: {}", key, e);
                return RoundResult::Fail(Outcome::Quit);
            }
            Err(e) => {
                warn!("final part listing for {} failed: {}", key, e);
                return RoundResult::Fail(Outcome::Timeout);
            }
        };
        let expected = plan.total_parts();
        if parts.len() != expected {
            error!(
                "{}: {} of {} parts committed at completion time",
                key,
                parts.len(),
                expected
            );
            if let Err(e) = self
                .des
                .abort_multipart_upload(&job.des_bucket, &job.des_key, upload_id)
                .await
            {
                warn!("aborting stale upload {} failed: {}", upload_id, e);
            }
            return RoundResult::Mismatch;
        }
        let etag = match self
            .des
            .complete_multipart_upload(&job.des_bucket, &job.des_key, upload_id, parts)
            .await
        {
            Ok(etag) => etag,
            Err(e) if store_kind_is(&e, crate::error::StoreErrorKind::NoSuchUpload) => {
                warn!("complete for {} lost the race: {}", key, e);
                return RoundResult::Fail(Outcome::Quit);
            }
            Err(e) => {
                warn!("complete for {} failed: {}", key, e);
                return RoundResult::Fail(Outcome::Timeout);
            }
        };

        if self.options.verify_md5_twice {
            if let Some(expected_etag) = aggregate_etag(&digests, plan.total_parts()) {
                if !etags_match(&etag, &expected_etag) {
                    warn!(
                        "{}: destination etag {} != locally computed {}",
                        key, etag, expected_etag
                    );
                    if let Err(e) = self.des.delete_object(&job.des_bucket, &job.des_key).await {
                        warn!("deleting mismatched {} failed: {}", key, e);
                    }
                    return RoundResult::Mismatch;
                }
            }
        }
        RoundResult::Done(etag)
    }
}

struct Round {
    upload_id: String,
    committed: std::collections::HashSet<i32>,
    version: Option<String>,
    /// Size recorded when the upload was created. Overrides the queued
    /// size on resume so part boundaries match the committed parts.
    pinned_size: Option<i64>,
    first_round: bool,
}

enum PrepareFailure {
    Quit,
    Retry,
}

enum RoundResult {
    Done(String),
    Mismatch,
    Fail(Outcome),
}

fn is_permanent(err: &MigrateError) -> bool {
    matches!(err, MigrateError::Store { kind, .. } if kind.is_permanent())
}

fn store_kind_is(err: &MigrateError, wanted: crate::error::StoreErrorKind) -> bool {
    matches!(err, MigrateError::Store { kind, .. } if *kind == wanted)
}

/// Multipart aggregate checksum: MD5 over the concatenated part
/// digests in part order, suffixed with the part count. Requires a
/// digest for every part.
fn aggregate_etag(digests: &BTreeMap<i32, [u8; 16]>, total_parts: usize) -> Option<String> {
    if digests.len() != total_parts {
        return None;
    }
    let mut hasher = Md5::new();
    for digest in digests.values() {
        hasher.update(digest);
    }
    Some(format!("\"{:x}-{}\"", hasher.finalize(), total_parts))
}

fn etags_match(a: &str, b: &str) -> bool {
    a.trim_matches('"') == b.trim_matches('"')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use crate::ledger::InMemoryLedger;
    use crate::store::InMemoryStore;

    fn job(size: i64) -> Job {
        Job {
            src_bucket: "src".to_string(),
            src_key: "data/big.bin".to_string(),
            size,
            des_bucket: "des".to_string(),
            des_key: "data/big.bin".to_string(),
            version_id: None,
        }
    }

    fn options() -> TransferOptions {
        TransferOptions {
            chunk_size: 8,
            resumable_threshold: 8,
            max_threads: 3,
            max_retry: 2,
            backoff_unit: Duration::from_millis(1),
            job_timeout: Duration::from_secs(5),
            verify_md5_twice: true,
            ..TransferOptions::default()
        }
    }

    fn engine(
        src: Arc<InMemoryStore>,
        des: Arc<InMemoryStore>,
        ledger: Arc<InMemoryLedger>,
        options: TransferOptions,
    ) -> TransferEngine {
        TransferEngine::new(src, des, ledger, options, "worker-1".to_string())
    }

    #[tokio::test]
    async fn small_object_goes_through_single_put() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        src.insert_object("src", "data/big.bin", Bytes::from_static(b"tiny"));

        let engine = engine(src, des.clone(), ledger.clone(), options());
        let outcome = engine.execute(&job(4), &CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(
            des.object("des", "data/big.bin"),
            Some(Bytes::from_static(b"tiny"))
        );
        assert_eq!(des.put_count(), 1);
        let record = ledger.record("src/data/big.bin").unwrap();
        assert_eq!(record.status.as_deref(), Some("DONE"));
        assert_eq!(record.percent, 100);
    }

    #[tokio::test]
    async fn large_object_goes_multipart_and_verifies() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let body: Vec<u8> = (0..30u8).collect();
        src.insert_object("src", "data/big.bin", body.clone());

        let engine = engine(src, des.clone(), ledger.clone(), options());
        let outcome = engine.execute(&job(30), &CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(des.object("des", "data/big.bin"), Some(Bytes::from(body)));
        // 30 bytes at chunk 8 is four parts.
        assert_eq!(des.part_upload_count(), 4);
        let etag = des.object_etag("des", "data/big.bin").unwrap();
        assert!(etag.ends_with("-4\""));
        let record = ledger.record("src/data/big.bin").unwrap();
        assert_eq!(record.status.as_deref(), Some("DONE"));
        assert_eq!(record.etag.as_deref(), Some(etag.as_str()));
    }

    #[tokio::test]
    async fn resume_skips_committed_parts() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let body: Vec<u8> = (0..30u8).collect();
        src.insert_object("src", "data/big.bin", body.clone());

        // A previous worker committed parts 1 and 2 before dying.
        let upload_id = des
            .create_multipart_upload("des", "data/big.bin", None)
            .await
            .unwrap();
        for (n, range) in [(1, 0..8), (2, 8..16)] {
            let part = Bytes::copy_from_slice(&body[range]);
            let md5 = content_md5(&part);
            des.upload_part("des", "data/big.bin", &upload_id, n, part, &md5)
                .await
                .unwrap();
        }
        let uploaded_before = des.part_upload_count();

        let mut opts = options();
        opts.verify_md5_twice = false;
        let engine = engine(src.clone(), des.clone(), ledger, opts);
        let outcome = engine.execute(&job(30), &CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(des.object("des", "data/big.bin"), Some(Bytes::from(body)));
        // Only parts 3 and 4 were transferred this round.
        assert_eq!(des.part_upload_count() - uploaded_before, 2);
        assert_eq!(src.range_get_count(), 2);
    }

    #[tokio::test]
    async fn resume_with_verification_rereads_committed_parts() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let body: Vec<u8> = (0..30u8).collect();
        src.insert_object("src", "data/big.bin", body.clone());
        let upload_id = des
            .create_multipart_upload("des", "data/big.bin", None)
            .await
            .unwrap();
        let part = Bytes::copy_from_slice(&body[0..8]);
        let md5 = content_md5(&part);
        des.upload_part("des", "data/big.bin", &upload_id, 1, part, &md5)
            .await
            .unwrap();

        let engine = engine(src.clone(), des.clone(), ledger, options());
        let outcome = engine.execute(&job(30), &CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Done);
        // All four parts were read for digests, but part 1 was not
        // uploaded again.
        assert_eq!(src.range_get_count(), 4);
        assert_eq!(des.part_upload_count(), 4);
    }

    #[tokio::test]
    async fn redundant_delivery_quits_without_touching_the_finished_object() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let body: Vec<u8> = (0..30u8).collect();
        src.insert_object("src", "data/big.bin", body.clone());

        // Every part already committed by the first delivery's worker.
        let upload_id = des
            .create_multipart_upload("des", "data/big.bin", None)
            .await
            .unwrap();
        for (n, range) in [(1, 0..8), (2, 8..16), (3, 16..24), (4, 24..30)] {
            let part = Bytes::copy_from_slice(&body[range]);
            let md5 = content_md5(&part);
            des.upload_part("des", "data/big.bin", &upload_id, n, part, &md5)
                .await
                .unwrap();
        }

        // That worker finishes the upload while this delivery is mid-round.
        let racer = {
            let des = des.clone();
            let upload_id = upload_id.clone();
            tokio::spawn(async move {
                let parts = des
                    .list_parts("des", "data/big.bin", &upload_id)
                    .await
                    .unwrap();
                des.complete_multipart_upload("des", "data/big.bin", &upload_id, parts)
                    .await
                    .unwrap()
            })
        };

        let mut opts = options();
        opts.verify_md5_twice = false;
        let engine = engine(src, des.clone(), ledger.clone(), opts);
        let outcome = engine.execute(&job(30), &CancellationToken::new()).await;
        let etag = racer.await.unwrap();

        assert_eq!(outcome, Outcome::Quit);
        assert_eq!(des.object("des", "data/big.bin"), Some(Bytes::from(body)));
        assert_eq!(des.object_etag("des", "data/big.bin"), Some(etag));
        assert_eq!(
            ledger.record("src/data/big.bin").unwrap().status.as_deref(),
            Some("QUIT")
        );
    }

    #[tokio::test]
    async fn denied_source_quits() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let body: Vec<u8> = (0..30u8).collect();
        src.insert_object("src", "data/big.bin", body);
        src.deny_access("src", "data/big.bin");

        let engine = engine(src, des, ledger.clone(), options());
        let outcome = engine.execute(&job(30), &CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Quit);
        assert_eq!(
            ledger.record("src/data/big.bin").unwrap().status.as_deref(),
            Some("QUIT")
        );
    }

    #[tokio::test]
    async fn missing_small_object_quits() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());

        let engine = engine(src, des, ledger, options());
        let outcome = engine.execute(&job(4), &CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Quit);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_part_hits_wall_clock_timeout() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let body: Vec<u8> = (0..30u8).collect();
        src.insert_object("src", "data/big.bin", body);
        src.stall_range_at(16);

        let mut opts = options();
        opts.verify_md5_twice = false;
        opts.job_timeout = Duration::from_millis(200);
        let engine = engine(src, des, ledger.clone(), opts);
        let outcome = engine.execute(&job(30), &CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Timeout);
        assert_eq!(
            ledger.record("src/data/big.bin").unwrap().status.as_deref(),
            Some("TIMEOUT")
        );
    }

    #[tokio::test]
    async fn failed_resume_inspection_burns_an_attempt_not_the_job() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let body: Vec<u8> = (0..30u8).collect();
        src.insert_object("src", "data/big.bin", body.clone());
        // Inspection never succeeds; the next whole-object attempt
        // starts a fresh upload instead of bouncing as a timeout.
        des.fail_next_upload_listings(100);

        let engine = engine(src, des.clone(), ledger, options());
        let outcome = engine.execute(&job(30), &CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(des.object("des", "data/big.bin"), Some(Bytes::from(body)));
    }

    #[tokio::test]
    async fn unreachable_upload_creation_ends_in_error() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let body: Vec<u8> = (0..30u8).collect();
        src.insert_object("src", "data/big.bin", body);
        des.fail_next_creates(100);

        let engine = engine(src, des, ledger.clone(), options());
        let outcome = engine.execute(&job(30), &CancellationToken::new()).await;
        assert!(matches!(outcome, Outcome::Error(_)));
        assert_eq!(
            ledger.record("src/data/big.bin").unwrap().status.as_deref(),
            Some("ERR")
        );
    }

    #[tokio::test]
    async fn resume_uses_pinned_size_over_queued_size() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let body: Vec<u8> = (0..30u8).collect();
        src.insert_object("src", "data/big.bin", body.clone());

        // An earlier worker planned against 30 bytes and committed
        // part 1 before dying.
        let upload_id = des
            .create_multipart_upload("des", "data/big.bin", None)
            .await
            .unwrap();
        let part = Bytes::copy_from_slice(&body[0..8]);
        let md5 = content_md5(&part);
        des.upload_part("des", "data/big.bin", &upload_id, 1, part, &md5)
            .await
            .unwrap();
        ledger.pin_version("src/data/big.bin", "v1", 30);

        // The queued size has drifted; the pinned size keeps the part
        // boundaries aligned with the committed part.
        let mut opts = options();
        opts.update_version_id = true;
        let engine = engine(src, des.clone(), ledger, opts);
        let outcome = engine.execute(&job(16), &CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(des.object("des", "data/big.bin"), Some(Bytes::from(body)));
    }

    #[tokio::test]
    async fn version_pin_written_on_first_round() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        let ledger = Arc::new(InMemoryLedger::new());
        let body: Vec<u8> = (0..30u8).collect();
        src.insert_object("src", "data/big.bin", body);

        let mut opts = options();
        opts.update_version_id = true;
        let engine = engine(src.clone(), des, ledger.clone(), opts);
        let outcome = engine.execute(&job(30), &CancellationToken::new()).await;
        assert_eq!(outcome, Outcome::Done);
        let pinned = ledger.pinned_version("src/data/big.bin").await.unwrap();
        assert!(pinned.is_some());
    }

    #[test]
    fn aggregate_etag_matches_store_format() {
        let mut digests = BTreeMap::new();
        digests.insert(1, Md5::digest(b"part one").into());
        digests.insert(2, Md5::digest(b"part two").into());
        let etag = aggregate_etag(&digests, 2).unwrap();
        assert!(etag.starts_with('"'));
        assert!(etag.ends_with("-2\""));
        assert!(aggregate_etag(&digests, 3).is_none());
    }
}
