//! Single-part transfer worker.
//!
//! One call moves one chunk: ranged GET from the source, MD5, PUT to
//! the destination upload. The cancellation token is checked before
//! and after every network call so a fleet-wide stop is honored
//! between steps, never mid-request.

use std::sync::Arc;

use md5::{Digest, Md5};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunk::ChunkPlan;
use crate::error::MigrateError;
use crate::resume::RetryPolicy;
use crate::store::ObjectStore;

/// Why a part gave up. `Quit` poisons the whole job; `Timeout` leaves
/// it for a later round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartFailure {
    Quit(String),
    Timeout(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartOutcome {
    pub part_number: i32,
    /// MD5 of the part body. None when a committed part was skipped
    /// without re-reading it.
    pub digest: Option<[u8; 16]>,
    pub bytes: i64,
}

/// Work order for one part.
#[derive(Debug, Clone)]
pub struct PartSpec {
    pub part_number: i32,
    pub offset: i64,
    /// The part is already committed; do not upload. The body is still
    /// fetched when the round needs its digest for verification.
    pub dryrun: bool,
}

/// Everything a part worker needs, shared across the round's pool.
pub struct PartContext {
    pub src: Arc<dyn ObjectStore>,
    pub des: Arc<dyn ObjectStore>,
    pub src_bucket: String,
    pub src_key: String,
    pub des_bucket: String,
    pub des_key: String,
    pub upload_id: String,
    pub version_id: Option<String>,
    pub size: i64,
    pub plan: ChunkPlan,
    pub retry: RetryPolicy,
    /// Whether dryrun parts must still be downloaded for their digest.
    pub need_digest: bool,
    pub cancel: CancellationToken,
}

pub async fn transfer_part(
    ctx: &PartContext,
    spec: &PartSpec,
) -> Result<PartOutcome, PartFailure> {
    if spec.dryrun && !ctx.need_digest {
        return Ok(PartOutcome {
            part_number: spec.part_number,
            digest: None,
            bytes: 0,
        });
    }
    if ctx.cancel.is_cancelled() {
        return Err(PartFailure::Cancelled);
    }

    let (start, end) = ctx.plan.part_range(spec.offset, ctx.size);
    let body = download(ctx, spec, start, end).await?;

    if ctx.cancel.is_cancelled() {
        return Err(PartFailure::Cancelled);
    }

    let digest: [u8; 16] = Md5::digest(&body).into();
    let bytes = body.len() as i64;

    if !spec.dryrun {
        upload(ctx, spec, body, &digest).await?;
        if ctx.cancel.is_cancelled() {
            return Err(PartFailure::Cancelled);
        }
    }

    debug!(
        "part {} of {}/{} done, {} bytes",
        spec.part_number, ctx.src_bucket, ctx.src_key, bytes
    );
    Ok(PartOutcome {
        part_number: spec.part_number,
        digest: Some(digest),
        bytes,
    })
}

async fn download(
    ctx: &PartContext,
    spec: &PartSpec,
    start: i64,
    end: i64,
) -> Result<bytes::Bytes, PartFailure> {
    let mut attempt = 0;
    loop {
        match ctx
            .src
            .get_range(
                &ctx.src_bucket,
                &ctx.src_key,
                ctx.version_id.as_deref(),
                start,
                end,
            )
            .await
        {
            Ok(body) => return Ok(body),
            Err(e) if is_permanent(&e) => {
                warn!(
                    "part {} of {}/{}: unrecoverable download error: {}",
                    spec.part_number, ctx.src_bucket, ctx.src_key, e
                );
                return Err(PartFailure::Quit(e.to_string()));
            }
            Err(e) if attempt < ctx.retry.max_retry => {
                warn!(
                    "part {} download attempt {} failed, retrying: {}",
                    spec.part_number, attempt, e
                );
                tokio::time::sleep(ctx.retry.sleep_for(attempt)).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(PartFailure::Timeout(format!(
                    "download retries exhausted: {}",
                    e
                )));
            }
        }
    }
}

async fn upload(
    ctx: &PartContext,
    spec: &PartSpec,
    body: bytes::Bytes,
    digest: &[u8; 16],
) -> Result<(), PartFailure> {
    let md5 = content_md5_from_digest(digest);
    let mut attempt = 0;
    loop {
        match ctx
            .des
            .upload_part(
                &ctx.des_bucket,
                &ctx.des_key,
                &ctx.upload_id,
                spec.part_number,
                body.clone(),
                &md5,
            )
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if is_permanent(&e) => {
                warn!(
                    "part {} of {}/{}: unrecoverable upload error: {}",
                    spec.part_number, ctx.des_bucket, ctx.des_key, e
                );
                return Err(PartFailure::Quit(e.to_string()));
            }
            Err(e) if attempt < ctx.retry.max_retry => {
                warn!(
                    "part {} upload attempt {} failed, retrying: {}",
                    spec.part_number, attempt, e
                );
                tokio::time::sleep(ctx.retry.sleep_for(attempt)).await;
                attempt += 1;
            }
            Err(e) => {
                return Err(PartFailure::Timeout(format!(
                    "upload retries exhausted: {}",
                    e
                )));
            }
        }
    }
}

fn is_permanent(err: &MigrateError) -> bool {
    match err {
        MigrateError::Store { kind, .. } => kind.is_permanent(),
        _ => false,
    }
}

fn content_md5_from_digest(digest: &[u8; 16]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk;
    use crate::store::InMemoryStore;
    use bytes::Bytes;
    use std::time::Duration;

    fn context(src: Arc<InMemoryStore>, des: Arc<InMemoryStore>, size: i64) -> PartContext {
        PartContext {
            src,
            des,
            src_bucket: "src".to_string(),
            src_key: "k".to_string(),
            des_bucket: "des".to_string(),
            des_key: "k".to_string(),
            upload_id: String::new(),
            version_id: None,
            size,
            plan: chunk::plan(size, 8),
            retry: RetryPolicy {
                max_retry: 2,
                backoff_unit: Duration::from_millis(1),
            },
            need_digest: false,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn moves_one_part_with_checksum() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        src.insert_object("src", "k", Bytes::from_static(b"0123456789abcdef"));
        let upload_id = des.create_multipart_upload("des", "k", None).await.unwrap();

        let mut ctx = context(src, des.clone(), 16);
        ctx.upload_id = upload_id.clone();
        let spec = PartSpec {
            part_number: 2,
            offset: 8,
            dryrun: false,
        };
        let outcome = transfer_part(&ctx, &spec).await.unwrap();
        assert_eq!(outcome.bytes, 8);
        assert_eq!(
            outcome.digest,
            Some(Md5::digest(b"89abcdef").into())
        );
        assert_eq!(des.part_upload_count(), 1);
    }

    #[tokio::test]
    async fn dryrun_part_skips_network_entirely() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        src.insert_object("src", "k", Bytes::from_static(b"0123456789abcdef"));

        let ctx = context(src.clone(), des, 16);
        let spec = PartSpec {
            part_number: 1,
            offset: 0,
            dryrun: true,
        };
        let outcome = transfer_part(&ctx, &spec).await.unwrap();
        assert_eq!(outcome.digest, None);
        assert_eq!(src.range_get_count(), 0);
    }

    #[tokio::test]
    async fn dryrun_still_downloads_when_digest_needed() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        src.insert_object("src", "k", Bytes::from_static(b"0123456789abcdef"));

        let mut ctx = context(src.clone(), des.clone(), 16);
        ctx.need_digest = true;
        let spec = PartSpec {
            part_number: 1,
            offset: 0,
            dryrun: true,
        };
        let outcome = transfer_part(&ctx, &spec).await.unwrap();
        assert!(outcome.digest.is_some());
        assert_eq!(src.range_get_count(), 1);
        assert_eq!(des.part_upload_count(), 0);
    }

    #[tokio::test]
    async fn transient_download_errors_retry_then_succeed() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        src.insert_object("src", "k", Bytes::from_static(b"0123456789abcdef"));
        src.fail_next_gets(2);
        let upload_id = des.create_multipart_upload("des", "k", None).await.unwrap();

        let mut ctx = context(src, des, 16);
        ctx.upload_id = upload_id;
        let spec = PartSpec {
            part_number: 1,
            offset: 0,
            dryrun: false,
        };
        assert!(transfer_part(&ctx, &spec).await.is_ok());
    }

    #[tokio::test]
    async fn retry_exhaustion_is_a_timeout() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        src.insert_object("src", "k", Bytes::from_static(b"0123456789abcdef"));
        src.fail_next_gets(10);

        let ctx = context(src, des, 16);
        let spec = PartSpec {
            part_number: 1,
            offset: 0,
            dryrun: false,
        };
        match transfer_part(&ctx, &spec).await {
            Err(PartFailure::Timeout(_)) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn access_denied_quits_without_retry() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        src.insert_object("src", "k", Bytes::from_static(b"0123456789abcdef"));
        src.deny_access("src", "k");

        let ctx = context(src, des, 16);
        let spec = PartSpec {
            part_number: 1,
            offset: 0,
            dryrun: false,
        };
        match transfer_part(&ctx, &spec).await {
            Err(PartFailure::Quit(_)) => {}
            other => panic!("expected quit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn missing_upload_quits() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        src.insert_object("src", "k", Bytes::from_static(b"0123456789abcdef"));

        let mut ctx = context(src, des, 16);
        ctx.upload_id = "gone".to_string();
        let spec = PartSpec {
            part_number: 1,
            offset: 0,
            dryrun: false,
        };
        match transfer_part(&ctx, &spec).await {
            Err(PartFailure::Quit(_)) => {}
            other => panic!("expected quit, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_download() {
        let src = Arc::new(InMemoryStore::new());
        let des = Arc::new(InMemoryStore::new());
        src.insert_object("src", "k", Bytes::from_static(b"0123456789abcdef"));

        let ctx = context(src.clone(), des, 16);
        ctx.cancel.cancel();
        let spec = PartSpec {
            part_number: 1,
            offset: 0,
            dryrun: false,
        };
        assert_eq!(
            transfer_part(&ctx, &spec).await,
            Err(PartFailure::Cancelled)
        );
        assert_eq!(src.range_get_count(), 0);
    }
}
