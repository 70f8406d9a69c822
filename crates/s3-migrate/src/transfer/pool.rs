//! Bounded worker pool for one multipart round.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::part::{transfer_part, PartContext, PartFailure, PartOutcome, PartSpec};

#[derive(Debug)]
pub enum RoundFailure {
    Quit(String),
    Timeout(String),
}

/// Run all parts of a round through at most `max_threads` concurrent
/// workers, bounded by the round's wall-clock budget. Returns the MD5
/// digests of every part that was read this round, keyed by part
/// number.
pub async fn run_part_pool(
    ctx: Arc<PartContext>,
    specs: Vec<PartSpec>,
    max_threads: usize,
    job_timeout: Duration,
    fleet_cancel: &CancellationToken,
) -> Result<BTreeMap<i32, [u8; 16]>, RoundFailure> {
    let semaphore = Arc::new(Semaphore::new(max_threads.max(1)));
    let (tx, mut rx) = mpsc::channel::<Result<PartOutcome, PartFailure>>(specs.len().max(1));
    let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(specs.len());
    for spec in specs {
        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire().await else {
                return;
            };
            let result = transfer_part(&ctx, &spec).await;
            let _ = tx.send(result).await;
        }));
    }
    drop(tx);

    let deadline = tokio::time::sleep(job_timeout);
    tokio::pin!(deadline);
    let mut digests = BTreeMap::new();
    let mut timed_out: Option<String> = None;
    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(Ok(outcome)) => {
                    if let Some(digest) = outcome.digest {
                        digests.insert(outcome.part_number, digest);
                    }
                }
                Some(Err(PartFailure::Quit(reason))) => {
                    ctx.cancel.cancel();
                    abort_all(&handles);
                    return Err(RoundFailure::Quit(reason));
                }
                Some(Err(PartFailure::Timeout(reason))) => {
                    // Signal the rest of the round down. Parts already
                    // past their upload still report in and shrink the
                    // next round; queued parts stop at their next check.
                    ctx.cancel.cancel();
                    if timed_out.is_none() {
                        timed_out = Some(reason);
                    }
                }
                Some(Err(PartFailure::Cancelled)) => {}
                None => break,
            },
            _ = &mut deadline => {
                warn!("round exceeded its {}s budget", job_timeout.as_secs());
                ctx.cancel.cancel();
                abort_all(&handles);
                return Err(RoundFailure::Timeout("wall-clock budget exceeded".to_string()));
            }
            _ = fleet_cancel.cancelled() => {
                ctx.cancel.cancel();
                abort_all(&handles);
                return Err(RoundFailure::Timeout("shutdown requested".to_string()));
            }
        }
    }
    match timed_out {
        Some(reason) => Err(RoundFailure::Timeout(reason)),
        None => Ok(digests),
    }
}

fn abort_all(handles: &[JoinHandle<()>]) {
    for handle in handles {
        handle.abort();
    }
}
