//! Queue-driven worker loop.
//!
//! Several lease loops poll the job queue in parallel, run each job
//! through the transfer engine, and acknowledge the message according
//! to its outcome. Messages are deleted on `Done`, `Quit` and `Error`;
//! a `Timeout` leaves the message leased so it reappears for another
//! round, and a malformed body is left alone so the queue's own
//! dead-letter policy can collect it.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::job::{parse_message, EventDestination, ParsedMessage};
use crate::queue::{JobQueue, QueueMessage};
use crate::transfer::{Outcome, TransferEngine};

pub struct JobLooper {
    queue: Arc<dyn JobQueue>,
    engine: Arc<TransferEngine>,
    event_dest: EventDestination,
    max_parallel_files: usize,
    /// Pause after an empty poll before asking the queue again.
    poll_idle: Duration,
    /// Pause after a queue error.
    error_backoff: Duration,
}

impl JobLooper {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        engine: Arc<TransferEngine>,
        event_dest: EventDestination,
        max_parallel_files: usize,
    ) -> Self {
        Self {
            queue,
            engine,
            event_dest,
            max_parallel_files,
            poll_idle: Duration::from_secs(60),
            error_backoff: Duration::from_secs(5),
        }
    }

    pub fn with_idle(mut self, poll_idle: Duration, error_backoff: Duration) -> Self {
        self.poll_idle = poll_idle;
        self.error_backoff = error_backoff;
        self
    }

    /// Run lease loops until the token is cancelled. Jobs in flight at
    /// cancellation finish their current round as a timeout, leaving
    /// their messages on the queue.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut handles = Vec::with_capacity(self.max_parallel_files);
        for slot in 0..self.max_parallel_files {
            let looper = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                looper.lease_loop(slot, cancel).await;
            }));
        }
        for handle in handles {
            let _ = handle.await;
        }
        info!("job loop stopped");
    }

    async fn lease_loop(&self, slot: usize, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let leased = match self.queue.receive(1).await {
                Ok(leased) => leased,
                Err(e) => {
                    error!("slot {}: receive failed: {}", slot, e);
                    if sleep_or_cancel(self.error_backoff, &cancel).await {
                        return;
                    }
                    continue;
                }
            };
            if leased.is_empty() {
                if sleep_or_cancel(self.poll_idle, &cancel).await {
                    return;
                }
                continue;
            }
            for message in leased {
                self.handle_message(slot, message, &cancel).await;
            }
        }
    }

    async fn handle_message(&self, slot: usize, message: QueueMessage, cancel: &CancellationToken) {
        let parsed = match parse_message(&message.body, &self.event_dest) {
            Ok(parsed) => parsed,
            Err(e) => {
                // Not deleted: the queue's dead-letter policy collects
                // bodies that never parse.
                warn!("slot {}: undecodable message left on queue: {}", slot, e);
                return;
            }
        };
        match parsed {
            ParsedMessage::TestEvent => {
                info!("slot {}: acknowledged queue self-test event", slot);
                self.ack(&message).await;
            }
            ParsedMessage::OtherEvent(event) => {
                warn!("slot {}: ignoring unexpected event {}", slot, event);
                self.ack(&message).await;
            }
            ParsedMessage::Job(job) => {
                info!(
                    "slot {}: starting {}/{} ({} bytes)",
                    slot, job.src_bucket, job.src_key, job.size
                );
                match self.engine.execute(&job, cancel).await {
                    Outcome::Done => self.ack(&message).await,
                    Outcome::Quit => {
                        warn!("slot {}: unrecoverable job {}", slot, job.ledger_key());
                        self.ack(&message).await;
                    }
                    Outcome::Error(reason) => {
                        error!("slot {}: job {} failed: {}", slot, job.ledger_key(), reason);
                        self.ack(&message).await;
                    }
                    Outcome::Timeout => {
                        // Retained: the message reappears after its
                        // visibility timeout and the next round resumes
                        // from committed parts.
                        warn!("slot {}: job {} timed out, retained", slot, job.ledger_key());
                    }
                }
            }
        }
    }

    async fn ack(&self, message: &QueueMessage) {
        if let Err(e) = self.queue.delete(&message.receipt).await {
            warn!("deleting message failed, it will redeliver: {}", e);
        }
    }
}

/// True when the token fired before the interval elapsed.
async fn sleep_or_cancel(interval: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(interval) => false,
        _ = cancel.cancelled() => true,
    }
}
