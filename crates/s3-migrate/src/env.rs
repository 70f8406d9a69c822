//! Shared runtime environment.
//!
//! All cross-cutting handles travel in one value instead of process
//! globals, so a test can assemble an environment from in-memory
//! implementations.

use std::sync::Arc;

use uuid::Uuid;

use crate::config::Config;
use crate::job::EventDestination;
use crate::jobsender::JobSender;
use crate::ledger::ProgressLedger;
use crate::looper::JobLooper;
use crate::queue::JobQueue;
use crate::store::ObjectStore;
use crate::transfer::TransferEngine;

pub struct Environment {
    pub src: Arc<dyn ObjectStore>,
    pub des: Arc<dyn ObjectStore>,
    pub queue: Arc<dyn JobQueue>,
    pub ledger: Arc<dyn ProgressLedger>,
    pub config: Config,
    /// Identifies this process in the ledger's worker set.
    pub worker_id: String,
}

impl Environment {
    pub fn new(
        src: Arc<dyn ObjectStore>,
        des: Arc<dyn ObjectStore>,
        queue: Arc<dyn JobQueue>,
        ledger: Arc<dyn ProgressLedger>,
        config: Config,
    ) -> Self {
        let worker_id = format!("worker-{}", Uuid::new_v4());
        Self {
            src,
            des,
            queue,
            ledger,
            config,
            worker_id,
        }
    }

    pub fn engine(&self) -> Arc<TransferEngine> {
        Arc::new(TransferEngine::new(
            self.src.clone(),
            self.des.clone(),
            self.ledger.clone(),
            self.config.transfer.transfer_options(),
            self.worker_id.clone(),
        ))
    }

    /// Queue-driven worker loop over this environment.
    pub fn looper(&self) -> JobLooper {
        let event_dest = EventDestination {
            bucket: Some(self.config.target.bucket.clone()),
            prefix: self.config.target.prefix.clone(),
        };
        JobLooper::new(
            self.queue.clone(),
            self.engine(),
            event_dest,
            self.config.transfer.get_max_parallel_files(),
        )
    }

    /// Delta job sender over this environment.
    pub fn sender(&self) -> JobSender {
        JobSender::new(
            self.src.clone(),
            self.des.clone(),
            self.queue.clone(),
            self.ledger.clone(),
            self.config.sender_options(),
        )
    }
}
