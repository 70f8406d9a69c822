//! # s3-migrate
//!
//! Distributed S3-to-S3 bucket migration library.
//!
//! This library provides the core functionality for moving large object
//! sets between buckets, across regions or providers, with support for:
//!
//! - **Resumable multipart transfers** that restart from committed parts
//! - **Queue-driven worker fleets** with at-least-once job delivery
//! - **Delta job sending** that diffs source against destination
//! - **Aggregate checksum verification** of every completed object
//! - **Progress ledger** recording per-object rounds and outcomes
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use s3_migrate::{Config, Environment, S3Store, SqsQueue, InMemoryLedger};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let aws = aws_config::load_from_env().await;
//!     let s3 = Arc::new(S3Store::new(aws_sdk_s3::Client::new(&aws)));
//!     let queue = SqsQueue::connect(aws_sdk_sqs::Client::new(&aws), &config.queue.name).await?;
//!     let env = Environment::new(
//!         s3.clone(),
//!         s3,
//!         Arc::new(queue),
//!         Arc::new(InMemoryLedger::new()),
//!         config,
//!     );
//!     Arc::new(env.looper()).run(Default::default()).await;
//!     Ok(())
//! }
//! ```

pub mod chunk;
pub mod config;
pub mod env;
pub mod error;
pub mod job;
pub mod jobsender;
pub mod ledger;
pub mod looper;
pub mod queue;
pub mod resume;
pub mod store;
pub mod transfer;

// Re-exports for convenient access
pub use config::{Config, EndpointConfig, LedgerConfig, QueueConfig, TransferConfig};
pub use env::Environment;
pub use error::{MigrateError, Result};
pub use job::{Job, ParsedMessage};
pub use jobsender::{JobSender, SenderOptions};
pub use ledger::{DynamoLedger, InMemoryLedger, ProgressLedger, TerminalStatus};
pub use looper::JobLooper;
pub use queue::{InMemoryQueue, JobQueue, SqsQueue};
pub use store::{InMemoryStore, ObjectStore, S3Store};
pub use transfer::{Outcome, TransferEngine, TransferOptions};
