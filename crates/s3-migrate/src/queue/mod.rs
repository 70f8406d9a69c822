//! Job queue abstraction.
//!
//! Delivery is at-least-once: a message stays on the queue until the
//! worker explicitly deletes it, and reappears after its visibility
//! timeout if the worker dies mid-transfer.

mod mem;
mod sqs;

pub use mem::InMemoryQueue;
pub use sqs::SqsQueue;

use async_trait::async_trait;

use crate::error::Result;

/// A message leased from the queue. `receipt` identifies this
/// particular delivery for deletion.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub body: String,
    pub receipt: String,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Lease up to `max` messages. An empty vec means the queue had
    /// nothing visible right now.
    async fn receive(&self, max: i32) -> Result<Vec<QueueMessage>>;

    /// Acknowledge one delivery so it is never redelivered.
    async fn delete(&self, receipt: &str) -> Result<()>;

    /// Enqueue a batch of message bodies.
    async fn send_batch(&self, bodies: &[String]) -> Result<()>;

    /// True when the queue holds no backlog. A single visible message
    /// is tolerated so a leftover `s3:TestEvent` does not block a
    /// fresh send.
    async fn is_empty(&self) -> Result<bool>;
}
