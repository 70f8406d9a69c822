//! SQS-backed [`JobQueue`].

use async_trait::async_trait;
use aws_sdk_sqs::types::{QueueAttributeName, SendMessageBatchRequestEntry};
use aws_sdk_sqs::Client;
use tracing::warn;

use crate::error::{MigrateError, Result};

use super::{JobQueue, QueueMessage};

/// SQS limits batch sends to 10 entries per request.
const BATCH_LIMIT: usize = 10;

pub struct SqsQueue {
    client: Client,
    queue_url: String,
}

impl SqsQueue {
    pub fn new(client: Client, queue_url: String) -> Self {
        Self { client, queue_url }
    }

    /// Resolve a queue name to its URL and wrap the client.
    pub async fn connect(client: Client, queue_name: &str) -> Result<Self> {
        let resp = client
            .get_queue_url()
            .queue_name(queue_name)
            .send()
            .await
            .map_err(|e| MigrateError::Queue(format!("get_queue_url {}: {}", queue_name, e)))?;
        let queue_url = resp
            .queue_url()
            .ok_or_else(|| MigrateError::Queue(format!("queue {} has no url", queue_name)))?
            .to_string();
        Ok(Self::new(client, queue_url))
    }

    async fn attribute(&self, name: QueueAttributeName) -> Result<i64> {
        let resp = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(name.clone())
            .send()
            .await
            .map_err(|e| MigrateError::Queue(format!("get_queue_attributes: {}", e)))?;
        let value = resp
            .attributes()
            .and_then(|a| a.get(&name))
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        Ok(value)
    }
}

#[async_trait]
impl JobQueue for SqsQueue {
    async fn receive(&self, max: i32) -> Result<Vec<QueueMessage>> {
        let resp = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max)
            .send()
            .await
            .map_err(|e| MigrateError::Queue(format!("receive_message: {}", e)))?;
        let mut leased = Vec::new();
        for m in resp.messages() {
            let (Some(body), Some(receipt)) = (m.body(), m.receipt_handle()) else {
                continue;
            };
            leased.push(QueueMessage {
                body: body.to_string(),
                receipt: receipt.to_string(),
            });
        }
        Ok(leased)
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|e| MigrateError::Queue(format!("delete_message: {}", e)))?;
        Ok(())
    }

    async fn send_batch(&self, bodies: &[String]) -> Result<()> {
        for chunk in bodies.chunks(BATCH_LIMIT) {
            let mut entries = Vec::with_capacity(chunk.len());
            for (i, body) in chunk.iter().enumerate() {
                let entry = SendMessageBatchRequestEntry::builder()
                    .id(i.to_string())
                    .message_body(body)
                    .build()
                    .map_err(|e| MigrateError::Queue(format!("batch entry: {}", e)))?;
                entries.push(entry);
            }
            let resp = self
                .client
                .send_message_batch()
                .queue_url(&self.queue_url)
                .set_entries(Some(entries))
                .send()
                .await
                .map_err(|e| MigrateError::Queue(format!("send_message_batch: {}", e)))?;
            for failed in resp.failed() {
                warn!(
                    "batch entry {} rejected: {}",
                    failed.id(),
                    failed.message().unwrap_or("unknown")
                );
            }
            if !resp.failed().is_empty() {
                return Err(MigrateError::Queue(format!(
                    "{} batch entries rejected",
                    resp.failed().len()
                )));
            }
        }
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool> {
        let visible = self
            .attribute(QueueAttributeName::ApproximateNumberOfMessages)
            .await?;
        let in_flight = self
            .attribute(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .await?;
        Ok(visible <= 1 && in_flight == 0)
    }
}
