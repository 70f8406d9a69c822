//! In-memory queue with visibility-timeout redelivery, used by tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

use super::{JobQueue, QueueMessage};

struct Pending {
    body: String,
    receipt: String,
    /// None while visible, Some(deadline) while leased.
    invisible_until: Option<DateTime<Utc>>,
}

pub struct InMemoryQueue {
    messages: Mutex<Vec<Pending>>,
    seq: AtomicU64,
    visibility: Duration,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl InMemoryQueue {
    pub fn new(visibility: Duration) -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            visibility,
        }
    }

    pub fn push(&self, body: impl Into<String>) {
        let receipt = format!("rcpt-{}", self.seq.fetch_add(1, Ordering::SeqCst));
        self.messages.lock().unwrap().push(Pending {
            body: body.into(),
            receipt,
            invisible_until: None,
        });
    }

    /// Messages currently on the queue, leased or not.
    pub fn depth(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    /// Force all leases to expire so leased messages become visible again.
    pub fn expire_leases(&self) {
        for m in self.messages.lock().unwrap().iter_mut() {
            m.invisible_until = None;
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn receive(&self, max: i32) -> Result<Vec<QueueMessage>> {
        let now = Utc::now();
        let deadline = now + chrono::Duration::from_std(self.visibility).unwrap_or_default();
        let mut messages = self.messages.lock().unwrap();
        let mut leased = Vec::new();
        for m in messages.iter_mut() {
            if leased.len() >= max as usize {
                break;
            }
            let visible = m.invisible_until.map(|t| t <= now).unwrap_or(true);
            if visible {
                m.invisible_until = Some(deadline);
                leased.push(QueueMessage {
                    body: m.body.clone(),
                    receipt: m.receipt.clone(),
                });
            }
        }
        Ok(leased)
    }

    async fn delete(&self, receipt: &str) -> Result<()> {
        self.messages
            .lock()
            .unwrap()
            .retain(|m| m.receipt != receipt);
        Ok(())
    }

    async fn send_batch(&self, bodies: &[String]) -> Result<()> {
        for body in bodies {
            self.push(body.clone());
        }
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool> {
        let now = Utc::now();
        let messages = self.messages.lock().unwrap();
        let visible = messages
            .iter()
            .filter(|m| m.invisible_until.map(|t| t <= now).unwrap_or(true))
            .count();
        let in_flight = messages.len() - visible;
        Ok(visible <= 1 && in_flight == 0)
    }
}
