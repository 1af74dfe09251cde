//! Inbound message queue.
//!
//! A process-local FIFO of [`QueueMessage`]s with single-waiter wake
//! semantics: HTTP handlers and tool callbacks push from any task, the
//! executor loop is the sole consumer. `drain()` hands the executor one
//! consistent batch; `wait()` parks it until something arrives.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::debug;

use crate::utils::now_ms;

/// A channel-agnostic inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub content: String,
    /// Originating source, e.g. `http:...`, `bridge:chan-1`, `system:bash`.
    pub source: String,
    /// Unix-epoch milliseconds at enqueue time.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// FIFO with one waiter (the executor loop).
#[derive(Default)]
pub struct MessageQueue {
    inner: Mutex<VecDeque<QueueMessage>>,
    notify: Notify,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a message and wake the waiter. Returns the new message id.
    pub fn push(&self, content: impl Into<String>, source: impl Into<String>, metadata: Option<Value>) -> String {
        let msg = QueueMessage {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            source: source.into(),
            timestamp: now_ms(),
            metadata,
        };
        let id = msg.id.clone();
        {
            let mut q = self.inner.lock().expect("message queue poisoned");
            q.push_back(msg);
            debug!(queued = q.len(), "message enqueued");
        }
        self.notify.notify_one();
        id
    }

    /// Atomically remove and return all pending messages, in push order.
    pub fn drain(&self) -> Vec<QueueMessage> {
        let mut q = self.inner.lock().expect("message queue poisoned");
        q.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("message queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until at least one message is present. Returns immediately if
    /// the queue is already non-empty.
    pub async fn wait(&self) {
        loop {
            // Register for a wakeup before checking so a push between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
