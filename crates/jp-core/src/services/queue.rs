use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::error::{ProvisionError, Result};
use crate::models::Message;

/// Name of the queue consumed by the provisioner itself.
pub const PROVISIONER_QUEUE: &str = "jp-provisioner";

/// Name of the queue consumed by the application layer.
pub const APP_QUEUE: &str = "jp-app";

/// A message handed to a consumer. It stays reserved until the consumer
/// deletes or releases it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: u64,
    pub message: Message,
}

/// At-least-once work queue. Consumers must tolerate duplicates.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    fn name(&self) -> &str;

    async fn put(&self, message: Message) -> Result<()>;

    /// Waits up to `timeout` for a message.
    async fn get(&self, timeout: Duration) -> Result<Delivery>;

    /// Acknowledges a delivery; it will not be handed out again.
    async fn delete(&self, delivery: Delivery) -> Result<()>;

    /// Makes a delivery available again after `delay`.
    async fn release(&self, delivery: Delivery, delay: Duration) -> Result<()>;
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<(u64, Message)>,
    reserved: HashMap<u64, Message>,
    next_id: u64,
}

/// In-process queue.
pub struct MemoryQueue {
    name: String,
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Messages waiting for a consumer, not counting reserved ones.
    pub async fn ready_len(&self) -> usize {
        self.state.lock().await.ready.len()
    }

    pub async fn reserved_len(&self) -> usize {
        self.state.lock().await.reserved.len()
    }

    /// Messages waiting for a consumer, oldest first.
    pub async fn peek_all(&self) -> Vec<Message> {
        let state = self.state.lock().await;
        state.ready.iter().map(|(_, m)| m.clone()).collect()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put(&self, message: Message) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            let id = state.next_id;
            state.next_id += 1;
            state.ready.push_back((id, message));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn get(&self, timeout: Duration) -> Result<Delivery> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().await;
                if let Some((id, message)) = state.ready.pop_front() {
                    state.reserved.insert(id, message.clone());
                    return Ok(Delivery { id, message });
                }
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Err(ProvisionError::QueueTimeout(self.name.clone()));
            }
        }
    }

    async fn delete(&self, delivery: Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        state.reserved.remove(&delivery.id).map(|_| ()).ok_or_else(|| {
            ProvisionError::Queue(format!(
                "message {} is not reserved in queue \"{}\"",
                delivery.id, self.name
            ))
        })
    }

    async fn release(&self, delivery: Delivery, delay: Duration) -> Result<()> {
        let message = {
            let mut state = self.state.lock().await;
            state.reserved.remove(&delivery.id).ok_or_else(|| {
                ProvisionError::Queue(format!(
                    "message {} is not reserved in queue \"{}\"",
                    delivery.id, self.name
                ))
            })?
        };

        let state = self.state.clone();
        let notify = self.notify.clone();
        let requeue = async move {
            state.lock().await.ready.push_back((delivery.id, message));
            notify.notify_one();
        };
        if delay.is_zero() {
            requeue.await;
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                requeue.await;
            });
        }
        Ok(())
    }
}
