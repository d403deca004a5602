use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{ProvisionError, Result};
use crate::models::message::{ADD_UNIT_TO_LB, SWAP_LB_MEMBER};
use crate::models::{is_concrete_instance, Message};

use super::balancer::Balancer;
use super::queue::WorkQueue;
use super::unit_store::{UnitFilter, UnitStore};

/// Result of handling one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Some units are not ready yet; deliver the message again later.
    Retry,
}

/// Consumes the provisioner queue and applies load-balancer membership
/// changes. Every handler is safe to run more than once for the same
/// message.
pub struct BalancerWorker {
    queue: Arc<dyn WorkQueue>,
    store: Arc<dyn UnitStore>,
    balancer: Balancer,
    retry_delay: Duration,
}

impl BalancerWorker {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        store: Arc<dyn UnitStore>,
        balancer: Balancer,
        retry_delay: Duration,
    ) -> Self {
        Self {
            queue,
            store,
            balancer,
            retry_delay,
        }
    }

    pub async fn handle(&self, message: &Message) -> Result<Outcome> {
        match message.action.as_str() {
            ADD_UNIT_TO_LB => self.add_units(&message.args).await,
            SWAP_LB_MEMBER => self.swap_member(&message.args).await,
            other => Err(ProvisionError::Queue(format!("unknown action \"{other}\""))),
        }
    }

    async fn add_units(&self, args: &[String]) -> Result<Outcome> {
        let Some((app_name, unit_names)) = args.split_first() else {
            return Err(ProvisionError::Queue(format!(
                "{ADD_UNIT_TO_LB} needs an app name"
            )));
        };
        let filter = if unit_names.is_empty() {
            UnitFilter::App(app_name.clone())
        } else {
            UnitFilter::Names(unit_names.to_vec())
        };
        let units = self.store.find(&filter).await?;

        let (ready, waiting): (Vec<_>, Vec<_>) = units
            .into_iter()
            .partition(|u| is_concrete_instance(&u.instance_id));
        let ids: Vec<String> = ready.into_iter().map(|u| u.instance_id).collect();
        if !ids.is_empty() {
            self.balancer.register(app_name, &ids).await?;
        }

        // Named units without a record were removed; there is nothing left
        // to register for them.
        if !waiting.is_empty() {
            tracing::debug!(app = %app_name, waiting = waiting.len(), "units not ready for load balancer");
            return Ok(Outcome::Retry);
        }
        Ok(Outcome::Done)
    }

    async fn swap_member(&self, args: &[String]) -> Result<Outcome> {
        let [app_name, unit_name, old, new] = args else {
            return Err(ProvisionError::Queue(format!(
                "{SWAP_LB_MEMBER} needs [app, unit, old, new], got {args:?}"
            )));
        };
        tracing::debug!(app = %app_name, unit = %unit_name, old = %old, new = %new, "swapping load balancer member");
        self.balancer.swap(app_name, old, new).await?;
        Ok(Outcome::Done)
    }

    /// Handles the next message, waiting up to `timeout` for one. Returns
    /// false when the queue stayed empty.
    pub async fn process_next(&self, timeout: Duration) -> Result<bool> {
        let delivery = match self.queue.get(timeout).await {
            Ok(delivery) => delivery,
            Err(ProvisionError::QueueTimeout(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        match self.handle(&delivery.message).await {
            Ok(Outcome::Done) => self.queue.delete(delivery).await?,
            Ok(Outcome::Retry) => self.queue.release(delivery, self.retry_delay).await?,
            Err(ProvisionError::Queue(reason)) => {
                tracing::warn!(action = %delivery.message.action, reason = %reason, "dropping message");
                self.queue.delete(delivery).await?;
            }
            Err(e) => {
                tracing::warn!(action = %delivery.message.action, error = %e, "message failed, will retry");
                self.queue.release(delivery, self.retry_delay).await?;
            }
        }
        Ok(true)
    }

    /// Consumes messages until `shutdown` flips to true.
    pub async fn run(&self, poll_timeout: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(queue = self.queue.name(), "balancer worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                result = self.process_next(poll_timeout) => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "queue processing failed");
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                _ = shutdown.changed() => {}
            }
        }
        tracing::info!(queue = self.queue.name(), "balancer worker stopped");
    }
}
