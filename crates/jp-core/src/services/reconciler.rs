use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::Result;
use crate::models::message::{REGENERATE_APPRC_AND_START, SWAP_LB_MEMBER};
use crate::models::{is_concrete_instance, Message, PersistedUnit, Unit};

use super::juju::JujuCli;
use super::queue::WorkQueue;
use super::status_parser::{self, ObservedUnit};
use super::unit_store::UnitStore;

/// What a reconciliation pass did with one observed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
enum UnitChange {
    Inserted,
    IdentityChanged { old: String },
    Unchanged,
}

/// Collects `juju status`, persists unit identities and emits follow-up
/// work when a unit's instance id changes.
///
/// Store writes and queue messages of a pass are complete when
/// [`Reconciler::collect_status`] returns. Passes are serialized, so writes
/// for the same unit land in the order the passes ran.
pub struct Reconciler {
    juju: JujuCli,
    store: Arc<dyn UnitStore>,
    app_queue: Arc<dyn WorkQueue>,
    provisioner_queue: Arc<dyn WorkQueue>,
    balancer_enabled: bool,
    pass_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        juju: JujuCli,
        store: Arc<dyn UnitStore>,
        app_queue: Arc<dyn WorkQueue>,
        provisioner_queue: Arc<dyn WorkQueue>,
        balancer_enabled: bool,
    ) -> Self {
        Self {
            juju,
            store,
            app_queue,
            provisioner_queue,
            balancer_enabled,
            pass_lock: Mutex::new(()),
        }
    }

    pub async fn collect_status(&self) -> Result<Vec<Unit>> {
        let _pass = self.pass_lock.lock().await;

        let raw = self.juju.status().await?;
        let observed = status_parser::parse_status(&raw)?;

        let mut units = Vec::with_capacity(observed.len());
        for unit in observed {
            if let Err(e) = self.reconcile_unit(&unit).await {
                tracing::warn!(unit = %unit.name, error = %e, "failed to reconcile unit");
            }
            units.push(unit.into_unit());
        }
        tracing::debug!(units = units.len(), "reconciliation pass finished");
        Ok(units)
    }

    async fn reconcile_unit(&self, unit: &ObservedUnit) -> Result<UnitChange> {
        let change = self.persist(unit).await?;
        if let UnitChange::IdentityChanged { old } = &change {
            tracing::info!(
                app = %unit.app_name,
                unit = %unit.name,
                old_instance_id = %old,
                instance_id = %unit.instance_id,
                "unit identity changed"
            );
            self.app_queue
                .put(Message::new(
                    REGENERATE_APPRC_AND_START,
                    [unit.app_name.as_str(), unit.name.as_str()],
                ))
                .await?;
            if self.balancer_enabled {
                self.provisioner_queue
                    .put(Message::new(
                        SWAP_LB_MEMBER,
                        [
                            unit.app_name.as_str(),
                            unit.name.as_str(),
                            old.as_str(),
                            unit.instance_id.as_str(),
                        ],
                    ))
                    .await?;
            }
        }
        Ok(change)
    }

    async fn persist(&self, unit: &ObservedUnit) -> Result<UnitChange> {
        let Some(stored) = self.store.get(&unit.name).await? else {
            self.store
                .insert(PersistedUnit::new(&unit.name, &unit.instance_id))
                .await?;
            return Ok(UnitChange::Inserted);
        };

        if stored.instance_id == unit.instance_id {
            return Ok(UnitChange::Unchanged);
        }
        // A known identity is never reverted to empty or pending.
        if is_concrete_instance(&stored.instance_id) && !is_concrete_instance(&unit.instance_id) {
            return Ok(UnitChange::Unchanged);
        }

        if !self.store.update(&unit.name, &unit.instance_id).await? {
            // Removed since it was read.
            return Ok(UnitChange::Unchanged);
        }
        Ok(UnitChange::IdentityChanged {
            old: stored.instance_id,
        })
    }
}
