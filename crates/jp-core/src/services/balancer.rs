use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{ProvisionError, Result};
use crate::models::is_concrete_instance;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalancerDescription {
    pub name: String,
    pub address: String,
    /// Member instance ids in registration order.
    pub instances: Vec<String>,
}

/// The external load-balancing service, one resource per application.
#[async_trait]
pub trait BalancerService: Send + Sync {
    /// Creates the resource and returns its address.
    async fn create(&self, name: &str) -> Result<String>;

    async fn destroy(&self, name: &str) -> Result<()>;

    async fn register(&self, name: &str, instance_ids: &[String]) -> Result<()>;

    async fn deregister(&self, name: &str, instance_ids: &[String]) -> Result<()>;

    async fn describe(&self, name: &str) -> Result<BalancerDescription>;
}

/// In-process balancer registry.
pub struct MemoryBalancerService {
    domain: String,
    balancers: RwLock<BTreeMap<String, BalancerDescription>>,
}

impl MemoryBalancerService {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            balancers: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryBalancerService {
    fn default() -> Self {
        Self::new("elb.local")
    }
}

#[async_trait]
impl BalancerService for MemoryBalancerService {
    async fn create(&self, name: &str) -> Result<String> {
        let mut balancers = self.balancers.write().await;
        let entry = balancers
            .entry(name.to_string())
            .or_insert_with(|| BalancerDescription {
                name: name.to_string(),
                address: format!("{name}.{}", self.domain),
                instances: Vec::new(),
            });
        Ok(entry.address.clone())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        self.balancers
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ProvisionError::ResourceNotFound(name.to_string()))
    }

    async fn register(&self, name: &str, instance_ids: &[String]) -> Result<()> {
        let mut balancers = self.balancers.write().await;
        let lb = balancers
            .get_mut(name)
            .ok_or_else(|| ProvisionError::ResourceNotFound(name.to_string()))?;
        for id in instance_ids {
            if !lb.instances.contains(id) {
                lb.instances.push(id.clone());
            }
        }
        Ok(())
    }

    async fn deregister(&self, name: &str, instance_ids: &[String]) -> Result<()> {
        let mut balancers = self.balancers.write().await;
        let lb = balancers
            .get_mut(name)
            .ok_or_else(|| ProvisionError::ResourceNotFound(name.to_string()))?;
        lb.instances.retain(|id| !instance_ids.contains(id));
        Ok(())
    }

    async fn describe(&self, name: &str) -> Result<BalancerDescription> {
        self.balancers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ProvisionError::ResourceNotFound(name.to_string()))
    }
}

/// A change to one application's balancer membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Add(Vec<String>),
    Remove(Vec<String>),
    Swap { old: String, new: String },
}

/// Membership after applying `change` to `current`. Only concrete instance
/// ids are ever members, and applying the same change twice yields the same
/// set.
pub fn next_membership(current: &BTreeSet<String>, change: &MembershipChange) -> BTreeSet<String> {
    let mut next = current.clone();
    match change {
        MembershipChange::Add(ids) => {
            next.extend(ids.iter().filter(|id| is_concrete_instance(id)).cloned());
        }
        MembershipChange::Remove(ids) => {
            for id in ids {
                next.remove(id);
            }
        }
        MembershipChange::Swap { old, new } => {
            next.remove(old);
            if is_concrete_instance(new) {
                next.insert(new.clone());
            }
        }
    }
    next
}

/// Keeps a balancer resource per application in sync with its units.
#[derive(Clone)]
pub struct ElbManager {
    service: Arc<dyn BalancerService>,
}

impl ElbManager {
    pub fn new(service: Arc<dyn BalancerService>) -> Self {
        Self { service }
    }

    pub async fn create(&self, app_name: &str) -> Result<()> {
        match self.service.describe(app_name).await {
            Ok(_) => Ok(()),
            Err(ProvisionError::ResourceNotFound(_)) => {
                let address = self.service.create(app_name).await?;
                tracing::info!(app = app_name, address = %address, "created load balancer");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn destroy(&self, app_name: &str) -> Result<()> {
        self.service.destroy(app_name).await?;
        tracing::info!(app = app_name, "destroyed load balancer");
        Ok(())
    }

    pub async fn addr(&self, app_name: &str) -> Result<String> {
        Ok(self.service.describe(app_name).await?.address)
    }

    pub async fn members(&self, app_name: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .service
            .describe(app_name)
            .await?
            .instances
            .into_iter()
            .collect())
    }

    /// Applies `change` by registering and deregistering only the ids whose
    /// membership actually differs.
    pub async fn apply(&self, app_name: &str, change: &MembershipChange) -> Result<()> {
        let current = self.members(app_name).await?;
        let desired = next_membership(&current, change);

        let added: Vec<String> = desired.difference(&current).cloned().collect();
        let removed: Vec<String> = current.difference(&desired).cloned().collect();

        if !removed.is_empty() {
            self.service.deregister(app_name, &removed).await?;
        }
        if !added.is_empty() {
            self.service.register(app_name, &added).await?;
        }
        if !added.is_empty() || !removed.is_empty() {
            tracing::debug!(app = app_name, ?added, ?removed, "updated load balancer members");
        }
        Ok(())
    }
}

/// Load-balancer capability chosen once per provisioner.
#[derive(Clone)]
pub enum Balancer {
    Elb(ElbManager),
    Disabled,
}

impl Balancer {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Balancer::Elb(_))
    }

    pub async fn create(&self, app_name: &str) -> Result<()> {
        match self {
            Balancer::Elb(elb) => elb.create(app_name).await,
            Balancer::Disabled => Ok(()),
        }
    }

    pub async fn register(&self, app_name: &str, instance_ids: &[String]) -> Result<()> {
        match self {
            Balancer::Elb(elb) => {
                elb.apply(app_name, &MembershipChange::Add(instance_ids.to_vec()))
                    .await
            }
            Balancer::Disabled => Ok(()),
        }
    }

    pub async fn deregister(&self, app_name: &str, instance_ids: &[String]) -> Result<()> {
        match self {
            Balancer::Elb(elb) => {
                elb.apply(app_name, &MembershipChange::Remove(instance_ids.to_vec()))
                    .await
            }
            Balancer::Disabled => Ok(()),
        }
    }

    pub async fn swap(&self, app_name: &str, old: &str, new: &str) -> Result<()> {
        match self {
            Balancer::Elb(elb) => {
                let change = MembershipChange::Swap {
                    old: old.to_string(),
                    new: new.to_string(),
                };
                elb.apply(app_name, &change).await
            }
            Balancer::Disabled => Ok(()),
        }
    }

    pub async fn destroy(&self, app_name: &str) -> Result<()> {
        match self {
            Balancer::Elb(elb) => elb.destroy(app_name).await,
            Balancer::Disabled => Ok(()),
        }
    }

    /// Address of the app's balancer; `None` when balancing is disabled.
    pub async fn addr(&self, app_name: &str) -> Result<Option<String>> {
        match self {
            Balancer::Elb(elb) => elb.addr(app_name).await.map(Some),
            Balancer::Disabled => Ok(None),
        }
    }
}
