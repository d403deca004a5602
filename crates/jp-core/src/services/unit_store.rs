use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use crate::error::{ProvisionError, Result};
use crate::models::unit::app_of;
use crate::models::PersistedUnit;

/// Selects persisted units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitFilter {
    All,
    Names(Vec<String>),
    App(String),
}

impl UnitFilter {
    pub fn matches(&self, unit: &PersistedUnit) -> bool {
        match self {
            UnitFilter::All => true,
            UnitFilter::Names(names) => names.iter().any(|n| *n == unit.unit_name),
            UnitFilter::App(app) => app_of(&unit.unit_name) == app,
        }
    }
}

/// Durable unit records keyed by unit name. Implementations do their own
/// locking; every operation touches one key or one filter at a time.
#[async_trait]
pub trait UnitStore: Send + Sync {
    /// Fails if a record with the same unit name exists.
    async fn insert(&self, unit: PersistedUnit) -> Result<()>;

    async fn get(&self, unit_name: &str) -> Result<Option<PersistedUnit>>;

    async fn find(&self, filter: &UnitFilter) -> Result<Vec<PersistedUnit>>;

    /// Sets the instance id of an existing record. Returns false when no
    /// record has that name.
    async fn update(&self, unit_name: &str, instance_id: &str) -> Result<bool>;

    async fn delete(&self, filter: &UnitFilter) -> Result<usize>;

    async fn count(&self, filter: &UnitFilter) -> Result<usize>;
}

type UnitMap = BTreeMap<String, PersistedUnit>;

fn insert_into(units: &mut UnitMap, unit: PersistedUnit) -> Result<()> {
    if units.contains_key(&unit.unit_name) {
        return Err(ProvisionError::Store(format!(
            "unit \"{}\" already exists",
            unit.unit_name
        )));
    }
    units.insert(unit.unit_name.clone(), unit);
    Ok(())
}

fn update_in(units: &mut UnitMap, unit_name: &str, instance_id: &str) -> bool {
    match units.get_mut(unit_name) {
        Some(unit) => {
            unit.instance_id = instance_id.to_string();
            unit.updated_at = Utc::now();
            true
        }
        None => false,
    }
}

fn delete_from(units: &mut UnitMap, filter: &UnitFilter) -> usize {
    let before = units.len();
    units.retain(|_, unit| !filter.matches(unit));
    before - units.len()
}

fn select(units: &UnitMap, filter: &UnitFilter) -> Vec<PersistedUnit> {
    units.values().filter(|u| filter.matches(u)).cloned().collect()
}

#[derive(Default)]
pub struct MemoryUnitStore {
    units: RwLock<UnitMap>,
}

impl MemoryUnitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UnitStore for MemoryUnitStore {
    async fn insert(&self, unit: PersistedUnit) -> Result<()> {
        insert_into(&mut *self.units.write().await, unit)
    }

    async fn get(&self, unit_name: &str) -> Result<Option<PersistedUnit>> {
        Ok(self.units.read().await.get(unit_name).cloned())
    }

    async fn find(&self, filter: &UnitFilter) -> Result<Vec<PersistedUnit>> {
        Ok(select(&*self.units.read().await, filter))
    }

    async fn update(&self, unit_name: &str, instance_id: &str) -> Result<bool> {
        Ok(update_in(&mut *self.units.write().await, unit_name, instance_id))
    }

    async fn delete(&self, filter: &UnitFilter) -> Result<usize> {
        Ok(delete_from(&mut *self.units.write().await, filter))
    }

    async fn count(&self, filter: &UnitFilter) -> Result<usize> {
        let units = self.units.read().await;
        Ok(units.values().filter(|u| filter.matches(u)).count())
    }
}

/// Keeps unit records in `units.json` under a state directory. Every write
/// is a load-modify-save cycle under one lock.
pub struct JsonUnitStore {
    state_file_path: PathBuf,
    lock: Mutex<()>,
}

impl JsonUnitStore {
    pub fn new(state_directory: &Path) -> Self {
        Self {
            state_file_path: state_directory.join("units.json"),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<UnitMap> {
        if !self.state_file_path.exists() {
            return Ok(UnitMap::new());
        }
        let json = tokio::fs::read_to_string(&self.state_file_path)
            .await
            .map_err(|e| ProvisionError::Store(format!("failed to read unit file: {e}")))?;
        let units: Vec<PersistedUnit> = serde_json::from_str(&json)?;
        Ok(units
            .into_iter()
            .map(|u| (u.unit_name.clone(), u))
            .collect())
    }

    async fn save(&self, units: &UnitMap) -> Result<()> {
        if let Some(parent) = self.state_file_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProvisionError::Store(format!("failed to create state dir: {e}")))?;
        }
        let list: Vec<&PersistedUnit> = units.values().collect();
        let json = serde_json::to_string_pretty(&list)?;
        tokio::fs::write(&self.state_file_path, json)
            .await
            .map_err(|e| ProvisionError::Store(format!("failed to write unit file: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl UnitStore for JsonUnitStore {
    async fn insert(&self, unit: PersistedUnit) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut units = self.load().await?;
        insert_into(&mut units, unit)?;
        self.save(&units).await
    }

    async fn get(&self, unit_name: &str) -> Result<Option<PersistedUnit>> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(unit_name))
    }

    async fn find(&self, filter: &UnitFilter) -> Result<Vec<PersistedUnit>> {
        let _guard = self.lock.lock().await;
        Ok(select(&self.load().await?, filter))
    }

    async fn update(&self, unit_name: &str, instance_id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let mut units = self.load().await?;
        if !update_in(&mut units, unit_name, instance_id) {
            return Ok(false);
        }
        self.save(&units).await?;
        Ok(true)
    }

    async fn delete(&self, filter: &UnitFilter) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let mut units = self.load().await?;
        let removed = delete_from(&mut units, filter);
        if removed > 0 {
            self.save(&units).await?;
        }
        Ok(removed)
    }

    async fn count(&self, filter: &UnitFilter) -> Result<usize> {
        Ok(self.find(filter).await?.len())
    }
}
