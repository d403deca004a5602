use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Instance id stored for a unit whose machine has not been allocated yet.
pub const PENDING_INSTANCE: &str = "pending";

/// True when `instance_id` names an actual cloud resource, i.e. it is
/// neither empty nor the `pending` sentinel.
pub fn is_concrete_instance(instance_id: &str) -> bool {
    !instance_id.is_empty() && instance_id != PENDING_INSTANCE
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Creating,
    Pending,
    Installing,
    Started,
    Down,
    Error,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Creating => "creating",
            UnitStatus::Pending => "pending",
            UnitStatus::Installing => "installing",
            UnitStatus::Started => "started",
            UnitStatus::Down => "down",
            UnitStatus::Error => "error",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit as observed during one reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    pub name: String,
    pub app_name: String,
    pub process_type: String,
    pub machine: u32,
    pub instance_id: String,
    pub ip: String,
    pub status: UnitStatus,
}

/// Durable record kept per unit name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedUnit {
    pub unit_name: String,
    #[serde(default)]
    pub instance_id: String,
    pub updated_at: DateTime<Utc>,
}

impl PersistedUnit {
    pub fn new(unit_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            unit_name: unit_name.into(),
            instance_id: instance_id.into(),
            updated_at: Utc::now(),
        }
    }

    /// Application part of `<app>/<ordinal>`.
    pub fn app_name(&self) -> &str {
        app_of(&self.unit_name)
    }
}

/// Returns the application part of a unit name, or the whole name when it
/// has no `/`.
pub fn app_of(unit_name: &str) -> &str {
    unit_name
        .rsplit_once('/')
        .map(|(app, _)| app)
        .unwrap_or(unit_name)
}
