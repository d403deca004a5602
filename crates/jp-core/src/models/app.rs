use super::unit::UnitStatus;

/// One unit as the application layer knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppUnit {
    pub name: String,
    pub machine: u32,
    pub instance_id: String,
    pub ip: String,
    pub status: UnitStatus,
}

/// The application model the provisioner acts on. Owned by the platform,
/// not by this crate.
pub trait App: Send + Sync {
    fn name(&self) -> &str;

    /// Process type, used as the charm name on deploy.
    fn process_type(&self) -> &str;

    fn units(&self) -> Vec<AppUnit>;
}
