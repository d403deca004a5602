pub mod app;
pub mod config;
pub mod message;
pub mod unit;

pub use app::{App, AppUnit};
pub use config::{AgentConfig, GitConfig, JujuConfig, ProvisionerConfig};
pub use message::Message;
pub use unit::{is_concrete_instance, PersistedUnit, Unit, UnitStatus, PENDING_INSTANCE};
