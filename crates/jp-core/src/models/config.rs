use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ProvisionError, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProvisionerConfig {
    #[serde(default)]
    pub juju: JujuConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JujuConfig {
    #[serde(default = "default_bin")]
    pub bin: String,
    #[serde(default)]
    pub charms_path: Option<String>,
    #[serde(default)]
    pub use_elb: bool,
    #[serde(default = "default_command_timeout")]
    pub command_timeout: u64,
    #[serde(default = "default_ssh_timeout")]
    pub ssh_timeout: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GitConfig {
    #[serde(default)]
    pub ro_host: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AgentConfig {
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default = "default_collect_interval")]
    pub collect_interval: u64,
    #[serde(default = "default_queue_poll_timeout")]
    pub queue_poll_timeout: u64,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
}

fn default_bin() -> String {
    "juju".into()
}

fn default_command_timeout() -> u64 {
    300
}

fn default_ssh_timeout() -> u64 {
    600
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".jp")
}

fn default_collect_interval() -> u64 {
    60
}

fn default_queue_poll_timeout() -> u64 {
    5
}

fn default_retry_delay() -> u64 {
    10
}

impl Default for JujuConfig {
    fn default() -> Self {
        Self {
            bin: default_bin(),
            charms_path: None,
            use_elb: false,
            command_timeout: default_command_timeout(),
            ssh_timeout: default_ssh_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            collect_interval: default_collect_interval(),
            queue_poll_timeout: default_queue_poll_timeout(),
            retry_delay: default_retry_delay(),
        }
    }
}

impl JujuConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }

    pub fn ssh_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_timeout)
    }

    pub fn charms_path(&self) -> Result<&str> {
        self.charms_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ProvisionError::ConfigMissing("juju:charms-path".into()))
    }
}

impl GitConfig {
    /// Read-only clone url the units pull the application code from.
    pub fn read_only_url(&self, app_name: &str) -> Result<String> {
        let host = self
            .ro_host
            .as_deref()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProvisionError::ConfigMissing("git:ro-host".into()))?;
        Ok(format!("git://{host}/{app_name}.git"))
    }
}

impl AgentConfig {
    pub fn collect_interval(&self) -> Duration {
        Duration::from_secs(self.collect_interval)
    }

    pub fn queue_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_poll_timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay)
    }
}
