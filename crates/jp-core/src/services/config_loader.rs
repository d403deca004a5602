use std::path::Path;

use crate::error::{ProvisionError, Result};
use crate::models::ProvisionerConfig;

pub fn load(path: &Path) -> Result<ProvisionerConfig> {
    if !path.exists() {
        return Err(ProvisionError::InvalidConfig(format!(
            "config file {} not found",
            path.display()
        )));
    }
    let contents = std::fs::read_to_string(path)?;
    let config: ProvisionerConfig = serde_yaml::from_str(&contents)
        .map_err(|e| ProvisionError::InvalidConfig(e.to_string()))?;
    if config.juju.bin.trim().is_empty() {
        return Err(ProvisionError::InvalidConfig(
            "juju:bin must not be empty".into(),
        ));
    }
    tracing::debug!(path = %path.display(), use_elb = config.juju.use_elb, "loaded config");
    Ok(config)
}
