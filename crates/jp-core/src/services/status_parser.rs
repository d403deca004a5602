use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::error::{ProvisionError, Result};
use crate::models::Unit;

use super::unit_status;

static UNIT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([\w.-]+)/(\d+)$").unwrap());

static CHARM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[\w-]+:)?(?:[\w-]+/)?([\w-]+?)(?:-\d+)?$").unwrap());

/// Top level of `juju status`. Sections are kept as raw mappings so a bad
/// entry can be skipped without rejecting the whole report.
#[derive(Debug, Deserialize)]
struct StatusDocument {
    #[serde(default)]
    machines: Mapping,
    #[serde(default)]
    services: Mapping,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct MachineEntry {
    #[serde(default)]
    agent_state: String,
    #[serde(default)]
    dns_name: String,
    #[serde(default)]
    instance_id: String,
    #[serde(default)]
    instance_state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UnitEntry {
    #[serde(default)]
    agent_state: String,
    machine: u32,
    #[serde(default)]
    public_address: String,
}

/// One unit line of the status report with its raw signals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedUnit {
    pub name: String,
    pub app_name: String,
    pub ordinal: u32,
    pub process_type: String,
    pub machine: u32,
    pub instance_id: String,
    pub ip: String,
    pub instance_state: String,
    pub agent_state: String,
    pub machine_agent_state: String,
}

impl ObservedUnit {
    pub fn into_unit(self) -> Unit {
        let status = unit_status::resolve(
            &self.instance_state,
            &self.agent_state,
            &self.machine_agent_state,
        );
        Unit {
            name: self.name,
            app_name: self.app_name,
            process_type: self.process_type,
            machine: self.machine,
            instance_id: self.instance_id,
            ip: self.ip,
            status,
        }
    }
}

/// Decodes a `juju status` report into units ordered by application and
/// ordinal. Only an undecodable document is an error; entries that do not
/// look like units are skipped.
pub fn parse_status(raw: &str) -> Result<Vec<ObservedUnit>> {
    let document: StatusDocument =
        serde_yaml::from_str(raw).map_err(|e| ProvisionError::StatusDecode {
            raw: raw.to_string(),
            source: e,
        })?;

    let machines = parse_machines(&document.machines);
    let mut units = Vec::new();

    for (service_key, service) in &document.services {
        let Some(service_name) = service_key.as_str() else {
            continue;
        };
        let process_type = service
            .get("charm")
            .and_then(Value::as_str)
            .map(process_type_from_charm)
            .unwrap_or_default();
        let Some(unit_entries) = service.get("units").and_then(Value::as_mapping) else {
            continue;
        };

        for (unit_key, unit_value) in unit_entries {
            let Some(name) = unit_key.as_str() else {
                continue;
            };
            let Some(caps) = UNIT_NAME_RE.captures(name) else {
                tracing::debug!(service = service_name, entry = name, "skipping non-unit entry");
                continue;
            };
            let Ok(ordinal) = caps[2].parse::<u32>() else {
                continue;
            };
            let entry: UnitEntry = match serde_yaml::from_value(unit_value.clone()) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!(unit = name, error = %e, "skipping malformed unit entry");
                    continue;
                }
            };
            let machine = machines.get(&entry.machine);
            let ip = machine
                .map(|m| m.dns_name.clone())
                .filter(|ip| !ip.is_empty())
                .unwrap_or(entry.public_address);

            units.push(ObservedUnit {
                name: name.to_string(),
                app_name: caps[1].to_string(),
                ordinal,
                process_type: process_type.clone(),
                machine: entry.machine,
                instance_id: machine.map(|m| m.instance_id.clone()).unwrap_or_default(),
                ip,
                instance_state: machine.map(|m| m.instance_state.clone()).unwrap_or_default(),
                agent_state: entry.agent_state,
                machine_agent_state: machine.map(|m| m.agent_state.clone()).unwrap_or_default(),
            });
        }
    }

    units.sort_by(|a, b| (&a.app_name, a.ordinal).cmp(&(&b.app_name, b.ordinal)));
    Ok(units)
}

fn parse_machines(section: &Mapping) -> HashMap<u32, MachineEntry> {
    let mut machines = HashMap::new();
    for (key, value) in section {
        let number = match key {
            Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(s) => s.parse().ok(),
            _ => None,
        };
        let Some(number) = number else {
            continue;
        };
        match serde_yaml::from_value::<MachineEntry>(value.clone()) {
            Ok(entry) => {
                machines.insert(number, entry);
            }
            Err(e) => tracing::debug!(machine = number, error = %e, "skipping malformed machine entry"),
        }
    }
    machines
}

/// `local:oneiric/django-3` -> `django`.
fn process_type_from_charm(charm: &str) -> String {
    CHARM_RE
        .captures(charm)
        .map(|caps| caps[1].to_string())
        .unwrap_or_else(|| charm.to_string())
}
