use crate::models::UnitStatus;

/// Maps the raw juju signals of one unit to its canonical status.
///
/// Rules are evaluated in order and the first match wins. The machine agent
/// state is accepted for completeness but never decides the outcome: a unit
/// carrying only machine-agent signal falls through to `Creating` or
/// `Pending` depending on the instance state.
pub fn resolve(instance_state: &str, agent_state: &str, _machine_agent_state: &str) -> UnitStatus {
    match (instance_state, agent_state) {
        (_, "install-error" | "start-error") => UnitStatus::Error,
        ("error", _) => UnitStatus::Error,
        (_, "down") => UnitStatus::Down,
        (_, "started") => UnitStatus::Started,
        ("running", _) => UnitStatus::Installing,
        ("pending" | "", _) => UnitStatus::Creating,
        _ => UnitStatus::Pending,
    }
}
