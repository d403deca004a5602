use serde::{Deserialize, Serialize};

/// Asks the application layer to rebuild a unit's environment and restart it.
/// Args: `[app, unit]`.
pub const REGENERATE_APPRC_AND_START: &str = "regenerate-apprc-start-unit";

/// Registers units in the app's load balancer once their instance ids are
/// known. Args: `[app, unit...]`; no units means every unit of the app.
pub const ADD_UNIT_TO_LB: &str = "add-unit-to-lb";

/// Replaces a unit's old instance id with its new one in the app's load
/// balancer. Args: `[app, unit, old_instance_id, new_instance_id]`.
pub const SWAP_LB_MEMBER: &str = "swap-lb-member";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub action: String,
    pub args: Vec<String>,
}

impl Message {
    pub fn new<I, S>(action: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            action: action.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}
