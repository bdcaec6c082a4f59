//! Schedule actions -- one unit of work fired when a job triggers.

use serde::{Deserialize, Serialize};

/// JSON is the default content type when an action doesn't name one.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// One unit of work. Actions are immutable value snapshots: a record stores
/// a deep copy of the action as it was at fire time, so later job edits do
/// not retroactively change history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleAction {
    /// Stable id assigned on create/replace.
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Raw bytes handed to the invoker.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
    #[serde(flatten)]
    pub kind: ActionKind,
}

fn default_content_type() -> String {
    CONTENT_TYPE_JSON.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ActionKind {
    /// Outbound HTTP request.
    #[serde(rename = "REST")]
    Rest {
        address: String,
        method: String,
        #[serde(default)]
        auth: AuthMethod,
    },
    /// Publish the payload to a message-bus topic.
    #[serde(rename = "MESSAGEBUS")]
    MessageBus { topic: String },
    /// Issue a set-command to a device resource.
    #[serde(rename = "DEVICECONTROL")]
    DeviceControl {
        device_name: String,
        source_name: String,
    },
}

impl ActionKind {
    /// Tag string used in logs and record queries.
    pub fn type_name(&self) -> &'static str {
        match self {
            ActionKind::Rest { .. } => "REST",
            ActionKind::MessageBus { .. } => "MESSAGEBUS",
            ActionKind::DeviceControl { .. } => "DEVICECONTROL",
        }
    }
}

/// How an outbound REST call authenticates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    None,
    Jwt,
}

impl ScheduleAction {
    /// Convenience constructor used across tests and the CLI.
    pub fn rest(address: &str, method: &str) -> Self {
        ScheduleAction {
            id: String::new(),
            content_type: default_content_type(),
            payload: Vec::new(),
            kind: ActionKind::Rest {
                address: address.to_string(),
                method: method.to_string(),
                auth: AuthMethod::None,
            },
        }
    }
}

/// Assign a fresh stable id to every action. Called on job create and on
/// patch, since a patch replaces all actions.
pub fn assign_action_ids(actions: &mut [ScheduleAction]) {
    for action in actions.iter_mut() {
        action.id = uuid::Uuid::new_v4().to_string();
    }
}
