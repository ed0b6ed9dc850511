//! Shared types used across provgrid crates.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// An action a provisioner performs against a node, optionally for one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerAction {
    Create,
    Confirm,
    Bootstrap,
    Install,
    Configure,
    Initialize,
    Start,
    Stop,
    Remove,
    Delete,
}

impl ProvisionerAction {
    /// Node-level actions run once per node and never carry a service.
    pub const NODE_CREATION: [ProvisionerAction; 3] = [
        ProvisionerAction::Create,
        ProvisionerAction::Confirm,
        ProvisionerAction::Bootstrap,
    ];

    /// Service bring-up order.
    pub const SERVICE_INSTALL: [ProvisionerAction; 4] = [
        ProvisionerAction::Install,
        ProvisionerAction::Configure,
        ProvisionerAction::Initialize,
        ProvisionerAction::Start,
    ];

    /// Service tear-down order.
    pub const SERVICE_REMOVAL: [ProvisionerAction; 2] =
        [ProvisionerAction::Stop, ProvisionerAction::Remove];

    pub fn is_node_action(&self) -> bool {
        matches!(
            self,
            ProvisionerAction::Create
                | ProvisionerAction::Confirm
                | ProvisionerAction::Bootstrap
                | ProvisionerAction::Delete
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionerAction::Create => "create",
            ProvisionerAction::Confirm => "confirm",
            ProvisionerAction::Bootstrap => "bootstrap",
            ProvisionerAction::Install => "install",
            ProvisionerAction::Configure => "configure",
            ProvisionerAction::Initialize => "initialize",
            ProvisionerAction::Start => "start",
            ProvisionerAction::Stop => "stop",
            ProvisionerAction::Remove => "remove",
            ProvisionerAction::Delete => "delete",
        }
    }
}

impl fmt::Display for ProvisionerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
