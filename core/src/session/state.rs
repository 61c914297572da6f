use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Created, not yet announced
    Init,
    /// Advertising and reachable, not connected
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    /// No liveness signal within the timeout
    Lost,
    /// Link dropped without being asked to
    Unreachable,
    /// Unrecoverable failure; the session accepts no more operations
    Dead,
}

impl NodeState {
    /// States in which a link to the peer exists or is being established
    pub fn is_linked(&self) -> bool {
        matches!(
            self,
            NodeState::Connecting | NodeState::Connected | NodeState::Disconnecting
        )
    }

    /// States from which `connect()` is accepted
    pub fn can_connect(&self) -> bool {
        matches!(
            self,
            NodeState::Idle | NodeState::Lost | NodeState::Unreachable
        )
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Init => "Init",
            NodeState::Idle => "Idle",
            NodeState::Connecting => "Connecting",
            NodeState::Connected => "Connected",
            NodeState::Disconnecting => "Disconnecting",
            NodeState::Lost => "Lost",
            NodeState::Unreachable => "Unreachable",
            NodeState::Dead => "Dead",
        };
        f.write_str(name)
    }
}
