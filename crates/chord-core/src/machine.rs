//! Machine identity, lifecycle state, and the small value types shared by
//! the agent, the machine, and the isolate.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Stable identifier for a machine, assigned by the caller of `CreateMachine`
/// and echoed by every later call in the handshake. Unique across an
/// agent's lifetime (enforced by [`MachineProcessState`] table membership,
/// not by this type).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineId(Arc<str>);

impl MachineId {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MachineId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for MachineId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl std::borrow::Borrow<str> for MachineId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The process-level state of a machine process (a marker type; the real
/// type lives in `chord-agent`). Transitions are enforced by the owning
/// supervisor, never by this enum itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineProcessState {
    Initial,
    Created,
    Starting,
    Running,
    Terminating,
    Exited,
}

impl MachineProcessState {
    /// Whether `terminate()` is legal to call from this state.
    pub fn can_terminate(self) -> bool {
        matches!(
            self,
            MachineProcessState::Created
                | MachineProcessState::Starting
                | MachineProcessState::Running
                | MachineProcessState::Terminating
        )
    }
}

impl fmt::Display for MachineProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineProcessState::Initial => "Initial",
            MachineProcessState::Created => "Created",
            MachineProcessState::Starting => "Starting",
            MachineProcessState::Running => "Running",
            MachineProcessState::Terminating => "Terminating",
            MachineProcessState::Exited => "Exited",
        };
        f.write_str(s)
    }
}

/// Exit status produced exactly once per reaped machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub machine_id: MachineId,
    pub code: i64,
    pub signal: Option<i32>,
}

/// Kind of a declared port (`CreateMachine.requested_ports`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortType {
    OneShot,
    Streaming,
}

/// Direction of a declared port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortDirection {
    Client,
    Server,
    BiDirectional,
}

/// One port requested by the client in `CreateMachine`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedPort {
    pub protocol_url: String,
    pub port_type: PortType,
    pub port_direction: PortDirection,
}

/// One port the agent has assigned an endpoint index to, echoed back
/// through the handshake (`declared_ports`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredPort {
    pub protocol_url: String,
    pub endpoint_index: i32,
    pub port_type: PortType,
    pub port_direction: PortDirection,
}

/// An endpoint declared by the child, carrying its CSR, before it is signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredEndpoint {
    pub endpoint_url: String,
    /// PEM-encoded certificate signing request.
    pub csr: String,
}

/// An endpoint after the client's CA has signed its CSR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEndpoint {
    pub endpoint_url: String,
    /// PEM-encoded certificate.
    pub certificate: String,
}

/// An endpoint after the child has bound its TLS listener to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundEndpoint {
    pub endpoint_url: String,
}

/// Runtime state of the interpreter inside a machine, carried over the
/// monitor stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    UnknownState,
    Running,
    Suspended,
    Cancelled,
    Completed,
    Failure,
}

impl MachineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, MachineState::Cancelled | MachineState::Completed | MachineState::Failure)
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MachineState::UnknownState => "UnknownState",
            MachineState::Running => "Running",
            MachineState::Suspended => "Suspended",
            MachineState::Cancelled => "Cancelled",
            MachineState::Completed => "Completed",
            MachineState::Failure => "Failure",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminate_legal_states() {
        assert!(MachineProcessState::Created.can_terminate());
        assert!(MachineProcessState::Starting.can_terminate());
        assert!(MachineProcessState::Running.can_terminate());
        assert!(MachineProcessState::Terminating.can_terminate());
        assert!(!MachineProcessState::Initial.can_terminate());
        assert!(!MachineProcessState::Exited.can_terminate());
    }

    #[test]
    fn terminal_states() {
        assert!(MachineState::Completed.is_terminal());
        assert!(MachineState::Cancelled.is_terminal());
        assert!(MachineState::Failure.is_terminal());
        assert!(!MachineState::Running.is_terminal());
        assert!(!MachineState::Suspended.is_terminal());
        assert!(!MachineState::UnknownState.is_terminal());
    }

    #[test]
    fn machine_id_borrows_as_str() {
        use std::collections::HashMap;
        let mut map: HashMap<MachineId, u32> = HashMap::new();
        map.insert(MachineId::new("m1"), 1);
        assert_eq!(map.get("m1"), Some(&1));
    }
}
