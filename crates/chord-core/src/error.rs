//! Shared error taxonomy for the machine lifecycle subsystem.
//!
//! Every fallible entry point in this workspace returns one of these five
//! kinds. Waiter callbacks turn non-OK statuses into an RPC status: the
//! adapter at each boundary maps [`ChordError::InvalidConfiguration`] to
//! `INVALID_ARGUMENT` and everything else to `ABORTED`, carrying the
//! message verbatim.

use thiserror::Error;

/// The five error kinds a caller of this library must distinguish.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChordError {
    /// Malformed URLs, missing/unreadable TLS files, contradictory flags,
    /// duplicate declared ports, out-of-range endpoint indices.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// State-machine preconditions violated: machine already exists,
    /// machine not in expected phase, double-terminate, abandoned machine.
    #[error("internal violation: {0}")]
    InternalViolation(String),

    /// Spawn failure, child died during handshake, binder startup failure.
    #[error("machine error: {0}")]
    MachineError(String),

    /// Agent-side RPC failed or agent unreachable.
    #[error("agent error: {0}")]
    AgentError(String),

    /// Wrapped OS failure (fork, setsid, dup2, open, signal delivery).
    #[error("posix error: {0}")]
    PosixError(String),
}

impl ChordError {
    pub fn invalid_configuration(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn internal_violation(msg: impl Into<String>) -> Self {
        Self::InternalViolation(msg.into())
    }

    pub fn machine_error(msg: impl Into<String>) -> Self {
        Self::MachineError(msg.into())
    }

    pub fn agent_error(msg: impl Into<String>) -> Self {
        Self::AgentError(msg.into())
    }

    pub fn posix_error(msg: impl Into<String>) -> Self {
        Self::PosixError(msg.into())
    }

    /// Coarse RPC status this error maps to at an adapter boundary.
    ///
    /// `InvalidConfiguration` is the only kind distinguished from the
    /// general `ABORTED` bucket.
    pub fn rpc_status(&self) -> RpcStatusKind {
        match self {
            ChordError::InvalidConfiguration(_) => RpcStatusKind::InvalidArgument,
            _ => RpcStatusKind::Aborted,
        }
    }

    pub fn message(&self) -> String {
        self.to_string()
    }
}

/// Coarse RPC status kind, independent of any specific RPC framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatusKind {
    Aborted,
    InvalidArgument,
    PermissionDenied,
    NotFound,
    Internal,
    Ok,
}

/// A fatal condition: out-of-memory in the supervisor, timer-init
/// failures, failures to stop a timer. These indicate the event loop itself
/// is unusable and are not modeled as a `Result` — call this and stop.
#[track_caller]
pub fn fatal(context: &str, error: impl std::fmt::Display) -> ! {
    tracing::error!(context, %error, "fatal condition, aborting process");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_configuration_maps_to_invalid_argument() {
        let e = ChordError::invalid_configuration("bad url");
        assert_eq!(e.rpc_status(), RpcStatusKind::InvalidArgument);
    }

    #[test]
    fn other_kinds_map_to_aborted() {
        for e in [
            ChordError::internal_violation("x"),
            ChordError::machine_error("x"),
            ChordError::agent_error("x"),
            ChordError::posix_error("x"),
        ] {
            assert_eq!(e.rpc_status(), RpcStatusKind::Aborted);
        }
    }

    #[test]
    fn message_is_verbatim() {
        let e = ChordError::internal_violation("abandoned machine");
        assert_eq!(e.message(), "internal violation: abandoned machine");
    }
}
