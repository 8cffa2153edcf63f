//! How a [`crate::ChordIsolate`] should find its agent: reattach to one
//! already running, spawn a fresh one, or try the former and fall back to
//! the latter.

use chord_core::{ChordError, TransportKind};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    ConnectExisting,
    SpawnFresh,
    SpawnIfMissing,
}

/// Resolved ahead of a call to [`crate::ChordIsolate::establish`]. Mirrors
/// the subset of `chordd`'s own CLI surface an isolate needs to pick when
/// it spawns a fresh agent.
#[derive(Debug, Clone)]
pub struct IsolateConfig {
    pub session_name: String,
    pub run_directory: PathBuf,
    pub mode: SessionMode,
    /// Defaults to a `chordd` binary alongside this process's own
    /// executable, the same sibling-binary convention `chordd` itself uses
    /// to find `chord-machine`.
    pub agent_executable: Option<PathBuf>,
    pub listen_transport: TransportKind,
    /// Total time to wait for a freshly-spawned agent's endpoint file,
    /// polled with exponential backoff.
    pub spawn_timeout: Duration,
    pub registration_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub temporary_session: bool,
    pub log_file: Option<PathBuf>,
}

impl IsolateConfig {
    pub fn new(session_name: impl Into<String>) -> Self {
        Self {
            session_name: session_name.into(),
            run_directory: PathBuf::from("."),
            mode: SessionMode::SpawnIfMissing,
            agent_executable: None,
            listen_transport: TransportKind::Unix,
            spawn_timeout: Duration::from_secs(10),
            registration_timeout: Duration::from_secs(5),
            idle_timeout: None,
            temporary_session: false,
            log_file: None,
        }
    }

    pub fn validate(&self) -> Result<(), ChordError> {
        if self.session_name.trim().is_empty() {
            return Err(ChordError::invalid_configuration("session_name must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_session_name() {
        let config = IsolateConfig::new("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_to_spawn_if_missing_unix() {
        let config = IsolateConfig::new("s1");
        assert_eq!(config.mode, SessionMode::SpawnIfMissing);
        assert_eq!(config.listen_transport, TransportKind::Unix);
    }
}
