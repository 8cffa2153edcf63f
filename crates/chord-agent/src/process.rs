//! One child subprocess wrapper: spawn, stdio capture, and terminate.
//!
//! `MachineProcess` holds no lock of its own; callers mutate `state` only
//! while holding the supervisor's mutex.

use chord_core::{ChordError, ExitStatus, MachineId, MachineProcessState};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

/// A child subprocess plus the state the supervisor tracks for it.
pub struct MachineProcess {
    machine_id: MachineId,
    execution_url: String,
    options: SpawnOptions,
    state: MachineProcessState,
    pid: Option<u32>,
}

impl MachineProcess {
    /// Build the process wrapper without spawning. Fails `InvalidConfiguration`
    /// if the executable path is empty.
    pub fn create(
        machine_id: MachineId,
        execution_url: impl Into<String>,
        options: SpawnOptions,
    ) -> Result<Self, ChordError> {
        let execution_url = execution_url.into();
        if execution_url.trim().is_empty() {
            return Err(ChordError::invalid_configuration("execution_url must not be empty"));
        }
        Ok(Self {
            machine_id,
            execution_url,
            options,
            state: MachineProcessState::Initial,
            pid: None,
        })
    }

    pub fn machine_id(&self) -> &MachineId {
        &self.machine_id
    }

    pub fn state(&self) -> MachineProcessState {
        self.state
    }

    pub fn set_state(&mut self, state: MachineProcessState) {
        self.state = state;
    }

    /// Launch the child with stdout/stderr piped through a line logger
    /// tagging each line with the machine id, and start a reaper task that
    /// reports `(machine_id, ExitStatus)` on `exit_tx` when the child dies.
    /// Transitions `Initial -> Created`.
    pub fn spawn(
        &mut self,
        run_directory: &Path,
        exit_tx: mpsc::UnboundedSender<(MachineId, ExitStatus)>,
    ) -> Result<(), ChordError> {
        let mut command = Command::new(&self.execution_url);
        command
            .args(&self.options.args)
            .current_dir(run_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &self.options.env {
            command.env(key, value);
        }

        let mut child =
            command.spawn().map_err(|e| ChordError::machine_error(format!("spawn failed: {e}")))?;

        self.pid = child.id();
        let machine_id = self.machine_id.clone();
        if let Some(stdout) = child.stdout.take() {
            spawn_logger(machine_id.clone(), "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_logger(machine_id.clone(), "stderr", stderr);
        }

        let reaper_id = machine_id.clone();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => ExitStatus {
                    machine_id: reaper_id.clone(),
                    code: status.code().unwrap_or(-1) as i64,
                    signal: unix_signal(&status),
                },
                Err(e) => {
                    tracing::error!(machine_id = %reaper_id, error = %e, "failed to wait on child");
                    ExitStatus { machine_id: reaper_id.clone(), code: -1, signal: None }
                }
            };
            let _ = exit_tx.send((reaper_id, status));
        });

        self.state = MachineProcessState::Created;
        Ok(())
    }

    /// Send `signal` (default SIGTERM) to the child. Legal from
    /// {Created, Starting, Running, Terminating}; idempotent in
    /// `Terminating` to permit escalation.
    pub fn terminate(&mut self, signal: Signal) -> Result<(), ChordError> {
        if !self.state.can_terminate() {
            return Err(ChordError::internal_violation(format!(
                "cannot terminate machine in state {}",
                self.state
            )));
        }
        if let Some(pid) = self.pid {
            signal::kill(Pid::from_raw(pid as i32), signal)
                .map_err(|e| ChordError::posix_error(format!("kill failed: {e}")))?;
        }
        self.state = MachineProcessState::Terminating;
        Ok(())
    }
}

#[cfg(unix)]
fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn unix_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

fn spawn_logger<R>(machine_id: MachineId, stream: &'static str, reader: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => tracing::info!(machine_id = %machine_id, stream, "{line}"),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(machine_id = %machine_id, stream, error = %e, "log pipe read failed");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_empty_execution_url() {
        let err = MachineProcess::create(MachineId::from("m1"), "  ", SpawnOptions::default())
            .unwrap_err();
        assert!(matches!(err, ChordError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn spawn_and_reap_true_binary() {
        let mut process =
            MachineProcess::create(MachineId::from("m1"), "/bin/true", SpawnOptions::default())
                .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        process.spawn(Path::new("/tmp"), tx).unwrap();
        assert_eq!(process.state(), MachineProcessState::Created);

        let (id, status) = rx.recv().await.unwrap();
        assert_eq!(id.as_str(), "m1");
        assert_eq!(status.code, 0);
    }

    #[tokio::test]
    async fn terminate_sends_signal_and_transitions() {
        let mut process =
            MachineProcess::create(MachineId::from("m2"), "/bin/sleep", SpawnOptions {
                args: vec!["5".to_string()],
                env: Vec::new(),
            })
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        process.spawn(Path::new("/tmp"), tx).unwrap();
        process.set_state(MachineProcessState::Running);

        process.terminate(Signal::SIGTERM).unwrap();
        assert_eq!(process.state(), MachineProcessState::Terminating);

        let (_, status) = rx.recv().await.unwrap();
        assert_eq!(status.signal, Some(Signal::SIGTERM as i32));
    }
}
