//! The interpreter's own OS thread, the event-loop-side bridge that turns
//! its outbox into monitor events, and the stub interpreter standing in for
//! a real bytecode engine.

use chord_core::MachineState;
use chord_wire::MonitorEvent;
use parking_lot::Mutex;
use std::cell::Cell;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Commands delivered to the interpreter thread's inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerCommand {
    Suspend,
    Resume,
    Terminate,
}

/// Events the interpreter thread reports on its outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerEvent {
    Running,
    Suspended,
    Completed,
    Cancelled,
    Failure,
}

impl RunnerEvent {
    fn to_machine_state(self) -> MachineState {
        match self {
            RunnerEvent::Running => MachineState::Running,
            RunnerEvent::Suspended => MachineState::Suspended,
            RunnerEvent::Completed => MachineState::Completed,
            RunnerEvent::Cancelled => MachineState::Cancelled,
            RunnerEvent::Failure => MachineState::Failure,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, RunnerEvent::Completed | RunnerEvent::Cancelled | RunnerEvent::Failure)
    }

    /// Small integer carried as the monitor's exit status. This workspace
    /// has no real bytecode engine to produce a richer status from.
    fn exit_code(self) -> i64 {
        match self {
            RunnerEvent::Completed => 0,
            RunnerEvent::Cancelled => 1,
            RunnerEvent::Failure => 2,
            RunnerEvent::Running | RunnerEvent::Suspended => 0,
        }
    }
}

/// A single interpreter, driven by commands and reporting events through
/// `emit`. Runs entirely on the dedicated thread `InterpreterRunner` owns.
pub trait Interpreter: Send + 'static {
    fn on_command(&mut self, command: RunnerCommand, emit: &dyn Fn(RunnerEvent));
}

/// Has no bytecode to execute: `Resume` reports `Running` then immediately
/// `Completed`, `Suspend` reports `Suspended`, `Terminate` reports
/// `Cancelled`.
pub struct StubInterpreter;

impl Interpreter for StubInterpreter {
    fn on_command(&mut self, command: RunnerCommand, emit: &dyn Fn(RunnerEvent)) {
        match command {
            RunnerCommand::Resume => {
                emit(RunnerEvent::Running);
                emit(RunnerEvent::Completed);
            }
            RunnerCommand::Suspend => emit(RunnerEvent::Suspended),
            RunnerCommand::Terminate => emit(RunnerEvent::Cancelled),
        }
    }
}

/// Owns the interpreter's thread. The inbox is a `tokio::sync::mpsc`
/// channel rather than `std::sync::mpsc`: its sender is `Sync`, so it can
/// be reached through a shared `Arc<LocalMachine>` from any binder
/// connection task. The thread drains it with `blocking_recv`, since it
/// has no async runtime of its own.
pub struct InterpreterRunner {
    inbox: tokio::sync::mpsc::UnboundedSender<RunnerCommand>,
    _handle: std::thread::JoinHandle<()>,
}

impl InterpreterRunner {
    pub fn spawn(
        mut interpreter: impl Interpreter,
        outbox: tokio::sync::mpsc::UnboundedSender<RunnerEvent>,
    ) -> Self {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<RunnerCommand>();
        let handle = std::thread::spawn(move || {
            while let Some(command) = rx.blocking_recv() {
                let terminal = Cell::new(false);
                interpreter.on_command(command, &|event| {
                    if event.is_terminal() {
                        terminal.set(true);
                    }
                    let _ = outbox.send(event);
                });
                if terminal.get() {
                    break;
                }
            }
        });
        Self { inbox: tx, _handle: handle }
    }

    pub fn send(&self, command: RunnerCommand) {
        let _ = self.inbox.send(command);
    }
}

/// Current cached state plus a broadcast fanout, one per machine. A fresh
/// monitor starts at `Suspended`: `UnknownState` is never emitted by this
/// workspace, since the interpreter hasn't been told to run yet at the
/// point a binder starts accepting connections.
///
/// Also used on the isolate side of a `Monitor` stream: `record_state` and
/// `record_exit` are `pub` so a connector reading `MonitorEvent`s off the
/// wire can feed the same cache-plus-fanout shape the binder uses locally.
pub struct MachineMonitor {
    current: Mutex<MachineState>,
    exit_status: Mutex<Option<i64>>,
    sender: broadcast::Sender<MonitorEvent>,
}

impl MachineMonitor {
    pub fn new() -> Arc<Self> {
        let (sender, _) = broadcast::channel(64);
        Arc::new(Self { current: Mutex::new(MachineState::Suspended), exit_status: Mutex::new(None), sender })
    }

    pub fn current_state(&self) -> MachineState {
        *self.current.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.sender.subscribe()
    }

    pub fn record_state(&self, state: MachineState) {
        *self.current.lock() = state;
        let _ = self.sender.send(MonitorEvent::StateChanged { curr_state: state });
    }

    pub fn record_exit(&self, exit_status: i64) {
        *self.exit_status.lock() = Some(exit_status);
        let _ = self.sender.send(MonitorEvent::MachineExit { exit_status });
    }

    /// Blocks until the machine reaches a terminal state, returning its
    /// exit status. Subscribes before checking the cached status so no
    /// exit event delivered concurrently is missed.
    pub async fn wait_for_exit(&self) -> i64 {
        let mut receiver = self.subscribe();
        if let Some(code) = *self.exit_status.lock() {
            return code;
        }
        loop {
            match receiver.recv().await {
                Ok(MonitorEvent::MachineExit { exit_status }) => return exit_status,
                Ok(MonitorEvent::StateChanged { .. }) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return 0,
            }
        }
    }
}

/// External hooks onto a running interpreter: `suspend`/`resume`/
/// `terminate` post to its inbox, and `notify_init_complete` is the edge
/// that starts it running for the first time (or leaves it suspended, if
/// `start_suspended` was requested).
pub struct LocalMachine {
    runner: InterpreterRunner,
    start_suspended: bool,
    monitor: Arc<MachineMonitor>,
}

impl LocalMachine {
    pub fn spawn(interpreter: impl Interpreter, start_suspended: bool) -> Arc<Self> {
        let monitor = MachineMonitor::new();
        let (outbox_tx, mut outbox_rx) = tokio::sync::mpsc::unbounded_channel();
        let runner = InterpreterRunner::spawn(interpreter, outbox_tx);

        let monitor_for_task = Arc::clone(&monitor);
        tokio::spawn(async move {
            while let Some(event) = outbox_rx.recv().await {
                let state = event.to_machine_state();
                monitor_for_task.record_state(state);
                if event.is_terminal() {
                    monitor_for_task.record_exit(event.exit_code());
                }
            }
        });

        Arc::new(Self { runner, start_suspended, monitor })
    }

    pub fn monitor(&self) -> Arc<MachineMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn suspend(&self) {
        self.runner.send(RunnerCommand::Suspend);
    }

    pub fn resume(&self) {
        self.runner.send(RunnerCommand::Resume);
    }

    pub fn terminate(&self) {
        self.runner.send(RunnerCommand::Terminate);
    }

    /// Gated by the binder on all required-at-launch plugs attaching. When
    /// `start_suspended` was requested this deliberately does nothing: the
    /// isolate is expected to send an explicit `Resume` (this also covers
    /// the zero-required-plugs case, where no attach would ever fire this).
    pub fn notify_init_complete(&self) {
        if !self.start_suspended {
            self.resume();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_interpreter_resume_reports_running_then_completed() {
        let mut events = Vec::new();
        let mut interpreter = StubInterpreter;
        interpreter.on_command(RunnerCommand::Resume, &|e| events.push(e));
        assert_eq!(events, vec![RunnerEvent::Running, RunnerEvent::Completed]);
    }

    #[tokio::test]
    async fn monitor_starts_suspended_and_never_emits_unknown() {
        let monitor = MachineMonitor::new();
        assert_eq!(monitor.current_state(), MachineState::Suspended);
    }

    #[tokio::test]
    async fn local_machine_resumes_automatically_unless_start_suspended() {
        let machine = LocalMachine::spawn(StubInterpreter, false);
        let monitor = machine.monitor();
        machine.notify_init_complete();
        let exit_status = monitor.wait_for_exit().await;
        assert_eq!(exit_status, 0);
    }

    #[tokio::test]
    async fn local_machine_stays_suspended_when_start_suspended() {
        let machine = LocalMachine::spawn(StubInterpreter, true);
        machine.notify_init_complete();
        // give the outbox task a chance to run; nothing should arrive.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(machine.monitor().current_state(), MachineState::Suspended);
    }

    #[tokio::test]
    async fn explicit_resume_after_start_suspended_completes() {
        let machine = LocalMachine::spawn(StubInterpreter, true);
        machine.resume();
        let exit_status = machine.monitor().wait_for_exit().await;
        assert_eq!(exit_status, 0);
    }
}
