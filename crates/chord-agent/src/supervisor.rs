//! The core state machine: four phase-indexed tables plus a master
//! `machines` table, guarded by one coarse mutex. Every waiter invocation
//! for a given machine id is a prefix of
//! `on_spawn, on_sign, on_ready, on_terminate`, each at most once.

use crate::process::{MachineProcess, SpawnOptions};
use chord_core::{
    BoundEndpoint, ChordError, DeclaredEndpoint, DeclaredPort, ExitStatus,
    MachineId, MachineProcessState, SignedEndpoint,
};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

pub struct CreateMachineOutcome {
    pub machine_url: String,
    pub declared_ports: Vec<DeclaredPort>,
    pub declared_endpoints: Vec<DeclaredEndpoint>,
    pub control_endpoint_index: i32,
}

pub struct SignCertificatesOutcome {
    pub signed_endpoints: Vec<SignedEndpoint>,
}

pub struct RunMachineOutcome {
    pub bound_endpoints: Vec<BoundEndpoint>,
}

pub struct DeleteMachineOutcome {
    pub exit_status: i64,
}

pub type SpawnWaiter = oneshot::Sender<Result<CreateMachineOutcome, ChordError>>;
pub type SignWaiter = oneshot::Sender<Result<SignCertificatesOutcome, ChordError>>;
pub type ReadyWaiter = oneshot::Sender<Result<RunMachineOutcome, ChordError>>;
pub type TerminateWaiter = oneshot::Sender<Result<DeleteMachineOutcome, ChordError>>;

struct SpawningCtx {
    timer: JoinHandle<()>,
    waiter: SpawnWaiter,
}

struct SigningCtx {
    timer: JoinHandle<()>,
    waiter: SignWaiter,
}

struct ReadyCtx {
    timer: JoinHandle<()>,
    waiter: ReadyWaiter,
}

struct WaitingCtx {
    waiter: Option<TerminateWaiter>,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub registration_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub run_directory: PathBuf,
}

#[derive(Default)]
struct State {
    machines: HashMap<MachineId, MachineProcess>,
    spawning: HashMap<MachineId, SpawningCtx>,
    signing: HashMap<MachineId, SigningCtx>,
    ready: HashMap<MachineId, ReadyCtx>,
    waiting: HashMap<MachineId, WaitingCtx>,
    shutting_down: bool,
    idle_timer: Option<JoinHandle<()>>,
}

struct Inner {
    state: Mutex<State>,
    config: SupervisorConfig,
    exit_tx: mpsc::UnboundedSender<(MachineId, ExitStatus)>,
    shutdown_notify: Arc<Notify>,
}

/// The agent's single-threaded-in-spirit machine lifecycle state machine.
/// Cheap to clone; every clone shares the same locked state.
#[derive(Clone)]
pub struct MachineSupervisor(Arc<Inner>);

fn stop_timer(handle: JoinHandle<()>) {
    handle.abort();
}

fn stop_idle_timer(state: &mut State) {
    if let Some(handle) = state.idle_timer.take() {
        handle.abort();
    }
}

impl MachineSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            config,
            exit_tx,
            shutdown_notify: Arc::new(Notify::new()),
        });
        let supervisor = Self(inner);
        supervisor.spawn_exit_listener(exit_rx);
        {
            let mut state = supervisor.0.state.lock();
            supervisor.rearm_idle_timer(&mut state);
        }
        supervisor
    }

    /// Notified when the idle timer fires; the binary's main loop awaits
    /// this to begin orderly shutdown.
    pub fn shutdown_signal(&self) -> Arc<Notify> {
        self.0.shutdown_notify.clone()
    }

    fn spawn_exit_listener(&self, mut exit_rx: mpsc::UnboundedReceiver<(MachineId, ExitStatus)>) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            while let Some((id, status)) = exit_rx.recv().await {
                supervisor.release(id, status);
            }
        });
    }

    fn spawn_registration_timer(&self, name: MachineId) -> JoinHandle<()> {
        let supervisor = self.clone();
        let timeout = self.0.config.registration_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            supervisor.abandon(&name);
        })
    }

    fn rearm_idle_timer(&self, state: &mut State) {
        stop_idle_timer(state);
        if state.shutting_down {
            return;
        }
        if let Some(timeout) = self.0.config.idle_timeout {
            let supervisor = self.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                supervisor.0.shutdown_notify.notify_one();
            });
            state.idle_timer = Some(handle);
        }
    }

    /// Reject if shutting down or the name already exists. On success the
    /// idle timer is stopped unconditionally and a fresh `spawning` context
    /// is armed; `on_spawn` fires exactly once, here on failure or later via
    /// `request_certificates`/`abandon`.
    pub fn spawn_machine(
        &self,
        name: MachineId,
        execution_url: impl Into<String>,
        options: SpawnOptions,
        on_spawn: SpawnWaiter,
    ) -> Result<(), ChordError> {
        let mut state = self.0.state.lock();
        if state.shutting_down {
            let err = ChordError::internal_violation("agent is shutting down");
            let _ = on_spawn.send(Err(err.clone()));
            return Err(err);
        }
        if state.machines.contains_key(&name) {
            let err = ChordError::internal_violation(format!("machine already exists: {name}"));
            let _ = on_spawn.send(Err(err.clone()));
            return Err(err);
        }

        let mut process = MachineProcess::create(name.clone(), execution_url, options)?;
        match process.spawn(&self.0.config.run_directory, self.0.exit_tx.clone()) {
            Ok(()) => {
                stop_idle_timer(&mut state);
                process.set_state(MachineProcessState::Starting);
                state.machines.insert(name.clone(), process);
                let timer = self.spawn_registration_timer(name.clone());
                state.spawning.insert(name, SpawningCtx { timer, waiter: on_spawn });
                Ok(())
            }
            Err(e) => {
                let _ = on_spawn.send(Err(e.clone()));
                Err(e)
            }
        }
    }

    /// Fired by the child's `SignCertificates` call. Completes the
    /// `CreateMachine` RPC and opens the `signing` phase.
    pub fn request_certificates(
        &self,
        name: &MachineId,
        machine_url: String,
        declared_ports: Vec<DeclaredPort>,
        declared_endpoints: Vec<DeclaredEndpoint>,
        control_endpoint_index: i32,
        on_sign: SignWaiter,
    ) -> Result<(), ChordError> {
        let mut state = self.0.state.lock();
        let Some(ctx) = state.spawning.remove(name) else {
            let err = ChordError::internal_violation(format!("{name} is not in spawning phase"));
            let _ = on_sign.send(Err(err.clone()));
            return Err(err);
        };
        stop_timer(ctx.timer);
        let _ = ctx.waiter.send(Ok(CreateMachineOutcome {
            machine_url,
            declared_ports,
            declared_endpoints,
            control_endpoint_index,
        }));

        let timer = self.spawn_registration_timer(name.clone());
        state.signing.insert(name.clone(), SigningCtx { timer, waiter: on_sign });
        Ok(())
    }

    /// Fired by the isolate's `RunMachine` call. Completes `SignCertificates`
    /// and opens the `ready` phase.
    pub fn bind_certificates(
        &self,
        name: &MachineId,
        signed_endpoints: Vec<SignedEndpoint>,
        on_ready: ReadyWaiter,
    ) -> Result<(), ChordError> {
        let mut state = self.0.state.lock();
        let Some(ctx) = state.signing.remove(name) else {
            let err = ChordError::internal_violation(format!("{name} is not in signing phase"));
            let _ = on_ready.send(Err(err.clone()));
            return Err(err);
        };
        stop_timer(ctx.timer);
        let _ = ctx.waiter.send(Ok(SignCertificatesOutcome { signed_endpoints }));

        let timer = self.spawn_registration_timer(name.clone());
        state.ready.insert(name.clone(), ReadyCtx { timer, waiter: on_ready });
        Ok(())
    }

    /// Fired by the child's `AdvertiseEndpoints` call. Closes the `ready`
    /// phase, completes `RunMachine`, and marks the process `Running`.
    pub fn start_machine(
        &self,
        name: &MachineId,
        bound_endpoints: Vec<BoundEndpoint>,
    ) -> Result<(), ChordError> {
        let mut state = self.0.state.lock();
        let Some(ctx) = state.ready.remove(name) else {
            return Err(ChordError::internal_violation(format!("{name} is not in ready phase")));
        };
        stop_timer(ctx.timer);
        if let Some(process) = state.machines.get_mut(name) {
            process.set_state(MachineProcessState::Running);
        }
        let _ = ctx.waiter.send(Ok(RunMachineOutcome { bound_endpoints }));
        Ok(())
    }

    /// Install a terminate waiter and send SIGTERM. The waiter fires later,
    /// from `release`, once the child has actually been reaped.
    pub fn terminate_machine(
        &self,
        name: &MachineId,
        on_terminate: TerminateWaiter,
    ) -> Result<(), ChordError> {
        let mut state = self.0.state.lock();
        let Some(process) = state.machines.get(name) else {
            let err = ChordError::internal_violation(format!("machine not found: {name}"));
            let _ = on_terminate.send(Err(err.clone()));
            return Err(err);
        };
        if !process.state().can_terminate() {
            let err = ChordError::internal_violation(format!(
                "cannot terminate machine in state {}",
                process.state()
            ));
            let _ = on_terminate.send(Err(err.clone()));
            return Err(err);
        }
        if state.waiting.contains_key(name) {
            let err = ChordError::internal_violation("machine is already terminating");
            let _ = on_terminate.send(Err(err.clone()));
            return Err(err);
        }
        state.waiting.insert(name.clone(), WaitingCtx { waiter: Some(on_terminate) });
        match state.machines.get_mut(name) {
            Some(process) => process.terminate(Signal::SIGTERM),
            None => unreachable!("machine presence was checked above under the same lock"),
        }
    }

    /// Internal: fired only from a registration-phase timer. Fails the
    /// phase's waiter and installs a synthetic terminate waiter that
    /// swallows the eventual reap.
    fn abandon(&self, name: &MachineId) {
        let mut state = self.0.state.lock();
        let Some(process) = state.machines.get(name) else { return };
        if state.waiting.contains_key(name) {
            return;
        }
        if !matches!(process.state(), MachineProcessState::Created | MachineProcessState::Starting)
        {
            return;
        }

        let failed = if let Some(ctx) = state.spawning.remove(name) {
            let _ = ctx.waiter.send(Err(ChordError::internal_violation("abandoned machine")));
            true
        } else if let Some(ctx) = state.signing.remove(name) {
            let _ = ctx.waiter.send(Err(ChordError::internal_violation("abandoned machine")));
            true
        } else if let Some(ctx) = state.ready.remove(name) {
            let _ = ctx.waiter.send(Err(ChordError::internal_violation("abandoned machine")));
            true
        } else {
            false
        };
        if !failed {
            return;
        }

        state.waiting.insert(name.clone(), WaitingCtx { waiter: None });
        if let Some(process) = state.machines.get_mut(name) {
            let _ = process.terminate(Signal::SIGTERM);
        }
    }

    /// Internal: fired when the exit listener reaps a child. A crash during
    /// a registration phase (not a timeout) also fails that phase's waiter
    /// with `MachineError` — see the grounding ledger for why this
    /// implementation resolves that hazard this way rather than leaving the
    /// caller to hang.
    fn release(&self, name: MachineId, exit_status: ExitStatus) {
        let mut state = self.0.state.lock();

        if let Some(ctx) = state.spawning.remove(&name) {
            stop_timer(ctx.timer);
            let _ =
                ctx.waiter.send(Err(ChordError::machine_error("machine exited during registration")));
        } else if let Some(ctx) = state.signing.remove(&name) {
            stop_timer(ctx.timer);
            let _ =
                ctx.waiter.send(Err(ChordError::machine_error("machine exited during registration")));
        } else if let Some(ctx) = state.ready.remove(&name) {
            stop_timer(ctx.timer);
            let _ =
                ctx.waiter.send(Err(ChordError::machine_error("machine exited during registration")));
        }

        if let Some(ctx) = state.waiting.remove(&name) {
            if let Some(waiter) = ctx.waiter {
                let _ = waiter.send(Ok(DeleteMachineOutcome { exit_status: exit_status.code }));
            }
        }
        state.machines.remove(&name);

        if state.machines.is_empty() && state.waiting.is_empty() {
            self.rearm_idle_timer(&mut state);
        }
    }

    /// Idempotent after the first call: stops accepting new spawns and
    /// cancels the idle timer. In-flight machines drain naturally.
    pub fn shutdown(&self) {
        let mut state = self.0.state.lock();
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        stop_idle_timer(&mut state);
    }

    #[cfg(test)]
    fn phase_of(&self, name: &MachineId) -> Vec<&'static str> {
        let state = self.0.state.lock();
        let mut phases = Vec::new();
        if state.spawning.contains_key(name) {
            phases.push("spawning");
        }
        if state.signing.contains_key(name) {
            phases.push("signing");
        }
        if state.ready.contains_key(name) {
            phases.push("ready");
        }
        phases
    }

    #[cfg(test)]
    fn machine_count(&self) -> usize {
        self.0.state.lock().machines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn test_config(registration_timeout_ms: u64, idle_timeout_ms: Option<u64>) -> SupervisorConfig {
        SupervisorConfig {
            registration_timeout: StdDuration::from_millis(registration_timeout_ms),
            idle_timeout: idle_timeout_ms.map(StdDuration::from_millis),
            run_directory: PathBuf::from("/tmp"),
        }
    }

    #[tokio::test]
    async fn happy_path_advances_every_phase_exactly_once() {
        let supervisor = MachineSupervisor::new(test_config(5_000, None));
        let name = MachineId::from("m1");

        let (spawn_tx, spawn_rx) = oneshot::channel();
        supervisor
            .spawn_machine(name.clone(), "/bin/sleep", SpawnOptions {
                args: vec!["5".to_string()],
                env: Vec::new(),
            }, spawn_tx)
            .unwrap();
        assert_eq!(supervisor.phase_of(&name), vec!["spawning"]);

        let (sign_tx, sign_rx) = oneshot::channel();
        supervisor
            .request_certificates(&name, "chord://m1".into(), vec![], vec![], 0, sign_tx)
            .unwrap();
        let spawn_outcome = spawn_rx.await.unwrap().unwrap();
        assert_eq!(spawn_outcome.machine_url, "chord://m1");
        assert_eq!(supervisor.phase_of(&name), vec!["signing"]);

        let (ready_tx, ready_rx) = oneshot::channel();
        supervisor.bind_certificates(&name, vec![], ready_tx).unwrap();
        sign_rx.await.unwrap().unwrap();
        assert_eq!(supervisor.phase_of(&name), vec!["ready"]);

        supervisor.start_machine(&name, vec![]).unwrap();
        ready_rx.await.unwrap().unwrap();
        assert!(supervisor.phase_of(&name).is_empty());

        let (term_tx, term_rx) = oneshot::channel();
        supervisor.terminate_machine(&name, term_tx).unwrap();
        let outcome = term_rx.await.unwrap().unwrap();
        assert_eq!(outcome.exit_status, 0);
    }

    #[tokio::test]
    async fn duplicate_spawn_is_internal_violation() {
        let supervisor = MachineSupervisor::new(test_config(5_000, None));
        let name = MachineId::from("dup");

        let (tx1, _rx1) = oneshot::channel();
        supervisor
            .spawn_machine(name.clone(), "/bin/sleep", SpawnOptions { args: vec!["2".into()], env: vec![] }, tx1)
            .unwrap();

        let (tx2, rx2) = oneshot::channel();
        let err = supervisor
            .spawn_machine(name.clone(), "/bin/sleep", SpawnOptions { args: vec!["2".into()], env: vec![] }, tx2)
            .unwrap_err();
        assert!(matches!(err, ChordError::InternalViolation(_)));
        assert!(rx2.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn double_terminate_exactly_one_ok() {
        let supervisor = MachineSupervisor::new(test_config(5_000, None));
        let name = MachineId::from("m2");
        let (spawn_tx, _spawn_rx) = oneshot::channel();
        supervisor
            .spawn_machine(name.clone(), "/bin/sleep", SpawnOptions { args: vec!["5".into()], env: vec![] }, spawn_tx)
            .unwrap();

        let (tx1, _rx1) = oneshot::channel();
        let first = supervisor.terminate_machine(&name, tx1);
        let (tx2, rx2) = oneshot::channel();
        let second = supervisor.terminate_machine(&name, tx2);

        assert!(first.is_ok());
        assert!(second.is_err());
        assert!(rx2.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn handshake_timeout_abandons_machine() {
        let supervisor = MachineSupervisor::new(test_config(30, None));
        let name = MachineId::from("m3");
        let (spawn_tx, spawn_rx) = oneshot::channel();
        supervisor
            .spawn_machine(name.clone(), "/bin/sleep", SpawnOptions { args: vec!["5".into()], env: vec![] }, spawn_tx)
            .unwrap();

        let err = spawn_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, ChordError::InternalViolation(_)));
        assert_eq!(err.message(), "internal violation: abandoned machine");

        tokio::time::sleep(StdDuration::from_millis(200)).await;
        assert_eq!(supervisor.machine_count(), 0);
    }

    // Property: whatever order CreateMachine/SignCertificates/RunMachine
    // arrive in, a machine id never sits in more than one phase table.
    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig::with_cases(16))]
        #[test]
        fn phase_exclusivity_holds_across_random_advance_counts(advances in 0u8..4) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            rt.block_on(async {
                let supervisor = MachineSupervisor::new(test_config(5_000, None));
                let name = MachineId::from("prop-m");
                let (spawn_tx, _spawn_rx) = oneshot::channel();
                supervisor
                    .spawn_machine(name.clone(), "/bin/sleep", SpawnOptions { args: vec!["5".into()], env: vec![] }, spawn_tx)
                    .unwrap();
                assert!(supervisor.phase_of(&name).len() <= 1);

                if advances >= 1 {
                    let (sign_tx, _sign_rx) = oneshot::channel();
                    supervisor.request_certificates(&name, "chord://prop".into(), vec![], vec![], 0, sign_tx).unwrap();
                    assert!(supervisor.phase_of(&name).len() <= 1);
                }
                if advances >= 2 {
                    let (ready_tx, _ready_rx) = oneshot::channel();
                    supervisor.bind_certificates(&name, vec![], ready_tx).unwrap();
                    assert!(supervisor.phase_of(&name).len() <= 1);
                }
                if advances >= 3 {
                    supervisor.start_machine(&name, vec![]).unwrap();
                    assert!(supervisor.phase_of(&name).is_empty());
                }

                let (term_tx, term_rx) = oneshot::channel();
                let _ = supervisor.terminate_machine(&name, term_tx);
                let _ = term_rx.await;
            });
        }
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_rejects_new_spawns() {
        let supervisor = MachineSupervisor::new(test_config(5_000, None));
        supervisor.shutdown();
        supervisor.shutdown();

        let (tx, rx) = oneshot::channel();
        let err = supervisor
            .spawn_machine(MachineId::from("late"), "/bin/true", SpawnOptions::default(), tx)
            .unwrap_err();
        assert!(matches!(err, ChordError::InternalViolation(_)));
        assert!(rx.await.unwrap().is_err());
    }
}
