//! Thin adapter over [`MachineSupervisor`]: validates each RPC's inputs,
//! translates it into one supervisor call plus a waiter, and turns the
//! waiter's eventual result into an [`AgentResponse`].

use crate::process::SpawnOptions;
use crate::supervisor::MachineSupervisor;
use crate::url::{machine_id_from_url, machine_url};
use chord_core::{ChordError, Clock, DeclaredPort, MachineId};
use chord_wire::{AgentReply, AgentRequest, AgentResponse};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Everything `create_machine` needs to build the spawned `chord-machine`
/// process's argv: the binary to exec, how it dials back into this agent,
/// and where its own files live.
#[derive(Clone)]
pub struct MachineSpawnContext {
    pub machine_executable: PathBuf,
    pub supervisor_endpoint: String,
    pub supervisor_server_name: String,
    pub ca_bundle_file: PathBuf,
    pub run_directory: PathBuf,
    pub log_directory: PathBuf,
}

pub struct AgentService<C: Clock> {
    supervisor: MachineSupervisor,
    server_name: String,
    agent_name: String,
    start_instant: Instant,
    clock: C,
    spawn_context: MachineSpawnContext,
}

impl<C: Clock> AgentService<C> {
    pub fn new(
        supervisor: MachineSupervisor,
        server_name: impl Into<String>,
        agent_name: impl Into<String>,
        clock: C,
        spawn_context: MachineSpawnContext,
    ) -> Self {
        Self {
            supervisor,
            server_name: server_name.into(),
            agent_name: agent_name.into(),
            start_instant: clock.now(),
            clock,
            spawn_context,
        }
    }

    pub async fn dispatch(&self, request: AgentRequest) -> AgentResponse {
        match request {
            AgentRequest::IdentifyAgent => self.identify_agent(),
            AgentRequest::CreateMachine { name, execution_url, config_hash, requested_ports, start_suspended } => {
                self.create_machine(name, execution_url, config_hash, requested_ports, start_suspended).await
            }
            AgentRequest::SignCertificates { machine_url, declared_ports, declared_endpoints } => {
                self.sign_certificates(machine_url, declared_ports, declared_endpoints).await
            }
            AgentRequest::RunMachine { machine_url, signed_endpoints } => {
                self.run_machine(machine_url, signed_endpoints).await
            }
            AgentRequest::AdvertiseEndpoints { machine_url, bound_endpoints } => {
                self.advertise_endpoints(machine_url, bound_endpoints)
            }
            AgentRequest::DeleteMachine { machine_url } => self.delete_machine(machine_url).await,
        }
    }

    fn identify_agent(&self) -> AgentResponse {
        let uptime_millis = self.clock.now().saturating_duration_since(self.start_instant).as_millis() as u64;
        AgentResponse::Ok(AgentReply::IdentifyAgent { agent_name: self.agent_name.clone(), uptime_millis })
    }

    async fn create_machine(
        &self,
        name: String,
        execution_url: String,
        config_hash: String,
        requested_ports: Vec<chord_core::RequestedPort>,
        start_suspended: bool,
    ) -> AgentResponse {
        if serde_json::from_str::<serde_json::Value>(&config_hash).is_err() {
            return AgentResponse::from_error(&ChordError::invalid_configuration("config_hash is not valid json"));
        }
        let mut seen = HashSet::new();
        for port in &requested_ports {
            if !seen.insert(port.protocol_url.clone()) {
                return AgentResponse::from_error(&ChordError::invalid_configuration(format!(
                    "duplicate requested protocol_url: {}",
                    port.protocol_url
                )));
            }
        }

        // config_hash carries no schema in this workspace; it is only
        // validated as JSON here, not forwarded to the child.
        let _ = config_hash;

        let machine_id = MachineId::from(name.as_str());
        let machine_url = self.machine_url_for(&machine_id);
        let machine_server_name = format!("{machine_id}.chord");
        let ctx = &self.spawn_context;

        let mut args = vec![
            "--machine-url".to_string(),
            machine_url,
            "--main-location".to_string(),
            execution_url,
            "--supervisor-endpoint".to_string(),
            ctx.supervisor_endpoint.clone(),
            "--supervisor-server-name".to_string(),
            ctx.supervisor_server_name.clone(),
            "--machine-server-name".to_string(),
            machine_server_name,
            "--run-directory".to_string(),
            ctx.run_directory.display().to_string(),
            "--ca-bundle".to_string(),
            ctx.ca_bundle_file.display().to_string(),
            "--log-file".to_string(),
            ctx.log_directory.join(format!("machine-{machine_id}.log")).display().to_string(),
        ];
        if start_suspended {
            args.push("--start-suspended".to_string());
        }
        for port in &requested_ports {
            args.push("--expected-port".to_string());
            args.push(port.protocol_url.clone());
        }
        let options = SpawnOptions { args, env: Vec::new() };

        let (tx, rx) = tokio::sync::oneshot::channel();
        if let Err(e) =
            self.supervisor.spawn_machine(machine_id, ctx.machine_executable.display().to_string(), options, tx)
        {
            return AgentResponse::from_error(&e);
        }
        match rx.await {
            Ok(Ok(outcome)) => AgentResponse::Ok(AgentReply::CreateMachine {
                machine_url: outcome.machine_url,
                declared_ports: outcome.declared_ports,
                declared_endpoints: outcome.declared_endpoints,
                control_endpoint_index: outcome.control_endpoint_index,
            }),
            Ok(Err(e)) => AgentResponse::from_error(&e),
            Err(_) => AgentResponse::from_error(&ChordError::agent_error("spawn waiter dropped")),
        }
    }

    async fn sign_certificates(
        &self,
        machine_url: String,
        declared_ports: Vec<chord_core::DeclaredPort>,
        declared_endpoints: Vec<chord_core::DeclaredEndpoint>,
    ) -> AgentResponse {
        let machine_id = match machine_id_from_url(&machine_url) {
            Ok(id) => id,
            Err(e) => return AgentResponse::from_error(&e),
        };
        if let Err(e) = validate_declared_ports(&declared_ports) {
            return AgentResponse::from_error(&e);
        }

        let control_endpoint_index = 0;
        let (tx, rx) = tokio::sync::oneshot::channel();
        if let Err(e) = self.supervisor.request_certificates(
            &machine_id,
            machine_url,
            declared_ports,
            declared_endpoints,
            control_endpoint_index,
            tx,
        ) {
            return AgentResponse::from_error(&e);
        }
        match rx.await {
            Ok(Ok(outcome)) => {
                AgentResponse::Ok(AgentReply::SignCertificates { signed_endpoints: outcome.signed_endpoints })
            }
            Ok(Err(e)) => AgentResponse::from_error(&e),
            Err(_) => AgentResponse::from_error(&ChordError::agent_error("sign waiter dropped")),
        }
    }

    async fn run_machine(
        &self,
        machine_url: String,
        signed_endpoints: Vec<chord_core::SignedEndpoint>,
    ) -> AgentResponse {
        let machine_id = match machine_id_from_url(&machine_url) {
            Ok(id) => id,
            Err(e) => return AgentResponse::from_error(&e),
        };
        let (tx, rx) = tokio::sync::oneshot::channel();
        if let Err(e) = self.supervisor.bind_certificates(&machine_id, signed_endpoints, tx) {
            return AgentResponse::from_error(&e);
        }
        match rx.await {
            Ok(Ok(outcome)) => AgentResponse::Ok(AgentReply::RunMachine { bound_endpoints: outcome.bound_endpoints }),
            Ok(Err(e)) => AgentResponse::from_error(&e),
            Err(_) => AgentResponse::from_error(&ChordError::agent_error("ready waiter dropped")),
        }
    }

    fn advertise_endpoints(
        &self,
        machine_url: String,
        bound_endpoints: Vec<chord_core::BoundEndpoint>,
    ) -> AgentResponse {
        let machine_id = match machine_id_from_url(&machine_url) {
            Ok(id) => id,
            Err(e) => return AgentResponse::from_error(&e),
        };
        match self.supervisor.start_machine(&machine_id, bound_endpoints) {
            Ok(()) => AgentResponse::Ok(AgentReply::AdvertiseEndpoints),
            Err(e) => AgentResponse::from_error(&e),
        }
    }

    async fn delete_machine(&self, machine_url: String) -> AgentResponse {
        let machine_id = match machine_id_from_url(&machine_url) {
            Ok(id) => id,
            Err(e) => return AgentResponse::from_error(&e),
        };
        let (tx, rx) = tokio::sync::oneshot::channel();
        if let Err(e) = self.supervisor.terminate_machine(&machine_id, tx) {
            return AgentResponse::from_error(&e);
        }
        match rx.await {
            Ok(Ok(outcome)) => AgentResponse::Ok(AgentReply::DeleteMachine { exit_status: outcome.exit_status }),
            Ok(Err(e)) => AgentResponse::from_error(&e),
            Err(_) => AgentResponse::from_error(&ChordError::agent_error("terminate waiter dropped")),
        }
    }

    pub fn machine_url_for(&self, name: &MachineId) -> String {
        machine_url(&self.server_name, name)
    }
}

fn validate_declared_ports(ports: &[DeclaredPort]) -> Result<(), ChordError> {
    let mut seen = HashSet::new();
    for port in ports {
        if port.endpoint_index < 0 {
            return Err(ChordError::invalid_configuration(format!(
                "endpoint_index out of range: {}",
                port.endpoint_index
            )));
        }
        if !seen.insert((port.protocol_url.clone(), port.endpoint_index)) {
            return Err(ChordError::invalid_configuration(format!(
                "duplicate declared protocol/endpoint pair: {}/{}",
                port.protocol_url, port.endpoint_index
            )));
        }
    }
    Ok(())
}

pub type SharedAgentService<C> = Arc<AgentService<C>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SupervisorConfig;
    use chord_core::SystemClock;
    use std::path::PathBuf;
    use std::time::Duration;

    fn service() -> AgentService<SystemClock> {
        let supervisor = MachineSupervisor::new(SupervisorConfig {
            registration_timeout: Duration::from_secs(5),
            idle_timeout: None,
            run_directory: PathBuf::from("/tmp"),
        });
        let spawn_context = MachineSpawnContext {
            machine_executable: PathBuf::from("/bin/true"),
            supervisor_endpoint: "unix:///tmp/agent.sock".into(),
            supervisor_server_name: "agent.chord".into(),
            ca_bundle_file: PathBuf::from("/tmp/rootca.crt"),
            run_directory: PathBuf::from("/tmp"),
            log_directory: PathBuf::from("/tmp"),
        };
        AgentService::new(supervisor, "agent.chord", "test-agent", SystemClock::default(), spawn_context)
    }

    #[tokio::test]
    async fn identify_agent_reports_name() {
        let svc = service();
        match svc.dispatch(AgentRequest::IdentifyAgent).await {
            AgentResponse::Ok(AgentReply::IdentifyAgent { agent_name, .. }) => {
                assert_eq!(agent_name, "test-agent");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_machine_rejects_malformed_config_hash() {
        let svc = service();
        let response = svc
            .dispatch(AgentRequest::CreateMachine {
                name: "m1".into(),
                execution_url: "/bin/true".into(),
                config_hash: "not json".into(),
                requested_ports: vec![],
                start_suspended: false,
            })
            .await;
        assert!(matches!(response, AgentResponse::Error { kind: chord_wire::ErrorKind::InvalidArgument, .. }));
    }

    #[tokio::test]
    async fn create_machine_rejects_duplicate_requested_ports() {
        let svc = service();
        let port = chord_core::RequestedPort {
            protocol_url: "chord://plug".into(),
            port_type: chord_core::PortType::OneShot,
            port_direction: chord_core::PortDirection::Server,
        };
        let response = svc
            .dispatch(AgentRequest::CreateMachine {
                name: "m2".into(),
                execution_url: "/bin/true".into(),
                config_hash: "{}".into(),
                requested_ports: vec![port.clone(), port],
                start_suspended: false,
            })
            .await;
        assert!(matches!(response, AgentResponse::Error { kind: chord_wire::ErrorKind::InvalidArgument, .. }));
    }

    #[tokio::test]
    async fn delete_unknown_machine_is_aborted() {
        let svc = service();
        let response = svc.dispatch(AgentRequest::DeleteMachine { machine_url: "chord://agent.chord/ghost".into() }).await;
        assert!(matches!(response, AgentResponse::Error { kind: chord_wire::ErrorKind::Aborted, .. }));
    }
}
