//! `ChordIsolate`: the client embedding's top-level entry point. Establishes
//! or discovers a session, then drives the four-RPC handshake
//! (`IdentifyAgent` -> `CreateMachine` -> local CSR signing -> `RunMachine`)
//! for each machine it launches, handing back a [`RemoteMachine`] once every
//! requested plug is attached.

use crate::bootstrap::establish as establish_session;
use crate::config::IsolateConfig;
use crate::connector::{AgentClient, GrpcConnector, IsolateIdentity, PlugHandler};
use crate::signer::LocalCertificateSigner;
use chord_core::{ChordError, MachineState, PortDirection, PortType, RequestedPort, TransportLocation};
use chord_machine::binder::StreamWriter;
use chord_tls::{CertificateAuthority, DEFAULT_CERT_LIFETIME};
use chord_wire::{AgentReply, AgentRequest};
use std::collections::HashMap;
use std::sync::Arc;

/// One port the launched machine should declare, plus the handler that
/// reacts to frames arriving on it once attached.
pub struct PlugRequest {
    pub protocol_url: String,
    pub port_type: PortType,
    pub port_direction: PortDirection,
    pub handler: Arc<dyn PlugHandler>,
}

pub struct LaunchRequest {
    pub name: String,
    pub execution_url: String,
    pub config_hash: String,
    pub plugs: Vec<PlugRequest>,
    pub start_suspended: bool,
}

/// Holds the session's CA and the agent's RPC address. One `ChordIsolate`
/// per session; each `launch` call produces an independent `RemoteMachine`.
pub struct ChordIsolate {
    agent: AgentClient,
    ca: CertificateAuthority,
}

impl ChordIsolate {
    /// Finds or spawns the session's agent per `config.mode`, then issues
    /// this isolate's own client identity off the resulting CA.
    pub async fn establish(config: IsolateConfig, ca: Option<CertificateAuthority>) -> Result<Self, ChordError> {
        config.validate()?;
        let established = establish_session(&config, ca).await?;
        let own_identity = established.ca.issue_server_cert("chord-isolate.client", DEFAULT_CERT_LIFETIME)?;
        let identity = IsolateIdentity {
            ca_bundle_pem: established.ca.cert_pem().to_string(),
            cert_pem: own_identity.cert_pem,
            key_pem: own_identity.key_pem,
        };
        let agent = AgentClient::new(identity, established.endpoint);
        Ok(Self { agent, ca: established.ca })
    }

    pub async fn identify_agent(&self) -> Result<(String, u64), ChordError> {
        match self.agent.call(AgentRequest::IdentifyAgent).await? {
            AgentReply::IdentifyAgent { agent_name, uptime_millis } => Ok((agent_name, uptime_millis)),
            other => Err(ChordError::agent_error(format!("unexpected reply to IdentifyAgent: {other:?}"))),
        }
    }

    /// Runs the full launch handshake and returns a handle to the running
    /// machine. Resumes the machine automatically unless `start_suspended`
    /// was requested.
    pub async fn launch(&self, request: LaunchRequest) -> Result<RemoteMachine, ChordError> {
        self.identify_agent().await?;

        let requested_ports: Vec<RequestedPort> = request
            .plugs
            .iter()
            .map(|plug| RequestedPort {
                protocol_url: plug.protocol_url.clone(),
                port_type: plug.port_type,
                port_direction: plug.port_direction,
            })
            .collect();

        let create_reply = self
            .agent
            .call(AgentRequest::CreateMachine {
                name: request.name.clone(),
                execution_url: request.execution_url.clone(),
                config_hash: request.config_hash.clone(),
                requested_ports,
                start_suspended: request.start_suspended,
            })
            .await?;
        let (machine_url, declared_endpoints) = match create_reply {
            AgentReply::CreateMachine { machine_url, declared_endpoints, .. } => (machine_url, declared_endpoints),
            other => return Err(ChordError::agent_error(format!("unexpected reply to CreateMachine: {other:?}"))),
        };

        let signed_endpoints = LocalCertificateSigner::new(&self.ca).sign_all(&declared_endpoints)?;

        let run_reply =
            self.agent.call(AgentRequest::RunMachine { machine_url: machine_url.clone(), signed_endpoints }).await?;
        let bound_endpoints = match run_reply {
            AgentReply::RunMachine { bound_endpoints } => bound_endpoints,
            other => return Err(ChordError::agent_error(format!("unexpected reply to RunMachine: {other:?}"))),
        };
        let binder_url = bound_endpoints
            .first()
            .ok_or_else(|| ChordError::agent_error("machine advertised no bound endpoints"))?
            .endpoint_url
            .clone();
        let binder = TransportLocation::from_url(&binder_url)?;

        let connector = GrpcConnector::new(self.agent.identity().clone(), binder);
        connector.start_monitor();

        let mut writers = HashMap::new();
        for plug in request.plugs {
            let writer = connector.open_plug(&plug.protocol_url, Arc::clone(&plug.handler)).await?;
            writers.insert(plug.protocol_url, writer);
        }

        if !request.start_suspended {
            connector.resume().await?;
        }

        Ok(RemoteMachine { machine_url, connector, writers })
    }

    pub async fn delete_machine(&self, machine_url: String) -> Result<i64, ChordError> {
        match self.agent.call(AgentRequest::DeleteMachine { machine_url }).await? {
            AgentReply::DeleteMachine { exit_status } => Ok(exit_status),
            other => Err(ChordError::agent_error(format!("unexpected reply to DeleteMachine: {other:?}"))),
        }
    }
}

/// A handle to one launched machine: its control channel, monitor, and
/// every attached plug's write queue.
pub struct RemoteMachine {
    pub machine_url: String,
    connector: Arc<GrpcConnector>,
    writers: HashMap<String, Arc<StreamWriter>>,
}

impl RemoteMachine {
    pub fn plug_writer(&self, protocol_url: &str) -> Option<Arc<StreamWriter>> {
        self.writers.get(protocol_url).cloned()
    }

    /// Opens an additional plug beyond the ones requested at launch. Reattaching
    /// to a `protocol_url` that is already attached fails the same way a second
    /// `launch`-time plug on that URL would.
    pub async fn open_plug(&self, protocol_url: &str, handler: Arc<dyn PlugHandler>) -> Result<Arc<StreamWriter>, ChordError> {
        self.connector.open_plug(protocol_url, handler).await
    }

    pub async fn suspend(&self) -> Result<(), ChordError> {
        self.connector.suspend().await
    }

    pub async fn resume(&self) -> Result<(), ChordError> {
        self.connector.resume().await
    }

    pub async fn terminate(&self) -> Result<(), ChordError> {
        self.connector.terminate().await
    }

    pub fn current_state(&self) -> MachineState {
        self.connector.monitor().current_state()
    }

    /// Blocks until the machine reaches a terminal state, returning its
    /// exit status code.
    pub async fn run_until_finished(&self) -> i64 {
        self.connector.run_until_finished().await
    }
}
