//! Child-side registration: dials the agent over the anonymous supervisor
//! endpoint and signs a CSR for the binder's own identity. The bound
//! endpoint is advertised separately, once the caller's binder is actually
//! listening — see [`sign_certificates`] and [`PendingRegistration::advertise_bound`].

use crate::config::MachineConfig;
use chord_core::{BoundEndpoint, ChordError, DeclaredEndpoint, DeclaredPort, PortDirection, PortType, TransportKind};
use chord_tls::LocalIdentity;
use chord_wire::{read_typed, write_typed, AgentReply, AgentRequest, AgentResponse};
use rustls_pki_types::ServerName;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::TlsConnector;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Identity and signed certificate this machine presents at its own
/// binder, produced by the registration handshake.
pub struct Registration {
    pub identity: LocalIdentity,
    pub cert_pem: String,
}

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

async fn dial(config: &MachineConfig) -> Result<Box<dyn AsyncStream>, ChordError> {
    let tls_config = chord_tls::client_config_anonymous(&config.ca_bundle_pem)?;
    let connector = TlsConnector::from(tls_config);
    let server_name = ServerName::try_from(config.supervisor_server_name.clone())
        .map_err(|e| ChordError::invalid_configuration(format!("invalid supervisor server name: {e}")))?;

    match config.supervisor_endpoint.kind() {
        TransportKind::Unix => {
            let path = config
                .supervisor_endpoint
                .unix_path()
                .ok_or_else(|| ChordError::invalid_configuration("unix location carries no path"))?;
            let stream = UnixStream::connect(path)
                .await
                .map_err(|e| ChordError::agent_error(format!("connect to agent failed: {e}")))?;
            let tls = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ChordError::agent_error(format!("tls handshake with agent failed: {e}")))?;
            Ok(Box::new(tls))
        }
        TransportKind::Tcp4 => {
            let target = config.supervisor_endpoint.to_target();
            let stream = TcpStream::connect(&target)
                .await
                .map_err(|e| ChordError::agent_error(format!("connect to agent failed: {e}")))?;
            let tls = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ChordError::agent_error(format!("tls handshake with agent failed: {e}")))?;
            Ok(Box::new(tls))
        }
    }
}

/// A registration in progress: the signed identity is in hand, but the
/// agent has not yet been told the binder is bound. Holds the same
/// anonymous connection the `SignCertificates` call used, so
/// `advertise_bound` doesn't need to dial or re-authenticate.
pub struct PendingRegistration {
    stream: Box<dyn AsyncStream>,
    machine_url: String,
    registration: Registration,
}

/// Signs a CSR for `binder_endpoint_url` with the agent, but does not yet
/// advertise it as bound. Callers must bind their binder with the returned
/// certificate and only then call [`PendingRegistration::advertise_bound`] —
/// advertising before the binder accepts connections would let the agent
/// (and anything it unblocks downstream) race a connect against a listener
/// that isn't there yet.
pub async fn sign_certificates(config: &MachineConfig, binder_endpoint_url: &str) -> Result<PendingRegistration, ChordError> {
    let identity = LocalIdentity::generate(&config.machine_server_name, &[])?;
    let mut stream = dial(config).await?;

    let declared_ports: Vec<DeclaredPort> = config
        .expected_ports
        .iter()
        .map(|protocol_url| DeclaredPort {
            protocol_url: protocol_url.clone(),
            endpoint_index: 0,
            port_type: PortType::Streaming,
            port_direction: PortDirection::BiDirectional,
        })
        .collect();

    let sign_request = AgentRequest::SignCertificates {
        machine_url: config.machine_url.clone(),
        declared_ports,
        declared_endpoints: vec![DeclaredEndpoint {
            endpoint_url: binder_endpoint_url.to_string(),
            csr: identity.csr_pem().to_string(),
        }],
    };
    let signed_endpoints = match call(&mut stream, sign_request).await? {
        AgentReply::SignCertificates { signed_endpoints } => signed_endpoints,
        other => return Err(ChordError::agent_error(format!("unexpected reply to SignCertificates: {other:?}"))),
    };
    let cert_pem = signed_endpoints
        .into_iter()
        .find(|endpoint| endpoint.endpoint_url == binder_endpoint_url)
        .map(|endpoint| endpoint.certificate)
        .ok_or_else(|| ChordError::agent_error("agent signed no certificate for our binder endpoint"))?;

    Ok(PendingRegistration { stream, machine_url: config.machine_url.clone(), registration: Registration { identity, cert_pem } })
}

impl PendingRegistration {
    pub fn cert_pem(&self) -> &str {
        &self.registration.cert_pem
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.registration.identity
    }

    /// Tells the agent `binder_endpoint_url` is now bound and accepting
    /// connections. Call only once the binder is actually listening.
    pub async fn advertise_bound(mut self, binder_endpoint_url: &str) -> Result<Registration, ChordError> {
        let advertise_request = AgentRequest::AdvertiseEndpoints {
            machine_url: self.machine_url.clone(),
            bound_endpoints: vec![BoundEndpoint { endpoint_url: binder_endpoint_url.to_string() }],
        };
        match call(&mut self.stream, advertise_request).await? {
            AgentReply::AdvertiseEndpoints => {}
            other => return Err(ChordError::agent_error(format!("unexpected reply to AdvertiseEndpoints: {other:?}"))),
        }
        Ok(self.registration)
    }
}

async fn call(stream: &mut Box<dyn AsyncStream>, request: AgentRequest) -> Result<AgentReply, ChordError> {
    write_typed(stream, &request, RPC_TIMEOUT)
        .await
        .map_err(|e| ChordError::agent_error(format!("request to agent failed: {e}")))?;
    let response: AgentResponse = read_typed(stream, RPC_TIMEOUT)
        .await
        .map_err(|e| ChordError::agent_error(format!("reply from agent failed: {e}")))?;
    match response {
        AgentResponse::Ok(reply) => Ok(reply),
        AgentResponse::Error { message, .. } => Err(ChordError::agent_error(format!("agent rejected request: {message}"))),
    }
}
