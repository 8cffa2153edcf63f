//! Client-side dialing and the per-machine remoting container.
//!
//! [`AgentClient`] drives the agent's lifecycle RPCs (`IdentifyAgent`,
//! `CreateMachine`, `RunMachine`, `DeleteMachine`) before any machine binder
//! exists. [`GrpcConnector`] is created once a machine's binder is bound: it
//! holds the one TLS identity the isolate reuses for every channel to that
//! binder (control, monitor, and each attached plug), plus the
//! [`chord_machine::runner::MachineMonitor`] its monitor stream feeds.

use chord_core::{ChordError, TransportKind, TransportLocation};
use chord_machine::binder::StreamWriter;
use chord_machine::runner::MachineMonitor;
use chord_wire::{
    read_typed, write_typed, AgentReply, AgentRequest, AgentResponse, CommunicateOpen, ControlRequest,
    ControlResponse, Message, MonitorEvent, RemotingOpenResult, RemotingRequest,
};
use rustls_pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::TlsConnector;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(3600);

/// Reacts to one attached plug's incoming frames. Mirrors
/// `chord_machine::binder::PortHandler` on the client side of the same
/// `Communicate` stream.
pub trait PlugHandler: Send + Sync {
    fn handle(&self, data: Vec<u8>, writer: &StreamWriter);
}

trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// TLS identity the isolate presents on every channel it opens: to the
/// agent and to every machine binder alike. Neither verifier checks the
/// client certificate's CN, only the chain to the shared root, so one
/// self-issued identity covers the whole session.
#[derive(Clone)]
pub struct IsolateIdentity {
    pub ca_bundle_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
}

async fn dial(identity: &IsolateIdentity, location: &TransportLocation) -> Result<Box<dyn AsyncStream>, ChordError> {
    let tls_config = chord_tls::client_config(&identity.ca_bundle_pem, &identity.cert_pem, &identity.key_pem)?;
    let connector = TlsConnector::from(tls_config);
    let server_name = ServerName::try_from(location.server_name().to_string())
        .map_err(|e| ChordError::invalid_configuration(format!("invalid server name: {e}")))?;

    match location.kind() {
        TransportKind::Unix => {
            let path = location
                .unix_path()
                .ok_or_else(|| ChordError::invalid_configuration("unix location carries no path"))?;
            let stream = UnixStream::connect(path)
                .await
                .map_err(|e| ChordError::agent_error(format!("connect to {} failed: {e}", location)))?;
            let tls = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ChordError::agent_error(format!("tls handshake with {} failed: {e}", location)))?;
            Ok(Box::new(tls))
        }
        TransportKind::Tcp4 => {
            let target = location.to_target();
            let stream = TcpStream::connect(&target)
                .await
                .map_err(|e| ChordError::agent_error(format!("connect to {} failed: {e}", location)))?;
            let tls = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| ChordError::agent_error(format!("tls handshake with {} failed: {e}", location)))?;
            Ok(Box::new(tls))
        }
    }
}

/// Drives the agent's lifecycle RPCs over fresh, anonymous-per-call-free
/// connections (the isolate always holds a cert, since it holds the CA).
pub struct AgentClient {
    identity: IsolateIdentity,
    location: TransportLocation,
}

impl AgentClient {
    pub fn new(identity: IsolateIdentity, location: TransportLocation) -> Self {
        Self { identity, location }
    }

    pub fn identity(&self) -> &IsolateIdentity {
        &self.identity
    }

    pub async fn call(&self, request: AgentRequest) -> Result<AgentReply, ChordError> {
        let mut stream = dial(&self.identity, &self.location).await?;
        write_typed(&mut stream, &request, RPC_TIMEOUT)
            .await
            .map_err(|e| ChordError::agent_error(format!("request to agent failed: {e}")))?;
        let response: AgentResponse = read_typed(&mut stream, RPC_TIMEOUT)
            .await
            .map_err(|e| ChordError::agent_error(format!("reply from agent failed: {e}")))?;
        match response {
            AgentResponse::Ok(reply) => Ok(reply),
            AgentResponse::Error { message, .. } => Err(ChordError::agent_error(format!("agent rejected request: {message}"))),
        }
    }
}

/// Everything the isolate holds for one launched machine: its binder
/// location, the TLS identity dialed with, the monitor its background
/// stream feeds, and a lock serializing `suspend`/`resume`/`terminate`
/// against each other.
pub struct GrpcConnector {
    identity: IsolateIdentity,
    binder: TransportLocation,
    monitor: Arc<MachineMonitor>,
    op_lock: tokio::sync::Mutex<()>,
}

impl GrpcConnector {
    pub fn new(identity: IsolateIdentity, binder: TransportLocation) -> Arc<Self> {
        Arc::new(Self { identity, binder, monitor: MachineMonitor::new(), op_lock: tokio::sync::Mutex::new(()) })
    }

    pub fn monitor(&self) -> Arc<MachineMonitor> {
        Arc::clone(&self.monitor)
    }

    async fn dial(&self) -> Result<Box<dyn AsyncStream>, ChordError> {
        dial(&self.identity, &self.binder).await
    }

    async fn send_control(&self, command: ControlRequest) -> Result<(), ChordError> {
        let _guard = self.op_lock.lock().await;
        let mut stream = self.dial().await?;
        write_typed(&mut stream, &RemotingRequest::Control(command), RPC_TIMEOUT)
            .await
            .map_err(|e| ChordError::agent_error(format!("control request failed: {e}")))?;
        let response: ControlResponse = read_typed(&mut stream, RPC_TIMEOUT)
            .await
            .map_err(|e| ChordError::agent_error(format!("control reply failed: {e}")))?;
        match response {
            ControlResponse::Ok => Ok(()),
            ControlResponse::Err { message } => Err(ChordError::agent_error(format!("control request rejected: {message}"))),
        }
    }

    pub async fn suspend(&self) -> Result<(), ChordError> {
        self.send_control(ControlRequest::Suspend).await
    }

    pub async fn resume(&self) -> Result<(), ChordError> {
        self.send_control(ControlRequest::Resume).await
    }

    pub async fn terminate(&self) -> Result<(), ChordError> {
        self.send_control(ControlRequest::Terminate).await
    }

    /// Opens the machine's `Monitor` stream in the background, feeding
    /// every event into this connector's own `MachineMonitor` until the
    /// terminal `machine_exit`.
    pub fn start_monitor(self: &Arc<Self>) {
        let connector = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = connector.run_monitor_loop().await {
                tracing::warn!("monitor stream for {} ended: {e}", connector.binder);
            }
        });
    }

    async fn run_monitor_loop(&self) -> Result<(), ChordError> {
        let mut stream = self.dial().await?;
        write_typed(&mut stream, &RemotingRequest::Monitor, RPC_TIMEOUT)
            .await
            .map_err(|e| ChordError::agent_error(format!("monitor open failed: {e}")))?;
        loop {
            let event: MonitorEvent = match read_typed(&mut stream, IDLE_READ_TIMEOUT).await {
                Ok(event) => event,
                Err(_) => return Ok(()),
            };
            match event {
                MonitorEvent::StateChanged { curr_state } => self.monitor.record_state(curr_state),
                MonitorEvent::MachineExit { exit_status } => {
                    self.monitor.record_exit(exit_status);
                    return Ok(());
                }
            }
        }
    }

    /// Opens a `Communicate` stream for `protocol_url` and spawns its read
    /// loop, dispatching incoming frames to `handler`. The returned
    /// [`StreamWriter`] is the queue both `handler` and the caller enqueue
    /// outgoing frames on — identical in semantics to the server's own.
    pub async fn open_plug(&self, protocol_url: &str, handler: Arc<dyn PlugHandler>) -> Result<Arc<StreamWriter>, ChordError> {
        let mut stream = self.dial().await?;
        write_typed(&mut stream, &RemotingRequest::Communicate(CommunicateOpen { protocol_url: protocol_url.to_string() }), RPC_TIMEOUT)
            .await
            .map_err(|e| ChordError::agent_error(format!("communicate open failed: {e}")))?;
        let ack: RemotingOpenResult = read_typed(&mut stream, RPC_TIMEOUT)
            .await
            .map_err(|e| ChordError::agent_error(format!("communicate ack failed: {e}")))?;
        if let RemotingOpenResult::Err { message, .. } = ack {
            return Err(ChordError::agent_error(format!("machine refused plug {protocol_url}: {message}")));
        }

        let (mut read_half, write_half) = tokio::io::split(stream);
        let writer = StreamWriter::new();
        tokio::spawn(Arc::clone(&writer).run(write_half));

        let writer_for_reader = Arc::clone(&writer);
        let protocol_for_log = protocol_url.to_string();
        tokio::spawn(async move {
            loop {
                match read_typed::<Message, _>(&mut read_half, IDLE_READ_TIMEOUT).await {
                    Ok(message) => handler.handle(message.data, &writer_for_reader),
                    Err(_) => break,
                }
            }
            tracing::debug!(protocol_url = %protocol_for_log, "plug stream closed");
        });

        Ok(writer)
    }

    /// Blocks until the machine reaches a terminal state, returning its
    /// exit status.
    pub async fn run_until_finished(&self) -> i64 {
        self.monitor.wait_for_exit().await
    }
}
