//! `GrpcBinder` + `RemotingService`: the machine's own TLS server, hosting
//! `Communicate`/`Control`/`Monitor` per the dispatch envelope read as the
//! first frame of every connection. Grounded on the agent's own dual
//! accept-loop listener, narrowed to a single Unix-socket transport since
//! nothing outside this process needs to dial a machine's binder over TCP.

use crate::runner::LocalMachine;
use chord_core::{ChordError, TransportLocation};
use chord_wire::{
    encode, read_typed, write_typed, CommunicateOpen, ControlRequest, ControlResponse, FrameVersion,
    Message, ProtocolError, RemotingErrorKind, RemotingOpenResult, RemotingRequest,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::UnixListener;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(3600);

/// Reacts to one attached protocol stream's frames. The workspace has no
/// real bytecode interpreter behind a port, so the only handler it ships is
/// [`EchoPortHandler`]; the trait is the seam a real interpreter would hang
/// off of.
pub trait PortHandler: Send + Sync {
    fn handle(&self, data: Vec<u8>, writer: &StreamWriter);
}

pub struct EchoPortHandler;

impl PortHandler for EchoPortHandler {
    fn handle(&self, data: Vec<u8>, writer: &StreamWriter) {
        let frame = Message { version: FrameVersion::Version1, data };
        if let Ok(bytes) = encode(&frame) {
            writer.enqueue(bytes);
        }
    }
}

struct HandlerEntry {
    handler: Arc<dyn PortHandler>,
    required_at_launch: bool,
    attached: bool,
}

struct ServiceState {
    handlers: HashMap<String, HandlerEntry>,
    remaining_required: usize,
    init_signaled: bool,
    terminating: bool,
}

/// Handler table, attached-set, and required-at-launch countdown, all
/// behind one mutex — attaching a handler and signaling init-complete must
/// be an atomic transaction.
pub struct RemotingService {
    state: Mutex<ServiceState>,
    machine: Arc<LocalMachine>,
}

impl RemotingService {
    pub fn new(machine: Arc<LocalMachine>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServiceState {
                handlers: HashMap::new(),
                remaining_required: 0,
                init_signaled: false,
                terminating: false,
            }),
            machine,
        })
    }

    pub fn register_handler(&self, protocol_url: String, required_at_launch: bool, handler: Arc<dyn PortHandler>) {
        let mut state = self.state.lock();
        if required_at_launch {
            state.remaining_required += 1;
        }
        state.handlers.insert(protocol_url, HandlerEntry { handler, required_at_launch, attached: false });
    }

    /// Attempts to attach `protocol_url`. On success, returns the handler
    /// to dispatch frames to; signals init-complete within the same lock
    /// acquisition if this was the last required-at-launch plug.
    fn attach(&self, protocol_url: &str) -> Result<Arc<dyn PortHandler>, RemotingErrorKind> {
        let mut state = self.state.lock();
        let entry = state.handlers.get_mut(protocol_url).ok_or(RemotingErrorKind::InvalidArgument)?;
        if entry.attached {
            return Err(RemotingErrorKind::InvalidArgument);
        }
        entry.attached = true;
        let required = entry.required_at_launch;
        let handler = Arc::clone(&entry.handler);
        if required {
            state.remaining_required -= 1;
        }
        let signal_init = required && state.remaining_required == 0 && !state.init_signaled;
        if signal_init {
            state.init_signaled = true;
        }
        drop(state);
        if signal_init {
            self.machine.notify_init_complete();
        }
        Ok(handler)
    }

    fn detach(&self, protocol_url: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.handlers.get_mut(protocol_url) {
            entry.attached = false;
        }
    }

    async fn handle_communicate(
        self: &Arc<Self>,
        open: CommunicateOpen,
        mut read_half: ReadHalf<TlsStream<tokio::net::UnixStream>>,
        write_half: WriteHalf<TlsStream<tokio::net::UnixStream>>,
    ) -> Result<(), ProtocolError> {
        let attach_result = self.attach(&open.protocol_url);
        let (handler, write_half) = match attach_result {
            Ok(handler) => {
                let mut write_half = write_half;
                write_typed(&mut write_half, &RemotingOpenResult::Ok, RPC_TIMEOUT).await?;
                (handler, write_half)
            }
            Err(kind) => {
                let mut write_half = write_half;
                let message = format!("cannot attach {}", open.protocol_url);
                write_typed(&mut write_half, &RemotingOpenResult::Err { kind, message }, RPC_TIMEOUT).await?;
                return Ok(());
            }
        };

        let writer = StreamWriter::new();
        let writer_task = tokio::spawn(Arc::clone(&writer).run(write_half));

        loop {
            match read_typed::<Message, _>(&mut read_half, IDLE_READ_TIMEOUT).await {
                Ok(message) => handler.handle(message.data, &writer),
                Err(_) => break,
            }
        }

        writer_task.abort();
        self.detach(&open.protocol_url);
        Ok(())
    }

    async fn handle_control<W: AsyncWrite + Unpin>(&self, control: ControlRequest, mut write_half: W) -> Result<(), ProtocolError> {
        match control {
            ControlRequest::Suspend => self.machine.suspend(),
            ControlRequest::Resume => self.machine.resume(),
            ControlRequest::Terminate => {
                let already_terminating = {
                    let mut state = self.state.lock();
                    std::mem::replace(&mut state.terminating, true)
                };
                if already_terminating {
                    let response = ControlResponse::Err { message: "machine is already terminating".to_string() };
                    return write_typed(&mut write_half, &response, RPC_TIMEOUT).await;
                }
                self.machine.terminate();
            }
        }
        write_typed(&mut write_half, &ControlResponse::Ok, RPC_TIMEOUT).await
    }

    async fn handle_monitor<W: AsyncWrite + Unpin>(&self, mut write_half: W) -> Result<(), ProtocolError> {
        use chord_wire::MonitorEvent;
        use tokio::sync::broadcast::error::RecvError;

        let mut receiver = self.machine.monitor().subscribe();
        let current = self.machine.monitor().current_state();
        write_typed(&mut write_half, &MonitorEvent::StateChanged { curr_state: current }, RPC_TIMEOUT).await?;

        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let terminal = matches!(event, MonitorEvent::MachineExit { .. });
                    write_typed(&mut write_half, &event, RPC_TIMEOUT).await?;
                    if terminal {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
        Ok(())
    }
}

/// A queue of already-framed outgoing messages plus a dedicated writer task
/// draining it one at a time: the single in-flight head that keeps a
/// stream's frames in send order regardless of which task enqueues them.
///
/// Shared with the isolate side of a `Communicate` stream, which holds "a
/// write queue identical in semantics to the server's".
#[derive(Debug)]
pub struct StreamWriter {
    queue: Mutex<VecDeque<Vec<u8>>>,
    notify: tokio::sync::Notify,
}

impl StreamWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { queue: Mutex::new(VecDeque::new()), notify: tokio::sync::Notify::new() })
    }

    pub fn enqueue(&self, frame: Vec<u8>) {
        self.queue.lock().push_back(frame);
        self.notify.notify_one();
    }

    pub async fn run<W: AsyncWrite + Unpin>(self: Arc<Self>, mut writer: W) {
        loop {
            let frame = loop {
                if let Some(frame) = self.queue.lock().pop_front() {
                    break frame;
                }
                self.notify.notified().await;
            };
            if chord_wire::write_message(&mut writer, &frame, RPC_TIMEOUT).await.is_err() {
                break;
            }
        }
    }
}

/// The machine's own TLS server: a Unix socket under the run directory,
/// requiring mutual TLS against the session's root CA. By the time
/// anything connects here both sides already hold signed identities, so
/// this keeps the original mutual-auth policy rather than the agent's
/// relaxed supervisor-endpoint one.
pub struct GrpcBinder {
    endpoint_url: String,
}

impl GrpcBinder {
    /// Computes where this machine's binder will listen, before anything
    /// has been signed: a Unix socket named `machine.sock` under
    /// `run_directory`, presenting `server_name` as its TLS identity.
    pub fn default_location(run_directory: &Path, server_name: &str) -> Result<TransportLocation, ChordError> {
        TransportLocation::for_unix(server_name, run_directory.join("machine.sock"))
    }

    pub async fn bind(
        location: &TransportLocation,
        ca_bundle_pem: &str,
        cert_pem: &str,
        key_pem: &str,
        service: Arc<RemotingService>,
    ) -> Result<(Self, impl std::future::Future<Output = ()>), ChordError> {
        let path = location
            .unix_path()
            .ok_or_else(|| ChordError::invalid_configuration("binder location must be a unix socket"))?;
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)
            .map_err(|e| ChordError::machine_error(format!("bind binder socket failed: {e}")))?;

        let tls_config = chord_tls::server_config(ca_bundle_pem, cert_pem, key_pem)?;
        let acceptor = TlsAcceptor::from(tls_config);
        let endpoint_url = location.to_url();

        Ok((Self { endpoint_url }, run_accept_loop(listener, acceptor, service)))
    }

    pub fn endpoint_url(&self) -> &str {
        &self.endpoint_url
    }
}

async fn run_accept_loop(listener: UnixListener, acceptor: TlsAcceptor, service: Arc<RemotingService>) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("binder accept error: {e}");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => return warn!("binder tls handshake failed: {e}"),
            };
            if let Err(e) = handle_stream(tls_stream, service).await {
                debug!("binder stream closed: {e}");
            }
        });
    }
}

async fn handle_stream(stream: TlsStream<tokio::net::UnixStream>, service: Arc<RemotingService>) -> Result<(), ProtocolError> {
    let (mut read_half, write_half) = tokio::io::split(stream);
    let request: RemotingRequest = read_typed(&mut read_half, RPC_TIMEOUT).await?;
    match request {
        RemotingRequest::Communicate(open) => service.handle_communicate(open, read_half, write_half).await,
        RemotingRequest::Control(control) => service.handle_control(control, write_half).await,
        RemotingRequest::Monitor => service.handle_monitor(write_half).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::StubInterpreter;

    fn service() -> Arc<RemotingService> {
        let machine = LocalMachine::spawn(StubInterpreter, true);
        RemotingService::new(machine)
    }

    #[test]
    fn attach_unknown_protocol_is_invalid_argument() {
        let service = service();
        let err = service.attach("chord://nope").unwrap_err();
        assert_eq!(err, RemotingErrorKind::InvalidArgument);
    }

    #[test]
    fn attach_twice_is_invalid_argument() {
        let service = service();
        service.register_handler("chord://plug".into(), true, Arc::new(EchoPortHandler));
        assert!(service.attach("chord://plug").is_ok());
        let err = service.attach("chord://plug").unwrap_err();
        assert_eq!(err, RemotingErrorKind::InvalidArgument);
    }

    #[test]
    fn last_required_plug_signals_init_complete() {
        let service = service();
        service.register_handler("chord://a".into(), true, Arc::new(EchoPortHandler));
        service.register_handler("chord://b".into(), true, Arc::new(EchoPortHandler));
        assert!(service.attach("chord://a").is_ok());
        assert!(service.attach("chord://b").is_ok());
        let state = service.state.lock();
        assert!(state.init_signaled);
        assert_eq!(state.remaining_required, 0);
    }

    #[test]
    fn detach_allows_reattaching() {
        let service = service();
        service.register_handler("chord://plug".into(), false, Arc::new(EchoPortHandler));
        assert!(service.attach("chord://plug").is_ok());
        service.detach("chord://plug");
        assert!(service.attach("chord://plug").is_ok());
    }

    #[tokio::test]
    async fn second_terminate_is_rejected_once_first_is_in_flight() {
        let service = service();

        let (mut client_a, server_a) = tokio::io::duplex(4096);
        service.handle_control(ControlRequest::Terminate, server_a).await.unwrap();
        let reply_a: ControlResponse = read_typed(&mut client_a, Duration::from_secs(1)).await.unwrap();
        assert!(matches!(reply_a, ControlResponse::Ok));

        let (mut client_b, server_b) = tokio::io::duplex(4096);
        service.handle_control(ControlRequest::Terminate, server_b).await.unwrap();
        let reply_b: ControlResponse = read_typed(&mut client_b, Duration::from_secs(1)).await.unwrap();
        match reply_b {
            ControlResponse::Err { message } => assert!(message.contains("already terminating")),
            ControlResponse::Ok => panic!("second terminate should have been rejected"),
        }
    }

    #[tokio::test]
    async fn stream_writer_preserves_enqueue_order() {
        let writer = StreamWriter::new();
        let (mut client, server) = tokio::io::duplex(8192);
        let run_handle = tokio::spawn(Arc::clone(&writer).run(server));

        let first = encode(&Message { version: FrameVersion::Version1, data: vec![1] }).unwrap();
        let second = encode(&Message { version: FrameVersion::Version1, data: vec![2] }).unwrap();
        writer.enqueue(first);
        writer.enqueue(second);

        let got_first: Message = read_typed(&mut client, Duration::from_secs(1)).await.unwrap();
        let got_second: Message = read_typed(&mut client, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got_first.data, vec![1]);
        assert_eq!(got_second.data, vec![2]);
        run_handle.abort();
    }
}
