//! Dual Unix+TCP listener for the agent's control channel. Grounded on the
//! teacher's `daemon::listener::Listener` (accept loop over `tokio::select!`,
//! a connection handler generic over `AsyncRead + AsyncWrite`), rebuilt over
//! a single mutually-authenticated TLS identity instead of plain sockets.

use crate::service::AgentService;
use chord_core::Clock;
use chord_wire::{read_typed, write_typed, AgentRequest};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

pub enum BoundListener {
    Unix { listener: UnixListener, path: PathBuf },
    Tcp4 { listener: TcpListener },
}

/// Accepts connections on one or two sockets and dispatches every framed
/// request on each to [`AgentService::dispatch`].
pub struct Listener<C: Clock> {
    primary: BoundListener,
    secondary: Option<BoundListener>,
    acceptor: TlsAcceptor,
    service: Arc<AgentService<C>>,
}

impl<C: Clock> Listener<C> {
    pub fn new(
        primary: BoundListener,
        secondary: Option<BoundListener>,
        tls_config: Arc<ServerConfig>,
        service: Arc<AgentService<C>>,
    ) -> Self {
        Self { primary, secondary, acceptor: TlsAcceptor::from(tls_config), service }
    }

    pub async fn run(self) {
        let Self { primary, secondary, acceptor, service } = self;
        let inner = Accepting { acceptor, service };
        match secondary {
            Some(secondary) => inner.run_dual(primary, secondary).await,
            None => inner.run_single(primary).await,
        }
    }
}

struct Accepting<C: Clock> {
    acceptor: TlsAcceptor,
    service: Arc<AgentService<C>>,
}

impl<C: Clock> Accepting<C> {
    async fn run_single(&self, bound: BoundListener) {
        loop {
            match accept_one(&bound).await {
                Ok(stream) => self.spawn_connection(stream),
                Err(e) => error!("accept error: {e}"),
            }
        }
    }

    async fn run_dual(&self, primary: BoundListener, secondary: BoundListener) {
        loop {
            tokio::select! {
                result = accept_one(&primary) => {
                    match result {
                        Ok(stream) => self.spawn_connection(stream),
                        Err(e) => error!("accept error: {e}"),
                    }
                }
                result = accept_one(&secondary) => {
                    match result {
                        Ok(stream) => self.spawn_connection(stream),
                        Err(e) => error!("accept error: {e}"),
                    }
                }
            }
        }
    }

    fn spawn_connection(&self, stream: AcceptedStream) {
        let acceptor = self.acceptor.clone();
        let service = Arc::clone(&self.service);
        tokio::spawn(async move {
            let tls_stream = match stream {
                AcceptedStream::Unix(s) => match acceptor.accept(s).await {
                    Ok(s) => EitherTls::Unix(s),
                    Err(e) => return warn!("tls handshake failed: {e}"),
                },
                AcceptedStream::Tcp(s) => match acceptor.accept(s).await {
                    Ok(s) => EitherTls::Tcp(s),
                    Err(e) => return warn!("tls handshake failed: {e}"),
                },
            };
            if let Err(e) = handle_connection(tls_stream, &service).await {
                debug!("connection closed: {e}");
            }
        });
    }
}

enum AcceptedStream {
    Unix(tokio::net::UnixStream),
    Tcp(tokio::net::TcpStream),
}

enum EitherTls {
    Unix(tokio_rustls::server::TlsStream<tokio::net::UnixStream>),
    Tcp(tokio_rustls::server::TlsStream<tokio::net::TcpStream>),
}

async fn accept_one(bound: &BoundListener) -> std::io::Result<AcceptedStream> {
    match bound {
        BoundListener::Unix { listener, .. } => {
            let (stream, _) = listener.accept().await?;
            Ok(AcceptedStream::Unix(stream))
        }
        BoundListener::Tcp4 { listener } => {
            let (stream, addr) = listener.accept().await?;
            debug!("tcp connection from {addr}");
            Ok(AcceptedStream::Tcp(stream))
        }
    }
}

async fn handle_connection<C: Clock>(
    mut stream: EitherTls,
    service: &AgentService<C>,
) -> Result<(), chord_wire::ProtocolError> {
    loop {
        let request: AgentRequest = match &mut stream {
            EitherTls::Unix(s) => read_typed(s, RPC_TIMEOUT).await,
            EitherTls::Tcp(s) => read_typed(s, RPC_TIMEOUT).await,
        }?;
        let response = service.dispatch(request).await;
        match &mut stream {
            EitherTls::Unix(s) => write_typed(s, &response, RPC_TIMEOUT).await,
            EitherTls::Tcp(s) => write_typed(s, &response, RPC_TIMEOUT).await,
        }?;
    }
}
