// SPDX-License-Identifier: MIT

//! Entry point for the per-session agent. Parses CLI configuration, binds
//! its control channel, and serves lifecycle RPCs until told to shut down.

use chord_agent::config::{AgentConfig, Cli, PartialOrFullEndpoint};
use chord_agent::listener::{BoundListener, Listener};
use chord_agent::service::{AgentService, MachineSpawnContext};
use chord_agent::session::SessionDirectory;
use chord_agent::supervisor::{MachineSupervisor, SupervisorConfig};
use chord_core::{ChordError, SystemClock, TransportKind, TransportLocation};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::{TcpListener, UnixListener};
use tracing_appender::non_blocking::WorkerGuard;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = match AgentConfig::from_cli(cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("chordd: {e}");
            return ExitCode::FAILURE;
        }
    };

    if config.background {
        if let Err(e) = daemonize(&config) {
            eprintln!("chordd: failed to background: {e}");
            return ExitCode::FAILURE;
        }
    }

    let _log_guard = init_logging(&config);

    if let Some(path) = &config.pid_file {
        if let Err(e) = std::fs::write(path, std::process::id().to_string()) {
            tracing::error!("failed to write pid file {}: {e}", path.display());
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("chordd: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("chordd exiting: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Re-exec detached from the controlling terminal (`--background`):
/// this workspace forbids `unsafe`, so backgrounding is done by spawning a
/// fresh copy of this binary with its stdio sent to `/dev/null` and the
/// original process exiting, rather than raw `fork()`.
fn daemonize(config: &AgentConfig) -> Result<(), ChordError> {
    if std::env::var_os(BACKGROUNDED_MARKER).is_some() {
        return Ok(());
    }

    let exe = std::env::current_exe()
        .map_err(|e| ChordError::posix_error(format!("cannot resolve own executable: {e}")))?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    let devnull = std::process::Stdio::null;
    std::process::Command::new(exe)
        .args(&args)
        .env(BACKGROUNDED_MARKER, "1")
        .current_dir(&config.run_directory)
        .stdin(devnull())
        .stdout(devnull())
        .stderr(devnull())
        .spawn()
        .map_err(|e| ChordError::posix_error(format!("spawn background process failed: {e}")))?;

    std::process::exit(0)
}

const BACKGROUNDED_MARKER: &str = "CHORDD_BACKGROUNDED";

fn init_logging(config: &AgentConfig) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new().create(true).append(true).open(path).ok()?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            tracing_subscriber::fmt().with_env_filter(filter).with_writer(writer).with_ansi(false).init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
            None
        }
    }
}

async fn run(config: AgentConfig) -> Result<(), ChordError> {
    let session_id = uuid::Uuid::new_v4().to_string();
    let session = SessionDirectory::create(
        &config.run_directory,
        &config.session_name,
        &session_id,
        &config.ca_bundle_pem,
        &config.certificate_pem,
        &config.private_key_pem,
    )?;

    // Optional client auth: the isolate always presents a cert (it holds the
    // CA), but a freshly-spawned machine dials in before it has been issued
    // one of its own.
    let tls_config = chord_tls::server_config_optional_client_auth(
        &config.ca_bundle_pem,
        &config.certificate_pem,
        &config.private_key_pem,
    )?;

    let server_name = chord_tls::common_name_of(&config.certificate_pem)?;

    let location = match config.listen {
        PartialOrFullEndpoint::Full(location) => location,
        PartialOrFullEndpoint::TransportOnly(TransportKind::Unix) => {
            TransportLocation::for_unix(server_name.clone(), session.cap_socket_dir().join("cap.sock"))?
        }
        PartialOrFullEndpoint::TransportOnly(TransportKind::Tcp4) => {
            TransportLocation::for_tcp4(server_name.clone(), "127.0.0.1", None)?
        }
    };

    let bound = bind(&location).await?;
    let location = match &bound {
        BoundListener::Tcp4 { listener } => {
            let local_addr = listener
                .local_addr()
                .map_err(|e| ChordError::posix_error(format!("cannot resolve bound tcp4 address: {e}")))?;
            TransportLocation::for_tcp4(location.server_name(), location.tcp4_address().unwrap_or("127.0.0.1"), Some(local_addr.port()))?
        }
        BoundListener::Unix { .. } => location,
    };
    session.write_endpoint(&location.to_url())?;
    if let Some(path) = &config.endpoint_file {
        std::fs::write(path, location.to_url())
            .map_err(|e| ChordError::posix_error(format!("write endpoint file failed: {e}")))?;
    }

    let supervisor = MachineSupervisor::new(SupervisorConfig {
        registration_timeout: config.registration_timeout,
        idle_timeout: config.idle_timeout,
        run_directory: config.run_directory.clone(),
    });
    let shutdown = supervisor.shutdown_signal();

    let spawn_context = MachineSpawnContext {
        machine_executable: machine_executable_path()?,
        supervisor_endpoint: location.to_url(),
        supervisor_server_name: server_name.clone(),
        ca_bundle_file: session.root().join("rootca.crt"),
        run_directory: session.root().to_path_buf(),
        log_directory: session.root().to_path_buf(),
    };
    let service = Arc::new(AgentService::new(
        supervisor.clone(),
        server_name,
        config.session_name.clone(),
        SystemClock,
        spawn_context,
    ));

    let listener = Listener::new(bound, None, tls_config, service);
    tokio::spawn(listener.run());

    tracing::info!(session = %session.root().display(), endpoint = %location.to_url(), "chordd ready");

    tokio::select! {
        _ = shutdown.notified() => {
            tracing::info!("idle timeout reached, shutting down");
        }
        _ = wait_for_termination() => {
            tracing::info!("termination signal received, shutting down");
        }
    }
    supervisor.shutdown();
    Ok(())
}

/// Resolves the machine binary as a sibling of this executable rather than
/// a CLI flag: the two binaries are always built and deployed together.
fn machine_executable_path() -> Result<std::path::PathBuf, ChordError> {
    let exe = std::env::current_exe()
        .map_err(|e| ChordError::posix_error(format!("cannot resolve own executable: {e}")))?;
    let dir = exe
        .parent()
        .ok_or_else(|| ChordError::posix_error("own executable has no parent directory".to_string()))?;
    Ok(dir.join("chord-machine"))
}

async fn bind(location: &TransportLocation) -> Result<BoundListener, ChordError> {
    match location.kind() {
        TransportKind::Unix => {
            let path = location
                .unix_path()
                .ok_or_else(|| ChordError::internal_violation("unix transport location carries no path"))?;
            let _ = std::fs::remove_file(path);
            let listener = UnixListener::bind(path)
                .map_err(|e| ChordError::posix_error(format!("bind unix socket failed: {e}")))?;
            Ok(BoundListener::Unix { listener, path: path.to_path_buf() })
        }
        TransportKind::Tcp4 => {
            let address = location.tcp4_address().unwrap_or("127.0.0.1");
            let port = location.tcp4_port().unwrap_or(0);
            let listener = TcpListener::bind((address, port))
                .await
                .map_err(|e| ChordError::posix_error(format!("bind tcp socket failed: {e}")))?;
            Ok(BoundListener::Tcp4 { listener })
        }
    }
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => chord_core::fatal("install SIGTERM handler", e),
    };
    let mut int = match signal(SignalKind::interrupt()) {
        Ok(int) => int,
        Err(e) => chord_core::fatal("install SIGINT handler", e),
    };
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
