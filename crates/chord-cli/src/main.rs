// SPDX-License-Identifier: MIT

//! `chord`: a thin binary over `chord-isolate`, for manually exercising a
//! session from a shell. Not part of the embeddable surface — real
//! embedders call `chord_isolate::ChordIsolate` directly.

use chord_core::{ChordError, PortDirection, PortType, TransportKind};
use chord_isolate::{ChordIsolate, IsolateConfig, LaunchRequest, PlugHandler, PlugRequest, SessionMode};
use chord_machine::binder::StreamWriter;
use chord_tls::CertificateAuthority;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "chord", version, about = "Manual smoke-test harness for a chord session")]
struct Cli {
    #[arg(long, default_value = "default")]
    session_name: String,

    #[arg(long, default_value = ".")]
    run_directory: PathBuf,

    #[arg(long, value_enum, default_value = "spawn-if-missing")]
    mode: ModeArg,

    #[arg(long)]
    agent_executable: Option<PathBuf>,

    #[arg(long, default_value = "Unix")]
    listen_transport: String,

    #[arg(long, default_value_t = 10)]
    spawn_timeout: u64,

    /// Reattaches to an already-generated root CA instead of generating one;
    /// required by `--mode connect-existing`. The private key never touches
    /// disk anywhere else in this workspace — reading it back here is this
    /// harness's own concession for manual reattachment testing.
    #[arg(long, requires = "ca_key_file")]
    ca_cert_file: Option<PathBuf>,

    #[arg(long, requires = "ca_cert_file")]
    ca_key_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum ModeArg {
    ConnectExisting,
    SpawnFresh,
    SpawnIfMissing,
}

impl From<ModeArg> for SessionMode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::ConnectExisting => SessionMode::ConnectExisting,
            ModeArg::SpawnFresh => SessionMode::SpawnFresh,
            ModeArg::SpawnIfMissing => SessionMode::SpawnIfMissing,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Calls `IdentifyAgent` and prints the reply.
    Identify,
    /// Launches one machine, attaches any `--plug` ports with a handler
    /// that logs received frames, and blocks until it reaches a terminal
    /// state.
    Run {
        #[arg(long, default_value = "smoke-test")]
        name: String,
        #[arg(long)]
        execution_url: String,
        #[arg(long, default_value = "")]
        config_hash: String,
        #[arg(long)]
        plug: Vec<String>,
        #[arg(long)]
        start_suspended: bool,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("chord: failed to start runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("chord: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, ChordError> {
    let mut config = IsolateConfig::new(cli.session_name);
    config.run_directory = cli.run_directory;
    config.mode = cli.mode.into();
    config.agent_executable = cli.agent_executable;
    config.listen_transport = TransportKind::parse(&cli.listen_transport)?;
    config.spawn_timeout = Duration::from_secs(cli.spawn_timeout);

    let ca = match (cli.ca_cert_file, cli.ca_key_file) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read_to_string(&cert_path)
                .map_err(|e| ChordError::invalid_configuration(format!("cannot read {}: {e}", cert_path.display())))?;
            let key_pem = std::fs::read_to_string(&key_path)
                .map_err(|e| ChordError::invalid_configuration(format!("cannot read {}: {e}", key_path.display())))?;
            Some(CertificateAuthority::load(cert_pem, key_pem))
        }
        _ => None,
    };

    let isolate = ChordIsolate::establish(config, ca).await?;

    match cli.command {
        Command::Identify => {
            let (agent_name, uptime_millis) = isolate.identify_agent().await?;
            println!("agent_name={agent_name} uptime_millis={uptime_millis}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { name, execution_url, config_hash, plug, start_suspended } => {
            let plugs = plug
                .into_iter()
                .map(|protocol_url| PlugRequest {
                    protocol_url,
                    port_type: PortType::Streaming,
                    port_direction: PortDirection::BiDirectional,
                    handler: Arc::new(LoggingPlugHandler) as Arc<dyn PlugHandler>,
                })
                .collect();

            let machine =
                isolate.launch(LaunchRequest { name, execution_url, config_hash, plugs, start_suspended }).await?;
            tracing::info!(machine_url = %machine.machine_url, "launched");

            let exit_status = machine.run_until_finished().await;
            println!("exit_status={exit_status}");
            Ok(if exit_status == 0 { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}

struct LoggingPlugHandler;

impl PlugHandler for LoggingPlugHandler {
    fn handle(&self, data: Vec<u8>, _writer: &StreamWriter) {
        tracing::info!(bytes = data.len(), "plug frame received");
    }
}
