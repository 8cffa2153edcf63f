//! CLI surface and the configuration it resolves into.

use chord_core::{ChordError, TransportKind, TransportLocation};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "chordd", version, about = "Chord sandboxed-execution agent")]
pub struct Cli {
    #[arg(long)]
    pub session_name: String,

    #[arg(long)]
    pub listen_endpoint: Option<String>,

    #[arg(long, default_value = "Unix")]
    pub listen_transport: String,

    #[arg(long)]
    pub endpoint_file: Option<PathBuf>,

    #[arg(long, default_value = ".")]
    pub run_directory: PathBuf,

    #[arg(long)]
    pub certificate: PathBuf,

    #[arg(long)]
    pub private_key: PathBuf,

    #[arg(long)]
    pub ca_bundle: PathBuf,

    #[arg(long)]
    pub background: bool,

    #[arg(long)]
    pub temporary_session: bool,

    #[arg(long, default_value_t = 0)]
    pub idle_timeout: u64,

    #[arg(long, default_value_t = 5)]
    pub registration_timeout: u64,

    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[arg(long)]
    pub pid_file: Option<PathBuf>,
}

/// Fully validated runtime configuration, resolved from CLI flags plus the
/// certificate's CN: if `--listen-endpoint` is a full URI, its server-name
/// must equal the CN of the agent certificate.
pub struct AgentConfig {
    pub session_name: String,
    pub listen: PartialOrFullEndpoint,
    pub endpoint_file: Option<PathBuf>,
    pub run_directory: PathBuf,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub ca_bundle_pem: String,
    pub background: bool,
    pub temporary_session: bool,
    pub idle_timeout: Option<Duration>,
    pub registration_timeout: Duration,
    pub log_file: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
}

pub enum PartialOrFullEndpoint {
    Full(TransportLocation),
    TransportOnly(TransportKind),
}

impl AgentConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, ChordError> {
        let listen = match &cli.listen_endpoint {
            Some(uri) => PartialOrFullEndpoint::Full(TransportLocation::from_string(uri)?),
            None => {
                let kind = TransportKind::parse(&cli.listen_transport)?;
                PartialOrFullEndpoint::TransportOnly(kind)
            }
        };

        let certificate_pem = read_required(&cli.certificate)?;
        let private_key_pem = read_required(&cli.private_key)?;
        let ca_bundle_pem = read_required(&cli.ca_bundle)?;

        if let PartialOrFullEndpoint::Full(location) = &listen {
            let cn = chord_tls::common_name_of(&certificate_pem)?;
            if location.server_name() != cn {
                return Err(ChordError::invalid_configuration(format!(
                    "listen-endpoint server-name {} does not match certificate CN {}",
                    location.server_name(),
                    cn
                )));
            }
        }

        Ok(Self {
            session_name: cli.session_name,
            listen,
            endpoint_file: cli.endpoint_file,
            run_directory: cli.run_directory,
            certificate_pem,
            private_key_pem,
            ca_bundle_pem,
            background: cli.background,
            temporary_session: cli.temporary_session,
            idle_timeout: (cli.idle_timeout > 0).then(|| Duration::from_secs(cli.idle_timeout)),
            registration_timeout: Duration::from_secs(cli.registration_timeout),
            log_file: cli.log_file,
            pid_file: cli.pid_file,
        })
    }
}

fn read_required(path: &PathBuf) -> Result<String, ChordError> {
    std::fs::read_to_string(path)
        .map_err(|e| ChordError::invalid_configuration(format!("cannot read {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_transport_only_listen() {
        let cli = Cli::parse_from([
            "chordd",
            "--session-name",
            "s1",
            "--certificate",
            "/dev/null",
            "--private-key",
            "/dev/null",
            "--ca-bundle",
            "/dev/null",
        ]);
        assert_eq!(cli.listen_transport, "Unix");
    }
}
