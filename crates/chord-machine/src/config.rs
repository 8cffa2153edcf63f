//! CLI surface for the machine binary and the configuration it resolves
//! into.

use chord_core::{ChordError, TransportLocation};
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "chord-machine", about = "Chord machine process")]
pub struct Cli {
    /// This machine's own URL, as returned by the agent's `CreateMachine`.
    #[arg(long)]
    pub machine_url: String,

    /// Main package specifier the interpreter is asked to run.
    #[arg(long)]
    pub main_location: String,

    /// Full URL of the agent's supervisor endpoint.
    #[arg(long)]
    pub supervisor_endpoint: String,

    /// SNI/CN override used when dialing the supervisor endpoint.
    #[arg(long)]
    pub supervisor_server_name: String,

    /// SNI/CN this machine's own binder presents.
    #[arg(long)]
    pub machine_server_name: String,

    #[arg(long, default_value = ".")]
    pub run_directory: PathBuf,

    /// One protocol URL per port the interpreter expects to have attached
    /// before it is allowed to run. May be repeated.
    #[arg(long = "expected-port")]
    pub expected_ports: Vec<String>,

    #[arg(long)]
    pub start_suspended: bool,

    #[arg(long)]
    pub ca_bundle: PathBuf,

    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

pub struct MachineConfig {
    pub machine_url: String,
    pub main_location: String,
    pub supervisor_endpoint: TransportLocation,
    pub supervisor_server_name: String,
    pub machine_server_name: String,
    pub run_directory: PathBuf,
    pub expected_ports: Vec<String>,
    pub start_suspended: bool,
    pub ca_bundle_pem: String,
    pub log_file: Option<PathBuf>,
}

impl MachineConfig {
    pub fn from_cli(cli: Cli) -> Result<Self, ChordError> {
        let supervisor_endpoint = TransportLocation::from_url(&cli.supervisor_endpoint)?;
        let ca_bundle_pem = std::fs::read_to_string(&cli.ca_bundle).map_err(|e| {
            ChordError::invalid_configuration(format!(
                "cannot read ca bundle {}: {e}",
                cli.ca_bundle.display()
            ))
        })?;
        let mut seen = std::collections::HashSet::new();
        for port in &cli.expected_ports {
            if !seen.insert(port.clone()) {
                return Err(ChordError::invalid_configuration(format!(
                    "duplicate expected port: {port}"
                )));
            }
        }

        Ok(Self {
            machine_url: cli.machine_url,
            main_location: cli.main_location,
            supervisor_endpoint,
            supervisor_server_name: cli.supervisor_server_name,
            machine_server_name: cli.machine_server_name,
            run_directory: cli.run_directory,
            expected_ports: cli.expected_ports,
            start_suspended: cli.start_suspended,
            ca_bundle_pem,
            log_file: cli.log_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli(ca_bundle: PathBuf) -> Cli {
        Cli {
            machine_url: "chord://agent.chord/m1".into(),
            main_location: "pkg://example".into(),
            supervisor_endpoint: "unix:///tmp/agent.sock".into(),
            supervisor_server_name: "agent.chord".into(),
            machine_server_name: "m1.chord".into(),
            run_directory: PathBuf::from("/tmp"),
            expected_ports: vec![],
            start_suspended: false,
            ca_bundle,
            log_file: None,
        }
    }

    #[test]
    fn rejects_duplicate_expected_ports() {
        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("ca.crt");
        std::fs::write(&ca_path, "not a real cert, just bytes").unwrap();
        let mut cli = base_cli(ca_path);
        cli.expected_ports = vec!["chord://plug".into(), "chord://plug".into()];
        let err = MachineConfig::from_cli(cli).unwrap_err();
        assert!(matches!(err, ChordError::InvalidConfiguration(_)));
    }

    #[test]
    fn rejects_unreadable_ca_bundle() {
        let cli = base_cli(PathBuf::from("/nonexistent/ca.crt"));
        let err = MachineConfig::from_cli(cli).unwrap_err();
        assert!(matches!(err, ChordError::InvalidConfiguration(_)));
    }

    #[test]
    fn resolves_full_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let ca_path = dir.path().join("ca.crt");
        std::fs::write(&ca_path, "-----BEGIN CERTIFICATE-----\n-----END CERTIFICATE-----\n").unwrap();
        let config = MachineConfig::from_cli(base_cli(ca_path)).unwrap();
        assert_eq!(config.machine_server_name, "m1.chord");
        assert!(!config.start_suspended);
    }
}
