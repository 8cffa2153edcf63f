//! Finds or spawns the agent a [`crate::ChordIsolate`] talks to.
//!
//! `ConnectExisting` and the connect-half of `SpawnIfMissing` read the
//! session directory's `endpoint` file directly; they never reconstruct a
//! signing CA from disk, since the directory only ever carries the CA's
//! public certificate (`rootca.crt`), never its private key. A caller using
//! either mode must supply the `CertificateAuthority` it already holds.

use crate::config::{IsolateConfig, SessionMode};
use chord_agent::SessionDirectory;
use chord_core::{ChordError, TransportKind, TransportLocation};
use chord_tls::{CertificateAuthority, DEFAULT_CERT_LIFETIME};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Outcome of [`establish`]: a session directory to read/poll, the CA the
/// isolate will sign every machine's CSR with, and the resolved endpoint of
/// the agent's supervisor channel.
#[derive(Debug)]
pub struct EstablishedSession {
    pub session: SessionDirectory,
    pub ca: CertificateAuthority,
    pub endpoint: TransportLocation,
}

pub async fn establish(
    config: &IsolateConfig,
    ca: Option<CertificateAuthority>,
) -> Result<EstablishedSession, ChordError> {
    let session = SessionDirectory::open(&config.run_directory, &config.session_name);
    let existing = session.read_endpoint();

    match (config.mode, existing, ca) {
        (SessionMode::ConnectExisting, Some(endpoint_url), Some(ca)) => {
            let endpoint = TransportLocation::from_url(&endpoint_url)?;
            Ok(EstablishedSession { session, ca, endpoint })
        }
        (SessionMode::ConnectExisting, Some(_), None) => Err(ChordError::invalid_configuration(
            "connect_existing requires a certificate_authority: the session directory carries \
             only the CA's public certificate, never its private key",
        )),
        (SessionMode::ConnectExisting, None, _) => Err(ChordError::invalid_configuration(format!(
            "no existing session named {} under {}",
            config.session_name,
            config.run_directory.display()
        ))),
        (SessionMode::SpawnFresh, _, ca) => spawn_fresh(config, &session, ca).await,
        (SessionMode::SpawnIfMissing, Some(endpoint_url), Some(ca)) => {
            let endpoint = TransportLocation::from_url(&endpoint_url)?;
            Ok(EstablishedSession { session, ca, endpoint })
        }
        (SessionMode::SpawnIfMissing, Some(_), None) => Err(ChordError::invalid_configuration(format!(
            "a session named {} already exists; spawn_if_missing requires a certificate_authority \
             to reattach to it",
            config.session_name
        ))),
        (SessionMode::SpawnIfMissing, None, ca) => spawn_fresh(config, &session, ca).await,
    }
}

async fn spawn_fresh(
    config: &IsolateConfig,
    session: &SessionDirectory,
    ca: Option<CertificateAuthority>,
) -> Result<EstablishedSession, ChordError> {
    let ca = match ca {
        Some(ca) => ca,
        None => CertificateAuthority::generate()?,
    };
    let agent_server_name = format!("{}.agent", config.session_name);
    let agent_identity = ca.issue_server_cert(&agent_server_name, DEFAULT_CERT_LIFETIME)?;

    let bootstrap_dir = config.run_directory.join(format!(".{}.bootstrap", config.session_name));
    std::fs::create_dir_all(&bootstrap_dir)
        .map_err(|e| ChordError::posix_error(format!("create bootstrap dir failed: {e}")))?;
    let rootca_path = bootstrap_dir.join("rootca.crt");
    let cert_path = bootstrap_dir.join("agent.crt");
    let key_path = bootstrap_dir.join("agent.key");
    write_private(&rootca_path, ca.cert_pem())?;
    write_private(&cert_path, &agent_identity.cert_pem)?;
    write_private(&key_path, &agent_identity.key_pem)?;

    let agent_executable = resolve_agent_executable(&config.agent_executable)?;

    let mut command = std::process::Command::new(agent_executable);
    command
        .arg("--session-name")
        .arg(&config.session_name)
        .arg("--listen-transport")
        .arg(transport_literal(config.listen_transport))
        .arg("--run-directory")
        .arg(&config.run_directory)
        .arg("--certificate")
        .arg(&cert_path)
        .arg("--private-key")
        .arg(&key_path)
        .arg("--ca-bundle")
        .arg(&rootca_path)
        .arg("--registration-timeout")
        .arg(config.registration_timeout.as_secs().to_string())
        .current_dir(&config.run_directory)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(idle) = config.idle_timeout {
        command.arg("--idle-timeout").arg(idle.as_secs().to_string());
    }
    if config.temporary_session {
        command.arg("--temporary-session");
    }
    if let Some(log_file) = &config.log_file {
        command.arg("--log-file").arg(log_file);
    }

    // Spawned as a background daemon, not a tracked child: it may outlive
    // this isolate (a persistent session), so it is left to be reaped by
    // init rather than waited on here.
    command.spawn().map_err(|e| ChordError::machine_error(format!("spawn agent failed: {e}")))?;

    let endpoint_url = poll_for_endpoint(session, config.spawn_timeout).await?;
    let endpoint = TransportLocation::from_url(&endpoint_url)?;
    Ok(EstablishedSession { session: SessionDirectory::open(&config.run_directory, &config.session_name), ca, endpoint })
}

async fn poll_for_endpoint(session: &SessionDirectory, timeout: Duration) -> Result<String, ChordError> {
    let deadline = Instant::now() + timeout;
    let mut delay = Duration::from_millis(20);
    loop {
        if let Some(endpoint) = session.read_endpoint() {
            return Ok(endpoint);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(ChordError::machine_error("timed out waiting for the agent's endpoint file"));
        }
        tokio::time::sleep(delay.min(deadline - now)).await;
        delay = (delay * 2).min(Duration::from_millis(500));
    }
}

fn resolve_agent_executable(explicit: &Option<PathBuf>) -> Result<PathBuf, ChordError> {
    if let Some(path) = explicit {
        return Ok(path.clone());
    }
    let exe = std::env::current_exe()
        .map_err(|e| ChordError::posix_error(format!("cannot resolve own executable: {e}")))?;
    let dir = exe
        .parent()
        .ok_or_else(|| ChordError::posix_error("own executable has no parent directory".to_string()))?;
    Ok(dir.join("chordd"))
}

fn transport_literal(kind: TransportKind) -> &'static str {
    match kind {
        TransportKind::Unix => "Unix",
        TransportKind::Tcp4 => "Tcp4",
    }
}

fn write_private(path: &Path, contents: &str) -> Result<(), ChordError> {
    std::fs::write(path, contents)
        .map_err(|e| ChordError::posix_error(format!("write {} failed: {e}", path.display())))?;
    set_permissions(path, 0o600)
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<(), ChordError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| ChordError::posix_error(format!("chmod {} failed: {e}", path.display())))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<(), ChordError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_existing_without_a_session_is_invalid_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = IsolateConfig::new("missing");
        config.run_directory = dir.path().to_path_buf();
        config.mode = SessionMode::ConnectExisting;
        let err = establish(&config, None).await.unwrap_err();
        assert!(matches!(err, ChordError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn connect_existing_without_a_ca_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionDirectory::open(dir.path(), "s1");
        session.write_endpoint("unix://s1/tmp/s1/cap.sock").unwrap();
        let mut config = IsolateConfig::new("s1");
        config.run_directory = dir.path().to_path_buf();
        config.mode = SessionMode::ConnectExisting;
        let err = establish(&config, None).await.unwrap_err();
        assert!(matches!(err, ChordError::InvalidConfiguration(_)));
    }

    #[tokio::test]
    async fn connect_existing_with_ca_reads_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionDirectory::open(dir.path(), "s1");
        session.write_endpoint("unix://s1/tmp/s1/cap.sock").unwrap();
        let mut config = IsolateConfig::new("s1");
        config.run_directory = dir.path().to_path_buf();
        config.mode = SessionMode::ConnectExisting;
        let ca = CertificateAuthority::generate().unwrap();
        let established = establish(&config, Some(ca)).await.unwrap();
        assert_eq!(established.endpoint.server_name(), "s1");
    }
}
