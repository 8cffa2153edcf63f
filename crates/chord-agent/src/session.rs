//! On-disk session directory contract: the meeting-point a client
//! uses to discover or spawn an agent. Created with `0700`, key files with
//! `0600`.

use chord_core::ChordError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct SessionDirectory {
    root: PathBuf,
}

impl SessionDirectory {
    /// Create (or reuse) `<run_directory>/<session_name>/` with `0700`
    /// permissions and write `sid`, `rootca.crt`, `agent.crt`, `agent.key`,
    /// and `pid`. `endpoint` is written later, once the listener is bound.
    pub fn create(
        run_directory: &Path,
        session_name: &str,
        session_id: &str,
        rootca_pem: &str,
        agent_cert_pem: &str,
        agent_key_pem: &str,
    ) -> Result<Self, ChordError> {
        let root = run_directory.join(session_name);
        fs::create_dir_all(&root)
            .map_err(|e| ChordError::posix_error(format!("create session dir failed: {e}")))?;
        set_permissions(&root, 0o700)?;

        write_file(&root.join("sid"), session_id.as_bytes(), 0o600)?;
        write_file(&root.join("rootca.crt"), rootca_pem.as_bytes(), 0o600)?;
        write_file(&root.join("agent.crt"), agent_cert_pem.as_bytes(), 0o600)?;
        write_file(&root.join("agent.key"), agent_key_pem.as_bytes(), 0o600)?;
        write_file(&root.join("pid"), std::process::id().to_string().as_bytes(), 0o600)?;

        Ok(Self { root })
    }

    /// Attach to an existing session directory without recreating it.
    pub fn open(run_directory: &Path, session_name: &str) -> Self {
        Self { root: run_directory.join(session_name) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write the resolved listen endpoint, polled by clients discovering a
    /// spawned agent.
    pub fn write_endpoint(&self, endpoint: &str) -> Result<(), ChordError> {
        write_file(&self.root.join("endpoint"), endpoint.as_bytes(), 0o600)
    }

    /// Read a previously-written endpoint, if the file exists and is
    /// non-empty.
    pub fn read_endpoint(&self) -> Option<String> {
        fs::read_to_string(self.root.join("endpoint")).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.root.join("pid")
    }

    pub fn cap_socket_dir(&self) -> PathBuf {
        self.root.clone()
    }
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), ChordError> {
    let mut file = fs::File::create(path)
        .map_err(|e| ChordError::posix_error(format!("create {} failed: {e}", path.display())))?;
    file.write_all(contents)
        .map_err(|e| ChordError::posix_error(format!("write {} failed: {e}", path.display())))?;
    set_permissions(path, mode)
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<(), ChordError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| ChordError::posix_error(format!("chmod {} failed: {e}", path.display())))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<(), ChordError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_writes_expected_files() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionDirectory::create(dir.path(), "s1", "uuid-1", "ca", "cert", "key").unwrap();
        assert!(session.root().join("sid").exists());
        assert!(session.root().join("rootca.crt").exists());
        assert!(session.root().join("agent.crt").exists());
        assert!(session.root().join("agent.key").exists());
        assert!(session.root().join("pid").exists());

        session.write_endpoint("unix:///tmp/s1/cap.sock").unwrap();
        assert_eq!(session.read_endpoint().as_deref(), Some("unix:///tmp/s1/cap.sock"));
    }

    #[test]
    fn read_endpoint_absent_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionDirectory::open(dir.path(), "s2");
        assert!(session.read_endpoint().is_none());
    }
}
