//! End-to-end scenario tests: each drives the real `chordd`/`chord-machine`
//! binaries as subprocesses through `chord_isolate::ChordIsolate`, the way a
//! real embedder would, rather than poking the agent's internal types.

use assert_cmd::Command as AssertCommand;
use chord_core::{MachineState, PortDirection, PortType, TransportKind};
use chord_isolate::{ChordIsolate, IsolateConfig, LaunchRequest, PlugHandler, PlugRequest, SessionMode};
use chord_machine::binder::StreamWriter;
use chord_tls::CertificateAuthority;
use chord_wire::{encode, FrameVersion, Message};
use serial_test::serial;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Binaries land next to this test binary's own executable: `target/<profile>/deps/specs-<hash>`,
/// one level up from the sibling workspace binaries.
fn target_dir() -> PathBuf {
    std::env::current_exe()
        .expect("current test exe is resolvable")
        .parent()
        .expect("test binary has a parent directory")
        .parent()
        .expect("deps directory has a parent")
        .to_path_buf()
}

fn bin_path(name: &str) -> PathBuf {
    target_dir().join(name)
}

fn base_config(run_directory: &std::path::Path, session_name: &str) -> IsolateConfig {
    let mut config = IsolateConfig::new(session_name.to_string());
    config.run_directory = run_directory.to_path_buf();
    config.mode = SessionMode::SpawnFresh;
    config.agent_executable = Some(bin_path("chordd"));
    config.listen_transport = TransportKind::Unix;
    config.spawn_timeout = Duration::from_secs(5);
    config
}

struct RecordingPlugHandler {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl PlugHandler for RecordingPlugHandler {
    fn handle(&self, data: Vec<u8>, _writer: &StreamWriter) {
        let _ = self.tx.send(data);
    }
}

fn send_frame(writer: &StreamWriter, payload: Vec<u8>) {
    let frame = Message { version: FrameVersion::Version1, data: payload };
    writer.enqueue(encode(&frame).expect("message encodes"));
}

/// S1: a zero-port launch runs the full four-RPC handshake end to end and
/// completes on its own, with no explicit resume needed.
#[tokio::test]
#[serial]
async fn happy_path_with_no_ports_completes() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path(), "s1");

    let isolate = ChordIsolate::establish(config, None).await.unwrap();
    let machine = isolate
        .launch(LaunchRequest {
            name: "m1".to_string(),
            execution_url: "chord://unused/main".to_string(),
            config_hash: "{}".to_string(),
            plugs: vec![],
            start_suspended: false,
        })
        .await
        .unwrap();

    let exit_status = machine.run_until_finished().await;
    assert_eq!(exit_status, 0);
    assert_eq!(machine.current_state(), MachineState::Completed);
}

/// S3: two concurrent terminate calls on a suspended machine — exactly one
/// succeeds, the other is rejected as already-terminating, and the machine
/// converges on `Cancelled`.
#[tokio::test]
#[serial]
async fn double_terminate_exactly_one_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path(), "s3");

    let isolate = ChordIsolate::establish(config, None).await.unwrap();
    let machine = isolate
        .launch(LaunchRequest {
            name: "m3".to_string(),
            execution_url: "chord://unused/main".to_string(),
            config_hash: "{}".to_string(),
            plugs: vec![],
            start_suspended: true,
        })
        .await
        .unwrap();

    let (first, second) = tokio::join!(machine.terminate(), machine.terminate());
    let results = [first, second];
    let ok_count = results.iter().filter(|r| r.is_ok()).count();
    let err_count = results.iter().filter(|r| r.is_err()).count();
    assert_eq!(ok_count, 1);
    assert_eq!(err_count, 1);
    let rejected = results.into_iter().find(|r| r.is_err()).unwrap().unwrap_err();
    assert!(rejected.message().contains("already terminating"));

    let exit_status = machine.run_until_finished().await;
    assert_eq!(exit_status, 1);
    assert_eq!(machine.current_state(), MachineState::Cancelled);
}

/// S4: a second `Communicate` open on an already-attached protocol URL is
/// refused, and the first stream keeps carrying traffic afterward.
#[tokio::test]
#[serial]
async fn plug_attached_twice_rejects_the_second_open() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path(), "s4");

    let isolate = ChordIsolate::establish(config, None).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let protocol_url = "chord://s4/plug".to_string();

    let machine = isolate
        .launch(LaunchRequest {
            name: "m4".to_string(),
            execution_url: "chord://unused/main".to_string(),
            config_hash: "{}".to_string(),
            plugs: vec![PlugRequest {
                protocol_url: protocol_url.clone(),
                port_type: PortType::Streaming,
                port_direction: PortDirection::BiDirectional,
                handler: Arc::new(RecordingPlugHandler { tx }),
            }],
            start_suspended: false,
        })
        .await
        .unwrap();

    let (second_tx, _second_rx) = mpsc::unbounded_channel();
    let second = machine.open_plug(&protocol_url, Arc::new(RecordingPlugHandler { tx: second_tx })).await;
    let err = second.unwrap_err();
    assert!(err.message().contains("cannot attach"));

    let writer = machine.plug_writer(&protocol_url).expect("first plug stays attached");
    send_frame(&writer, vec![7, 8, 9]);
    let echoed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert_eq!(echoed, vec![7, 8, 9]);
}

/// S5: an idle, temporary-session agent shuts its event loop down on its own
/// once the idle timeout elapses, with no RPCs ever issued.
#[tokio::test]
#[serial]
async fn idle_agent_shuts_itself_down() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path(), "s5");
    config.idle_timeout = Some(Duration::from_secs(2));
    config.temporary_session = true;

    let isolate = ChordIsolate::establish(config, None).await.unwrap();
    let _ = isolate; // established, but deliberately never RPC'd against

    let pid_path = dir.path().join("s5").join("pid");
    let pid: u32 = std::fs::read_to_string(&pid_path).unwrap().trim().parse().unwrap();

    tokio::time::sleep(Duration::from_millis(3500)).await;

    let status = std::process::Command::new("kill").arg("-0").arg(pid.to_string()).status().unwrap();
    assert!(!status.success(), "agent process {pid} should have exited after its idle timeout");
}

/// S6: a `--listen-endpoint` whose server-name doesn't match the agent
/// certificate's CN is rejected before the agent binds anything.
#[test]
#[serial]
fn cn_mismatch_is_refused_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::generate().unwrap();
    let identity = ca.issue_server_cert("agent-correct.chord", chord_tls::DEFAULT_CERT_LIFETIME).unwrap();

    let rootca_path = dir.path().join("rootca.crt");
    let cert_path = dir.path().join("agent.crt");
    let key_path = dir.path().join("agent.key");
    std::fs::write(&rootca_path, ca.cert_pem()).unwrap();
    std::fs::write(&cert_path, &identity.cert_pem).unwrap();
    std::fs::write(&key_path, &identity.key_pem).unwrap();

    let mismatched_endpoint = format!("unix://agent-wrong.chord{}", dir.path().join("cap.sock").display());

    let assert = AssertCommand::new(bin_path("chordd"))
        .arg("--session-name")
        .arg("s6")
        .arg("--listen-endpoint")
        .arg(&mismatched_endpoint)
        .arg("--run-directory")
        .arg(dir.path())
        .arg("--certificate")
        .arg(&cert_path)
        .arg("--private-key")
        .arg(&key_path)
        .arg("--ca-bundle")
        .arg(&rootca_path)
        .assert()
        .failure();

    let output = assert.get_output();
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not match certificate CN"), "unexpected stderr: {stderr}");
}

#[allow(dead_code)]
fn unused_mutex_import_guard() -> Mutex<()> {
    Mutex::new(())
}
