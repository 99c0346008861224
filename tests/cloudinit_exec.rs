//! Integration tests for cloud-init execution against a real filesystem.
//!
//! These run the bootstrap executor end to end with the real file writer
//! into a temporary directory and a recording command runner, verifying
//! the full decode -> template -> intercept -> write -> run pipeline.

use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use hostpool::agent::cloudinit::{DiskFileWriter, ScriptExecutor};
use hostpool::agent::cmd::CmdRunner;
use hostpool::Result;

/// Command runner that records what would have been executed.
#[derive(Default)]
struct RecordingRunner {
    commands: Mutex<Vec<String>>,
}

#[async_trait]
impl CmdRunner for RecordingRunner {
    async fn run(&self, cmd: &str) -> Result<()> {
        self.commands.lock().unwrap().push(cmd.to_string());
        Ok(())
    }
}

fn executor(runner: Arc<RecordingRunner>, download_path: &str) -> ScriptExecutor {
    ScriptExecutor {
        file_writer: Arc::new(DiskFileWriter),
        cmd_runner: runner,
        hostname: "h1".to_string(),
        labels: [("pool".to_string(), "metal".to_string())].into_iter().collect(),
        taints: Vec::new(),
        download_path: download_path.to_string(),
    }
}

/// The full kubeadm-mode pipeline: a base64-encoded kubeadm config is
/// decoded, gains the injected provider ID and labels, lands on disk with
/// the requested mode, and the join commands run afterwards in order.
#[tokio::test]
async fn kubeadm_document_executes_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("kubeadm/join-config.yaml");
    let config_path_str = config_path.to_string_lossy().into_owned();

    let kubeadm_config = "apiVersion: kubeadm.k8s.io/v1beta3\n\
                          kind: JoinConfiguration\n\
                          nodeRegistration:\n\
                          \x20 name: {{ .Hostname }}\n";
    let doc = format!(
        "write_files:\n\
         - path: {path}\n\
         \x20 encoding: base64\n\
         \x20 permissions: \"0600\"\n\
         \x20 content: {content}\n\
         runCmd:\n\
         - kubeadm join --config {path}\n\
         - touch /tmp/bootstrap-done\n",
        path = config_path_str,
        content = BASE64.encode(kubeadm_config),
    );

    let runner = Arc::new(RecordingRunner::default());
    executor(runner.clone(), "/var/lib/bundles")
        .execute(&doc)
        .await
        .unwrap();

    // The file exists, decoded, templated and intercepted.
    let written = std::fs::read_to_string(&config_path).unwrap();
    assert!(written.contains("name: h1"), "hostname template applied");
    assert!(
        written.contains("provider-id: hostpool://h1"),
        "provider id injected"
    );
    assert!(written.contains("node-labels: pool=metal"), "labels injected");

    // Permissions honored.
    let mode = std::fs::metadata(&config_path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);

    // Commands ran in declared order, after the file write.
    let commands = runner.commands.lock().unwrap();
    assert_eq!(commands.len(), 2);
    assert!(commands[0].starts_with("kubeadm join"));
    assert_eq!(commands[1], "touch /tmp/bootstrap-done");
}

/// Append mode adds to an existing file instead of truncating it.
#[tokio::test]
async fn append_mode_preserves_existing_content() {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("hosts");
    std::fs::write(&target, "127.0.0.1 localhost\n").unwrap();

    let doc = format!(
        "write_files:\n\
         - path: {}\n\
         \x20 append: true\n\
         \x20 content: \"10.0.0.2 cp.internal\\n\"\n",
        target.to_string_lossy()
    );

    let runner = Arc::new(RecordingRunner::default());
    executor(runner, "").execute(&doc).await.unwrap();

    let written = std::fs::read_to_string(&target).unwrap();
    assert!(written.starts_with("127.0.0.1 localhost\n"));
    assert!(written.ends_with("10.0.0.2 cp.internal\n"));
}

/// A document with a corrupt encoding fails before any command runs, so a
/// garbled secret cannot half-bootstrap a node.
#[tokio::test]
async fn corrupt_content_aborts_before_commands() {
    let dir = tempfile::tempdir().unwrap();
    let doc = format!(
        "write_files:\n\
         - path: {}/file\n\
         \x20 encoding: base64\n\
         \x20 content: '!!!not-base64!!!'\n\
         runCmd:\n\
         - kubeadm join\n",
        dir.path().to_string_lossy()
    );

    let runner = Arc::new(RecordingRunner::default());
    let result = executor(runner.clone(), "").execute(&doc).await;

    assert!(result.is_err());
    assert!(runner.commands.lock().unwrap().is_empty());
}
