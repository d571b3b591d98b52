//! Lifecycle tests for the accessory client manager.
//!
//! A shell stub stands in for the real accessory binary: it ignores the
//! serve-mode arguments and echoes stdin to stdout, which is exactly the
//! channel shape the bridge relies on.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use podaccessory::{AccessoryClient, AccessoryError, AccessoryLink, AccessoryState};
use podconfig::AccessoryConfig;
use tempfile::TempDir;

/// Write an executable stub script and return its path.
fn stub_executable(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("ipod-stub");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config_for(dir: &TempDir, body: &str) -> AccessoryConfig {
    AccessoryConfig {
        executable: stub_executable(dir, body),
        device_node: PathBuf::from("/dev/null"),
        trace_path: dir.path().join("trace.log"),
        kernel_modules: Vec::new(),
        node_wait_retries: 2,
        node_wait_delay_seconds: 0,
        stop_grace_seconds: 2,
    }
}

#[tokio::test]
async fn lines_round_trip_through_the_client() {
    let dir = TempDir::new().unwrap();
    let client = AccessoryClient::new(config_for(&dir, "exec cat"));

    client.start().await.unwrap();
    assert!(client.is_running());
    assert_eq!(client.state(), AccessoryState::Running);

    client
        .write_lines(&["TITLE=Song A".to_string(), "DURATION=180000".to_string()])
        .await
        .unwrap();

    assert_eq!(client.read_line().await.as_deref(), Some("TITLE=Song A"));
    assert_eq!(client.read_line().await.as_deref(), Some("DURATION=180000"));

    client.stop().await;
    assert_eq!(client.state(), AccessoryState::Stopped);
    assert!(!client.is_running());
}

#[tokio::test]
async fn start_when_running_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let client = AccessoryClient::new(config_for(&dir, "exec cat"));

    client.start().await.unwrap();
    client.start().await.unwrap();
    assert_eq!(client.state(), AccessoryState::Running);

    client.stop().await;
}

#[tokio::test]
async fn stop_before_start_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let client = AccessoryClient::new(config_for(&dir, "exec cat"));

    client.stop().await;
    assert_eq!(client.state(), AccessoryState::Stopped);
}

#[tokio::test]
async fn stop_after_self_exit_still_reaches_stopped() {
    let dir = TempDir::new().unwrap();
    let client = AccessoryClient::new(config_for(&dir, "exit 0"));

    client.start().await.unwrap();
    // The stub exits immediately, so the output stream ends.
    assert_eq!(client.read_line().await, None);

    client.stop().await;
    assert_eq!(client.state(), AccessoryState::Stopped);
}

#[tokio::test]
async fn write_without_a_process_reports_not_running() {
    let dir = TempDir::new().unwrap();
    let client = AccessoryClient::new(config_for(&dir, "exec cat"));

    let err = client
        .write_lines(&["TITLE=x".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, AccessoryError::NotRunning));
}

#[tokio::test]
async fn missing_device_node_fails_start() {
    let dir = TempDir::new().unwrap();
    let mut config = config_for(&dir, "exec cat");
    config.device_node = PathBuf::from("/nonexistent/iap-node");

    let client = AccessoryClient::new(config);
    let err = client.start().await.unwrap_err();
    assert!(matches!(err, AccessoryError::DeviceNotReady(_)));
    assert_eq!(client.state(), AccessoryState::Failed);
}

#[tokio::test]
async fn missing_executable_fails_start() {
    let dir = TempDir::new().unwrap();
    let mut config = config_for(&dir, "exec cat");
    config.executable = PathBuf::from("/nonexistent/ipod");

    let client = AccessoryClient::new(config);
    let err = client.start().await.unwrap_err();
    assert!(matches!(err, AccessoryError::ExecutableNotFound(_)));
}

#[tokio::test]
async fn start_after_a_broken_channel_respawns_the_client() {
    let dir = TempDir::new().unwrap();
    // First run: the stub closes its stdin and lingers, so the process
    // stays alive while the input channel dies. Once the marker file
    // exists it behaves like a well-mannered client again.
    let marker = dir.path().join("healthy");
    let body = format!(
        "if [ -f {} ]; then exec cat; fi\nexec 0<&-\nexec sleep 60",
        marker.display()
    );
    let client = AccessoryClient::new(config_for(&dir, &body));

    client.start().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    let err = client
        .write_lines(&["TITLE=x".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, AccessoryError::BrokenChannel(_)));
    assert_eq!(client.state(), AccessoryState::Failed);

    // The old process is still alive; a restart must replace it rather
    // than report it as already running.
    fs::write(&marker, "").unwrap();
    client.start().await.unwrap();
    assert_eq!(client.state(), AccessoryState::Running);

    client.write_lines(&["TITLE=y".to_string()]).await.unwrap();
    assert_eq!(client.read_line().await.as_deref(), Some("TITLE=y"));

    client.stop().await;
}

#[tokio::test]
async fn stop_unblocks_a_pending_read() {
    let dir = TempDir::new().unwrap();
    // The stub never writes, so read_line blocks until stop closes the pipe.
    let client = std::sync::Arc::new(AccessoryClient::new(config_for(&dir, "exec sleep 60")));

    client.start().await.unwrap();

    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read_line().await })
    };

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    client.stop().await;

    let line = tokio::time::timeout(std::time::Duration::from_secs(5), reader)
        .await
        .expect("read_line should unblock after stop")
        .unwrap();
    assert_eq!(line, None);
    assert_eq!(client.state(), AccessoryState::Stopped);
}
