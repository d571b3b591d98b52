//! # PodAccessory
//!
//! Lifecycle of the external accessory-emulation client: readiness-gated
//! start (kernel modules, device node), three piped byte streams, and a
//! graceful-then-forced stop. Metadata flows in over the client's stdin as
//! newline-terminated `KEY=VALUE` lines; transport commands flow out of its
//! stdout one bare token per line; stderr is drained into the log.
//!
//! The stdin writer and the stdout reader live behind independent locks so
//! a pending blocking read never delays a metadata write. Structural
//! operations (start/stop) serialize on the process handle itself.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use podconfig::AccessoryConfig;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum AccessoryError {
    #[error("accessory executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("failed to spawn accessory client: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("device node {0} did not appear")]
    DeviceNotReady(String),
    #[error("kernel module setup failed: {0}")]
    ModuleLoad(String),
    #[error("accessory client is not running")]
    NotRunning,
    #[error("accessory channel broken: {0}")]
    BrokenChannel(#[source] std::io::Error),
}

/// Observable lifecycle of the accessory client process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessoryState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// Line-framed channel surface the coordinator talks to.
#[async_trait]
pub trait AccessoryLink: Send + Sync {
    /// Write one burst of lines, newline-terminated, flushed once.
    /// The burst is all-or-nothing: a failed write kills the channel.
    async fn write_lines(&self, lines: &[String]) -> Result<(), AccessoryError>;

    /// Next line from the client's stdout; `None` on end-of-stream, which
    /// means the process has exited and the caller must stop consuming.
    async fn read_line(&self) -> Option<String>;

    fn is_running(&self) -> bool;
}

/// Owns the accessory client process and its three streams.
pub struct AccessoryClient {
    config: AccessoryConfig,
    proc: tokio::sync::Mutex<Option<Child>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    stdout: tokio::sync::Mutex<Option<Lines<BufReader<ChildStdout>>>>,
    state: std::sync::Mutex<AccessoryState>,
}

impl AccessoryClient {
    pub fn new(config: AccessoryConfig) -> Self {
        Self {
            config,
            proc: tokio::sync::Mutex::new(None),
            stdin: tokio::sync::Mutex::new(None),
            stdout: tokio::sync::Mutex::new(None),
            state: std::sync::Mutex::new(AccessoryState::NotStarted),
        }
    }

    pub fn state(&self) -> AccessoryState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: AccessoryState) {
        *self.state.lock().unwrap() = state;
    }

    /// Start the accessory client.
    ///
    /// No-op when already running. Otherwise loads the prerequisite kernel
    /// modules, waits for the device node, and spawns the client with all
    /// three stdio streams piped.
    pub async fn start(&self) -> Result<(), AccessoryError> {
        let mut proc = self.proc.lock().await;

        if let Some(mut child) = proc.take() {
            let alive = child.try_wait().map(|status| status.is_none()).unwrap_or(false);
            if alive {
                if self.state() != AccessoryState::Failed {
                    debug!("Accessory client already running");
                    *proc = Some(child);
                    return Ok(());
                }
                // The process outlived a broken channel; it cannot be
                // reattached, so replace it.
                warn!(pid = child.id(), "Discarding accessory client with broken channel");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        self.set_state(AccessoryState::Starting);

        if let Err(err) = self.prepare_device().await {
            self.set_state(AccessoryState::Failed);
            return Err(err);
        }

        let executable = &self.config.executable;
        info!(executable = %executable.display(), "Starting accessory client");
        let spawned = Command::new(executable)
            .arg("-d")
            .arg("serve")
            .arg("-w")
            .arg(&self.config.trace_path)
            .arg(&self.config.device_node)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.set_state(AccessoryState::Failed);
                return Err(AccessoryError::ExecutableNotFound(
                    executable.display().to_string(),
                ));
            }
            Err(err) => {
                self.set_state(AccessoryState::Failed);
                return Err(AccessoryError::Spawn(err));
            }
        };

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            // Piped streams missing means the spawn is unusable.
            let _ = child.start_kill();
            let _ = child.wait().await;
            self.set_state(AccessoryState::Failed);
            return Err(AccessoryError::Spawn(std::io::Error::other(
                "child stdio streams unavailable",
            )));
        };

        // Diagnostics channel: not protocol-significant, just logged.
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "accessory", "{line}");
            }
        });

        *self.stdin.lock().await = Some(stdin);
        *self.stdout.lock().await = Some(BufReader::new(stdout).lines());

        info!(pid = child.id(), "Accessory client started");
        *proc = Some(child);
        self.set_state(AccessoryState::Running);
        Ok(())
    }

    /// Stop the accessory client.
    ///
    /// Graceful phase closes stdin (the client's quit signal) and waits for
    /// the grace period; the forced phase kills. The manager always ends in
    /// `Stopped`, even when the process had already exited on its own.
    pub async fn stop(&self) {
        let mut proc = self.proc.lock().await;

        let Some(mut child) = proc.take() else {
            debug!("No accessory client process to stop");
            self.set_state(AccessoryState::Stopped);
            return;
        };

        self.set_state(AccessoryState::Stopping);
        info!(pid = child.id(), "Stopping accessory client");

        // Closing stdin unblocks the client's input loop; killing below
        // closes its stdout, which in turn unblocks any pending read_line.
        *self.stdin.lock().await = None;

        let grace = self.config.stop_grace();
        match timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                info!(%status, "Accessory client exited");
            }
            Ok(Err(err)) => {
                warn!(error = %err, "Error waiting for accessory client");
                let _ = child.start_kill();
            }
            Err(_) => {
                warn!("Accessory client did not exit in time, killing");
                let _ = child.start_kill();
                match timeout(grace, child.wait()).await {
                    Ok(_) => info!("Accessory client killed"),
                    Err(_) => warn!("Accessory client did not report exit after kill"),
                }
            }
        }

        *self.stdout.lock().await = None;
        self.set_state(AccessoryState::Stopped);
    }

    /// Load prerequisite kernel modules and wait for the device node.
    async fn prepare_device(&self) -> Result<(), AccessoryError> {
        self.ensure_modules_loaded().await?;

        let node = &self.config.device_node;
        for attempt in 1..=self.config.node_wait_retries {
            if Path::new(node).exists() {
                debug!(node = %node.display(), "Accessory device node present");
                return Ok(());
            }
            debug!(
                node = %node.display(),
                attempt,
                retries = self.config.node_wait_retries,
                "Waiting for accessory device node"
            );
            if attempt < self.config.node_wait_retries {
                sleep(self.config.node_wait_delay()).await;
            }
        }
        Err(AccessoryError::DeviceNotReady(node.display().to_string()))
    }

    /// Idempotently load the configured kernel modules.
    /// An empty module list skips the step.
    async fn ensure_modules_loaded(&self) -> Result<(), AccessoryError> {
        if self.config.kernel_modules.is_empty() {
            return Ok(());
        }

        let loaded = Command::new("lsmod")
            .output()
            .await
            .map_err(|err| AccessoryError::ModuleLoad(format!("lsmod: {err}")))?;
        let loaded = String::from_utf8_lossy(&loaded.stdout).into_owned();

        for module in &self.config.kernel_modules {
            if loaded.lines().any(|line| line.split_whitespace().next() == Some(module)) {
                debug!(module = %module, "Kernel module already loaded");
                continue;
            }
            info!(module = %module, "Loading kernel module");
            let status = Command::new("modprobe")
                .arg(module)
                .status()
                .await
                .map_err(|err| AccessoryError::ModuleLoad(format!("modprobe {module}: {err}")))?;
            if !status.success() {
                return Err(AccessoryError::ModuleLoad(format!(
                    "modprobe {module} exited with {status}"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AccessoryLink for AccessoryClient {
    async fn write_lines(&self, lines: &[String]) -> Result<(), AccessoryError> {
        let mut stdin = self.stdin.lock().await;
        let Some(writer) = stdin.as_mut() else {
            return Err(AccessoryError::NotRunning);
        };

        let result: Result<(), std::io::Error> = async {
            for line in lines {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
            writer.flush().await
        }
        .await;

        if let Err(err) = result {
            // The pipe is dead; nothing further may be written until an
            // explicit restart.
            warn!(error = %err, "Accessory input channel broken");
            *stdin = None;
            self.set_state(AccessoryState::Failed);
            return Err(AccessoryError::BrokenChannel(err));
        }
        Ok(())
    }

    async fn read_line(&self) -> Option<String> {
        let mut stdout = self.stdout.lock().await;
        let reader = stdout.as_mut()?;
        match reader.next_line().await {
            Ok(Some(line)) => Some(line),
            Ok(None) => {
                info!("Accessory client closed its output stream");
                None
            }
            Err(err) => {
                warn!(error = %err, "Error reading accessory output");
                None
            }
        }
    }

    fn is_running(&self) -> bool {
        self.state() == AccessoryState::Running
    }
}
