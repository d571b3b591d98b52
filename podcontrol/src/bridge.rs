//! Bridge task lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use podaccessory::AccessoryLink;
use podconfig::SyncConfig;
use podroute::AudioRoute;
use podsource::AudioSource;

use crate::commands::run_commands;
use crate::sync::{SyncState, run_sync};

/// Poll cadences for the sync loop.
#[derive(Clone, Copy, Debug)]
pub struct SyncTiming {
    /// How often the source is asked for the active device.
    pub connection_poll: Duration,
    /// How often the active device's snapshot is refreshed.
    pub metadata_poll: Duration,
}

impl SyncTiming {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            connection_poll: config.connection_poll(),
            metadata_poll: config.metadata_poll(),
        }
    }
}

/// Handle on the two running bridge tasks.
///
/// Dropping a `Bridge` without calling [`shutdown`](Self::shutdown)
/// detaches the tasks; they keep running until the runtime goes away.
pub struct Bridge {
    cancel: CancellationToken,
    sync_task: JoinHandle<()>,
    command_task: JoinHandle<()>,
}

impl Bridge {
    /// Starts the sync and command loops over the given backends.
    pub fn spawn(
        source: Arc<dyn AudioSource>,
        route: Arc<dyn AudioRoute>,
        link: Arc<dyn AccessoryLink>,
        timing: SyncTiming,
    ) -> Self {
        let cancel = CancellationToken::new();
        let state = SyncState::new(source.clone(), route, link.clone());
        let sync_task = tokio::spawn(run_sync(state, timing, cancel.clone()));
        let command_task = tokio::spawn(run_commands(source, link, cancel.clone()));
        info!("Bridge started");
        Self {
            cancel,
            sync_task,
            command_task,
        }
    }

    /// Stops both loops and waits for them to finish.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        info!("Bridge shutting down");
        self.cancel.cancel();
        for (name, task) in [("sync", self.sync_task), ("command", self.command_task)] {
            if let Err(error) = task.await {
                if error.is_cancelled() {
                    warn!(task = name, "Loop was cancelled before joining");
                    continue;
                }
                return Err(anyhow!("{name} loop failed: {error}"));
            }
        }
        info!("Bridge stopped");
        Ok(())
    }
}
