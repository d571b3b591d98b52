//! Accessory command loop.
//!
//! Reads one token per line from the accessory client and forwards the
//! recognized transport commands to the audio source. Unknown tokens
//! are logged and dropped, and a failed forward never stops the loop.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use podaccessory::AccessoryLink;
use podsource::{AudioSource, TransportCommand};

pub(crate) async fn run_commands(
    source: Arc<dyn AudioSource>,
    link: Arc<dyn AccessoryLink>,
    cancel: CancellationToken,
) {
    info!("Command loop started");
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = link.read_line() => line,
        };
        let Some(line) = line else {
            info!("Accessory output closed, command loop exiting");
            break;
        };
        let token = line.trim();
        if token.is_empty() {
            continue;
        }
        match TransportCommand::parse(token) {
            Some(command) => {
                debug!(command = command.as_str(), "Forwarding transport command");
                if let Err(error) = source.send_command(command).await {
                    warn!(command = command.as_str(), %error, "Transport command failed");
                }
            }
            None => warn!(token, "Ignoring unknown accessory command"),
        }
    }
    info!("Command loop stopped");
}
