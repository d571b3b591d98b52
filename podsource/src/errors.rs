use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("D-Bus failure: {0}")]
    Bus(#[from] zbus::Error),
    #[error("bus call did not complete within {0:?}")]
    Timeout(Duration),
    #[error("no media player is available to control")]
    NoActiveTarget,
    #[error("transport command {0} is not supported by the player")]
    Unsupported(&'static str),
    #[error("receiver bring-up failed: {0}")]
    Setup(String),
}
