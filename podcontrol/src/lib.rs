//! Coordination between the Bluetooth audio source and the accessory
//! client.
//!
//! [`Bridge`] owns two background tasks:
//!
//! * a sync loop that polls the source for the active device and its
//!   now-playing snapshot, binds and releases the audio route as devices
//!   come and go, and pushes `KEY=VALUE` metadata bursts to the
//!   accessory when the snapshot actually changes;
//! * a command loop that reads transport requests from the accessory
//!   and forwards them to the source.
//!
//! Both tasks stop on [`Bridge::shutdown`] via a shared cancellation
//! token.

pub mod bridge;
pub mod burst;

mod commands;
mod sync;

pub use bridge::{Bridge, SyncTiming};
pub use burst::metadata_lines;
