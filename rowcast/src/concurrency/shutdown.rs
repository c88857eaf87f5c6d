//! Shutdown signalling for the engine and background workers.
//!
//! A watch channel carries a single boolean: `false` while running, flipped
//! to `true` exactly once when the process should wind down. Every worker
//! holds its own receiver, so late subscribers still observe the signal.

use tokio::sync::watch;

/// Transmitter half of the shutdown signal.
pub type ShutdownTx = watch::Sender<bool>;

/// Receiver half of the shutdown signal.
pub type ShutdownRx = watch::Receiver<bool>;

/// Creates a shutdown channel in the "running" state.
pub fn create_shutdown() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

/// Returns true once shutdown has been requested on this receiver's channel.
pub fn is_shutting_down(rx: &ShutdownRx) -> bool {
    *rx.borrow()
}
