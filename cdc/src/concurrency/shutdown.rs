use tokio::sync::watch;

use crate::concurrency::signal::{SignalRx, SignalTx, create_signal};

/// Sending half of the shutdown channel.
///
/// Cloning the transmitter lets several owners request shutdown, for example the binary's
/// Ctrl+C handler and the pipeline itself.
#[derive(Debug, Clone)]
pub struct ShutdownTx(SignalTx);

impl ShutdownTx {
    pub fn wrap(tx: SignalTx) -> Self {
        Self(tx)
    }

    /// Notifies every subscribed receiver that shutdown was requested.
    ///
    /// Fails only when no receiver is alive anymore, meaning nobody is left to stop.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    /// Creates a new receiver that observes shutdown requests sent from now on.
    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

pub type ShutdownRx = SignalRx;

/// Returns `true` when a shutdown was requested on `shutdown_rx` and not yet observed.
///
/// A closed channel counts as a shutdown request since no owner is left to resume the worker.
pub fn is_shutdown_requested(shutdown_rx: &ShutdownRx) -> bool {
    shutdown_rx.has_changed().unwrap_or(true)
}

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = create_signal();
    (ShutdownTx::wrap(tx), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_receiver_is_not_shut_down() {
        let (_tx, rx) = create_shutdown_channel();

        assert!(!is_shutdown_requested(&rx));
    }

    #[test]
    fn test_shutdown_reaches_all_subscribers() {
        let (tx, rx) = create_shutdown_channel();
        let other = tx.subscribe();

        tx.shutdown().unwrap();

        assert!(is_shutdown_requested(&rx));
        assert!(is_shutdown_requested(&other));
    }

    #[test]
    fn test_dropped_transmitter_counts_as_shutdown() {
        let (tx, rx) = create_shutdown_channel();
        drop(tx);

        assert!(is_shutdown_requested(&rx));
    }
}
