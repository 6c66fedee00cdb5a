use tokio::sync::watch;

/// Sending half of a payload-less notification channel.
pub type SignalTx = watch::Sender<()>;

/// Receiving half of a payload-less notification channel.
///
/// A receiver only observes notifications sent after it was created or last marked as seen.
pub type SignalRx = watch::Receiver<()>;

/// Creates a new notification channel.
pub fn create_signal() -> (SignalTx, SignalRx) {
    watch::channel(())
}
