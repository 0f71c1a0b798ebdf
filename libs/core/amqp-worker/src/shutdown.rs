//! Shutdown signal shared by the worker loops.

use tokio::sync::watch;

/// Resolve once shutdown has been signalled.
///
/// A dropped sender also counts as shutdown, so loops never outlive the
/// process that owns the signal.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
