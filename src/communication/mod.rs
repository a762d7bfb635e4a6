// communication/mod.rs
pub mod forwarder;
pub mod listener;
pub mod messages;

use tokio::sync::watch;

/// Resolves once the stop flag is raised, or once its sender is gone.
pub(crate) async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
