pub mod client;
pub mod node;
pub mod orchestrator;

use tokio_util::sync::CancellationToken;

/// A token that fires on Ctrl-C. Must be called inside a runtime.
pub(crate) fn shutdown_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
        }
        signal.cancel();
    });
    cancel
}
