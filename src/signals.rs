//! Graceful shutdown on SIGINT/SIGTERM
//!
//! The first signal cancels the process-wide token so every control loop
//! drains and the process exits cleanly (code 0). A second signal exits
//! immediately with code 1.

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Register the shutdown signal handler. Must be called at most once.
pub fn setup_signal_handler(shutdown: CancellationToken) -> std::io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        info!("Received shutdown signal, cancelling controller context");
        shutdown.cancel();

        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
        warn!("Received second shutdown signal, exiting directly");
        std::process::exit(1);
    });
    Ok(())
}
