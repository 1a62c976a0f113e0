// src/shutdown.rs

//! OS termination signals.
//!
//! Unix: `SIGINT`, `SIGTERM` and `SIGQUIT`. Elsewhere: Ctrl-C.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Completes when the process receives a termination signal.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigquit.recv() => info!("received SIGQUIT"),
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C");
    Ok(())
}

/// Token cancelled on the first termination signal.
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(err) = wait_for_shutdown_signal().await {
            warn!(error = %err, "failed to listen for termination signals");
            return;
        }
        trigger.cancel();
    });
    token
}
