use anyhow::{Context, Result};
use std::future::Future;
use tokio::signal;

/// What ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    CtrlC,
    Terminate,
    /// The caller-supplied future completed first.
    Requested,
}

#[cfg(unix)]
async fn terminate() -> Result<()> {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate() -> Result<()> {
    std::future::pending().await
}

/// Wait for Ctrl+C, SIGTERM, or `requested` to complete, whichever comes first.
pub async fn wait_for_shutdown_or<F>(requested: F) -> Result<ShutdownReason>
where
    F: Future<Output = ()>,
{
    let reason = tokio::select! {
        res = signal::ctrl_c() => {
            res.context("Failed to listen for Ctrl+C")?;
            ShutdownReason::CtrlC
        }
        res = terminate() => {
            res?;
            ShutdownReason::Terminate
        }
        _ = requested => ShutdownReason::Requested,
    };
    tracing::info!(reason = ?reason, "Shutdown signal received, initiating graceful shutdown");
    Ok(reason)
}

/// Wait for termination signals (Ctrl+C, SIGTERM).
pub async fn wait_for_shutdown() -> Result<ShutdownReason> {
    wait_for_shutdown_or(std::future::pending()).await
}
