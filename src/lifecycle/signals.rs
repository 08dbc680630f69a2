//! OS signal handling.
//!
//! - Ctrl-C / SIGTERM: graceful shutdown
//! - SIGHUP: configuration reload (unix only)

use crate::config::ConfigReloader;
use crate::lifecycle::shutdown::Shutdown;

/// Wait for Ctrl-C or SIGTERM.
pub async fn terminate_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(target: "exceptions", error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(target: "exceptions", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Spawn the signal task: shutdown on terminate, reload on SIGHUP.
pub fn spawn(shutdown: Shutdown, reloader: Option<ConfigReloader>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(sig) => Some(sig),
                Err(e) => {
                    tracing::warn!(target: "exceptions", error = %e, "SIGHUP reload unavailable");
                    None
                }
            };
            let terminate = terminate_signal();
            tokio::pin!(terminate);
            loop {
                tokio::select! {
                    _ = &mut terminate => break,
                    Some(()) = async {
                        match hangup.as_mut() {
                            Some(sig) => sig.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match &reloader {
                            Some(reloader) => {
                                reloader.reload("sighup");
                            }
                            None => tracing::info!(target: "program_flow", "SIGHUP ignored, no config file"),
                        }
                    }
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = &reloader;
            terminate_signal().await;
        }

        tracing::info!(target: "program_flow", "Shutdown signal received");
        shutdown.trigger();
    })
}
