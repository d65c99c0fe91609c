use crate::wait::EXIT_INTERRUPTED;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Signal handling for graceful shutdown.
///
/// Handles SIGINT (Ctrl-C) and SIGTERM.
/// First signal: cancel the shutdown token; the wait aborts at its next
/// interval sleep and reports `Interrupted`.
/// Second SIGINT: exit immediately.
pub struct SignalHandler {
    token: CancellationToken,
}

impl SignalHandler {
    /// Register handlers and spawn the listener task. Must be called from
    /// inside a tokio runtime.
    pub fn install() -> std::io::Result<SignalHandler> {
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        let token = CancellationToken::new();
        let cancel = token.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => tracing::warn!("received SIGINT, shutting down"),
                _ = sigterm.recv() => tracing::warn!("received SIGTERM, shutting down"),
            }
            cancel.cancel();

            if sigint.recv().await.is_some() {
                tracing::warn!("second SIGINT, exiting immediately");
                std::process::exit(EXIT_INTERRUPTED);
            }
        });

        Ok(SignalHandler { token })
    }

    /// Token cancelled on the first shutdown signal.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}
