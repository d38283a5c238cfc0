//! Process signal handling.
//!
//! The first SIGINT or SIGTERM cancels the returned token so the event loop
//! can drain. A second one exits the process with status 1.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

use crate::types::{Error, Result};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Install the process-wide handler and return the stop token it cancels.
///
/// Must be called from within a Tokio runtime, at most once per process.
pub fn setup_signal_handler() -> Result<CancellationToken> {
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| Error::internal(format!("signal handler needs a tokio runtime: {}", e)))?;

    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Err(Error::validation("signal handler already installed"));
    }

    let mut signals = match Signals::new() {
        Ok(signals) => signals,
        Err(e) => {
            INSTALLED.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
    };

    let token = CancellationToken::new();
    let stop = token.clone();
    runtime.spawn(async move {
        let signal = signals.recv().await;
        tracing::info!(signal, "Received shutdown signal, draining");
        stop.cancel();

        let signal = signals.recv().await;
        tracing::error!(signal, "Received second shutdown signal, exiting");
        std::process::exit(1);
    });

    Ok(token)
}

/// SIGINT and SIGTERM streams, registered before the stop task is spawned.
struct Signals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    #[cfg(unix)]
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    #[cfg(not(unix))]
    fn new() -> std::io::Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> &'static str {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        "Ctrl+C"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_runtime() {
        let err = setup_signal_handler().unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
