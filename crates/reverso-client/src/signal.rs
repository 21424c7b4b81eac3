//! SIGINT/SIGTERM bridge for a running control connection

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownHandle;

/// Pause between requesting close and exiting the process
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(300);

/// Exit status after a signal-triggered shutdown
const SIGNAL_EXIT_CODE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// A termination signal arrived first
    Signal(&'static str),
    /// The control connection closed first
    Closed,
}

/// Wait for a termination signal or for the control to close
#[cfg(unix)]
pub async fn wait_for_signal(shutdown: &ShutdownHandle) -> std::io::Result<SignalOutcome> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    let outcome = tokio::select! {
        _ = sigterm.recv() => SignalOutcome::Signal("SIGTERM"),
        _ = sigint.recv() => SignalOutcome::Signal("SIGINT"),
        _ = shutdown.closed() => SignalOutcome::Closed,
    };
    Ok(outcome)
}

#[cfg(not(unix))]
pub async fn wait_for_signal(shutdown: &ShutdownHandle) -> std::io::Result<SignalOutcome> {
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| SignalOutcome::Signal("CTRL_C")),
        _ = shutdown.closed() => Ok(SignalOutcome::Closed),
    }
}

/// On a signal: request close, give the closers a moment, exit the process.
/// Returns quietly if the control closes first.
pub async fn listen_and_stop(shutdown: ShutdownHandle, client_id: String) {
    match wait_for_signal(&shutdown).await {
        Ok(SignalOutcome::Signal(name)) => {
            info!(signal = name, client_id = %client_id, "Received signal, stopping");
            shutdown.request_close();
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            std::process::exit(SIGNAL_EXIT_CODE);
        }
        Ok(SignalOutcome::Closed) => debug!("Signal listener released"),
        Err(e) => warn!(error = %e, "Installing signal handlers failed"),
    }
}
