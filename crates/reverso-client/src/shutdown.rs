//! Close signalling for the control connection and everything spawned from it.
//!
//! Any task may *request* termination any number of times. A single
//! moderator task turns the first request into the broadcast "closed"
//! signal and closes the connection. The closed signal is observed by
//! every task without being consumed.

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle {
    terminate: CancellationToken,
    closed: CancellationToken,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the moderator to close. Idempotent and non-blocking.
    pub fn request_close(&self) {
        self.terminate.cancel();
    }

    pub fn is_close_requested(&self) -> bool {
        self.terminate.is_cancelled()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the closed signal has been raised
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub(crate) async fn close_requested(&self) {
        self.terminate.cancelled().await
    }

    /// Raise the closed signal. Only the moderator calls this.
    pub(crate) fn mark_closed(&self) {
        self.closed.cancel();
    }
}
