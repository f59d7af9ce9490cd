//! Turning termination signals into a cancellation token.

use std::io;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Registers SIGINT, SIGTERM and SIGHUP handlers and cancels `token` on
/// every delivery. Cancelling twice is a no-op, so repeated interrupts
/// cannot skip the cleanup path.
///
/// Registration happens before this returns; the returned task only relays.
///
/// # Errors
///
/// Returns an error if a handler cannot be registered.
pub fn listen(token: CancellationToken) -> io::Result<JoinHandle<()>> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                Some(()) = interrupt.recv() => "SIGINT",
                Some(()) = terminate.recv() => "SIGTERM",
                Some(()) = hangup.recv() => "SIGHUP",
                else => break,
            };
            if token.is_cancelled() {
                tracing::info!(signal = name, "Already shutting down");
            } else {
                tracing::info!(signal = name, "Shutting down, restoring resolver state");
                token.cancel();
            }
        }
    }))
}
