//! Foreground supervision of the forwarder.

use crate::config::OverrideConfig;
use crate::error::{OverrideError, Result};
use crate::host::{ForwarderProcess, Host};
use tokio_util::sync::CancellationToken;

/// Why supervision ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Shutdown was requested before the forwarder was started.
    Cancelled,
    /// Shutdown was requested and the forwarder was stopped.
    Interrupted,
    /// The forwarder exited on its own with status 0.
    Exited,
}

/// Starts the forwarder and blocks until it exits or `shutdown` fires.
///
/// An exit inside the startup window is a launch failure (bad config, port
/// still taken); a non-zero exit afterwards is a runtime failure.
///
/// # Errors
///
/// [`OverrideError::Spawn`], [`OverrideError::StartupExit`],
/// [`OverrideError::UnexpectedExit`] or [`OverrideError::Supervision`].
pub async fn supervise<H: Host>(
    host: &H,
    config: &OverrideConfig,
    shutdown: &CancellationToken,
) -> Result<Termination> {
    if shutdown.is_cancelled() {
        tracing::info!("Shutdown requested before launch, not starting forwarder");
        return Ok(Termination::Cancelled);
    }

    let binary = config.forwarder.as_str();
    let mut child = host
        .spawn_forwarder(binary, &config.forwarder_args())
        .map_err(|source| OverrideError::Spawn {
            binary: binary.to_string(),
            source,
        })?;
    tracing::info!(
        binary,
        pid = ?child.id(),
        config = %config.config_path.display(),
        log = %config.log_path.display(),
        "Forwarder running; press Ctrl-C to stop"
    );

    let startup = tokio::select! {
        exit = child.wait() => Some(exit),
        () = shutdown.cancelled() => None,
        () = tokio::time::sleep(config.startup_window) => {
            tracing::debug!("Forwarder survived startup window");
            return run_to_end(&mut child, config, shutdown).await;
        }
    };

    match startup {
        Some(exit) => {
            let exit = exit.map_err(OverrideError::Supervision)?;
            Err(OverrideError::StartupExit {
                binary: binary.to_string(),
                status: exit.to_string(),
            })
        }
        None => stop(&mut child, config).await,
    }
}

async fn run_to_end<P: ForwarderProcess>(
    child: &mut P,
    config: &OverrideConfig,
    shutdown: &CancellationToken,
) -> Result<Termination> {
    tokio::select! {
        exit = child.wait() => {
            let exit = exit.map_err(OverrideError::Supervision)?;
            if exit.success() {
                tracing::info!("Forwarder exited");
                Ok(Termination::Exited)
            } else {
                Err(OverrideError::UnexpectedExit {
                    binary: config.forwarder.clone(),
                    status: exit.to_string(),
                })
            }
        }
        () = shutdown.cancelled() => stop(child, config).await,
    }
}

async fn stop<P: ForwarderProcess>(child: &mut P, config: &OverrideConfig) -> Result<Termination> {
    tracing::info!(pid = ?child.id(), "Stopping forwarder");
    let exit = child
        .stop(config.stop_grace)
        .await
        .map_err(OverrideError::Supervision)?;
    tracing::debug!(%exit, "Forwarder stopped");
    Ok(Termination::Interrupted)
}
