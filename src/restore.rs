//! Reactivating whatever the conflict manager suspended.

use crate::config::OverrideConfig;
use crate::conflict::ResolverConflictState;
use crate::error::OverrideError;
use crate::host::Host;
use crate::state::StateStore;

/// Result of the restoration step.
#[derive(Debug)]
pub enum RestorationOutcome {
    /// Nothing had been suspended.
    NotNeeded,
    /// The service is running again.
    Reactivated {
        /// Service that was restarted.
        service: String,
    },
    /// The service is still stopped; the host has no working resolver.
    Failed(OverrideError),
}

impl RestorationOutcome {
    /// Returns `true` unless reactivation failed.
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

/// Reverses the conflict manager's suspension.
pub struct Restorer<'a, H: Host> {
    host: &'a H,
    config: &'a OverrideConfig,
    store: StateStore,
}

impl<'a, H: Host> Restorer<'a, H> {
    /// Creates a restorer sharing the conflict manager's state directory.
    #[must_use]
    pub fn new(host: &'a H, config: &'a OverrideConfig) -> Self {
        Self {
            host,
            config,
            store: StateStore::new(&config.state_dir),
        }
    }

    /// Restarts the suspended service, if any. Consumes `state`.
    ///
    /// One retry after the retry delay. On success the persisted marker is
    /// cleared; on failure it is kept so the next run adopts it.
    pub async fn restore(&self, state: ResolverConflictState) -> RestorationOutcome {
        let Some(service) = state.into_suspended() else {
            tracing::debug!("Nothing to restore");
            return RestorationOutcome::NotNeeded;
        };

        tracing::info!(service = %service, "Reactivating system resolver");
        let result = match self.host.start_service(&service).await {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(service = %service, error = %first, "Reactivation failed, retrying once");
                self.host.settle(self.config.retry_delay).await;
                self.host.start_service(&service).await
            }
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.store.clear(&service) {
                    tracing::warn!(service = %service, error = %e, "Failed to clear suspension record");
                }
                tracing::info!(service = %service, "System resolver restored");
                RestorationOutcome::Reactivated { service }
            }
            Err(source) => {
                tracing::error!(
                    service = %service,
                    error = %source,
                    "RESTORATION FAILED: name resolution on this machine stays broken; run `sudo systemctl start {service}`"
                );
                RestorationOutcome::Failed(OverrideError::Restoration { service, source })
            }
        }
    }
}
