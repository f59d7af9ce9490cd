//! Freeing the DNS port: stopping prior instances and suspending the
//! system resolver, while recording what has to be undone.

use crate::config::OverrideConfig;
use crate::error::{OverrideError, Result};
use crate::host::Host;
use crate::state::StateStore;
use std::future::Future;
use std::io;

/// What this run owes the host at restoration time.
///
/// Filled in by [`ConflictManager::resolve`] and consumed by value by
/// [`Restorer::restore`](crate::Restorer::restore), so it is acted upon at
/// most once. A persisted copy lives in the [`StateStore`] for as long as a
/// restart is owed.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResolverConflictState {
    suspended: Option<String>,
}

impl ResolverConflictState {
    /// Returns `true` if this run suspended the resolver service.
    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        self.suspended.is_some()
    }

    /// Identity of the suspended service.
    #[must_use]
    pub fn suspended_service(&self) -> Option<&str> {
        self.suspended.as_deref()
    }

    fn record(&mut self, service: &str) {
        self.suspended = Some(service.to_string());
    }

    fn forget(&mut self) {
        self.suspended = None;
    }

    pub(crate) fn into_suspended(self) -> Option<String> {
        self.suspended
    }
}

/// Makes the DNS port available to this run.
pub struct ConflictManager<'a, H: Host> {
    host: &'a H,
    config: &'a OverrideConfig,
    store: StateStore,
}

impl<'a, H: Host> ConflictManager<'a, H> {
    /// Creates a manager persisting its records under `config.state_dir`.
    #[must_use]
    pub fn new(host: &'a H, config: &'a OverrideConfig) -> Self {
        Self {
            host,
            config,
            store: StateStore::new(&config.state_dir),
        }
    }

    /// Runs every step in order, recording suspensions into `state` as
    /// soon as they may have happened.
    ///
    /// 1. Stop prior instances of this override and settle.
    /// 2. Adopt suspensions orphaned by crashed runs.
    /// 3. Inspect the port owner; suspend it if it is the resolver service.
    ///
    /// # Errors
    ///
    /// Returns [`OverrideError::ConflictResolution`] if a prior instance or
    /// the resolver cannot be stopped (after one retry; privilege failures
    /// are not retried) or the port owner cannot be inspected for lack of
    /// privilege, or [`OverrideError::Io`] if state cannot be persisted.
    /// `state` is accurate on every return path.
    pub async fn resolve(&self, state: &mut ResolverConflictState) -> Result<()> {
        self.stop_prior_instances().await?;

        if self
            .store
            .adopt_orphaned()?
            .iter()
            .any(|s| *s == self.config.resolver_service)
        {
            state.record(&self.config.resolver_service);
        }

        let listener = match self.host.find_listener(self.config.dns_port).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                return Err(OverrideError::ConflictResolution {
                    action: format!("inspect the owner of port {}", self.config.dns_port),
                    source: e,
                });
            }
            Err(e) => {
                tracing::warn!(port = self.config.dns_port, error = %e, "Could not inspect port owner");
                None
            }
        };
        let Some(listener) = listener else {
            tracing::debug!(port = self.config.dns_port, "Port is free");
            return Ok(());
        };

        if listener.process.as_deref() != Some(self.config.resolver_process.as_str()) {
            tracing::warn!(
                port = self.config.dns_port,
                local = %listener.local,
                process = listener.process.as_deref().unwrap_or("unknown"),
                pid = ?listener.pid,
                "Port is held by an unrecognized process; stop it yourself if the forwarder fails to bind"
            );
            return Ok(());
        }

        let service = self.config.resolver_service.as_str();
        if !self.host.service_active(service).await.unwrap_or(true) {
            tracing::warn!(service, "Resolver owns the port but its service is not active");
            return Ok(());
        }
        self.suspend_resolver(service, state).await
    }

    async fn stop_prior_instances(&self) -> Result<()> {
        let binary = forwarder_name(&self.config.forwarder);
        let conf_arg = self.config.conf_file_arg();
        let pids = self
            .host
            .find_processes(&[binary, conf_arg.as_str()])
            .map_err(|source| OverrideError::ConflictResolution {
                action: "list running processes".into(),
                source,
            })?;
        if pids.is_empty() {
            return Ok(());
        }

        tracing::info!(?pids, "Stopping previous override instance");
        for pid in &pids {
            self.with_retry(&format!("stop previous instance (pid {pid})"), || {
                self.host.terminate_process(*pid)
            })
            .await?;
        }
        self.host.settle(self.config.instance_settle).await;

        match self.host.find_processes(&[binary, conf_arg.as_str()]) {
            Ok(left) if !left.is_empty() => {
                tracing::warn!(pids = ?left, "Previous instance still running after settle interval");
            }
            _ => {}
        }
        Ok(())
    }

    async fn suspend_resolver(
        &self,
        service: &str,
        state: &mut ResolverConflictState,
    ) -> Result<()> {
        // Persist first: a crash mid-stop must still leave a restart owed.
        self.store.record(service)?;
        state.record(service);

        tracing::info!(
            service,
            "Stopping system resolver; host name resolution is unavailable until restored"
        );
        if let Err(e) = self
            .with_retry(&format!("stop {service}"), || self.host.stop_service(service))
            .await
        {
            if self.host.service_active(service).await.unwrap_or(false) {
                // Still running: nothing to restore.
                state.forget();
                if let Err(clear) = self.store.clear(service) {
                    tracing::warn!(service, error = %clear, "Failed to clear suspension record");
                }
            }
            return Err(e);
        }

        self.host.settle(self.config.resolver_settle).await;
        if let Ok(Some(listener)) = self.host.find_listener(self.config.dns_port).await {
            tracing::warn!(local = %listener.local, "Port still held after stopping resolver");
        }
        Ok(())
    }

    /// Runs `op`, retrying once after the retry delay unless the failure is
    /// a privilege refusal.
    async fn with_retry<F, Fut>(&self, action: &str, op: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = io::Result<()>>,
    {
        let first = match op().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let source = if first.kind() == io::ErrorKind::PermissionDenied {
            first
        } else {
            tracing::warn!(action, error = %first, delay = ?self.config.retry_delay, "Retrying once");
            self.host.settle(self.config.retry_delay).await;
            match op().await {
                Ok(()) => return Ok(()),
                Err(second) => second,
            }
        };
        Err(OverrideError::ConflictResolution {
            action: action.to_string(),
            source,
        })
    }
}

/// File name of the forwarder binary, as it appears in command lines.
fn forwarder_name(forwarder: &str) -> &str {
    std::path::Path::new(forwarder)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(forwarder)
}
