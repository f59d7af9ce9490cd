//! One override run, from address discovery to restoration.

use crate::config::OverrideConfig;
use crate::conflict::{ConflictManager, ResolverConflictState};
use crate::discovery::{HostAddress, discover};
use crate::error::{FailureKind, OverrideError, Result};
use crate::host::Host;
use crate::restore::{RestorationOutcome, Restorer};
use crate::ruleset::RuntimeConfig;
use crate::supervisor::{Termination, supervise};
use crate::util;
use tokio_util::sync::CancellationToken;

/// Lifecycle phases of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    DiscoveringAddress,
    ResolvingConflicts,
    BuildingConfig,
    Running,
    Restoring,
    Terminated,
}

/// Everything that happened during a run.
#[derive(Debug)]
pub struct RunReport {
    /// Phases entered, in order.
    pub phases: Vec<Phase>,
    /// Advertised address, if discovery succeeded.
    pub address: Option<HostAddress>,
    /// How supervision ended, or the first fatal error.
    pub outcome: Result<Termination>,
    /// What restoration did. [`RestorationOutcome::NotNeeded`] when the run
    /// never got past preflight.
    pub restoration: RestorationOutcome,
}

impl RunReport {
    /// Process exit code: 0 on a clean run, otherwise the failure class.
    /// A failed restoration wins over any earlier failure.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        if let RestorationOutcome::Failed(e) = &self.restoration {
            return e.kind().exit_code();
        }
        match &self.outcome {
            Ok(_) => 0,
            Err(e) => e.kind().exit_code(),
        }
    }

    /// The failure class, if the run did not end cleanly.
    #[must_use]
    pub fn failure(&self) -> Option<FailureKind> {
        match (&self.restoration, &self.outcome) {
            (RestorationOutcome::Failed(e), _) | (_, Err(e)) => Some(e.kind()),
            _ => None,
        }
    }

    /// The last phase entered.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::Init)
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!(?phase, "Entering phase");
        self.phases.push(phase);
    }
}

/// A configured override, ready to run against a host.
pub struct Override<H: Host> {
    host: H,
    config: OverrideConfig,
}

impl<H: Host> Override<H> {
    /// Creates an override for `host`.
    #[must_use]
    pub const fn new(host: H, config: OverrideConfig) -> Self {
        Self { host, config }
    }

    /// The host handle.
    #[must_use]
    pub const fn host(&self) -> &H {
        &self.host
    }

    /// Runs once: discover, free the port, write the config, supervise the
    /// forwarder until it exits or `shutdown` fires, then restore.
    ///
    /// Restoration runs exactly once for every path that got past
    /// preflight, including fatal errors.
    pub async fn run(&self, shutdown: &CancellationToken) -> RunReport {
        let mut report = RunReport {
            phases: vec![Phase::Init],
            address: None,
            outcome: Ok(Termination::Cancelled),
            restoration: RestorationOutcome::NotNeeded,
        };

        report.enter(Phase::DiscoveringAddress);
        let address = match self.preflight() {
            Ok(address) => address,
            Err(e) => {
                tracing::error!(error = %e, "Cannot start override");
                report.outcome = Err(e);
                report.enter(Phase::Terminated);
                return report;
            }
        };
        report.address = Some(address);

        let mut conflicts = ResolverConflictState::default();
        let outcome = self
            .mutate_and_supervise(address, &mut conflicts, shutdown, &mut report)
            .await;
        if let Err(e) = &outcome {
            tracing::error!(error = %e, "Override failed");
        }
        report.outcome = outcome;

        report.enter(Phase::Restoring);
        report.restoration = Restorer::new(&self.host, &self.config)
            .restore(conflicts)
            .await;
        report.enter(Phase::Terminated);
        report
    }

    /// Everything that must succeed before the host is touched: the address
    /// and private work directories.
    fn preflight(&self) -> Result<HostAddress> {
        let address = discover(&self.host, &self.config)?;
        for dir in self.config.work_dirs() {
            util::ensure_private_dir(dir).map_err(|source| OverrideError::UnsafeDirectory {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        Ok(address)
    }

    async fn mutate_and_supervise(
        &self,
        address: HostAddress,
        conflicts: &mut ResolverConflictState,
        shutdown: &CancellationToken,
        report: &mut RunReport,
    ) -> Result<Termination> {
        report.enter(Phase::ResolvingConflicts);
        ConflictManager::new(&self.host, &self.config)
            .resolve(conflicts)
            .await?;

        if shutdown.is_cancelled() {
            return Ok(Termination::Cancelled);
        }

        report.enter(Phase::BuildingConfig);
        RuntimeConfig::build(address, &self.config).write_to(&self.config.config_path)?;

        report.enter(Phase::Running);
        tracing::info!(
            hostname = %self.config.hostname,
            %address,
            "Point the device's DNS at this address"
        );
        supervise(&self.host, &self.config, shutdown).await
    }
}

impl From<OverrideError> for RunReport {
    fn from(error: OverrideError) -> Self {
        Self {
            phases: vec![Phase::Init, Phase::Terminated],
            address: None,
            outcome: Err(error),
            restoration: RestorationOutcome::NotNeeded,
        }
    }
}
