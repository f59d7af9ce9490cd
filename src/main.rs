use dns_override::{Override, OverrideConfig, RestorationOutcome, RunReport, SystemHost, shutdown};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let report = match OverrideConfig::from_env() {
        Ok(config) => run(config).await,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            RunReport::from(e)
        }
    };

    match &report.restoration {
        RestorationOutcome::Failed(e) => {
            tracing::error!(error = %e, "Host left without a working resolver");
        }
        RestorationOutcome::Reactivated { service } => {
            tracing::info!(service = %service, "Host resolver state restored");
        }
        RestorationOutcome::NotNeeded => {}
    }

    ExitCode::from(report.exit_code())
}

async fn run(config: OverrideConfig) -> RunReport {
    let token = CancellationToken::new();
    let signals = match shutdown::listen(token.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(error = %e, "Cannot install signal handlers");
            return RunReport::from(dns_override::OverrideError::SignalSetup(e));
        }
    };

    tracing::info!(
        hostname = %config.hostname,
        config = %config.config_path.display(),
        "Starting DNS override"
    );
    let report = Override::new(SystemHost::new(), config).run(&token).await;
    signals.abort();
    report
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
