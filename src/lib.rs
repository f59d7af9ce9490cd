//! # dns-override
//!
//! Point one hostname at this machine for the length of a single run.
//!
//! A device on the local network normally resolves its cloud endpoint
//! (e.g. `api.frame.io`) through the LAN's DNS. This crate starts a
//! `dnsmasq` on port 53 that answers that one name with this machine's
//! address and forwards everything else upstream, so pointing the device's
//! DNS at this machine redirects it to a locally running service.
//!
//! ## Lifecycle
//!
//! 1. [`discover`] the address to advertise (named interfaces first, then a
//!    private-range scan). Failure here aborts before anything is touched.
//! 2. [`ConflictManager`] stops a previous instance and suspends
//!    `systemd-resolved` if it owns the port, recording that in a
//!    [`ResolverConflictState`] and on disk.
//! 3. [`RuntimeConfig`] renders the dnsmasq configuration, overwriting the
//!    previous one.
//! 4. [`supervise`] runs dnsmasq in the foreground until it exits or the
//!    shutdown token fires.
//! 5. [`Restorer`] restarts the resolver. This runs on every path past
//!    step 1.
//!
//! ```rust,ignore
//! use dns_override::{Override, OverrideConfig, SystemHost};
//! use tokio_util::sync::CancellationToken;
//!
//! let shutdown = CancellationToken::new();
//! let _signals = dns_override::shutdown::listen(shutdown.clone())?;
//! let report = Override::new(SystemHost::new(), OverrideConfig::from_env()?)
//!     .run(&shutdown)
//!     .await;
//! std::process::exit(report.exit_code().into());
//! ```
//!
//! ## Side effects
//!
//! While the override runs, `systemd-resolved` is stopped, so this machine
//! itself has no stub resolver. If a run is killed outright, the suspension
//! marker under the state directory lets the next run restore it.
//!
//! ## Permissions
//!
//! Binding port 53 and stopping services require root. When not run as
//! root, privileged commands are prefixed with `sudo`.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod conflict;
pub mod discovery;
pub mod error;
pub mod host;
pub mod restore;
pub mod ruleset;
pub mod run;
pub mod shutdown;
pub mod state;
pub mod supervisor;
pub mod util;

pub use config::OverrideConfig;
pub use conflict::{ConflictManager, ResolverConflictState};
pub use discovery::{HostAddress, discover};
pub use error::{FailureKind, OverrideError, Result};
pub use host::{ForwarderProcess, Host, ProcessExit, SystemHost};
pub use restore::{RestorationOutcome, Restorer};
pub use ruleset::{ListenScope, OverrideRule, RuntimeConfig};
pub use run::{Override, Phase, RunReport};
pub use state::StateStore;
pub use supervisor::{Termination, supervise};
pub use util::{InterfaceAddress, Listener};
