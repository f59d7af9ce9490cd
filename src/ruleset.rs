//! Generated dnsmasq configuration.

use crate::config::OverrideConfig;
use crate::discovery::HostAddress;
use crate::error::{OverrideError, Result};
use crate::util;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Header line of every generated artifact.
const GENERATED_MARKER: &str = "# generated by dns-override, overwritten on every run";

/// Interfaces the forwarder listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenScope {
    /// `0.0.0.0`: reachable by devices on the local network.
    AllInterfaces,
    /// `127.0.0.1`: this machine only.
    Loopback,
}

impl ListenScope {
    const fn address(self) -> &'static str {
        match self {
            Self::AllInterfaces => "0.0.0.0",
            Self::Loopback => "127.0.0.1",
        }
    }
}

/// A single hostname forced to resolve to one address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideRule {
    /// Hostname pattern, matched by dnsmasq including subdomains.
    pub hostname: String,
    /// Address every match resolves to.
    pub target: HostAddress,
}

/// The full forwarder configuration for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Ignore `/etc/resolv.conf` so the forwarder never queries itself.
    pub no_resolv: bool,
    /// Upstream resolvers, in order.
    pub upstreams: Vec<IpAddr>,
    /// The one active override.
    pub rule: OverrideRule,
    /// Where the forwarder listens.
    pub listen: ListenScope,
    /// Query log destination.
    pub log_path: PathBuf,
}

impl RuntimeConfig {
    /// Builds the ruleset for `address`. Pure and deterministic.
    #[must_use]
    pub fn build(address: HostAddress, config: &OverrideConfig) -> Self {
        Self {
            no_resolv: true,
            upstreams: config.upstreams.clone(),
            rule: OverrideRule {
                hostname: config.hostname.clone(),
                target: address,
            },
            listen: ListenScope::AllInterfaces,
            log_path: config.log_path.clone(),
        }
    }

    /// Renders dnsmasq directives.
    ///
    /// ```text
    /// # generated by dns-override, overwritten on every run
    /// no-resolv
    /// server=8.8.8.8
    /// server=8.8.4.4
    /// address=/api.example.com/192.168.1.50
    /// listen-address=0.0.0.0
    /// log-queries
    /// log-facility=/run/dns-override/queries.log
    /// ```
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{GENERATED_MARKER}");
        if self.no_resolv {
            out.push_str("no-resolv\n");
        }
        for server in &self.upstreams {
            let _ = writeln!(out, "server={server}");
        }
        let _ = writeln!(
            out,
            "address=/{}/{}",
            self.rule.hostname, self.rule.target
        );
        let _ = writeln!(out, "listen-address={}", self.listen.address());
        out.push_str("log-queries\n");
        let _ = writeln!(out, "log-facility={}", self.log_path.display());
        out
    }

    /// Writes the rendered config to `path`, replacing whatever was there.
    ///
    /// The parent directory must be private to the effective user; the file
    /// is swapped in by rename, never written through an existing link.
    ///
    /// # Errors
    ///
    /// Returns [`OverrideError::ConfigWrite`] if the parent directory is
    /// unsafe or cannot be created, or the file cannot be written.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let wrap = |source| OverrideError::ConfigWrite {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            util::ensure_private_dir(parent).map_err(wrap)?;
        }
        util::write_atomic(path, self.render().as_bytes()).map_err(wrap)?;

        tracing::info!(
            path = %path.display(),
            hostname = %self.rule.hostname,
            target = %self.rule.target,
            "Wrote dnsmasq config"
        );
        Ok(())
    }
}
