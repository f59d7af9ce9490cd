//! Override configuration.

use crate::error::{OverrideError, Result};
use crate::util;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hostname redirected to this machine when nothing else is configured.
pub const DEFAULT_HOSTNAME: &str = "api.frame.io";

/// Upstream resolvers used for every other query.
pub const DEFAULT_UPSTREAMS: [&str; 2] = ["8.8.8.8", "8.8.4.4"];

/// Interfaces probed by name, primary wireless first.
pub const DEFAULT_INTERFACES: [&str; 2] = ["wlan0", "eth0"];

/// Work directory used when running as root, or when no per-user runtime
/// directory is available.
pub const DEFAULT_WORK_DIR: &str = "/run/dns-override";

/// Prefix of every environment variable read by [`OverrideConfig::from_env`].
pub const ENV_PREFIX: &str = "DNS_OVERRIDE_";

/// Everything a run needs that is fixed before it starts.
///
/// # Example
///
/// ```
/// use dns_override::OverrideConfig;
///
/// let config = OverrideConfig::default().with_hostname("api.example.com");
///
/// assert_eq!(config.hostname, "api.example.com");
/// assert_eq!(config.dns_port, 53);
/// ```
#[derive(Debug, Clone)]
pub struct OverrideConfig {
    /// Fully-qualified hostname redirected to the discovered address.
    pub hostname: String,

    /// Upstream resolvers, in the order dnsmasq should list them.
    pub upstreams: Vec<IpAddr>,

    /// Interfaces probed by name before falling back to a private-range scan.
    pub interfaces: Vec<String>,

    /// Port the forwarder binds.
    pub dns_port: u16,

    /// Where the dnsmasq configuration is written (overwritten every run).
    pub config_path: PathBuf,

    /// Where dnsmasq appends its query log.
    pub log_path: PathBuf,

    /// Directory holding the crash-surviving suspension markers.
    pub state_dir: PathBuf,

    /// Forwarder binary, resolved through `PATH` when not absolute.
    pub forwarder: String,

    /// Unit name of the system resolver service.
    pub resolver_service: String,

    /// Process name the system resolver shows as the port owner.
    pub resolver_process: String,

    /// Pause after asking a prior instance to exit.
    pub instance_settle: Duration,

    /// Pause after stopping the resolver service.
    pub resolver_settle: Duration,

    /// Delay before the single retry of a failed stop or start.
    pub retry_delay: Duration,

    /// An exit within this window counts as a launch failure.
    pub startup_window: Duration,

    /// How long the forwarder gets to exit after SIGTERM.
    pub stop_grace: Duration,
}

impl Default for OverrideConfig {
    fn default() -> Self {
        let base = default_work_dir();
        Self {
            hostname: DEFAULT_HOSTNAME.to_string(),
            upstreams: DEFAULT_UPSTREAMS
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            interfaces: DEFAULT_INTERFACES.iter().map(ToString::to_string).collect(),
            dns_port: 53,
            config_path: base.join("dnsmasq.conf"),
            log_path: base.join("queries.log"),
            state_dir: base.join("state"),
            forwarder: "dnsmasq".to_string(),
            resolver_service: "systemd-resolved.service".to_string(),
            resolver_process: "systemd-resolve".to_string(),
            instance_settle: Duration::from_secs(1),
            resolver_settle: Duration::from_secs(1),
            retry_delay: Duration::from_secs(2),
            startup_window: Duration::from_secs(1),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl OverrideConfig {
    /// Defaults overlaid with `DNS_OVERRIDE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`OverrideError::InvalidConfig`] if a variable holds an
    /// unusable value.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`OverrideError::InvalidConfig`] if a variable holds an
    /// unusable value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();
        if let Some(hostname) = var("HOSTNAME") {
            config.hostname = hostname;
        }
        if let Some(list) = var("UPSTREAMS") {
            config.upstreams = split_list(&list)
                .map(|s| {
                    s.parse::<IpAddr>().map_err(|_| {
                        OverrideError::InvalidConfig(format!("upstream {s:?} is not an IP address"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
        }
        if let Some(list) = var("INTERFACES") {
            config.interfaces = split_list(&list).map(ToString::to_string).collect();
        }
        if let Some(path) = var("CONFIG_PATH") {
            config.config_path = path.into();
        }
        if let Some(path) = var("LOG_PATH") {
            config.log_path = path.into();
        }
        if let Some(path) = var("STATE_DIR") {
            config.state_dir = path.into();
        }
        if let Some(binary) = var("DNSMASQ") {
            config.forwarder = binary;
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the rest of the crate relies on.
    ///
    /// # Errors
    ///
    /// Returns [`OverrideError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.hostname.is_empty()
            || self.hostname.contains('/')
            || self.hostname.chars().any(char::is_whitespace)
        {
            return Err(OverrideError::InvalidConfig(format!(
                "hostname {:?} is not a plain DNS name",
                self.hostname
            )));
        }
        if self.upstreams.is_empty() {
            return Err(OverrideError::InvalidConfig(
                "at least one upstream resolver is required".into(),
            ));
        }
        if self.interfaces.is_empty() {
            return Err(OverrideError::InvalidConfig(
                "at least one interface name is required".into(),
            ));
        }
        Ok(())
    }

    /// Overrides the redirected hostname.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Overrides the upstream resolvers.
    #[must_use]
    pub fn with_upstreams(mut self, upstreams: impl IntoIterator<Item = IpAddr>) -> Self {
        self.upstreams = upstreams.into_iter().collect();
        self
    }

    /// Overrides the probed interface names.
    #[must_use]
    pub fn with_interfaces<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.interfaces = names.into_iter().map(Into::into).collect();
        self
    }

    /// Places the config artifact, query log and state markers under `dir`.
    #[must_use]
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.config_path = dir.join("dnsmasq.conf");
        self.log_path = dir.join("queries.log");
        self.state_dir = dir.join("state");
        self
    }

    /// Directories this run writes into or hands to the forwarder, in
    /// first-use order without duplicates.
    #[must_use]
    pub fn work_dirs(&self) -> Vec<&Path> {
        let mut dirs: Vec<&Path> = Vec::new();
        let parents = [self.config_path.parent(), self.log_path.parent()];
        for dir in parents
            .into_iter()
            .flatten()
            .filter(|p| !p.as_os_str().is_empty())
            .chain([self.state_dir.as_path()])
        {
            if !dirs.contains(&dir) {
                dirs.push(dir);
            }
        }
        dirs
    }

    /// Argument marking processes started from this configuration.
    #[must_use]
    pub fn conf_file_arg(&self) -> String {
        format!("--conf-file={}", self.config_path.display())
    }

    /// Arguments passed to the forwarder for a foreground run.
    #[must_use]
    pub fn forwarder_args(&self) -> Vec<String> {
        vec!["--keep-in-foreground".to_string(), self.conf_file_arg()]
    }
}

/// `/run/dns-override` for root, `$XDG_RUNTIME_DIR/dns-override` otherwise.
///
/// Both parents are writable only by their owner, unlike the temp dir.
fn default_work_dir() -> PathBuf {
    if !util::is_root() {
        if let Some(runtime) = std::env::var_os("XDG_RUNTIME_DIR").filter(|d| !d.is_empty()) {
            return PathBuf::from(runtime).join("dns-override");
        }
    }
    PathBuf::from(DEFAULT_WORK_DIR)
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}
