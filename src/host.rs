//! Host capabilities the orchestration depends on.
//!
//! Everything that touches the machine goes through [`Host`], so the
//! orchestration can be driven against a fake in tests. [`SystemHost`] is
//! the real implementation for Linux hosts running `systemd-resolved`.

use crate::util::{self, InterfaceAddress, Listener};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;

/// How a forwarder process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
}

impl ProcessExit {
    /// Returns `true` for a zero exit code.
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self.code, Some(0))
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("killed by signal"),
        }
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

/// A running forwarder.
pub trait ForwarderProcess: Send {
    /// OS pid, if known.
    fn id(&self) -> Option<u32>;

    /// Resolves when the process exits. Cancel-safe.
    fn wait(&mut self) -> impl Future<Output = io::Result<ProcessExit>> + Send;

    /// Asks the process to exit, escalating to a kill after `grace`.
    fn stop(&mut self, grace: Duration) -> impl Future<Output = io::Result<ProcessExit>> + Send;
}

/// Operations on the host machine.
///
/// Anything that runs a command or waits is async so it never blocks a
/// runtime worker.
pub trait Host {
    /// Forwarder handle produced by [`spawn_forwarder`](Self::spawn_forwarder).
    type Forwarder: ForwarderProcess;

    /// First IPv4 address assigned to interface `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if interfaces cannot be queried.
    fn interface_address(&self, name: &str) -> io::Result<Option<Ipv4Addr>>;

    /// Every IPv4 address on every interface.
    ///
    /// # Errors
    ///
    /// Returns an error if interfaces cannot be queried.
    fn interface_addresses(&self) -> io::Result<Vec<InterfaceAddress>>;

    /// Pids whose command line contains every needle.
    ///
    /// # Errors
    ///
    /// Returns an error if the process table cannot be read.
    fn find_processes(&self, needles: &[&str]) -> io::Result<Vec<u32>>;

    /// Requests graceful termination of `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    fn terminate_process(&self, pid: u32) -> impl Future<Output = io::Result<()>> + Send;

    /// A listener bound to `port`, if any.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` when privilege to see socket owners cannot be
    /// obtained, otherwise the listing failure.
    fn find_listener(&self, port: u16) -> impl Future<Output = io::Result<Option<Listener>>> + Send;

    /// Whether `service` is currently running.
    ///
    /// # Errors
    ///
    /// Returns an error if the service manager cannot be queried.
    fn service_active(&self, service: &str) -> impl Future<Output = io::Result<bool>> + Send;

    /// Stops `service`.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` when privilege cannot be obtained, otherwise the
    /// service manager's failure.
    fn stop_service(&self, service: &str) -> impl Future<Output = io::Result<()>> + Send;

    /// Starts `service`.
    ///
    /// # Errors
    ///
    /// `PermissionDenied` when privilege cannot be obtained, otherwise the
    /// service manager's failure.
    fn start_service(&self, service: &str) -> impl Future<Output = io::Result<()>> + Send;

    /// Waits out a fixed settle interval.
    fn settle(&self, interval: Duration) -> impl Future<Output = ()> + Send;

    /// Starts `binary` with `args`, attached to this process.
    ///
    /// # Errors
    ///
    /// Returns the spawn error (`NotFound` for a missing binary).
    fn spawn_forwarder(&self, binary: &str, args: &[String]) -> io::Result<Self::Forwarder>;
}

/// Prefix for privileged commands when not running as root.
const ELEVATE: &str = "sudo";

/// Real host: `getifaddrs`, `/proc`, `ss`, `systemctl`, `kill(2)`.
///
/// Commands that need root are run through `sudo` when the process is not
/// already root.
#[derive(Debug, Clone)]
pub struct SystemHost {
    proc_root: PathBuf,
    use_sudo: bool,
}

impl SystemHost {
    /// Creates a host handle, deciding once whether `sudo` is needed.
    #[must_use]
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            use_sudo: !util::is_root(),
        }
    }

    fn command(&self, program: &str, privileged: bool) -> std::process::Command {
        if privileged && self.use_sudo {
            let mut cmd = std::process::Command::new(ELEVATE);
            cmd.arg(program);
            cmd
        } else {
            std::process::Command::new(program)
        }
    }

    async fn run(&self, program: &str, args: &[&str], privileged: bool) -> io::Result<Output> {
        tracing::debug!(program, ?args, privileged, "Running host command");
        let mut cmd = self.command(program, privileged);
        cmd.args(args).stdin(if privileged && self.use_sudo {
            Stdio::inherit()
        } else {
            Stdio::null()
        });
        tokio::process::Command::from(cmd).output().await
    }

    async fn systemctl(&self, verb: &str, service: &str) -> io::Result<()> {
        let output = self.run("systemctl", &[verb, service], true).await?;
        if output.status.success() {
            return Ok(());
        }
        Err(command_failure(
            &format!("systemctl {verb} {service}"),
            &output.stderr,
        ))
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

fn is_privilege_refusal(stderr: &str) -> bool {
    const PATTERNS: [&str; 6] = [
        "Access denied",
        "Interactive authentication required",
        "a password is required",
        "incorrect password",
        "not in the sudoers file",
        "Operation not permitted",
    ];
    PATTERNS.iter().any(|p| stderr.contains(p))
}

/// Error for a command that exited unsuccessfully; privilege refusals
/// become `PermissionDenied`.
fn command_failure(context: &str, stderr: &[u8]) -> io::Error {
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    let kind = if is_privilege_refusal(stderr) {
        io::ErrorKind::PermissionDenied
    } else {
        io::ErrorKind::Other
    };
    io::Error::new(kind, format!("{context}: {stderr}"))
}

impl Host for SystemHost {
    type Forwarder = SystemForwarder;

    fn interface_address(&self, name: &str) -> io::Result<Option<Ipv4Addr>> {
        Ok(util::interface_addresses()?
            .into_iter()
            .find(|a| a.name == name)
            .map(|a| a.addr))
    }

    fn interface_addresses(&self) -> io::Result<Vec<InterfaceAddress>> {
        util::interface_addresses()
    }

    fn find_processes(&self, needles: &[&str]) -> io::Result<Vec<u32>> {
        util::find_processes(&self.proc_root, needles)
    }

    async fn terminate_process(&self, pid: u32) -> io::Result<()> {
        match util::send_sigterm(pid) {
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && self.use_sudo => {
                let pid_arg = pid.to_string();
                let output = self.run("kill", &["-TERM", pid_arg.as_str()], true).await?;
                if output.status.success() || !util::is_process_alive(pid) {
                    Ok(())
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    ))
                }
            }
            other => other,
        }
    }

    async fn find_listener(&self, port: u16) -> io::Result<Option<Listener>> {
        let filter = format!("sport = :{port}");
        let output = self
            .run(
                "ss",
                &["-H", "-l", "-n", "-p", "-t", "-u", filter.as_str()],
                true,
            )
            .await?;
        if !output.status.success() {
            return Err(command_failure("ss", &output.stderr));
        }
        let listeners = util::parse_ss_listeners(&String::from_utf8_lossy(&output.stdout));
        // Prefer an entry that names its owner.
        Ok(listeners
            .iter()
            .find(|l| l.process.is_some())
            .or_else(|| listeners.first())
            .cloned())
    }

    async fn service_active(&self, service: &str) -> io::Result<bool> {
        let output = self
            .run("systemctl", &["is-active", "--quiet", service], false)
            .await?;
        Ok(output.status.success())
    }

    async fn stop_service(&self, service: &str) -> io::Result<()> {
        self.systemctl("stop", service).await
    }

    async fn start_service(&self, service: &str) -> io::Result<()> {
        self.systemctl("start", service).await
    }

    async fn settle(&self, interval: Duration) {
        tokio::time::sleep(interval).await;
    }

    fn spawn_forwarder(&self, binary: &str, args: &[String]) -> io::Result<SystemForwarder> {
        let mut cmd = self.command(binary, true);
        cmd.args(args)
            .stdin(Stdio::null())
            // Own process group: terminal interrupts reach the supervisor only.
            .process_group(0);
        let child = tokio::process::Command::from(cmd)
            .kill_on_drop(true)
            .spawn()?;
        Ok(SystemForwarder {
            child,
            elevate: self.use_sudo.then(|| ELEVATE.to_string()),
        })
    }
}

/// Signals used to stop the forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopSignal {
    Term,
    Kill,
}

impl StopSignal {
    const fn number(self) -> libc::c_int {
        match self {
            Self::Term => libc::SIGTERM,
            Self::Kill => libc::SIGKILL,
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::Term => "TERM",
            Self::Kill => "KILL",
        }
    }
}

/// Signals the process group `pgid`. When `direct` is refused and an
/// elevation program is configured, retries as `<elevate> kill -<SIG> -- -<pgid>`.
async fn signal_group(
    pgid: u32,
    signal: StopSignal,
    elevate: Option<&str>,
    direct: impl Fn(u32, libc::c_int) -> io::Result<()>,
) -> io::Result<()> {
    let err = match direct(pgid, signal.number()) {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    let Some(elevate) = elevate.filter(|_| err.kind() == io::ErrorKind::PermissionDenied) else {
        return Err(err);
    };

    tracing::debug!(pgid, signal = signal.name(), elevate, "Signalling forwarder with elevation");
    let output = tokio::process::Command::new(elevate)
        .args([
            "kill".to_string(),
            format!("-{}", signal.name()),
            "--".to_string(),
            format!("-{pgid}"),
        ])
        .stdin(Stdio::inherit())
        .output()
        .await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(command_failure(
            &format!("{elevate} kill -{} -- -{pgid}", signal.name()),
            &output.stderr,
        ))
    }
}

/// A forwarder started by [`SystemHost`], leading its own process group.
///
/// When started through `sudo` the direct child is root-owned, so stop
/// signals go through the same elevation.
#[derive(Debug)]
pub struct SystemForwarder {
    child: tokio::process::Child,
    elevate: Option<String>,
}

impl ForwarderProcess for SystemForwarder {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<ProcessExit> {
        self.child.wait().await.map(ProcessExit::from)
    }

    async fn stop(&mut self, grace: Duration) -> io::Result<ProcessExit> {
        // No id: already reaped.
        let Some(pgid) = self.child.id() else {
            return self.child.wait().await.map(ProcessExit::from);
        };
        let elevate = self.elevate.as_deref();

        signal_group(pgid, StopSignal::Term, elevate, util::signal_group).await?;
        if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
            return status.map(ProcessExit::from);
        }
        tracing::warn!(grace = ?grace, "Forwarder ignored SIGTERM, killing it");
        signal_group(pgid, StopSignal::Kill, elevate, util::signal_group).await?;
        self.child.wait().await.map(ProcessExit::from)
    }
}
