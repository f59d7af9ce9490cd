//! Internal utilities.

use std::ffi::CStr;
use std::io::{self, Write as _};
use std::net::Ipv4Addr;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::Path;

/// An IPv4 address assigned to a named interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddress {
    /// Interface name (e.g. `wlan0`).
    pub name: String,
    /// Assigned address.
    pub addr: Ipv4Addr,
}

/// A socket listening on the probed port, as reported by `ss`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    /// Local address column (e.g. `127.0.0.53%lo:53`).
    pub local: String,
    /// Owning process name, when `ss` could see it.
    pub process: Option<String>,
    /// Owning pid, when `ss` could see it.
    pub pid: Option<u32>,
}

/// Checks whether the process with the given PID is still alive.
///
/// Uses `kill(pid, 0)`: signal 0 checks existence without delivering a signal.
/// `EPERM` means the process exists but belongs to someone else.
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: `kill(pid, 0)` is a standard POSIX existence check that does
    // not deliver any signal.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Sends SIGTERM to `pid`. A process that is already gone is not an error.
///
/// # Errors
///
/// Returns the OS error from `kill(2)`, e.g. `PermissionDenied` for a
/// process owned by another user.
pub fn send_sigterm(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: plain kill(2) on a positive pid; no memory is shared.
    if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Sends `signal` to every process in the group led by `pgid`. A group
/// that is already gone is not an error.
///
/// # Errors
///
/// Returns the OS error from `kill(2)`, e.g. `PermissionDenied` when the
/// group leader runs as another user.
pub fn signal_group(pgid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .ok()
        .filter(|p| *p > 1)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "pgid out of range"))?;
    // SAFETY: a negative pid addresses a process group; pgid > 1 rules out
    // broadcasting to every process.
    if unsafe { libc::kill(-pgid, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Returns `true` when the effective uid is root.
#[must_use]
pub fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

/// Creates `dir` (mode 0700) if missing, then checks that it is a real
/// directory owned by the effective user and not writable by group or
/// others.
///
/// # Errors
///
/// `PermissionDenied` if an existing directory fails the ownership or mode
/// check or is a symlink, otherwise the creation error.
pub fn ensure_private_dir(dir: &Path) -> io::Result<()> {
    if std::fs::symlink_metadata(dir).is_err() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(dir)?;
    }

    let meta = std::fs::symlink_metadata(dir)?;
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    let refuse = |reason: String| {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("refusing to use {}: {reason}", dir.display()),
        ))
    };
    if !meta.file_type().is_dir() {
        return refuse("not a directory".into());
    }
    if meta.uid() != euid {
        return refuse(format!("owned by uid {}, not {euid}", meta.uid()));
    }
    if meta.mode() & 0o022 != 0 {
        return refuse(format!("mode {:o} is group or world writable", meta.mode() & 0o777));
    }
    Ok(())
}

/// Replaces `path` with `contents` through a fresh temporary file in the
/// same directory and a rename, so a symlink planted at `path` is replaced
/// rather than followed.
///
/// # Errors
///
/// Returns the I/O error from creating, writing or renaming the file.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Lists every IPv4 address assigned to any interface, in kernel order.
///
/// # Errors
///
/// Returns the OS error if `getifaddrs(3)` fails.
pub fn interface_addresses() -> io::Result<Vec<InterfaceAddress>> {
    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    // SAFETY: `head` is a valid out-pointer; the list is freed below.
    if unsafe { libc::getifaddrs(&raw mut head) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let mut found = Vec::new();
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: `cursor` is a non-null node of the list returned by
        // getifaddrs, which stays valid until freeifaddrs.
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
            continue;
        }
        // SAFETY: ifa_addr is non-null and points at a sockaddr.
        let family = i32::from(unsafe { (*entry.ifa_addr).sa_family });
        if family != libc::AF_INET {
            continue;
        }
        // SAFETY: AF_INET entries carry a sockaddr_in.
        let sin = unsafe { &*entry.ifa_addr.cast::<libc::sockaddr_in>() };
        // SAFETY: ifa_name is a NUL-terminated string owned by the list.
        let name = unsafe { CStr::from_ptr(entry.ifa_name) };
        found.push(InterfaceAddress {
            name: name.to_string_lossy().into_owned(),
            addr: Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        });
    }

    // SAFETY: `head` came from a successful getifaddrs and is freed once.
    unsafe { libc::freeifaddrs(head) };
    Ok(found)
}

/// Finds processes under `proc_root` whose command line contains every
/// needle. The calling process is never reported.
///
/// # Errors
///
/// Returns [`io::Error`] if `proc_root` cannot be read. Processes that
/// vanish mid-scan are skipped.
pub fn find_processes(proc_root: &Path, needles: &[&str]) -> io::Result<Vec<u32>> {
    let own = std::process::id();
    let mut pids = Vec::new();
    for entry in std::fs::read_dir(proc_root)? {
        let entry = entry?;
        let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        if pid == own {
            continue;
        }
        let Ok(raw) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        let cmdline = raw
            .split(|b| *b == 0)
            .filter(|arg| !arg.is_empty())
            .map(String::from_utf8_lossy)
            .collect::<Vec<_>>()
            .join(" ");
        if !cmdline.is_empty() && needles.iter().all(|n| cmdline.contains(n)) {
            pids.push(pid);
        }
    }
    pids.sort_unstable();
    Ok(pids)
}

/// Parses `ss -H -l -n -p -t -u` output into listeners.
///
/// ```text
/// udp UNCONN 0 0 127.0.0.53%lo:53 0.0.0.0:* users:(("systemd-resolve",pid=612,fd=13))
/// ```
#[must_use]
pub fn parse_ss_listeners(output: &str) -> Vec<Listener> {
    output
        .lines()
        .filter_map(|line| {
            let columns: Vec<&str> = line.split_whitespace().collect();
            let local = (*columns.get(4)?).to_string();
            let (process, pid) = line
                .find("users:((")
                .map_or((None, None), |at| parse_users(&line[at + "users:((".len()..]));
            Some(Listener {
                local,
                process,
                pid,
            })
        })
        .collect()
}

/// Parses `"name",pid=N,fd=M))` (the first owner only).
fn parse_users(rest: &str) -> (Option<String>, Option<u32>) {
    let name = rest
        .strip_prefix('"')
        .and_then(|r| r.split('"').next())
        .map(ToString::to_string);
    let pid = rest
        .split(',')
        .find_map(|field| field.strip_prefix("pid="))
        .and_then(|p| p.trim_end_matches(')').parse().ok());
    (name, pid)
}
