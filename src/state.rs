//! On-disk suspension markers.
//!
//! Each marker records that a run stopped a service and still owes its
//! restart, stamped with that run's PID. A run killed before it could
//! restore leaves its marker behind; the next run adopts it.

use crate::error::Result;
use crate::util::{self, is_process_alive};
use std::path::{Path, PathBuf};

/// Marker comment embedded in every managed state file.
const MANAGED_BY_MARKER: &str = "# managed by dns-override";

/// Marker files under one state directory, one per suspended service.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Creates a store rooted at `dir` (created lazily).
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the state directory path.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Records that `service` was suspended by the current process.
    ///
    /// Overwrites any previous marker for the same service.
    ///
    /// # Errors
    ///
    /// Returns [`OverrideError::Io`](crate::OverrideError::Io) if the
    /// directory is not private to the effective user, or the directory or
    /// file cannot be written.
    pub fn record(&self, service: &str) -> Result<()> {
        util::ensure_private_dir(&self.dir)?;
        let path = self.marker_path(service);
        util::write_atomic(&path, generate_file_content(service).as_bytes())?;
        tracing::debug!(service = %service, path = %path.display(), "Recorded suspension");
        Ok(())
    }

    /// Removes the marker for `service`. Missing or unmanaged files are left
    /// alone.
    ///
    /// # Errors
    ///
    /// Returns [`OverrideError::Io`](crate::OverrideError::Io) if removal
    /// fails.
    pub fn clear(&self, service: &str) -> Result<()> {
        let path = self.marker_path(service);
        if !path.exists() {
            return Ok(());
        }
        if !is_managed(&path) {
            tracing::warn!(path = %path.display(), "State file not managed by dns-override, leaving it");
            return Ok(());
        }
        std::fs::remove_file(&path)?;
        tracing::debug!(service = %service, "Cleared suspension record");
        Ok(())
    }

    /// Returns `true` if a managed marker exists for `service`.
    #[must_use]
    pub fn is_recorded(&self, service: &str) -> bool {
        let path = self.marker_path(service);
        path.exists() && is_managed(&path)
    }

    /// Takes over markers whose owning process is dead.
    ///
    /// Each adopted marker is re-stamped with the current PID and its
    /// service name returned. Markers of live processes and unmanaged files
    /// are untouched.
    ///
    /// # Errors
    ///
    /// Returns [`OverrideError::Io`](crate::OverrideError::Io) if the
    /// directory cannot be read.
    pub fn adopt_orphaned(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut adopted = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if !path.is_file() || !is_managed(&path) {
                continue;
            }
            let Some((pid, service)) = parse_marker(&path) else {
                continue;
            };
            if is_process_alive(pid) {
                continue;
            }
            tracing::warn!(
                service = %service,
                pid = pid,
                "Adopting suspension left behind by a run that did not restore it"
            );
            match self.record(&service) {
                Ok(()) => adopted.push(service),
                Err(e) => tracing::warn!(service = %service, error = %e, "Failed to adopt state file"),
            }
        }
        adopted.sort();
        Ok(adopted)
    }

    fn marker_path(&self, service: &str) -> PathBuf {
        self.dir.join(service)
    }
}

/// Generates marker content.
///
/// ```text
/// # managed by dns-override (pid=12345)
/// service systemd-resolved.service
/// ```
fn generate_file_content(service: &str) -> String {
    let pid = std::process::id();
    format!("{MANAGED_BY_MARKER} (pid={pid})\nservice {service}\n")
}

/// Checks whether a file contains the ownership marker.
fn is_managed(path: &Path) -> bool {
    std::fs::read_to_string(path).is_ok_and(|c| c.contains(MANAGED_BY_MARKER))
}

/// Extracts the PID and service name from a marker file.
fn parse_marker(path: &Path) -> Option<(u32, String)> {
    let content = std::fs::read_to_string(path).ok()?;
    let mut pid = None;
    let mut service = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix(MANAGED_BY_MARKER) {
            let rest = rest.trim().strip_prefix("(pid=")?;
            pid = rest.strip_suffix(')')?.parse().ok();
        } else if let Some(name) = line.strip_prefix("service ") {
            service = Some(name.trim().to_string()).filter(|s| !s.is_empty());
        }
    }
    Some((pid?, service?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: &str = "systemd-resolved.service";

    #[test]
    fn content_includes_marker_pid_and_service() {
        let content = generate_file_content(SERVICE);
        assert!(content.contains(MANAGED_BY_MARKER));
        assert!(content.contains(&format!("pid={}", std::process::id())));
        assert!(content.contains("service systemd-resolved.service"));
    }

    #[test]
    fn record_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state"));

        store.record(SERVICE).unwrap();
        assert!(store.is_recorded(SERVICE));

        store.clear(SERVICE).unwrap();
        assert!(!store.is_recorded(SERVICE));
        // Second clear is a no-op.
        store.clear(SERVICE).unwrap();
    }

    #[test]
    fn record_replaces_planted_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim");
        std::fs::write(&victim, "precious").unwrap();
        let state = dir.path().join("state");
        std::fs::create_dir(&state).unwrap();
        std::os::unix::fs::symlink(&victim, state.join(SERVICE)).unwrap();

        StateStore::new(&state).record(SERVICE).unwrap();

        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "precious");
        assert!(StateStore::new(&state).is_recorded(SERVICE));
    }

    #[test]
    fn clear_leaves_unmanaged_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SERVICE);
        std::fs::write(&path, "something else\n").unwrap();

        StateStore::new(dir.path()).clear(SERVICE).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn parse_marker_reads_pid_and_service() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SERVICE);
        std::fs::write(
            &path,
            "# managed by dns-override (pid=42)\nservice systemd-resolved.service\n",
        )
        .unwrap();
        assert_eq!(parse_marker(&path), Some((42, SERVICE.to_string())));
    }

    #[test]
    fn adopts_markers_of_dead_processes() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let path = dir.path().join(SERVICE);
        std::fs::write(
            &path,
            "# managed by dns-override (pid=999999999)\nservice systemd-resolved.service\n",
        )
        .unwrap();

        assert_eq!(store.adopt_orphaned().unwrap(), vec![SERVICE]);
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains(&format!("pid={}", std::process::id())));
    }

    #[test]
    fn leaves_markers_of_live_processes() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        store.record(SERVICE).unwrap();
        std::fs::write(dir.path().join("other"), "nameserver 1.1.1.1\n").unwrap();

        assert!(store.adopt_orphaned().unwrap().is_empty());
        assert!(store.is_recorded(SERVICE));
    }

    #[test]
    fn missing_dir_has_no_orphans() {
        let store = StateStore::new("/nonexistent/dns-override-state");
        assert!(store.adopt_orphaned().unwrap().is_empty());
    }
}
