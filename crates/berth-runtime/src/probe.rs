//! Detection of whether Berth itself runs inside a container.
//!
//! A nested Berth cannot bind-mount its own paths into a sibling container,
//! because the runtime resolves bind sources on the host. Volumes are then
//! copied through the runtime's archive API instead.

use std::path::PathBuf;

/// Answers whether the current process runs inside a container.
pub trait EnvironmentProbe: Send + Sync {
    /// Returns `true` when running nested inside a container runtime.
    fn is_nested(&self) -> bool;
}

/// Reads process metadata for container membership markers.
///
/// Nested when PID 1's cgroup names `docker` or `kubepods`, or when the
/// runtime's marker file exists.
#[derive(Debug, Clone)]
pub struct CgroupProbe {
    cgroup_file: PathBuf,
    marker_file: PathBuf,
}

impl Default for CgroupProbe {
    fn default() -> Self {
        Self {
            cgroup_file: PathBuf::from("/proc/1/cgroup"),
            marker_file: PathBuf::from("/.dockerenv"),
        }
    }
}

impl CgroupProbe {
    /// Probe reading alternative locations.
    pub fn with_paths(cgroup_file: impl Into<PathBuf>, marker_file: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_file: cgroup_file.into(),
            marker_file: marker_file.into(),
        }
    }
}

impl EnvironmentProbe for CgroupProbe {
    fn is_nested(&self) -> bool {
        let in_cgroup = std::fs::read_to_string(&self.cgroup_file)
            .is_ok_and(|text| text.lines().any(|l| l.contains("docker") || l.contains("kubepods")));
        let nested = in_cgroup || self.marker_file.exists();
        tracing::debug!(nested, cgroup = %self.cgroup_file.display(), "probed container nesting");
        nested
    }
}

/// Probe with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedProbe(pub bool);

impl EnvironmentProbe for FixedProbe {
    fn is_nested(&self) -> bool {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_cgroup_means_nested() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cgroup = dir.path().join("cgroup");
        std::fs::write(&cgroup, "12:pids:/docker/3f2a9c\n0::/\n").expect("write");
        assert!(CgroupProbe::with_paths(&cgroup, dir.path().join("absent")).is_nested());
    }

    #[test]
    fn kubepods_cgroup_means_nested() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cgroup = dir.path().join("cgroup");
        std::fs::write(&cgroup, "1:name=systemd:/kubepods/burstable/pod1\n").expect("write");
        assert!(CgroupProbe::with_paths(&cgroup, dir.path().join("absent")).is_nested());
    }

    #[test]
    fn marker_file_means_nested() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join(".dockerenv");
        std::fs::write(&marker, "").expect("write");
        assert!(CgroupProbe::with_paths(dir.path().join("absent"), &marker).is_nested());
    }

    #[test]
    fn plain_host_is_not_nested() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cgroup = dir.path().join("cgroup");
        std::fs::write(&cgroup, "0::/user.slice/user-1000.slice\n").expect("write");
        assert!(!CgroupProbe::with_paths(&cgroup, dir.path().join("absent")).is_nested());
        assert!(!FixedProbe(false).is_nested());
    }
}
