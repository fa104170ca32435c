//! Host to container path mappings.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use berth_common::error::{BerthError, Result};

/// Whether changes inside the container flow back to the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VolumeMode {
    /// Mounted or copied in only.
    ReadOnly,
    /// Direct children changed in the container are copied back.
    #[default]
    ReadWrite,
}

/// A host path made visible inside the run container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Directory or file on the host.
    pub host_path: PathBuf,
    /// Absolute path inside the container.
    pub container_path: String,
    /// Access mode.
    pub mode: VolumeMode,
}

impl Volume {
    /// Creates a volume; the container path is normalised.
    pub fn new(host_path: impl Into<PathBuf>, container_path: &str, mode: VolumeMode) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: clean_path(container_path),
            mode,
        }
    }

    /// Whether the volume takes part in copy-back.
    pub fn is_read_write(&self) -> bool {
        self.mode == VolumeMode::ReadWrite
    }

    /// Bind-mount specification `host:container[:ro]`.
    pub fn bind(&self) -> String {
        let mut bind = format!("{}:{}", self.host_path.display(), self.container_path);
        if self.mode == VolumeMode::ReadOnly {
            bind.push_str(":ro");
        }
        bind
    }

    /// Changed paths that are direct children of the container path.
    ///
    /// Read-only volumes never have any. Deeper descendants are skipped;
    /// copying a direct child carries its whole subtree.
    pub fn direct_children(&self, changes: &[String]) -> Vec<String> {
        if !self.is_read_write() {
            return Vec::new();
        }
        let mut children: Vec<String> = changes
            .iter()
            .map(|c| clean_path(c))
            .filter(|c| *c != self.container_path && parent(c) == self.container_path)
            .collect();
        children.sort();
        children.dedup();
        children
    }
}

impl FromStr for Volume {
    type Err = BerthError;

    /// Parses `host:container[:ro|rw]`.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = |message: &str| BerthError::Config {
            message: format!("volume {s:?}: {message}"),
        };
        let parts: Vec<&str> = s.split(':').collect();
        let (host, container, mode) = match parts.as_slice() {
            [host, container] => (*host, *container, VolumeMode::ReadWrite),
            [host, container, "ro"] => (*host, *container, VolumeMode::ReadOnly),
            [host, container, "rw"] => (*host, *container, VolumeMode::ReadWrite),
            [_, _, other] => return Err(invalid(&format!("unknown mode {other:?}"))),
            _ => return Err(invalid("expected host:container[:ro|rw]")),
        };
        if host.is_empty() {
            return Err(invalid("empty host path"));
        }
        if !container.starts_with('/') {
            return Err(invalid("container path must be absolute"));
        }
        Ok(Self::new(host, container, mode))
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode {
            VolumeMode::ReadOnly => "ro",
            VolumeMode::ReadWrite => "rw",
        };
        write!(f, "{}:{}:{mode}", self.host_path.display(), self.container_path)
    }
}

/// Lexically normalises a slash-separated path.
///
/// Collapses repeated slashes, drops `.` and trailing slashes, and resolves
/// `..` without consulting any filesystem.
pub fn clean_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    let _ = parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Parent of a cleaned path.
pub fn parent(path: &str) -> String {
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(i) => path[..i].to_string(),
        None => ".".to_string(),
    }
}

/// Final component of a cleaned path.
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
