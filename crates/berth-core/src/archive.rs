//! Tar archive helpers for copies and build contexts.
//!
//! Archives are held in memory: copies move volume contents and build
//! contexts, both bounded by what the caller mounts.

use std::io::Read;
use std::path::{Component, Path, PathBuf};

use berth_common::error::{BerthError, Result};

/// Packs `host_path` for upload into a container directory.
///
/// A directory contributes its contents at the archive root; a single file
/// is stored under its base name. Symbolic links are archived as links.
///
/// # Errors
///
/// Returns an error if the path cannot be read.
pub fn pack_path(host_path: &Path) -> Result<Vec<u8>> {
    let metadata = std::fs::metadata(host_path).map_err(|e| BerthError::io(host_path, e))?;
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);

    if metadata.is_dir() {
        builder
            .append_dir_all(".", host_path)
            .map_err(|e| BerthError::io(host_path, e))?;
    } else {
        let name = host_path.file_name().ok_or_else(|| BerthError::Config {
            message: format!("{} has no file name", host_path.display()),
        })?;
        builder
            .append_path_with_name(host_path, name)
            .map_err(|e| BerthError::io(host_path, e))?;
    }

    builder.into_inner().map_err(|e| BerthError::io(host_path, e))
}

/// Packs a build context directory into a gzip-compressed tar archive.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn pack_build_context(dir: &Path) -> Result<Vec<u8>> {
    tracing::debug!(context = %dir.display(), "packing build context");
    let encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", dir)
        .map_err(|e| BerthError::io(dir, e))?;
    let encoder = builder.into_inner().map_err(|e| BerthError::io(dir, e))?;
    encoder.finish().map_err(|e| BerthError::io(dir, e))
}

/// Renames the leading `from` component of an entry path to `to`.
fn rebase_entry(path: &Path, rebase: Option<(&str, &str)>) -> PathBuf {
    let Some((from, to)) = rebase else {
        return path.to_path_buf();
    };
    match path.strip_prefix(from) {
        Ok(rest) if rest.as_os_str().is_empty() => PathBuf::from(to),
        Ok(rest) => Path::new(to).join(rest),
        Err(_) => path.to_path_buf(),
    }
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Extracts a tar archive below `target`, returning the entries written.
///
/// When `rebase` is `Some((from, to))`, entries whose first component is
/// `from` are written under `to` instead. Entries escaping `target` are
/// rejected.
///
/// # Errors
///
/// Returns an error if the archive is corrupt, an entry escapes `target`,
/// or extraction fails.
pub fn unpack_into(archive: impl Read, target: &Path, rebase: Option<(&str, &str)>) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(target).map_err(|e| BerthError::io(target, e))?;
    let mut archive = tar::Archive::new(archive);
    let mut written = Vec::new();

    for entry in archive.entries().map_err(|e| BerthError::io(target, e))? {
        let mut entry = entry.map_err(|e| BerthError::io(target, e))?;
        let raw = entry.path().map_err(|e| BerthError::io(target, e))?.into_owned();
        let relative = rebase_entry(&raw, rebase);
        if !is_contained(&relative) {
            return Err(BerthError::Config {
                message: format!("archive entry {} escapes {}", raw.display(), target.display()),
            });
        }
        let dest = target.join(&relative);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| BerthError::io(parent, e))?;
        }
        let _ = entry.unpack(&dest).map_err(|e| BerthError::io(&dest, e))?;
        written.push(relative);
    }

    tracing::debug!(target = %target.display(), entries = written.len(), "archive extracted");
    Ok(written)
}
