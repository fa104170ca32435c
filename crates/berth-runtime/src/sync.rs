//! Volume transfer through the runtime's archive API.
//!
//! Used when bind mounts are unavailable because Berth itself runs inside
//! a container. Copies in mirror each volume completely; copies out only
//! carry the direct children of read-write volumes that changed.

use std::path::{Path, PathBuf};

use berth_common::constants::RUNTIME_SOCKET_PATH;
use berth_common::error::{BerthError, Result};
use berth_common::types::ContainerId;
use berth_core::api::ContainerApi;
use berth_core::archive::{pack_path, unpack_into};

use crate::context::RunContext;
use crate::exec::{CommandKind, exec_command, shell_quote, valid_username};
use crate::volume::{Volume, base_name, clean_path, parent};

/// Host target that streams a copied-out archive to the context's stdout.
pub const STDOUT_TARGET: &str = "-";

fn blocking_error(path: &Path, e: tokio::task::JoinError) -> BerthError {
    BerthError::io(path, std::io::Error::other(e))
}

/// Copies a volume's host path into the container.
///
/// The destination directory is created and handed to the run user first.
/// A single file whose name differs from the container path's last
/// component is renamed after the upload.
///
/// # Errors
///
/// Returns an error if the host path cannot be read or any runtime call
/// fails.
pub async fn copy_to_container(
    api: &dyn ContainerApi,
    container: &ContainerId,
    ctx: &RunContext,
    volume: &Volume,
) -> Result<()> {
    let host = volume.host_path.clone();
    let metadata = std::fs::metadata(&host).map_err(|e| BerthError::io(&host, e))?;
    let dest_dir = if metadata.is_dir() {
        volume.container_path.clone()
    } else {
        parent(&volume.container_path)
    };

    if ctx.is_debug() {
        ctx.say(&format!("COPY {} {container}:{}\n", host.display(), volume.container_path));
    }

    let root = ctx.as_root();
    if dest_dir != RUNTIME_SOCKET_PATH {
        let mut mkdir = format!("mkdir -p {}", shell_quote(&dest_dir));
        if let Some(user) = ctx.user.as_deref().filter(|u| *u != "root" && valid_username(u)) {
            mkdir.push_str(&format!(" && chown {user}:{user} {}", shell_quote(&dest_dir)));
        }
        exec_command(api, container, &root, &mkdir, CommandKind::Service).await?;
    }

    let source = host.clone();
    let archive = tokio::task::spawn_blocking(move || pack_path(&source))
        .await
        .map_err(|e| blocking_error(&host, e))??;
    api.upload_archive(container, &dest_dir, archive).await?;
    tracing::debug!(host = %host.display(), dest = %dest_dir, "volume copied in");

    if !metadata.is_dir() {
        let src_name = host
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dst_name = base_name(&volume.container_path);
        if !src_name.is_empty() && src_name != dst_name {
            let from = format!("{}/{src_name}", dest_dir.trim_end_matches('/'));
            let mv = format!("mv {} {}", shell_quote(&from), shell_quote(&volume.container_path));
            exec_command(api, container, &root, &mv, CommandKind::Service).await?;
        }
    }
    Ok(())
}

/// Copies `container_path` out of the container into `host_dir`.
///
/// The archive's top entry carries the path's base name. A symbolic link is
/// followed: its target is archived and the entry renamed back to the
/// link's name. With [`STDOUT_TARGET`] the raw archive is written to the
/// context's stdout instead.
///
/// Returns the extracted paths relative to `host_dir`.
///
/// # Errors
///
/// Returns an error if the path cannot be inspected or downloaded, or the
/// archive cannot be extracted.
pub async fn copy_from_container(
    api: &dyn ContainerApi,
    container: &ContainerId,
    ctx: &RunContext,
    container_path: &str,
    host_dir: &str,
) -> Result<Vec<PathBuf>> {
    let container_path = clean_path(container_path);
    if ctx.is_debug() {
        ctx.say(&format!("COPY {container}:{container_path} {host_dir}\n"));
    }

    let stat = api.stat_path(container, &container_path).await?;
    let (source, rebase) = match stat.link_target.filter(|_| stat.is_symlink) {
        Some(target) => {
            let target = if target.starts_with('/') {
                clean_path(&target)
            } else {
                clean_path(&format!("{}/{target}", parent(&container_path)))
            };
            let from = base_name(&target).to_string();
            let to = base_name(&container_path).to_string();
            (target, Some((from, to)))
        }
        None => (container_path.clone(), None),
    };

    let archive = api.download_archive(container, &source).await?;
    if host_dir == STDOUT_TARGET {
        ctx.write_raw(&archive)
            .map_err(|e| BerthError::io(STDOUT_TARGET, e))?;
        return Ok(Vec::new());
    }

    let target = PathBuf::from(host_dir);
    let dest = target.clone();
    let written = tokio::task::spawn_blocking(move || {
        let rebase = rebase.as_ref().map(|(f, t)| (f.as_str(), t.as_str()));
        unpack_into(archive.as_slice(), &dest, rebase)
    })
    .await
    .map_err(|e| blocking_error(&target, e))??;
    tracing::debug!(source = %source, host = %target.display(), entries = written.len(), "copied out");
    Ok(written)
}

/// Copies changed direct children of every read-write volume back to
/// its host path.
///
/// # Errors
///
/// Returns the first diff, download, or extraction error.
pub async fn copy_volumes_from_container(
    api: &dyn ContainerApi,
    container: &ContainerId,
    ctx: &RunContext,
    volumes: &[Volume],
) -> Result<Vec<PathBuf>> {
    let changes = api.changes(container).await?;
    let mut copied = Vec::new();
    for volume in volumes.iter().filter(|v| v.is_read_write()) {
        let host = volume.host_path.to_string_lossy();
        for child in volume.direct_children(&changes) {
            let written = copy_from_container(api, container, ctx, &child, &host).await?;
            copied.extend(written.into_iter().map(|p| volume.host_path.join(p)));
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use berth_core::api::{CreateSpec, PathStat};
    use berth_core::mock::{MockApi, MockCall};

    use super::*;
    use crate::context::{MemorySink, sink};
    use crate::volume::VolumeMode;

    fn archive_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_bytes()).expect("append");
        }
        builder.into_inner().expect("finish")
    }

    async fn setup() -> (MockApi, ContainerId) {
        let api = MockApi::new();
        let id = api.create_container(&CreateSpec::default()).await.expect("create");
        (api, id)
    }

    #[tokio::test]
    async fn directory_volume_is_created_chowned_and_uploaded() {
        let (api, id) = setup().await;
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").expect("write");
        let mut ctx = RunContext::default();
        ctx.user = Some("builder".into());

        let volume = Volume::new(dir.path(), "/src", VolumeMode::ReadOnly);
        copy_to_container(&api, &id, &ctx, &volume).await.expect("copy in");

        assert_eq!(api.exec_commands(), vec!["mkdir -p '/src' && chown builder:builder '/src'"]);
        let uploads = api.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].0, "/src");
        let names: Vec<String> = tar::Archive::new(uploads[0].1.as_slice())
            .entries()
            .expect("entries")
            .map(|e| e.expect("entry").path().expect("path").to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("main.rs")), "{names:?}");
    }

    #[tokio::test]
    async fn renamed_file_is_moved_after_upload() {
        let (api, id) = setup().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("settings.local.toml");
        std::fs::write(&file, "x = 1").expect("write");

        let volume = Volume::new(&file, "/etc/app/settings.toml", VolumeMode::ReadOnly);
        copy_to_container(&api, &id, &RunContext::default(), &volume).await.expect("copy in");

        assert_eq!(
            api.exec_commands(),
            vec![
                "mkdir -p '/etc/app'".to_string(),
                "mv '/etc/app/settings.local.toml' '/etc/app/settings.toml'".to_string(),
            ]
        );
        assert_eq!(api.uploads()[0].0, "/etc/app");
    }

    #[tokio::test]
    async fn socket_directory_is_not_created() {
        let (api, id) = setup().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let volume = Volume::new(dir.path(), RUNTIME_SOCKET_PATH, VolumeMode::ReadOnly);
        copy_to_container(&api, &id, &RunContext::default(), &volume).await.expect("copy in");
        assert!(api.exec_commands().is_empty());
    }

    #[tokio::test]
    async fn symlink_is_rebased_onto_link_name() {
        let (api, id) = setup().await;
        api.set_stat(
            "/work/out/latest",
            PathStat {
                is_dir: false,
                is_symlink: true,
                link_target: Some("builds/v2".into()),
            },
        );
        api.set_archive("/work/out/builds/v2", archive_with(&[("v2/report.txt", "ok")]));
        let host = tempfile::tempdir().expect("tempdir");

        let written = copy_from_container(
            &api,
            &id,
            &RunContext::default(),
            "/work/out/latest",
            &host.path().to_string_lossy(),
        )
        .await
        .expect("copy out");

        assert_eq!(written, vec![PathBuf::from("latest/report.txt")]);
        let text = std::fs::read_to_string(host.path().join("latest/report.txt")).expect("read");
        assert_eq!(text, "ok");
        assert!(api.calls().contains(&MockCall::Download(id, "/work/out/builds/v2".into())));
    }

    #[tokio::test]
    async fn dash_streams_archive_to_stdout() {
        let (api, id) = setup().await;
        let archive = archive_with(&[("log.txt", "hello")]);
        api.set_archive("/var/log.txt", archive.clone());
        let out = MemorySink::new();
        let mut ctx = RunContext::with_sinks(sink(out.clone()), sink(std::io::sink()));
        ctx.prefix = "never ".into();

        let written = copy_from_container(&api, &id, &ctx, "/var/log.txt", STDOUT_TARGET)
            .await
            .expect("copy out");
        assert!(written.is_empty());
        assert!(out.contents().contains("hello"));
        assert!(!out.contents().starts_with("never"));
    }

    #[tokio::test]
    async fn only_direct_children_of_rw_volumes_come_back() {
        let (api, id) = setup().await;
        let host_out = tempfile::tempdir().expect("tempdir");
        let host_src = tempfile::tempdir().expect("tempdir");
        api.set_changes(&["/work/out", "/work/out/a", "/work/out/a/b", "/src/generated"]);
        api.set_archive("/work/out/a", archive_with(&[("a/b", "nested")]));

        let volumes = vec![
            Volume::new(host_out.path(), "/work/out", VolumeMode::ReadWrite),
            Volume::new(host_src.path(), "/src", VolumeMode::ReadOnly),
        ];
        let copied = copy_volumes_from_container(&api, &id, &RunContext::default(), &volumes)
            .await
            .expect("copy back");

        let downloads: Vec<String> = api
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Download(_, path) => Some(path),
                _ => None,
            })
            .collect();
        assert_eq!(downloads, vec!["/work/out/a"]);
        assert_eq!(copied, vec![host_out.path().join("a/b")]);
        assert!(host_out.path().join("a/b").exists());
    }
}
