//! Docker Engine implementation of [`ContainerApi`] backed by bollard.
//!
//! Streaming calls are re-encoded as newline-delimited JSON so that every
//! runtime feeds the same decoder.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, KillContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{
    BuildImageOptions, CreateImageOptions, ListImagesOptions, PushImageOptions, TagImageOptions,
};
use bollard::models::{BuildInfo, HostConfig};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use tokio::io::AsyncWriteExt;

use berth_common::config::BerthConfig;
use berth_common::error::{BerthError, Result};
use berth_common::types::ContainerId;

use crate::api::{
    BuildSpec, ByteStream, ContainerApi, CreateSpec, ExecIo, ExecSpec, InputSource, PathStat,
    RegistryCredentials,
};

const CONNECT_TIMEOUT_SECS: u64 = 120;

/// Inspections of an exec whose output closed before it reported an exit.
const EXEC_EXIT_POLLS: u32 = 20;
const EXEC_POLL_START: Duration = Duration::from_millis(25);
const EXEC_POLL_MAX: Duration = Duration::from_secs(1);

/// Prints `link`, `dir`, or `file` for `$1`, then the link target for links.
const STAT_SCRIPT: &str =
    r#"if [ -L "$1" ]; then echo link; readlink "$1"; elif [ -d "$1" ]; then echo dir; elif [ -e "$1" ]; then echo file; else exit 2; fi"#;

/// Connection to a Docker Engine.
#[derive(Debug, Clone)]
pub struct DockerApi {
    docker: Docker,
}

impl DockerApi {
    /// Connects to the engine named by `config.docker_host`, or the local
    /// default socket, and negotiates the API version.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is unsupported or unreachable.
    pub async fn connect(config: &BerthConfig) -> Result<Self> {
        let host = config.docker_host.as_deref().unwrap_or("local defaults");
        let docker = match config.docker_host.as_deref() {
            None => Docker::connect_with_local_defaults(),
            Some(h) if h.starts_with("unix://") => {
                Docker::connect_with_unix(h, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            Some(h) if h.starts_with("tcp://") || h.starts_with("http://") => {
                Docker::connect_with_http(h, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            Some(h) => {
                return Err(BerthError::Config {
                    message: format!("unsupported docker host {h}"),
                });
            }
        }
        .map_err(|e| BerthError::runtime("connect", host, e))?;

        let docker = docker
            .negotiate_version()
            .await
            .map_err(|e| BerthError::runtime("connect", host, e))?;
        tracing::info!(host, "connected to docker engine");
        Ok(Self { docker })
    }

    /// Wraps an existing bollard client.
    #[must_use]
    pub const fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    async fn run_exec(
        &self,
        spec: &ExecSpec,
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
        stdin: Option<InputSource>,
    ) -> Result<i64> {
        let target = spec.container.to_string();
        let options = CreateExecOptions::<String> {
            attach_stdin: Some(stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(spec.tty),
            cmd: Some(spec.command.clone()),
            privileged: Some(spec.privileged),
            user: spec.user.clone(),
            working_dir: spec.working_dir.clone(),
            ..Default::default()
        };
        let created = self
            .docker
            .create_exec(spec.container.as_str(), options)
            .await
            .map_err(|e| BerthError::runtime("exec create", &target, e))?;

        let started = self
            .docker
            .start_exec(
                &created.id,
                Some(StartExecOptions {
                    detach: false,
                    tty: spec.tty,
                    output_capacity: None,
                }),
            )
            .await
            .map_err(|e| BerthError::runtime("exec start", &target, e))?;

        if let StartExecResults::Attached { mut output, mut input } = started {
            let feeder = stdin.map(|source| {
                tokio::spawn(async move {
                    let mut reader = source.lock_owned().await;
                    let _ = tokio::io::copy(&mut *reader, &mut input).await;
                    let _ = input.shutdown().await;
                })
            });

            let mut outcome = Ok(());
            while let Some(chunk) = output.next().await {
                let written = match chunk {
                    Ok(LogOutput::StdErr { message }) => stderr.write_all(&message),
                    Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
                        stdout.write_all(&message)
                    }
                    Ok(LogOutput::StdIn { .. }) => Ok(()),
                    Err(e) => {
                        outcome = Err(BerthError::runtime("exec attach", &target, e));
                        break;
                    }
                };
                if let Err(e) = written {
                    outcome = Err(BerthError::io("<exec output>", e));
                    break;
                }
            }
            if let Some(feeder) = feeder {
                feeder.abort();
            }
            outcome?;
            let _ = stdout.flush();
            let _ = stderr.flush();
        }

        let mut delay = EXEC_POLL_START;
        for _ in 0..EXEC_EXIT_POLLS {
            let inspected = self
                .docker
                .inspect_exec(&created.id)
                .await
                .map_err(|e| BerthError::runtime("exec inspect", &target, e))?;
            if let ExecExit::Exited(code) = exec_exit(&target, inspected.running, inspected.exit_code)? {
                return Ok(code);
            }
            tracing::debug!(container = %target, ?delay, "exec output closed, waiting for exit");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(EXEC_POLL_MAX);
        }
        Err(BerthError::runtime(
            "exec",
            &target,
            "command still running after its output closed",
        ))
    }
}

/// State of an exec as reported by one inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecExit {
    /// Finished with this exit code.
    Exited(i64),
    /// Still running; inspect again later.
    Running,
}

/// Reads one exec inspection.
///
/// A stopped exec without an exit code is an error, never a success.
pub(crate) fn exec_exit(target: &str, running: Option<bool>, exit_code: Option<i64>) -> Result<ExecExit> {
    match (running, exit_code) {
        (Some(true), _) => Ok(ExecExit::Running),
        (_, Some(code)) => Ok(ExecExit::Exited(code)),
        (_, None) => Err(BerthError::runtime("exec", target, "daemon reported no exit code")),
    }
}

impl From<RegistryCredentials> for DockerCredentials {
    fn from(creds: RegistryCredentials) -> Self {
        Self {
            username: creds.username,
            password: creds.password,
            serveraddress: creds.serveraddress,
            registrytoken: creds.registrytoken,
            ..Default::default()
        }
    }
}

/// Re-encodes typed daemon messages as JSON lines, each through `encode`.
fn json_lines<S, T, F>(stream: S, encode: F) -> ByteStream
where
    S: futures::Stream<Item = std::result::Result<T, bollard::errors::Error>> + Send + 'static,
    F: Fn(T) -> serde_json::Result<serde_json::Value> + Send + 'static,
{
    stream
        .map(move |item| -> std::io::Result<Bytes> {
            let value = encode(item.map_err(std::io::Error::other)?).map_err(std::io::Error::other)?;
            let mut line = serde_json::to_vec(&value).map_err(std::io::Error::other)?;
            line.push(b'\n');
            Ok(Bytes::from(line))
        })
        .boxed()
}

/// Build stream that owns its client.
///
/// bollard's build stream borrows the client, so a task drives it and
/// forwards each message through a channel.
fn owned_build_stream(
    docker: Docker,
    options: BuildImageOptions<String>,
    context: Bytes,
) -> futures::channel::mpsc::UnboundedReceiver<std::result::Result<BuildInfo, bollard::errors::Error>> {
    let (tx, rx) = futures::channel::mpsc::unbounded();
    let _driver = tokio::spawn(async move {
        let mut build = std::pin::pin!(docker.build_image(options, None, Some(context)));
        while let Some(item) = build.next().await {
            if tx.unbounded_send(item).is_err() {
                tracing::debug!("build stream consumer dropped, stopping build forwarding");
                break;
            }
        }
    });
    rx
}

/// Wire form of a build message; bollard's `BuildInfo` only deserializes.
#[allow(clippy::unnecessary_wraps)]
fn build_info_value(info: BuildInfo) -> serde_json::Result<serde_json::Value> {
    Ok(serde_json::json!({
        "id": info.id,
        "stream": info.stream,
        "status": info.status,
        "progress": info.progress,
        "error": info.error,
        "errorDetail": info.error_detail.map(|d| serde_json::json!({ "message": d.message })),
        "aux": info.aux.map(|aux| serde_json::json!({ "ID": aux.id })),
    }))
}

fn error_line(message: &str) -> std::io::Result<Bytes> {
    let mut line = serde_json::to_vec(&serde_json::json!({ "error": message }))
        .map_err(std::io::Error::other)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

fn stream_line(message: &str) -> std::io::Result<Bytes> {
    let mut line = serde_json::to_vec(&serde_json::json!({ "stream": message }))
        .map_err(std::io::Error::other)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

/// Splits `registry/repo:tag` into `(registry/repo, tag)`.
fn split_tag(tag: &str) -> (&str, &str) {
    match tag.rfind(':') {
        Some(pos) if !tag[pos + 1..].contains('/') => (&tag[..pos], &tag[pos + 1..]),
        _ => (tag, "latest"),
    }
}

#[async_trait]
impl ContainerApi for DockerApi {
    async fn list_containers(&self, label_key: &str, label_value: &str) -> Result<Vec<ContainerId>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{label_key}={label_value}")],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| BerthError::runtime("list containers", label_value, e))?;
        Ok(containers
            .into_iter()
            .filter_map(|c| c.id.map(ContainerId::new))
            .collect())
    }

    async fn create_container(&self, spec: &CreateSpec) -> Result<ContainerId> {
        let config = Config::<String> {
            image: Some(spec.image.clone()),
            labels: Some(spec.labels.clone()),
            cmd: Some(spec.command.clone()),
            entrypoint: Some(Vec::new()),
            env: Some(spec.env.clone()),
            host_config: Some(HostConfig {
                network_mode: Some("default".to_string()),
                privileged: Some(spec.privileged),
                binds: Some(spec.binds.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| BerthError::runtime("create", &spec.name, e))?;
        for warning in created.warnings {
            tracing::warn!(container = %created.id, warning = %warning, "runtime warning on create");
        }
        Ok(ContainerId::new(created.id))
    }

    async fn start_container(&self, id: &ContainerId) -> Result<()> {
        self.docker
            .start_container(id.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| BerthError::runtime("start", id.as_str(), e))
    }

    async fn stop_container(&self, id: &ContainerId, grace: Duration) -> Result<()> {
        let t = i64::try_from(grace.as_secs()).unwrap_or(i64::MAX);
        self.docker
            .stop_container(id.as_str(), Some(StopContainerOptions { t }))
            .await
            .map_err(|e| BerthError::runtime("stop", id.as_str(), e))
    }

    async fn kill_container(&self, id: &ContainerId) -> Result<()> {
        self.docker
            .kill_container(id.as_str(), Some(KillContainerOptions { signal: "KILL" }))
            .await
            .map_err(|e| BerthError::runtime("kill", id.as_str(), e))
    }

    async fn remove_container(&self, id: &ContainerId) -> Result<()> {
        self.docker
            .remove_container(
                id.as_str(),
                Some(RemoveContainerOptions {
                    v: true,
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| BerthError::runtime("remove", id.as_str(), e))
    }

    async fn list_images(&self, reference: &str) -> Result<Vec<String>> {
        let filters = HashMap::from([("reference".to_string(), vec![reference.to_string()])]);
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| BerthError::runtime("list images", reference, e))?;
        Ok(images.into_iter().map(|i| i.id).collect())
    }

    fn pull_image(&self, reference: &str, credentials: Option<RegistryCredentials>) -> ByteStream {
        let options = CreateImageOptions::<String> {
            from_image: reference.to_string(),
            ..Default::default()
        };
        json_lines(
            self.docker
                .create_image(Some(options), None, credentials.map(DockerCredentials::from)),
            serde_json::to_value,
        )
    }

    fn build_image(&self, spec: BuildSpec, context: Vec<u8>) -> ByteStream {
        let mut tags = spec.tags.into_iter();
        let primary = tags.next().unwrap_or_default();
        let extra: Vec<String> = tags.collect();
        let options = BuildImageOptions::<String> {
            dockerfile: spec.dockerfile,
            t: primary,
            nocache: spec.no_cache,
            pull: spec.pull,
            rm: true,
            buildargs: spec.build_args,
            ..Default::default()
        };

        // Tags beyond the first are applied once the build reports its id.
        let built: Arc<Mutex<(Option<String>, bool)>> = Arc::new(Mutex::new((None, false)));
        let observer = Arc::clone(&built);
        let build = owned_build_stream(self.docker.clone(), options, Bytes::from(context))
            .inspect_ok(move |info| {
                if let Ok(mut state) = observer.lock() {
                    if let Some(id) = info.aux.as_ref().and_then(|aux| aux.id.clone()) {
                        state.0 = Some(id);
                    }
                    if info.error.is_some() {
                        state.1 = true;
                    }
                }
            });

        let docker = self.docker.clone();
        let tagging = futures::stream::once(async move {
            let (image, failed) = built.lock().map(|s| s.clone()).unwrap_or((None, true));
            let mut lines = Vec::new();
            if failed || extra.is_empty() {
                return lines;
            }
            let Some(image) = image else {
                lines.push(error_line("build reported no image id, cannot apply extra tags"));
                return lines;
            };
            for tag in extra {
                let (repo, version) = split_tag(&tag);
                let options = TagImageOptions { repo, tag: version };
                match docker.tag_image(&image, Some(options)).await {
                    Ok(()) => lines.push(stream_line(&format!("Successfully tagged {tag}\n"))),
                    Err(e) => lines.push(error_line(&format!("tagging {tag}: {e}"))),
                }
            }
            lines
        })
        .flat_map(futures::stream::iter);

        json_lines(build, build_info_value).chain(tagging).boxed()
    }

    fn push_image(&self, tag: &str, credentials: Option<RegistryCredentials>) -> ByteStream {
        let (repo, version) = split_tag(tag);
        let options = PushImageOptions::<String> {
            tag: version.to_string(),
        };
        json_lines(
            self.docker
                .push_image(repo, Some(options), credentials.map(DockerCredentials::from)),
            serde_json::to_value,
        )
    }

    async fn exec(&self, spec: &ExecSpec, io: ExecIo) -> Result<i64> {
        let ExecIo {
            mut stdout,
            mut stderr,
            stdin,
        } = io;
        self.run_exec(spec, stdout.as_mut(), stderr.as_mut(), stdin).await
    }

    async fn upload_archive(&self, id: &ContainerId, path: &str, archive: Vec<u8>) -> Result<()> {
        self.docker
            .upload_to_container(
                id.as_str(),
                Some(UploadToContainerOptions {
                    path: path.to_string(),
                    ..Default::default()
                }),
                Bytes::from(archive),
            )
            .await
            .map_err(|e| BerthError::runtime("upload", format!("{id}:{path}"), e))
    }

    async fn download_archive(&self, id: &ContainerId, path: &str) -> Result<Vec<u8>> {
        let chunks: Vec<Bytes> = self
            .docker
            .download_from_container(
                id.as_str(),
                Some(DownloadFromContainerOptions {
                    path: path.to_string(),
                }),
            )
            .try_collect()
            .await
            .map_err(|e| BerthError::runtime("download", format!("{id}:{path}"), e))?;
        Ok(chunks.concat())
    }

    async fn stat_path(&self, id: &ContainerId, path: &str) -> Result<PathStat> {
        let spec = ExecSpec {
            container: id.clone(),
            command: vec![
                "/bin/sh".into(),
                "-c".into(),
                STAT_SCRIPT.into(),
                "stat".into(),
                path.into(),
            ],
            user: Some("root".into()),
            working_dir: None,
            privileged: false,
            tty: false,
        };
        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = self.run_exec(&spec, &mut out, &mut err, None).await?;
        if code != 0 {
            return Err(BerthError::runtime(
                "stat",
                format!("{id}:{path}"),
                format!("exit code {code}: {}", String::from_utf8_lossy(&err).trim()),
            ));
        }
        let text = String::from_utf8_lossy(&out);
        let mut lines = text.lines();
        let kind = lines.next().unwrap_or_default();
        Ok(PathStat {
            is_dir: kind == "dir",
            is_symlink: kind == "link",
            link_target: (kind == "link")
                .then(|| lines.next().unwrap_or_default().to_string())
                .filter(|t| !t.is_empty()),
        })
    }

    async fn changes(&self, id: &ContainerId) -> Result<Vec<String>> {
        let changes = self
            .docker
            .container_changes(id.as_str())
            .await
            .map_err(|e| BerthError::runtime("diff", id.as_str(), e))?;
        Ok(changes
            .unwrap_or_default()
            .into_iter()
            .map(|c| c.path)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_tag_handles_registry_ports() {
        assert_eq!(split_tag("localhost:5000/app:v1"), ("localhost:5000/app", "v1"));
        assert_eq!(split_tag("localhost:5000/app"), ("localhost:5000/app", "latest"));
        assert_eq!(split_tag("alpine"), ("alpine", "latest"));
    }

    #[test]
    fn credentials_convert_to_bollard() {
        let creds = RegistryCredentials {
            username: Some("bob".into()),
            password: Some("pw".into()),
            serveraddress: Some("ghcr.io".into()),
            registrytoken: None,
        };
        let docker: DockerCredentials = creds.into();
        assert_eq!(docker.username.as_deref(), Some("bob"));
        assert_eq!(docker.serveraddress.as_deref(), Some("ghcr.io"));
        assert!(docker.registrytoken.is_none());
    }

    #[tokio::test]
    async fn json_lines_reencodes_and_maps_errors() {
        #[derive(serde::Serialize)]
        struct Msg {
            status: &'static str,
        }
        let items: Vec<std::result::Result<Msg, bollard::errors::Error>> = vec![
            Ok(Msg { status: "one" }),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 500,
                message: "boom".into(),
            }),
        ];
        let out: Vec<std::io::Result<Bytes>> =
            json_lines(futures::stream::iter(items), serde_json::to_value).collect().await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().expect("line").as_ref(), b"{\"status\":\"one\"}\n");
        assert!(out[1].is_err());
    }

    #[tokio::test]
    async fn build_messages_decode_like_daemon_lines() {
        let items: Vec<std::result::Result<BuildInfo, bollard::errors::Error>> = vec![
            Ok(BuildInfo {
                stream: Some("Step 1/2 : FROM alpine\n".into()),
                ..Default::default()
            }),
            Ok(BuildInfo {
                error: Some("no space left".into()),
                error_detail: Some(bollard::models::ErrorDetail {
                    code: None,
                    message: Some("no space left on device".into()),
                }),
                ..Default::default()
            }),
        ];
        let out: Vec<std::io::Result<Bytes>> =
            json_lines(futures::stream::iter(items), build_info_value).collect().await;
        let events: Vec<_> = out
            .iter()
            .map(|line| {
                let line = String::from_utf8(line.as_ref().expect("line").to_vec()).expect("utf8");
                crate::stream::decode_line(&line).expect("event")
            })
            .collect();
        assert!(matches!(
            &events[0],
            crate::stream::ContainerEvent::Progress { message } if message.contains("FROM alpine")
        ));
        assert!(matches!(&events[1], crate::stream::ContainerEvent::Error { .. }), "{:?}", events[1]);
    }

    #[test]
    fn stopped_exec_without_exit_code_is_an_error() {
        assert_eq!(exec_exit("c1", Some(false), Some(3)).expect("exited"), ExecExit::Exited(3));
        assert_eq!(exec_exit("c1", None, Some(0)).expect("exited"), ExecExit::Exited(0));
        assert_eq!(exec_exit("c1", Some(true), None).expect("running"), ExecExit::Running);

        let err = exec_exit("c1", Some(false), None).expect_err("no exit code");
        assert!(
            matches!(&err, BerthError::Runtime { operation: "exec", target, .. } if target == "c1"),
            "{err}"
        );
        assert!(exec_exit("c1", None, None).is_err());
    }
}
