//! Container runtime abstraction.
//!
//! Every component talks to the runtime through [`ContainerApi`]. One
//! connection is created per process and shared behind an `Arc`; the
//! implementations must therefore be safe for concurrent use.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use berth_common::error::Result;
use berth_common::types::ContainerId;

/// Raw newline-delimited JSON bytes produced by a streaming runtime call.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Input attached to an exec's standard input.
///
/// Shared so consecutive commands of a run can read from the same input.
/// Each exec holds the lock while it runs.
pub type InputSource = Arc<tokio::sync::Mutex<Box<dyn AsyncRead + Send + Unpin>>>;

/// Credentials presented to the runtime for a registry operation.
///
/// Field names follow the runtime's auth-config JSON shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredentials {
    /// Account name for basic authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password for basic authentication.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Registry host the credentials belong to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serveraddress: Option<String>,
    /// Opaque bearer token passed through unchanged.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registrytoken: Option<String>,
}

/// Parameters of a container to create.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateSpec {
    /// Container name.
    pub name: String,
    /// Image reference the container runs.
    pub image: String,
    /// Labels attached to the container.
    pub labels: HashMap<String, String>,
    /// Command replacing the image's default command.
    pub command: Vec<String>,
    /// Environment in `KEY=VALUE` form.
    pub env: Vec<String>,
    /// Bind mounts in `host:container[:ro]` form.
    pub binds: Vec<String>,
    /// Whether the container runs privileged.
    pub privileged: bool,
}

/// Parameters of an image build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSpec {
    /// Dockerfile path relative to the build context root.
    pub dockerfile: String,
    /// Tags to apply to the resulting image, in order.
    pub tags: Vec<String>,
    /// Build-time arguments.
    pub build_args: HashMap<String, String>,
    /// Disable the layer cache.
    pub no_cache: bool,
    /// Always pull the base image.
    pub pull: bool,
}

/// Parameters of a command executed inside a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    /// Target container.
    pub container: ContainerId,
    /// Command argv.
    pub command: Vec<String>,
    /// User to run as, `None` for the image default.
    pub user: Option<String>,
    /// Working directory, `None` for the image default.
    pub working_dir: Option<String>,
    /// Whether the exec runs privileged.
    pub privileged: bool,
    /// Allocate a pseudo terminal.
    pub tty: bool,
}

/// Output sinks and optional input of one exec.
pub struct ExecIo {
    /// Receives the command's standard output.
    pub stdout: Box<dyn Write + Send>,
    /// Receives the command's standard error.
    pub stderr: Box<dyn Write + Send>,
    /// Fed to the command's standard input when present.
    pub stdin: Option<InputSource>,
}

impl std::fmt::Debug for ExecIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecIo")
            .field("stdin", &self.stdin.is_some())
            .finish_non_exhaustive()
    }
}

/// What a path inside a container points at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathStat {
    /// The path is a directory.
    pub is_dir: bool,
    /// The path is a symbolic link.
    pub is_symlink: bool,
    /// Target of the link, as stored (may be relative).
    pub link_target: Option<String>,
}

/// Operations Berth needs from a container runtime.
#[async_trait]
pub trait ContainerApi: Send + Sync {
    /// Lists all containers, running or not, carrying `label_key=label_value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be queried.
    async fn list_containers(&self, label_key: &str, label_value: &str) -> Result<Vec<ContainerId>>;

    /// Creates a container and returns its runtime-assigned identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime refuses the container.
    async fn create_container(&self, spec: &CreateSpec) -> Result<ContainerId>;

    /// Starts a created container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be started.
    async fn start_container(&self, id: &ContainerId) -> Result<()>;

    /// Stops a container, waiting up to `grace` before the runtime kills it.
    ///
    /// # Errors
    ///
    /// Returns an error if the stop request fails.
    async fn stop_container(&self, id: &ContainerId, grace: Duration) -> Result<()>;

    /// Sends `SIGKILL` to a container.
    ///
    /// # Errors
    ///
    /// Returns an error if the kill request fails.
    async fn kill_container(&self, id: &ContainerId) -> Result<()>;

    /// Force-removes a container together with its anonymous volumes.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be removed.
    async fn remove_container(&self, id: &ContainerId) -> Result<()>;

    /// Returns the identifiers of local images matching `reference`.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be queried.
    async fn list_images(&self, reference: &str) -> Result<Vec<String>>;

    /// Starts pulling `reference`; progress arrives as JSON lines.
    fn pull_image(&self, reference: &str, credentials: Option<RegistryCredentials>) -> ByteStream;

    /// Starts building an image from a (gzip) tar build context.
    fn build_image(&self, spec: BuildSpec, context: Vec<u8>) -> ByteStream;

    /// Starts pushing `tag`; progress arrives as JSON lines.
    fn push_image(&self, tag: &str, credentials: Option<RegistryCredentials>) -> ByteStream;

    /// Runs a command to completion and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the exec cannot be created or attached. A
    /// non-zero exit is not an error at this layer.
    async fn exec(&self, spec: &ExecSpec, io: ExecIo) -> Result<i64>;

    /// Extracts a tar archive into `path` inside the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the upload fails.
    async fn upload_archive(&self, id: &ContainerId, path: &str, archive: Vec<u8>) -> Result<()>;

    /// Returns `path` from inside the container as a tar archive.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be archived.
    async fn download_archive(&self, id: &ContainerId, path: &str) -> Result<Vec<u8>>;

    /// Describes `path` inside the container without following links.
    ///
    /// # Errors
    ///
    /// Returns an error if the path cannot be inspected.
    async fn stat_path(&self, id: &ContainerId, path: &str) -> Result<PathStat>;

    /// Returns every path changed since the container was created.
    ///
    /// # Errors
    ///
    /// Returns an error if the diff cannot be computed.
    async fn changes(&self, id: &ContainerId) -> Result<Vec<String>>;
}
