//! The ephemeral container lifecycle of one run.
//!
//! `destroy(pre) → pull if missing → create → start → provision user →
//! [copy in] → exec each → [copy out] → teardown`, where the bracketed
//! steps only happen when Berth is nested inside a container. Teardown
//! runs on every exit path of [`Run::run`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use berth_common::config::BerthConfig;
use berth_common::constants::{DEFAULT_CONTAINER_COMMAND, RUNTIME_SOCKET_PATH};
use berth_common::error::{BerthError, Result};
use berth_common::types::{ContainerId, RunId};
use berth_core::api::{ContainerApi, CreateSpec};
use berth_core::stream::{ContainerEvent, EventSession};
use berth_image::auth::AuthResolver;
use berth_image::reference::ImageReference;

use crate::context::RunContext;
use crate::exec::{CommandKind, exec_command, valid_username};
use crate::probe::{CgroupProbe, EnvironmentProbe};
use crate::sync::{copy_from_container, copy_to_container, copy_volumes_from_container};
use crate::teardown::{teardown_by_label, teardown_container};
use crate::volume::Volume;

/// Exit status of one executed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStatus {
    /// Command text as submitted.
    pub command: String,
    /// Exit code reported by the runtime.
    pub exit_code: i64,
}

/// Outcome of a successful [`Run::run`].
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Identifier of the run.
    pub run_id: RunId,
    /// Container the commands ran in, already removed.
    pub container: ContainerId,
    /// Image reference the container ran.
    pub image: String,
    /// Whether volumes were copied instead of bind-mounted.
    pub nested: bool,
    /// Every executed command, in order.
    pub commands: Vec<CommandStatus>,
    /// Host paths written by copy-back.
    pub copied_back: Vec<PathBuf>,
    /// When the run began.
    pub started_at: DateTime<Utc>,
    /// When teardown finished.
    pub finished_at: DateTime<Utc>,
}

/// One ephemeral container invocation.
///
/// The container identifier is set by a successful create and cleared by
/// teardown; every runtime operation of the run requires it.
pub struct Run {
    id: RunId,
    image: String,
    volumes: Vec<Volume>,
    env: Vec<String>,
    container: Option<ContainerId>,
    nested: Option<bool>,
    api: Arc<dyn ContainerApi>,
    probe: Arc<dyn EnvironmentProbe>,
    auth: AuthResolver,
    label_key: String,
    stop_grace: Duration,
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.id)
            .field("image", &self.image)
            .field("volumes", &self.volumes)
            .field("container", &self.container)
            .field("nested", &self.nested)
            .finish_non_exhaustive()
    }
}

impl Run {
    /// Creates a run of `image` with a generated identifier.
    ///
    /// Credentials for pulling come from the Docker client config named by
    /// `config`; nesting is probed from process metadata.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Parse`] if `image` is not a valid reference.
    pub fn new(api: Arc<dyn ContainerApi>, image: &str, config: &BerthConfig) -> Result<Self> {
        let _ = ImageReference::parse(image)?;
        Ok(Self {
            id: RunId::generate(),
            image: image.trim().to_string(),
            volumes: Vec::new(),
            env: Vec::new(),
            container: None,
            nested: None,
            api,
            probe: Arc::new(CgroupProbe::default()),
            auth: AuthResolver::from_docker_config(config.docker_config_file()),
            label_key: config.label_key.clone(),
            stop_grace: Duration::from_secs(config.stop_grace_secs),
        })
    }

    /// Uses `id` instead of a generated identifier.
    #[must_use]
    pub fn with_id(mut self, id: RunId) -> Self {
        self.id = id;
        self
    }

    /// Declares the volumes of the run.
    #[must_use]
    pub fn with_volumes(mut self, volumes: Vec<Volume>) -> Self {
        self.volumes = volumes;
        self
    }

    /// Declares the container environment in `KEY=VALUE` form.
    #[must_use]
    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    /// Replaces the nesting probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn EnvironmentProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Replaces the registry auth resolver used for pulls.
    #[must_use]
    pub fn with_auth(mut self, auth: AuthResolver) -> Self {
        self.auth = auth;
        self
    }

    /// Identifier of the run.
    pub const fn id(&self) -> &RunId {
        &self.id
    }

    /// Container of the run, while it exists.
    pub const fn container(&self) -> Option<&ContainerId> {
        self.container.as_ref()
    }

    fn is_nested(&mut self) -> bool {
        *self.nested.get_or_insert_with(|| self.probe.is_nested())
    }

    fn require_container(&self, operation: &'static str) -> Result<&ContainerId> {
        self.container
            .as_ref()
            .ok_or_else(|| BerthError::runtime(operation, self.id.as_str(), "run has no container"))
    }

    /// Runs `commands` one after another in a fresh container.
    ///
    /// Stale containers carrying the run's label are removed first. The
    /// container is torn down whether the run succeeds or fails; a
    /// teardown error never replaces the run's own error.
    ///
    /// # Errors
    ///
    /// Returns the first failing step: pull, create, start, provisioning,
    /// copy, a non-zero command exit, or teardown.
    pub async fn run(&mut self, ctx: &RunContext, commands: &[String]) -> Result<RunReport> {
        let started_at = Utc::now();
        tracing::info!(run_id = %self.id, image = %self.image, commands = commands.len(), "run starting");

        let outcome = self.run_steps(ctx, commands).await;
        let teardown = self.teardown().await;

        match (outcome, teardown) {
            (Ok((container, statuses, copied_back)), Ok(())) => {
                tracing::info!(run_id = %self.id, "run finished");
                Ok(RunReport {
                    run_id: self.id.clone(),
                    container,
                    image: self.image.clone(),
                    nested: self.nested.unwrap_or(false),
                    commands: statuses,
                    copied_back,
                    started_at,
                    finished_at: Utc::now(),
                })
            }
            (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown_err)) => {
                tracing::warn!(run_id = %self.id, error = %teardown_err, "teardown after failed run also failed");
                Err(e)
            }
        }
    }

    async fn run_steps(
        &mut self,
        ctx: &RunContext,
        commands: &[String],
    ) -> Result<(ContainerId, Vec<CommandStatus>, Vec<PathBuf>)> {
        let container = self.start(ctx).await?;
        let statuses = self.exec(ctx, commands).await?;
        let copied_back = if self.is_nested() {
            self.copy_back(ctx).await?
        } else {
            Vec::new()
        };
        Ok((container, statuses, copied_back))
    }

    /// Brings the run's container up, ready for commands.
    ///
    /// Sweeps stale containers, pulls the image if it is missing, creates
    /// and starts the container, provisions the user, and copies volumes
    /// in when nested. The caller owns teardown after this returns,
    /// successfully or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the run already has a container or any step
    /// fails.
    pub async fn start(&mut self, ctx: &RunContext) -> Result<ContainerId> {
        if let Some(existing) = &self.container {
            return Err(BerthError::runtime("create", self.id.as_str(), format!("run already owns container {existing}")));
        }
        let _ = self.destroy().await?;
        let nested = self.is_nested();

        self.pull_if_missing(ctx).await?;

        let mut binds = Vec::new();
        if ctx.docker_in_docker {
            binds.push(format!("{RUNTIME_SOCKET_PATH}:{RUNTIME_SOCKET_PATH}"));
        }
        if !nested {
            for volume in &self.volumes {
                let host = std::path::absolute(&volume.host_path).map_err(|e| BerthError::io(&volume.host_path, e))?;
                binds.push(Volume { host_path: host, ..volume.clone() }.bind());
            }
        }
        let spec = CreateSpec {
            name: self.id.to_string(),
            image: self.image.clone(),
            labels: HashMap::from([(self.label_key.clone(), self.id.to_string())]),
            command: DEFAULT_CONTAINER_COMMAND.iter().map(ToString::to_string).collect(),
            env: self.env.clone(),
            binds,
            privileged: ctx.privileged,
        };
        let container = self.api.create_container(&spec).await?;
        tracing::info!(run_id = %self.id, container = %container, nested, "container created");
        self.container = Some(container.clone());

        self.api.start_container(&container).await?;
        self.provision_user(&container, ctx).await?;

        if nested {
            for volume in &self.volumes {
                copy_to_container(self.api.as_ref(), &container, ctx, volume).await?;
            }
        }
        Ok(container)
    }

    async fn pull_if_missing(&self, ctx: &RunContext) -> Result<()> {
        if !self.api.list_images(&self.image).await?.is_empty() {
            tracing::debug!(image = %self.image, "image present locally");
            return Ok(());
        }
        let auth = self.auth.resolve_auth_async(&self.image).await?;
        tracing::info!(image = %self.image, registry = %auth.registry, "pulling image");
        let stream = self.api.pull_image(&self.image, auth.credentials);
        let session = EventSession::spawn(vec![(self.image.clone(), stream)]);
        let _ = session
            .subscribe(|item| {
                if let ContainerEvent::Progress { message } = &item.event {
                    if !message.is_empty() {
                        ctx.say(message);
                    }
                }
            })
            .await
            .into_result()?;
        Ok(())
    }

    async fn provision_user(&self, container: &ContainerId, ctx: &RunContext) -> Result<()> {
        let Some(user) = ctx.user.as_deref() else {
            return Ok(());
        };
        if !valid_username(user) {
            tracing::warn!(user, "not provisioning invalid username");
            return Ok(());
        }
        let root = ctx.as_root();
        let api = self.api.as_ref();
        let ensure = format!(
            "id -u {user} >/dev/null 2>&1 || adduser -D {user} >/dev/null 2>&1 || adduser --disabled-password --gecos \"\" {user} >/dev/null 2>&1"
        );
        exec_command(api, container, &root, &ensure, CommandKind::Service).await?;
        if user != "root" {
            let home = format!("mkdir -p /home/{user} && chown -R {user}:{user} /home/{user}");
            exec_command(api, container, &root, &home, CommandKind::Service).await?;
        }
        if ctx.docker_in_docker {
            let socket = format!("chmod +rx {RUNTIME_SOCKET_PATH}");
            exec_command(api, container, &root, &socket, CommandKind::Service).await?;
        }
        tracing::debug!(container = %container, user, "user provisioned");
        Ok(())
    }

    /// Executes `commands` in order, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Command`] for the first non-zero exit; later
    /// commands are not run.
    pub async fn exec(&self, ctx: &RunContext, commands: &[String]) -> Result<Vec<CommandStatus>> {
        let container = self.require_container("exec")?;
        let mut statuses = Vec::with_capacity(commands.len());
        for command in commands {
            exec_command(self.api.as_ref(), container, ctx, command, CommandKind::User).await?;
            statuses.push(CommandStatus {
                command: command.trim().to_string(),
                exit_code: 0,
            });
        }
        Ok(statuses)
    }

    /// Copies changed direct children of read-write volumes to the host.
    ///
    /// # Errors
    ///
    /// Returns an error if the diff or any copy fails.
    pub async fn copy_back(&self, ctx: &RunContext) -> Result<Vec<PathBuf>> {
        let container = self.require_container("diff")?;
        copy_volumes_from_container(self.api.as_ref(), container, ctx, &self.volumes).await
    }

    /// Copies `container_path` into the host directory `host_dir`, or to
    /// the context's stdout when `host_dir` is `-`.
    ///
    /// # Errors
    ///
    /// Returns an error if the run has no container or the copy fails.
    pub async fn copy_from_container(&self, ctx: &RunContext, container_path: &str, host_dir: &str) -> Result<Vec<PathBuf>> {
        let container = self.require_container("copy")?;
        copy_from_container(self.api.as_ref(), container, ctx, container_path, host_dir).await
    }

    /// Removes the run's own container, or sweeps its label when no
    /// container was recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if removal fails.
    pub async fn teardown(&mut self) -> Result<()> {
        match self.container.take() {
            Some(container) => teardown_container(self.api.as_ref(), &container, self.stop_grace).await,
            None => self.destroy().await.map(|_| ()),
        }
    }

    /// Removes every container carrying the run's label.
    ///
    /// Returns the number of containers removed.
    ///
    /// # Errors
    ///
    /// Returns the first listing or removal error.
    pub async fn destroy(&mut self) -> Result<usize> {
        self.container = None;
        teardown_by_label(Arc::clone(&self.api), &self.label_key, self.id.as_str(), self.stop_grace).await
    }
}
