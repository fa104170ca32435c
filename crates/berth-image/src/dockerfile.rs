//! Dockerfile builds and tag pushes.
//!
//! Both operations return an [`EventSession`]: a build has one sub-stream,
//! a push has one per tag. Pre-flight failures are returned before the
//! runtime is contacted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use berth_common::error::{BerthError, Result};
use berth_core::api::{BuildSpec, ContainerApi};
use berth_core::archive::pack_build_context;
use berth_core::stream::EventSession;

use crate::auth::AuthResolver;

/// A Dockerfile together with the tags and build arguments of its image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dockerfile {
    /// Path to the Dockerfile; its directory is the build context.
    pub path: PathBuf,
    /// Tags applied to the built image, and pushed by [`ImageBuilder::push`].
    pub tags: Vec<String>,
    /// Build-time arguments.
    pub args: HashMap<String, String>,
}

impl Dockerfile {
    /// Creates a Dockerfile description with no tags or arguments.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Checks that the file declares at least one base image.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Io`] if the file cannot be read and
    /// [`BerthError::InvalidDockerfile`] if no `FROM` instruction is found.
    pub fn validate(&self) -> Result<()> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| BerthError::io(&self.path, e))?;
        if has_base_image(&text) {
            Ok(())
        } else {
            Err(BerthError::InvalidDockerfile {
                path: self.path.clone(),
            })
        }
    }

    /// Directory packed as the build context.
    pub fn context_dir(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map_or_else(|| "Dockerfile".to_string(), |n| n.to_string_lossy().into_owned())
    }
}

fn has_base_image(text: &str) -> bool {
    text.lines().any(|line| {
        let mut words = line.split_whitespace();
        words.next().is_some_and(|w| w.eq_ignore_ascii_case("FROM")) && words.next().is_some()
    })
}

/// Builds Dockerfiles and pushes their tags through a runtime connection.
#[derive(Clone)]
pub struct ImageBuilder {
    api: Arc<dyn ContainerApi>,
    auth: AuthResolver,
}

impl std::fmt::Debug for ImageBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBuilder").field("auth", &self.auth).finish_non_exhaustive()
    }
}

impl ImageBuilder {
    /// Creates a builder on a shared runtime connection.
    pub fn new(api: Arc<dyn ContainerApi>, auth: AuthResolver) -> Self {
        Self { api, auth }
    }

    /// Validates `dockerfile` and starts building it without cache,
    /// always pulling the base image.
    ///
    /// The returned session expects one end marker; its image id is the
    /// built image.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::InvalidDockerfile`] or an I/O error before the
    /// build starts.
    pub async fn build(&self, dockerfile: &Dockerfile) -> Result<EventSession> {
        dockerfile.validate()?;
        let context_dir = dockerfile.context_dir().to_path_buf();
        tracing::info!(
            dockerfile = %dockerfile.path.display(),
            context = %context_dir.display(),
            tags = ?dockerfile.tags,
            "building image"
        );

        let dir = context_dir.clone();
        let context = tokio::task::spawn_blocking(move || pack_build_context(&dir))
            .await
            .map_err(|e| BerthError::io(&context_dir, std::io::Error::other(e)))??;

        let spec = BuildSpec {
            dockerfile: dockerfile.file_name(),
            tags: dockerfile.tags.clone(),
            build_args: dockerfile.args.clone(),
            no_cache: true,
            pull: true,
        };
        let stream = self.api.build_image(spec, context);
        Ok(EventSession::spawn(vec![("build".to_string(), stream)]))
    }

    /// Pushes every tag, each authenticated for its own registry.
    ///
    /// Events are labelled with the full tag, so the session's tag digests
    /// are keyed by it. The session expects one end marker per tag.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::NoTags`] for an empty tag list, or a parse or
    /// credential error for any tag, before any push starts.
    pub async fn push(&self, tags: &[String]) -> Result<EventSession> {
        if tags.is_empty() {
            return Err(BerthError::NoTags);
        }
        let mut auths = Vec::with_capacity(tags.len());
        for tag in tags {
            auths.push((tag, self.auth.resolve_auth_async(tag).await?));
        }

        let sources = auths
            .into_iter()
            .map(|(tag, auth)| {
                tracing::info!(tag = %tag, registry = %auth.registry, anonymous = auth.is_anonymous(), "pushing tag");
                (tag.clone(), self.api.push_image(tag, auth.credentials))
            })
            .collect();
        Ok(EventSession::spawn(sources))
    }
}
