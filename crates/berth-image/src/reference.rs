//! Image reference parsing.
//!
//! Parses references like `ghcr.io/org/app:v1` or `ubuntu@sha256:...` into
//! structured components. Docker Hub references are normalised to
//! `index.docker.io`, and single-component Hub repositories gain the
//! `library/` prefix. Parsing never touches the network.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use berth_common::constants::{DEFAULT_TAG, DOCKER_HUB_API_HOST, DOCKER_HUB_REGISTRY, is_docker_hub};
use berth_common::error::{BerthError, Result};

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Canonical repository name, `registry/repository`.
    pub name: String,
    /// `name:tag`, or `name@digest` once a digest is known.
    pub reference: String,
    /// Content digest (`algorithm:hex`), when known.
    pub digest: Option<String>,
    /// Registry host, normalised (`index.docker.io` for Docker Hub).
    pub registry: String,
    /// Repository path within the registry.
    pub repository: String,
    /// Tag, if the reference names one (or `latest` by default).
    pub tag: Option<String>,
}

fn pattern(cell: &'static OnceLock<Option<Regex>>, source: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(source).ok()).as_ref()
}

fn matches(cell: &'static OnceLock<Option<Regex>>, source: &str, value: &str) -> bool {
    pattern(cell, source).is_some_and(|re| re.is_match(value))
}

fn valid_tag(tag: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    matches(&RE, r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$", tag)
}

fn valid_digest(digest: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    matches(&RE, r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-fA-F0-9]{32,}$", digest)
}

fn valid_repository(repository: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    repository
        .split('/')
        .all(|c| matches(&RE, r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$", c))
}

fn valid_registry(registry: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    matches(&RE, r"^[A-Za-z0-9](?:[A-Za-z0-9.-]*[A-Za-z0-9])?(?::[0-9]+)?$", registry)
}

fn parse_error(reference: &str, message: impl Into<String>) -> BerthError {
    BerthError::Parse {
        reference: reference.to_string(),
        message: message.into(),
    }
}

/// Splits `name` into registry and repository.
fn split_registry(name: &str) -> (String, String) {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            let registry = if is_docker_hub(first) {
                DOCKER_HUB_REGISTRY.to_string()
            } else {
                first.to_string()
            };
            return (registry, rest.to_string());
        }
    }
    (DOCKER_HUB_REGISTRY.to_string(), name.to_string())
}

impl ImageReference {
    /// Parses a reference string.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Parse`] if the string is not a valid
    /// `name[:tag]` or `name[:tag]@digest` reference.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(parse_error(input, "empty reference"));
        }

        let (name_tag, digest) = match trimmed.split_once('@') {
            Some((base, digest)) => {
                if !valid_digest(digest) {
                    return Err(parse_error(input, format!("invalid digest {digest:?}")));
                }
                (base, Some(digest.to_string()))
            }
            None => (trimmed, None),
        };

        // A colon after the last slash separates the tag; earlier ones belong to a port.
        let last_slash = name_tag.rfind('/').map_or(0, |p| p + 1);
        let (name, tag) = match name_tag[last_slash..].rfind(':') {
            Some(colon) => {
                let split = last_slash + colon;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if let Some(tag) = &tag {
            if !valid_tag(tag) {
                return Err(parse_error(input, format!("invalid tag {tag:?}")));
            }
        }

        let (registry, mut repository) = split_registry(name);
        if !valid_registry(&registry) {
            return Err(parse_error(input, format!("invalid registry {registry:?}")));
        }
        if repository.is_empty() || !valid_repository(&repository) {
            return Err(parse_error(input, format!("invalid repository {repository:?}")));
        }
        if registry == DOCKER_HUB_REGISTRY && !repository.contains('/') {
            repository = format!("library/{repository}");
        }

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };
        let name = format!("{registry}/{repository}");
        let reference = match (&digest, &tag) {
            (Some(d), _) => format!("{name}@{d}"),
            (None, Some(t)) => format!("{name}:{t}"),
            (None, None) => name.clone(),
        };

        Ok(Self {
            name,
            reference,
            digest,
            registry,
            repository,
            tag,
        })
    }

    /// Returns the canonical repository name of `reference`, without tag or digest.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Parse`] if the reference is invalid.
    pub fn name_of(reference: &str) -> Result<String> {
        Self::parse(reference).map(|r| r.name)
    }

    /// Returns this reference pinned to `digest`, in `name@digest` form.
    #[must_use]
    pub fn with_digest(&self, digest: impl Into<String>) -> Self {
        let digest = digest.into();
        Self {
            reference: format!("{}@{digest}", self.name),
            digest: Some(digest),
            ..self.clone()
        }
    }

    /// Tag or digest used to address the manifest.
    pub fn manifest_reference(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Host serving the registry API for this reference.
    pub fn api_host(&self) -> &str {
        if self.registry == DOCKER_HUB_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }

    /// Whether the registry is reached over plain HTTP.
    pub fn is_insecure(&self) -> bool {
        let host = self
            .registry
            .rsplit_once(':')
            .map_or(self.registry.as_str(), |(h, _)| h);
        host == "localhost" || host == "127.0.0.1"
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reference)
    }
}
