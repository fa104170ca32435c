//! Registry credential resolution.
//!
//! Credentials come from the Docker client configuration already present
//! on the machine: per-registry credential helpers, inline `auths` entries,
//! then the global `credsStore` helper. Only two stored shapes are
//! accepted, a `Basic` user/password pair and an opaque `Bearer` registry
//! token; everything else is rejected.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use serde::Deserialize;

use berth_common::constants::{CREDENTIAL_HELPER_PREFIX, DOCKER_HUB_REGISTRY, DOCKER_HUB_SERVER_URL, is_docker_hub};
use berth_common::error::{BerthError, Result};
use berth_core::api::RegistryCredentials;

use crate::reference::ImageReference;

/// Source of stored registry authorizations.
pub trait CredentialStore: Send + Sync {
    /// Returns the stored authorization for `registry` as an HTTP
    /// `Authorization` value (`Basic ...` or `Bearer ...`), or `None` when
    /// nothing is configured for that host.
    ///
    /// # Errors
    ///
    /// Returns an error if the store exists but cannot be read.
    fn authorization(&self, registry: &str) -> Result<Option<String>>;
}

/// Normalises a registry host or server URL for lookups.
pub fn normalize_registry(registry: &str) -> String {
    let lowered = registry.trim().to_lowercase();
    let without_scheme = lowered
        .strip_prefix("https://")
        .or_else(|| lowered.strip_prefix("http://"))
        .unwrap_or(&lowered);
    let host = without_scheme.split('/').next().unwrap_or_default();
    if is_docker_hub(host) {
        DOCKER_HUB_REGISTRY.to_string()
    } else {
        host.to_string()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    #[serde(default)]
    creds_store: Option<String>,
    #[serde(default)]
    cred_helpers: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    registrytoken: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelperReply {
    username: String,
    secret: String,
}

/// Credential store backed by `config.json` and `docker-credential-*` helpers.
#[derive(Debug, Clone)]
pub struct DockerConfigStore {
    path: PathBuf,
}

impl DockerConfigStore {
    /// Creates a store reading the config file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the config file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<DockerConfigFile> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| BerthError::Config {
                message: format!("{}: {e}", self.path.display()),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DockerConfigFile::default()),
            Err(e) => Err(BerthError::io(&self.path, e)),
        }
    }

    fn from_entry(registry: &str, entry: &AuthEntry) -> Result<Option<String>> {
        if let Some(auth) = entry.auth.as_deref().filter(|a| !a.is_empty()) {
            return Ok(Some(format!("Basic {auth}")));
        }
        if let (Some(user), Some(pass)) = (&entry.username, &entry.password) {
            return Ok(Some(format!("Basic {}", STANDARD.encode(format!("{user}:{pass}")))));
        }
        if let Some(token) = entry.registrytoken.as_deref().filter(|t| !t.is_empty()) {
            return Ok(Some(format!("Bearer {token}")));
        }
        if entry.identitytoken.as_deref().is_some_and(|t| !t.is_empty()) {
            return Err(BerthError::Credential {
                registry: registry.to_string(),
                message: "identity tokens are not supported".into(),
            });
        }
        Ok(None)
    }

    fn from_helper(helper: &str, registry: &str) -> Result<Option<String>> {
        let binary = format!("{CREDENTIAL_HELPER_PREFIX}{helper}");
        let helper_err = |message: String| BerthError::Credential {
            registry: registry.to_string(),
            message,
        };
        let path = which::which(&binary).map_err(|e| helper_err(format!("{binary}: {e}")))?;
        let server = if registry == DOCKER_HUB_REGISTRY {
            DOCKER_HUB_SERVER_URL
        } else {
            registry
        };

        tracing::debug!(helper = %binary, registry, "querying credential helper");
        let mut child = Command::new(&path)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BerthError::io(&path, e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(server.as_bytes())
                .map_err(|e| BerthError::io(&path, e))?;
        }
        let output = child.wait_with_output().map_err(|e| BerthError::io(&path, e))?;

        if !output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout).to_string()
                + &String::from_utf8_lossy(&output.stderr);
            if text.contains("credentials not found") {
                return Ok(None);
            }
            return Err(helper_err(format!("{binary} failed: {}", text.trim())));
        }

        let reply: HelperReply = serde_json::from_slice(&output.stdout)
            .map_err(|e| helper_err(format!("{binary} returned invalid output: {e}")))?;
        if reply.username == "<token>" {
            return Err(helper_err("identity tokens are not supported".into()));
        }
        let pair = format!("{}:{}", reply.username, reply.secret);
        Ok(Some(format!("Basic {}", STANDARD.encode(pair))))
    }
}

impl CredentialStore for DockerConfigStore {
    fn authorization(&self, registry: &str) -> Result<Option<String>> {
        let registry = normalize_registry(registry);
        let config = self.load()?;

        if let Some(helper) = config
            .cred_helpers
            .iter()
            .find(|(host, _)| normalize_registry(host) == registry)
            .map(|(_, helper)| helper)
        {
            return Self::from_helper(helper, &registry);
        }

        if let Some(entry) = config
            .auths
            .iter()
            .find(|(host, _)| normalize_registry(host) == registry)
            .map(|(_, entry)| entry)
        {
            if let Some(header) = Self::from_entry(&registry, entry)? {
                return Ok(Some(header));
            }
        }

        match config.creds_store.as_deref().filter(|s| !s.is_empty()) {
            Some(store) => Self::from_helper(store, &registry),
            None => Ok(None),
        }
    }
}

/// Credentials resolved for one registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    /// Normalised registry host.
    pub registry: String,
    /// Base64url-encoded auth-config JSON, `None` for anonymous access.
    pub auth_header: Option<String>,
    /// Decoded credentials handed to the runtime, `None` for anonymous access.
    pub credentials: Option<RegistryCredentials>,
}

impl RegistryAuth {
    /// Whether no credentials are configured for the registry.
    pub const fn is_anonymous(&self) -> bool {
        self.credentials.is_none()
    }
}

fn finish_lookup(
    target: &str,
    joined: std::result::Result<Result<RegistryAuth>, tokio::task::JoinError>,
) -> Result<RegistryAuth> {
    joined.map_err(|e| BerthError::Credential {
        registry: target.to_string(),
        message: format!("credential lookup did not finish: {e}"),
    })?
}

/// Turns stored authorizations into transport-ready registry auth.
#[derive(Clone)]
pub struct AuthResolver {
    store: Arc<dyn CredentialStore>,
}

impl std::fmt::Debug for AuthResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthResolver").finish_non_exhaustive()
    }
}

impl AuthResolver {
    /// Creates a resolver over `store`.
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Resolver over the Docker client config at `config_file`.
    pub fn from_docker_config(config_file: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(DockerConfigStore::new(config_file)))
    }

    /// Resolves credentials for the registry `reference` points at.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Parse`] for an invalid reference and
    /// [`BerthError::Credential`] if the stored credential cannot be read,
    /// decoded, or uses an unsupported scheme.
    pub fn resolve_auth(&self, reference: &str) -> Result<RegistryAuth> {
        let parsed = ImageReference::parse(reference)?;
        self.resolve_registry(&parsed.registry)
    }

    /// [`AuthResolver::resolve_auth`] on the blocking pool.
    ///
    /// Credential helpers run as child processes, so async callers resolve
    /// through here.
    ///
    /// # Errors
    ///
    /// Same as [`AuthResolver::resolve_auth`].
    pub async fn resolve_auth_async(&self, reference: &str) -> Result<RegistryAuth> {
        let resolver = self.clone();
        let owned = reference.to_string();
        let joined = tokio::task::spawn_blocking(move || resolver.resolve_auth(&owned)).await;
        finish_lookup(reference, joined)
    }

    /// [`AuthResolver::resolve_registry`] on the blocking pool.
    ///
    /// # Errors
    ///
    /// Same as [`AuthResolver::resolve_registry`].
    pub async fn resolve_registry_async(&self, registry: &str) -> Result<RegistryAuth> {
        let resolver = self.clone();
        let owned = registry.to_string();
        let joined = tokio::task::spawn_blocking(move || resolver.resolve_registry(&owned)).await;
        finish_lookup(registry, joined)
    }

    /// Resolves credentials for a registry host.
    ///
    /// # Errors
    ///
    /// Same as [`AuthResolver::resolve_auth`], minus parsing.
    pub fn resolve_registry(&self, registry: &str) -> Result<RegistryAuth> {
        let registry = normalize_registry(registry);
        let credential_err = |message: String| BerthError::Credential {
            registry: registry.clone(),
            message,
        };

        let Some(header) = self.store.authorization(&registry).map_err(|e| match e {
            BerthError::Credential { .. } => e,
            other => credential_err(other.to_string()),
        })?
        else {
            tracing::info!(registry = %registry, "no stored credentials, using anonymous access");
            return Ok(RegistryAuth {
                registry,
                auth_header: None,
                credentials: None,
            });
        };

        let credentials = if let Some(encoded) = header.strip_prefix("Basic ") {
            let encoded = encoded.trim();
            let decoded = STANDARD
                .decode(encoded)
                .or_else(|_| URL_SAFE.decode(encoded))
                .map_err(|e| credential_err(format!("undecodable Basic credential: {e}")))?;
            let pair = String::from_utf8(decoded)
                .map_err(|e| credential_err(format!("Basic credential is not UTF-8: {e}")))?;
            let (username, password) = pair
                .split_once(':')
                .ok_or_else(|| credential_err("Basic credential is not user:password".into()))?;
            RegistryCredentials {
                username: Some(username.to_string()),
                password: Some(password.to_string()),
                serveraddress: Some(registry.clone()),
                registrytoken: None,
            }
        } else if let Some(token) = header.strip_prefix("Bearer ") {
            RegistryCredentials {
                serveraddress: Some(registry.clone()),
                registrytoken: Some(token.trim().to_string()),
                ..Default::default()
            }
        } else {
            let scheme = header.split_whitespace().next().unwrap_or_default();
            return Err(credential_err(format!("unsupported auth scheme {scheme:?}")));
        };

        let json = serde_json::to_vec(&credentials)?;
        tracing::debug!(registry = %registry, "resolved registry credentials");
        Ok(RegistryAuth {
            auth_header: Some(URL_SAFE.encode(json)),
            credentials: Some(credentials),
            registry,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct FixedStore(Mutex<HashMap<String, String>>);

    impl FixedStore {
        fn with(entries: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self(Mutex::new(
                entries
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
            )))
        }
    }

    impl CredentialStore for FixedStore {
        fn authorization(&self, registry: &str) -> Result<Option<String>> {
            Ok(self.0.lock().expect("lock").get(registry).cloned())
        }
    }

    fn decode_header(header: &str) -> serde_json::Value {
        let json = URL_SAFE.decode(header).expect("base64url");
        serde_json::from_slice(&json).expect("json")
    }

    #[test]
    fn basic_credentials_are_reencoded_as_auth_config() {
        let basic = format!("Basic {}", STANDARD.encode("alice:pa:ss"));
        let resolver = AuthResolver::new(FixedStore::with(&[("ghcr.io", basic.as_str())]));

        let auth = resolver.resolve_auth("ghcr.io/org/app:v1").expect("resolve");
        let creds = auth.credentials.clone().expect("credentials");
        assert_eq!(creds.username.as_deref(), Some("alice"));
        assert_eq!(creds.password.as_deref(), Some("pa:ss"));

        let value = decode_header(auth.auth_header.as_deref().expect("header"));
        assert_eq!(value["username"], "alice");
        assert_eq!(value["serveraddress"], "ghcr.io");
    }

    #[test]
    fn bearer_token_passes_through() {
        let resolver = AuthResolver::new(FixedStore::with(&[("index.docker.io", "Bearer tok-123")]));
        let auth = resolver.resolve_auth("ubuntu").expect("resolve");
        assert_eq!(auth.registry, "index.docker.io");
        let creds = auth.credentials.expect("credentials");
        assert_eq!(creds.registrytoken.as_deref(), Some("tok-123"));
        assert!(creds.username.is_none());
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let resolver = AuthResolver::new(FixedStore::with(&[("ghcr.io", "Digest realm=x")]));
        let err = resolver.resolve_auth("ghcr.io/org/app").expect_err("should fail");
        assert!(matches!(err, BerthError::Credential { .. }));
    }

    #[test]
    fn undecodable_basic_is_rejected() {
        let resolver = AuthResolver::new(FixedStore::with(&[("ghcr.io", "Basic !!!")]));
        assert!(matches!(
            resolver.resolve_auth("ghcr.io/org/app"),
            Err(BerthError::Credential { .. })
        ));
    }

    #[test]
    fn missing_entry_is_explicitly_anonymous() {
        let resolver = AuthResolver::new(FixedStore::with(&[]));
        let auth = resolver.resolve_auth("quay.io/org/app").expect("resolve");
        assert!(auth.is_anonymous());
        assert!(auth.auth_header.is_none());
    }

    #[test]
    fn invalid_reference_is_a_parse_error() {
        let resolver = AuthResolver::new(FixedStore::with(&[]));
        assert!(matches!(resolver.resolve_auth("Bad Ref"), Err(BerthError::Parse { .. })));
    }

    #[test]
    fn docker_config_auths_are_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        let auth = STANDARD.encode("bob:hunter2");
        std::fs::write(
            &path,
            format!(r#"{{"auths":{{"https://index.docker.io/v1/":{{"auth":"{auth}"}},"ghcr.io":{{"registrytoken":"t0k"}}}}}}"#),
        )
        .expect("write");

        let store = DockerConfigStore::new(&path);
        assert_eq!(
            store.authorization("docker.io").expect("hub"),
            Some(format!("Basic {auth}"))
        );
        assert_eq!(store.authorization("ghcr.io").expect("ghcr"), Some("Bearer t0k".into()));
        assert_eq!(store.authorization("quay.io").expect("quay"), None);
    }

    #[test]
    fn docker_config_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DockerConfigStore::new(dir.path().join("absent.json"));
        assert_eq!(store.authorization("ghcr.io").expect("lookup"), None);
    }

    #[test]
    fn docker_config_malformed_file_is_a_credential_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").expect("write");
        let resolver = AuthResolver::from_docker_config(&path);
        assert!(matches!(
            resolver.resolve_auth("ghcr.io/org/app"),
            Err(BerthError::Credential { .. })
        ));
    }

    #[test]
    fn missing_helper_binary_is_a_credential_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"credHelpers":{"ghcr.io":"berth-test-absent-helper"}}"#)
            .expect("write");
        let resolver = AuthResolver::from_docker_config(&path);
        assert!(matches!(
            resolver.resolve_auth("ghcr.io/org/app"),
            Err(BerthError::Credential { .. })
        ));
    }

    /// Store remembering which thread each lookup ran on.
    #[derive(Default)]
    struct ThreadRecordingStore(Mutex<Vec<std::thread::ThreadId>>);

    impl CredentialStore for ThreadRecordingStore {
        fn authorization(&self, _registry: &str) -> Result<Option<String>> {
            self.0.lock().expect("lock").push(std::thread::current().id());
            Ok(Some("Bearer opaque".into()))
        }
    }

    #[tokio::test]
    async fn async_lookups_leave_the_runtime_thread() {
        let store = Arc::new(ThreadRecordingStore::default());
        let resolver = AuthResolver::new(store.clone());

        let auth = resolver.resolve_auth_async("quay.io/org/app:v1").await.expect("resolve");
        assert_eq!(auth.registry, "quay.io");
        assert_eq!(
            auth.credentials.and_then(|c| c.registrytoken).as_deref(),
            Some("opaque")
        );
        let by_host = resolver.resolve_registry_async("https://quay.io/").await.expect("resolve");
        assert_eq!(by_host.registry, "quay.io");

        let here = std::thread::current().id();
        let seen = store.0.lock().expect("lock");
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|id| *id != here));
    }

    #[tokio::test]
    async fn async_lookup_keeps_parse_errors() {
        let resolver = AuthResolver::new(FixedStore::with(&[]));
        assert!(matches!(
            resolver.resolve_auth_async("Bad Ref").await,
            Err(BerthError::Parse { .. })
        ));
    }

    #[test]
    fn registry_names_normalise() {
        assert_eq!(normalize_registry("https://index.docker.io/v1/"), "index.docker.io");
        assert_eq!(normalize_registry("Docker.IO"), "index.docker.io");
        assert_eq!(normalize_registry("http://localhost:5000"), "localhost:5000");
    }
}
