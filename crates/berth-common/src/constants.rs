//! System-wide constants and default paths.

use std::path::PathBuf;

/// Label key attached to every container created by a run.
pub const RUN_LABEL_KEY: &str = "io.berth.run-id";

/// Command that keeps a run container alive between exec calls.
pub const DEFAULT_CONTAINER_COMMAND: &[&str] = &["sleep", "100000"];

/// Path of the container runtime control socket.
pub const RUNTIME_SOCKET_PATH: &str = "/var/run/docker.sock";

/// Seconds a container is given to stop gracefully before it is killed.
pub const DEFAULT_STOP_GRACE_SECS: u64 = 10;

/// Seconds before a registry request is abandoned.
pub const DEFAULT_REGISTRY_TIMEOUT_SECS: u64 = 30;

/// Pattern a username must match before it is used inside a container.
pub const VALID_USERNAME_PATTERN: &str = r"^[a-z_]([a-z0-9_-]{0,31}|[a-z0-9_-]{0,30}\$)$";

/// Canonical Docker Hub registry host used in image names.
pub const DOCKER_HUB_REGISTRY: &str = "index.docker.io";

/// Host serving the Docker Hub registry API.
pub const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// Server URL under which Docker Hub credentials are stored.
pub const DOCKER_HUB_SERVER_URL: &str = "https://index.docker.io/v1/";

/// Tag applied when a reference names neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// File name of the Docker client configuration.
pub const DOCKER_CONFIG_FILE: &str = "config.json";

/// Prefix of Docker credential helper binaries.
pub const CREDENTIAL_HELPER_PREFIX: &str = "docker-credential-";

/// Application name used in CLI output.
pub const APP_NAME: &str = "berth";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "berth";

/// Returns whether `host` is one of the Docker Hub aliases.
pub fn is_docker_hub(host: &str) -> bool {
    matches!(
        host,
        "docker.io" | "index.docker.io" | "registry-1.docker.io" | "registry.hub.docker.com"
    )
}

/// Returns the Docker client configuration directory.
///
/// Honours `DOCKER_CONFIG`, then falls back to `$HOME/.docker`.
pub fn docker_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DOCKER_CONFIG") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_or_else(|_| PathBuf::from(".docker"), |home| PathBuf::from(home).join(".docker"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_hub_aliases_are_recognised() {
        assert!(is_docker_hub("docker.io"));
        assert!(is_docker_hub("index.docker.io"));
        assert!(is_docker_hub("registry-1.docker.io"));
        assert!(!is_docker_hub("ghcr.io"));
    }

    #[test]
    fn default_command_sleeps() {
        assert_eq!(DEFAULT_CONTAINER_COMMAND[0], "sleep");
    }
}
