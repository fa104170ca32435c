//! Remote digest resolution over the registry distribution API.
//!
//! A `HEAD` on the manifest returns its digest in `Docker-Content-Digest`.
//! Registries that answer `401` with a `Bearer` challenge get a token
//! request first; registries that omit the digest header get a `GET` whose
//! body is hashed. Failures are reported once, without retries.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::header::{ACCEPT, AUTHORIZATION, WWW_AUTHENTICATE};
use regex::Regex;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use sha2::{Digest, Sha256};

use berth_common::constants::APP_NAME;
use berth_common::error::{BerthError, FetchFailure, Result};
use berth_core::api::RegistryCredentials;

use crate::auth::AuthResolver;
use crate::reference::ImageReference;

/// Manifest media types accepted when resolving a digest.
const MANIFEST_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.index.v1+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
];

const CONTENT_DIGEST_HEADER: &str = "Docker-Content-Digest";

fn challenge_param_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?P<key>\w+)=(?:"(?P<quoted>[^"]*)"|(?P<bare>[^\s,]+))"#).ok())
        .as_ref()
}

/// Parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Challenge {
    /// `Bearer` or `Basic`.
    pub scheme: String,
    /// Token endpoint for bearer challenges.
    pub realm: Option<String>,
    /// Service the token is issued for.
    pub service: Option<String>,
    /// Requested scope.
    pub scope: Option<String>,
}

impl Challenge {
    /// Parses a `WWW-Authenticate` header value.
    pub fn parse(header: &str) -> Self {
        let header = header.trim();
        let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
        let mut challenge = Self {
            scheme: scheme.to_string(),
            ..Self::default()
        };
        let Some(re) = challenge_param_regex() else {
            return challenge;
        };
        for caps in re.captures_iter(params) {
            let value = caps
                .name("quoted")
                .or_else(|| caps.name("bare"))
                .map_or_else(String::new, |m| m.as_str().to_string());
            match caps["key"].to_ascii_lowercase().as_str() {
                "realm" => challenge.realm = Some(value),
                "service" => challenge.service = Some(value),
                "scope" => challenge.scope = Some(value),
                _ => {}
            }
        }
        challenge
    }
}

/// Client resolving image references to content digests.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: Client,
    auth: AuthResolver,
}

fn fetch_error(image: &ImageReference, kind: FetchFailure, message: impl Into<String>) -> BerthError {
    BerthError::Fetch {
        reference: image.reference.clone(),
        kind,
        message: message.into(),
    }
}

fn classify(image: &ImageReference, status: StatusCode) -> BerthError {
    let kind = match status {
        StatusCode::NOT_FOUND => FetchFailure::NotFound,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FetchFailure::Unauthorized,
        _ => FetchFailure::Registry,
    };
    fetch_error(image, kind, format!("registry answered {status}"))
}

fn with_credentials(request: RequestBuilder, credentials: Option<&RegistryCredentials>) -> RequestBuilder {
    match credentials {
        Some(RegistryCredentials {
            username: Some(user),
            password,
            ..
        }) => request.basic_auth(user, password.as_deref()),
        _ => request,
    }
}

fn http_client(timeout: Duration) -> reqwest::ClientBuilder {
    Client::builder()
        .timeout(timeout)
        .user_agent(format!("{APP_NAME}/{}", env!("CARGO_PKG_VERSION")))
}

impl RegistryClient {
    /// Creates a client with the given request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(auth: AuthResolver, timeout: Duration) -> Result<Self> {
        let http = http_client(timeout)
            .build()
            .map_err(|e| BerthError::Config {
                message: format!("building registry HTTP client: {e}"),
            })?;
        Ok(Self { http, auth })
    }

    /// Parses `reference` and pins it to its current remote digest.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Parse`] for an invalid reference and
    /// [`BerthError::Fetch`] if the registry cannot serve the manifest.
    pub async fn resolve(&self, reference: &str) -> Result<ImageReference> {
        let image = ImageReference::parse(reference)?;
        let digest = self.fetch_digest(&image).await?;
        tracing::info!(reference = %image.reference, digest = %digest, "resolved image digest");
        Ok(image.with_digest(digest))
    }

    /// Fetches the content digest of the manifest `image` points at.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Fetch`] on network failure, rejected
    /// credentials, a missing manifest, or an unexpected answer, and
    /// [`BerthError::Credential`] if stored credentials are unusable.
    pub async fn fetch_digest(&self, image: &ImageReference) -> Result<String> {
        let scheme = if image.is_insecure() { "http" } else { "https" };
        let url = format!(
            "{scheme}://{}/v2/{}/manifests/{}",
            image.api_host(),
            image.repository,
            image.manifest_reference()
        );
        let auth = self.auth.resolve_registry_async(&image.registry).await?;
        let credentials = auth.credentials.as_ref();
        let mut bearer = credentials.and_then(|c| c.registrytoken.clone());

        tracing::debug!(url = %url, "fetching manifest digest");
        let mut response = self.manifest_request(image, &url, bearer.as_deref(), credentials, true).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .map(Challenge::parse);
            match challenge {
                Some(c) if c.scheme.eq_ignore_ascii_case("bearer") => {
                    bearer = Some(self.fetch_token(image, &c, credentials).await?);
                    response = self.manifest_request(image, &url, bearer.as_deref(), None, true).await?;
                }
                Some(c) if c.scheme.eq_ignore_ascii_case("basic") && credentials.is_some() => {
                    response = self.manifest_request(image, &url, None, credentials, true).await?;
                }
                _ => {}
            }
        }

        if !response.status().is_success() {
            return Err(classify(image, response.status()));
        }

        if let Some(digest) = response
            .headers()
            .get(CONTENT_DIGEST_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|d| !d.is_empty())
        {
            return Ok(digest.to_string());
        }

        // No digest header: hash the manifest body as served.
        let response = self.manifest_request(image, &url, bearer.as_deref(), credentials, false).await?;
        if !response.status().is_success() {
            return Err(classify(image, response.status()));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| fetch_error(image, FetchFailure::Network, e.to_string()))?;
        Ok(format!("sha256:{:x}", Sha256::digest(&body)))
    }

    async fn manifest_request(
        &self,
        image: &ImageReference,
        url: &str,
        bearer: Option<&str>,
        credentials: Option<&RegistryCredentials>,
        head: bool,
    ) -> Result<Response> {
        let mut request = if head { self.http.head(url) } else { self.http.get(url) };
        request = request.header(ACCEPT, MANIFEST_MEDIA_TYPES.join(", "));
        request = match bearer {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => with_credentials(request, credentials),
        };
        request
            .send()
            .await
            .map_err(|e| fetch_error(image, FetchFailure::Network, e.to_string()))
    }

    async fn fetch_token(
        &self,
        image: &ImageReference,
        challenge: &Challenge,
        credentials: Option<&RegistryCredentials>,
    ) -> Result<String> {
        let realm = challenge.realm.as_deref().ok_or_else(|| {
            fetch_error(image, FetchFailure::Registry, "bearer challenge without realm")
        })?;
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", image.repository));
        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }

        let request = with_credentials(self.http.get(realm).query(&query), credentials);
        let response = request
            .send()
            .await
            .map_err(|e| fetch_error(image, FetchFailure::Network, e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_error(
                image,
                FetchFailure::Unauthorized,
                format!("token endpoint answered {}", response.status()),
            ));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| fetch_error(image, FetchFailure::Registry, e.to_string()))?;
        json.get("token")
            .or_else(|| json.get("access_token"))
            .and_then(serde_json::Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| fetch_error(image, FetchFailure::Registry, "token response without token"))
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;
    use crate::auth::CredentialStore;

    const MANIFEST_DIGEST: &str =
        "sha256:4c6b0e5f7d1a2b3c4d5e6f708192a3b4c5d6e7f8091a2b3c4d5e6f708192a3b4";

    /// Request head as received, lowercased.
    type Requests = Arc<Mutex<Vec<String>>>;

    /// Serves one HTTP/1.1 answer per connection from `respond`, which gets
    /// the server address and the lowercased request head.
    async fn local_registry<F>(respond: F) -> (SocketAddr, Requests)
    where
        F: Fn(SocketAddr, &str) -> String + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let requests: Requests = Arc::default();
        let seen = Arc::clone(&requests);
        let respond = Arc::new(respond);
        let _server = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let seen = Arc::clone(&seen);
                let respond = Arc::clone(&respond);
                let _conn = tokio::spawn(async move {
                    let mut head = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => head.extend_from_slice(&buf[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&head).to_ascii_lowercase();
                    let answer = respond(addr, &head);
                    seen.lock().expect("requests").push(head);
                    let _ = stream.write_all(answer.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        (addr, requests)
    }

    fn reply(status: &str, headers: &[(&str, &str)], body: &str) -> String {
        let mut text = format!("HTTP/1.1 {status}\r\n");
        for (name, value) in headers {
            text.push_str(&format!("{name}: {value}\r\n"));
        }
        text.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()));
        if !body.is_empty() {
            text.push_str(body);
        }
        text
    }

    /// Anonymous client that reaches loopback directly, whatever proxy the
    /// environment names.
    fn anonymous_client() -> RegistryClient {
        let http = http_client(Duration::from_secs(5))
            .no_proxy()
            .build()
            .expect("client");
        RegistryClient {
            http,
            auth: AuthResolver::new(Arc::new(Anonymous)),
        }
    }

    struct Anonymous;

    impl CredentialStore for Anonymous {
        fn authorization(&self, _registry: &str) -> Result<Option<String>> {
            Ok(None)
        }
    }

    #[test]
    fn bearer_challenge_is_parsed() {
        let c = Challenge::parse(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#,
        );
        assert_eq!(c.scheme, "Bearer");
        assert_eq!(c.realm.as_deref(), Some("https://auth.docker.io/token"));
        assert_eq!(c.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(c.scope.as_deref(), Some("repository:library/nginx:pull"));
    }

    #[test]
    fn quoted_scope_keeps_its_commas() {
        let c = Challenge::parse(
            r#"Bearer realm="https://ghcr.io/token",scope="repository:org/app:pull,push",service=ghcr.io"#,
        );
        assert_eq!(c.scope.as_deref(), Some("repository:org/app:pull,push"));
        assert_eq!(c.service.as_deref(), Some("ghcr.io"));
    }

    #[test]
    fn basic_challenge_has_no_realm_url() {
        let c = Challenge::parse(r#"Basic realm="Registry Realm""#);
        assert_eq!(c.scheme, "Basic");
        assert_eq!(c.realm.as_deref(), Some("Registry Realm"));
        assert!(c.service.is_none());
    }

    #[test]
    fn status_codes_map_to_fetch_kinds() {
        let image = ImageReference::parse("ghcr.io/org/app").expect("parse");
        let kind = |status| match classify(&image, status) {
            BerthError::Fetch { kind, .. } => kind,
            other => panic!("unexpected {other}"),
        };
        assert_eq!(kind(StatusCode::NOT_FOUND), FetchFailure::NotFound);
        assert_eq!(kind(StatusCode::UNAUTHORIZED), FetchFailure::Unauthorized);
        assert_eq!(kind(StatusCode::FORBIDDEN), FetchFailure::Unauthorized);
        assert_eq!(kind(StatusCode::BAD_GATEWAY), FetchFailure::Registry);
    }

    #[tokio::test]
    async fn unreachable_registry_is_a_network_fetch_error() {
        let client = RegistryClient::new(AuthResolver::new(Arc::new(Anonymous)), Duration::from_secs(2))
            .expect("client");
        let err = client
            .resolve("127.0.0.1:1/missing/image:v1")
            .await
            .expect_err("nothing listens on port 1");
        assert!(
            matches!(err, BerthError::Fetch { kind: FetchFailure::Network, .. }),
            "{err}"
        );
    }

    #[tokio::test]
    async fn missing_manifest_is_not_found() {
        let (addr, requests) = local_registry(|_, _| reply("404 Not Found", &[], "")).await;

        let err = anonymous_client()
            .resolve(&format!("{addr}/org/absent:v1"))
            .await
            .expect_err("manifest is absent");
        assert!(
            matches!(err, BerthError::Fetch { kind: FetchFailure::NotFound, .. }),
            "{err}"
        );
        let requests = requests.lock().expect("requests");
        assert_eq!(requests.len(), 1);
        assert!(requests[0].starts_with("head /v2/org/absent/manifests/v1 "), "{}", requests[0]);
        assert!(requests[0].contains(&format!("user-agent: {APP_NAME}/")));
    }

    #[tokio::test]
    async fn bearer_challenge_fetches_a_token_and_retries() {
        let (addr, requests) = local_registry(|addr, head| {
            if head.starts_with("get /token?") {
                reply("200 OK", &[("Content-Type", "application/json")], r#"{"token":"abc"}"#)
            } else if head.contains("authorization: bearer abc") {
                reply("200 OK", &[(CONTENT_DIGEST_HEADER, MANIFEST_DIGEST)], "")
            } else {
                let challenge = format!(
                    r#"Bearer realm="http://{addr}/token",service="local-registry",scope="repository:org/app:pull""#
                );
                reply("401 Unauthorized", &[("WWW-Authenticate", challenge.as_str())], "")
            }
        })
        .await;

        let resolved = anonymous_client()
            .resolve(&format!("{addr}/org/app:v1"))
            .await
            .expect("resolve");
        assert_eq!(resolved.digest.as_deref(), Some(MANIFEST_DIGEST));
        assert_eq!(resolved.reference, format!("{addr}/org/app@{MANIFEST_DIGEST}"));

        let requests = requests.lock().expect("requests");
        assert_eq!(requests.len(), 3, "{requests:?}");
        assert!(requests[0].starts_with("head /v2/org/app/manifests/v1 "));
        assert!(requests[1].starts_with("get /token?"));
        assert!(requests[1].contains("service=local-registry"));
        assert!(requests[1].contains("scope=repository%3aorg%2fapp%3apull"), "{}", requests[1]);
        assert!(requests[2].contains("authorization: bearer abc"));
    }

    #[tokio::test]
    async fn missing_digest_header_hashes_the_manifest_body() {
        const BODY: &str = r#"{"schemaVersion":2,"mediaType":"application/vnd.oci.image.manifest.v1+json"}"#;
        let (addr, requests) = local_registry(|_, head| {
            if head.starts_with("get ") {
                reply("200 OK", &[("Content-Type", "application/json")], BODY)
            } else {
                reply("200 OK", &[], "")
            }
        })
        .await;

        let image = ImageReference::parse(&format!("{addr}/org/app:v2")).expect("parse");
        let digest = anonymous_client().fetch_digest(&image).await.expect("digest");
        assert_eq!(digest, format!("sha256:{:x}", Sha256::digest(BODY.as_bytes())));

        let requests = requests.lock().expect("requests");
        assert_eq!(requests.len(), 2);
        assert!(requests[0].starts_with("head "));
        assert!(requests[1].starts_with("get /v2/org/app/manifests/v2 "));
    }

    #[tokio::test]
    async fn invalid_reference_fails_before_network() {
        let client = RegistryClient::new(AuthResolver::new(Arc::new(Anonymous)), Duration::from_secs(2))
            .expect("client");
        assert!(matches!(client.resolve("NOT/valid").await, Err(BerthError::Parse { .. })));
    }
}
