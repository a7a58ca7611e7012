// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Secure Network Bridge
//!
//! Outbound HTTP and JSON-RPC for enclave services, with optional credential
//! injection from the [`Vault`].
//!
//! ## Policy
//!
//! | Check | When | Failure |
//! |-------|------|---------|
//! | Host allow-list | Before any I/O (empty list allows all) | `HostNotAllowed` |
//! | Redirect target | Each hop; cross-host only to listed hosts | `HostNotAllowed` |
//! | WebPKI + per-host pin | TLS handshake | `Http` |
//! | Minimum TLS 1.2 | TLS handshake | `Http` |
//! | Body size limit | While streaming the response | `BodyTooLarge` |
//!
//! ## Credential Injection
//!
//! | [`AuthType`] | Header |
//! |--------------|--------|
//! | `Bearer` | `Authorization: Bearer <secret>` |
//! | `Basic` | `Authorization: Basic <secret>` |
//! | `ApiKey` | `X-API-Key: <secret>` |
//! | `Custom` | `Authorization: <secret>` |
//!
//! The secret is read through [`Vault::use_secret_async`], so the plaintext
//! buffer lives only for the duration of the request. Injected header values
//! are marked sensitive and never logged.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::redirect::Policy;
use reqwest::Method;
use rustls::{ClientConfig, RootCertStore};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;
use zeroize::Zeroizing;

use crate::error::ErrorKind;
use crate::tls::{crypto_provider, PinnedCertVerifier, TlsError};
use crate::vault::{Vault, VaultError};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

const API_KEY_HEADER: &str = "x-api-key";
const MAX_REDIRECTS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("host not allowed: {0}")]
    HostNotAllowed(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TLS setup failed: {0}")]
    Tls(#[from] TlsError),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

impl NetworkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::HostNotAllowed(_)
            | NetworkError::InvalidUrl(_)
            | NetworkError::InvalidRequest(_) => ErrorKind::InvalidInput,
            NetworkError::BodyTooLarge { .. }
            | NetworkError::Rpc { .. }
            | NetworkError::InvalidResponse(_) => ErrorKind::Permanent,
            NetworkError::Http(_) => ErrorKind::Transient,
            NetworkError::Tls(e) => e.kind(),
            NetworkError::Vault(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Bearer,
    Basic,
    ApiKey,
    Custom,
}

impl AuthType {
    fn header(self, secret: &[u8]) -> Result<(HeaderName, HeaderValue), NetworkError> {
        let (name, prefix): (HeaderName, &[u8]) = match self {
            AuthType::Bearer => (AUTHORIZATION, &b"Bearer "[..]),
            AuthType::Basic => (AUTHORIZATION, &b"Basic "[..]),
            AuthType::ApiKey => (HeaderName::from_static(API_KEY_HEADER), &[]),
            AuthType::Custom => (AUTHORIZATION, &[]),
        };

        let mut raw = Zeroizing::new(Vec::with_capacity(prefix.len() + secret.len()));
        raw.extend_from_slice(prefix);
        raw.extend_from_slice(secret);

        let mut value = HeaderValue::from_bytes(&raw).map_err(|_| {
            NetworkError::InvalidRequest("secret is not a valid header value".to_string())
        })?;
        value.set_sensitive(true);
        Ok((name, value))
    }
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Lowercase hostnames. Empty allows every host.
    pub allowed_hosts: Vec<String>,
    /// Hostname -> SHA-256 of the leaf certificate DER.
    pub pinned_certs: HashMap<String, [u8; 32]>,
    pub default_timeout: Duration,
    pub max_body_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            allowed_hosts: Vec::new(),
            pinned_certs: HashMap::new(),
            default_timeout: DEFAULT_TIMEOUT,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Defaults to `GET`.
    #[serde(default)]
    pub method: Option<String>,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn post_json(url: impl Into<String>, body: &Value) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            method: Some("POST".to_string()),
            url: url.into(),
            headers,
            body: Some(body.to_string().into_bytes()),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Result<Value, NetworkError> {
        serde_json::from_slice(&self.body).map_err(|e| NetworkError::InvalidResponse(e.to_string()))
    }
}

/// Everything a single request needs, owned so it can move into a vault scope.
#[derive(Clone)]
struct Transport {
    http: reqwest::Client,
    allowed_hosts: Arc<HashSet<String>>,
    default_timeout: Duration,
    max_body_size: usize,
}

pub struct SecureHttpClient {
    transport: Transport,
    vault: Arc<Vault>,
}

impl SecureHttpClient {
    /// `roots` is the trust store for HTTPS; use
    /// [`webpki_root_store`](crate::tls::webpki_root_store) for public
    /// endpoints.
    pub fn new(
        config: NetworkConfig,
        roots: RootCertStore,
        vault: Arc<Vault>,
    ) -> Result<Self, NetworkError> {
        let provider = crypto_provider();
        let verifier = PinnedCertVerifier::new(roots, config.pinned_certs, provider.clone())?;
        let tls = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
            .map_err(TlsError::from)?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        let allowed_hosts: Arc<HashSet<String>> = Arc::new(
            config
                .allowed_hosts
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        );

        let http = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .redirect(redirect_policy(allowed_hosts.clone()))
            .build()?;

        Ok(Self {
            transport: Transport {
                http,
                allowed_hosts,
                default_timeout: config.default_timeout,
                max_body_size: config.max_body_size,
            },
            vault,
        })
    }

    pub async fn fetch(&self, request: HttpRequest) -> Result<HttpResponse, NetworkError> {
        self.transport.execute(request, None).await
    }

    /// Like [`fetch`](Self::fetch), with a vaulted credential injected.
    pub async fn fetch_with_secret(
        &self,
        request: HttpRequest,
        namespace: &str,
        name: &str,
        auth: AuthType,
    ) -> Result<HttpResponse, NetworkError> {
        // Fail before touching the vault.
        self.transport.check_url(&request.url)?;

        let transport = self.transport.clone();
        self.vault
            .use_secret_async(namespace, name, move |secret| {
                Box::pin(async move {
                    let header = auth.header(secret)?;
                    transport.execute(request, Some(header)).await
                })
            })
            .await
    }

    /// JSON-RPC 2.0 call. Returns the `result` member.
    pub async fn rpc(
        &self,
        endpoint: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, NetworkError> {
        let response = self.fetch(rpc_request(endpoint, method, params)).await?;
        parse_rpc_response(&response)
    }

    pub async fn rpc_with_secret(
        &self,
        endpoint: &str,
        method: &str,
        params: Value,
        namespace: &str,
        name: &str,
        auth: AuthType,
    ) -> Result<Value, NetworkError> {
        let response = self
            .fetch_with_secret(rpc_request(endpoint, method, params), namespace, name, auth)
            .await?;
        parse_rpc_response(&response)
    }
}

impl Transport {
    fn check_url(&self, raw: &str) -> Result<Url, NetworkError> {
        let url = Url::parse(raw).map_err(|e| NetworkError::InvalidUrl(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(NetworkError::InvalidUrl(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| NetworkError::InvalidUrl("URL has no host".to_string()))?
            .to_ascii_lowercase();
        if !self.allowed_hosts.is_empty() && !self.allowed_hosts.contains(&host) {
            return Err(NetworkError::HostNotAllowed(host));
        }
        Ok(url)
    }

    async fn execute(
        &self,
        request: HttpRequest,
        auth: Option<(HeaderName, HeaderValue)>,
    ) -> Result<HttpResponse, NetworkError> {
        let url = self.check_url(&request.url)?;
        let method = match request.method.as_deref() {
            None => Method::GET,
            Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|_| NetworkError::InvalidRequest(format!("invalid method {m}")))?,
        };

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| NetworkError::InvalidRequest(format!("invalid header name {name}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| NetworkError::InvalidRequest(format!("invalid value for {name}")))?;
            headers.insert(name, value);
        }
        if let Some((name, value)) = auth {
            headers.insert(name, value);
        }

        debug!(method = %method, host = url.host_str().unwrap_or_default(), "Outbound request");

        let mut builder = self
            .http
            .request(method, url)
            .headers(headers)
            .timeout(request.timeout.unwrap_or(self.default_timeout));
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let mut response = builder.send().await.map_err(refused_redirect)?;
        let status = response.status().as_u16();

        let limit = self.max_body_size;
        if let Some(len) = response.content_length() {
            if len > limit as u64 {
                return Err(NetworkError::BodyTooLarge { limit });
            }
        }

        let response_headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            if body.len() + chunk.len() > limit {
                return Err(NetworkError::BodyTooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(HttpResponse {
            status,
            headers: response_headers,
            body,
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("redirect to {0} refused")]
struct RedirectRefused(String);

/// Every hop is held to the allow-list. With an empty list only same-host
/// hops are followed, since injected headers other than `Authorization`
/// survive a cross-host redirect.
fn redirect_policy(allowed_hosts: Arc<HashSet<String>>) -> Policy {
    Policy::custom(move |attempt| {
        if attempt.previous().len() > MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let host = attempt
            .url()
            .host_str()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let followable = if allowed_hosts.is_empty() {
            attempt
                .previous()
                .first()
                .and_then(Url::host_str)
                .is_some_and(|origin| origin.eq_ignore_ascii_case(&host))
        } else {
            allowed_hosts.contains(&host)
        };
        if followable {
            attempt.follow()
        } else {
            attempt.error(RedirectRefused(host))
        }
    })
}

fn refused_redirect(e: reqwest::Error) -> NetworkError {
    let refused = std::error::Error::source(&e)
        .and_then(|source| source.downcast_ref::<RedirectRefused>())
        .map(|r| r.0.clone());
    match refused {
        Some(host) => NetworkError::HostNotAllowed(host),
        None => NetworkError::Http(e),
    }
}

fn rpc_request(endpoint: &str, method: &str, params: Value) -> HttpRequest {
    HttpRequest::post_json(
        endpoint,
        &json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        }),
    )
}

fn parse_rpc_response(response: &HttpResponse) -> Result<Value, NetworkError> {
    let mut body = response.json().map_err(|e| {
        if response.is_success() {
            e
        } else {
            NetworkError::InvalidResponse(format!("HTTP {}", response.status))
        }
    })?;

    if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
        return Err(NetworkError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    match body.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(NetworkError::InvalidResponse(
            "JSON-RPC response has neither result nor error".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enclave::SimulatedRuntime;
    use crate::tls::webpki_root_store;
    use axum::extract::Path;
    use axum::http::HeaderMap as AxumHeaders;
    use axum::response::Redirect;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::net::SocketAddr;

    async fn echo_auth(headers: AxumHeaders) -> String {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        let api_key = headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");
        format!("{auth}|{api_key}")
    }

    async fn rpc_handler(Json(req): Json<Value>) -> Json<Value> {
        let method = req["method"].as_str().unwrap_or_default();
        let reply = match method {
            "getblockcount" => json!({ "jsonrpc": "2.0", "id": req["id"], "result": 4242 }),
            _ => json!({
                "jsonrpc": "2.0",
                "id": req["id"],
                "error": { "code": -32601, "message": "Method not found" }
            }),
        };
        Json(reply)
    }

    async fn spawn_server() -> SocketAddr {
        let app = Router::new()
            .route("/echo", get(echo_auth))
            .route("/big", get(|| async { "x".repeat(4096) }))
            .route("/hop", get(|| async { Redirect::temporary("/echo") }))
            .route(
                "/away/{port}",
                get(|Path(port): Path<u16>| async move {
                    Redirect::temporary(&format!("http://localhost:{port}/echo"))
                }),
            )
            .route("/rpc", post(rpc_handler));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn client(config: NetworkConfig) -> (SecureHttpClient, Arc<Vault>) {
        let vault = Arc::new(Vault::new(Arc::new(SimulatedRuntime::ephemeral().unwrap())));
        let client = SecureHttpClient::new(config, webpki_root_store(), vault.clone()).unwrap();
        (client, vault)
    }

    #[tokio::test]
    async fn disallowed_host_fails_before_io() {
        let (client, _) = client(NetworkConfig {
            allowed_hosts: vec!["api.example.com".to_string()],
            ..Default::default()
        });
        let err = client
            .fetch(HttpRequest::get("https://evil.example.net/steal"))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::HostNotAllowed(ref h) if h == "evil.example.net"));
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn bearer_secret_is_injected() {
        let addr = spawn_server().await;
        let (client, vault) = client(NetworkConfig {
            allowed_hosts: vec!["127.0.0.1".to_string()],
            ..Default::default()
        });
        vault.store("oracle", "token", b"tok-123").unwrap();

        let response = client
            .fetch_with_secret(
                HttpRequest::get(format!("http://{addr}/echo")),
                "oracle",
                "token",
                AuthType::Bearer,
            )
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"Bearer tok-123|-");
    }

    #[tokio::test]
    async fn api_key_and_custom_headers() {
        let addr = spawn_server().await;
        let (client, vault) = client(NetworkConfig::default());
        vault.store("oracle", "key", b"k-1").unwrap();
        let url = format!("http://{addr}/echo");

        let api = client
            .fetch_with_secret(HttpRequest::get(&url), "oracle", "key", AuthType::ApiKey)
            .await
            .unwrap();
        assert_eq!(api.body, b"-|k-1");

        let custom = client
            .fetch_with_secret(HttpRequest::get(&url), "oracle", "key", AuthType::Custom)
            .await
            .unwrap();
        assert_eq!(custom.body, b"k-1|-");
    }

    #[tokio::test]
    async fn missing_secret_is_not_found() {
        let addr = spawn_server().await;
        let (client, _) = client(NetworkConfig::default());
        let err = client
            .fetch_with_secret(
                HttpRequest::get(format!("http://{addr}/echo")),
                "oracle",
                "absent",
                AuthType::Bearer,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let addr = spawn_server().await;
        let (client, _) = client(NetworkConfig {
            max_body_size: 1024,
            ..Default::default()
        });
        let err = client
            .fetch(HttpRequest::get(format!("http://{addr}/big")))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::BodyTooLarge { limit: 1024 }));
    }

    #[tokio::test]
    async fn rpc_result_and_error() {
        let addr = spawn_server().await;
        let (client, _) = client(NetworkConfig::default());
        let endpoint = format!("http://{addr}/rpc");

        let count = client.rpc(&endpoint, "getblockcount", json!([])).await.unwrap();
        assert_eq!(count, json!(4242));

        let err = client.rpc(&endpoint, "nope", json!([])).await.unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Rpc { code: -32601, ref message } if message == "Method not found"
        ));
    }

    #[tokio::test]
    async fn rpc_with_secret_round_trip() {
        let addr = spawn_server().await;
        let (client, vault) = client(NetworkConfig::default());
        vault.store("neo", "rpc", b"secret").unwrap();

        let count = client
            .rpc_with_secret(
                &format!("http://{addr}/rpc"),
                "getblockcount",
                json!([]),
                "neo",
                "rpc",
                AuthType::Basic,
            )
            .await
            .unwrap();
        assert_eq!(count, json!(4242));
    }

    #[tokio::test]
    async fn cross_host_redirect_is_refused_with_secret() {
        let addr = spawn_server().await;
        let (client, vault) = client(NetworkConfig {
            allowed_hosts: vec!["127.0.0.1".to_string()],
            ..Default::default()
        });
        vault.store("oracle", "key", b"k-1").unwrap();

        let err = client
            .fetch_with_secret(
                HttpRequest::get(format!("http://{addr}/away/{}", addr.port())),
                "oracle",
                "key",
                AuthType::ApiKey,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::HostNotAllowed(ref h) if h == "localhost"));
    }

    #[tokio::test]
    async fn cross_host_redirect_needs_allow_list() {
        let addr = spawn_server().await;
        let (client, _) = client(NetworkConfig::default());
        let err = client
            .fetch(HttpRequest::get(format!("http://{addr}/away/{}", addr.port())))
            .await
            .unwrap_err();
        assert!(matches!(err, NetworkError::HostNotAllowed(ref h) if h == "localhost"));
    }

    #[tokio::test]
    async fn same_host_redirect_is_followed() {
        let addr = spawn_server().await;
        let (client, vault) = client(NetworkConfig {
            allowed_hosts: vec!["127.0.0.1".to_string()],
            ..Default::default()
        });
        vault.store("oracle", "key", b"k-1").unwrap();

        let response = client
            .fetch_with_secret(
                HttpRequest::get(format!("http://{addr}/hop")),
                "oracle",
                "key",
                AuthType::ApiKey,
            )
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"-|k-1");
    }

    #[test]
    fn auth_header_values_are_sensitive() {
        let (name, value) = AuthType::Basic.header(b"dXNlcjpwYXNz").unwrap();
        assert_eq!(name, AUTHORIZATION);
        assert!(value.is_sensitive());
        assert_eq!(value.to_str().unwrap(), "Basic dXNlcjpwYXNz");

        assert!(AuthType::Bearer.header(b"bad\nvalue").is_err());
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        let (client, _) = client(NetworkConfig::default());
        assert!(matches!(
            client.transport.check_url("file:///etc/passwd"),
            Err(NetworkError::InvalidUrl(_))
        ));
    }
}
