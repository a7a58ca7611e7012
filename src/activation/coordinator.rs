// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Coordinator client.
//!
//! | Endpoint | Body | Success |
//! |----------|------|---------|
//! | `POST {base}/activate` | [`ActivationRequest`] | `200` + [`ActivationResponse`] |
//! | `POST {base}/heartbeat` | [`HeartbeatRequest`] | `200` |
//!
//! Every request carries `X-Instance-Type` and `X-Instance-Id`. Byte fields
//! are base64 on the wire. A non-200 answer is retryable unless its JSON body
//! sets `"permanent": true`.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use reqwest::StatusCode;
use rustls::{ClientConfig, RootCertStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use url::Url;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::ErrorKind;
use crate::tls::{crypto_provider, CertBundle, MutualTlsConfig, TlsError};

const INSTANCE_TYPE_HEADER: &str = "X-Instance-Type";
const INSTANCE_ID_HEADER: &str = "X-Instance-Id";

/// Longest coordinator error body kept in an error message.
const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid coordinator address: {0}")]
    InvalidAddress(String),

    #[error("coordinator request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("coordinator returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("coordinator rejected the instance ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed coordinator response: {0}")]
    MalformedResponse(String),

    #[error(transparent)]
    Tls(#[from] TlsError),
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoordinatorError::Transport(_) | CoordinatorError::Status { .. } => {
                ErrorKind::Transient
            }
            CoordinatorError::Rejected { .. } | CoordinatorError::MalformedResponse(_) => {
                ErrorKind::Permanent
            }
            CoordinatorError::InvalidAddress(_) => ErrorKind::InvalidInput,
            CoordinatorError::Tls(e) => e.kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRequest {
    pub instance_type: String,
    pub instance_id: Uuid,
    /// Base64 attestation quote.
    pub quote: String,
    pub unique_id: String,
    pub signer_id: String,
    pub product_id: u16,
    pub security_version: u16,
    pub simulation_mode: bool,
}

/// Wire form of the activation bundle.
#[derive(Default, Serialize, Deserialize)]
pub struct ActivationResponse {
    #[serde(default)]
    pub secrets: HashMap<String, String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub files: HashMap<String, String>,
    #[serde(default)]
    pub certificate: String,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub root_ca: String,
}

impl fmt::Debug for ActivationResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationResponse")
            .field("secret_names", &sorted_keys(&self.secrets))
            .field("env_keys", &sorted_keys(&self.env))
            .field("files", &sorted_keys(&self.files))
            .field("certificate_len", &self.certificate.len())
            .field("private_key", &"[REDACTED]")
            .field("root_ca_len", &self.root_ca.len())
            .finish()
    }
}

/// Decoded activation bundle.
#[derive(Default)]
pub struct ActivationBundle {
    pub secrets: HashMap<String, Zeroizing<Vec<u8>>>,
    pub env: HashMap<String, String>,
    pub files: HashMap<PathBuf, Vec<u8>>,
    pub tls: Option<CertBundle>,
}

impl fmt::Debug for ActivationBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivationBundle")
            .field("secret_names", &sorted_keys(&self.secrets))
            .field("env_keys", &sorted_keys(&self.env))
            .field("files", &sorted_keys(&self.files))
            .field("tls", &self.tls)
            .finish()
    }
}

fn sorted_keys<K: Ord, V>(map: &HashMap<K, V>) -> Vec<&K> {
    let mut keys: Vec<&K> = map.keys().collect();
    keys.sort();
    keys
}

impl ActivationResponse {
    pub fn into_bundle(self) -> Result<ActivationBundle, CoordinatorError> {
        let secrets = self
            .secrets
            .into_iter()
            .map(|(name, value)| {
                let value = Zeroizing::new(value);
                decode(&value, "secret").map(|bytes| (name, Zeroizing::new(bytes)))
            })
            .collect::<Result<_, _>>()?;

        let files = self
            .files
            .into_iter()
            .map(|(path, value)| decode(&value, "file").map(|bytes| (PathBuf::from(path), bytes)))
            .collect::<Result<_, _>>()?;

        let private_key = Zeroizing::new(self.private_key);
        let tls = match (
            self.certificate.is_empty(),
            private_key.is_empty(),
            self.root_ca.is_empty(),
        ) {
            (true, true, true) => None,
            (false, false, false) => Some(CertBundle {
                leaf_cert: decode(&self.certificate, "certificate")?,
                private_key: Zeroizing::new(decode(&private_key, "private_key")?),
                root_ca: decode(&self.root_ca, "root_ca")?,
            }),
            _ => {
                return Err(CoordinatorError::MalformedResponse(
                    "certificate, private_key and root_ca must be sent together".to_string(),
                ))
            }
        };

        Ok(ActivationBundle {
            secrets,
            env: self.env,
            files,
            tls,
        })
    }
}

fn decode(value: &str, field: &str) -> Result<Vec<u8>, CoordinatorError> {
    Base64::decode_vec(value)
        .map_err(|_| CoordinatorError::MalformedResponse(format!("{field} is not valid base64")))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub instance_id: Uuid,
    pub instance_type: String,
    /// Unix seconds.
    pub timestamp: i64,
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn activate(
        &self,
        request: &ActivationRequest,
    ) -> Result<ActivationBundle, CoordinatorError>;

    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<(), CoordinatorError>;

    /// Switch subsequent calls to the activated mutual-TLS identity.
    fn install_tls(&self, _tls: &MutualTlsConfig) -> Result<(), CoordinatorError> {
        Ok(())
    }
}

/// Normalise a coordinator address. A bare `host:port` gets `https://`.
pub fn coordinator_url(address: &str) -> Result<Url, CoordinatorError> {
    let address = address.trim();
    let with_scheme = if address.contains("://") {
        address.to_string()
    } else {
        format!("https://{address}")
    };
    let mut url =
        Url::parse(&with_scheme).map_err(|e| CoordinatorError::InvalidAddress(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(CoordinatorError::InvalidAddress(address.to_string()));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// reqwest-backed [`Coordinator`].
pub struct HttpCoordinator {
    base: Url,
    timeout: Duration,
    client: RwLock<reqwest::Client>,
}

impl HttpCoordinator {
    /// `roots` authenticates the coordinator before activation.
    pub fn new(
        address: &str,
        roots: RootCertStore,
        timeout: Duration,
    ) -> Result<Self, CoordinatorError> {
        let tls = ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
            .map_err(TlsError::from)?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            base: coordinator_url(address)?,
            timeout,
            client: RwLock::new(build_client(tls)?),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn client(&self) -> reqwest::Client {
        self.client.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn endpoint(&self, path: &str) -> Result<Url, CoordinatorError> {
        self.base
            .join(path)
            .map_err(|e| CoordinatorError::InvalidAddress(e.to_string()))
    }

    async fn post<T: Serialize>(
        &self,
        path: &str,
        instance_type: &str,
        instance_id: &Uuid,
        body: &T,
    ) -> Result<(StatusCode, Vec<u8>), CoordinatorError> {
        let url = self.endpoint(path)?;
        debug!(url = %url, "Coordinator request");

        let response = self
            .client()
            .post(url)
            .header(INSTANCE_TYPE_HEADER, instance_type)
            .header(INSTANCE_ID_HEADER, instance_id.to_string())
            .timeout(self.timeout)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok((status, body.to_vec()))
    }
}

fn build_client(tls: ClientConfig) -> Result<reqwest::Client, CoordinatorError> {
    Ok(reqwest::Client::builder()
        .use_preconfigured_tls(tls)
        .build()?)
}

/// Map a non-200 answer to a transient or permanent error.
fn status_error(status: StatusCode, body: &[u8]) -> CoordinatorError {
    let parsed: Option<Value> = serde_json::from_slice(body).ok();
    let permanent = parsed
        .as_ref()
        .and_then(|v| v.get("permanent"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut text: String = String::from_utf8_lossy(body).into_owned();
    if text.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }

    if permanent {
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("error").or_else(|| v.get("message")))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(text);
        CoordinatorError::Rejected {
            status: status.as_u16(),
            message,
        }
    } else {
        CoordinatorError::Status {
            status: status.as_u16(),
            body: text,
        }
    }
}

#[async_trait]
impl Coordinator for HttpCoordinator {
    async fn activate(
        &self,
        request: &ActivationRequest,
    ) -> Result<ActivationBundle, CoordinatorError> {
        let (status, body) = self
            .post(
                "activate",
                &request.instance_type,
                &request.instance_id,
                request,
            )
            .await?;
        if status != StatusCode::OK {
            return Err(status_error(status, &body));
        }

        let body = Zeroizing::new(body);
        let response: ActivationResponse = serde_json::from_slice(&body)
            .map_err(|e| CoordinatorError::MalformedResponse(e.to_string()))?;
        response.into_bundle()
    }

    async fn heartbeat(&self, request: &HeartbeatRequest) -> Result<(), CoordinatorError> {
        let (status, body) = self
            .post(
                "heartbeat",
                &request.instance_type,
                &request.instance_id,
                request,
            )
            .await?;
        if status != StatusCode::OK {
            return Err(status_error(status, &body));
        }
        Ok(())
    }

    fn install_tls(&self, tls: &MutualTlsConfig) -> Result<(), CoordinatorError> {
        let client = build_client((*tls.client).clone())?;
        *self.client.write().unwrap_or_else(|e| e.into_inner()) = client;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::fixtures;
    use crate::tls::webpki_root_store;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn request() -> ActivationRequest {
        ActivationRequest {
            instance_type: "oracle".to_string(),
            instance_id: Uuid::new_v4(),
            quote: Base64::encode_string(b"quote"),
            unique_id: "aa".repeat(32),
            signer_id: "bb".repeat(32),
            product_id: 1,
            security_version: 2,
            simulation_mode: true,
        }
    }

    fn response_json() -> Value {
        serde_json::json!({
            "secrets": { "api_key": Base64::encode_string(b"k-1") },
            "env": { "NETWORK": "testnet" },
            "files": { "/tmp/sidecar.toml": Base64::encode_string(b"a = 1") },
            "certificate": Base64::encode_string(fixtures::LEAF_PEM),
            "private_key": Base64::encode_string(fixtures::LEAF_KEY),
            "root_ca": Base64::encode_string(fixtures::CA_PEM),
        })
    }

    #[test]
    fn bare_address_gets_https() {
        let url = coordinator_url("coordinator:4433").unwrap();
        assert_eq!(url.as_str(), "https://coordinator:4433/");
        assert_eq!(
            url.join("activate").unwrap().as_str(),
            "https://coordinator:4433/activate"
        );

        let prefixed = coordinator_url("http://127.0.0.1:9000/api/v2").unwrap();
        assert_eq!(
            prefixed.join("heartbeat").unwrap().as_str(),
            "http://127.0.0.1:9000/api/v2/heartbeat"
        );

        assert!(coordinator_url("ftp://host").is_err());
    }

    #[test]
    fn bundle_decodes() {
        let response: ActivationResponse = serde_json::from_value(response_json()).unwrap();
        let bundle = response.into_bundle().unwrap();
        assert_eq!(bundle.secrets["api_key"].as_slice(), b"k-1");
        assert_eq!(bundle.env["NETWORK"], "testnet");
        assert_eq!(bundle.files[&PathBuf::from("/tmp/sidecar.toml")], b"a = 1");
        let tls = bundle.tls.unwrap();
        assert_eq!(tls.root_ca, fixtures::CA_PEM);
        assert!(tls.to_mutual_tls().is_ok());
    }

    #[test]
    fn debug_output_hides_secret_material() {
        let response: ActivationResponse = serde_json::from_value(response_json()).unwrap();
        let encoded_secret = Base64::encode_string(b"k-1");
        let encoded_key = Base64::encode_string(fixtures::LEAF_KEY);

        let printed = format!("{response:?}");
        assert!(printed.contains("api_key"));
        assert!(printed.contains("[REDACTED]"));
        assert!(!printed.contains(&encoded_secret));
        assert!(!printed.contains(&encoded_key));
        assert!(!printed.contains("testnet"));

        let printed = format!("{:?}", response.into_bundle().unwrap());
        assert!(printed.contains("api_key"));
        assert!(!printed.contains("k-1"));
        assert!(!printed.contains("107, 45, 49"));
        assert!(!printed.contains("a = 1"));
    }

    #[test]
    fn partial_tls_material_is_malformed() {
        let response = ActivationResponse {
            certificate: Base64::encode_string(fixtures::LEAF_PEM),
            ..Default::default()
        };
        let err = response.into_bundle().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
    }

    #[test]
    fn bad_base64_is_malformed() {
        let mut response = ActivationResponse::default();
        response.secrets.insert("x".to_string(), "***".to_string());
        assert!(matches!(
            response.into_bundle(),
            Err(CoordinatorError::MalformedResponse(_))
        ));
    }

    #[test]
    fn permanent_flag_decides_retryability() {
        let transient = status_error(StatusCode::SERVICE_UNAVAILABLE, b"busy");
        assert!(transient.kind().is_retryable());

        let permanent = status_error(
            StatusCode::FORBIDDEN,
            br#"{"permanent": true, "error": "measurement not allowed"}"#,
        );
        assert!(matches!(
            permanent,
            CoordinatorError::Rejected { status: 403, ref message } if message == "measurement not allowed"
        ));
        assert!(!permanent.kind().is_retryable());
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "é".repeat(400);
        match status_error(StatusCode::BAD_GATEWAY, body.as_bytes()) {
            CoordinatorError::Status { body, .. } => assert!(body.len() <= MAX_ERROR_BODY),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_round_trip() {
        let seen: Arc<Mutex<Vec<(String, String)>>> = Arc::default();
        let seen_activate = seen.clone();
        let app = Router::new()
            .route(
                "/activate",
                post(move |headers: HeaderMap, Json(req): Json<ActivationRequest>| {
                    let seen = seen_activate.clone();
                    async move {
                        let header = |name: &str| {
                            headers
                                .get(name)
                                .and_then(|v| v.to_str().ok())
                                .unwrap_or_default()
                                .to_string()
                        };
                        seen.lock()
                            .await
                            .push((header("x-instance-type"), header("x-instance-id")));
                        assert_eq!(req.instance_type, "oracle");
                        Json(response_json())
                    }
                }),
            )
            .route(
                "/heartbeat",
                post(|| async { (AxumStatus::SERVICE_UNAVAILABLE, "draining") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let coordinator = HttpCoordinator::new(
            &format!("http://{addr}"),
            webpki_root_store(),
            Duration::from_secs(5),
        )
        .unwrap();

        let req = request();
        let bundle = coordinator.activate(&req).await.unwrap();
        assert_eq!(bundle.secrets.len(), 1);
        assert_eq!(
            seen.lock().await[0],
            ("oracle".to_string(), req.instance_id.to_string())
        );

        let err = coordinator
            .heartbeat(&HeartbeatRequest {
                instance_id: req.instance_id,
                instance_type: req.instance_type.clone(),
                timestamp: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Status { status: 503, .. }));
    }
}
