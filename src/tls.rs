// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! TLS configuration.
//!
//! ## Mutual TLS
//!
//! After activation the coordinator hands out a [`CertBundle`]. It is turned
//! into a matching server/client pair ([`MutualTlsConfig`]):
//!
//! - TLS 1.3 only
//! - peers must present a certificate chaining to the bundle's root CA
//! - the bundle's leaf certificate is presented in both directions
//!
//! ## Certificate Pinning
//!
//! [`PinnedCertVerifier`] wraps normal WebPKI verification and additionally
//! requires the end-entity certificate's SHA-256 to match a per-hostname pin.
//! Hosts without a pin only get WebPKI verification.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
    ServerName, UnixTime,
};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("invalid PEM: {0}")]
    Pem(String),

    #[error("no certificate found in {0}")]
    NoCertificates(&'static str),

    #[error("no supported private key found")]
    NoPrivateKey,

    #[error("certificate verifier error: {0}")]
    Verifier(String),

    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),
}

impl TlsError {
    pub fn kind(&self) -> ErrorKind {
        // A bad bundle or pin set does not improve by retrying.
        match self {
            TlsError::Pem(_)
            | TlsError::NoCertificates(_)
            | TlsError::NoPrivateKey
            | TlsError::Verifier(_)
            | TlsError::Rustls(_) => ErrorKind::Permanent,
        }
    }
}

/// PEM material delivered by the coordinator.
#[derive(Clone)]
pub struct CertBundle {
    pub leaf_cert: Vec<u8>,
    pub private_key: Zeroizing<Vec<u8>>,
    pub root_ca: Vec<u8>,
}

impl fmt::Debug for CertBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertBundle")
            .field("leaf_cert_len", &self.leaf_cert.len())
            .field("private_key", &"[REDACTED]")
            .field("root_ca_len", &self.root_ca.len())
            .finish()
    }
}

/// Server and client configurations built from one [`CertBundle`].
#[derive(Clone)]
pub struct MutualTlsConfig {
    pub server: Arc<ServerConfig>,
    pub client: Arc<ClientConfig>,
}

impl fmt::Debug for MutualTlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutualTlsConfig").finish_non_exhaustive()
    }
}

/// The ring provider every config in this crate is built on.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

impl CertBundle {
    pub fn to_mutual_tls(&self) -> Result<MutualTlsConfig, TlsError> {
        let provider = crypto_provider();
        let roots = Arc::new(parse_root_store(&self.root_ca, "root CA")?);
        let certs = parse_certificates(&self.leaf_cert, "leaf certificate")?;
        let key = parse_private_key(&self.private_key)?;

        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(roots.clone(), provider.clone())
                .build()
                .map_err(|e| TlsError::Verifier(e.to_string()))?;

        let server = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(certs.clone(), key.clone_key())?;

        let client = ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])?
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)?;

        Ok(MutualTlsConfig {
            server: Arc::new(server),
            client: Arc::new(client),
        })
    }
}

/// Parse every `CERTIFICATE` block in `pem`.
pub fn parse_certificates(
    pem: &[u8],
    what: &'static str,
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let blocks = pem::parse_many(pem).map_err(|e| TlsError::Pem(e.to_string()))?;
    let certs: Vec<CertificateDer<'static>> = blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| CertificateDer::from(block.into_contents()))
        .collect();
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(what));
    }
    Ok(certs)
}

/// Parse the first PKCS#8, SEC1 or PKCS#1 private key in `pem`.
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    let blocks = pem::parse_many(pem).map_err(|e| TlsError::Pem(e.to_string()))?;
    for block in blocks {
        let key = match block.tag() {
            "PRIVATE KEY" => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(block.into_contents())),
            "EC PRIVATE KEY" => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(block.into_contents())),
            "RSA PRIVATE KEY" => {
                PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(block.into_contents()))
            }
            _ => continue,
        };
        return Ok(key);
    }
    Err(TlsError::NoPrivateKey)
}

pub fn parse_root_store(pem: &[u8], what: &'static str) -> Result<RootCertStore, TlsError> {
    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(pem, what)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Mozilla's root set, for outbound calls to public endpoints.
pub fn webpki_root_store() -> RootCertStore {
    RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned())
}

/// SHA-256 of a DER certificate, the value pins are compared against.
pub fn certificate_fingerprint(cert: &[u8]) -> [u8; 32] {
    Sha256::digest(cert).into()
}

/// WebPKI verification plus per-hostname leaf certificate pins.
pub struct PinnedCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
    pins: HashMap<String, [u8; 32]>,
}

impl fmt::Debug for PinnedCertVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedCertVerifier")
            .field("pinned_hosts", &self.pins.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PinnedCertVerifier {
    /// Hostnames in `pins` are matched case-insensitively.
    pub fn new(
        roots: RootCertStore,
        pins: HashMap<String, [u8; 32]>,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, TlsError> {
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| TlsError::Verifier(e.to_string()))?;
        let pins = pins
            .into_iter()
            .map(|(host, pin)| (host.to_ascii_lowercase(), pin))
            .collect();
        Ok(Self { inner, pins })
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verified =
            self.inner
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;

        let host = server_name.to_str().to_ascii_lowercase();
        if let Some(expected) = self.pins.get(&host) {
            let actual = certificate_fingerprint(end_entity.as_ref());
            if &actual != expected {
                tracing::warn!(
                    host = %host,
                    fingerprint = %hex::encode(actual),
                    "Pinned certificate mismatch"
                );
                return Err(rustls::Error::General(format!(
                    "pinned certificate mismatch for host {host}"
                )));
            }
        }
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use rustls::{ClientConnection, Connection, ServerConnection};

    fn leaf_der() -> CertificateDer<'static> {
        parse_certificates(LEAF_PEM, "leaf").unwrap().remove(0)
    }

    fn transfer(from: &mut Connection, to: &mut Connection) -> Result<(), rustls::Error> {
        let mut buf = Vec::new();
        while from.wants_write() {
            from.write_tls(&mut buf)
                .map_err(|e| rustls::Error::General(e.to_string()))?;
        }
        let mut reader = &buf[..];
        while !reader.is_empty() {
            to.read_tls(&mut reader)
                .map_err(|e| rustls::Error::General(e.to_string()))?;
            to.process_new_packets()?;
        }
        Ok(())
    }

    /// Drive an in-memory handshake to completion.
    fn handshake(client: Arc<ClientConfig>, server: Arc<ServerConfig>) -> Result<(), rustls::Error> {
        let name = ServerName::try_from("localhost").unwrap();
        let mut client = Connection::from(ClientConnection::new(client, name)?);
        let mut server = Connection::from(ServerConnection::new(server)?);

        for _ in 0..10 {
            transfer(&mut client, &mut server)?;
            transfer(&mut server, &mut client)?;
            if !client.is_handshaking() && !server.is_handshaking() {
                // Flush the server's post-handshake messages so a rejected
                // client certificate surfaces on the client side too.
                transfer(&mut server, &mut client)?;
                return Ok(());
            }
        }
        Err(rustls::Error::General("handshake did not complete".to_string()))
    }

    #[test]
    fn fixture_fingerprint_matches() {
        assert_eq!(hex::encode(certificate_fingerprint(&leaf_der())), LEAF_FINGERPRINT);
    }

    #[test]
    fn parses_pkcs8_key() {
        assert!(matches!(parse_private_key(LEAF_KEY).unwrap(), PrivateKeyDer::Pkcs8(_)));
        assert!(matches!(parse_private_key(CA_PEM), Err(TlsError::NoPrivateKey)));
        assert!(matches!(
            parse_certificates(LEAF_KEY, "key file"),
            Err(TlsError::NoCertificates("key file"))
        ));
    }

    #[test]
    fn bundle_debug_redacts_key() {
        let printed = format!("{:?}", bundle());
        assert!(printed.contains("REDACTED"));
        assert!(!printed.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn mutual_tls_handshake_succeeds() {
        let config = bundle().to_mutual_tls().unwrap();
        handshake(config.client, config.server).unwrap();
    }

    #[test]
    fn server_requires_client_certificate() {
        let config = bundle().to_mutual_tls().unwrap();
        let anonymous = ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .with_root_certificates(parse_root_store(CA_PEM, "ca").unwrap())
            .with_no_client_auth();

        assert!(handshake(Arc::new(anonymous), config.server).is_err());
    }

    #[test]
    fn server_rejects_tls12_clients() {
        let config = bundle().to_mutual_tls().unwrap();
        let tls12 = ClientConfig::builder_with_provider(crypto_provider())
            .with_protocol_versions(&[&rustls::version::TLS12])
            .unwrap()
            .with_root_certificates(parse_root_store(CA_PEM, "ca").unwrap())
            .with_client_auth_cert(
                parse_certificates(LEAF_PEM, "leaf").unwrap(),
                parse_private_key(LEAF_KEY).unwrap(),
            )
            .unwrap();

        assert!(handshake(Arc::new(tls12), config.server).is_err());
    }

    fn pinned(pin: [u8; 32]) -> PinnedCertVerifier {
        let mut pins = HashMap::new();
        pins.insert("LOCALHOST".to_string(), pin);
        PinnedCertVerifier::new(parse_root_store(CA_PEM, "ca").unwrap(), pins, crypto_provider())
            .unwrap()
    }

    #[test]
    fn pin_match_is_accepted() {
        let leaf = leaf_der();
        let verifier = pinned(certificate_fingerprint(&leaf));
        let name = ServerName::try_from("localhost").unwrap();
        assert!(verifier
            .verify_server_cert(&leaf, &[], &name, &[], UnixTime::now())
            .is_ok());
    }

    #[test]
    fn pin_mismatch_is_rejected() {
        let leaf = leaf_der();
        let verifier = pinned([0u8; 32]);
        let name = ServerName::try_from("localhost").unwrap();
        let err = verifier
            .verify_server_cert(&leaf, &[], &name, &[], UnixTime::now())
            .unwrap_err();
        assert!(err.to_string().contains("pinned certificate mismatch"));
    }

    #[test]
    fn untrusted_chain_is_rejected_even_with_pin() {
        let leaf = leaf_der();
        let mut pins = HashMap::new();
        pins.insert("localhost".to_string(), certificate_fingerprint(&leaf));
        let verifier =
            PinnedCertVerifier::new(webpki_root_store(), pins, crypto_provider()).unwrap();
        let name = ServerName::try_from("localhost").unwrap();
        assert!(verifier
            .verify_server_cert(&leaf, &[], &name, &[], UnixTime::now())
            .is_err());
    }
}
