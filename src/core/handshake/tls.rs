// src/core/handshake/tls.rs

//! TLS plumbing for both ends of the channel.
//!
//! The server presents a certificate loaded from PEM files. The client does not
//! use a CA chain: it pins the server certificate by thumbprint and only accepts
//! handshake signatures made with an allowlisted scheme.

use crate::core::RpcError;
use anyhow::{Result, anyhow};
use sha2::Digest;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{self, CertificateError, DigitallySignedStruct, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{info, warn};

/// Signature schemes accepted when the configuration does not list any.
pub const DEFAULT_SIGNATURE_SCHEMES: &[SignatureScheme] = &[
    SignatureScheme::ECDSA_NISTP256_SHA256,
    SignatureScheme::ECDSA_NISTP384_SHA384,
    SignatureScheme::ED25519,
    SignatureScheme::RSA_PSS_SHA256,
    SignatureScheme::RSA_PSS_SHA384,
    SignatureScheme::RSA_PSS_SHA512,
];

/// Builds the server's acceptor from a PEM certificate chain and key.
pub fn build_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    info!("Loading TLS certificate from '{}'.", cert_path);
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let server_config = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Loads TLS certificates from a PEM file.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let cert_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open certificate file '{}': {}", path, e))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(anyhow!("No certificates found in '{}'", path));
    }
    Ok(certs)
}

/// Loads a private key from a PEM file.
pub fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let key_file = File::open(path)
        .map_err(|e| anyhow!("Failed to open private key file '{}': {}", path, e))?;
    let mut key_reader = BufReader::new(key_file);
    rustls_pemfile::private_key(&mut key_reader)?
        .ok_or_else(|| anyhow!("No private key found in key file '{}'", path))
}

/// Builds the client's connector around a `PinnedCertificateVerifier`.
pub fn build_connector(
    thumbprint: &str,
    allowed_schemes: &[String],
) -> Result<TlsConnector, RpcError> {
    let provider = crypto_provider();
    let verifier = PinnedCertificateVerifier::new(
        CertificateThumbprint::parse(thumbprint)?,
        parse_signature_schemes(allowed_schemes, &provider)?,
        provider.clone(),
    );
    let client_config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(client_config)))
}

/// Parses the name the client sends in its ClientHello.
pub fn server_name(name: &str) -> Result<ServerName<'static>, RpcError> {
    ServerName::try_from(name.to_string())
        .map_err(|e| RpcError::Config(format!("invalid TLS server name '{name}': {e}")))
}

/// The crypto provider used by both ends.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(crypto::aws_lc_rs::default_provider())
}

/// Resolves scheme names such as `ECDSA_NISTP256_SHA256` against the schemes the
/// crypto provider can verify. An empty list selects `DEFAULT_SIGNATURE_SCHEMES`.
pub fn parse_signature_schemes(
    names: &[String],
    provider: &CryptoProvider,
) -> Result<Vec<SignatureScheme>, RpcError> {
    let supported = provider.signature_verification_algorithms.supported_schemes();
    if names.is_empty() {
        return Ok(DEFAULT_SIGNATURE_SCHEMES
            .iter()
            .copied()
            .filter(|s| supported.contains(s))
            .collect());
    }
    names
        .iter()
        .map(|name| {
            supported
                .iter()
                .copied()
                .find(|s| format!("{s:?}").eq_ignore_ascii_case(name.trim()))
                .ok_or_else(|| RpcError::Config(format!("unknown signature scheme '{name}'")))
        })
        .collect()
}

/// A pinned server certificate digest. The length of the hex string selects the
/// algorithm: 40 digits for SHA-1, 64 for SHA-256.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateThumbprint {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl CertificateThumbprint {
    /// Parses a hex thumbprint. Colons and whitespace between digits are ignored.
    pub fn parse(s: &str) -> Result<Self, RpcError> {
        let cleaned: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != ':')
            .collect();
        let bytes = hex::decode(&cleaned)
            .map_err(|e| RpcError::Config(format!("certificate thumbprint is not hex: {e}")))?;
        match bytes.len() {
            20 => {
                let mut digest = [0u8; 20];
                digest.copy_from_slice(&bytes);
                Ok(CertificateThumbprint::Sha1(digest))
            }
            32 => {
                let mut digest = [0u8; 32];
                digest.copy_from_slice(&bytes);
                Ok(CertificateThumbprint::Sha256(digest))
            }
            n => Err(RpcError::Config(format!(
                "certificate thumbprint must be 20 (SHA-1) or 32 (SHA-256) bytes, got {n}"
            ))),
        }
    }

    /// Computes the thumbprint of a DER certificate with the same algorithm.
    pub fn matches(&self, certificate_der: &[u8]) -> bool {
        match self {
            CertificateThumbprint::Sha1(expected) => {
                sha1::Sha1::digest(certificate_der).as_slice() == expected
            }
            CertificateThumbprint::Sha256(expected) => {
                sha2::Sha256::digest(certificate_der).as_slice() == expected
            }
        }
    }
}

/// Accepts exactly the server certificate whose digest matches the pin.
#[derive(Debug)]
pub struct PinnedCertificateVerifier {
    thumbprint: CertificateThumbprint,
    allowed_schemes: Vec<SignatureScheme>,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertificateVerifier {
    pub fn new(
        thumbprint: CertificateThumbprint,
        allowed_schemes: Vec<SignatureScheme>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            thumbprint,
            allowed_schemes,
            provider,
        }
    }

    fn check_scheme(&self, scheme: SignatureScheme) -> Result<(), rustls::Error> {
        if self.allowed_schemes.contains(&scheme) {
            Ok(())
        } else {
            warn!("Server signed the handshake with disallowed scheme {:?}.", scheme);
            Err(rustls::Error::General(format!(
                "signature scheme {scheme:?} is not allowed"
            )))
        }
    }
}

impl ServerCertVerifier for PinnedCertificateVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.thumbprint.matches(end_entity.as_ref()) {
            Ok(ServerCertVerified::assertion())
        } else {
            warn!("Server certificate does not match the pinned thumbprint.");
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.check_scheme(dss.scheme)?;
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.check_scheme(dss.scheme)?;
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.allowed_schemes.clone()
    }
}
