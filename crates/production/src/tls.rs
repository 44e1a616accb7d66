//! TLS configuration with per-peer certificate pinning.
//!
//! Replicas authenticate each other by certificate identity, not by name or
//! CA chain: the connector verifies the server's presented certificate is
//! byte-equal to the one configured for that peer id, and the acceptor
//! requires a client certificate matching one of the configured peers. A
//! mismatch fails the handshake in-band; the connection is never
//! established.
//!
//! The channel only authenticates the transport. Protocol messages carry
//! their own signatures and are verified independently by the engine.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig,
    SignatureScheme,
};
use sha2::{Digest as _, Sha256};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// TLS setup errors.
#[derive(Debug, Error)]
pub enum TlsError {
    /// PEM file could not be read.
    #[error("could not read {path}: {source}")]
    Io {
        /// Offending path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// PEM contents were not usable.
    #[error("invalid PEM in {0}")]
    InvalidPem(String),

    /// rustls rejected the configuration.
    #[error("tls configuration: {0}")]
    Config(#[from] rustls::Error),
}

/// The SHA-256 fingerprint of a DER-encoded certificate, lowercase hex.
pub fn certificate_fingerprint(cert: &CertificateDer<'_>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cert.as_ref());
    hex::encode(hasher.finalize())
}

/// This replica's TLS identity: certificate chain and private key.
pub struct TlsIdentity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl TlsIdentity {
    /// Load an identity from PEM files.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let cert_chain = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        Ok(Self {
            cert_chain,
            key,
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }

    /// Our own leaf certificate.
    pub fn leaf(&self) -> &CertificateDer<'static> {
        &self.cert_chain[0]
    }

    /// Client-side config for dialing one peer, pinned to that peer's
    /// certificate.
    pub fn connector_config(
        &self,
        pinned: CertificateDer<'static>,
    ) -> Result<ClientConfig, TlsError> {
        let verifier = Arc::new(PinnedServerVerifier {
            pinned,
            provider: self.provider.clone(),
        });
        let config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(self.cert_chain.clone(), self.key.clone_key())?;
        Ok(config)
    }

    /// Server-side config accepting connections from any of the pinned peer
    /// certificates.
    pub fn acceptor_config(
        &self,
        peers: Vec<CertificateDer<'static>>,
    ) -> Result<ServerConfig, TlsError> {
        let verifier = Arc::new(PinnedClientVerifier {
            peers,
            provider: self.provider.clone(),
        });
        let config = ServerConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())?;
        Ok(config)
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let data = std::fs::read(path).map_err(|source| TlsError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut data.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|_| TlsError::InvalidPem(path.display().to_string()))?;
    if certs.is_empty() {
        return Err(TlsError::InvalidPem(path.display().to_string()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let data = std::fs::read(path).map_err(|source| TlsError::Io {
        path: path.display().to_string(),
        source,
    })?;
    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|_| TlsError::InvalidPem(path.display().to_string()))?
        .ok_or_else(|| TlsError::InvalidPem(path.display().to_string()))
}

/// Accepts exactly one server certificate: the pinned one.
#[derive(Debug)]
struct PinnedServerVerifier {
    pinned: CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.pinned.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
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
        verify_tls12_signature(
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
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Accepts client certificates byte-equal to any configured peer.
#[derive(Debug)]
struct PinnedClientVerifier {
    peers: Vec<CertificateDer<'static>>,
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        if self.peers.iter().any(|p| p.as_ref() == end_entity.as_ref()) {
            Ok(ClientCertVerified::assertion())
        } else {
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
        verify_tls12_signature(
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
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_sha256_of_der() {
        let cert = CertificateDer::from(vec![1u8, 2, 3]);
        let mut hasher = Sha256::new();
        hasher.update([1u8, 2, 3]);
        assert_eq!(certificate_fingerprint(&cert), hex::encode(hasher.finalize()));
    }

    #[test]
    fn missing_pem_files_error_cleanly() {
        let err = TlsIdentity::load(Path::new("/nonexistent/cert.pem"), Path::new("/nonexistent/key.pem"));
        assert!(matches!(err, Err(TlsError::Io { .. })));
    }
}
