//! TLS configuration from already-loaded key and certificate material.
//!
//! The library never reads files: callers load PEM bytes however they like
//! and hand them over. Server certificate verification on the client side is
//! an explicit, per-connection choice ([`ServerVerification`]); nothing here
//! changes process-wide state.

use std::io::BufReader;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use crate::error::{HachiError, Result};

/// How a client checks the server's certificate.
#[derive(Debug, Clone)]
pub enum ServerVerification {
    /// Verify against these PEM-encoded CA certificates.
    CaPem(Vec<u8>),
    /// Accept any certificate. Signatures are still checked, the chain is not.
    Disabled,
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_err(e: impl std::fmt::Display) -> HachiError {
    HachiError::Tls(e.to_string())
}

/// Parse every certificate in a PEM bundle.
pub fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(pem))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(tls_err)?;

    if certs.is_empty() {
        return Err(HachiError::Tls("no certificate found in PEM".to_string()));
    }
    Ok(certs)
}

/// Parse the first private key in a PEM bundle.
pub fn parse_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut BufReader::new(pem))
        .map_err(tls_err)?
        .ok_or_else(|| HachiError::Tls("no private key found in PEM".to_string()))
}

/// Build a server configuration from a PEM certificate chain and key.
pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let certs = parse_certs(cert_pem)?;
    let key = parse_private_key(key_pem)?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(tls_err)?;

    tracing::debug!("created server TLS configuration");
    Ok(Arc::new(config))
}

/// Build a client configuration with the given verification policy.
pub fn client_config(verification: ServerVerification) -> Result<Arc<ClientConfig>> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?;

    let config = match verification {
        ServerVerification::CaPem(pem) => {
            let mut roots = RootCertStore::empty();
            for cert in parse_certs(&pem)? {
                roots.add(cert).map_err(tls_err)?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        ServerVerification::Disabled => {
            tracing::warn!("server certificate verification is disabled for this connection");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert {
                    provider: provider(),
                }))
                .with_no_client_auth()
        }
    };

    Ok(Arc::new(config))
}

/// Parse a DNS name or IP address for SNI and certificate matching.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .map_err(|e| HachiError::Tls(format!("invalid server name {:?}: {}", host, e)))
}

/// Verifier that skips chain validation.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
