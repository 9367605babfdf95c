//! TLS helpers for explicit and implicit FTPS (RFC 4217).
//!
//! - Builds one shared `rustls::ClientConfig` per certificate policy.
//! - Wraps control and data streams; the data connection reuses the control
//!   connection's config so session resumption can work.

use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::socket::BoxedStream;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// Build a client config. With `accept_invalid_certs` every certificate is
/// accepted; otherwise the platform roots are used.
pub fn build_client_config(accept_invalid_certs: bool) -> FtpResult<Arc<ClientConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?;

    let config = if accept_invalid_certs {
        log::warn!("TLS certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertVerifier))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            log::debug!("Skipping platform certificate store entry: {}", err);
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        log::debug!("Loaded {} platform root certificates ({} ignored)", added, ignored);
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    Ok(Arc::new(config))
}

/// TLS configs for both certificate policies, built on first use.
#[derive(Debug, Default)]
pub struct TlsConfigs {
    strict: std::sync::OnceLock<Arc<ClientConfig>>,
    permissive: std::sync::OnceLock<Arc<ClientConfig>>,
}

impl TlsConfigs {
    pub fn get(&self, accept_invalid_certs: bool) -> FtpResult<Arc<ClientConfig>> {
        let cell = if accept_invalid_certs {
            &self.permissive
        } else {
            &self.strict
        };
        if let Some(c) = cell.get() {
            return Ok(Arc::clone(c));
        }
        let built = build_client_config(accept_invalid_certs)?;
        Ok(Arc::clone(cell.get_or_init(|| built)))
    }
}

/// Run the TLS handshake on `stream`. `what` names the channel in errors
/// ("control connection", "data connection").
pub async fn connect_tls(
    config: Arc<ClientConfig>,
    host: &str,
    stream: BoxedStream,
    what: &str,
) -> FtpResult<BoxedStream> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| FtpError::tls_failed(format!("Invalid server name {}: {}", host, e)))?;
    let tls = TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| FtpError::tls_failed(format!("TLS handshake on {} failed: {}", what, e)))?;
    log::debug!("TLS established on {} to {}", what, host);
    Ok(Box::new(tls))
}

// ─── NoCertVerifier (for self-signed certs) ─────────────────────────

#[derive(Debug)]
struct NoCertVerifier;

impl rustls::client::danger::ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permissive_config_is_cached() {
        let configs = TlsConfigs::default();
        let a = configs.get(true).unwrap();
        let b = configs.get(true).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn handshake_failure_is_a_tls_error() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let config = build_client_config(true).unwrap();
        let err = connect_tls(config, "example.com", Box::new(client), "data connection")
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind, crate::ftp::error::FtpErrorKind::TlsFailed);
    }
}
