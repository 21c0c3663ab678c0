//! TLS support.
//!
//! # Upgrade flow
//!
//! 1. Server greeting advertises `CLIENT_SSL`
//! 2. Client sends the 32-byte SSLRequest packet in plaintext
//! 3. Client and server run the TLS handshake on the same socket
//! 4. The handshake response and everything after it travel encrypted
//!
//! The rustls-backed stream is only compiled with the `tls` feature;
//! without it a mode that needs TLS fails with `NotSupported`.

use mywire_core::{Error, InterfaceErrorKind, Result};

use crate::config::{SslMode, TlsConfig};
use crate::protocol::capabilities;

#[cfg(feature = "tls")]
use std::sync::Arc;

pub const fn server_supports_ssl(server_caps: u32) -> bool {
    server_caps & capabilities::CLIENT_SSL != 0
}

/// Decide whether to upgrade, given what the server offers.
///
/// - `Ok(true)`: upgrade
/// - `Ok(false)`: stay in plaintext
/// - `Err(_)`: TLS is required but unavailable
pub fn validate_ssl_mode(ssl_mode: SslMode, server_caps: u32) -> Result<bool> {
    let server_supports = server_supports_ssl(server_caps);
    match ssl_mode {
        SslMode::Disable => Ok(false),
        SslMode::Preferred => Ok(server_supports && cfg!(feature = "tls")),
        SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if !cfg!(feature = "tls") {
                Err(Error::NotSupported(
                    "TLS requested but mywire was built without the 'tls' feature".to_string(),
                ))
            } else if server_supports {
                Ok(true)
            } else {
                Err(tls_error("SSL required but server does not support it"))
            }
        }
    }
}

/// Check that the TLS options make sense for the mode.
pub fn validate_tls_config(ssl_mode: SslMode, tls_config: &TlsConfig) -> Result<()> {
    if tls_config.client_cert_path.is_some() != tls_config.client_key_path.is_some() {
        return Err(tls_error(
            "Client certificate and client key must be configured together",
        ));
    }
    if ssl_mode == SslMode::VerifyIdentity && tls_config.danger_skip_verify {
        return Err(tls_error(
            "VerifyIdentity cannot be combined with skip_verify",
        ));
    }
    Ok(())
}

pub(crate) fn tls_error(message: impl Into<String>) -> Error {
    Error::interface(InterfaceErrorKind::Tls, message)
}

/// Build the rustls client configuration for a mode.
///
/// `Preferred` and `Required` encrypt without verifying the server, the
/// way MySQL clients traditionally behave with self-signed server certs.
#[cfg(feature = "tls")]
pub fn build_client_config(
    tls_config: &TlsConfig,
    ssl_mode: SslMode,
) -> Result<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    match ssl_mode {
        SslMode::Disable => Err(tls_error("TLS configuration built with SslMode::Disable")),
        SslMode::Preferred | SslMode::Required => build_no_verify_config(&provider, tls_config),
        SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if tls_config.danger_skip_verify {
                build_no_verify_config(&provider, tls_config)
            } else {
                let roots = match &tls_config.ca_cert_path {
                    Some(path) => load_ca_roots(path)?,
                    None => {
                        let mut store = rustls::RootCertStore::empty();
                        store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                        store
                    }
                };
                let builder = rustls::ClientConfig::builder_with_provider(provider)
                    .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
                    .map_err(|e| tls_error(format!("Failed to set TLS versions: {}", e)))?
                    .with_root_certificates(roots);
                add_client_auth(builder, tls_config)
            }
        }
    }
}

#[cfg(feature = "tls")]
fn build_no_verify_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    tls_config: &TlsConfig,
) -> Result<rustls::ClientConfig> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    #[derive(Debug)]
    struct NoVerifier(Arc<rustls::crypto::CryptoProvider>);

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> std::result::Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("Failed to set TLS versions: {}", e)))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier(provider.clone())));
    add_client_auth(builder, tls_config)
}

#[cfg(feature = "tls")]
fn load_ca_roots(path: &std::path::Path) -> Result<rustls::RootCertStore> {
    use std::fs::File;
    use std::io::BufReader;

    let file = File::open(path).map_err(|e| {
        tls_error(format!(
            "Failed to open CA certificate '{}': {}",
            path.display(),
            e
        ))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("Failed to parse CA certificate: {}", e)))?;
    if certs.is_empty() {
        return Err(tls_error(format!(
            "No certificates found in CA file '{}'",
            path.display()
        )));
    }

    let mut store = rustls::RootCertStore::empty();
    for cert in certs {
        store
            .add(cert)
            .map_err(|e| tls_error(format!("Failed to add CA certificate: {}", e)))?;
    }
    Ok(store)
}

#[cfg(feature = "tls")]
fn add_client_auth(
    builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
    tls_config: &TlsConfig,
) -> Result<rustls::ClientConfig> {
    use std::fs::File;
    use std::io::BufReader;

    let (Some(cert_path), Some(key_path)) =
        (&tls_config.client_cert_path, &tls_config.client_key_path)
    else {
        return Ok(builder.with_no_client_auth());
    };

    let cert_file = File::open(cert_path).map_err(|e| {
        tls_error(format!(
            "Failed to open client cert '{}': {}",
            cert_path.display(),
            e
        ))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("Failed to parse client certificate: {}", e)))?;

    let key_file = File::open(key_path).map_err(|e| {
        tls_error(format!(
            "Failed to open client key '{}': {}",
            key_path.display(),
            e
        ))
    })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| tls_error(format!("Failed to parse client key: {}", e)))?
        .ok_or_else(|| tls_error(format!("No private key found in '{}'", key_path.display())))?;

    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| tls_error(format!("Failed to configure client auth: {}", e)))
}

/// Resolve the name used for SNI and certificate verification.
#[cfg(feature = "tls")]
pub fn server_name(
    tls_config: &TlsConfig,
    host: &str,
) -> Result<rustls::pki_types::ServerName<'static>> {
    let name = tls_config.server_name.as_deref().unwrap_or(host);
    rustls::pki_types::ServerName::try_from(name.to_string())
        .map_err(|e| tls_error(format!("Invalid server name '{}': {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disable_never_upgrades() {
        assert!(!validate_ssl_mode(SslMode::Disable, 0).unwrap());
        assert!(!validate_ssl_mode(SslMode::Disable, capabilities::CLIENT_SSL).unwrap());
    }

    #[test]
    fn preferred_follows_server() {
        assert!(!validate_ssl_mode(SslMode::Preferred, 0).unwrap());
        assert_eq!(
            validate_ssl_mode(SslMode::Preferred, capabilities::CLIENT_SSL).unwrap(),
            cfg!(feature = "tls")
        );
    }

    #[test]
    fn required_modes_fail_without_server_support() {
        for mode in [SslMode::Required, SslMode::VerifyCa, SslMode::VerifyIdentity] {
            assert!(validate_ssl_mode(mode, 0).is_err());
        }
    }

    #[cfg(not(feature = "tls"))]
    #[test]
    fn required_without_feature_is_not_supported() {
        assert!(matches!(
            validate_ssl_mode(SslMode::Required, capabilities::CLIENT_SSL),
            Err(Error::NotSupported(_))
        ));
    }

    #[cfg(feature = "tls")]
    #[test]
    fn required_with_server_support_upgrades() {
        assert!(validate_ssl_mode(SslMode::Required, capabilities::CLIENT_SSL).unwrap());
        assert!(build_client_config(&TlsConfig::new(), SslMode::Required).is_ok());
        assert!(build_client_config(&TlsConfig::new(), SslMode::VerifyCa).is_ok());
        assert!(build_client_config(&TlsConfig::new(), SslMode::Disable).is_err());
    }

    #[test]
    fn client_cert_needs_key() {
        let config = TlsConfig::new().client_cert("/path/client.pem");
        assert!(validate_tls_config(SslMode::Required, &config).is_err());

        let config = config.client_key("/path/client-key.pem");
        assert!(validate_tls_config(SslMode::Required, &config).is_ok());

        let config = TlsConfig::new().skip_verify(true);
        assert!(validate_tls_config(SslMode::VerifyIdentity, &config).is_err());
        assert!(validate_tls_config(SslMode::VerifyCa, &config).is_ok());
    }
}
