//! TLS context cache.
//!
//! Contexts are keyed by `(verify_peer, ca_bundle_path)` and shared across
//! every pool with the same configuration: building a root store is
//! expensive and the resulting `rustls::ClientConfig` is immutable.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use rustls::ClientConfig;
use rustls::RootCertStore;

use crate::error::{Error, Result};

pub(crate) fn ensure_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        if rustls::crypto::CryptoProvider::get_default().is_none() {
            let _ = rustls::crypto::ring::default_provider().install_default();
        }
    });
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ContextKey {
    verify_peer: bool,
    ca_bundle: Option<PathBuf>,
}

static CONTEXTS: OnceLock<Mutex<HashMap<ContextKey, Arc<ClientConfig>>>> = OnceLock::new();

/// Fetch (or build and cache) the client TLS configuration for a pool.
pub(crate) fn client_config(
    verify_peer: bool,
    ca_bundle: Option<&Path>,
) -> Result<Arc<ClientConfig>> {
    ensure_crypto_provider();

    let key = ContextKey {
        verify_peer,
        ca_bundle: ca_bundle.map(Path::to_path_buf),
    };

    let cache = CONTEXTS.get_or_init(|| Mutex::new(HashMap::new()));
    if let Ok(cache) = cache.lock()
        && let Some(config) = cache.get(&key)
    {
        return Ok(Arc::clone(config));
    }

    let config = Arc::new(build_config(verify_peer, ca_bundle)?);

    if let Ok(mut cache) = cache.lock() {
        cache.insert(key, Arc::clone(&config));
    }

    Ok(config)
}

fn build_config(verify_peer: bool, ca_bundle: Option<&Path>) -> Result<ClientConfig> {
    let roots = root_store(ca_bundle)?;

    let mut config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    if !verify_peer {
        let provider = rustls::crypto::CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerification(provider)));
    }

    Ok(config)
}

fn root_store(ca_bundle: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    if let Some(path) = ca_bundle {
        let pem = fs::read(path).map_err(|e| Error::Tls {
            symbol: "TLS_CA_BUNDLE_UNREADABLE",
            message: format!("failed to read CA bundle {}: {e}", path.display()),
            source: Some(Box::new(e)),
        })?;

        let mut added = 0usize;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| Error::Tls {
                symbol: "TLS_CA_BUNDLE_INVALID",
                message: format!("failed to parse CA bundle {}: {e}", path.display()),
                source: Some(Box::new(e)),
            })?;
            if roots.add(cert).is_ok() {
                added += 1;
            }
        }

        // A bundle without usable certificates falls back to the platform
        // trust store rather than failing construction.
        if added > 0 {
            return Ok(roots);
        }
    }

    let loaded = rustls_native_certs::load_native_certs();
    for cert in loaded.certs {
        let _ = roots.add(cert);
    }

    Ok(roots)
}

/// Certificate verifier for `ssl_verify_peer = false`: accepts any chain,
/// including self-signed and name-mismatched certificates.
#[derive(Debug)]
struct NoVerification(Arc<rustls::crypto::CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}
