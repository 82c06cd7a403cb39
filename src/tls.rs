use anyhow::{Context, Result, anyhow};
use rustls_pemfile::certs;
use std::{
    fs::File,
    io::BufReader,
    sync::{Arc, Once, OnceLock},
};
use tokio_rustls::{
    TlsConnector,
    rustls::{
        self, DigitallySignedStruct, RootCertStore, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};
use tracing::warn;

static CRYPTO_PROVIDER_INIT: Once = Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        // Err only means another provider was installed first.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

fn default_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

/// Adds every certificate of a PEM bundle to `roots`.
pub fn load_ca_file(roots: &mut RootCertStore, ca_file: &str) -> Result<usize> {
    let file =
        File::open(ca_file).with_context(|| format!("Failed to open CA file: {ca_file}"))?;

    let cert_chain = certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse CA file")?;

    if cert_chain.is_empty() {
        return Err(anyhow!("No certificates found in CA file: {ca_file}"));
    }

    let count = cert_chain.len();
    for cert in cert_chain {
        roots
            .add(cert)
            .context("Failed to add CA certificate to root store")?;
    }
    Ok(count)
}

/// Client configuration for the relay connection.
pub fn relay_client_config(insecure: bool, ca_file: Option<&str>) -> Result<rustls::ClientConfig> {
    ensure_crypto_provider();

    if insecure {
        warn!("TLS certificate verification is disabled for the relay connection");
        return Ok(rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new())
            .with_no_client_auth());
    }

    let mut roots = default_roots();
    if let Some(ca_file) = ca_file {
        load_ca_file(&mut roots, ca_file)?;
    }

    Ok(rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

pub fn relay_connector(insecure: bool, ca_file: Option<&str>) -> Result<TlsConnector> {
    relay_client_config(insecure, ca_file).map(|config| TlsConnector::from(Arc::new(config)))
}

/// Verifying connector shared by all `https`/`wss` backend connections.
pub fn backend_connector() -> TlsConnector {
    static CONNECTOR: OnceLock<TlsConnector> = OnceLock::new();
    CONNECTOR
        .get_or_init(|| {
            ensure_crypto_provider();
            let config = rustls::ClientConfig::builder()
                .with_root_certificates(default_roots())
                .with_no_client_auth();
            TlsConnector::from(Arc::new(config))
        })
        .clone()
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct SkipVerification(Arc<CryptoProvider>);

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self(Arc::new(rustls::crypto::ring::default_provider())))
    }
}

impl ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
