//! TLS Trust for the DoH Transport
//!
//! The DoH client replaces standard certificate validation with a verifier
//! that either pins the endpoint's SPKI hash or falls back to webpki
//! root-store validation. TLS 1.2 is the minimum accepted version, and
//! rustls does not implement renegotiation, so none can be offered.

use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use x509_parser::prelude::*;

use crate::Result;

/// Certificate verifier for DoH endpoints.
///
/// With a pin configured the leaf's SPKI hash must match exactly; no
/// chain-of-trust fallback is consulted. Without a pin the bundled webpki
/// roots decide. Both paths fail closed.
#[derive(Debug)]
pub struct DohCertVerifier {
    pin: Option<String>,
    webpki: Arc<WebPkiServerVerifier>,
}

impl DohCertVerifier {
    pub fn new(pin: Option<String>) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let webpki = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .context("failed to build webpki verifier")?;
        Ok(Self { pin, webpki })
    }
}

/// base64(SHA-256(SPKI)) of the leaf certificate
pub fn spki_pin(cert_der: &[u8]) -> std::result::Result<String, rustls::Error> {
    let (_, cert) = parse_x509_certificate(cert_der)
        .map_err(|e| rustls::Error::General(format!("failed to parse leaf certificate: {}", e)))?;
    let digest = Sha256::digest(cert.public_key().raw);
    Ok(base64::engine::general_purpose::STANDARD.encode(digest))
}

impl ServerCertVerifier for DohCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match &self.pin {
            Some(expected) => {
                let actual = spki_pin(end_entity.as_ref())?;
                if actual == *expected {
                    Ok(ServerCertVerified::assertion())
                } else {
                    tracing::error!(
                        server = ?server_name,
                        expected = %expected,
                        got = %actual,
                        "DoH certificate SPKI pin mismatch"
                    );
                    Err(rustls::Error::General(
                        "doh certificate pin mismatch".into(),
                    ))
                }
            }
            None => self.webpki.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}

/// rustls client config for DoH connections: TLS 1.2 minimum, SNI from the
/// connection address, pin-or-rootstore verification
pub fn client_config(pin: Option<String>) -> Result<rustls::ClientConfig> {
    let verifier = Arc::new(DohCertVerifier::new(pin)?);
    let config = rustls::ClientConfig::builder_with_protocol_versions(&[
        &rustls::version::TLS12,
        &rustls::version::TLS13,
    ])
    .dangerous()
    .with_custom_certificate_verifier(verifier)
    .with_no_client_auth();
    Ok(config)
}
