//! # Device Certificate Verifier
//!
//! Devices are addressed by IP and identified by the `uuid:` common name of
//! their certificate, so the usual host name check does not apply. The
//! verifier accepts a device certificate only when it chains to one of the
//! trust anchors derived from the gateway's own identity chain.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::verify_server_cert_signed_by_trust_anchor;
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::ParsedCertificate;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;

use shared::error::{GatewayError, GatewayResult};

use super::IdentityCredential;

/// Verifies device certificates against a fixed set of trust anchors
#[derive(Debug)]
pub struct AnchoredDeviceVerifier {
    /// Client CA pool
    roots: RootCertStore,

    /// Signature algorithms of the crypto provider
    algorithms: WebPkiSupportedAlgorithms,
}

impl AnchoredDeviceVerifier {
    pub fn new(trust_anchors: &[CertificateDer<'static>]) -> GatewayResult<Self> {
        let mut roots = RootCertStore::empty();
        for anchor in trust_anchors {
            roots
                .add(anchor.clone())
                .map_err(|e| GatewayError::TlsConfiguration(e.to_string()))?;
        }
        Ok(Self {
            roots,
            algorithms: ring::default_provider().signature_verification_algorithms,
        })
    }
}

impl ServerCertVerifier for AnchoredDeviceVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.algorithms.all,
        )?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Client configuration presenting `credential` and trusting `trust_anchors`
pub(crate) fn client_config(
    credential: &IdentityCredential,
    trust_anchors: &[CertificateDer<'static>],
) -> GatewayResult<Arc<ClientConfig>> {
    let verifier = AnchoredDeviceVerifier::new(trust_anchors)?;
    let config = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| GatewayError::TlsConfiguration(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(credential.chain.clone(), credential.private_key())
        .map_err(|e| GatewayError::TlsConfiguration(e.to_string()))?;
    Ok(Arc::new(config))
}
