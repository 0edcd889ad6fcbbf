//! Test fixtures: a throwaway certificate authority and a bearer token signer.

use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use rustls::pki_types::CertificateDer;

use crate::provisioning::{JsonWebKey, JsonWebKeySet};

/// Self-signed root CA that signs identity CSRs
pub(crate) struct TestAuthority {
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl TestAuthority {
    pub(crate) fn new() -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, "Gateway Test Root CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    pub(crate) fn der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    fn sign(&self, csr: CertificateSigningRequestParams) -> String {
        csr.signed_by(&self.cert, &self.key).unwrap().pem()
    }

    fn parse(csr_pem: &[u8]) -> CertificateSigningRequestParams {
        CertificateSigningRequestParams::from_pem(std::str::from_utf8(csr_pem).unwrap()).unwrap()
    }

    /// Leaf followed by the root
    pub(crate) fn sign_csr(&self, csr_pem: &[u8]) -> String {
        let leaf = self.sign(Self::parse(csr_pem));
        format!("{leaf}{}", self.cert.pem())
    }

    pub(crate) fn sign_csr_leaf_only(&self, csr_pem: &[u8]) -> String {
        self.sign(Self::parse(csr_pem))
    }

    /// Chain whose leaf expired long ago
    pub(crate) fn sign_csr_expired(&self, csr_pem: &[u8]) -> String {
        let mut csr = Self::parse(csr_pem);
        csr.params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        csr.params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        let leaf = self.sign(csr);
        format!("{leaf}{}", self.cert.pem())
    }
}

/// Signs EdDSA bearer tokens and publishes the matching key set
pub(crate) struct TokenSigner {
    kid: String,
    key: SigningKey,
}

impl TokenSigner {
    pub(crate) fn new(kid: &str) -> Self {
        Self {
            kid: kid.to_string(),
            key: SigningKey::generate(&mut OsRng),
        }
    }

    pub(crate) fn key_set(&self) -> JsonWebKeySet {
        JsonWebKeySet {
            keys: vec![JsonWebKey::ed25519(&self.kid, &self.key.verifying_key())],
        }
    }

    pub(crate) fn sign(&self, claims: &serde_json::Value) -> String {
        let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
        let header = serde_json::json!({ "alg": "EdDSA", "typ": "JWT", "kid": self.kid });
        let signing_input = format!(
            "{}.{}",
            engine.encode(serde_json::to_vec(&header).unwrap()),
            engine.encode(serde_json::to_vec(claims).unwrap())
        );
        let signature = self.key.sign(signing_input.as_bytes());
        format!("{signing_input}.{}", engine.encode(signature.to_bytes()))
    }
}
