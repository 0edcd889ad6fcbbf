//! X.509 identity authentication.
//!
//! The private key is generated lazily on the first CSR request. The signed
//! chain is installed later, once an authority has signed that CSR. Both live
//! in atomically swapped slots and are committed with compare-and-swap loops.
//! A loop only repeats when another writer won the race, so it ends as soon
//! as one swap succeeds. Livelock is only theoretically possible under
//! pathological contention.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair};
use rustls::pki_types::CertificateDer;
use rustls::ClientConfig;
use std::sync::Arc;
use tracing::{debug, info};
use x509_parser::prelude::{FromDer, X509Certificate, X509Name};

use shared::{
    config::AuthenticationMode,
    constants::IDENTITY_CERTIFICATE_CN_PREFIX,
    error::{GatewayError, GatewayResult},
    types::EndpointAddress,
};

use super::verifier::client_config;
use super::{dial_error, same_slot, AuthenticationStrategy, IdentityCredential, OwnOptions};
use crate::transport::{DeviceConnection, ProtocolClient, SecureDialConfig};

// =============================================================================
// CERTIFICATE CHAIN PARSING
// =============================================================================

/// Certificate chain decoded from PEM, with leaf details
#[derive(Debug, Clone)]
pub struct ParsedChain {
    /// Chain, leaf first
    pub chain: Vec<CertificateDer<'static>>,

    /// Subject common name of the leaf
    pub common_name: String,

    /// Start of the leaf's validity window
    pub not_before: DateTime<Utc>,

    /// End of the leaf's validity window
    pub not_after: DateTime<Utc>,

    /// Raw subject public key of the leaf
    pub public_key: Vec<u8>,
}

impl ParsedChain {
    /// Identity carried by the leaf's `uuid:` common name
    pub fn identity(&self) -> GatewayResult<&str> {
        self.common_name
            .strip_prefix(IDENTITY_CERTIFICATE_CN_PREFIX)
            .ok_or_else(|| {
                GatewayError::InvalidCertificate(format!(
                    "common name '{}' does not carry an identity",
                    self.common_name
                ))
            })
    }

    /// Last certificate of the chain; must be a self-signed CA
    pub fn trust_anchor(&self) -> GatewayResult<CertificateDer<'static>> {
        let root = self
            .chain
            .last()
            .ok_or_else(|| GatewayError::InvalidCertificate("empty certificate chain".into()))?;
        let (_, cert) = X509Certificate::from_der(root.as_ref())?;
        if !cert.is_ca() {
            return Err(GatewayError::InvalidCertificate(
                "root certificate is not a CA".into(),
            ));
        }
        let subject = common_name(cert.subject());
        if subject.is_none() || subject != common_name(cert.issuer()) {
            return Err(GatewayError::InvalidCertificate(
                "root certificate is not self-signed".into(),
            ));
        }
        Ok(root.clone())
    }
}

fn common_name(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

fn timestamp(secs: i64) -> GatewayResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| GatewayError::InvalidCertificate(format!("invalid timestamp {secs}")))
}

/// Decode a PEM chain and the details of its leaf
pub fn parse_certificate_chain(pem: &[u8]) -> GatewayResult<ParsedChain> {
    let chain = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| GatewayError::InvalidCertificate(e.to_string()))?;
    let leaf_der = chain
        .first()
        .ok_or_else(|| GatewayError::InvalidCertificate("no certificate in PEM".into()))?;

    let (_, leaf) = X509Certificate::from_der(leaf_der.as_ref())?;
    let common_name = common_name(leaf.subject()).ok_or_else(|| {
        GatewayError::InvalidCertificate("certificate has no subject common name".into())
    })?;
    let validity = leaf.validity();
    let not_before = timestamp(validity.not_before.timestamp())?;
    let not_after = timestamp(validity.not_after.timestamp())?;
    let public_key = leaf.public_key().subject_public_key.data.to_vec();

    Ok(ParsedChain {
        common_name,
        not_before,
        not_after,
        public_key,
        chain,
    })
}

// =============================================================================
// STRATEGY
// =============================================================================

/// Installed identity with everything a dial needs
struct InstalledIdentity {
    owner: String,
    credential: IdentityCredential,
    trust_anchor: CertificateDer<'static>,
    tls: Arc<ClientConfig>,
}

/// Strategy authenticating with an identity certificate
#[derive(Default)]
pub struct X509Authentication {
    /// Key pair, created on first CSR request
    private_key: ArcSwapOption<KeyPair>,

    /// Signed identity, installed after the CSR was signed
    identity: ArcSwapOption<InstalledIdentity>,
}

impl X509Authentication {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current key pair, generating one if none was committed yet
    pub(crate) fn get_or_create_private_key(&self) -> GatewayResult<Arc<KeyPair>> {
        loop {
            let current = self.private_key.load_full();
            if let Some(key) = current {
                return Ok(key);
            }
            let generated = Arc::new(KeyPair::generate()?);
            let previous = self
                .private_key
                .compare_and_swap(&current, Some(Arc::clone(&generated)));
            if previous.is_none() {
                debug!("Generated identity private key");
                return Ok(generated);
            }
        }
    }

    /// Installed identity, failing outside its validity window
    fn valid_identity(&self) -> GatewayResult<Arc<InstalledIdentity>> {
        let identity = self
            .identity
            .load_full()
            .ok_or(GatewayError::CertificateNotSet)?;
        if !identity.credential.is_valid_at(Utc::now()) {
            return Err(GatewayError::CertificateNotValid {
                not_before: identity.credential.not_before.to_rfc3339(),
                not_after: identity.credential.not_after.to_rfc3339(),
            });
        }
        Ok(identity)
    }

    fn dial_config(&self) -> GatewayResult<SecureDialConfig> {
        let identity = self.valid_identity()?;
        Ok(SecureDialConfig::Certificate {
            credential: identity.credential.clone(),
            tls: Arc::clone(&identity.tls),
        })
    }
}

#[async_trait]
impl AuthenticationStrategy for X509Authentication {
    fn mode(&self) -> AuthenticationMode {
        AuthenticationMode::X509
    }

    async fn dial_secure_datagram(
        &self,
        client: &dyn ProtocolClient,
        endpoint: &EndpointAddress,
    ) -> GatewayResult<Arc<dyn DeviceConnection>> {
        let config = self.dial_config()?;
        debug!(endpoint = %endpoint, "Dialing secure datagram session with certificate");
        client
            .dial_secure(endpoint, config)
            .await
            .map_err(|e| dial_error(endpoint, e))
    }

    async fn dial_secure_stream(
        &self,
        client: &dyn ProtocolClient,
        endpoint: &EndpointAddress,
    ) -> GatewayResult<Arc<dyn DeviceConnection>> {
        let config = self.dial_config()?;
        debug!(endpoint = %endpoint, "Dialing secure stream session with certificate");
        client
            .dial_secure(endpoint, config)
            .await
            .map_err(|e| dial_error(endpoint, e))
    }

    fn owner_id(&self) -> GatewayResult<String> {
        let identity = self.valid_identity()?;
        let cn = &identity.credential.common_name;
        Ok(cn
            .strip_prefix(IDENTITY_CERTIFICATE_CN_PREFIX)
            .unwrap_or(cn)
            .to_string())
    }

    fn own_options(&self) -> GatewayResult<OwnOptions> {
        let identity = self.valid_identity()?;
        Ok(OwnOptions {
            preshared_key: None,
            trust_anchors: vec![identity.trust_anchor.clone()],
        })
    }

    fn identity_csr(&self, id: &str) -> GatewayResult<Vec<u8>> {
        let key = self.get_or_create_private_key()?;

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut subject = DistinguishedName::new();
        subject.push(
            DnType::CommonName,
            format!("{IDENTITY_CERTIFICATE_CN_PREFIX}{id}"),
        );
        params.distinguished_name = subject;
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let csr = params.serialize_request(&key)?;
        debug!(id = %id, "Created identity certificate signing request");
        Ok(csr.pem()?.into_bytes())
    }

    fn set_identity_credential(&self, owner: &str, chain_pem: &[u8]) -> GatewayResult<()> {
        let parsed = parse_certificate_chain(chain_pem)?;
        let key = self
            .private_key
            .load_full()
            .ok_or(GatewayError::PrivateKeyMissing)?;
        if parsed.public_key != key.public_key_raw() {
            return Err(GatewayError::InvalidCertificate(
                "certificate does not match the private key".into(),
            ));
        }
        let trust_anchor = parsed.trust_anchor()?;

        let credential = IdentityCredential::new(
            parsed.chain,
            parsed.common_name,
            parsed.not_before,
            parsed.not_after,
            key.serialize_der(),
        );
        let tls = client_config(&credential, std::slice::from_ref(&trust_anchor))?;
        let installed = Arc::new(InstalledIdentity {
            owner: owner.to_string(),
            credential,
            trust_anchor,
            tls,
        });

        loop {
            let current = self.identity.load_full();
            if let Some(existing) = &current {
                if existing.credential.common_name != installed.credential.common_name {
                    return Err(GatewayError::IdentityChanged {
                        current: existing.credential.common_name.clone(),
                        new: installed.credential.common_name.clone(),
                    });
                }
            }
            let previous = self
                .identity
                .compare_and_swap(&current, Some(Arc::clone(&installed)));
            if same_slot(&previous, &current) {
                info!(
                    owner = %owner,
                    common_name = %installed.credential.common_name,
                    not_after = %installed.credential.not_after,
                    "Installed identity certificate"
                );
                return Ok(());
            }
        }
    }

    fn identity_credential(&self) -> GatewayResult<Option<IdentityCredential>> {
        Ok(Some(self.valid_identity()?.credential.clone()))
    }

    fn trust_anchors(&self) -> GatewayResult<Vec<CertificateDer<'static>>> {
        let identity = self
            .identity
            .load_full()
            .ok_or(GatewayError::CertificateNotSet)?;
        Ok(vec![identity.trust_anchor.clone()])
    }

    fn owner(&self) -> String {
        self.identity
            .load_full()
            .map(|identity| identity.owner.clone())
            .unwrap_or_default()
    }

    fn is_initialized(&self) -> bool {
        self.valid_identity().is_ok()
    }

    fn reset(&self) {
        info!("Clearing identity certificate and private key");
        self.identity.store(None);
        self.private_key.store(None);
    }
}
