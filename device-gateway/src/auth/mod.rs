//! # Authentication Strategies
//!
//! One capability set, three implementations selected once from
//! configuration:
//!
//! | Strategy | Secure datagram | Secure stream | Identity certificate |
//! |----------|-----------------|---------------|----------------------|
//! | [`NoneAuthentication`] | fails | fails | fails |
//! | [`PreSharedKeyAuthentication`] | PSK | unsupported | empty values |
//! | [`X509Authentication`] | certificate | certificate | CSR + install |
//!
//! Call sites depend only on [`AuthenticationStrategy`]. Credential state is
//! shared read-mostly and replaced through compare-and-swap cells, so
//! installing or resetting credentials never blocks a concurrent dial.

mod none;
mod psk;
mod verifier;
mod x509;

pub use none::NoneAuthentication;
pub use psk::{normalize_key, PreSharedKeyAuthentication};
pub use verifier::AnchoredDeviceVerifier;
pub use x509::{parse_certificate_chain, ParsedChain, X509Authentication};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::sync::Arc;

use shared::{
    config::{AuthenticationMode, TlsConfig},
    constants::PSK_KEY_LENGTH,
    error::{GatewayError, GatewayResult, StatusCode, TransportError},
    types::EndpointAddress,
};

use crate::transport::{DeviceConnection, ProtocolClient};

/// Identity certificate chain with its private key
#[derive(Clone)]
pub struct IdentityCredential {
    /// Chain, leaf first
    pub chain: Vec<CertificateDer<'static>>,

    /// Subject common name of the leaf
    pub common_name: String,

    /// Start of the leaf's validity window
    pub not_before: DateTime<Utc>,

    /// End of the leaf's validity window
    pub not_after: DateTime<Utc>,

    /// PKCS#8 encoded private key
    key_der: Arc<Vec<u8>>,
}

impl IdentityCredential {
    pub(crate) fn new(
        chain: Vec<CertificateDer<'static>>,
        common_name: String,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        key_der: Vec<u8>,
    ) -> Self {
        Self {
            chain,
            common_name,
            not_before,
            not_after,
            key_der: Arc::new(key_der),
        }
    }

    /// Private key in the form rustls expects
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.as_ref().clone()))
    }

    /// Check if `now` falls inside the validity window
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }
}

impl fmt::Debug for IdentityCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityCredential")
            .field("common_name", &self.common_name)
            .field("chain_len", &self.chain.len())
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Credential material handed to the ownership transfer. Certificate
/// strategies provision only their trust anchor; the device's own
/// certificate is signed remotely during the transfer.
#[derive(Debug, Clone, Default)]
pub struct OwnOptions {
    /// Symmetric key provisioned to the device
    pub preshared_key: Option<[u8; PSK_KEY_LENGTH]>,

    /// Trust anchors provisioned to the device
    pub trust_anchors: Vec<CertificateDer<'static>>,
}

/// Capability set of an authentication strategy
#[async_trait]
pub trait AuthenticationStrategy: Send + Sync {
    /// Mode this strategy implements
    fn mode(&self) -> AuthenticationMode;

    /// Dial a secure datagram session
    async fn dial_secure_datagram(
        &self,
        client: &dyn ProtocolClient,
        endpoint: &EndpointAddress,
    ) -> GatewayResult<Arc<dyn DeviceConnection>>;

    /// Dial a secure stream session
    async fn dial_secure_stream(
        &self,
        client: &dyn ProtocolClient,
        endpoint: &EndpointAddress,
    ) -> GatewayResult<Arc<dyn DeviceConnection>>;

    /// Identity devices are owned by
    fn owner_id(&self) -> GatewayResult<String>;

    /// Credential material for the ownership transfer
    fn own_options(&self) -> GatewayResult<OwnOptions>;

    /// PEM encoded CSR for `id`
    fn identity_csr(&self, id: &str) -> GatewayResult<Vec<u8>>;

    /// Install a signed certificate chain for `owner`
    fn set_identity_credential(&self, owner: &str, chain_pem: &[u8]) -> GatewayResult<()>;

    /// Currently installed identity credential
    fn identity_credential(&self) -> GatewayResult<Option<IdentityCredential>>;

    /// Trust anchors derived from the identity credential
    fn trust_anchors(&self) -> GatewayResult<Vec<CertificateDer<'static>>>;

    /// Owner the credentials were issued for, empty when unknown
    fn owner(&self) -> String;

    /// Check if the strategy holds usable credentials
    fn is_initialized(&self) -> bool;

    /// Drop all credential state
    fn reset(&self);
}

/// Build the strategy selected by configuration
pub fn strategy_from_config(config: &TlsConfig) -> Arc<dyn AuthenticationStrategy> {
    match config.authentication {
        AuthenticationMode::Uninitialized => Arc::new(NoneAuthentication),
        AuthenticationMode::PreSharedKey => {
            Arc::new(PreSharedKeyAuthentication::new(&config.pre_shared_key))
        }
        AuthenticationMode::X509 => Arc::new(X509Authentication::new()),
    }
}

/// Wrap a failed secure dial
fn dial_error(endpoint: &EndpointAddress, err: TransportError) -> GatewayError {
    GatewayError::from_transport(StatusCode::Unavailable, format!("cannot dial {endpoint}"), err)
}

/// Check if a compare-and-swap found the slot it expected
pub(crate) fn same_slot<T>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}
