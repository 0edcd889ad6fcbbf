//! Pre-shared key authentication.
//!
//! The secure datagram transport requires a fixed-size symmetric key, so the
//! configured key string is right-padded with zero bytes or truncated to
//! [`PSK_KEY_LENGTH`] bytes.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use shared::{
    config::{AuthenticationMode, PreSharedKeyConfig},
    constants::PSK_KEY_LENGTH,
    error::{GatewayError, GatewayResult},
    types::EndpointAddress,
};

use super::{dial_error, AuthenticationStrategy, IdentityCredential, OwnOptions};
use crate::transport::{DeviceConnection, ProtocolClient, SecureDialConfig};

/// Normalize a key string to exactly [`PSK_KEY_LENGTH`] bytes
pub fn normalize_key(key: &str) -> [u8; PSK_KEY_LENGTH] {
    let mut normalized = [0u8; PSK_KEY_LENGTH];
    let bytes = key.as_bytes();
    let len = bytes.len().min(PSK_KEY_LENGTH);
    normalized[..len].copy_from_slice(&bytes[..len]);
    normalized
}

#[derive(Debug, Default)]
struct PskCredential {
    subject: Uuid,
    key: String,
}

/// Strategy authenticating with a symmetric key bound to an owner UUID
pub struct PreSharedKeyAuthentication {
    /// Current subject and key
    credential: ArcSwap<PskCredential>,
}

impl PreSharedKeyAuthentication {
    pub fn new(config: &PreSharedKeyConfig) -> Self {
        Self {
            credential: ArcSwap::from_pointee(PskCredential {
                subject: config.subject_uuid(),
                key: config.key.clone(),
            }),
        }
    }

    /// Subject and normalized key, failing when either is missing
    fn dial_material(&self) -> GatewayResult<(Uuid, [u8; PSK_KEY_LENGTH])> {
        let credential = self.credential.load();
        if credential.subject.is_nil() {
            return Err(GatewayError::Unauthenticated("subjectId is empty".into()));
        }
        if credential.key.is_empty() {
            return Err(GatewayError::Unauthenticated("key is empty".into()));
        }
        Ok((credential.subject, normalize_key(&credential.key)))
    }
}

#[async_trait]
impl AuthenticationStrategy for PreSharedKeyAuthentication {
    fn mode(&self) -> AuthenticationMode {
        AuthenticationMode::PreSharedKey
    }

    async fn dial_secure_datagram(
        &self,
        client: &dyn ProtocolClient,
        endpoint: &EndpointAddress,
    ) -> GatewayResult<Arc<dyn DeviceConnection>> {
        let (identity, key) = self.dial_material()?;
        debug!(endpoint = %endpoint, identity = %identity, "Dialing with pre-shared key");
        client
            .dial_secure(endpoint, SecureDialConfig::PreSharedKey { identity, key })
            .await
            .map_err(|e| dial_error(endpoint, e))
    }

    async fn dial_secure_stream(
        &self,
        _client: &dyn ProtocolClient,
        _endpoint: &EndpointAddress,
    ) -> GatewayResult<Arc<dyn DeviceConnection>> {
        Err(GatewayError::NotSupported {
            mode: "pre-shared key",
            operation: "secure stream dial",
        })
    }

    fn owner_id(&self) -> GatewayResult<String> {
        Ok(self.credential.load().subject.to_string())
    }

    fn own_options(&self) -> GatewayResult<OwnOptions> {
        let (_, key) = self.dial_material()?;
        Ok(OwnOptions {
            preshared_key: Some(key),
            ..Default::default()
        })
    }

    fn identity_csr(&self, _id: &str) -> GatewayResult<Vec<u8>> {
        Err(GatewayError::NotSupported {
            mode: "pre-shared key",
            operation: "identity CSR",
        })
    }

    fn set_identity_credential(&self, _owner: &str, _chain_pem: &[u8]) -> GatewayResult<()> {
        Err(GatewayError::NotSupported {
            mode: "pre-shared key",
            operation: "identity certificate update",
        })
    }

    fn identity_credential(&self) -> GatewayResult<Option<IdentityCredential>> {
        Ok(None)
    }

    fn trust_anchors(&self) -> GatewayResult<Vec<CertificateDer<'static>>> {
        Ok(Vec::new())
    }

    fn owner(&self) -> String {
        let credential = self.credential.load();
        if credential.subject.is_nil() {
            String::new()
        } else {
            credential.subject.to_string()
        }
    }

    fn is_initialized(&self) -> bool {
        let credential = self.credential.load();
        !credential.subject.is_nil() && !credential.key.is_empty()
    }

    fn reset(&self) {
        info!("Clearing pre-shared key credentials");
        self.credential.store(Arc::new(PskCredential::default()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devsim::SimulatedFleet;
    use shared::error::StatusCode;

    fn config(subject: &str, key: &str) -> PreSharedKeyConfig {
        PreSharedKeyConfig {
            subject_id: subject.into(),
            key: key.into(),
        }
    }

    #[test]
    fn test_normalize_key() {
        let key = normalize_key("abc");
        assert_eq!(&key[..3], b"abc");
        assert!(key[3..].iter().all(|b| *b == 0));

        let key = normalize_key("0123456789abcdefXYZ");
        assert_eq!(&key, b"0123456789abcdef");
    }

    #[test]
    fn test_is_initialized() {
        let subject = Uuid::new_v4().to_string();
        assert!(PreSharedKeyAuthentication::new(&config(&subject, "secret")).is_initialized());
        assert!(!PreSharedKeyAuthentication::new(&config(&subject, "")).is_initialized());
        assert!(!PreSharedKeyAuthentication::new(&config("", "secret")).is_initialized());
    }

    #[tokio::test]
    async fn test_empty_credentials_fail_before_dialing() {
        let fleet = SimulatedFleet::new();
        let auth = PreSharedKeyAuthentication::new(&config("", ""));
        assert!(!auth.is_initialized());

        let endpoint = EndpointAddress::parse("coaps://127.0.0.1:5684").unwrap();
        let err = auth
            .dial_secure_datagram(&fleet, &endpoint)
            .await
            .err()
            .unwrap();
        assert_eq!(err.status(), StatusCode::Unauthenticated);
        assert_eq!(fleet.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_secure_stream_unsupported() {
        let fleet = SimulatedFleet::new();
        let auth = PreSharedKeyAuthentication::new(&config(&Uuid::new_v4().to_string(), "k"));
        let endpoint = EndpointAddress::parse("coaps+tcp://127.0.0.1:5684").unwrap();
        let err = auth
            .dial_secure_stream(&fleet, &endpoint)
            .await
            .err()
            .unwrap();
        assert_eq!(err.status(), StatusCode::Unimplemented);
    }

    #[test]
    fn test_identity_operations_are_empty() {
        let subject = Uuid::new_v4();
        let auth = PreSharedKeyAuthentication::new(&config(&subject.to_string(), "secret"));
        assert!(auth.identity_credential().unwrap().is_none());
        assert!(auth.trust_anchors().unwrap().is_empty());
        assert_eq!(auth.owner_id().unwrap(), subject.to_string());
        assert_eq!(
            auth.own_options().unwrap().preshared_key,
            Some(normalize_key("secret"))
        );
        assert_eq!(
            auth.identity_csr("x").unwrap_err().status(),
            StatusCode::Unimplemented
        );
    }

    #[test]
    fn test_reset_clears_credentials() {
        let auth = PreSharedKeyAuthentication::new(&config(&Uuid::new_v4().to_string(), "k"));
        auth.reset();
        assert!(!auth.is_initialized());
        assert_eq!(auth.owner(), "");
        assert_eq!(
            auth.own_options().unwrap_err().status(),
            StatusCode::Unauthenticated
        );
    }
}
