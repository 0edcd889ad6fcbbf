use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use std::sync::Arc;

use shared::{
    config::AuthenticationMode,
    error::{GatewayError, GatewayResult},
    types::EndpointAddress,
};

use super::{AuthenticationStrategy, IdentityCredential, OwnOptions};
use crate::transport::{DeviceConnection, ProtocolClient};

/// Strategy of a deliberately uninitialized device service
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneAuthentication;

#[async_trait]
impl AuthenticationStrategy for NoneAuthentication {
    fn mode(&self) -> AuthenticationMode {
        AuthenticationMode::Uninitialized
    }

    async fn dial_secure_datagram(
        &self,
        _client: &dyn ProtocolClient,
        _endpoint: &EndpointAddress,
    ) -> GatewayResult<Arc<dyn DeviceConnection>> {
        Err(GatewayError::AuthenticationDisabled)
    }

    async fn dial_secure_stream(
        &self,
        _client: &dyn ProtocolClient,
        _endpoint: &EndpointAddress,
    ) -> GatewayResult<Arc<dyn DeviceConnection>> {
        Err(GatewayError::AuthenticationDisabled)
    }

    fn owner_id(&self) -> GatewayResult<String> {
        Err(GatewayError::AuthenticationDisabled)
    }

    fn own_options(&self) -> GatewayResult<OwnOptions> {
        Err(GatewayError::AuthenticationDisabled)
    }

    fn identity_csr(&self, _id: &str) -> GatewayResult<Vec<u8>> {
        Err(GatewayError::AuthenticationDisabled)
    }

    fn set_identity_credential(&self, _owner: &str, _chain_pem: &[u8]) -> GatewayResult<()> {
        Err(GatewayError::AuthenticationDisabled)
    }

    fn identity_credential(&self) -> GatewayResult<Option<IdentityCredential>> {
        Err(GatewayError::AuthenticationDisabled)
    }

    fn trust_anchors(&self) -> GatewayResult<Vec<CertificateDer<'static>>> {
        Err(GatewayError::AuthenticationDisabled)
    }

    fn owner(&self) -> String {
        String::new()
    }

    fn is_initialized(&self) -> bool {
        false
    }

    fn reset(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::error::StatusCode;

    #[test]
    fn test_every_capability_fails() {
        let auth = NoneAuthentication;
        assert!(!auth.is_initialized());
        assert!(matches!(auth.owner_id(), Err(GatewayError::AuthenticationDisabled)));
        assert!(matches!(auth.own_options(), Err(GatewayError::AuthenticationDisabled)));
        assert!(matches!(auth.trust_anchors(), Err(GatewayError::AuthenticationDisabled)));

        let err = auth.identity_csr("device").unwrap_err();
        assert_eq!(err.status(), StatusCode::Unimplemented);
        assert_eq!(err.to_string(), "Authentication method is set to none");
    }
}
