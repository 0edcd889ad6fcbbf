//! # Ownership
//!
//! Owning and disowning a cached device. Both operations re-fetch the
//! device's resource links first, so the decision is taken on the current
//! ownership status rather than on what discovery last saw.
//!
//! - **Own**: runs the transfer with the active strategy's credentials and
//!   marks the record owned; the record stays cached. Certificate
//!   strategies run it in two steps (see [`remote_sign`]): the device's CSR
//!   goes out to the caller and the signed certificate comes back in.
//! - **Disown**: only for owned devices. Resets the device over a secure
//!   session and evicts the record, so the device is unknown until it is
//!   discovered again.

mod remote_sign;

pub use remote_sign::{start_remote_sign, PendingOwnership, RemoteSignStart};

use std::sync::Arc;
use tracing::{info, warn};

use shared::{
    config::OwnershipTransferMethod,
    constants::*,
    error::{GatewayError, GatewayResult, StatusCode},
    types::{OwnershipStatus, ResourceLinks},
};

use crate::auth::AuthenticationStrategy;
use crate::cache::DeviceCache;
use crate::device::DeviceRecord;
use crate::resource::ResourceClient;
use crate::transport::{CertificateSigner, DeviceConnection, OwnRequest, ProtocolClient};

/// Ownership transitions of one cached device
pub struct OwnershipClient<'a> {
    client: &'a dyn ProtocolClient,
    auth: &'a dyn AuthenticationStrategy,
    record: &'a DeviceRecord,
}

impl<'a> OwnershipClient<'a> {
    pub fn new(
        client: &'a dyn ProtocolClient,
        auth: &'a dyn AuthenticationStrategy,
        record: &'a DeviceRecord,
    ) -> Self {
        Self {
            client,
            auth,
            record,
        }
    }

    fn resources(&self) -> ResourceClient<'a> {
        ResourceClient::new(self.client, self.auth, self.record)
    }

    /// Transfer ownership of the device to the configured owner
    pub async fn own(&self, methods: &[OwnershipTransferMethod]) -> GatewayResult<()> {
        self.transfer(methods, None).await
    }

    /// Transfer ownership, provisioning a device certificate from `signer`
    pub async fn own_signed(
        &self,
        methods: &[OwnershipTransferMethod],
        signer: Arc<dyn CertificateSigner>,
    ) -> GatewayResult<()> {
        self.transfer(methods, Some(signer)).await
    }

    async fn transfer(
        &self,
        methods: &[OwnershipTransferMethod],
        signer: Option<Arc<dyn CertificateSigner>>,
    ) -> GatewayResult<()> {
        let id = self.record.id();
        let links = self.resources().refresh_links().await?;
        let options = self.auth.own_options()?;
        let owner_id = self.auth.owner_id()?;

        self.client
            .own(OwnRequest {
                device_id: id,
                links,
                owner_id: owner_id.clone(),
                methods: methods.to_vec(),
                options,
                signer,
            })
            .await
            .map_err(|e| {
                GatewayError::from_transport(
                    StatusCode::Unavailable,
                    format!("cannot own device {id}"),
                    e,
                )
            })?;

        self.record.set_ownership_status(OwnershipStatus::Owned);
        info!(device_id = %id, owner = %owner_id, "Device owned");
        Ok(())
    }

    /// Reset an owned device and evict it from `cache`
    pub async fn disown(&self, cache: &DeviceCache) -> GatewayResult<()> {
        let id = self.record.id();
        let links = self.resources().refresh_links().await?;
        if self.record.ownership_status() != OwnershipStatus::Owned {
            return Err(GatewayError::DeviceNotOwned(id));
        }

        let connection = self.secure_connection(&links).await?;
        self.client
            .disown(connection.as_ref(), &links)
            .await
            .map_err(|e| {
                GatewayError::from_transport(
                    StatusCode::Unavailable,
                    format!("cannot disown device {id}"),
                    e,
                )
            })?;
        info!(device_id = %id, "Device disowned");

        if let Err(e) = cache.delete(id).await {
            warn!(device_id = %id, error = %e, "Cannot remove device from cache");
        }
        Ok(())
    }

    /// Secure session over an endpoint of the security resources
    async fn secure_connection(
        &self,
        links: &ResourceLinks,
    ) -> GatewayResult<Arc<dyn DeviceConnection>> {
        let id = self.record.id();
        let link = links
            .by_type(RESOURCE_TYPE_PSTAT)
            .or_else(|| links.by_type(RESOURCE_TYPE_DOXM))
            .ok_or_else(|| GatewayError::ResourceLinkNotFound {
                device_id: id,
                href: RESOURCE_HREF_PSTAT.to_string(),
            })?;

        let mut first_error = None;
        for endpoint in link.secure_endpoints() {
            match self
                .record
                .connection(self.client, self.auth, &endpoint)
                .await
            {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error.unwrap_or(GatewayError::NoUsableEndpoint {
            device_id: id,
            href: link.href.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{NoneAuthentication, PreSharedKeyAuthentication};
    use crate::devsim::SimulatedFleet;
    use crate::discovery::DiscoveryEngine;
    use shared::config::{DiscoveryConfig, PreSharedKeyConfig};
    use shared::types::{DiscoveryFilter, IpFamily};
    use uuid::Uuid;

    const METHODS: &[OwnershipTransferMethod] = &[OwnershipTransferMethod::JustWorks];

    async fn discover(fleet: &SimulatedFleet, cache: &Arc<DeviceCache>) {
        let engine = DiscoveryEngine::new(
            Arc::new(fleet.clone()),
            Arc::clone(cache),
            DiscoveryConfig::default(),
        );
        let filter = DiscoveryFilter {
            use_multicast: vec![IpFamily::V4],
            ..Default::default()
        };
        engine.discover(filter).await.unwrap();
    }

    fn psk() -> PreSharedKeyAuthentication {
        PreSharedKeyAuthentication::new(&PreSharedKeyConfig {
            subject_id: Uuid::new_v4().to_string(),
            key: "secret".into(),
        })
    }

    #[tokio::test]
    async fn test_own_then_disown_evicts() {
        let fleet = SimulatedFleet::new();
        let id = fleet.add_device("light");
        let cache = Arc::new(DeviceCache::new());
        discover(&fleet, &cache).await;
        let auth = psk();
        let record = cache.get(id).unwrap();
        let ownership = OwnershipClient::new(&fleet, &auth, &record);

        ownership.own(METHODS).await.unwrap();
        assert_eq!(record.ownership_status(), OwnershipStatus::Owned);
        assert_eq!(fleet.owner(id), Some(auth.owner()));

        ownership.disown(&cache).await.unwrap();
        assert!(!fleet.is_owned(id));
        assert_eq!(
            cache.get(id).err().unwrap().status(),
            StatusCode::NotFound
        );
        assert!(fleet.closed_count() >= 1);
    }

    #[tokio::test]
    async fn test_disown_unowned_is_denied() {
        let fleet = SimulatedFleet::new();
        let id = fleet.add_device("light");
        let cache = Arc::new(DeviceCache::new());
        discover(&fleet, &cache).await;
        let auth = psk();
        let record = cache.get(id).unwrap();

        let err = OwnershipClient::new(&fleet, &auth, &record)
            .disown(&cache)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::PermissionDenied);
        assert!(cache.get(id).is_ok());
    }

    #[tokio::test]
    async fn test_own_without_authentication() {
        let fleet = SimulatedFleet::new();
        let id = fleet.add_device("light");
        let cache = Arc::new(DeviceCache::new());
        discover(&fleet, &cache).await;
        let record = cache.get(id).unwrap();

        let err = OwnershipClient::new(&fleet, &NoneAuthentication, &record)
            .own(METHODS)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::Unimplemented);
        assert!(!fleet.is_owned(id));
    }

    #[tokio::test]
    async fn test_own_device_owned_by_other() {
        let fleet = SimulatedFleet::new();
        let id = fleet.add_device("light");
        let cache = Arc::new(DeviceCache::new());
        discover(&fleet, &cache).await;
        let record = cache.get(id).unwrap();

        let first = psk();
        OwnershipClient::new(&fleet, &first, &record)
            .own(METHODS)
            .await
            .unwrap();

        let second = psk();
        let err = OwnershipClient::new(&fleet, &second, &record)
            .own(METHODS)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::PermissionDenied);
        assert_eq!(fleet.owner(id), Some(first.owner()));
    }

    #[tokio::test]
    async fn test_own_device_without_security() {
        let fleet = SimulatedFleet::new();
        let id = fleet.add_device_without_security("sensor");
        let cache = Arc::new(DeviceCache::new());
        discover(&fleet, &cache).await;
        let auth = psk();
        let record = cache.get(id).unwrap();

        let err = OwnershipClient::new(&fleet, &auth, &record)
            .own(METHODS)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::Unimplemented);
        assert_eq!(record.ownership_status(), OwnershipStatus::Unsupported);
    }
}
