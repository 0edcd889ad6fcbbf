//! # Device Gateway Service
//!
//! The operation surface of the gateway. A transport binding (gRPC, HTTP)
//! only encodes and decodes these calls; every failure carries a
//! [`GatewayError`] whose [`StatusCode`](shared::error::StatusCode) the
//! binding reports.
//!
//! ## State
//!
//! - the device cache, shared with discovery
//! - the active device service (authentication strategy), swapped
//!   atomically on initialization and reset
//! - CSR challenges and the owner's JSON web key set for remote provisioning
//! - device ownership transfers waiting for a remotely signed certificate
//!
//! Initialization, identity activation and reset are serialized by one
//! initialization lock. Device operations never take it.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use shared::{
    config::{
        AuthenticationMode, GatewayConfig, PreSharedKeyConfig, RemoteProvisioningMode,
    },
    error::{GatewayError, GatewayResult},
    types::{owner_to_uuid, Content, DeviceId, DeviceSummary, DiscoveryFilter, ResourceLinks},
    VERSION,
};

use crate::auth::{
    parse_certificate_chain, strategy_from_config, AuthenticationStrategy, NoneAuthentication,
    PreSharedKeyAuthentication, X509Authentication,
};
use crate::cache::DeviceCache;
use crate::device::DeviceRecord;
use crate::discovery::DiscoveryEngine;
use crate::ownership::{start_remote_sign, OwnershipClient, PendingOwnership, RemoteSignStart};
use crate::provisioning::{verify_token, ChallengeCache, JsonWebKeySet, KeySetCache};
use crate::resource::ResourceClient;
use crate::transport::ProtocolClient;

// =============================================================================
// DEVICE SERVICE
// =============================================================================

/// Active authentication setup used for every device operation
pub struct DeviceService {
    strategy: Arc<dyn AuthenticationStrategy>,
}

impl DeviceService {
    pub fn new(strategy: Arc<dyn AuthenticationStrategy>) -> Self {
        Self { strategy }
    }

    fn uninitialized() -> Self {
        Self::new(Arc::new(NoneAuthentication))
    }

    pub fn strategy(&self) -> &dyn AuthenticationStrategy {
        self.strategy.as_ref()
    }

    pub fn mode(&self) -> AuthenticationMode {
        self.strategy.mode()
    }

    pub fn is_initialized(&self) -> bool {
        self.strategy.is_initialized()
    }
}

/// Snapshot reported by [`DeviceGateway::get_configuration`]
#[derive(Debug, Clone, Serialize)]
pub struct GatewayConfiguration {
    pub version: String,
    pub authentication_mode: AuthenticationMode,
    pub is_initialized: bool,
    pub owner: String,
    pub remote_provisioning_mode: RemoteProvisioningMode,
    pub current_time: DateTime<Utc>,
}

/// CSR challenge issued to the caller
#[derive(Debug, Clone, Serialize)]
pub struct IdentityChallenge {
    /// PEM encoded certificate signing request
    pub certificate_signing_request: Vec<u8>,

    /// Read-once state token to present with the signed certificate
    pub state: String,
}

fn parse_device_id(id: &str) -> GatewayResult<DeviceId> {
    DeviceId::parse_str(id).map_err(|_| GatewayError::InvalidDeviceId(id.to_string()))
}

// =============================================================================
// GATEWAY
// =============================================================================

/// Device gateway over one protocol client
pub struct DeviceGateway {
    config: GatewayConfig,
    client: Arc<dyn ProtocolClient>,
    cache: Arc<DeviceCache>,
    discovery: DiscoveryEngine,
    device_service: ArcSwap<DeviceService>,
    challenges: ChallengeCache<Arc<DeviceService>>,
    own_signs: ChallengeCache<Arc<PendingOwnership>>,
    key_set: KeySetCache,
    initialization: Mutex<()>,
}

impl DeviceGateway {
    pub fn new(config: GatewayConfig, client: Arc<dyn ProtocolClient>) -> GatewayResult<Self> {
        config.validate()?;

        let cache = Arc::new(DeviceCache::new());
        let discovery = DiscoveryEngine::new(
            Arc::clone(&client),
            Arc::clone(&cache),
            config.discovery.clone(),
        );
        let strategy = strategy_from_config(&config.device.tls);
        let challenges =
            ChallengeCache::new(config.remote_provisioning.csr_challenge_expiration());
        let own_signs = ChallengeCache::new(config.remote_provisioning.own_sign_timeout());

        info!(
            authentication = %strategy.mode(),
            remote_provisioning = ?config.remote_provisioning.mode,
            "Device gateway created"
        );

        Ok(Self {
            config,
            client,
            cache,
            discovery,
            device_service: ArcSwap::from_pointee(DeviceService::new(strategy)),
            challenges,
            own_signs,
            key_set: KeySetCache::new(),
            initialization: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn device_service(&self) -> Arc<DeviceService> {
        self.device_service.load_full()
    }

    fn device(&self, id: &str) -> GatewayResult<Arc<DeviceRecord>> {
        self.cache.get(parse_device_id(id)?)
    }

    fn user_agent_mode(&self) -> GatewayResult<()> {
        if self.config.remote_provisioning.mode != RemoteProvisioningMode::UserAgent {
            return Err(GatewayError::RemoteProvisioningDisabled);
        }
        Ok(())
    }

    // =========================================================================
    // DEVICES
    // =========================================================================

    /// Discover devices; failures of single targets only shrink the result
    pub async fn discover_devices(
        &self,
        filter: DiscoveryFilter,
    ) -> GatewayResult<Vec<DeviceSummary>> {
        self.discovery.discover(filter).await
    }

    /// Refresh a cached device from its identity resource
    pub async fn get_device(&self, id: &str) -> GatewayResult<DeviceSummary> {
        let record = self.device(id)?;
        let service = self.device_service();
        ResourceClient::new(self.client.as_ref(), service.strategy(), &record)
            .refresh_device()
            .await
    }

    pub async fn get_device_resource_links(&self, id: &str) -> GatewayResult<ResourceLinks> {
        let record = self.device(id)?;
        let service = self.device_service();
        ResourceClient::new(self.client.as_ref(), service.strategy(), &record)
            .refresh_links()
            .await
    }

    /// Own a device. Certificate-based services return the device's CSR
    /// challenge; the transfer completes in [`Self::finish_own_device`].
    pub async fn own_device(&self, id: &str) -> GatewayResult<Option<IdentityChallenge>> {
        let record = self.device(id)?;
        let service = self.device_service();
        let methods = &self.config.device.ownership_transfer_methods;
        if service.mode() != AuthenticationMode::X509 {
            OwnershipClient::new(self.client.as_ref(), service.strategy(), &record)
                .own(methods)
                .await?;
            return Ok(None);
        }

        let device_id = record.id();
        let client = Arc::clone(&self.client);
        let methods = methods.clone();
        let timeout = self.config.remote_provisioning.own_sign_timeout();
        let start = start_remote_sign(device_id, timeout, move |signer| async move {
            OwnershipClient::new(client.as_ref(), service.strategy(), &record)
                .own_signed(&methods, signer)
                .await
        })
        .await?;
        match start {
            RemoteSignStart::Completed => Ok(None),
            RemoteSignStart::Pending { csr, ownership } => {
                let state = self.own_signs.issue(Arc::new(ownership)).await;
                info!(device_id = %device_id, state = %state, "Device certificate signing requested");
                Ok(Some(IdentityChallenge {
                    certificate_signing_request: csr,
                    state: state.to_string(),
                }))
            }
        }
    }

    /// Complete a remotely signed ownership transfer with the device's
    /// signed certificate chain
    pub async fn finish_own_device(
        &self,
        id: &str,
        state: &str,
        certificate_pem: &[u8],
    ) -> GatewayResult<()> {
        self.user_agent_mode()?;
        if self.device_service().mode() != AuthenticationMode::X509 {
            return Err(GatewayError::RemoteProvisioningDisabled);
        }
        let device_id = parse_device_id(id)?;
        let ownership = self.own_signs.consume(state).await?;
        if ownership.device_id() != device_id {
            warn!(device_id = %device_id, state = %state, "Signing state belongs to another device");
            return Err(GatewayError::InvalidState);
        }
        ownership.finish(certificate_pem.to_vec()).await?;
        info!(device_id = %device_id, "Device owned with remotely signed certificate");
        Ok(())
    }

    pub async fn disown_device(&self, id: &str) -> GatewayResult<()> {
        let record = self.device(id)?;
        let service = self.device_service();
        OwnershipClient::new(self.client.as_ref(), service.strategy(), &record)
            .disown(&self.cache)
            .await
    }

    /// Evict every cached device; never fails
    pub async fn clear_cache(&self) {
        self.cache.delete_all().await;
    }

    // =========================================================================
    // RESOURCES
    // =========================================================================

    pub async fn get_resource(
        &self,
        id: &str,
        href: &str,
        interface: Option<&str>,
    ) -> GatewayResult<Content> {
        let record = self.device(id)?;
        let service = self.device_service();
        ResourceClient::new(self.client.as_ref(), service.strategy(), &record)
            .get(href, interface)
            .await
    }

    pub async fn create_resource(
        &self,
        id: &str,
        href: &str,
        content: &Content,
    ) -> GatewayResult<Content> {
        let record = self.device(id)?;
        let service = self.device_service();
        ResourceClient::new(self.client.as_ref(), service.strategy(), &record)
            .create(href, content)
            .await
    }

    pub async fn update_resource(
        &self,
        id: &str,
        href: &str,
        content: &Content,
    ) -> GatewayResult<Content> {
        let record = self.device(id)?;
        let service = self.device_service();
        ResourceClient::new(self.client.as_ref(), service.strategy(), &record)
            .update(href, content)
            .await
    }

    pub async fn delete_resource(&self, id: &str, href: &str) -> GatewayResult<Content> {
        let record = self.device(id)?;
        let service = self.device_service();
        ResourceClient::new(self.client.as_ref(), service.strategy(), &record)
            .delete(href)
            .await
    }

    // =========================================================================
    // CONFIGURATION AND INITIALIZATION
    // =========================================================================

    pub fn get_configuration(&self) -> GatewayConfiguration {
        let service = self.device_service();
        let is_initialized = service.is_initialized();
        let remote_provisioning_mode = match (is_initialized, service.mode()) {
            (true, AuthenticationMode::X509) => RemoteProvisioningMode::UserAgent,
            (true, _) => RemoteProvisioningMode::None,
            (false, _) => self.config.remote_provisioning.mode,
        };
        GatewayConfiguration {
            version: VERSION.to_string(),
            authentication_mode: service.mode(),
            is_initialized,
            owner: service.strategy().owner(),
            remote_provisioning_mode,
            current_time: Utc::now(),
        }
    }

    /// Activate `service`, dropping remote provisioning state and cached devices
    async fn activate(&self, service: Arc<DeviceService>) {
        self.key_set.clear();
        self.challenges.clear().await;
        self.own_signs.clear().await;
        self.device_service.store(service);
        self.cache.delete_all().await;
    }

    /// Initialize with a pre-shared key
    pub async fn initialize_with_psk(&self, subject_id: &str, key: &str) -> GatewayResult<()> {
        let _guard = self.initialization.lock().await;
        if self.device_service().is_initialized() {
            return Err(GatewayError::AlreadyInitialized);
        }
        if subject_id.is_empty() {
            return Err(GatewayError::Configuration(
                "invalid pre-shared subject id".into(),
            ));
        }
        if key.is_empty() {
            return Err(GatewayError::Configuration("invalid pre-shared key".into()));
        }

        let strategy = PreSharedKeyAuthentication::new(&PreSharedKeyConfig {
            subject_id: subject_id.to_string(),
            key: key.to_string(),
        });
        let owner = strategy.owner();
        self.activate(Arc::new(DeviceService::new(Arc::new(strategy))))
            .await;
        info!(owner = %owner, "Initialized with pre-shared key");
        Ok(())
    }

    /// Start remote provisioning: install the owner's keys and issue a CSR
    /// for a pending certificate-based service
    pub async fn initialize_remote_provisioning(
        &self,
        token: &str,
        key_set_json: &[u8],
    ) -> GatewayResult<IdentityChallenge> {
        self.user_agent_mode()?;
        let _guard = self.initialization.lock().await;
        if self.device_service().is_initialized() {
            return Err(GatewayError::AlreadyInitialized);
        }

        let owner_id = self.update_key_set(token, key_set_json)?;
        let pending = Arc::new(DeviceService::new(Arc::new(X509Authentication::new())));
        let csr = match pending.strategy().identity_csr(&owner_id.to_string()) {
            Ok(csr) => csr,
            Err(e) => {
                self.key_set.clear();
                return Err(e);
            }
        };
        let state = self.challenges.issue(pending).await;
        info!(owner = %owner_id, state = %state, "Remote provisioning started");
        Ok(IdentityChallenge {
            certificate_signing_request: csr,
            state: state.to_string(),
        })
    }

    /// CSR from the active service for `owner`
    pub async fn issue_identity_csr(&self, owner: &str) -> GatewayResult<IdentityChallenge> {
        let service = self.device_service();
        let id = owner_to_uuid(owner);
        let csr = service.strategy().identity_csr(&id.to_string())?;
        let state = self.challenges.issue(service).await;
        Ok(IdentityChallenge {
            certificate_signing_request: csr,
            state: state.to_string(),
        })
    }

    /// Install the signed certificate for a challenge; a pending service
    /// becomes the active one
    pub async fn finish_identity_provisioning(
        &self,
        token: &str,
        state: &str,
        certificate_pem: &[u8],
    ) -> GatewayResult<()> {
        self.user_agent_mode()?;
        let service = self.challenges.consume(state).await?;
        let verified = self
            .key_set
            .verify(token, &self.config.remote_provisioning.owner_claim)?;

        let chain = parse_certificate_chain(certificate_pem)?;
        let identity = chain.identity()?;
        let expected = verified.owner_id.to_string();
        if identity != expected {
            warn!(expected = %expected, actual = %identity, "Certificate identity does not match token owner");
            return Err(GatewayError::InvalidOwnerId {
                expected,
                actual: identity.to_string(),
            });
        }

        if Arc::ptr_eq(&service, &self.device_service()) {
            service
                .strategy()
                .set_identity_credential(&verified.owner, certificate_pem)?;
            info!(owner = %verified.owner, "Identity certificate renewed");
            return Ok(());
        }

        let _guard = self.initialization.lock().await;
        if self.device_service().is_initialized() {
            return Err(GatewayError::AlreadyInitialized);
        }
        service
            .strategy()
            .set_identity_credential(&verified.owner, certificate_pem)?;
        // keep the key set: it authorizes later key and certificate updates
        self.challenges.clear().await;
        self.device_service.store(service);
        self.cache.delete_all().await;
        info!(owner = %verified.owner, "Initialized with identity certificate");
        Ok(())
    }

    /// Return to the uninitialized state
    pub async fn reset(&self) -> GatewayResult<()> {
        let _guard = self.initialization.lock().await;
        let service = self.device_service();
        if !service.is_initialized() {
            return Err(GatewayError::NotInitialized);
        }
        service.strategy().reset();
        self.activate(Arc::new(DeviceService::uninitialized())).await;
        info!("Device gateway reset");
        Ok(())
    }

    // =========================================================================
    // JSON WEB KEYS
    // =========================================================================

    pub fn get_json_web_keys(&self) -> GatewayResult<JsonWebKeySet> {
        self.user_agent_mode()?;
        self.key_set
            .get()
            .map(|cached| cached.keys.clone())
            .ok_or(GatewayError::KeySetUnavailable)
    }

    /// Replace the key set; the token must be signed by one of the new keys
    /// and belong to the owner of the current set
    pub async fn update_json_web_keys(&self, token: &str, key_set_json: &[u8]) -> GatewayResult<()> {
        self.user_agent_mode()?;
        self.update_key_set(token, key_set_json)?;
        Ok(())
    }

    fn update_key_set(&self, token: &str, key_set_json: &[u8]) -> GatewayResult<uuid::Uuid> {
        let keys = JsonWebKeySet::parse(key_set_json)?;
        let verified = verify_token(token, &keys, &self.config.remote_provisioning.owner_claim)
            .map_err(|e| match e {
                GatewayError::InvalidToken(reason) => {
                    GatewayError::Unauthenticated(format!("cannot get owner from token: {reason}"))
                }
                other => other,
            })?;
        self.key_set.update(verified.owner_id, keys)?;
        Ok(verified.owner_id)
    }
}
