//! # Configuration for the Device Gateway
//!
//! Configuration structures with defaults, environment overrides and
//! validation. Loading from files is left to the embedding application,
//! which deserializes these structures with serde.

use crate::constants::*;
use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// GATEWAY CONFIGURATION
// =============================================================================

/// Root configuration of the gateway
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Device service (protocol client and authentication)
    #[serde(default)]
    pub device: DeviceServiceConfig,

    /// Discovery settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Remote identity provisioning settings
    #[serde(default)]
    pub remote_provisioning: RemoteProvisioningConfig,
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> GatewayResult<Self> {
        let mut config = Self::default();

        if let Ok(mode) = env::var(ENV_AUTHENTICATION) {
            config.device.tls.authentication = mode.parse()?;
        }

        if let Ok(subject_id) = env::var(ENV_PSK_SUBJECT_ID) {
            config.device.tls.pre_shared_key.subject_id = subject_id;
        }

        if let Ok(key) = env::var(ENV_PSK_KEY) {
            config.device.tls.pre_shared_key.key = key;
        }

        if let Ok(timeout) = env::var(ENV_DISCOVERY_TIMEOUT_MS) {
            config.discovery.timeout_ms = parse_number(ENV_DISCOVERY_TIMEOUT_MS, &timeout)?;
        }

        if let Ok(mode) = env::var(ENV_REMOTE_PROVISIONING_MODE) {
            config.remote_provisioning.mode = mode.parse()?;
        }

        if let Ok(expiration) = env::var(ENV_CSR_CHALLENGE_EXPIRATION_SECS) {
            config.remote_provisioning.csr_challenge_state_expiration_secs =
                parse_number(ENV_CSR_CHALLENGE_EXPIRATION_SECS, &expiration)?;
        }

        if let Ok(timeout) = env::var(ENV_OWN_SIGN_TIMEOUT_SECS) {
            config.remote_provisioning.own_sign_timeout_secs =
                parse_number(ENV_OWN_SIGN_TIMEOUT_SECS, &timeout)?;
        }

        if let Ok(claim) = env::var(ENV_OWNER_CLAIM) {
            config.remote_provisioning.owner_claim = claim;
        }

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> GatewayResult<()> {
        self.device.validate()?;
        self.discovery.validate()?;
        self.remote_provisioning.validate()?;
        Ok(())
    }
}

fn parse_number(name: &str, value: &str) -> GatewayResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| GatewayError::Configuration(format!("{name}: '{value}' is not a number")))
}

// =============================================================================
// DEVICE SERVICE CONFIGURATION
// =============================================================================

/// How the gateway authenticates to devices
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum AuthenticationMode {
    /// No credentials; only insecure operations work
    #[default]
    Uninitialized,
    /// Symmetric pre-shared key
    PreSharedKey,
    /// X.509 identity certificate
    X509,
}

impl AuthenticationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthenticationMode::Uninitialized => "uninitialized",
            AuthenticationMode::PreSharedKey => "preSharedKey",
            AuthenticationMode::X509 => "x509",
        }
    }
}

impl FromStr for AuthenticationMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "uninitialized" | "none" => Ok(AuthenticationMode::Uninitialized),
            "presharedkey" | "psk" => Ok(AuthenticationMode::PreSharedKey),
            "x509" => Ok(AuthenticationMode::X509),
            other => Err(GatewayError::Configuration(format!(
                "unknown authentication mode '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for AuthenticationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method used to transfer ownership of a device
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum OwnershipTransferMethod {
    JustWorks,
    ManufacturerCertificate,
}

/// Pre-shared key credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreSharedKeyConfig {
    /// Owner identity (UUID, or a name hashed into one)
    #[serde(default)]
    pub subject_id: String,

    /// Shared secret
    #[serde(default, skip_serializing)]
    pub key: String,
}

impl PreSharedKeyConfig {
    /// Subject as a UUID; nil when unset
    pub fn subject_uuid(&self) -> Uuid {
        if self.subject_id.is_empty() {
            Uuid::nil()
        } else {
            crate::types::owner_to_uuid(&self.subject_id)
        }
    }
}

/// Secure session configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Authentication mode
    #[serde(default)]
    pub authentication: AuthenticationMode,

    /// Pre-shared key credentials (pre-shared key mode only)
    #[serde(default)]
    pub pre_shared_key: PreSharedKeyConfig,
}

/// Device service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceServiceConfig {
    /// Maximum message size accepted from a device (bytes)
    pub max_message_size: u32,

    /// Session inactivity timeout in seconds
    pub inactivity_timeout_secs: u64,

    /// Ownership transfer methods offered to devices, in order of preference
    pub ownership_transfer_methods: Vec<OwnershipTransferMethod>,

    /// Secure session configuration
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for DeviceServiceConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            inactivity_timeout_secs: DEFAULT_INACTIVITY_TIMEOUT_SECS,
            ownership_transfer_methods: vec![OwnershipTransferMethod::JustWorks],
            tls: TlsConfig::default(),
        }
    }
}

impl DeviceServiceConfig {
    /// Validate device service configuration
    pub fn validate(&self) -> GatewayResult<()> {
        if self.max_message_size == 0 {
            return Err(GatewayError::Configuration(
                "device.max_message_size must be positive".into(),
            ));
        }
        if self.ownership_transfer_methods.is_empty() {
            return Err(GatewayError::Configuration(
                "device.ownership_transfer_methods must not be empty".into(),
            ));
        }
        if self.tls.authentication == AuthenticationMode::PreSharedKey {
            let psk = &self.tls.pre_shared_key;
            if psk.subject_id.is_empty() {
                return Err(GatewayError::Configuration(
                    "device.tls.pre_shared_key.subject_id is required".into(),
                ));
            }
            if psk.key.is_empty() {
                return Err(GatewayError::Configuration(
                    "device.tls.pre_shared_key.key is required".into(),
                ));
            }
        }
        Ok(())
    }
}

// =============================================================================
// DISCOVERY CONFIGURATION
// =============================================================================

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Default discovery timeout in milliseconds
    pub timeout_ms: u64,

    /// Port added to explicit endpoints given without one
    pub multicast_port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_DISCOVERY_TIMEOUT_MS,
            multicast_port: COAP_PORT,
        }
    }
}

impl DiscoveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.timeout_ms == 0 {
            return Err(GatewayError::Configuration(
                "discovery.timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// REMOTE PROVISIONING CONFIGURATION
// =============================================================================

/// Remote provisioning mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum RemoteProvisioningMode {
    /// Identity is configured locally
    #[default]
    None,
    /// A user agent obtains the identity certificate on behalf of the gateway
    UserAgent,
}

impl FromStr for RemoteProvisioningMode {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" | "none" => Ok(RemoteProvisioningMode::None),
            "useragent" | "user_agent" => Ok(RemoteProvisioningMode::UserAgent),
            other => Err(GatewayError::Configuration(format!(
                "unknown remote provisioning mode '{other}'"
            ))),
        }
    }
}

fn default_own_sign_timeout_secs() -> u64 {
    OWN_SIGN_TIMEOUT_SECS
}

/// Remote identity provisioning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteProvisioningConfig {
    /// Provisioning mode
    pub mode: RemoteProvisioningMode,

    /// Lifetime of a CSR challenge state token in seconds
    pub csr_challenge_state_expiration_secs: u64,

    /// Time a device ownership transfer may wait for its signed certificate
    #[serde(default = "default_own_sign_timeout_secs")]
    pub own_sign_timeout_secs: u64,

    /// Token claim carrying the owner identity
    pub owner_claim: String,

    /// Authorization server that issues bearer tokens
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub authority: String,

    /// Client id the user agent authenticates with
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_id: String,
}

impl Default for RemoteProvisioningConfig {
    fn default() -> Self {
        Self {
            mode: RemoteProvisioningMode::None,
            csr_challenge_state_expiration_secs: CSR_CHALLENGE_STATE_EXPIRATION_SECS,
            own_sign_timeout_secs: OWN_SIGN_TIMEOUT_SECS,
            owner_claim: DEFAULT_OWNER_CLAIM.into(),
            authority: String::new(),
            client_id: String::new(),
        }
    }
}

impl RemoteProvisioningConfig {
    pub fn csr_challenge_expiration(&self) -> Duration {
        Duration::from_secs(self.csr_challenge_state_expiration_secs)
    }

    pub fn own_sign_timeout(&self) -> Duration {
        Duration::from_secs(self.own_sign_timeout_secs)
    }

    pub fn validate(&self) -> GatewayResult<()> {
        if self.mode != RemoteProvisioningMode::UserAgent {
            return Ok(());
        }
        if self.csr_challenge_state_expiration_secs == 0 {
            return Err(GatewayError::Configuration(
                "remote_provisioning.csr_challenge_state_expiration_secs must be positive".into(),
            ));
        }
        if self.own_sign_timeout_secs == 0 {
            return Err(GatewayError::Configuration(
                "remote_provisioning.own_sign_timeout_secs must be positive".into(),
            ));
        }
        if self.owner_claim.is_empty() {
            return Err(GatewayError::Configuration(
                "remote_provisioning.owner_claim is required".into(),
            ));
        }
        Ok(())
    }
}
