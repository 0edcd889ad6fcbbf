//! # Constants for the Device Gateway
//!
//! Well-known resource types, hrefs, interfaces, content formats and
//! default timeouts shared by discovery, ownership and resource handling.

// =============================================================================
// WELL-KNOWN RESOURCES
// =============================================================================

/// Resource type of the device identity resource
pub const RESOURCE_TYPE_DEVICE: &str = "oic.wk.d";

/// Href of the device identity resource
pub const RESOURCE_HREF_DEVICE: &str = "/oic/d";

/// Resource type of the discovery (resource links) resource
pub const RESOURCE_TYPE_RESOURCES: &str = "oic.wk.res";

/// Href of the discovery (resource links) resource
pub const RESOURCE_HREF_RESOURCES: &str = "/oic/res";

/// Resource type of the ownership transfer (security) resource
pub const RESOURCE_TYPE_DOXM: &str = "oic.r.doxm";

/// Href of the ownership transfer (security) resource
pub const RESOURCE_HREF_DOXM: &str = "/oic/sec/doxm";

/// Resource type of the provisioning status resource
pub const RESOURCE_TYPE_PSTAT: &str = "oic.r.pstat";

/// Href of the provisioning status resource
pub const RESOURCE_HREF_PSTAT: &str = "/oic/sec/pstat";

// =============================================================================
// INTERFACES
// =============================================================================

/// Baseline interface
pub const INTERFACE_BASELINE: &str = "oic.if.baseline";

/// Batch interface: returns the representation of every linked resource
pub const INTERFACE_BATCH: &str = "oic.if.b";

/// Create interface used for collection creates
pub const INTERFACE_CREATE: &str = "oic.if.create";

/// Links list interface
pub const INTERFACE_LINKS_LIST: &str = "oic.if.ll";

// =============================================================================
// CONTENT FORMATS
// =============================================================================

/// Binary content type used by devices
pub const CONTENT_TYPE_OCF_CBOR: &str = "application/vnd.ocf+cbor";

/// Generic CBOR content type
pub const CONTENT_TYPE_CBOR: &str = "application/cbor";

/// JSON content type
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Numeric content format of `application/vnd.ocf+cbor`
pub const CONTENT_FORMAT_OCF_CBOR: u16 = 10000;

/// Numeric content format of `application/cbor`
pub const CONTENT_FORMAT_CBOR: u16 = 60;

/// Numeric content format of `application/json`
pub const CONTENT_FORMAT_JSON: u16 = 50;

// =============================================================================
// NETWORK
// =============================================================================

/// Insecure datagram port, also used for multicast discovery
pub const COAP_PORT: u16 = 5683;

/// Secure datagram port
pub const COAPS_PORT: u16 = 5684;

/// IPv4 all-OCF-nodes multicast address
pub const MULTICAST_ADDRESS_IPV4: &str = "224.0.1.187";

/// IPv6 link, realm and site local all-OCF-nodes multicast addresses
pub const MULTICAST_ADDRESSES_IPV6: [&str; 3] = ["ff02::158", "ff03::158", "ff05::158"];

/// Maximum message size accepted from a device (bytes)
pub const DEFAULT_MAX_MESSAGE_SIZE: u32 = 256 * 1024;

/// Session inactivity timeout (seconds)
pub const DEFAULT_INACTIVITY_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// TIMEOUTS
// =============================================================================

/// Default discovery timeout (milliseconds)
pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 1000;

/// Time allowed to close one device session during cache eviction (seconds)
pub const DEVICE_CLOSE_TIMEOUT_SECS: u64 = 1;

/// Capacity of the channel that carries discovery responses
pub const DISCOVERY_RESPONSE_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// AUTHENTICATION
// =============================================================================

/// Length of the symmetric key required by the secure datagram transport
pub const PSK_KEY_LENGTH: usize = 16;

/// Prefix of the subject common name in identity certificates
pub const IDENTITY_CERTIFICATE_CN_PREFIX: &str = "uuid:";

// =============================================================================
// REMOTE PROVISIONING
// =============================================================================

/// Lifetime of a CSR challenge state token (1 minute)
pub const CSR_CHALLENGE_STATE_EXPIRATION_SECS: u64 = 60;

/// Maximum number of outstanding CSR challenges
pub const CSR_CHALLENGE_MAX_ENTRIES: u64 = 1024;

/// Time an ownership transfer waits for its remotely signed certificate
pub const OWN_SIGN_TIMEOUT_SECS: u64 = 15;

/// Token claim carrying the owner identity
pub const DEFAULT_OWNER_CLAIM: &str = "sub";

/// Only signature algorithm accepted for bearer tokens
pub const TOKEN_SIGNATURE_ALGORITHM: &str = "EdDSA";

// =============================================================================
// ENVIRONMENT VARIABLES
// =============================================================================

/// Environment variable: device authentication mode (uninitialized, preSharedKey, x509)
pub const ENV_AUTHENTICATION: &str = "GATEWAY_AUTHENTICATION";

/// Environment variable: pre-shared key subject id
pub const ENV_PSK_SUBJECT_ID: &str = "GATEWAY_PSK_SUBJECT_ID";

/// Environment variable: pre-shared key
pub const ENV_PSK_KEY: &str = "GATEWAY_PSK_KEY";

/// Environment variable: discovery timeout in milliseconds
pub const ENV_DISCOVERY_TIMEOUT_MS: &str = "GATEWAY_DISCOVERY_TIMEOUT_MS";

/// Environment variable: remote provisioning mode (none, userAgent)
pub const ENV_REMOTE_PROVISIONING_MODE: &str = "GATEWAY_REMOTE_PROVISIONING_MODE";

/// Environment variable: CSR challenge expiration in seconds
pub const ENV_CSR_CHALLENGE_EXPIRATION_SECS: &str = "GATEWAY_CSR_CHALLENGE_EXPIRATION_SECS";

/// Environment variable: ownership transfer signing timeout in seconds
pub const ENV_OWN_SIGN_TIMEOUT_SECS: &str = "GATEWAY_OWN_SIGN_TIMEOUT_SECS";

/// Environment variable: owner claim name in bearer tokens
pub const ENV_OWNER_CLAIM: &str = "GATEWAY_OWNER_CLAIM";
