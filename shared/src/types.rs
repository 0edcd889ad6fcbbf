//! # Data Types for the Device Gateway
//!
//! Endpoints, resource links, ownership status, content and the summaries
//! returned by discovery. Resource links use the field names devices put on
//! the wire (`rt`, `if`, `di`, `eps`) so they can be decoded straight from a
//! discovery response.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

use crate::constants::*;
use crate::error::StatusCode;

/// Stable device identifier
pub type DeviceId = Uuid;

// =============================================================================
// RESPONSE CODES
// =============================================================================

/// Protocol response code, `class.detail` packed into one byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResponseCode(pub u8);

impl ResponseCode {
    const fn new(class: u8, detail: u8) -> Self {
        Self((class << 5) | detail)
    }

    pub const CREATED: Self = Self::new(2, 1);
    pub const DELETED: Self = Self::new(2, 2);
    pub const VALID: Self = Self::new(2, 3);
    pub const CHANGED: Self = Self::new(2, 4);
    pub const CONTENT: Self = Self::new(2, 5);
    pub const BAD_REQUEST: Self = Self::new(4, 0);
    pub const UNAUTHORIZED: Self = Self::new(4, 1);
    pub const BAD_OPTION: Self = Self::new(4, 2);
    pub const FORBIDDEN: Self = Self::new(4, 3);
    pub const NOT_FOUND: Self = Self::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Self = Self::new(4, 5);
    pub const NOT_ACCEPTABLE: Self = Self::new(4, 6);
    pub const PRECONDITION_FAILED: Self = Self::new(4, 12);
    pub const REQUEST_ENTITY_TOO_LARGE: Self = Self::new(4, 13);
    pub const UNSUPPORTED_CONTENT_FORMAT: Self = Self::new(4, 15);
    pub const INTERNAL_SERVER_ERROR: Self = Self::new(5, 0);
    pub const NOT_IMPLEMENTED: Self = Self::new(5, 1);
    pub const BAD_GATEWAY: Self = Self::new(5, 2);
    pub const SERVICE_UNAVAILABLE: Self = Self::new(5, 3);
    pub const GATEWAY_TIMEOUT: Self = Self::new(5, 4);

    /// Code class (2 = success, 4 = client error, 5 = server error)
    pub fn class(&self) -> u8 {
        self.0 >> 5
    }

    /// Code detail within the class
    pub fn detail(&self) -> u8 {
        self.0 & 0x1f
    }

    /// Check if the code reports success
    pub fn is_success(&self) -> bool {
        self.class() == 2
    }

    /// Status a failed response maps to, `None` for success codes
    pub fn status(&self) -> Option<StatusCode> {
        if self.is_success() {
            return None;
        }
        let status = match *self {
            Self::BAD_REQUEST
            | Self::BAD_OPTION
            | Self::NOT_ACCEPTABLE
            | Self::REQUEST_ENTITY_TOO_LARGE
            | Self::UNSUPPORTED_CONTENT_FORMAT => StatusCode::InvalidArgument,
            Self::UNAUTHORIZED => StatusCode::Unauthenticated,
            Self::FORBIDDEN => StatusCode::PermissionDenied,
            Self::NOT_FOUND => StatusCode::NotFound,
            Self::METHOD_NOT_ALLOWED | Self::NOT_IMPLEMENTED => StatusCode::Unimplemented,
            Self::PRECONDITION_FAILED => StatusCode::FailedPrecondition,
            Self::INTERNAL_SERVER_ERROR => StatusCode::Internal,
            Self::BAD_GATEWAY | Self::SERVICE_UNAVAILABLE | Self::GATEWAY_TIMEOUT => {
                StatusCode::Unavailable
            }
            _ => return None,
        };
        Some(status)
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

// =============================================================================
// OWNERSHIP
// =============================================================================

/// Ownership status derived from the device's security resource
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OwnershipStatus {
    /// Not determined yet
    #[default]
    Unknown,
    /// Security resource reachable over insecure endpoints
    Unowned,
    /// Security resource reachable over secure endpoints only
    Owned,
    /// Device exposes no security resource
    Unsupported,
}

impl fmt::Display for OwnershipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OwnershipStatus::Unknown => write!(f, "unknown"),
            OwnershipStatus::Unowned => write!(f, "unowned"),
            OwnershipStatus::Owned => write!(f, "owned"),
            OwnershipStatus::Unsupported => write!(f, "unsupported"),
        }
    }
}

// =============================================================================
// ENDPOINTS
// =============================================================================

/// IP address family
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    V4,
    V6,
}

/// Transport kind of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Datagram,
    Stream,
}

/// Endpoint URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// `coap`: insecure datagram
    Coap,
    /// `coap+tcp`: insecure stream
    CoapTcp,
    /// `coaps`: secure datagram
    Coaps,
    /// `coaps+tcp`: secure stream
    CoapsTcp,
}

impl Scheme {
    /// Parse a URI scheme
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "coap" => Some(Scheme::Coap),
            "coap+tcp" => Some(Scheme::CoapTcp),
            "coaps" => Some(Scheme::Coaps),
            "coaps+tcp" => Some(Scheme::CoapsTcp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Coap => "coap",
            Scheme::CoapTcp => "coap+tcp",
            Scheme::Coaps => "coaps",
            Scheme::CoapsTcp => "coaps+tcp",
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Coaps | Scheme::CoapsTcp)
    }

    pub fn transport(&self) -> Transport {
        match self {
            Scheme::Coap | Scheme::Coaps => Transport::Datagram,
            Scheme::CoapTcp | Scheme::CoapsTcp => Transport::Stream,
        }
    }
}

/// Parsed endpoint URI
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    /// URI scheme
    pub scheme: Scheme,

    /// Host without brackets; IPv6 hosts may carry a `%zone` suffix
    pub host: String,

    /// Port
    pub port: u16,
}

impl EndpointAddress {
    /// Parse `scheme://host:port`; IPv6 hosts are bracketed
    pub fn parse(uri: &str) -> Option<Self> {
        let (scheme, rest) = uri.split_once("://")?;
        let scheme = Scheme::parse(scheme)?;
        let rest = rest.split('/').next()?;
        let (host, port) = match rest.strip_prefix('[') {
            Some(bracketed) => {
                let (host, tail) = bracketed.split_once(']')?;
                (host, tail.strip_prefix(':')?)
            }
            None => rest.rsplit_once(':')?,
        };
        if host.is_empty() {
            return None;
        }
        let port = port.parse().ok()?;
        Some(Self {
            scheme,
            host: host.replace("%25", "%"),
            port,
        })
    }

    /// A host containing `:` is an IPv6 literal
    pub fn family(&self) -> IpFamily {
        if self.host.contains(':') {
            IpFamily::V6
        } else {
            IpFamily::V4
        }
    }

    /// Socket address, ignoring any IPv6 zone
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let host = self.host.split('%').next()?;
        let ip: IpAddr = host.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family() {
            IpFamily::V4 => write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port),
            IpFamily::V6 => write!(
                f,
                "{}://[{}]:{}",
                self.scheme.as_str(),
                self.host.replace('%', "%25"),
                self.port
            ),
        }
    }
}

/// Network endpoint of a resource, as published in resource links
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Endpoint URI, e.g. `coaps+tcp://[fe80::1]:5684`
    #[serde(rename = "ep")]
    pub uri: String,

    /// Priority, lower is preferred
    #[serde(rename = "pri", default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u64>,
}

impl Endpoint {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            priority: None,
        }
    }

    /// Endpoint for a socket address
    pub fn from_socket_addr(scheme: Scheme, addr: SocketAddr) -> Self {
        let uri = match addr {
            SocketAddr::V4(v4) => format!("{}://{}", scheme.as_str(), v4),
            SocketAddr::V6(v6) => format!("{}://[{}]:{}", scheme.as_str(), v6.ip(), v6.port()),
        };
        Self::new(uri)
    }

    /// Parsed address, `None` when the URI is malformed
    pub fn address(&self) -> Option<EndpointAddress> {
        EndpointAddress::parse(&self.uri)
    }

    /// Check if the endpoint uses a secure scheme
    pub fn is_secure(&self) -> bool {
        self.address().is_some_and(|addr| addr.scheme.is_secure())
    }
}

// =============================================================================
// RESOURCE LINKS
// =============================================================================

/// Resource discoverability policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    /// Bitmask: 1 = discoverable, 2 = observable
    #[serde(rename = "bm")]
    pub bitmask: u8,
}

/// Reference to one addressable resource on a device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLink {
    /// Resource path on the device
    pub href: String,

    /// Resource types
    #[serde(rename = "rt", default, skip_serializing_if = "Vec::is_empty")]
    pub resource_types: Vec<String>,

    /// Supported interfaces
    #[serde(rename = "if", default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<String>,

    /// Anchor, `ocf://<device id>`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub anchor: String,

    /// Device id
    #[serde(rename = "di", default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,

    /// Endpoints the resource is reachable on
    #[serde(rename = "eps", default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,

    /// Policy
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<Policy>,
}

impl ResourceLink {
    /// Owning device, from `di` or else the anchor
    pub fn owning_device(&self) -> Option<DeviceId> {
        if let Ok(id) = Uuid::parse_str(&self.device_id) {
            return Some(id);
        }
        self.anchor
            .strip_prefix("ocf://")
            .and_then(|id| Uuid::parse_str(id).ok())
    }

    pub fn has_type(&self, resource_type: &str) -> bool {
        self.resource_types.iter().any(|rt| rt == resource_type)
    }

    pub fn has_interface(&self, interface: &str) -> bool {
        self.interfaces.iter().any(|i| i == interface)
    }

    /// Well-formed endpoints with an insecure scheme
    pub fn insecure_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .filter(|ep| ep.address().is_some_and(|a| !a.scheme.is_secure()))
            .cloned()
            .collect()
    }

    /// Well-formed endpoints with a secure scheme
    pub fn secure_endpoints(&self) -> Vec<Endpoint> {
        self.endpoints
            .iter()
            .filter(|ep| ep.address().is_some_and(|a| a.scheme.is_secure()))
            .cloned()
            .collect()
    }

    /// Links published without endpoints are reachable where the response came from
    pub fn patch_endpoints(&mut self, remote: SocketAddr) {
        if self.endpoints.is_empty() {
            self.endpoints.push(Endpoint::from_socket_addr(Scheme::Coap, remote));
        }
    }
}

/// Resource links of one or more devices
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceLinks(pub Vec<ResourceLink>);

impl ResourceLinks {
    pub fn iter(&self) -> std::slice::Iter<'_, ResourceLink> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<ResourceLink> {
        self.0
    }

    /// Find a link by exact href
    pub fn by_href(&self, href: &str) -> Option<&ResourceLink> {
        self.0.iter().find(|link| link.href == href)
    }

    /// Find the first link carrying a resource type
    pub fn by_type(&self, resource_type: &str) -> Option<&ResourceLink> {
        self.0.iter().find(|link| link.has_type(resource_type))
    }

    /// Links belonging to one device
    pub fn for_device(&self, device_id: DeviceId) -> Self {
        Self(
            self.0
                .iter()
                .filter(|link| link.owning_device() == Some(device_id))
                .cloned()
                .collect(),
        )
    }

    /// Group links by owning device; links without a device id are dropped
    pub fn group_by_device(self) -> BTreeMap<DeviceId, ResourceLinks> {
        let mut groups: BTreeMap<DeviceId, ResourceLinks> = BTreeMap::new();
        for link in self.0 {
            if let Some(id) = link.owning_device() {
                groups.entry(id).or_default().0.push(link);
            }
        }
        groups
    }

    pub fn patch_endpoints(&mut self, remote: SocketAddr) {
        for link in &mut self.0 {
            link.patch_endpoints(remote);
        }
    }
}

impl From<Vec<ResourceLink>> for ResourceLinks {
    fn from(links: Vec<ResourceLink>) -> Self {
        Self(links)
    }
}

/// Prepend a leading `/` if missing
pub fn normalize_href(href: &str) -> String {
    if href.starts_with('/') {
        href.to_string()
    } else {
        format!("/{href}")
    }
}

// =============================================================================
// CONTENT
// =============================================================================

/// Resource body with its content type tag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    /// Content type, empty when there is no body
    pub content_type: String,

    /// Raw body
    #[serde(with = "base64_data")]
    pub data: Vec<u8>,
}

impl Content {
    pub fn new(content_type: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            data,
        }
    }

    /// Content of a device response: no body means no content type
    pub fn from_response(data: Vec<u8>) -> Self {
        if data.is_empty() {
            return Self::default();
        }
        Self::new(CONTENT_TYPE_OCF_CBOR, data)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

mod base64_data {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// DEVICES
// =============================================================================

/// Device summary returned by discovery and device lookup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    /// Device id
    pub id: DeviceId,

    /// Declared device types
    pub types: Vec<String>,

    /// Last observed body of the identity resource
    pub content: Option<Content>,

    /// Ownership status
    pub ownership_status: OwnershipStatus,

    /// Endpoint URIs
    pub endpoints: Vec<String>,
}

/// Filter for device discovery
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryFilter {
    /// Include devices already in the cache
    #[serde(default)]
    pub use_cache: bool,

    /// Multicast address families to query
    #[serde(default)]
    pub use_multicast: Vec<IpFamily>,

    /// Explicit endpoints (`host` or `host:port`) to query
    #[serde(default)]
    pub use_endpoints: Vec<String>,

    /// Overrides the configured discovery timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Keep devices carrying at least one of these types
    #[serde(default)]
    pub type_filter: Vec<String>,

    /// Keep devices in one of these ownership states
    #[serde(default)]
    pub ownership_status_filter: Vec<OwnershipStatus>,
}

impl DiscoveryFilter {
    /// Fill in defaults: with no source selected, multicast on both families
    pub fn with_defaults(mut self) -> Self {
        if !self.use_cache && self.use_multicast.is_empty() && self.use_endpoints.is_empty() {
            self.use_multicast = vec![IpFamily::V4, IpFamily::V6];
        }
        self
    }

    /// Check if a summary passes the type and ownership filters
    pub fn matches(&self, summary: &DeviceSummary) -> bool {
        let type_ok = self.type_filter.is_empty()
            || self
                .type_filter
                .iter()
                .any(|wanted| summary.types.iter().any(|t| t == wanted));
        let status_ok = self.ownership_status_filter.is_empty()
            || self.ownership_status_filter.contains(&summary.ownership_status);
        type_ok && status_ok
    }
}

/// Owner identity as a UUID: parsed as-is, or name-based in the URL namespace
pub fn owner_to_uuid(owner: &str) -> Uuid {
    Uuid::parse_str(owner).unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_URL, owner.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_address_parse() {
        let addr = EndpointAddress::parse("coaps+tcp://192.168.1.2:5684").unwrap();
        assert_eq!(addr.scheme, Scheme::CoapsTcp);
        assert_eq!(addr.host, "192.168.1.2");
        assert_eq!(addr.port, 5684);
        assert_eq!(addr.family(), IpFamily::V4);

        let addr = EndpointAddress::parse("coap://[fe80::1%25eth0]:5683").unwrap();
        assert_eq!(addr.family(), IpFamily::V6);
        assert_eq!(addr.host, "fe80::1%eth0");
        assert_eq!(addr.to_string(), "coap://[fe80::1%25eth0]:5683");
        assert_eq!(
            addr.socket_addr().unwrap(),
            "[fe80::1]:5683".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_endpoint_address_rejects_malformed() {
        assert!(EndpointAddress::parse("").is_none());
        assert!(EndpointAddress::parse("http://10.0.0.1:80").is_none());
        assert!(EndpointAddress::parse("coap://10.0.0.1").is_none());
        assert!(EndpointAddress::parse("coap://:5683").is_none());
    }

    #[test]
    fn test_response_code() {
        assert_eq!(ResponseCode::NOT_FOUND.to_string(), "4.04");
        assert_eq!(ResponseCode::CONTENT.to_string(), "2.05");
        assert!(ResponseCode::CHANGED.is_success());
        assert_eq!(ResponseCode::CHANGED.status(), None);
        assert_eq!(
            ResponseCode::UNAUTHORIZED.status(),
            Some(StatusCode::Unauthenticated)
        );
        assert_eq!(
            ResponseCode::SERVICE_UNAVAILABLE.status(),
            Some(StatusCode::Unavailable)
        );
    }

    #[test]
    fn test_resource_link_device_id() {
        let id = Uuid::new_v4();
        let link = ResourceLink {
            href: "/oic/d".into(),
            anchor: format!("ocf://{id}"),
            ..Default::default()
        };
        assert_eq!(link.owning_device(), Some(id));

        let link = ResourceLink {
            device_id: id.to_string(),
            ..Default::default()
        };
        assert_eq!(link.owning_device(), Some(id));
    }

    #[test]
    fn test_resource_link_endpoints() {
        let link = ResourceLink {
            href: "/light/1".into(),
            endpoints: vec![
                Endpoint::new("coap://10.0.0.1:5683"),
                Endpoint::new("coaps://10.0.0.1:5684"),
                Endpoint::new("garbage"),
            ],
            ..Default::default()
        };
        assert_eq!(link.insecure_endpoints().len(), 1);
        assert_eq!(link.secure_endpoints().len(), 1);
    }

    #[test]
    fn test_patch_endpoints() {
        let remote: SocketAddr = "10.0.0.7:5683".parse().unwrap();
        let mut links = ResourceLinks(vec![
            ResourceLink {
                href: "/oic/d".into(),
                ..Default::default()
            },
            ResourceLink {
                href: "/light/1".into(),
                endpoints: vec![Endpoint::new("coaps://10.0.0.7:5684")],
                ..Default::default()
            },
        ]);
        links.patch_endpoints(remote);
        assert_eq!(links.0[0].endpoints, vec![Endpoint::new("coap://10.0.0.7:5683")]);
        assert_eq!(links.0[1].endpoints.len(), 1);
    }

    #[test]
    fn test_normalize_href() {
        assert_eq!(normalize_href("light/1"), "/light/1");
        assert_eq!(normalize_href("/light/1"), "/light/1");
    }

    #[test]
    fn test_content_from_response() {
        assert_eq!(Content::from_response(Vec::new()).content_type, "");
        assert_eq!(
            Content::from_response(vec![0xa0]).content_type,
            CONTENT_TYPE_OCF_CBOR
        );
    }

    #[test]
    fn test_discovery_filter_defaults() {
        let filter = DiscoveryFilter::default().with_defaults();
        assert_eq!(filter.use_multicast, vec![IpFamily::V4, IpFamily::V6]);

        let filter = DiscoveryFilter {
            use_cache: true,
            ..Default::default()
        }
        .with_defaults();
        assert!(filter.use_multicast.is_empty());
    }

    #[test]
    fn test_discovery_filter_matches() {
        let summary = DeviceSummary {
            id: Uuid::new_v4(),
            types: vec!["oic.wk.d".into(), "oic.d.light".into()],
            content: None,
            ownership_status: OwnershipStatus::Unowned,
            endpoints: Vec::new(),
        };
        let filter = DiscoveryFilter {
            type_filter: vec!["oic.d.light".into()],
            ownership_status_filter: vec![OwnershipStatus::Unowned],
            ..Default::default()
        };
        assert!(filter.matches(&summary));

        let filter = DiscoveryFilter {
            ownership_status_filter: vec![OwnershipStatus::Owned],
            ..Default::default()
        };
        assert!(!filter.matches(&summary));
    }

    #[test]
    fn test_owner_to_uuid() {
        let id = Uuid::new_v4();
        assert_eq!(owner_to_uuid(&id.to_string()), id);
        assert_eq!(owner_to_uuid("alice"), owner_to_uuid("alice"));
        assert_ne!(owner_to_uuid("alice"), owner_to_uuid("bob"));
    }
}
