//! # Protocol Client Seam
//!
//! The gateway does not implement the device protocol itself. It consumes a
//! protocol client library through the [`ProtocolClient`] and
//! [`DeviceConnection`] traits:
//!
//! - discovery streams raw responses into a bounded channel
//! - dialing yields a shared session handle (insecure, or secured with
//!   material produced by the active authentication strategy)
//! - ownership transfer and release run against a device's resource links;
//!   a transfer may hand the device's certificate request to a
//!   [`CertificateSigner`] and provision the certificate it returns
//!
//! Every call is a future; dropping it aborts the in-flight exchange, so a
//! cancelled caller cancels the protocol exchange as well.

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

use shared::{
    config::OwnershipTransferMethod,
    constants::*,
    error::TransportError,
    types::{DeviceId, EndpointAddress, IpFamily, ResourceLinks, ResponseCode},
};

use crate::auth::{IdentityCredential, OwnOptions};

/// Result type for protocol client calls
pub type TransportResult<T> = Result<T, TransportError>;

// =============================================================================
// REQUESTS AND RESPONSES
// =============================================================================

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

/// Request sent over a device session
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Request method
    pub method: Method,

    /// Resource path on the device
    pub href: String,

    /// URI query parameters, e.g. `if=oic.if.baseline`
    pub queries: Vec<String>,

    /// Content format of the payload
    pub content_format: Option<u16>,

    /// Request body
    pub payload: Vec<u8>,
}

impl Request {
    fn new(method: Method, href: &str) -> Self {
        Self {
            method,
            href: href.to_string(),
            queries: Vec::new(),
            content_format: None,
            payload: Vec::new(),
        }
    }

    pub fn get(href: &str) -> Self {
        Self::new(Method::Get, href)
    }

    /// POST carrying a CBOR body
    pub fn post(href: &str, payload: Vec<u8>) -> Self {
        let mut request = Self::new(Method::Post, href);
        request.content_format = Some(CONTENT_FORMAT_OCF_CBOR);
        request.payload = payload;
        request
    }

    pub fn delete(href: &str) -> Self {
        Self::new(Method::Delete, href)
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.queries.push(query.into());
        self
    }

    pub fn with_interface(self, interface: &str) -> Self {
        self.with_query(format!("if={interface}"))
    }

    /// Interface selected by the `if=` query, if any
    pub fn interface(&self) -> Option<&str> {
        self.queries.iter().find_map(|q| q.strip_prefix("if="))
    }
}

/// Response received over a device session
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Response code
    pub code: ResponseCode,

    /// Content format of the payload
    pub content_format: Option<u16>,

    /// Response body
    pub payload: Vec<u8>,
}

impl Response {
    pub fn new(code: ResponseCode, payload: Vec<u8>) -> Self {
        let content_format = (!payload.is_empty()).then_some(CONTENT_FORMAT_OCF_CBOR);
        Self {
            code,
            content_format,
            payload,
        }
    }

    /// Fail with the response code unless it reports success
    pub fn into_success(self) -> TransportResult<Self> {
        if self.code.is_success() {
            Ok(self)
        } else {
            Err(TransportError::Response { code: self.code })
        }
    }
}

// =============================================================================
// DISCOVERY
// =============================================================================

/// Where a discovery query is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryTarget {
    /// All-nodes multicast group of one address family
    Multicast(IpFamily),
    /// Single address
    Unicast(SocketAddr),
}

/// What a discovery query asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryQuery {
    /// The device identity resource
    DeviceIdentity,
    /// Resource links of the identity and security resources
    ResourceLinks,
}

impl DiscoveryQuery {
    /// Href the query is sent to
    pub fn href(&self) -> &'static str {
        match self {
            DiscoveryQuery::DeviceIdentity => RESOURCE_HREF_DEVICE,
            DiscoveryQuery::ResourceLinks => RESOURCE_HREF_RESOURCES,
        }
    }

    /// Resource type filter carried by the query
    pub fn resource_types(&self) -> &'static [&'static str] {
        match self {
            DiscoveryQuery::DeviceIdentity => &[RESOURCE_TYPE_DEVICE],
            DiscoveryQuery::ResourceLinks => &[RESOURCE_TYPE_DEVICE, RESOURCE_TYPE_DOXM],
        }
    }
}

/// One raw discovery response
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryResponse {
    /// Address the response came from
    pub remote: SocketAddr,

    /// Content format of the payload
    pub content_format: Option<u16>,

    /// Response body
    pub payload: Vec<u8>,
}

// =============================================================================
// SECURE DIAL AND OWNERSHIP
// =============================================================================

/// Credential material for a secure session
#[derive(Debug, Clone)]
pub enum SecureDialConfig {
    /// Symmetric key bound to an owner identity (datagram only)
    PreSharedKey {
        identity: DeviceId,
        key: [u8; PSK_KEY_LENGTH],
    },
    /// Identity certificate with a client configuration trusting the anchor
    Certificate {
        credential: IdentityCredential,
        tls: Arc<rustls::ClientConfig>,
    },
}

/// Input of an ownership transfer
#[derive(Debug, Clone)]
pub struct OwnRequest {
    /// Device being owned
    pub device_id: DeviceId,

    /// Freshly fetched resource links of the device
    pub links: ResourceLinks,

    /// Identity the device will be owned by
    pub owner_id: String,

    /// Transfer methods, in order of preference
    pub methods: Vec<OwnershipTransferMethod>,

    /// Credential material provisioned to the device
    pub options: OwnOptions,

    /// Signs the device's certificate request; without it the device gets
    /// no certificate
    pub signer: Option<Arc<dyn CertificateSigner>>,
}

// =============================================================================
// TRAITS
// =============================================================================

/// Session with one device endpoint
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    /// Send a request and wait for its response
    async fn request(&self, request: Request) -> TransportResult<Response>;

    /// Close the session
    async fn close(&self) -> TransportResult<()>;
}

/// Signs the certificate request a device emits during ownership transfer
#[async_trait]
pub trait CertificateSigner: fmt::Debug + Send + Sync {
    /// PEM certificate chain for the PEM encoded `csr`
    async fn sign(&self, csr: Vec<u8>) -> TransportResult<Vec<u8>>;
}

/// Primitives offered by the protocol client library
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Send a discovery query and forward every response until the query
    /// completes or the receiver is dropped
    async fn discover(
        &self,
        target: DiscoveryTarget,
        query: DiscoveryQuery,
        responses: mpsc::Sender<DiscoveryResponse>,
    ) -> TransportResult<()>;

    /// Establish an insecure session
    async fn dial(&self, endpoint: &EndpointAddress) -> TransportResult<Arc<dyn DeviceConnection>>;

    /// Establish a secure session
    async fn dial_secure(
        &self,
        endpoint: &EndpointAddress,
        config: SecureDialConfig,
    ) -> TransportResult<Arc<dyn DeviceConnection>>;

    /// Run the ownership transfer protocol
    async fn own(&self, request: OwnRequest) -> TransportResult<()>;

    /// Release ownership over an established secure session
    async fn disown(
        &self,
        connection: &dyn DeviceConnection,
        links: &ResourceLinks,
    ) -> TransportResult<()>;
}
