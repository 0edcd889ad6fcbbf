//! # Resource Operations
//!
//! Get, create, update and delete against one device resource. Every
//! operation first re-fetches the device's resource links, which also
//! refreshes the cached ownership status and types, then resolves the
//! requested href and checks access before talking to the device.
//!
//! Request bodies arrive as JSON or binary content and are sent to devices
//! in the binary format. Responses are tagged with the binary content type
//! when they carry a body.

use tracing::debug;

use shared::{
    constants::*,
    error::{GatewayError, GatewayResult, StatusCode, TransportError},
    types::{
        normalize_href, Content, DeviceSummary, Endpoint, OwnershipStatus, ResourceLink,
        ResourceLinks,
    },
};

use crate::auth::AuthenticationStrategy;
use crate::device::DeviceRecord;
use crate::discovery::{decode_payload, ownership_status};
use crate::transport::{DeviceConnection, ProtocolClient, Request, Response};

// =============================================================================
// CONTENT CONVERSION
// =============================================================================

/// Convert request content to the binary format devices accept
pub fn to_device_payload(content: &Content) -> GatewayResult<Vec<u8>> {
    match content.content_type.as_str() {
        CONTENT_TYPE_OCF_CBOR | CONTENT_TYPE_CBOR => Ok(content.data.clone()),
        CONTENT_TYPE_JSON => {
            let value: serde_json::Value = serde_json::from_slice(&content.data)
                .map_err(|e| GatewayError::ContentConversion(e.to_string()))?;
            serde_cbor::to_vec(&value).map_err(|e| GatewayError::ContentConversion(e.to_string()))
        }
        other => Err(GatewayError::UnsupportedContentType(other.to_string())),
    }
}

// =============================================================================
// RESOURCE CLIENT
// =============================================================================

/// Resource access to one cached device through the active strategy
pub struct ResourceClient<'a> {
    client: &'a dyn ProtocolClient,
    auth: &'a dyn AuthenticationStrategy,
    record: &'a DeviceRecord,
}

impl<'a> ResourceClient<'a> {
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

    /// Fetch the device's links, refreshing ownership status and types
    pub async fn refresh_links(&self) -> GatewayResult<ResourceLinks> {
        let id = self.record.id();
        let mut endpoints = self.record.endpoints();
        // insecure endpoints first; listing links needs no credentials
        endpoints.sort_by_key(Endpoint::is_secure);

        let mut first_error = None;
        for endpoint in &endpoints {
            match self.fetch_links(endpoint).await {
                Ok(links) => {
                    self.record.set_ownership_status(ownership_status(&links));
                    if let Some(device_link) = links.by_type(RESOURCE_TYPE_DEVICE) {
                        self.record
                            .set_resource_types(device_link.resource_types.clone());
                    }
                    return Ok(links);
                }
                Err(e) => {
                    debug!(device_id = %id, endpoint = %endpoint.uri, error = %e, "Cannot get resource links");
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error.unwrap_or(GatewayError::NoUsableEndpoint {
            device_id: id,
            href: RESOURCE_HREF_RESOURCES.to_string(),
        }))
    }

    async fn fetch_links(&self, endpoint: &Endpoint) -> GatewayResult<ResourceLinks> {
        let id = self.record.id();
        let connection = self
            .record
            .connection(self.client, self.auth, endpoint)
            .await?;
        let response = self
            .send(
                endpoint,
                connection.as_ref(),
                Request::get(RESOURCE_HREF_RESOURCES),
            )
            .await
            .map_err(|e| {
                GatewayError::from_transport(
                    StatusCode::Unavailable,
                    format!("cannot get resource links for device {id}"),
                    e,
                )
            })?;
        let links: ResourceLinks = decode_payload(response.content_format, &response.payload)
            .map_err(|e| GatewayError::Decode(e.to_string()))?;
        let mut links = links.for_device(id);
        if let Some(remote) = endpoint.address().and_then(|a| a.socket_addr()) {
            links.patch_endpoints(remote);
        }
        Ok(links)
    }

    /// Resolve `href` among fresh links and check the device may be accessed
    async fn resolve(&self, href: &str, interface: Option<&str>) -> GatewayResult<ResourceLink> {
        let links = self.refresh_links().await?;
        let href = normalize_href(href);
        let mut link = links
            .by_href(&href)
            .cloned()
            .ok_or_else(|| GatewayError::ResourceLinkNotFound {
                device_id: self.record.id(),
                href: href.clone(),
            })?;
        if link.has_type(RESOURCE_TYPE_RESOURCES) && interface == Some(INTERFACE_BATCH) {
            link.endpoints = link.secure_endpoints();
        }
        self.check_access(&link)?;
        Ok(link)
    }

    fn check_access(&self, link: &ResourceLink) -> GatewayResult<()> {
        if self.record.ownership_status() != OwnershipStatus::Owned
            && link.insecure_endpoints().is_empty()
        {
            return Err(GatewayError::DeviceNotOwned(self.record.id()));
        }
        Ok(())
    }

    /// Endpoints to try: secure ones for owned devices, else insecure ones
    fn candidates(&self, link: &ResourceLink) -> Vec<Endpoint> {
        let secure = link.secure_endpoints();
        let insecure = link.insecure_endpoints();
        let owned = self.record.ownership_status() == OwnershipStatus::Owned;
        if owned && !secure.is_empty() {
            secure
        } else if !insecure.is_empty() {
            insecure
        } else {
            secure
        }
    }

    async fn send(
        &self,
        endpoint: &Endpoint,
        connection: &dyn DeviceConnection,
        request: Request,
    ) -> Result<Response, TransportError> {
        let result = connection
            .request(request)
            .await
            .and_then(Response::into_success);
        if let Err(TransportError::Closed | TransportError::Timeout) = &result {
            self.record.drop_connection(self.auth, endpoint).await;
        }
        result
    }

    /// Send `request` over the first endpoint of `link` that can be dialed
    async fn exchange(
        &self,
        link: &ResourceLink,
        request: Request,
        action: &str,
    ) -> GatewayResult<Content> {
        let id = self.record.id();
        let mut last_error = None;
        for endpoint in self.candidates(link) {
            let connection = match self
                .record
                .connection(self.client, self.auth, &endpoint)
                .await
            {
                Ok(connection) => connection,
                Err(e) => {
                    debug!(device_id = %id, endpoint = %endpoint.uri, error = %e, "Cannot connect");
                    last_error = Some(e);
                    continue;
                }
            };
            let response = self
                .send(&endpoint, connection.as_ref(), request)
                .await
                .map_err(|e| {
                    GatewayError::from_transport(
                        StatusCode::Unavailable,
                        format!("cannot {action} resource {} for device {id}", link.href),
                        e,
                    )
                })?;
            return Ok(Content::from_response(response.payload));
        }
        Err(last_error.unwrap_or(GatewayError::NoUsableEndpoint {
            device_id: id,
            href: link.href.clone(),
        }))
    }

    // =========================================================================
    // OPERATIONS
    // =========================================================================

    /// Read a resource; reading the identity resource refreshes the cached body
    pub async fn get(&self, href: &str, interface: Option<&str>) -> GatewayResult<Content> {
        let link = self.resolve(href, interface).await?;
        let mut request = Request::get(&link.href);
        if let Some(interface) = interface {
            request = request.with_interface(interface);
        }
        let content = self.exchange(&link, request, "get").await?;
        if link.has_type(RESOURCE_TYPE_DEVICE) && interface.is_none() {
            self.record.set_device_resource_body(content.clone());
        }
        Ok(content)
    }

    /// Re-read the identity resource and return the refreshed summary
    pub async fn refresh_device(&self) -> GatewayResult<DeviceSummary> {
        let links = self.refresh_links().await?;
        let link = links
            .by_type(RESOURCE_TYPE_DEVICE)
            .ok_or_else(|| GatewayError::ResourceLinkNotFound {
                device_id: self.record.id(),
                href: RESOURCE_HREF_DEVICE.to_string(),
            })?;
        let content = self
            .exchange(link, Request::get(&link.href), "get")
            .await?;
        self.record.set_device_resource_body(content);
        Ok(self.record.summary())
    }

    /// Create a resource instance in a collection
    pub async fn create(&self, href: &str, content: &Content) -> GatewayResult<Content> {
        let payload = to_device_payload(content)?;
        let link = self.resolve(href, None).await?;
        let request = Request::post(&link.href, payload).with_interface(INTERFACE_CREATE);
        self.exchange(&link, request, "create").await
    }

    pub async fn update(&self, href: &str, content: &Content) -> GatewayResult<Content> {
        let payload = to_device_payload(content)?;
        let link = self.resolve(href, None).await?;
        self.exchange(&link, Request::post(&link.href, payload), "update")
            .await
    }

    pub async fn delete(&self, href: &str) -> GatewayResult<Content> {
        let link = self.resolve(href, None).await?;
        self.exchange(&link, Request::delete(&link.href), "delete")
            .await
    }
}
