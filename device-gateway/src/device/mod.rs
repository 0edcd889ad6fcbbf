//! # Device Record
//!
//! Cached state of one device: metadata observed by discovery and link
//! refreshes, plus the protocol sessions opened to its endpoints.
//!
//! Metadata fields sit behind a single read/write lock and are updated as a
//! group. Sessions sit behind an async mutex that is held across the dial, so
//! two callers racing on first use of an endpoint end up sharing one session.
//! Secure sessions are keyed by the credentials that dialed them as well as
//! the endpoint; a strategy never reuses a session another strategy opened.

mod endpoints;

pub use endpoints::merge_endpoints;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use shared::{
    config::AuthenticationMode,
    error::{GatewayError, GatewayResult, StatusCode},
    types::{Content, DeviceId, DeviceSummary, Endpoint, OwnershipStatus, Scheme},
};

use crate::auth::AuthenticationStrategy;
use crate::transport::{DeviceConnection, ProtocolClient};

#[derive(Debug, Clone, Default)]
struct DeviceState {
    resource_types: Vec<String>,
    endpoints: Vec<Endpoint>,
    ownership_status: OwnershipStatus,
    device_resource_body: Option<Content>,
}

/// Endpoint plus the credentials a secure session was dialed with
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    uri: String,
    credentials: Option<(AuthenticationMode, String)>,
}

impl SessionKey {
    fn new(endpoint: &Endpoint, auth: &dyn AuthenticationStrategy) -> Self {
        let credentials = endpoint
            .is_secure()
            .then(|| (auth.mode(), auth.owner()));
        Self {
            uri: endpoint.uri.clone(),
            credentials,
        }
    }
}

/// One cached device
pub struct DeviceRecord {
    /// Device id, immutable
    id: DeviceId,

    /// Metadata guarded as a group
    state: RwLock<DeviceState>,

    /// Open sessions keyed by endpoint and dialing credentials
    sessions: Mutex<HashMap<SessionKey, Arc<dyn DeviceConnection>>>,
}

impl DeviceRecord {
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            state: RwLock::new(DeviceState::default()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    // =========================================================================
    // METADATA
    // =========================================================================

    /// Apply metadata from resource links
    pub fn update_metadata(
        &self,
        resource_types: Vec<String>,
        endpoints: &[Endpoint],
        ownership_status: OwnershipStatus,
    ) {
        let mut state = self.state.write();
        state.resource_types = resource_types;
        state.ownership_status = ownership_status;
        state.endpoints = merge_endpoints(&state.endpoints, endpoints);
    }

    /// Apply an observed identity resource
    pub fn update_identity(&self, body: Content, resource_types: Vec<String>) {
        let mut state = self.state.write();
        state.device_resource_body = Some(body);
        if !resource_types.is_empty() {
            state.resource_types = resource_types;
        }
    }

    pub fn set_device_resource_body(&self, body: Content) {
        self.state.write().device_resource_body = Some(body);
    }

    pub fn set_resource_types(&self, resource_types: Vec<String>) {
        self.state.write().resource_types = resource_types;
    }

    pub fn set_ownership_status(&self, status: OwnershipStatus) {
        self.state.write().ownership_status = status;
    }

    pub fn ownership_status(&self) -> OwnershipStatus {
        self.state.read().ownership_status
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state.read().endpoints.clone()
    }

    pub fn has_device_resource_body(&self) -> bool {
        self.state.read().device_resource_body.is_some()
    }

    /// Snapshot for callers
    pub fn summary(&self) -> DeviceSummary {
        let state = self.state.read();
        DeviceSummary {
            id: self.id,
            types: state.resource_types.clone(),
            content: state.device_resource_body.clone(),
            ownership_status: state.ownership_status,
            endpoints: state.endpoints.iter().map(|ep| ep.uri.clone()).collect(),
        }
    }

    // =========================================================================
    // SESSIONS
    // =========================================================================

    /// Session to `endpoint` for `auth`, dialed on first use
    pub async fn connection(
        &self,
        client: &dyn ProtocolClient,
        auth: &dyn AuthenticationStrategy,
        endpoint: &Endpoint,
    ) -> GatewayResult<Arc<dyn DeviceConnection>> {
        let key = SessionKey::new(endpoint, auth);
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&key) {
            return Ok(Arc::clone(session));
        }

        let address = endpoint.address().ok_or_else(|| GatewayError::NoUsableEndpoint {
            device_id: self.id,
            href: endpoint.uri.clone(),
        })?;
        let session = match address.scheme {
            Scheme::Coap | Scheme::CoapTcp => client.dial(&address).await.map_err(|e| {
                GatewayError::from_transport(
                    StatusCode::Unavailable,
                    format!("cannot dial {address}"),
                    e,
                )
            })?,
            Scheme::Coaps => auth.dial_secure_datagram(client, &address).await?,
            Scheme::CoapsTcp => auth.dial_secure_stream(client, &address).await?,
        };

        debug!(device_id = %self.id, endpoint = %address, "Opened device session");
        sessions.insert(key, Arc::clone(&session));
        Ok(session)
    }

    /// Forget a session that failed, closing it on a best-effort basis
    pub async fn drop_connection(&self, auth: &dyn AuthenticationStrategy, endpoint: &Endpoint) {
        let key = SessionKey::new(endpoint, auth);
        let session = self.sessions.lock().await.remove(&key);
        if let Some(session) = session {
            if let Err(e) = session.close().await {
                debug!(device_id = %self.id, endpoint = %endpoint.uri, error = %e, "Closing failed session");
            }
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Close every session; the first failure is reported
    pub async fn close(&self) -> GatewayResult<()> {
        let sessions: Vec<_> = self.sessions.lock().await.drain().collect();
        let mut first_error = None;
        for (SessionKey { uri, .. }, session) in sessions {
            if let Err(e) = session.close().await {
                debug!(device_id = %self.id, endpoint = %uri, error = %e, "Cannot close session");
                first_error.get_or_insert(GatewayError::from_transport(
                    StatusCode::Unavailable,
                    format!("cannot close session {uri}"),
                    e,
                ));
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
