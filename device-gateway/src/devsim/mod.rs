//! # Device Simulator
//!
//! An in-memory fleet of devices behind the [`ProtocolClient`] seam. Each
//! device answers multicast discovery on both address families, serves its
//! resource links and resources, and supports ownership transfer and reset.
//! Dials and closed sessions are counted so callers can observe session
//! reuse and eviction. Discovery queries can be made to fail or stall
//! fleet-wide, and single devices can ignore one query.

mod device;

pub use device::{
    RESOURCE_HREF_LIGHT, RESOURCE_HREF_SWITCHES, RESOURCE_TYPE_COLLECTION, RESOURCE_TYPE_LIGHT,
};

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use shared::{
    constants::{COAP_PORT, RESOURCE_HREF_PSTAT, RESOURCE_TYPE_PSTAT},
    error::TransportError,
    types::{DeviceId, Endpoint, EndpointAddress, IpFamily, ResourceLinks, ResponseCode, Scheme},
};

use crate::transport::{
    DeviceConnection, DiscoveryQuery, DiscoveryResponse, DiscoveryTarget, OwnRequest,
    ProtocolClient, Request, Response, SecureDialConfig, TransportResult,
};

use device::SimulatedDevice;

/// Misbehavior of one discovery query across the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFault {
    /// The query fails before any device answers
    Fail,
    /// Answers arrive only after the delay
    Stall(Duration),
}

#[derive(Default)]
struct FleetState {
    devices: RwLock<BTreeMap<DeviceId, SimulatedDevice>>,
    dials: AtomicUsize,
    closed: AtomicUsize,
    fail_close: AtomicBool,
    discovery_delay: RwLock<Option<Duration>>,
    query_faults: RwLock<HashMap<DiscoveryQuery, QueryFault>>,
}

impl FleetState {
    fn find_by_ip(&self, ip: std::net::IpAddr) -> Option<DeviceId> {
        self.devices
            .read()
            .values()
            .find(|device| device.has_host(ip))
            .map(|device| device.id)
    }
}

/// Simulated device fleet, cheap to clone
#[derive(Clone, Default)]
pub struct SimulatedFleet {
    state: Arc<FleetState>,
}

impl SimulatedFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fleet with a few devices, for demos
    pub fn demo() -> Self {
        let fleet = Self::new();
        fleet.add_device("kitchen-light");
        fleet.add_device("hall-light");
        fleet.add_device_without_security("legacy-sensor");
        fleet
    }

    // =========================================================================
    // FLEET SETUP
    // =========================================================================

    fn insert(&self, name: &str, security: bool) -> DeviceId {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes());
        let mut devices = self.state.devices.write();
        let index = u8::try_from(devices.len() + 1).unwrap_or(u8::MAX);
        devices.insert(id, SimulatedDevice::new(id, index, name, security));
        id
    }

    /// Add a device with a security resource; its id derives from `name`
    pub fn add_device(&self, name: &str) -> DeviceId {
        self.insert(name, true)
    }

    /// Add a device that does not expose a security resource
    pub fn add_device_without_security(&self, name: &str) -> DeviceId {
        self.insert(name, false)
    }

    fn with_device<T>(&self, id: DeviceId, f: impl FnOnce(&mut SimulatedDevice) -> T) -> Option<T> {
        self.state.devices.write().get_mut(&id).map(f)
    }

    /// Make the device stop answering discovery and dials
    pub fn set_reachable(&self, id: DeviceId, reachable: bool) {
        self.with_device(id, |device| device.reachable = reachable);
    }

    /// Restrict the device to IPv4
    pub fn disable_ipv6(&self, id: DeviceId) {
        self.with_device(id, |device| device.ipv6 = false);
    }

    /// Serve `href` over secure endpoints only
    pub fn set_secure_only(&self, id: DeviceId, href: &str, secure_only: bool) -> bool {
        self.with_device(id, |device| device.set_secure_only(href, secure_only))
            .unwrap_or(false)
    }

    /// Make session close fail
    pub fn set_close_failure(&self, fail: bool) {
        self.state.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Delay every discovery answer
    pub fn set_discovery_delay(&self, delay: Option<Duration>) {
        *self.state.discovery_delay.write() = delay;
    }

    /// Make one discovery query fail or stall; `None` restores it
    pub fn set_query_fault(&self, query: DiscoveryQuery, fault: Option<QueryFault>) {
        let mut faults = self.state.query_faults.write();
        match fault {
            Some(fault) => faults.insert(query, fault),
            None => faults.remove(&query),
        };
    }

    /// Make the device ignore `query`
    pub fn set_query_silent(&self, id: DeviceId, query: DiscoveryQuery, silent: bool) {
        self.with_device(id, |device| {
            device.silent_queries.retain(|q| *q != query);
            if silent {
                device.silent_queries.push(query);
            }
        });
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.state.devices.read().keys().copied().collect()
    }

    pub fn is_owned(&self, id: DeviceId) -> bool {
        self.state
            .devices
            .read()
            .get(&id)
            .is_some_and(|device| device.is_owned())
    }

    /// Common name of the certificate provisioned to the device
    pub fn device_certificate(&self, id: DeviceId) -> Option<String> {
        self.state
            .devices
            .read()
            .get(&id)
            .and_then(|device| device.certificate().map(str::to_string))
    }

    pub fn owner(&self, id: DeviceId) -> Option<String> {
        self.state
            .devices
            .read()
            .get(&id)
            .and_then(|device| device.owner().map(str::to_string))
    }

    pub fn insecure_endpoint(&self, id: DeviceId) -> Endpoint {
        self.endpoint(id, Scheme::Coap)
    }

    pub fn secure_endpoint(&self, id: DeviceId) -> Endpoint {
        self.endpoint(id, Scheme::Coaps)
    }

    fn endpoint(&self, id: DeviceId, scheme: Scheme) -> Endpoint {
        self.state
            .devices
            .read()
            .get(&id)
            .map(|device| device.endpoint(scheme, IpFamily::V4))
            .unwrap_or_else(|| Endpoint::new(""))
    }

    /// Unicast discovery address of the device, `host:port`
    pub fn address(&self, id: DeviceId) -> Option<String> {
        self.state
            .devices
            .read()
            .get(&id)
            .map(|device| SocketAddr::new(device.host(IpFamily::V4), COAP_PORT).to_string())
    }

    pub fn dial_count(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    pub fn closed_count(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    // =========================================================================
    // DISCOVERY
    // =========================================================================

    fn answer(&self, target: DiscoveryTarget, query: DiscoveryQuery) -> Vec<DiscoveryResponse> {
        let devices = self.state.devices.read();
        devices
            .values()
            .filter(|device| device.reachable && !device.silent_queries.contains(&query))
            .filter_map(|device| {
                let family = match target {
                    DiscoveryTarget::Multicast(IpFamily::V6) if !device.ipv6 => return None,
                    DiscoveryTarget::Multicast(family) => family,
                    DiscoveryTarget::Unicast(addr) if device.has_host(addr.ip()) => {
                        if addr.is_ipv6() {
                            IpFamily::V6
                        } else {
                            IpFamily::V4
                        }
                    }
                    DiscoveryTarget::Unicast(_) => return None,
                };
                let payload = match query {
                    DiscoveryQuery::DeviceIdentity => device.identity_body(),
                    DiscoveryQuery::ResourceLinks => {
                        let links = device.discovery_links(family, query.resource_types());
                        serde_cbor::to_vec(&links).ok()?
                    }
                };
                Some(DiscoveryResponse {
                    remote: SocketAddr::new(device.host(family), COAP_PORT),
                    content_format: Some(shared::constants::CONTENT_FORMAT_OCF_CBOR),
                    payload,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ProtocolClient for SimulatedFleet {
    async fn discover(
        &self,
        target: DiscoveryTarget,
        query: DiscoveryQuery,
        responses: mpsc::Sender<DiscoveryResponse>,
    ) -> TransportResult<()> {
        let delay = *self.state.discovery_delay.read();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let fault = self.state.query_faults.read().get(&query).copied();
        match fault {
            Some(QueryFault::Fail) => {
                return Err(TransportError::Io(format!("simulated {query:?} failure")));
            }
            Some(QueryFault::Stall(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }
        for response in self.answer(target, query) {
            if responses.send(response).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn dial(&self, endpoint: &EndpointAddress) -> TransportResult<Arc<dyn DeviceConnection>> {
        self.connect(endpoint, None)
    }

    async fn dial_secure(
        &self,
        endpoint: &EndpointAddress,
        config: SecureDialConfig,
    ) -> TransportResult<Arc<dyn DeviceConnection>> {
        self.connect(endpoint, Some(config))
    }

    async fn own(&self, request: OwnRequest) -> TransportResult<()> {
        let id = request.device_id;
        let not_found = || TransportError::Response {
            code: ResponseCode::NOT_FOUND,
        };
        let provision = self
            .with_device(id, |device| device.check_own(&request))
            .unwrap_or_else(|| Err(not_found()))?;
        if !provision {
            debug!(device_id = %id, "Simulated device already owned by requester");
            return Ok(());
        }

        let certificate = match &request.signer {
            Some(signer) => Some(
                device::signed_certificate(id, signer.as_ref(), &request.options.trust_anchors)
                    .await?,
            ),
            None => None,
        };
        let result = self
            .with_device(id, |device| device.commit_own(&request, certificate))
            .unwrap_or_else(|| Err(not_found()));
        debug!(device_id = %id, ok = result.is_ok(), "Simulated ownership transfer");
        result
    }

    async fn disown(
        &self,
        connection: &dyn DeviceConnection,
        links: &ResourceLinks,
    ) -> TransportResult<()> {
        if links.by_type(RESOURCE_TYPE_PSTAT).is_none() {
            return Err(TransportError::Response {
                code: ResponseCode::NOT_FOUND,
            });
        }
        let mut dos = BTreeMap::new();
        dos.insert(
            serde_cbor::Value::Text("s".into()),
            serde_cbor::Value::Integer(1),
        );
        let mut body = BTreeMap::new();
        body.insert(
            serde_cbor::Value::Text("dos".into()),
            serde_cbor::Value::Map(dos),
        );
        let payload = serde_cbor::to_vec(&serde_cbor::Value::Map(body))
            .map_err(|e| TransportError::Io(e.to_string()))?;
        connection
            .request(Request::post(RESOURCE_HREF_PSTAT, payload))
            .await?
            .into_success()?;
        Ok(())
    }
}

impl SimulatedFleet {
    fn connect(
        &self,
        endpoint: &EndpointAddress,
        config: Option<SecureDialConfig>,
    ) -> TransportResult<Arc<dyn DeviceConnection>> {
        let dial_error = |reason: &str| TransportError::Dial {
            endpoint: endpoint.to_string(),
            reason: reason.to_string(),
        };
        let addr = endpoint.socket_addr().ok_or_else(|| dial_error("invalid address"))?;
        let device_id = self
            .state
            .find_by_ip(addr.ip())
            .ok_or_else(|| dial_error("no route to host"))?;

        {
            let devices = self.state.devices.read();
            let device = devices.get(&device_id).ok_or_else(|| dial_error("no route to host"))?;
            if !device.reachable {
                return Err(dial_error("host unreachable"));
            }
            if endpoint.scheme.is_secure() {
                let config = config.as_ref().ok_or_else(|| dial_error("missing credentials"))?;
                device.accepts(config).map_err(|reason| TransportError::Handshake {
                    endpoint: endpoint.to_string(),
                    reason,
                })?;
            }
        }

        self.state.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SimulatedConnection {
            state: Arc::clone(&self.state),
            device_id,
            family: endpoint.family(),
            secure: endpoint.scheme.is_secure(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Session with one simulated device
struct SimulatedConnection {
    state: Arc<FleetState>,
    device_id: DeviceId,
    family: IpFamily,
    secure: bool,
    closed: AtomicBool,
}

#[async_trait]
impl DeviceConnection for SimulatedConnection {
    async fn request(&self, request: Request) -> TransportResult<Response> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let mut devices = self.state.devices.write();
        let device = devices.get_mut(&self.device_id).ok_or(TransportError::Closed)?;
        if !device.reachable {
            return Err(TransportError::Timeout);
        }
        let response = device.handle(self.secure, self.family, request);
        response.into_success()
    }

    async fn close(&self) -> TransportResult<()> {
        if self.state.fail_close.load(Ordering::SeqCst) {
            return Err(TransportError::Io("simulated close failure".into()));
        }
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::constants::*;

    #[tokio::test]
    async fn test_multicast_discovery_answers() {
        let fleet = SimulatedFleet::new();
        fleet.add_device("a");
        let b = fleet.add_device("b");
        fleet.disable_ipv6(b);

        let (tx, mut rx) = mpsc::channel(8);
        fleet
            .discover(DiscoveryTarget::Multicast(IpFamily::V6), DiscoveryQuery::ResourceLinks, tx)
            .await
            .unwrap();
        let mut answers = Vec::new();
        while let Some(response) = rx.recv().await {
            answers.push(response);
        }
        assert_eq!(answers.len(), 1);

        let links: ResourceLinks = serde_cbor::from_slice(&answers[0].payload).unwrap();
        assert_eq!(links.len(), 2);
        assert!(links.by_type(RESOURCE_TYPE_DOXM).is_some());
    }

    #[tokio::test]
    async fn test_request_on_insecure_session() {
        let fleet = SimulatedFleet::new();
        let id = fleet.add_device("a");
        let endpoint = fleet.insecure_endpoint(id).address().unwrap();
        let connection = fleet.dial(&endpoint).await.unwrap();

        let response = connection.request(Request::get(RESOURCE_HREF_DEVICE)).await.unwrap();
        let body: serde_cbor::Value = serde_cbor::from_slice(&response.payload).unwrap();
        assert!(matches!(body, serde_cbor::Value::Map(_)));

        let err = connection.request(Request::get("/missing")).await.unwrap_err();
        assert_eq!(
            err,
            TransportError::Response {
                code: ResponseCode::NOT_FOUND
            }
        );

        connection.close().await.unwrap();
        assert_eq!(
            connection.request(Request::get(RESOURCE_HREF_DEVICE)).await,
            Err(TransportError::Closed)
        );
        assert_eq!(fleet.closed_count(), 1);
    }

    #[tokio::test]
    async fn test_secure_dial_requires_ownership() {
        let fleet = SimulatedFleet::new();
        let id = fleet.add_device("a");
        let endpoint = fleet.secure_endpoint(id).address().unwrap();
        let config = SecureDialConfig::PreSharedKey {
            identity: Uuid::new_v4(),
            key: [0; PSK_KEY_LENGTH],
        };
        let err = fleet.dial_secure(&endpoint, config).await.err().unwrap();
        assert!(matches!(err, TransportError::Handshake { .. }));
        assert_eq!(fleet.dial_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_device() {
        let fleet = SimulatedFleet::new();
        let id = fleet.add_device("a");
        fleet.set_reachable(id, false);
        let endpoint = fleet.insecure_endpoint(id).address().unwrap();
        assert!(matches!(
            fleet.dial(&endpoint).await.err().unwrap(),
            TransportError::Dial { .. }
        ));
    }
}
