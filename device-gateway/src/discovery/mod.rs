//! # Discovery Engine
//!
//! Two discovery queries run concurrently under one deadline:
//! 1. **Identity**: the device identity resource. Decodes the device id,
//!    types and raw body; new ids create a record.
//! 2. **Resource links**: links of the identity and security resources.
//!    Supplies endpoints and the ownership status. A device whose identity
//!    link is secure-only keeps the plain address that answered, so its
//!    links can still be listed without credentials.
//!
//! Each query fans out over every target (multicast family or explicit
//! endpoint) into one bounded channel. Per-target failures are logged and
//! never cancel the other query; whatever arrived before the deadline is
//! merged into the device cache.

use futures::future::join_all;
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use shared::{
    config::DiscoveryConfig,
    constants::*,
    error::{GatewayError, GatewayResult},
    types::{
        Content, DeviceId, DeviceSummary, DiscoveryFilter, Endpoint, OwnershipStatus,
        ResourceLinks, Scheme,
    },
};

use crate::cache::DeviceCache;
use crate::transport::{DiscoveryQuery, DiscoveryResponse, DiscoveryTarget, ProtocolClient};

/// Ownership status derived from a device's links: no security resource
/// means unsupported, a security resource without insecure endpoints means
/// owned
pub fn ownership_status(links: &ResourceLinks) -> OwnershipStatus {
    match links.by_type(RESOURCE_TYPE_DOXM) {
        None => OwnershipStatus::Unsupported,
        Some(doxm) if doxm.insecure_endpoints().is_empty() => OwnershipStatus::Owned,
        Some(_) => OwnershipStatus::Unowned,
    }
}

/// Decode a device payload by its content format; binary unless JSON
pub(crate) fn decode_payload<T: for<'de> Deserialize<'de>>(
    content_format: Option<u16>,
    payload: &[u8],
) -> GatewayResult<T> {
    match content_format {
        Some(CONTENT_FORMAT_JSON) => Ok(serde_json::from_slice(payload)?),
        _ => Ok(serde_cbor::from_slice(payload)?),
    }
}

/// Identity resource fields discovery cares about
#[derive(Debug, Deserialize)]
struct IdentityBody {
    di: String,
    #[serde(default)]
    rt: Vec<String>,
}

/// `host` or `host:port` to a unicast target; IPv6 hosts may be bracketed
pub fn parse_discovery_endpoint(endpoint: &str, default_port: u16) -> Option<SocketAddr> {
    let endpoint = endpoint.trim();
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Some(addr);
    }
    let host = endpoint
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(endpoint);
    host.parse::<IpAddr>()
        .ok()
        .map(|ip| SocketAddr::new(ip, default_port))
}

/// Discovery over a protocol client, merging into a device cache
pub struct DiscoveryEngine {
    client: Arc<dyn ProtocolClient>,
    cache: Arc<DeviceCache>,
    config: DiscoveryConfig,
}

impl DiscoveryEngine {
    pub fn new(
        client: Arc<dyn ProtocolClient>,
        cache: Arc<DeviceCache>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            client,
            cache,
            config,
        }
    }

    fn targets(&self, filter: &DiscoveryFilter) -> Vec<DiscoveryTarget> {
        let mut targets: Vec<DiscoveryTarget> = filter
            .use_multicast
            .iter()
            .map(|family| DiscoveryTarget::Multicast(*family))
            .collect();
        for endpoint in &filter.use_endpoints {
            match parse_discovery_endpoint(endpoint, self.config.multicast_port) {
                Some(addr) => targets.push(DiscoveryTarget::Unicast(addr)),
                None => debug!(endpoint = %endpoint, "Skipping invalid discovery endpoint"),
            }
        }
        // first occurrence wins, order otherwise kept
        let mut seen = HashSet::new();
        targets.retain(|target| seen.insert(*target));
        targets
    }

    /// Discover devices and return the known ones matching `filter`
    pub async fn discover(&self, filter: DiscoveryFilter) -> GatewayResult<Vec<DeviceSummary>> {
        let filter = filter.with_defaults();
        let targets = self.targets(&filter);
        if targets.is_empty() && !filter.use_cache {
            return Err(GatewayError::Configuration(
                "no valid discovery target".into(),
            ));
        }

        let timeout = filter
            .timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.timeout());
        let deadline = Instant::now() + timeout;

        let mut seen = BTreeSet::new();
        if !targets.is_empty() {
            let (identities, links) = tokio::join!(
                self.run_query(DiscoveryQuery::DeviceIdentity, &targets, deadline),
                self.run_query(DiscoveryQuery::ResourceLinks, &targets, deadline),
            );
            seen.extend(identities);
            seen.extend(links);
        }
        if filter.use_cache {
            seen.extend(self.cache.snapshot().iter().map(|record| record.id()));
        }

        let mut devices: Vec<DeviceSummary> = seen
            .into_iter()
            .filter_map(|id| self.cache.get(id).ok())
            .filter(|record| record.has_device_resource_body())
            .map(|record| record.summary())
            .filter(|summary| filter.matches(summary))
            .collect();
        devices.sort_by_key(|summary| summary.id);

        info!(
            targets = targets.len(),
            devices = devices.len(),
            timeout = ?timeout,
            "Discovery finished"
        );
        Ok(devices)
    }

    /// Run one query against every target until completion or `deadline`
    async fn run_query(
        &self,
        query: DiscoveryQuery,
        targets: &[DiscoveryTarget],
        deadline: Instant,
    ) -> BTreeSet<DeviceId> {
        let (tx, mut rx) = mpsc::channel(DISCOVERY_RESPONSE_CHANNEL_CAPACITY);
        let requests = join_all(targets.iter().map(|target| {
            let tx = tx.clone();
            async move {
                let result = self.client.discover(*target, query, tx).await;
                (*target, result)
            }
        }));
        drop(tx);

        let mut seen = BTreeSet::new();
        let receive = async {
            while let Some(response) = rx.recv().await {
                let result = match query {
                    DiscoveryQuery::DeviceIdentity => self.on_identity(response),
                    DiscoveryQuery::ResourceLinks => self.on_links(response),
                };
                match result {
                    Ok(ids) => seen.extend(ids),
                    Err(e) => debug!(query = ?query, error = %e, "Ignoring discovery response"),
                }
            }
        };

        let exchange = async {
            let (results, ()) = tokio::join!(requests, receive);
            results
        };
        match timeout_at(deadline, exchange).await {
            Ok(results) => {
                for (target, result) in results {
                    if let Err(e) = result {
                        debug!(target = ?target, query = ?query, error = %e, "Discovery failed");
                    }
                }
            }
            Err(_) => debug!(query = ?query, "Discovery deadline reached"),
        }
        seen
    }

    fn on_identity(&self, response: DiscoveryResponse) -> GatewayResult<Vec<DeviceId>> {
        let body: IdentityBody = decode_payload(response.content_format, &response.payload)?;
        let id = DeviceId::parse_str(&body.di)
            .map_err(|_| GatewayError::InvalidDeviceId(body.di.clone()))?;
        let (record, inserted) = self.cache.load_or_store(id);
        record.update_identity(Content::from_response(response.payload), body.rt);
        debug!(device_id = %id, remote = %response.remote, inserted, "Device identity discovered");
        Ok(vec![id])
    }

    fn on_links(&self, response: DiscoveryResponse) -> GatewayResult<Vec<DeviceId>> {
        let mut links: ResourceLinks =
            decode_payload(response.content_format, &response.payload)?;
        links.patch_endpoints(response.remote);

        let mut ids = Vec::new();
        for (id, device_links) in links.group_by_device() {
            let Some(device_link) = device_links.by_type(RESOURCE_TYPE_DEVICE) else {
                continue;
            };
            let status = ownership_status(&device_links);
            let mut endpoints = device_link.endpoints.clone();
            if device_link.insecure_endpoints().is_empty() {
                endpoints.push(Endpoint::from_socket_addr(Scheme::Coap, response.remote));
            }
            let (record, _) = self.cache.load_or_store(id);
            record.update_metadata(device_link.resource_types.clone(), &endpoints, status);
            debug!(device_id = %id, status = %status, "Device links discovered");
            ids.push(id);
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devsim::{QueryFault, SimulatedFleet};
    use shared::types::{IpFamily, ResourceLink};

    fn engine(fleet: &SimulatedFleet) -> (DiscoveryEngine, Arc<DeviceCache>) {
        let cache = Arc::new(DeviceCache::new());
        let engine = DiscoveryEngine::new(
            Arc::new(fleet.clone()),
            Arc::clone(&cache),
            DiscoveryConfig::default(),
        );
        (engine, cache)
    }

    fn ipv4_multicast() -> DiscoveryFilter {
        DiscoveryFilter {
            use_multicast: vec![IpFamily::V4],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_single_device_over_ipv4_multicast() {
        let fleet = SimulatedFleet::new();
        let id = fleet.add_device("light");
        let (engine, _) = engine(&fleet);

        let devices = engine.discover(ipv4_multicast()).await.unwrap();
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.id, id);
        assert_eq!(device.ownership_status, OwnershipStatus::Unowned);
        assert!(device.content.is_some());
        assert!(device.types.iter().any(|t| t == RESOURCE_TYPE_DEVICE));

        let schemes: Vec<Scheme> = device
            .endpoints
            .iter()
            .map(|uri| Endpoint::new(uri.as_str()).address().unwrap().scheme)
            .collect();
        assert_eq!(
            schemes,
            vec![Scheme::Coap, Scheme::CoapTcp, Scheme::Coaps, Scheme::CoapsTcp]
        );
    }

    #[tokio::test]
    async fn test_both_families_fill_eight_slots() {
        let fleet = SimulatedFleet::new();
        fleet.add_device("light");
        let (engine, _) = engine(&fleet);

        let devices = engine.discover(DiscoveryFilter::default()).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].endpoints.len(), 8);
    }

    #[tokio::test]
    async fn test_results_sorted_and_filtered() {
        let fleet = SimulatedFleet::new();
        for name in ["d", "c", "b", "a"] {
            fleet.add_device(name);
        }
        let legacy = fleet.add_device_without_security("legacy");
        let (engine, _) = engine(&fleet);

        let devices = engine.discover(ipv4_multicast()).await.unwrap();
        assert_eq!(devices.len(), 5);
        assert!(devices.windows(2).all(|pair| pair[0].id < pair[1].id));

        let filter = DiscoveryFilter {
            ownership_status_filter: vec![OwnershipStatus::Unsupported],
            ..ipv4_multicast()
        };
        let devices = engine.discover(filter).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, legacy);
    }

    #[tokio::test]
    async fn test_unicast_endpoint_discovery() {
        let fleet = SimulatedFleet::new();
        let a = fleet.add_device("a");
        fleet.add_device("b");
        let (engine, _) = engine(&fleet);

        let host = fleet.address(a).unwrap();
        let host = host.split(':').next().unwrap().to_string();
        let filter = DiscoveryFilter {
            use_endpoints: vec![host],
            ..Default::default()
        };
        let devices = engine.discover(filter).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, a);
    }

    #[tokio::test]
    async fn test_cache_only_and_stale_entries_kept() {
        let fleet = SimulatedFleet::new();
        let id = fleet.add_device("a");
        let (engine, cache) = engine(&fleet);
        engine.discover(ipv4_multicast()).await.unwrap();

        fleet.set_reachable(id, false);
        let devices = engine.discover(ipv4_multicast()).await.unwrap();
        assert!(devices.is_empty());
        assert_eq!(cache.len(), 1);

        let filter = DiscoveryFilter {
            use_cache: true,
            ..Default::default()
        };
        let devices = engine.discover(filter).await.unwrap();
        assert_eq!(devices.len(), 1);
    }

    #[tokio::test]
    async fn test_deadline_bounds_discovery() {
        let fleet = SimulatedFleet::new();
        fleet.add_device("a");
        fleet.set_discovery_delay(Some(Duration::from_secs(5)));
        let (engine, cache) = engine(&fleet);

        let started = std::time::Instant::now();
        let filter = DiscoveryFilter {
            timeout_ms: Some(100),
            ..ipv4_multicast()
        };
        let devices = engine.discover(filter).await.unwrap();
        assert!(devices.is_empty());
        assert!(cache.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_targets_deduplicated() {
        let fleet = SimulatedFleet::new();
        let (engine, _) = engine(&fleet);
        let filter = DiscoveryFilter {
            use_multicast: vec![IpFamily::V4, IpFamily::V6, IpFamily::V4],
            use_endpoints: vec![
                "10.0.0.1".into(),
                "10.0.0.2".into(),
                "10.0.0.1:5683".into(),
                "[fe80::1]".into(),
                "10.0.0.2".into(),
            ],
            ..Default::default()
        };
        let targets = engine.targets(&filter);
        assert_eq!(
            targets,
            vec![
                DiscoveryTarget::Multicast(IpFamily::V4),
                DiscoveryTarget::Multicast(IpFamily::V6),
                DiscoveryTarget::Unicast("10.0.0.1:5683".parse().unwrap()),
                DiscoveryTarget::Unicast("10.0.0.2:5683".parse().unwrap()),
                DiscoveryTarget::Unicast("[fe80::1]:5683".parse().unwrap()),
            ]
        );
    }

    #[tokio::test]
    async fn test_secure_only_identity_link_keeps_plain_address() {
        let fleet = SimulatedFleet::new();
        let id = fleet.add_device("light");
        assert!(fleet.set_secure_only(id, RESOURCE_HREF_DEVICE, true));
        let (engine, _) = engine(&fleet);

        let devices = engine.discover(ipv4_multicast()).await.unwrap();
        assert_eq!(devices.len(), 1);
        let endpoints = &devices[0].endpoints;
        assert!(endpoints.contains(&fleet.insecure_endpoint(id).uri));
        assert!(endpoints.contains(&fleet.secure_endpoint(id).uri));
        assert_eq!(devices[0].ownership_status, OwnershipStatus::Unowned);
    }

    #[tokio::test]
    async fn test_device_without_identity_answer_is_excluded() {
        let fleet = SimulatedFleet::new();
        let a = fleet.add_device("a");
        let b = fleet.add_device("b");
        fleet.set_query_silent(b, DiscoveryQuery::DeviceIdentity, true);
        let (engine, cache) = engine(&fleet);

        let devices = engine.discover(ipv4_multicast()).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, a);

        // the links answer still created a record, without an identity body
        let record = cache.get(b).unwrap();
        assert!(!record.has_device_resource_body());
        assert_eq!(record.ownership_status(), OwnershipStatus::Unowned);

        fleet.set_query_silent(b, DiscoveryQuery::DeviceIdentity, false);
        let devices = engine.discover(ipv4_multicast()).await.unwrap();
        assert_eq!(devices.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_links_query_keeps_identities() {
        let fleet = SimulatedFleet::new();
        let id = fleet.add_device("a");
        fleet.set_query_fault(DiscoveryQuery::ResourceLinks, Some(QueryFault::Fail));
        let (engine, _) = engine(&fleet);

        let devices = engine.discover(ipv4_multicast()).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id, id);
        assert!(devices[0].content.is_some());
        assert!(devices[0].endpoints.is_empty());
        assert_eq!(devices[0].ownership_status, OwnershipStatus::Unknown);
    }

    #[tokio::test]
    async fn test_stalled_identity_query_keeps_links() {
        let fleet = SimulatedFleet::new();
        let id = fleet.add_device("a");
        fleet.set_query_fault(
            DiscoveryQuery::DeviceIdentity,
            Some(QueryFault::Stall(Duration::from_secs(5))),
        );
        let (engine, cache) = engine(&fleet);

        let started = std::time::Instant::now();
        let filter = DiscoveryFilter {
            timeout_ms: Some(200),
            ..ipv4_multicast()
        };
        let devices = engine.discover(filter).await.unwrap();
        assert!(devices.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));

        let record = cache.get(id).unwrap();
        assert_eq!(record.endpoints().len(), 4);
        assert_eq!(record.ownership_status(), OwnershipStatus::Unowned);

        fleet.set_query_fault(DiscoveryQuery::DeviceIdentity, None);
        let devices = engine.discover(ipv4_multicast()).await.unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].endpoints.len(), 4);
    }

    #[tokio::test]
    async fn test_invalid_endpoints_only() {
        let fleet = SimulatedFleet::new();
        let (engine, _) = engine(&fleet);
        let filter = DiscoveryFilter {
            use_endpoints: vec!["not an address".into()],
            ..Default::default()
        };
        assert!(engine.discover(filter).await.is_err());
    }

    #[test]
    fn test_ownership_status() {
        let id = uuid::Uuid::new_v4();
        let doxm = |eps: Vec<&str>| ResourceLink {
            href: RESOURCE_HREF_DOXM.into(),
            resource_types: vec![RESOURCE_TYPE_DOXM.into()],
            device_id: id.to_string(),
            endpoints: eps.into_iter().map(Endpoint::new).collect(),
            ..Default::default()
        };
        assert_eq!(
            ownership_status(&ResourceLinks(vec![])),
            OwnershipStatus::Unsupported
        );
        assert_eq!(
            ownership_status(&ResourceLinks(vec![doxm(vec!["coaps://10.0.0.1:5684"])])),
            OwnershipStatus::Owned
        );
        assert_eq!(
            ownership_status(&ResourceLinks(vec![doxm(vec![
                "coap://10.0.0.1:5683",
                "coaps://10.0.0.1:5684"
            ])])),
            OwnershipStatus::Unowned
        );
    }

    #[test]
    fn test_parse_discovery_endpoint() {
        assert_eq!(
            parse_discovery_endpoint("10.0.0.1", 5683),
            Some("10.0.0.1:5683".parse().unwrap())
        );
        assert_eq!(
            parse_discovery_endpoint("10.0.0.1:6000", 5683),
            Some("10.0.0.1:6000".parse().unwrap())
        );
        assert_eq!(
            parse_discovery_endpoint("[fe80::1]", 5683),
            Some("[fe80::1]:5683".parse().unwrap())
        );
        assert_eq!(parse_discovery_endpoint("fe80::1", 5683).unwrap().port(), 5683);
        assert!(parse_discovery_endpoint("example", 5683).is_none());
    }
}
