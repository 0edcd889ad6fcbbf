//! Endpoint slot filter.
//!
//! A device keeps at most one endpoint per address family, transport and
//! security combination. Applying the filter to the existing endpoints and
//! then to freshly discovered ones lets a valid new endpoint replace the one
//! in its slot while slots without news keep their value.

use shared::types::{Endpoint, IpFamily, Transport};

const SLOT_COUNT: usize = 8;

/// Slot index, ordered insecure before secure, datagram before stream and
/// IPv4 before IPv6
fn slot_of(endpoint: &Endpoint) -> Option<usize> {
    let addr = endpoint.address()?;
    let family = match addr.family() {
        IpFamily::V4 => 0,
        IpFamily::V6 => 1,
    };
    let transport = match addr.scheme.transport() {
        Transport::Datagram => 0,
        Transport::Stream => 2,
    };
    let security = if addr.scheme.is_secure() { 4 } else { 0 };
    Some(security + transport + family)
}

fn fill_slots(slots: &mut [Option<Endpoint>; SLOT_COUNT], endpoints: &[Endpoint]) {
    for endpoint in endpoints {
        if let Some(slot) = slot_of(endpoint) {
            slots[slot] = Some(endpoint.clone());
        }
    }
}

/// Merge `discovered` into `existing`, one endpoint per slot
pub fn merge_endpoints(existing: &[Endpoint], discovered: &[Endpoint]) -> Vec<Endpoint> {
    let mut slots: [Option<Endpoint>; SLOT_COUNT] = Default::default();
    fill_slots(&mut slots, existing);
    fill_slots(&mut slots, discovered);
    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eps(uris: &[&str]) -> Vec<Endpoint> {
        uris.iter().map(|uri| Endpoint::new(*uri)).collect()
    }

    fn uris(endpoints: &[Endpoint]) -> Vec<&str> {
        endpoints.iter().map(|ep| ep.uri.as_str()).collect()
    }

    #[test]
    fn test_one_endpoint_per_slot() {
        let merged = merge_endpoints(
            &[],
            &eps(&[
                "coaps+tcp://10.0.0.1:40000",
                "coap://10.0.0.1:5683",
                "coap://10.0.0.2:5683",
                "coaps://[fe80::1]:5684",
                "coap+tcp://[fe80::1]:40001",
            ]),
        );
        assert_eq!(
            uris(&merged),
            vec![
                "coap://10.0.0.2:5683",
                "coap+tcp://[fe80::1]:40001",
                "coaps://[fe80::1]:5684",
                "coaps+tcp://10.0.0.1:40000",
            ]
        );
    }

    #[test]
    fn test_new_endpoint_replaces_slot() {
        let existing = eps(&["coap://10.0.0.1:5683", "coaps://10.0.0.1:5684"]);
        let merged = merge_endpoints(&existing, &eps(&["coap://10.0.0.9:5683"]));
        assert_eq!(uris(&merged), vec!["coap://10.0.0.9:5683", "coaps://10.0.0.1:5684"]);
    }

    #[test]
    fn test_invalid_endpoint_keeps_slot() {
        let existing = eps(&["coap://10.0.0.1:5683"]);
        let merged = merge_endpoints(&existing, &eps(&["coap://", "", "http://10.0.0.2:80"]));
        assert_eq!(uris(&merged), vec!["coap://10.0.0.1:5683"]);
    }

    #[test]
    fn test_never_more_than_eight() {
        let mut all = Vec::new();
        for host in ["10.0.0.1", "10.0.0.2", "[fe80::1]", "[fe80::2]"] {
            for scheme in ["coap", "coaps", "coap+tcp", "coaps+tcp"] {
                all.push(Endpoint::new(format!("{scheme}://{host}:5683")));
            }
        }
        let merged = merge_endpoints(&all, &all);
        assert_eq!(merged.len(), 8);
    }
}
