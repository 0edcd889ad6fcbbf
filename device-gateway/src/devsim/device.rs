//! One simulated device: its resources, ownership state and request handling.

use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::pki_types::CertificateDer;
use serde_cbor::Value;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use shared::{
    config::OwnershipTransferMethod,
    constants::*,
    error::TransportError,
    types::{DeviceId, Endpoint, IpFamily, Policy, ResourceLink, ResourceLinks, ResponseCode, Scheme},
};

use crate::auth::parse_certificate_chain;
use crate::transport::{
    CertificateSigner, DiscoveryQuery, Method, OwnRequest, Request, Response, SecureDialConfig,
    TransportResult,
};

/// Resource type of the sample light resource
pub const RESOURCE_TYPE_LIGHT: &str = "core.light";

/// Href of the sample light resource
pub const RESOURCE_HREF_LIGHT: &str = "/light/1";

/// Resource type of collections
pub const RESOURCE_TYPE_COLLECTION: &str = "oic.wk.col";

/// Href of the sample collection accepting creates
pub const RESOURCE_HREF_SWITCHES: &str = "/switches";

const RESOURCE_TYPE_SWITCH: &str = "oic.r.switch.binary";

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

fn texts(items: &[String]) -> Value {
    Value::Array(items.iter().map(|s| text(s)).collect())
}

fn map(entries: Vec<(&str, Value)>) -> Value {
    Value::Map(entries.into_iter().map(|(k, v)| (text(k), v)).collect())
}

fn encode(value: &Value) -> Vec<u8> {
    serde_cbor::to_vec(value).unwrap_or_default()
}

fn merge(target: &mut Value, update: Value) {
    match (target, update) {
        (Value::Map(target), Value::Map(update)) => target.extend(update),
        (target, update) => *target = update,
    }
}

struct SimulatedResource {
    types: Vec<String>,
    interfaces: Vec<String>,
    body: Value,
    /// Reachable over secure endpoints only once the device is owned
    secured: bool,
    /// Reachable over secure endpoints only, owned or not
    secure_only: bool,
    collection: bool,
    deletable: bool,
}

impl SimulatedResource {
    fn new(types: &[&str], interfaces: &[&str], body: Value, secured: bool) -> Self {
        Self {
            types: types.iter().map(|s| s.to_string()).collect(),
            interfaces: interfaces.iter().map(|s| s.to_string()).collect(),
            body,
            secured,
            secure_only: false,
            collection: false,
            deletable: false,
        }
    }
}

struct Ownership {
    owner_id: String,
    preshared_key: Option<[u8; PSK_KEY_LENGTH]>,
    trust_anchors: Vec<CertificateDer<'static>>,
    /// Common name of the certificate provisioned during the transfer
    certificate: Option<String>,
}

/// Simulated device state
pub(super) struct SimulatedDevice {
    pub(super) id: DeviceId,
    pub(super) name: String,
    pub(super) ipv6: bool,
    pub(super) reachable: bool,
    pub(super) silent_queries: Vec<DiscoveryQuery>,
    index: u8,
    security: bool,
    ownership: Option<Ownership>,
    resources: BTreeMap<String, SimulatedResource>,
    next_instance: u32,
}

impl SimulatedDevice {
    pub(super) fn new(id: DeviceId, index: u8, name: &str, security: bool) -> Self {
        let types = vec![RESOURCE_TYPE_DEVICE.to_string(), "oic.d.light".to_string()];
        let mut resources = BTreeMap::new();
        resources.insert(
            RESOURCE_HREF_DEVICE.to_string(),
            SimulatedResource {
                types: types.clone(),
                ..SimulatedResource::new(
                    &[],
                    &[INTERFACE_BASELINE, "oic.if.r"],
                    map(vec![
                        ("di", text(&id.to_string())),
                        ("rt", texts(&types)),
                        ("n", text(name)),
                    ]),
                    false,
                )
            },
        );
        if security {
            resources.insert(
                RESOURCE_HREF_DOXM.to_string(),
                SimulatedResource::new(&[RESOURCE_TYPE_DOXM], &[INTERFACE_BASELINE], Value::Null, true),
            );
            resources.insert(
                RESOURCE_HREF_PSTAT.to_string(),
                SimulatedResource::new(&[RESOURCE_TYPE_PSTAT], &[INTERFACE_BASELINE], Value::Null, true),
            );
        }
        resources.insert(
            RESOURCE_HREF_LIGHT.to_string(),
            SimulatedResource::new(
                &[RESOURCE_TYPE_LIGHT],
                &[INTERFACE_BASELINE, "oic.if.a"],
                map(vec![("state", Value::Bool(false)), ("power", Value::Integer(0))]),
                true,
            ),
        );
        resources.insert(
            RESOURCE_HREF_SWITCHES.to_string(),
            SimulatedResource {
                collection: true,
                ..SimulatedResource::new(
                    &[RESOURCE_TYPE_COLLECTION],
                    &[INTERFACE_LINKS_LIST, INTERFACE_CREATE, INTERFACE_BATCH, INTERFACE_BASELINE],
                    Value::Null,
                    true,
                )
            },
        );
        Self {
            id,
            name: name.to_string(),
            ipv6: true,
            reachable: true,
            silent_queries: Vec::new(),
            index,
            security,
            ownership: None,
            resources,
            next_instance: 0,
        }
    }

    // =========================================================================
    // ADDRESSING
    // =========================================================================

    pub(super) fn host(&self, family: IpFamily) -> IpAddr {
        match family {
            IpFamily::V4 => IpAddr::V4(Ipv4Addr::new(10, 0, 0, self.index)),
            IpFamily::V6 => IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, u16::from(self.index))),
        }
    }

    pub(super) fn has_host(&self, ip: IpAddr) -> bool {
        ip == self.host(IpFamily::V4) || (self.ipv6 && ip == self.host(IpFamily::V6))
    }

    pub(super) fn endpoint(&self, scheme: Scheme, family: IpFamily) -> Endpoint {
        let port = if scheme.is_secure() { COAPS_PORT } else { COAP_PORT };
        Endpoint::from_socket_addr(scheme, SocketAddr::new(self.host(family), port))
    }

    fn endpoints(&self, family: IpFamily, secure_only: bool) -> Vec<Endpoint> {
        [Scheme::Coap, Scheme::CoapTcp, Scheme::Coaps, Scheme::CoapsTcp]
            .into_iter()
            .filter(|scheme| !secure_only || scheme.is_secure())
            .map(|scheme| self.endpoint(scheme, family))
            .collect()
    }

    // =========================================================================
    // STATE
    // =========================================================================

    pub(super) fn is_owned(&self) -> bool {
        self.ownership.is_some()
    }

    pub(super) fn owner(&self) -> Option<&str> {
        self.ownership.as_ref().map(|o| o.owner_id.as_str())
    }

    pub(super) fn certificate(&self) -> Option<&str> {
        self.ownership.as_ref().and_then(|o| o.certificate.as_deref())
    }

    pub(super) fn set_secure_only(&mut self, href: &str, secure_only: bool) -> bool {
        match self.resources.get_mut(href) {
            Some(resource) => {
                resource.secure_only = secure_only;
                true
            }
            None => false,
        }
    }

    fn requires_secure(&self, resource: &SimulatedResource) -> bool {
        resource.secure_only || (resource.secured && self.is_owned())
    }

    pub(super) fn identity_body(&self) -> Vec<u8> {
        self.resources
            .get(RESOURCE_HREF_DEVICE)
            .map(|r| encode(&r.body))
            .unwrap_or_default()
    }

    fn dynamic_body(&self, href: &str, resource: &SimulatedResource) -> Value {
        let owned = self.is_owned();
        match href {
            RESOURCE_HREF_DOXM => map(vec![
                ("owned", Value::Bool(owned)),
                ("devowneruuid", text(self.owner().unwrap_or("00000000-0000-0000-0000-000000000000"))),
                ("oxmsel", Value::Integer(0)),
            ]),
            RESOURCE_HREF_PSTAT => map(vec![
                ("dos", map(vec![("s", Value::Integer(if owned { 3 } else { 1 }))])),
                ("isop", Value::Bool(owned)),
            ]),
            _ if resource.collection => {
                let prefix = format!("{href}/");
                Value::Array(
                    self.resources
                        .iter()
                        .filter(|(child, _)| child.starts_with(&prefix))
                        .map(|(child, r)| map(vec![("href", text(child)), ("rt", texts(&r.types))]))
                        .collect(),
                )
            }
            _ => resource.body.clone(),
        }
    }

    // =========================================================================
    // LINKS
    // =========================================================================

    pub(super) fn links(&self, family: IpFamily) -> ResourceLinks {
        let anchor = format!("ocf://{}", self.id);
        let link = |href: &str, types: Vec<String>, interfaces: Vec<String>, secure_only: bool| {
            ResourceLink {
                href: href.to_string(),
                resource_types: types,
                interfaces,
                anchor: anchor.clone(),
                device_id: self.id.to_string(),
                endpoints: self.endpoints(family, secure_only),
                policy: Some(Policy { bitmask: 3 }),
            }
        };

        let mut links = vec![link(
            RESOURCE_HREF_RESOURCES,
            vec![RESOURCE_TYPE_RESOURCES.to_string()],
            vec![
                INTERFACE_LINKS_LIST.to_string(),
                INTERFACE_BATCH.to_string(),
                INTERFACE_BASELINE.to_string(),
            ],
            false,
        )];
        links.extend(self.resources.iter().map(|(href, r)| {
            link(href, r.types.clone(), r.interfaces.clone(), self.requires_secure(r))
        }));
        ResourceLinks(links)
    }

    /// Links answered to a discovery query
    pub(super) fn discovery_links(&self, family: IpFamily, types: &[&str]) -> ResourceLinks {
        ResourceLinks(
            self.links(family)
                .into_inner()
                .into_iter()
                .filter(|link| types.iter().any(|t| link.has_type(t)))
                .collect(),
        )
    }

    // =========================================================================
    // REQUESTS
    // =========================================================================

    pub(super) fn handle(&mut self, secure: bool, family: IpFamily, request: Request) -> Response {
        if request.href == RESOURCE_HREF_RESOURCES {
            return self.handle_discovery(secure, family, &request);
        }

        let Some(resource) = self.resources.get(&request.href) else {
            return Response::new(ResponseCode::NOT_FOUND, Vec::new());
        };
        if !secure && self.requires_secure(resource) {
            return Response::new(ResponseCode::UNAUTHORIZED, Vec::new());
        }

        match request.method {
            Method::Get => {
                let body = self.dynamic_body(&request.href, resource);
                Response::new(ResponseCode::CONTENT, encode(&body))
            }
            Method::Post | Method::Put => self.handle_write(secure, request),
            Method::Delete => {
                if !resource.deletable {
                    return Response::new(ResponseCode::METHOD_NOT_ALLOWED, Vec::new());
                }
                self.resources.remove(&request.href);
                Response::new(ResponseCode::DELETED, Vec::new())
            }
        }
    }

    fn handle_discovery(&self, secure: bool, family: IpFamily, request: &Request) -> Response {
        if request.method != Method::Get {
            return Response::new(ResponseCode::METHOD_NOT_ALLOWED, Vec::new());
        }
        if request.interface() != Some(INTERFACE_BATCH) {
            return match serde_cbor::to_vec(&self.links(family)) {
                Ok(payload) => Response::new(ResponseCode::CONTENT, payload),
                Err(_) => Response::new(ResponseCode::INTERNAL_SERVER_ERROR, Vec::new()),
            };
        }
        if !secure && self.is_owned() {
            return Response::new(ResponseCode::UNAUTHORIZED, Vec::new());
        }
        let batch = self
            .resources
            .iter()
            .map(|(href, r)| map(vec![("href", text(href)), ("rep", self.dynamic_body(href, r))]))
            .collect();
        Response::new(ResponseCode::CONTENT, encode(&Value::Array(batch)))
    }

    fn handle_write(&mut self, secure: bool, request: Request) -> Response {
        let Ok(payload) = serde_cbor::from_slice::<Value>(&request.payload) else {
            return Response::new(ResponseCode::BAD_REQUEST, Vec::new());
        };

        if request.href == RESOURCE_HREF_PSTAT {
            return self.handle_pstat(secure, &payload);
        }
        if request.href == RESOURCE_HREF_DOXM {
            return Response::new(ResponseCode::FORBIDDEN, Vec::new());
        }

        let collection = self.resources.get(&request.href).is_some_and(|r| r.collection);
        if request.interface() == Some(INTERFACE_CREATE) {
            if !collection {
                return Response::new(ResponseCode::METHOD_NOT_ALLOWED, Vec::new());
            }
            return self.create_child(&request.href, payload);
        }

        let Some(resource) = self.resources.get_mut(&request.href) else {
            return Response::new(ResponseCode::NOT_FOUND, Vec::new());
        };
        merge(&mut resource.body, payload);
        let body = encode(&resource.body);
        Response::new(ResponseCode::CHANGED, body)
    }

    fn create_child(&mut self, href: &str, payload: Value) -> Response {
        self.next_instance += 1;
        let child = format!("{href}/{}", self.next_instance);
        let types = match &payload {
            Value::Map(entries) => match entries.get(&text("rt")) {
                Some(Value::Array(rt)) => rt
                    .iter()
                    .filter_map(|v| match v {
                        Value::Text(s) => Some(s.clone()),
                        _ => None,
                    })
                    .collect(),
                _ => vec![RESOURCE_TYPE_SWITCH.to_string()],
            },
            _ => vec![RESOURCE_TYPE_SWITCH.to_string()],
        };
        let response_body = map(vec![("href", text(&child)), ("rep", payload.clone())]);
        self.resources.insert(
            child,
            SimulatedResource {
                types,
                interfaces: vec![INTERFACE_BASELINE.to_string(), "oic.if.a".to_string()],
                body: payload,
                secured: true,
                secure_only: false,
                collection: false,
                deletable: true,
            },
        );
        Response::new(ResponseCode::CREATED, encode(&response_body))
    }

    /// Writing `dos.s = 1` over a secure session resets the device
    fn handle_pstat(&mut self, secure: bool, payload: &Value) -> Response {
        let reset = match payload {
            Value::Map(entries) => matches!(
                entries.get(&text("dos")),
                Some(Value::Map(dos)) if dos.get(&text("s")) == Some(&Value::Integer(1))
            ),
            _ => false,
        };
        if !reset {
            return Response::new(ResponseCode::BAD_REQUEST, Vec::new());
        }
        if !secure {
            return Response::new(ResponseCode::UNAUTHORIZED, Vec::new());
        }
        self.ownership = None;
        self.resources.retain(|_, r| !r.deletable);
        Response::new(ResponseCode::CHANGED, Vec::new())
    }

    // =========================================================================
    // OWNERSHIP
    // =========================================================================

    /// Check an ownership transfer may start; `false` when the requester
    /// already owns the device
    pub(super) fn check_own(&self, request: &OwnRequest) -> TransportResult<bool> {
        if !self.security {
            return Err(TransportError::Response {
                code: ResponseCode::NOT_IMPLEMENTED,
            });
        }
        if !request.methods.contains(&OwnershipTransferMethod::JustWorks) {
            return Err(TransportError::Response {
                code: ResponseCode::NOT_ACCEPTABLE,
            });
        }
        if let Some(owner) = self.owner() {
            if owner == request.owner_id {
                return Ok(false);
            }
            return Err(TransportError::Response {
                code: ResponseCode::FORBIDDEN,
            });
        }
        if request.options.preshared_key.is_none() && request.signer.is_none() {
            return Err(TransportError::Handshake {
                endpoint: self.endpoint(Scheme::Coap, IpFamily::V4).uri,
                reason: "no credential to provision".into(),
            });
        }
        Ok(true)
    }

    /// Provision the owner's credentials and the signed device certificate
    pub(super) fn commit_own(
        &mut self,
        request: &OwnRequest,
        certificate: Option<String>,
    ) -> TransportResult<()> {
        if !self.check_own(request)? {
            return Ok(());
        }
        self.ownership = Some(Ownership {
            owner_id: request.owner_id.clone(),
            preshared_key: request.options.preshared_key,
            trust_anchors: request.options.trust_anchors.clone(),
            certificate,
        });
        Ok(())
    }

    /// Check secure session credentials against the provisioned ones
    pub(super) fn accepts(&self, config: &SecureDialConfig) -> Result<(), String> {
        let ownership = self
            .ownership
            .as_ref()
            .ok_or_else(|| "device has no provisioned credentials".to_string())?;
        match config {
            SecureDialConfig::PreSharedKey { identity, key } => {
                if identity.to_string() != ownership.owner_id {
                    return Err(format!("unknown identity {identity}"));
                }
                if ownership.preshared_key.as_ref() != Some(key) {
                    return Err("pre-shared key mismatch".into());
                }
                Ok(())
            }
            SecureDialConfig::Certificate { credential, .. } => {
                let expected = format!("{IDENTITY_CERTIFICATE_CN_PREFIX}{}", ownership.owner_id);
                if credential.common_name != expected {
                    return Err(format!("unexpected identity {}", credential.common_name));
                }
                match credential.chain.last() {
                    Some(root) if ownership.trust_anchors.contains(root) => Ok(()),
                    _ => Err("certificate does not chain to a provisioned anchor".into()),
                }
            }
        }
    }
}

/// Have `signer` sign a fresh device certificate request and check the
/// returned chain; yields the certificate's common name
pub(super) async fn signed_certificate(
    id: DeviceId,
    signer: &dyn CertificateSigner,
    trust_anchors: &[CertificateDer<'static>],
) -> TransportResult<String> {
    let io = |e: rcgen::Error| TransportError::Io(e.to_string());
    let rejected = || TransportError::Response {
        code: ResponseCode::BAD_REQUEST,
    };
    let common_name = format!("{IDENTITY_CERTIFICATE_CN_PREFIX}{id}");

    let (csr, public_key) = {
        let key = KeyPair::generate().map_err(io)?;
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(io)?;
        params
            .distinguished_name
            .push(DnType::CommonName, common_name.clone());
        let csr = params.serialize_request(&key).map_err(io)?.pem().map_err(io)?;
        (csr, key.public_key_raw().to_vec())
    };

    let pem = signer.sign(csr.into_bytes()).await?;
    let parsed = parse_certificate_chain(&pem).map_err(|_| rejected())?;
    if parsed.common_name != common_name || parsed.public_key != public_key {
        return Err(rejected());
    }
    match parsed.chain.last() {
        Some(root) if trust_anchors.contains(root) => Ok(parsed.common_name),
        _ => Err(rejected()),
    }
}
