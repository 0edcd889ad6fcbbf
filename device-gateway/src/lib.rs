//! # Device Gateway
//!
//! Local gateway between a client application and constrained IoT devices
//! on the local network:
//! - Multicast and unicast discovery into a shared device cache
//! - Resource reads, updates, creation and deletion with JSON to CBOR conversion
//! - Ownership transfer and reset
//! - Pre-shared key and X.509 identity credentials, the latter provisioned
//!   remotely by a user agent holding a bearer token
//!
//! ## Transport
//!
//! The wire protocol sits behind [`transport::ProtocolClient`]. The
//! [`devsim`] module provides an in-memory fleet implementing it.

pub mod auth;
pub mod cache;
pub mod device;
pub mod devsim;
pub mod discovery;
pub mod ownership;
pub mod provisioning;
pub mod resource;
pub mod service;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use auth::{AuthenticationStrategy, NoneAuthentication, PreSharedKeyAuthentication, X509Authentication};
pub use cache::DeviceCache;
pub use devsim::SimulatedFleet;
pub use discovery::DiscoveryEngine;
pub use service::{DeviceGateway, GatewayConfiguration, IdentityChallenge};
pub use transport::ProtocolClient;
