//! # Error Types for the Device Gateway
//!
//! This module defines the error taxonomy used by every gateway operation.
//! Each [`GatewayError`] variant maps onto one [`StatusCode`], which is what a
//! transport binding reports to callers.
//!
//! Failures raised by the protocol library are carried as [`TransportError`]
//! and translated by [`GatewayError::from_transport`], which prefers the status
//! code embedded in a device response over the caller-supplied default.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::types::ResponseCode;

// =============================================================================
// STATUS CODES
// =============================================================================

/// Uniform status reported at the operation boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    /// Unknown device id or resource href
    NotFound,
    /// Transport, TLS or dial failure
    Unavailable,
    /// Ownership precondition not met
    PermissionDenied,
    /// Missing or invalid credential or bearer token
    Unauthenticated,
    /// Malformed content type, state token or certificate
    InvalidArgument,
    /// Capability not supported by the active authentication strategy
    Unimplemented,
    /// Invariant violation
    Internal,
    /// Entity already present, e.g. double initialization
    AlreadyExists,
    /// Operation requires a different service state
    FailedPrecondition,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::NotFound => "NotFound",
            StatusCode::Unavailable => "Unavailable",
            StatusCode::PermissionDenied => "PermissionDenied",
            StatusCode::Unauthenticated => "Unauthenticated",
            StatusCode::InvalidArgument => "InvalidArgument",
            StatusCode::Unimplemented => "Unimplemented",
            StatusCode::Internal => "Internal",
            StatusCode::AlreadyExists => "AlreadyExists",
            StatusCode::FailedPrecondition => "FailedPrecondition",
        };
        f.write_str(name)
    }
}

// =============================================================================
// TRANSPORT ERRORS
// =============================================================================

/// Failure reported by the protocol client library
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The device answered with a non-success status code
    #[error("device responded with {code}")]
    Response { code: ResponseCode },

    /// No session could be established
    #[error("cannot dial {endpoint}: {reason}")]
    Dial { endpoint: String, reason: String },

    /// The secure handshake was rejected
    #[error("handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: String, reason: String },

    /// The session was closed by either side
    #[error("connection closed")]
    Closed,

    /// The exchange did not complete in time
    #[error("request timed out")]
    Timeout,

    /// Socket level failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Status code embedded in the error, if the device supplied one
    pub fn embedded_status(&self) -> Option<StatusCode> {
        match self {
            TransportError::Response { code } => code.status(),
            _ => None,
        }
    }
}

// =============================================================================
// GATEWAY ERRORS
// =============================================================================

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    // =========================================================================
    // DEVICE ERRORS
    // =========================================================================

    /// Device is not present in the device cache
    #[error("Device {0} not found")]
    DeviceNotFound(Uuid),

    /// Device id is not a valid UUID
    #[error("Invalid device id '{0}'")]
    InvalidDeviceId(String),

    /// Device is not owned and the operation needs ownership
    #[error("Device {0} is not owned")]
    DeviceNotOwned(Uuid),

    /// None of the link's endpoints can be dialed
    #[error("Device {device_id} has no usable endpoint for '{href}'")]
    NoUsableEndpoint { device_id: Uuid, href: String },

    /// Wrapped protocol failure with its resolved status code
    #[error("{context}: {source}")]
    Transport {
        context: String,
        code: StatusCode,
        #[source]
        source: TransportError,
    },

    // =========================================================================
    // RESOURCE ERRORS
    // =========================================================================

    /// Href is not among the device's resource links
    #[error("Cannot find resource link '{href}' for device {device_id}")]
    ResourceLinkNotFound { device_id: Uuid, href: String },

    /// Content type cannot be converted for the device
    #[error("Unsupported content type '{0}'")]
    UnsupportedContentType(String),

    /// Content could not be converted to CBOR
    #[error("Cannot convert content to CBOR: {0}")]
    ContentConversion(String),

    /// Response from a device could not be decoded
    #[error("Cannot decode device response: {0}")]
    Decode(String),

    // =========================================================================
    // AUTHENTICATION ERRORS
    // =========================================================================

    /// Every capability of the none strategy fails with this error
    #[error("Authentication method is set to none")]
    AuthenticationDisabled,

    /// Capability not offered by the active strategy
    #[error("{operation} is not supported by {mode} authentication")]
    NotSupported {
        mode: &'static str,
        operation: &'static str,
    },

    /// Missing credential
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Certificate chain could not be parsed or validated
    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    /// No identity certificate installed
    #[error("Identity certificate is not set")]
    CertificateNotSet,

    /// Current time is outside the certificate's validity window
    #[error("Identity certificate is valid from {not_before} to {not_after}")]
    CertificateNotValid { not_before: String, not_after: String },

    /// Re-certification attempted to change the subject
    #[error("Identity must not change: current '{current}', new '{new}'")]
    IdentityChanged { current: String, new: String },

    /// CSR has not been requested so no private key exists
    #[error("Private key has not been generated")]
    PrivateKeyMissing,

    /// Key pair or CSR generation failed
    #[error("Cannot create certificate signing request: {0}")]
    CertificateRequest(String),

    /// Client TLS configuration could not be built
    #[error("TLS configuration error: {0}")]
    TlsConfiguration(String),

    // =========================================================================
    // PROVISIONING ERRORS
    // =========================================================================

    /// State token absent, already consumed or expired
    #[error("invalid state")]
    InvalidState,

    /// Certificate identity differs from the caller's owner
    #[error("invalid owner id: expected '{expected}', got '{actual}'")]
    InvalidOwnerId { expected: String, actual: String },

    /// Key set write by a different owner
    #[error("Cannot update keys for other owner")]
    KeySetOwnerMismatch,

    /// Bearer token could not be verified
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    /// JSON web key set could not be parsed
    #[error("Invalid JSON web key set: {0}")]
    InvalidKeySet(String),

    /// No key set cached yet
    #[error("JSON web key set is not available")]
    KeySetUnavailable,

    /// Remote provisioning mode is not enabled
    #[error("Remote provisioning is not enabled")]
    RemoteProvisioningDisabled,

    /// Device service already holds credentials
    #[error("Already initialized")]
    AlreadyInitialized,

    /// Device service holds no credentials
    #[error("Not initialized")]
    NotInitialized,

    // =========================================================================
    // CONFIGURATION ERRORS
    // =========================================================================

    /// Invalid configuration or initialization input
    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // GENERIC ERRORS
    // =========================================================================

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using GatewayError
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    /// Wrap a transport failure, preferring the code embedded in the error
    pub fn from_transport(
        default: StatusCode,
        context: impl Into<String>,
        source: TransportError,
    ) -> Self {
        let code = source.embedded_status().unwrap_or(default);
        GatewayError::Transport {
            context: context.into(),
            code,
            source,
        }
    }

    /// Status code reported to callers
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::DeviceNotFound(_) | GatewayError::ResourceLinkNotFound { .. } => {
                StatusCode::NotFound
            }

            GatewayError::NoUsableEndpoint { .. } | GatewayError::KeySetUnavailable => {
                StatusCode::Unavailable
            }

            GatewayError::Transport { code, .. } => *code,

            GatewayError::DeviceNotOwned(_) | GatewayError::KeySetOwnerMismatch => {
                StatusCode::PermissionDenied
            }

            GatewayError::Unauthenticated(_)
            | GatewayError::CertificateNotSet
            | GatewayError::CertificateNotValid { .. }
            | GatewayError::InvalidToken(_) => StatusCode::Unauthenticated,

            GatewayError::InvalidDeviceId(_)
            | GatewayError::UnsupportedContentType(_)
            | GatewayError::ContentConversion(_)
            | GatewayError::InvalidCertificate(_)
            | GatewayError::IdentityChanged { .. }
            | GatewayError::InvalidState
            | GatewayError::InvalidOwnerId { .. }
            | GatewayError::InvalidKeySet(_)
            | GatewayError::Configuration(_) => StatusCode::InvalidArgument,

            GatewayError::AuthenticationDisabled
            | GatewayError::NotSupported { .. }
            | GatewayError::RemoteProvisioningDisabled => StatusCode::Unimplemented,

            GatewayError::AlreadyInitialized => StatusCode::AlreadyExists,

            GatewayError::PrivateKeyMissing | GatewayError::NotInitialized => {
                StatusCode::FailedPrecondition
            }

            GatewayError::Decode(_)
            | GatewayError::CertificateRequest(_)
            | GatewayError::TlsConfiguration(_)
            | GatewayError::Internal(_)
            | GatewayError::Serialization(_) => StatusCode::Internal,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            GatewayError::DeviceNotFound(_)
            | GatewayError::InvalidDeviceId(_)
            | GatewayError::DeviceNotOwned(_)
            | GatewayError::NoUsableEndpoint { .. } => "device",

            GatewayError::Transport { .. } => "transport",

            GatewayError::ResourceLinkNotFound { .. }
            | GatewayError::UnsupportedContentType(_)
            | GatewayError::ContentConversion(_)
            | GatewayError::Decode(_) => "resource",

            GatewayError::AuthenticationDisabled
            | GatewayError::NotSupported { .. }
            | GatewayError::Unauthenticated(_)
            | GatewayError::InvalidCertificate(_)
            | GatewayError::CertificateNotSet
            | GatewayError::CertificateNotValid { .. }
            | GatewayError::IdentityChanged { .. }
            | GatewayError::PrivateKeyMissing
            | GatewayError::CertificateRequest(_)
            | GatewayError::TlsConfiguration(_) => "auth",

            GatewayError::InvalidState
            | GatewayError::InvalidOwnerId { .. }
            | GatewayError::KeySetOwnerMismatch
            | GatewayError::InvalidToken(_)
            | GatewayError::InvalidKeySet(_)
            | GatewayError::KeySetUnavailable
            | GatewayError::RemoteProvisioningDisabled
            | GatewayError::AlreadyInitialized
            | GatewayError::NotInitialized => "provisioning",

            GatewayError::Configuration(_) => "config",

            GatewayError::Internal(_) | GatewayError::Serialization(_) => "internal",
        }
    }

    /// Check if the error is worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Transport { source, .. } => matches!(
                source,
                TransportError::Timeout | TransportError::Closed | TransportError::Io(_)
            ),
            GatewayError::NoUsableEndpoint { .. } => true,
            _ => false,
        }
    }
}

// =============================================================================
// ERROR CONVERSIONS
// =============================================================================

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<serde_cbor::Error> for GatewayError {
    fn from(err: serde_cbor::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl From<base64::DecodeError> for GatewayError {
    fn from(err: base64::DecodeError) -> Self {
        GatewayError::InvalidToken(err.to_string())
    }
}

impl From<rcgen::Error> for GatewayError {
    fn from(err: rcgen::Error) -> Self {
        GatewayError::CertificateRequest(err.to_string())
    }
}

impl From<x509_parser::nom::Err<x509_parser::error::X509Error>> for GatewayError {
    fn from(err: x509_parser::nom::Err<x509_parser::error::X509Error>) -> Self {
        GatewayError::InvalidCertificate(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_transport_prefers_embedded_code() {
        let err = GatewayError::from_transport(
            StatusCode::Unavailable,
            "cannot get resource",
            TransportError::Response {
                code: ResponseCode::NOT_FOUND,
            },
        );
        assert_eq!(err.status(), StatusCode::NotFound);

        let err = GatewayError::from_transport(
            StatusCode::Unavailable,
            "cannot get resource",
            TransportError::Response {
                code: ResponseCode::FORBIDDEN,
            },
        );
        assert_eq!(err.status(), StatusCode::PermissionDenied);
    }

    #[test]
    fn test_from_transport_falls_back_to_default() {
        let err = GatewayError::from_transport(
            StatusCode::Unavailable,
            "cannot own device",
            TransportError::Timeout,
        );
        assert_eq!(err.status(), StatusCode::Unavailable);
        assert!(err.is_retryable());

        // a success code carries no failure status
        let err = GatewayError::from_transport(
            StatusCode::Internal,
            "unexpected",
            TransportError::Response {
                code: ResponseCode::CONTENT,
            },
        );
        assert_eq!(err.status(), StatusCode::Internal);
    }

    #[test]
    fn test_error_status() {
        assert_eq!(GatewayError::InvalidState.status(), StatusCode::InvalidArgument);
        assert_eq!(GatewayError::InvalidState.to_string(), "invalid state");
        assert_eq!(
            GatewayError::DeviceNotOwned(Uuid::nil()).status(),
            StatusCode::PermissionDenied
        );
        assert_eq!(
            GatewayError::AuthenticationDisabled.status(),
            StatusCode::Unimplemented
        );
        assert_eq!(
            GatewayError::AlreadyInitialized.status(),
            StatusCode::AlreadyExists
        );
    }

    #[test]
    fn test_error_category() {
        let err = GatewayError::DeviceNotFound(Uuid::nil());
        assert_eq!(err.category(), "device");

        let err = GatewayError::KeySetOwnerMismatch;
        assert_eq!(err.category(), "provisioning");

        let err = GatewayError::UnsupportedContentType("text/plain".into());
        assert_eq!(err.category(), "resource");
        assert!(!err.is_retryable());
    }
}
