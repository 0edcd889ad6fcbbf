//! # Bearer Token Verification
//!
//! Callers of owner-scoped operations present a compact JWS token signed with
//! Ed25519. The token is verified against a JSON web key set: the header
//! `kid` selects the key, the key's `alg` must match the header, and `exp`
//! must not have passed. The owner is read from a configurable claim.

use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use shared::{
    constants::TOKEN_SIGNATURE_ALGORITHM,
    error::{GatewayError, GatewayResult},
    types::owner_to_uuid,
};

const KEY_TYPE_OKP: &str = "OKP";
const CURVE_ED25519: &str = "Ed25519";

// =============================================================================
// JSON WEB KEYS
// =============================================================================

/// One public key of a JSON web key set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonWebKey {
    /// Key type, `OKP` for Ed25519
    pub kty: String,

    /// Curve
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,

    /// Public key, base64url without padding
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,

    /// Key id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,

    /// Algorithm the key is meant for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,

    /// Intended use, e.g. `sig`
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
}

impl JsonWebKey {
    /// JWK for an Ed25519 public key
    pub fn ed25519(kid: impl Into<String>, key: &VerifyingKey) -> Self {
        Self {
            kty: KEY_TYPE_OKP.into(),
            crv: Some(CURVE_ED25519.into()),
            x: Some(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(key.as_bytes())),
            kid: Some(kid.into()),
            alg: Some(TOKEN_SIGNATURE_ALGORITHM.into()),
            key_use: Some("sig".into()),
        }
    }

    /// Decode the Ed25519 verifying key
    pub fn verifying_key(&self) -> GatewayResult<VerifyingKey> {
        if self.kty != KEY_TYPE_OKP || self.crv.as_deref() != Some(CURVE_ED25519) {
            return Err(GatewayError::InvalidToken(format!(
                "unsupported key type {} {}",
                self.kty,
                self.crv.as_deref().unwrap_or("")
            )));
        }
        let x = self
            .x
            .as_deref()
            .ok_or_else(|| GatewayError::InvalidToken("key has no public component".into()))?;
        let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(x)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| GatewayError::InvalidToken("Ed25519 key must be 32 bytes".into()))?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| GatewayError::InvalidToken(e.to_string()))
    }
}

/// JSON web key set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonWebKeySet {
    pub keys: Vec<JsonWebKey>,
}

impl JsonWebKeySet {
    /// Parse a key set document; at least one key is required
    pub fn parse(json: &[u8]) -> GatewayResult<Self> {
        let set: Self =
            serde_json::from_slice(json).map_err(|e| GatewayError::InvalidKeySet(e.to_string()))?;
        if set.keys.is_empty() {
            return Err(GatewayError::InvalidKeySet("no keys".into()));
        }
        Ok(set)
    }

    /// Find a key by id
    pub fn find(&self, kid: &str) -> Option<&JsonWebKey> {
        self.keys.iter().find(|key| key.kid.as_deref() == Some(kid))
    }
}

// =============================================================================
// TOKENS
// =============================================================================

#[derive(Debug, Deserialize)]
struct TokenHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

/// Verified bearer token
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    /// Raw owner claim
    pub owner: String,

    /// Owner normalized to a UUID
    pub owner_id: Uuid,

    /// Expiration, when the token carries one
    pub expires_at: Option<DateTime<Utc>>,
}

fn decode_segment(segment: &str) -> GatewayResult<Vec<u8>> {
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(segment)?)
}

/// Verify `token` against `keys` and extract the owner from `owner_claim`
pub fn verify_token(
    token: &str,
    keys: &JsonWebKeySet,
    owner_claim: &str,
) -> GatewayResult<VerifiedToken> {
    if token.is_empty() {
        return Err(GatewayError::Unauthenticated("missing token".into()));
    }
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(GatewayError::InvalidToken(
            "expected three dot-separated parts".into(),
        ));
    }

    let header: TokenHeader = serde_json::from_slice(&decode_segment(parts[0])?)
        .map_err(|e| GatewayError::InvalidToken(format!("invalid header: {e}")))?;
    if header.alg != TOKEN_SIGNATURE_ALGORITHM {
        return Err(GatewayError::InvalidToken(format!(
            "unsupported algorithm {}",
            header.alg
        )));
    }
    let kid = header
        .kid
        .ok_or_else(|| GatewayError::InvalidToken("missing key id in token".into()))?;
    let key = keys
        .find(&kid)
        .ok_or_else(|| GatewayError::InvalidToken(format!("no key with id '{kid}'")))?;
    if key.alg.as_deref().is_some_and(|alg| alg != header.alg) {
        return Err(GatewayError::InvalidToken(format!(
            "key '{kid}' is not meant for {}",
            header.alg
        )));
    }

    let signature = Signature::from_slice(&decode_segment(parts[2])?)
        .map_err(|e| GatewayError::InvalidToken(format!("invalid signature: {e}")))?;
    let signed_message = format!("{}.{}", parts[0], parts[1]);
    key.verifying_key()?
        .verify(signed_message.as_bytes(), &signature)
        .map_err(|e| GatewayError::InvalidToken(format!("signature verification failed: {e}")))?;

    let claims: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(&decode_segment(parts[1])?)
            .map_err(|e| GatewayError::InvalidToken(format!("invalid claims: {e}")))?;

    let expires_at = match claims.get("exp") {
        None => None,
        Some(exp) => {
            let exp = exp
                .as_i64()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .ok_or_else(|| GatewayError::InvalidToken("invalid exp claim".into()))?;
            if exp < Utc::now() {
                return Err(GatewayError::InvalidToken("token is expired".into()));
            }
            Some(exp)
        }
    };

    let owner = claims
        .get(owner_claim)
        .and_then(|value| value.as_str())
        .filter(|owner| !owner.is_empty())
        .ok_or_else(|| {
            GatewayError::Unauthenticated(format!("owner claim '{owner_claim}' is not set"))
        })?
        .to_string();

    debug!(kid = %kid, owner = %owner, "Bearer token verified");
    Ok(VerifiedToken {
        owner_id: owner_to_uuid(&owner),
        owner,
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TokenSigner;
    use serde_json::json;
    use shared::error::StatusCode;

    #[test]
    fn test_verify_token() {
        let signer = TokenSigner::new("key-1");
        let token = signer.sign(&json!({ "sub": "alice", "exp": Utc::now().timestamp() + 60 }));

        let verified = verify_token(&token, &signer.key_set(), "sub").unwrap();
        assert_eq!(verified.owner, "alice");
        assert_eq!(verified.owner_id, owner_to_uuid("alice"));
        assert!(verified.expires_at.is_some());
    }

    #[test]
    fn test_custom_owner_claim() {
        let signer = TokenSigner::new("key-1");
        let owner = Uuid::new_v4();
        let token = signer.sign(&json!({ "sub": "alice", "owner": owner.to_string() }));

        let verified = verify_token(&token, &signer.key_set(), "owner").unwrap();
        assert_eq!(verified.owner_id, owner);

        let err = verify_token(&token, &signer.key_set(), "tenant").unwrap_err();
        assert_eq!(err.status(), StatusCode::Unauthenticated);
    }

    #[test]
    fn test_rejects_foreign_key() {
        let signer = TokenSigner::new("key-1");
        let other = TokenSigner::new("key-1");
        let token = signer.sign(&json!({ "sub": "alice" }));

        let err = verify_token(&token, &other.key_set(), "sub").unwrap_err();
        assert!(matches!(err, GatewayError::InvalidToken(_)));
        assert_eq!(err.status(), StatusCode::Unauthenticated);
    }

    #[test]
    fn test_rejects_unknown_kid() {
        let signer = TokenSigner::new("key-1");
        let token = signer.sign(&json!({ "sub": "alice" }));
        let err = verify_token(&token, &TokenSigner::new("key-2").key_set(), "sub").unwrap_err();
        assert!(err.to_string().contains("key-1"));
    }

    #[test]
    fn test_rejects_expired_token() {
        let signer = TokenSigner::new("key-1");
        let token = signer.sign(&json!({ "sub": "alice", "exp": Utc::now().timestamp() - 60 }));
        let err = verify_token(&token, &signer.key_set(), "sub").unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_rejects_algorithm_mismatch() {
        let signer = TokenSigner::new("key-1");
        let mut keys = signer.key_set();
        keys.keys[0].alg = Some("ES256".into());
        let token = signer.sign(&json!({ "sub": "alice" }));
        assert!(verify_token(&token, &keys, "sub").is_err());
    }

    #[test]
    fn test_rejects_malformed_token() {
        let keys = TokenSigner::new("key-1").key_set();
        assert_eq!(
            verify_token("", &keys, "sub").unwrap_err().status(),
            StatusCode::Unauthenticated
        );
        assert!(verify_token("a.b", &keys, "sub").is_err());
        assert!(verify_token("!!.??.##", &keys, "sub").is_err());
    }

    #[test]
    fn test_key_set_parse() {
        let signer = TokenSigner::new("key-1");
        let json = serde_json::to_vec(&signer.key_set()).unwrap();
        let parsed = JsonWebKeySet::parse(&json).unwrap();
        assert!(parsed.find("key-1").is_some());
        assert!(parsed.find("key-2").is_none());

        assert!(JsonWebKeySet::parse(br#"{"keys":[]}"#).is_err());
        assert_eq!(
            JsonWebKeySet::parse(b"not json").unwrap_err().status(),
            StatusCode::InvalidArgument
        );
    }
}
