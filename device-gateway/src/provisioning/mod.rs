//! # Remote Provisioning State
//!
//! Two pieces of state back remote identity provisioning:
//! - [`ChallengeCache`]: read-once CSR challenge entries keyed by a random
//!   state token, each with its own expiration
//! - [`KeySetCache`]: a single slot holding the owner's JSON web key set,
//!   replaced only by the same owner

mod token;

pub use token::{verify_token, JsonWebKey, JsonWebKeySet, VerifiedToken};

use arc_swap::ArcSwapOption;
use moka::future::Cache;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use shared::{
    constants::CSR_CHALLENGE_MAX_ENTRIES,
    error::{GatewayError, GatewayResult},
};

use crate::auth::same_slot;

// =============================================================================
// CSR CHALLENGES
// =============================================================================

#[derive(Clone)]
struct ChallengeEntry<T> {
    payload: T,
    expires_at: Instant,
}

/// Time-bounded, read-once map from state token to a pending payload
pub struct ChallengeCache<T: Clone + Send + Sync + 'static> {
    entries: Cache<Uuid, ChallengeEntry<T>>,
    expiration: Duration,
}

impl<T: Clone + Send + Sync + 'static> ChallengeCache<T> {
    pub fn new(expiration: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(CSR_CHALLENGE_MAX_ENTRIES)
            .time_to_live(expiration)
            .build();
        Self {
            entries,
            expiration,
        }
    }

    /// Store `payload` under a fresh state token
    pub async fn issue(&self, payload: T) -> Uuid {
        let state = Uuid::new_v4();
        let entry = ChallengeEntry {
            payload,
            expires_at: Instant::now() + self.expiration,
        };
        self.entries.insert(state, entry).await;
        debug!(state = %state, expiration = ?self.expiration, "Issued CSR challenge");
        state
    }

    /// Take the payload of `state`; absent, consumed and expired tokens fail
    pub async fn consume(&self, state: &str) -> GatewayResult<T> {
        let state = Uuid::parse_str(state).map_err(|_| GatewayError::InvalidState)?;
        let entry = self
            .entries
            .remove(&state)
            .await
            .ok_or(GatewayError::InvalidState)?;
        if entry.expires_at <= Instant::now() {
            debug!(state = %state, "CSR challenge expired");
            return Err(GatewayError::InvalidState);
        }
        Ok(entry.payload)
    }

    /// Drop every outstanding challenge
    pub async fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
    }

    pub async fn len(&self) -> u64 {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count()
    }
}

// =============================================================================
// KEY SET
// =============================================================================

/// Key set together with the owner it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedKeySet {
    pub owner: Uuid,
    pub keys: JsonWebKeySet,
}

/// Single-slot key set cache with an owner-preserving update rule
#[derive(Default)]
pub struct KeySetCache {
    slot: ArcSwapOption<CachedKeySet>,
}

impl KeySetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<CachedKeySet>> {
        self.slot.load_full()
    }

    /// Install `keys` for `owner`; an existing set must belong to the same owner
    pub fn update(&self, owner: Uuid, keys: JsonWebKeySet) -> GatewayResult<()> {
        let new = Arc::new(CachedKeySet { owner, keys });
        loop {
            let current = self.slot.load_full();
            if let Some(existing) = &current {
                if existing.owner != owner {
                    return Err(GatewayError::KeySetOwnerMismatch);
                }
            }
            let previous = self.slot.compare_and_swap(&current, Some(Arc::clone(&new)));
            if same_slot(&previous, &current) {
                info!(owner = %owner, keys = new.keys.keys.len(), "Updated JSON web key set");
                return Ok(());
            }
        }
    }

    /// Verify a bearer token against the cached set; its owner must match
    pub fn verify(&self, token: &str, owner_claim: &str) -> GatewayResult<VerifiedToken> {
        let cached = self.get().ok_or_else(|| {
            GatewayError::Unauthenticated("cannot validate token: missing key set".into())
        })?;
        let verified = verify_token(token, &cached.keys, owner_claim)?;
        if verified.owner_id != cached.owner {
            return Err(GatewayError::Unauthenticated(format!(
                "unexpected owner '{}'",
                verified.owner
            )));
        }
        Ok(verified)
    }

    pub fn clear(&self) {
        self.slot.store(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TokenSigner;
    use serde_json::json;
    use shared::error::StatusCode;
    use shared::types::owner_to_uuid;

    #[tokio::test]
    async fn test_challenge_is_read_once() {
        let cache = ChallengeCache::new(Duration::from_secs(60));
        let state = cache.issue("pending").await;

        assert_eq!(cache.consume(&state.to_string()).await.unwrap(), "pending");
        let err = cache.consume(&state.to_string()).await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidState));
        assert_eq!(err.to_string(), "invalid state");
    }

    #[tokio::test]
    async fn test_challenge_expires() {
        let cache = ChallengeCache::new(Duration::from_millis(50));
        let state = cache.issue(7u32).await;
        tokio::time::sleep(Duration::from_millis(120)).await;

        let err = cache.consume(&state.to_string()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_challenge_rejects_unknown_state() {
        let cache: ChallengeCache<u32> = ChallengeCache::new(Duration::from_secs(60));
        assert!(cache.consume("not-a-uuid").await.is_err());
        assert!(cache.consume(&Uuid::new_v4().to_string()).await.is_err());
    }

    #[tokio::test]
    async fn test_challenge_clear() {
        let cache = ChallengeCache::new(Duration::from_secs(60));
        let state = cache.issue(1u8).await;
        cache.issue(2u8).await;
        assert_eq!(cache.len().await, 2);

        cache.clear().await;
        assert_eq!(cache.len().await, 0);
        assert!(cache.consume(&state.to_string()).await.is_err());
    }

    #[test]
    fn test_key_set_owner_rule() {
        let cache = KeySetCache::new();
        let alice = owner_to_uuid("alice");
        let bob = owner_to_uuid("bob");
        let keys = TokenSigner::new("k").key_set();

        cache.update(alice, keys.clone()).unwrap();
        cache.update(alice, keys.clone()).unwrap();

        let err = cache.update(bob, keys).unwrap_err();
        assert_eq!(err.status(), StatusCode::PermissionDenied);
        assert_eq!(cache.get().unwrap().owner, alice);

        cache.clear();
        assert!(cache.get().is_none());
    }

    #[test]
    fn test_concurrent_key_set_updates_single_owner() {
        let cache = Arc::new(KeySetCache::new());
        let handles: Vec<_> = ["alice", "bob", "carol", "dave"]
            .into_iter()
            .map(|owner| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    cache
                        .update(owner_to_uuid(owner), TokenSigner::new(owner).key_set())
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_verify_against_cached_owner() {
        let cache = KeySetCache::new();
        let signer = TokenSigner::new("k");
        let token = signer.sign(&json!({ "sub": "alice" }));

        let err = cache.verify(&token, "sub").unwrap_err();
        assert_eq!(err.status(), StatusCode::Unauthenticated);

        cache.update(owner_to_uuid("alice"), signer.key_set()).unwrap();
        assert_eq!(cache.verify(&token, "sub").unwrap().owner, "alice");

        let token = signer.sign(&json!({ "sub": "mallory" }));
        let err = cache.verify(&token, "sub").unwrap_err();
        assert!(err.to_string().contains("unexpected owner"));
    }
}
