//! OAuth state management for CSRF protection.
//!
//! Issues single-use state values and verifies them on callback. Entries are
//! keyed by the SHA-256 of the value and the stored value is compared in
//! constant time.

use super::state_store::{CorrelationStore, CorrelationToken, MemoryCorrelationStore};
use crate::error::{Error, Result};
use crate::platform::Platform;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration, Utc};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Bytes of randomness in a state value (256 bits)
const STATE_BYTES: usize = 32;

/// Default lifetime of a pending state, matching the provider login window
pub const DEFAULT_STATE_LIFETIME_SECONDS: i64 = 600;

/// OAuth state manager with automatic expiration
#[derive(Clone)]
pub struct StateManager {
    store: Arc<dyn CorrelationStore>,
    lifetime: Duration,
}

impl StateManager {
    /// Create a state manager over the given store
    ///
    /// # Arguments
    /// * `store` - Where pending states live (shared between processes when scaled out)
    /// * `lifetime_seconds` - How long states remain valid (default: 600 = 10 minutes)
    pub fn new(store: Arc<dyn CorrelationStore>, lifetime_seconds: i64) -> Self {
        Self {
            store,
            lifetime: Duration::seconds(lifetime_seconds),
        }
    }

    /// Single-process manager with the default lifetime
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryCorrelationStore::new()),
            DEFAULT_STATE_LIFETIME_SECONDS,
        )
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }

    /// Generate a new state token for `user_id` connecting `platform` and store it
    pub fn issue(&self, user_id: &str, platform: Platform) -> Result<CorrelationToken> {
        self.issue_at(user_id, platform, Utc::now())
    }

    pub fn issue_at(
        &self,
        user_id: &str,
        platform: Platform,
        now: DateTime<Utc>,
    ) -> Result<CorrelationToken> {
        let mut bytes = [0u8; STATE_BYTES];
        OsRng.fill_bytes(&mut bytes);

        let token = CorrelationToken {
            value: URL_SAFE_NO_PAD.encode(bytes),
            platform,
            user_id: user_id.to_string(),
            created_at: now,
            expires_at: now + self.lifetime,
        };

        self.store.insert(&state_key(&token.value), &token)?;

        tracing::debug!(platform = %platform, user_id = %user_id, "Issued OAuth state");

        Ok(token)
    }

    /// Validate and consume a state value
    ///
    /// The entry is removed on the first attempt whatever the outcome, so a
    /// replayed callback fails with `CorrelationMismatch`.
    pub fn verify(&self, platform: Platform, presented: &str) -> Result<CorrelationToken> {
        self.verify_at(platform, presented, Utc::now())
    }

    pub fn verify_at(
        &self,
        platform: Platform,
        presented: &str,
        now: DateTime<Utc>,
    ) -> Result<CorrelationToken> {
        let token = self
            .store
            .take(&state_key(presented))?
            .ok_or(Error::CorrelationMismatch)?;

        let value_matches: bool = token.value.as_bytes().ct_eq(presented.as_bytes()).into();
        if !value_matches || token.platform != platform {
            tracing::warn!(
                expected = %token.platform,
                actual = %platform,
                "OAuth state presented for the wrong platform"
            );
            return Err(Error::CorrelationMismatch);
        }

        if now > token.expires_at {
            return Err(Error::CorrelationExpired);
        }

        Ok(token)
    }

    /// Clean up expired states (should be called periodically)
    pub fn cleanup_expired(&self) -> Result<usize> {
        self.store.purge_expired(Utc::now())
    }

    /// Get count of pending states (for debugging/monitoring)
    pub fn count(&self) -> Result<usize> {
        self.store.count()
    }
}

/// Hex SHA-256 of a state value
fn state_key(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let mut key = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(key, "{:02x}", byte);
    }
    key
}

/// Background task to periodically clean up expired states
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));

    loop {
        interval.tick().await;
        match manager.cleanup_expired() {
            Ok(removed) => tracing::debug!(removed, "OAuth state cleanup complete"),
            Err(e) => tracing::warn!(error = %e, "OAuth state cleanup failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify_state() {
        let manager = StateManager::in_memory();

        let token = manager.issue("user123", Platform::Facebook).unwrap();
        assert!(token.value.len() >= 43);
        assert_eq!(token.expires_at - token.created_at, Duration::minutes(10));

        let verified = manager.verify(Platform::Facebook, &token.value).unwrap();
        assert_eq!(verified.platform, Platform::Facebook);
        assert_eq!(verified.user_id, "user123");
    }

    #[test]
    fn test_state_is_single_use() {
        let manager = StateManager::in_memory();

        for platform in Platform::ALL {
            let token = manager.issue("alice", platform).unwrap();

            // First validation succeeds
            assert!(manager.verify(platform, &token.value).is_ok());

            // Second validation fails (already consumed)
            assert!(matches!(
                manager.verify(platform, &token.value),
                Err(Error::CorrelationMismatch)
            ));
        }
    }

    #[test]
    fn test_forged_state_rejected() {
        let manager = StateManager::in_memory();
        let token = manager.issue("bob", Platform::Twitter).unwrap();

        assert!(matches!(
            manager.verify(Platform::Twitter, "forged"),
            Err(Error::CorrelationMismatch)
        ));

        // The real state is untouched by the forged attempt
        assert!(manager.verify(Platform::Twitter, &token.value).is_ok());
    }

    #[test]
    fn test_state_bound_to_platform() {
        let manager = StateManager::in_memory();
        let token = manager.issue("bob", Platform::Linkedin).unwrap();

        assert!(matches!(
            manager.verify(Platform::Facebook, &token.value),
            Err(Error::CorrelationMismatch)
        ));

        // Consumed by the failed attempt
        assert!(matches!(
            manager.verify(Platform::Linkedin, &token.value),
            Err(Error::CorrelationMismatch)
        ));
    }

    #[test]
    fn test_expired_state_rejected() {
        let manager = StateManager::in_memory();
        let issued_at = Utc::now();

        let token = manager
            .issue_at("carol", Platform::Youtube, issued_at)
            .unwrap();

        let later = issued_at + Duration::minutes(10) + Duration::seconds(1);
        assert!(matches!(
            manager.verify_at(Platform::Youtube, &token.value, later),
            Err(Error::CorrelationExpired)
        ));
    }

    #[test]
    fn test_state_valid_until_expiry() {
        let manager = StateManager::in_memory();
        let issued_at = Utc::now();

        let token = manager
            .issue_at("carol", Platform::Youtube, issued_at)
            .unwrap();

        let just_before = issued_at + Duration::minutes(10) - Duration::seconds(1);
        assert!(manager
            .verify_at(Platform::Youtube, &token.value, just_before)
            .is_ok());
    }

    #[test]
    fn test_cleanup_removes_expired() {
        let manager = StateManager::in_memory();
        let long_ago = Utc::now() - Duration::hours(1);

        manager.issue_at("user1", Platform::Facebook, long_ago).unwrap();
        manager.issue_at("user2", Platform::Tiktok, long_ago).unwrap();
        manager.issue("user3", Platform::Tiktok).unwrap();

        assert_eq!(manager.count().unwrap(), 3);

        assert_eq!(manager.cleanup_expired().unwrap(), 2);
        assert_eq!(manager.count().unwrap(), 1);
    }

    #[test]
    fn test_state_values_are_unique() {
        let manager = StateManager::in_memory();
        let a = manager.issue("u", Platform::Facebook).unwrap();
        let b = manager.issue("u", Platform::Facebook).unwrap();
        assert_ne!(a.value, b.value);
    }

    #[test]
    fn test_state_key_is_hex_digest() {
        let key = state_key("xyz");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, state_key("xyz "));
    }
}
