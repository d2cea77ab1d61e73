//! Encrypted credential storage for platform OAuth tokens.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - save / get / list_active / revoke     │
//! │  - one active row per (user, platform)   │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       TokenCipher                        │
//! │  - AES-256-GCM, nonce per field          │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite Database                    │
//! │  - Encrypted tokens at rest              │
//! │  - Soft-deleted history rows             │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use postpilot::credentials::{CredentialStore, NewCredential};
//! use postpilot::platform::Platform;
//! use postpilot::secret::Secret;
//! use chrono::{Duration, Utc};
//!
//! # fn main() -> postpilot::error::Result<()> {
//! let encryption_key = std::env::var("POSTPILOT_ENCRYPTION_KEY").unwrap_or_default();
//! let store = CredentialStore::new("postpilot.db", &encryption_key)?;
//!
//! let saved = store.save(&NewCredential {
//!     user_id: "user1".to_string(),
//!     platform: Platform::Facebook,
//!     access_token: Secret::new("facebook_access_token"),
//!     refresh_token: None,
//!     expires_at: Some(Utc::now() + Duration::hours(1)),
//!     scopes: vec!["pages_manage_posts".to_string()],
//!     account_id: Some("1234".to_string()),
//!     display_name: Some("Acme".to_string()),
//!     profile_image_url: None,
//! })?;
//! assert!(saved.active);
//!
//! // Tokens are decrypted only here
//! let current = store.get("user1", Platform::Facebook)?;
//! let _token = current.tokens.access_token.expose();
//!
//! store.revoke("user1", Platform::Facebook)?;
//! # Ok(())
//! # }
//! ```
//!
//! # Security
//!
//! - All tokens encrypted at rest with AES-256-GCM
//! - Each token has a unique nonce (never reused)
//! - Listing and history views never carry token material
//! - Token fields are [`Secret`]s and print as `[redacted]`

use crate::platform::Platform;
use crate::secret::Secret;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

mod encryption;
mod storage;

pub use encryption::{validate_key, SealedField, TokenCipher};
pub use storage::{CredentialStore, RefreshCommit};

/// A stored connection without token material.
///
/// This is what listing, history, and the HTTP API see.
#[derive(Clone, Debug, Serialize)]
pub struct Credential {
    pub id: Uuid,
    pub user_id: String,
    pub platform: Platform,
    /// Account identifier on the platform
    pub account_id: Option<String>,
    pub display_name: Option<String>,
    pub profile_image_url: Option<String>,
    /// Scopes granted by the provider
    pub scopes: Vec<String>,
    /// `None` for providers issuing non-expiring tokens
    pub expires_at: Option<DateTime<Utc>>,
    pub has_refresh_token: bool,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deactivated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deactivation_reason: Option<String>,
}

/// Decrypted token material, produced only by [`CredentialStore::get`].
#[derive(Clone, Debug)]
pub struct DecryptedTokens {
    pub access_token: Secret,
    pub refresh_token: Option<Secret>,
}

/// An active credential with its tokens decrypted for use.
#[derive(Clone, Debug)]
pub struct CredentialWithTokens {
    pub credential: Credential,
    pub tokens: DecryptedTokens,
}

/// Input for [`CredentialStore::save`].
#[derive(Clone, Debug)]
pub struct NewCredential {
    pub user_id: String,
    pub platform: Platform,
    pub access_token: Secret,
    pub refresh_token: Option<Secret>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub account_id: Option<String>,
    pub display_name: Option<String>,
    pub profile_image_url: Option<String>,
}

/// Why a credential stopped being active.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeactivationReason {
    /// A newer connection for the same platform was saved
    Replaced,
    /// The user disconnected the platform
    Disconnected,
    /// The provider rejected the refresh token; the user must reconnect
    RefreshRejected,
}

impl DeactivationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeactivationReason::Replaced => "replaced",
            DeactivationReason::Disconnected => "disconnected",
            DeactivationReason::RefreshRejected => "refresh_rejected",
        }
    }
}
