//! Encrypted credential storage using SQLite.
//!
//! Stores OAuth credentials per (user, platform). Tokens are encrypted at rest
//! with AES-256-GCM. Rows are never physically deleted: disconnecting or
//! replacing a connection clears the `active` flag and keeps the row as
//! history.

use super::encryption::{SealedField, TokenCipher};
use super::{
    Credential, CredentialWithTokens, DeactivationReason, DecryptedTokens, NewCredential,
};
use crate::db::{from_db_time, open_connection, to_db_time};
use crate::error::{Error, Result};
use crate::oauth::Tokens;
use crate::platform::Platform;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Columns of the redacted view, in [`RawCredential`] order
const CREDENTIAL_COLUMNS: &str = "id, user_id, platform, account_id, display_name, \
     profile_image_url, scopes, expires_at, refresh_token IS NOT NULL, active, \
     created_at, last_refreshed_at, deactivated_at, deactivation_reason";

/// Result of writing refreshed tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshCommit {
    Updated,
    /// The credential was deactivated while the refresh was in flight; the
    /// refreshed tokens were discarded.
    Inactive,
}

/// Encrypted credential storage backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE credentials (
///     id TEXT PRIMARY KEY,              -- UUID v7
///     user_id TEXT NOT NULL,
///     platform TEXT NOT NULL,
///     access_token TEXT NOT NULL,       -- Encrypted
///     access_token_nonce TEXT NOT NULL,
///     refresh_token TEXT,               -- Encrypted (optional)
///     refresh_token_nonce TEXT,
///     expires_at TEXT,                  -- RFC 3339, UTC (optional)
///     account_id TEXT,
///     display_name TEXT,
///     profile_image_url TEXT,
///     scopes TEXT NOT NULL,             -- Space separated
///     active INTEGER NOT NULL,
///     created_at TEXT NOT NULL,
///     last_refreshed_at TEXT,
///     deactivated_at TEXT,
///     deactivation_reason TEXT
/// );
/// CREATE UNIQUE INDEX idx_credentials_one_active
///     ON credentials(user_id, platform) WHERE active = 1;
/// ```
///
/// # Thread Safety
/// - Connection is wrapped in a Mutex, so writes for a key are serialized
/// - Multi-statement writes run in a transaction
pub struct CredentialStore {
    conn: Mutex<Connection>,
    cipher: Arc<TokenCipher>,
}

impl CredentialStore {
    /// Creates or opens a credential store.
    ///
    /// # Arguments
    /// * `db_path` - Path to SQLite database file
    /// * `encryption_key` - Base64-encoded 32-byte master key
    pub fn new<P: AsRef<Path>>(db_path: P, encryption_key: &str) -> Result<Self> {
        let cipher = TokenCipher::from_base64(encryption_key)?;
        Self::with_cipher(db_path, Arc::new(cipher))
    }

    /// Opens a store sharing an existing cipher
    pub fn with_cipher<P: AsRef<Path>>(db_path: P, cipher: Arc<TokenCipher>) -> Result<Self> {
        let conn = open_connection(db_path)?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                platform TEXT NOT NULL,
                access_token TEXT NOT NULL,
                access_token_nonce TEXT NOT NULL,
                refresh_token TEXT,
                refresh_token_nonce TEXT,
                expires_at TEXT,
                account_id TEXT,
                display_name TEXT,
                profile_image_url TEXT,
                scopes TEXT NOT NULL,
                active INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                last_refreshed_at TEXT,
                deactivated_at TEXT,
                deactivation_reason TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_credentials_one_active
                ON credentials(user_id, platform) WHERE active = 1;
            CREATE INDEX IF NOT EXISTS idx_credentials_due
                ON credentials(expires_at) WHERE active = 1;
            "#,
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("credential store lock poisoned".to_string()))
    }

    fn seal_optional(&self, token: Option<&crate::secret::Secret>) -> Result<Option<SealedField>> {
        token.map(|t| self.cipher.encrypt(t)).transpose()
    }

    /// Stores a new connection.
    ///
    /// Any active credential for the same (user, platform) is deactivated in
    /// the same transaction, so at most one active row exists per pair.
    pub fn save(&self, new: &NewCredential) -> Result<Credential> {
        // Encrypt before touching the database; a failure here writes nothing
        let access = self.cipher.encrypt(&new.access_token)?;
        let refresh = self.seal_optional(new.refresh_token.as_ref())?;

        let id = Uuid::now_v7();
        let now = Utc::now();
        let now_text = to_db_time(now);

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let replaced = tx.execute(
            r#"
            UPDATE credentials
            SET active = 0, deactivated_at = ?3, deactivation_reason = ?4
            WHERE user_id = ?1 AND platform = ?2 AND active = 1
            "#,
            params![
                new.user_id,
                new.platform.id(),
                now_text,
                DeactivationReason::Replaced.as_str()
            ],
        )?;

        tx.execute(
            r#"
            INSERT INTO credentials (
                id, user_id, platform,
                access_token, access_token_nonce,
                refresh_token, refresh_token_nonce,
                expires_at, account_id, display_name, profile_image_url,
                scopes, active, created_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 1, ?13)
            "#,
            params![
                id.to_string(),
                new.user_id,
                new.platform.id(),
                access.ciphertext,
                access.nonce,
                refresh.as_ref().map(|r| r.ciphertext.as_str()),
                refresh.as_ref().map(|r| r.nonce.as_str()),
                new.expires_at.map(to_db_time),
                new.account_id,
                new.display_name,
                new.profile_image_url,
                new.scopes.join(" "),
                now_text,
            ],
        )?;

        tx.commit()?;

        tracing::debug!(
            user_id = %new.user_id,
            platform = %new.platform,
            replaced,
            "Stored credential"
        );

        Ok(Credential {
            id,
            user_id: new.user_id.clone(),
            platform: new.platform,
            account_id: new.account_id.clone(),
            display_name: new.display_name.clone(),
            profile_image_url: new.profile_image_url.clone(),
            scopes: new.scopes.clone(),
            expires_at: new.expires_at,
            has_refresh_token: new.refresh_token.is_some(),
            active: true,
            created_at: now,
            last_refreshed_at: None,
            deactivated_at: None,
            deactivation_reason: None,
        })
    }

    /// Retrieves the active credential for a user and platform with tokens decrypted.
    pub fn get(&self, user_id: &str, platform: Platform) -> Result<CredentialWithTokens> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {}, access_token, access_token_nonce, refresh_token, refresh_token_nonce \
                     FROM credentials WHERE user_id = ?1 AND platform = ?2 AND active = 1",
                    CREDENTIAL_COLUMNS
                ),
                params![user_id, platform.id()],
                |row| {
                    let raw = RawCredential::from_row(row)?;
                    let access = SealedField {
                        ciphertext: row.get(14)?,
                        nonce: row.get(15)?,
                    };
                    let refresh_ciphertext: Option<String> = row.get(16)?;
                    let refresh_nonce: Option<String> = row.get(17)?;
                    let refresh = match (refresh_ciphertext, refresh_nonce) {
                        (Some(ciphertext), Some(nonce)) => Some(SealedField { ciphertext, nonce }),
                        _ => None,
                    };
                    Ok((raw, access, refresh))
                },
            )
            .optional()?;
        drop(conn);

        let (raw, access, refresh) = row.ok_or_else(|| Error::NotFound {
            user_id: user_id.to_string(),
            platform,
        })?;

        let tokens = DecryptedTokens {
            access_token: self.cipher.decrypt(&access)?,
            refresh_token: refresh.map(|r| self.cipher.decrypt(&r)).transpose()?,
        };

        Ok(CredentialWithTokens {
            credential: raw.into_credential()?,
            tokens,
        })
    }

    /// Active connections for a user, without token material.
    pub fn list_active(&self, user_id: &str) -> Result<Vec<Credential>> {
        self.query_credentials(
            &format!(
                "SELECT {} FROM credentials WHERE user_id = ?1 AND active = 1 ORDER BY platform",
                CREDENTIAL_COLUMNS
            ),
            params![user_id],
        )
    }

    /// Every row for a user and platform, newest first, without token material.
    pub fn history(&self, user_id: &str, platform: Platform) -> Result<Vec<Credential>> {
        self.query_credentials(
            &format!(
                "SELECT {} FROM credentials WHERE user_id = ?1 AND platform = ?2 \
                 ORDER BY created_at DESC, id DESC",
                CREDENTIAL_COLUMNS
            ),
            params![user_id, platform.id()],
        )
    }

    fn query_credentials(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Credential>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql)?;
        let raws = stmt
            .query_map(params, RawCredential::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        raws.into_iter().map(RawCredential::into_credential).collect()
    }

    /// Disconnects a platform for a user (soft delete).
    pub fn revoke(&self, user_id: &str, platform: Platform) -> Result<()> {
        if self.deactivate(user_id, platform, DeactivationReason::Disconnected)? {
            Ok(())
        } else {
            Err(Error::NotFound {
                user_id: user_id.to_string(),
                platform,
            })
        }
    }

    /// Clears the active flag, recording why.
    ///
    /// Returns `false` when there was no active credential.
    pub fn deactivate(
        &self,
        user_id: &str,
        platform: Platform,
        reason: DeactivationReason,
    ) -> Result<bool> {
        let rows = self.lock()?.execute(
            r#"
            UPDATE credentials
            SET active = 0, deactivated_at = ?3, deactivation_reason = ?4
            WHERE user_id = ?1 AND platform = ?2 AND active = 1
            "#,
            params![
                user_id,
                platform.id(),
                to_db_time(Utc::now()),
                reason.as_str()
            ],
        )?;

        Ok(rows > 0)
    }

    /// Clears the active flag on one specific row.
    ///
    /// Returns `false` when that row is no longer active, for instance because
    /// a reconnect replaced it.
    pub fn deactivate_id(&self, id: Uuid, reason: DeactivationReason) -> Result<bool> {
        let rows = self.lock()?.execute(
            r#"
            UPDATE credentials
            SET active = 0, deactivated_at = ?2, deactivation_reason = ?3
            WHERE id = ?1 AND active = 1
            "#,
            params![id.to_string(), to_db_time(Utc::now()), reason.as_str()],
        )?;

        Ok(rows > 0)
    }

    /// Writes refreshed tokens in place, only if the credential is still active.
    ///
    /// When `tokens.refresh_token` is `None` (provider did not rotate it) the
    /// stored refresh token is kept.
    pub fn store_refreshed(&self, id: Uuid, tokens: &Tokens) -> Result<RefreshCommit> {
        let access = self.cipher.encrypt(&tokens.access_token)?;
        let refresh = self.seal_optional(tokens.refresh_token.as_ref())?;

        let rows = self.lock()?.execute(
            r#"
            UPDATE credentials
            SET access_token = ?2,
                access_token_nonce = ?3,
                refresh_token = COALESCE(?4, refresh_token),
                refresh_token_nonce = COALESCE(?5, refresh_token_nonce),
                expires_at = ?6,
                scopes = ?7,
                last_refreshed_at = ?8
            WHERE id = ?1 AND active = 1
            "#,
            params![
                id.to_string(),
                access.ciphertext,
                access.nonce,
                refresh.as_ref().map(|r| r.ciphertext.as_str()),
                refresh.as_ref().map(|r| r.nonce.as_str()),
                tokens.expires_at.map(to_db_time),
                tokens.scopes.join(" "),
                to_db_time(Utc::now()),
            ],
        )?;

        Ok(if rows > 0 {
            RefreshCommit::Updated
        } else {
            RefreshCommit::Inactive
        })
    }

    /// Active (user, platform) pairs whose expiry is at or before `threshold`.
    pub fn list_due(&self, threshold: DateTime<Utc>) -> Result<Vec<(String, Platform)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT user_id, platform FROM credentials
            WHERE active = 1 AND expires_at IS NOT NULL AND expires_at <= ?1
            ORDER BY expires_at
            "#,
        )?;

        let pairs = stmt
            .query_map(params![to_db_time(threshold)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        pairs
            .into_iter()
            .map(|(user_id, platform)| Ok((user_id, platform.parse()?)))
            .collect()
    }
}

/// A credential row as read from SQLite, before parsing.
struct RawCredential {
    id: String,
    user_id: String,
    platform: String,
    account_id: Option<String>,
    display_name: Option<String>,
    profile_image_url: Option<String>,
    scopes: String,
    expires_at: Option<String>,
    has_refresh_token: bool,
    active: bool,
    created_at: String,
    last_refreshed_at: Option<String>,
    deactivated_at: Option<String>,
    deactivation_reason: Option<String>,
}

impl RawCredential {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            platform: row.get(2)?,
            account_id: row.get(3)?,
            display_name: row.get(4)?,
            profile_image_url: row.get(5)?,
            scopes: row.get(6)?,
            expires_at: row.get(7)?,
            has_refresh_token: row.get(8)?,
            active: row.get(9)?,
            created_at: row.get(10)?,
            last_refreshed_at: row.get(11)?,
            deactivated_at: row.get(12)?,
            deactivation_reason: row.get(13)?,
        })
    }

    fn into_credential(self) -> Result<Credential> {
        let time = |value: &str| {
            from_db_time(value)
                .map_err(|e| Error::Internal(format!("invalid stored timestamp: {}", e)))
        };
        let optional_time = |value: Option<String>| value.as_deref().map(time).transpose();

        Ok(Credential {
            id: Uuid::parse_str(&self.id)
                .map_err(|e| Error::Internal(format!("invalid stored credential id: {}", e)))?,
            platform: self.platform.parse()?,
            user_id: self.user_id,
            account_id: self.account_id,
            display_name: self.display_name,
            profile_image_url: self.profile_image_url,
            scopes: self.scopes.split_whitespace().map(str::to_string).collect(),
            expires_at: optional_time(self.expires_at)?,
            has_refresh_token: self.has_refresh_token,
            active: self.active,
            created_at: time(&self.created_at)?,
            last_refreshed_at: optional_time(self.last_refreshed_at)?,
            deactivated_at: optional_time(self.deactivated_at)?,
            deactivation_reason: self.deactivation_reason,
        })
    }
}
