//! Background token refresh.
//!
//! The scheduler periodically looks for active credentials whose access token
//! expires within the refresh buffer (5 minutes by default) and renews them
//! with the stored refresh token.
//!
//! - Each (user, platform) pair has its own async mutex; a scheduler tick and
//!   a manual "refresh now" never refresh the same credential concurrently.
//! - The credential is re-read under the lock, so a second caller that queued
//!   behind a successful refresh sees the new expiry and does nothing.
//! - Terminal failures (refresh token rejected) deactivate the credential and
//!   notify the user to reconnect. Transient failures leave it untouched for
//!   the next pass.
//! - Both outcomes are written against the row that was refreshed, and only
//!   while it is still active. A reconnect or disconnect that lands mid-flight
//!   wins.

use crate::credentials::{Credential, CredentialStore, DeactivationReason, RefreshCommit};
use crate::error::{Error, Result};
use crate::oauth::{TokenExchanger, Tokens};
use crate::platform::Platform;
use crate::secret::Secret;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};


/// Default refresh buffer: refresh when less than this lifetime remains
pub const DEFAULT_REFRESH_BUFFER_SECONDS: i64 = 300;

/// Anything that can trade a refresh token for new tokens.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, platform: Platform, refresh_token: &Secret) -> Result<Tokens>;
}

#[async_trait]
impl TokenRefresher for TokenExchanger {
    async fn refresh(&self, platform: Platform, refresh_token: &Secret) -> Result<Tokens> {
        TokenExchanger::refresh(self, platform, refresh_token).await
    }
}

/// Receives "user must reconnect" events after terminal refresh failures.
pub trait ReconnectNotifier: Send + Sync {
    fn reconnect_required(&self, user_id: &str, platform: Platform, message: &str);
}

/// Notifier that records the event in the log
pub struct LogNotifier;

impl ReconnectNotifier for LogNotifier {
    fn reconnect_required(&self, user_id: &str, platform: Platform, message: &str) {
        warn!(
            user_id = %user_id,
            platform = %platform,
            message = %message,
            "Connection deactivated, user must reconnect"
        );
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshMode {
    /// Refresh only inside the buffer window (scheduler)
    IfDue,
    /// Refresh regardless of expiry (user-initiated)
    Force,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed { expires_at: Option<DateTime<Utc>> },
    /// Expiry is outside the buffer (or absent)
    NotDue,
    /// No refresh token stored; the token lives until it expires
    NotRefreshable,
    /// The credential was replaced or deactivated while the refresh was in flight
    Discarded,
}

/// Counts from one scheduler pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub refreshed: usize,
    pub not_due: usize,
    pub not_refreshable: usize,
    pub discarded: usize,
    pub deactivated: usize,
    pub transient_failures: usize,
    pub errors: usize,
}

impl PassReport {
    fn is_idle(&self) -> bool {
        *self == PassReport::default() || self.total() == self.not_due
    }

    fn total(&self) -> usize {
        self.refreshed
            + self.not_due
            + self.not_refreshable
            + self.discarded
            + self.deactivated
            + self.transient_failures
            + self.errors
    }
}

type KeyLocks = DashMap<(String, Platform), Arc<Mutex<()>>>;

/// Exclusive hold on one (user, platform) pair.
///
/// Dropping it removes the map entry when no other task is waiting on it.
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: (String, Platform),
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct RefreshScheduler {
    store: Arc<CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
    notifier: Arc<dyn ReconnectNotifier>,
    buffer: Duration,
    locks: KeyLocks,
}

impl RefreshScheduler {
    pub fn new(
        store: Arc<CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
        buffer_seconds: i64,
    ) -> Self {
        Self {
            store,
            refresher,
            notifier: Arc::new(LogNotifier),
            buffer: Duration::seconds(buffer_seconds),
            locks: DashMap::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ReconnectNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn buffer(&self) -> Duration {
        self.buffer
    }

    /// Returns true if the access token expires within the buffer (or already has).
    ///
    /// Credentials without an expiry never need refreshing.
    pub fn needs_refresh(&self, credential: &Credential, now: DateTime<Utc>) -> bool {
        match credential.expires_at {
            Some(expires_at) if credential.active => expires_at - now < self.buffer,
            _ => false,
        }
    }

    /// Waits for exclusive access to a (user, platform) pair.
    ///
    /// Every credential write for the pair that can race a refresh (the
    /// refresh itself, saving a reconnect) runs under this guard.
    pub async fn lock_key(&self, user_id: &str, platform: Platform) -> KeyGuard<'_> {
        let key = (user_id.to_string(), platform);
        let lock = Arc::clone(
            self.locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );

        KeyGuard {
            locks: &self.locks,
            key,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Refreshes one credential under its per-key lock.
    pub async fn refresh_credential(
        &self,
        user_id: &str,
        platform: Platform,
        mode: RefreshMode,
    ) -> Result<RefreshOutcome> {
        let _guard = self.lock_key(user_id, platform).await;

        let current = self.store.get(user_id, platform)?;

        if mode == RefreshMode::IfDue && !self.needs_refresh(&current.credential, Utc::now()) {
            debug!(user_id = %user_id, platform = %platform, "Token not due for refresh");
            return Ok(RefreshOutcome::NotDue);
        }

        let Some(refresh_token) = current.tokens.refresh_token.as_ref() else {
            debug!(user_id = %user_id, platform = %platform, "No refresh token stored");
            return Ok(RefreshOutcome::NotRefreshable);
        };

        info!(user_id = %user_id, platform = %platform, "Refreshing OAuth token");

        let tokens = match self.refresher.refresh(platform, refresh_token).await {
            Ok(tokens) => tokens,
            Err(e) if e.is_terminal() => {
                let deactivated = self
                    .store
                    .deactivate_id(current.credential.id, DeactivationReason::RefreshRejected)?;
                if !deactivated {
                    info!(
                        user_id = %user_id,
                        platform = %platform,
                        "Credential replaced or disconnected during refresh, rejection ignored"
                    );
                    return Ok(RefreshOutcome::Discarded);
                }
                self.notifier
                    .reconnect_required(user_id, platform, &e.user_message());
                warn!(
                    user_id = %user_id,
                    platform = %platform,
                    error = %e,
                    "Refresh token rejected, credential deactivated"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    user_id = %user_id,
                    platform = %platform,
                    error = %e,
                    "Token refresh failed, will retry next pass"
                );
                return Err(e);
            }
        };

        match self.store.store_refreshed(current.credential.id, &tokens)? {
            RefreshCommit::Updated => {
                info!(
                    user_id = %user_id,
                    platform = %platform,
                    rotated = tokens.refresh_token.is_some(),
                    "OAuth token refreshed successfully"
                );
                Ok(RefreshOutcome::Refreshed {
                    expires_at: tokens.expires_at,
                })
            }
            RefreshCommit::Inactive => {
                info!(
                    user_id = %user_id,
                    platform = %platform,
                    "Credential deactivated during refresh, result discarded"
                );
                Ok(RefreshOutcome::Discarded)
            }
        }
    }

    /// Runs one pass over every credential inside the buffer window.
    pub async fn run_pass(&self) -> Result<PassReport> {
        let due = self.store.list_due(Utc::now() + self.buffer)?;
        let mut report = PassReport::default();

        for (user_id, platform) in due {
            match self
                .refresh_credential(&user_id, platform, RefreshMode::IfDue)
                .await
            {
                Ok(RefreshOutcome::Refreshed { .. }) => report.refreshed += 1,
                Ok(RefreshOutcome::NotDue) => report.not_due += 1,
                Ok(RefreshOutcome::NotRefreshable) => report.not_refreshable += 1,
                Ok(RefreshOutcome::Discarded) => report.discarded += 1,
                // Disconnected between listing and locking
                Err(Error::NotFound { .. }) => report.discarded += 1,
                Err(e) if e.is_terminal() => report.deactivated += 1,
                Err(e) if e.is_transient() => report.transient_failures += 1,
                Err(e) => {
                    error!(
                        user_id = %user_id,
                        platform = %platform,
                        error = %e,
                        "Refresh failed"
                    );
                    report.errors += 1;
                }
            }
        }

        Ok(report)
    }

    /// Starts the refresh loop (non-blocking).
    ///
    /// Spawns a background task that runs a pass every `interval_seconds`.
    /// Returns a JoinHandle that can be used for shutdown.
    pub fn start(self: Arc<Self>, interval_seconds: u64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = interval_seconds,
                buffer_secs = self.buffer.num_seconds(),
                "Starting token refresh scheduler"
            );

            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_seconds));

            loop {
                interval.tick().await;

                match self.run_pass().await {
                    Ok(report) if report.is_idle() => {
                        debug!(?report, "Refresh pass complete");
                    }
                    Ok(report) => {
                        info!(
                            refreshed = report.refreshed,
                            deactivated = report.deactivated,
                            transient_failures = report.transient_failures,
                            discarded = report.discarded,
                            errors = report.errors,
                            "Refresh pass complete"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Refresh pass failed");
                    }
                }
            }
        })
    }
}
