//! Connection lifecycle as seen by the dashboard.
//!
//! Composes the provider registry, state manager, token exchanger,
//! credential store and refresh scheduler into the operations the HTTP
//! layer calls: list, connect, complete a callback, refresh now, disconnect.

use crate::credentials::{Credential, CredentialStore, NewCredential};
use crate::error::{Error, Result};
use crate::oauth::{CorrelationMarker, ProviderRegistry, StateManager, TokenExchanger};
use crate::platform::{Platform, PlatformMetadata};
use crate::refresh::{RefreshMode, RefreshOutcome, RefreshScheduler};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};


/// Query parameters a provider sends to the callback URL
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Where to send the browser to start a connection
#[derive(Clone, Debug)]
pub struct AuthorizationRedirect {
    pub url: String,
    /// Sealed marker for the browser cookie
    pub marker: String,
    pub max_age_seconds: i64,
}

/// A platform as listed in the dashboard
#[derive(Clone, Debug, Serialize)]
pub struct PlatformStatus {
    #[serde(flatten)]
    pub metadata: PlatformMetadata,
    /// Whether client credentials are configured for it
    pub configured: bool,
}

/// Result of a callback, reported back to the connections view
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackOutcome {
    Connected(Platform),
    Failed(String),
}

impl CallbackOutcome {
    pub fn from_result(result: &Result<Credential>) -> Self {
        match result {
            Ok(credential) => CallbackOutcome::Connected(credential.platform),
            Err(e) => CallbackOutcome::Failed(e.callback_code()),
        }
    }

    /// Connections view URL carrying `connected=<platform>` or `error=<code>`
    pub fn redirect_target(&self, connections_url: &str) -> String {
        let separator = if connections_url.contains('?') { '&' } else { '?' };
        match self {
            CallbackOutcome::Connected(platform) => {
                format!("{}{}connected={}", connections_url, separator, platform.id())
            }
            CallbackOutcome::Failed(code) => format!(
                "{}{}error={}",
                connections_url,
                separator,
                urlencoding::encode(code)
            ),
        }
    }
}

pub struct ConnectionService {
    states: StateManager,
    marker: CorrelationMarker,
    exchanger: Arc<TokenExchanger>,
    store: Arc<CredentialStore>,
    scheduler: Arc<RefreshScheduler>,
}

impl ConnectionService {
    pub fn new(
        states: StateManager,
        marker: CorrelationMarker,
        exchanger: Arc<TokenExchanger>,
        store: Arc<CredentialStore>,
        scheduler: Arc<RefreshScheduler>,
    ) -> Self {
        Self {
            states,
            marker,
            exchanger,
            store,
            scheduler,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        self.exchanger.registry()
    }

    pub fn states(&self) -> &StateManager {
        &self.states
    }

    /// Every supported platform, flagged with whether it can be connected
    pub fn platforms(&self) -> Vec<PlatformStatus> {
        Platform::ALL
            .into_iter()
            .map(|platform| PlatformStatus {
                metadata: platform.metadata().clone(),
                configured: self.registry().is_registered(platform),
            })
            .collect()
    }

    pub fn list_active(&self, user_id: &str) -> Result<Vec<Credential>> {
        self.store.list_active(user_id)
    }

    pub fn history(&self, user_id: &str, platform: Platform) -> Result<Vec<Credential>> {
        self.store.history(user_id, platform)
    }

    /// Starts a connection: issues a state and builds the provider URL
    pub fn connect(&self, user_id: &str, platform: Platform) -> Result<AuthorizationRedirect> {
        let provider = self.registry().lookup(platform)?;
        let token = self.states.issue(user_id, platform)?;
        let marker = self.marker.seal(&token)?;

        info!(platform = %platform, user_id = %user_id, "Redirecting to OAuth provider");

        Ok(AuthorizationRedirect {
            url: provider.build_auth_url(&token.value),
            marker,
            max_age_seconds: self.states.lifetime().num_seconds(),
        })
    }

    /// Completes a connection from the provider callback.
    ///
    /// `marker` is the sealed cookie the browser presented, if any.
    pub async fn complete(
        &self,
        platform: Platform,
        params: CallbackParams,
        marker: Option<&str>,
    ) -> Result<Credential> {
        if let Some(error) = params.error {
            // Spend the state so the link cannot be replayed
            if let Some(state) = params.state.as_deref() {
                if let Err(e) = self.states.verify(platform, state) {
                    debug!(platform = %platform, error = %e, "Denied callback state not spent");
                }
            }
            warn!(
                platform = %platform,
                error = %error,
                description = params.error_description.as_deref().unwrap_or(""),
                "OAuth authorization denied by provider"
            );
            return Err(Error::ProviderDenied {
                platform,
                reason: error,
            });
        }

        let (Some(code), Some(state)) = (params.code, params.state) else {
            return Err(Error::MissingCallbackParameters);
        };

        if let Err(e) = self.marker.check(marker, platform, &state) {
            warn!(platform = %platform, "OAuth callback without a matching browser marker");
            return Err(e);
        }

        let token = self.states.verify(platform, &state)?;
        let user_id = token.user_id;

        debug!(platform = %platform, user_id = %user_id, "OAuth state validated");

        let tokens = self.exchanger.exchange(platform, &code).await?;

        let profile = match self
            .exchanger
            .fetch_profile(platform, &tokens.access_token)
            .await
        {
            Ok(profile) => profile.unwrap_or_default(),
            Err(e) => {
                warn!(platform = %platform, error = %e, "Profile lookup failed, continuing");
                Default::default()
            }
        };

        // A refresh of the credential being replaced must not land after this save
        let guard = self.scheduler.lock_key(&user_id, platform).await;
        let credential = self.store.save(&NewCredential {
            user_id: user_id.clone(),
            platform,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            expires_at: tokens.expires_at,
            scopes: tokens.scopes,
            account_id: profile.account_id,
            display_name: profile.display_name,
            profile_image_url: profile.profile_image_url,
        })?;
        drop(guard);

        info!(
            platform = %platform,
            user_id = %user_id,
            has_refresh_token = credential.has_refresh_token,
            "OAuth flow completed successfully"
        );

        Ok(credential)
    }

    /// Refreshes now, regardless of expiry
    pub async fn refresh_now(&self, user_id: &str, platform: Platform) -> Result<RefreshOutcome> {
        self.scheduler
            .refresh_credential(user_id, platform, RefreshMode::Force)
            .await
    }

    pub fn disconnect(&self, user_id: &str, platform: Platform) -> Result<()> {
        self.store.revoke(user_id, platform)?;
        info!(platform = %platform, user_id = %user_id, "Platform disconnected");
        Ok(())
    }
}
