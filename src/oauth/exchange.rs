//! OAuth token exchange logic.
//!
//! Exchanges authorization codes and refresh tokens at a provider's token
//! endpoint, and optionally looks up the connected account's profile.
//! Each call is a single request bounded by the client timeout; nothing is
//! retried here.

use super::provider::{ProviderConfig, ProviderRegistry};
use crate::error::{truncate_body, Error, FailureCause, Result};
use crate::platform::Platform;
use crate::secret::Secret;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Token material returned by a provider
#[derive(Clone, Debug)]
pub struct Tokens {
    pub access_token: Secret,
    pub refresh_token: Option<Secret>,
    /// Absolute expiry computed from `expires_in` at receipt
    pub expires_at: Option<DateTime<Utc>>,
    /// Scopes the provider granted (falls back to the requested scopes)
    pub scopes: Vec<String>,
}

/// Connected account details shown on the connections page
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccountProfile {
    pub account_id: Option<String>,
    pub display_name: Option<String>,
    pub profile_image_url: Option<String>,
}

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default, deserialize_with = "number_or_string")]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

/// Some providers send `expires_in` as a string
fn number_or_string<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(s)) => s.trim().parse().map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Grant {
    AuthorizationCode,
    RefreshToken,
}

impl Grant {
    fn as_str(&self) -> &'static str {
        match self {
            Grant::AuthorizationCode => "authorization_code",
            Grant::RefreshToken => "refresh_token",
        }
    }

    fn failure(
        &self,
        platform: Platform,
        cause: FailureCause,
        status: Option<u16>,
        message: String,
    ) -> Error {
        match self {
            Grant::AuthorizationCode => Error::ExchangeFailed {
                platform,
                cause,
                status,
                message,
            },
            Grant::RefreshToken => Error::RefreshFailed {
                platform,
                cause,
                status,
                message,
            },
        }
    }
}

/// Classifies a non-success token endpoint status.
///
/// Rate limiting, request timeouts and server errors clear on their own; any
/// other rejection (e.g. `invalid_grant`) needs the user to reconnect.
pub fn classify_status(status: u16) -> FailureCause {
    match status {
        408 | 429 | 500..=599 => FailureCause::Transient,
        _ => FailureCause::Terminal,
    }
}

/// Absolute expiry `seconds` after `now`.
///
/// `None` for a negative lifetime or one that does not fit a timestamp.
fn expiry_after(now: DateTime<Utc>, seconds: i64) -> Option<DateTime<Utc>> {
    if seconds < 0 {
        return None;
    }
    Duration::try_seconds(seconds).and_then(|lifetime| now.checked_add_signed(lifetime))
}

/// Splits a granted `scope` string; providers use spaces or commas
fn parse_scopes(scope: Option<&str>, requested: &[String]) -> Vec<String> {
    let granted: Vec<String> = scope
        .unwrap_or_default()
        .split(|c: char| c == ' ' || c == ',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    if granted.is_empty() {
        requested.to_vec()
    } else {
        granted
    }
}

/// Calls provider token endpoints
pub struct TokenExchanger {
    client: reqwest::Client,
    registry: Arc<ProviderRegistry>,
}

impl TokenExchanger {
    /// # Arguments
    /// * `registry` - Provider configurations
    /// * `timeout` - Per-request timeout; expiry counts as a transient failure
    pub fn new(registry: Arc<ProviderRegistry>, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, registry })
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Exchange an authorization code for tokens
    pub async fn exchange(&self, platform: Platform, code: &str) -> Result<Tokens> {
        let provider = self.registry.lookup(platform)?;

        let mut form = HashMap::new();
        form.insert("grant_type", Grant::AuthorizationCode.as_str());
        form.insert("code", code);
        form.insert("redirect_uri", provider.redirect_uri.as_str());
        form.insert("client_id", provider.client_id.as_str());
        form.insert("client_secret", provider.client_secret.expose());

        self.request_tokens(provider, Grant::AuthorizationCode, &form)
            .await
    }

    /// Exchange a refresh token for a new access token
    ///
    /// `refresh_token` in the result is `None` when the provider did not rotate it.
    pub async fn refresh(&self, platform: Platform, refresh_token: &Secret) -> Result<Tokens> {
        let provider = self
            .registry
            .lookup(platform)
            .map_err(|_| Grant::RefreshToken.failure(
                platform,
                FailureCause::Terminal,
                None,
                "platform is no longer configured".to_string(),
            ))?;

        let mut form = HashMap::new();
        form.insert("grant_type", Grant::RefreshToken.as_str());
        form.insert("refresh_token", refresh_token.expose());
        form.insert("client_id", provider.client_id.as_str());
        form.insert("client_secret", provider.client_secret.expose());

        self.request_tokens(provider, Grant::RefreshToken, &form)
            .await
    }

    async fn request_tokens(
        &self,
        provider: &ProviderConfig,
        grant: Grant,
        form: &HashMap<&str, &str>,
    ) -> Result<Tokens> {
        let platform = provider.platform;

        debug!(
            platform = %platform,
            grant = grant.as_str(),
            token_url = %provider.token_url,
            "Requesting tokens"
        );

        let response = self
            .client
            .post(&provider.token_url)
            .header("Accept", "application/json")
            .form(form)
            .send()
            .await
            .map_err(|e| {
                let message = if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    format!("request failed: {}", e.without_url())
                };
                grant.failure(platform, FailureCause::Transient, None, message)
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            return Err(grant.failure(
                platform,
                classify_status(status.as_u16()),
                Some(status.as_u16()),
                truncate_body(&body),
            ));
        }

        let body = response.text().await.map_err(|_| {
            grant.failure(
                platform,
                FailureCause::Transient,
                Some(status.as_u16()),
                "failed to read token response".to_string(),
            )
        })?;

        // The body may contain tokens, so parse failures never echo it
        let token_response: TokenResponse = serde_json::from_str(&body).map_err(|_| {
            grant.failure(
                platform,
                FailureCause::Terminal,
                Some(status.as_u16()),
                "malformed token response".to_string(),
            )
        })?;

        debug!(
            platform = %platform,
            grant = grant.as_str(),
            has_refresh_token = token_response.refresh_token.is_some(),
            expires_in = ?token_response.expires_in,
            "Token request successful"
        );

        let expires_at = match token_response.expires_in {
            Some(seconds) => Some(expiry_after(Utc::now(), seconds).ok_or_else(|| {
                grant.failure(
                    platform,
                    FailureCause::Terminal,
                    Some(status.as_u16()),
                    format!("token response has an invalid expires_in ({})", seconds),
                )
            })?),
            None => None,
        };

        Ok(Tokens {
            scopes: parse_scopes(token_response.scope.as_deref(), &provider.scopes),
            access_token: Secret::new(token_response.access_token),
            refresh_token: token_response
                .refresh_token
                .filter(|t| !t.is_empty())
                .map(Secret::new),
            expires_at,
        })
    }

    /// Look up the connected account's profile.
    ///
    /// Returns `Ok(None)` when the provider has no profile endpoint. Callers
    /// treat errors as non-fatal.
    pub async fn fetch_profile(
        &self,
        platform: Platform,
        access_token: &Secret,
    ) -> Result<Option<AccountProfile>> {
        let provider = self.registry.lookup(platform)?;
        let Some(profile_url) = provider.profile_url.as_deref() else {
            return Ok(None);
        };

        let response = self
            .client
            .get(profile_url)
            .bearer_auth(access_token.expose())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| Error::Internal(format!("profile request failed: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            warn!(platform = %platform, status = status.as_u16(), "Profile lookup rejected");
            return Err(Error::Internal(format!(
                "profile lookup returned status {}",
                status
            )));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|_| Error::Internal("malformed profile response".to_string()))?;

        Ok(Some(parse_profile(&value)))
    }
}

/// Pulls a generic profile out of a provider response.
///
/// Handles the common shapes: top-level fields, a `data` envelope, `sub`
/// instead of `id`, and a nested `picture.data.url`.
pub fn parse_profile(value: &serde_json::Value) -> AccountProfile {
    let root = value.get("data").filter(|d| d.is_object()).unwrap_or(value);

    let text = |field: &str| -> Option<String> {
        match root.get(field)? {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    };

    let picture = match root.get("picture") {
        Some(serde_json::Value::String(url)) => Some(url.clone()),
        Some(nested) => nested
            .pointer("/data/url")
            .and_then(|u| u.as_str())
            .map(str::to_string),
        None => None,
    };

    AccountProfile {
        account_id: text("id").or_else(|| text("sub")),
        display_name: text("name").or_else(|| text("username")),
        profile_image_url: picture.or_else(|| text("profile_image_url")),
    }
}
