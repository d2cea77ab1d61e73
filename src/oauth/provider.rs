//! OAuth provider configurations.
//!
//! Built-in endpoint tables per platform, combined at startup with client
//! credentials and overrides from [`AppConfig`]. The registry is immutable
//! once built.

use crate::config::{AppConfig, ProviderSettings};
use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::secret::Secret;
use std::collections::HashMap;

/// OAuth provider configuration
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub platform: Platform,

    /// Human readable name
    pub name: String,

    /// OAuth authorization endpoint URL
    pub authorization_url: String,

    /// OAuth token exchange endpoint URL
    pub token_url: String,

    /// Optional endpoint returning the connected account's profile
    pub profile_url: Option<String>,

    pub client_id: String,

    pub client_secret: Secret,

    /// Callback URL registered with the provider
    pub redirect_uri: String,

    /// Requested OAuth scopes, in order
    pub scopes: Vec<String>,
}

impl ProviderConfig {
    /// Build authorization URL with state
    pub fn build_auth_url(&self, state: &str) -> String {
        let scopes = self.scopes.join(" ");
        let separator = if self.authorization_url.contains('?') {
            '&'
        } else {
            '?'
        };
        format!(
            "{}{}client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
            self.authorization_url,
            separator,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        )
    }
}

/// Built-in endpoints for a platform.
struct Endpoints {
    authorization_url: &'static str,
    token_url: &'static str,
    profile_url: Option<&'static str>,
    scopes: &'static [&'static str],
}

fn default_endpoints(platform: Platform) -> Endpoints {
    match platform {
        Platform::Facebook => Endpoints {
            authorization_url: "https://www.facebook.com/v18.0/dialog/oauth",
            token_url: "https://graph.facebook.com/v18.0/oauth/access_token",
            profile_url: Some("https://graph.facebook.com/me?fields=id,name,picture"),
            scopes: &["pages_manage_posts", "pages_read_engagement", "pages_show_list"],
        },
        Platform::Instagram => Endpoints {
            authorization_url: "https://api.instagram.com/oauth/authorize",
            token_url: "https://api.instagram.com/oauth/access_token",
            profile_url: Some("https://graph.instagram.com/me?fields=id,username"),
            scopes: &["instagram_basic", "instagram_content_publish"],
        },
        Platform::Twitter => Endpoints {
            authorization_url: "https://twitter.com/i/oauth2/authorize",
            token_url: "https://api.twitter.com/2/oauth2/token",
            profile_url: Some("https://api.twitter.com/2/users/me?user.fields=profile_image_url"),
            scopes: &["tweet.read", "tweet.write", "users.read", "offline.access"],
        },
        Platform::Linkedin => Endpoints {
            authorization_url: "https://www.linkedin.com/oauth/v2/authorization",
            token_url: "https://www.linkedin.com/oauth/v2/accessToken",
            profile_url: Some("https://api.linkedin.com/v2/userinfo"),
            scopes: &["openid", "profile", "w_member_social"],
        },
        Platform::Youtube => Endpoints {
            authorization_url: "https://accounts.google.com/o/oauth2/v2/auth",
            token_url: "https://oauth2.googleapis.com/token",
            profile_url: Some("https://www.googleapis.com/oauth2/v3/userinfo"),
            scopes: &[
                "https://www.googleapis.com/auth/youtube.upload",
                "https://www.googleapis.com/auth/youtube.readonly",
            ],
        },
        Platform::Tiktok => Endpoints {
            authorization_url: "https://www.tiktok.com/v2/auth/authorize/",
            token_url: "https://open.tiktokapis.com/v2/oauth/token/",
            profile_url: None,
            scopes: &["user.info.basic", "video.publish"],
        },
    }
}

/// Callback URL for a platform under the given public base URL.
pub fn redirect_uri_for(callback_base_url: &str, platform: Platform) -> String {
    format!(
        "{}/api/connections/{}/callback",
        callback_base_url.trim_end_matches('/'),
        platform.id()
    )
}

/// Static mapping from platform to provider configuration.
#[derive(Clone, Debug, Default)]
pub struct ProviderRegistry {
    providers: HashMap<Platform, ProviderConfig>,
}

impl ProviderRegistry {
    /// Build a registry from explicit provider configurations.
    pub fn new(configs: impl IntoIterator<Item = ProviderConfig>) -> Self {
        Self {
            providers: configs.into_iter().map(|c| (c.platform, c)).collect(),
        }
    }

    /// Build the registry from application config.
    ///
    /// Platforms without both a client id and a client secret are left out
    /// and report `UnknownPlatform` on lookup.
    pub fn from_config(config: &AppConfig) -> Self {
        let configs = config.providers.iter().filter_map(|(platform, settings)| {
            let provider =
                Self::resolve(*platform, settings, &config.server.callback_base_url);
            if provider.is_none() {
                tracing::warn!(
                    platform = %platform,
                    "Provider settings present but client id or secret missing, platform disabled"
                );
            }
            provider
        });

        Self::new(configs)
    }

    fn resolve(
        platform: Platform,
        settings: &ProviderSettings,
        callback_base_url: &str,
    ) -> Option<ProviderConfig> {
        let client_id = settings.client_id.clone().filter(|id| !id.is_empty())?;
        let client_secret = settings.client_secret.clone().filter(|s| !s.is_empty())?;
        let defaults = default_endpoints(platform);

        Some(ProviderConfig {
            platform,
            name: platform.display_name().to_string(),
            authorization_url: settings
                .authorization_url
                .clone()
                .unwrap_or_else(|| defaults.authorization_url.to_string()),
            token_url: settings
                .token_url
                .clone()
                .unwrap_or_else(|| defaults.token_url.to_string()),
            profile_url: settings
                .profile_url
                .clone()
                .or_else(|| defaults.profile_url.map(str::to_string)),
            client_id,
            client_secret,
            redirect_uri: redirect_uri_for(callback_base_url, platform),
            scopes: settings.scopes.clone().unwrap_or_else(|| {
                defaults.scopes.iter().map(|s| s.to_string()).collect()
            }),
        })
    }

    /// Get the provider configuration for a platform
    pub fn lookup(&self, platform: Platform) -> Result<&ProviderConfig> {
        self.providers
            .get(&platform)
            .ok_or_else(|| Error::UnknownPlatform(platform.id().to_string()))
    }

    /// Parse a platform identifier and look it up
    pub fn lookup_id(&self, platform_id: &str) -> Result<&ProviderConfig> {
        let platform: Platform = platform_id.parse()?;
        self.lookup(platform)
    }

    pub fn is_registered(&self, platform: Platform) -> bool {
        self.providers.contains_key(&platform)
    }

    /// Registered platforms in display order
    pub fn registered(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|p| self.providers.contains_key(p))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProviderConfig {
        ProviderConfig {
            platform: Platform::Facebook,
            name: "Facebook".to_string(),
            authorization_url: "https://example.com/oauth/authorize".to_string(),
            token_url: "https://example.com/oauth/token".to_string(),
            profile_url: None,
            client_id: "test_client_id".to_string(),
            client_secret: Secret::new("test_secret"),
            redirect_uri: "http://localhost:3000/callback".to_string(),
            scopes: vec!["read".to_string(), "write".to_string()],
        }
    }

    #[test]
    fn test_build_auth_url() {
        let url = test_config().build_auth_url("random_state");

        assert!(url.starts_with("https://example.com/oauth/authorize?"));
        assert!(url.contains("client_id=test_client_id"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A3000%2Fcallback"));
        // URL encoding converts spaces to %20
        assert!(url.contains("scope=read%20write"));
        assert!(url.contains("state=random_state"));
        assert!(url.contains("response_type=code"));
        assert!(!url.contains("test_secret"));
    }

    #[test]
    fn test_build_auth_url_with_existing_query() {
        let mut config = test_config();
        config.authorization_url = "https://example.com/authorize?prompt=consent".to_string();

        let url = config.build_auth_url("s");
        assert!(url.starts_with("https://example.com/authorize?prompt=consent&client_id="));
    }

    #[test]
    fn test_from_config_requires_client_credentials() {
        let mut app = AppConfig::default();
        app.server.callback_base_url = "https://app.example.com/".to_string();
        app.providers.insert(
            Platform::Facebook,
            ProviderSettings {
                client_id: Some("fb".to_string()),
                client_secret: Some(Secret::new("fb-secret")),
                ..Default::default()
            },
        );
        app.providers.insert(
            Platform::Twitter,
            ProviderSettings {
                client_id: Some("tw".to_string()),
                client_secret: None,
                ..Default::default()
            },
        );

        let registry = ProviderRegistry::from_config(&app);

        let facebook = registry.lookup(Platform::Facebook).unwrap();
        assert_eq!(
            facebook.token_url,
            "https://graph.facebook.com/v18.0/oauth/access_token"
        );
        assert_eq!(
            facebook.redirect_uri,
            "https://app.example.com/api/connections/facebook/callback"
        );
        assert_eq!(facebook.scopes.len(), 3);

        assert!(matches!(
            registry.lookup(Platform::Twitter),
            Err(Error::UnknownPlatform(_))
        ));
        assert_eq!(registry.registered(), vec![Platform::Facebook]);
    }

    #[test]
    fn test_overrides_replace_defaults() {
        let mut app = AppConfig::default();
        app.providers.insert(
            Platform::Linkedin,
            ProviderSettings {
                client_id: Some("li".to_string()),
                client_secret: Some(Secret::new("li-secret")),
                token_url: Some("http://127.0.0.1:9999/token".to_string()),
                scopes: Some(vec!["w_member_social".to_string()]),
                ..Default::default()
            },
        );

        let registry = ProviderRegistry::from_config(&app);
        let linkedin = registry.lookup(Platform::Linkedin).unwrap();
        assert_eq!(linkedin.token_url, "http://127.0.0.1:9999/token");
        assert_eq!(linkedin.scopes, vec!["w_member_social".to_string()]);
        assert_eq!(
            linkedin.authorization_url,
            "https://www.linkedin.com/oauth/v2/authorization"
        );
    }

    #[test]
    fn test_lookup_id() {
        let registry = ProviderRegistry::new([test_config()]);

        assert!(registry.lookup_id("facebook").is_ok());
        assert!(matches!(
            registry.lookup_id("friendster"),
            Err(Error::UnknownPlatform(ref id)) if id == "friendster"
        ));
        assert!(matches!(
            registry.lookup_id("tiktok"),
            Err(Error::UnknownPlatform(_))
        ));
    }
}
