//! Supported social platforms and their display metadata.
//!
//! The set is closed. Identifiers are parsed once at the edge; everything
//! past that point works with [`Platform`] instead of strings.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Things a connected account can be used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    PublishPosts,
    PublishMedia,
    PublishVideo,
    ReadAnalytics,
}

/// Static display metadata for a platform.
#[derive(Clone, Debug, Serialize)]
pub struct PlatformMetadata {
    pub id: &'static str,
    pub name: &'static str,
    /// Brand colour as a hex string.
    pub color: &'static str,
    pub capabilities: &'static [Capability],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Facebook,
    Instagram,
    Twitter,
    Linkedin,
    Youtube,
    Tiktok,
}

const FACEBOOK: PlatformMetadata = PlatformMetadata {
    id: "facebook",
    name: "Facebook",
    color: "#1877F2",
    capabilities: &[
        Capability::PublishPosts,
        Capability::PublishMedia,
        Capability::ReadAnalytics,
    ],
};

const INSTAGRAM: PlatformMetadata = PlatformMetadata {
    id: "instagram",
    name: "Instagram",
    color: "#E4405F",
    capabilities: &[Capability::PublishMedia, Capability::ReadAnalytics],
};

const TWITTER: PlatformMetadata = PlatformMetadata {
    id: "twitter",
    name: "X (Twitter)",
    color: "#000000",
    capabilities: &[Capability::PublishPosts, Capability::PublishMedia],
};

const LINKEDIN: PlatformMetadata = PlatformMetadata {
    id: "linkedin",
    name: "LinkedIn",
    color: "#0A66C2",
    capabilities: &[Capability::PublishPosts, Capability::PublishMedia],
};

const YOUTUBE: PlatformMetadata = PlatformMetadata {
    id: "youtube",
    name: "YouTube",
    color: "#FF0000",
    capabilities: &[Capability::PublishVideo, Capability::ReadAnalytics],
};

const TIKTOK: PlatformMetadata = PlatformMetadata {
    id: "tiktok",
    name: "TikTok",
    color: "#000000",
    capabilities: &[Capability::PublishVideo],
};

impl Platform {
    /// All platforms, in display order.
    pub const ALL: [Platform; 6] = [
        Platform::Facebook,
        Platform::Instagram,
        Platform::Twitter,
        Platform::Linkedin,
        Platform::Youtube,
        Platform::Tiktok,
    ];

    pub fn metadata(&self) -> &'static PlatformMetadata {
        match self {
            Platform::Facebook => &FACEBOOK,
            Platform::Instagram => &INSTAGRAM,
            Platform::Twitter => &TWITTER,
            Platform::Linkedin => &LINKEDIN,
            Platform::Youtube => &YOUTUBE,
            Platform::Tiktok => &TIKTOK,
        }
    }

    /// Lowercase identifier used in URLs, config keys and storage.
    pub fn id(&self) -> &'static str {
        self.metadata().id
    }

    pub fn display_name(&self) -> &'static str {
        self.metadata().name
    }

    /// Uppercase prefix for environment variables (`POSTPILOT_OAUTH_<PREFIX>_...`).
    pub fn env_prefix(&self) -> String {
        self.id().to_uppercase()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Platform::ALL
            .into_iter()
            .find(|p| p.id() == s)
            .ok_or_else(|| Error::UnknownPlatform(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_platforms() {
        for platform in Platform::ALL {
            assert_eq!(platform.id().parse::<Platform>().unwrap(), platform);
        }
    }

    #[test]
    fn test_unknown_platform_rejected() {
        let err = "myspace".parse::<Platform>().unwrap_err();
        assert!(matches!(err, Error::UnknownPlatform(ref id) if id == "myspace"));

        // Identifiers are case sensitive
        assert!("Facebook".parse::<Platform>().is_err());
        assert!("".parse::<Platform>().is_err());
    }

    #[test]
    fn test_serde_uses_lowercase_ids() {
        let json = serde_json::to_string(&Platform::Linkedin).unwrap();
        assert_eq!(json, "\"linkedin\"");

        let parsed: Platform = serde_json::from_str("\"tiktok\"").unwrap();
        assert_eq!(parsed, Platform::Tiktok);
    }

    #[test]
    fn test_metadata() {
        let meta = Platform::Facebook.metadata();
        assert_eq!(meta.name, "Facebook");
        assert!(meta.capabilities.contains(&Capability::PublishPosts));
        assert_eq!(Platform::Twitter.env_prefix(), "TWITTER");
    }
}
