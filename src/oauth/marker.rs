//! Tamper-evident browser marker for a pending OAuth state.
//!
//! The marker is the state value and platform sealed with AES-256-GCM under
//! the master key. It rides in an `HttpOnly` cookie scoped to the callback
//! path. On callback the presented `state` must equal the sealed value, which
//! ties the callback to the browser that started the connection.

use crate::credentials::TokenCipher;
use crate::error::{Error, Result};
use crate::oauth::CorrelationToken;
use crate::platform::Platform;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Cookie carrying the sealed marker
pub const MARKER_COOKIE: &str = "postpilot_oauth_state";

/// Cookie path; the marker is only sent to the connection endpoints
const COOKIE_PATH: &str = "/api/connections";

#[derive(Clone)]
pub struct CorrelationMarker {
    cipher: Arc<TokenCipher>,
}

impl CorrelationMarker {
    pub fn new(cipher: Arc<TokenCipher>) -> Self {
        Self { cipher }
    }

    /// Seals a token into a cookie-safe string
    pub fn seal(&self, token: &CorrelationToken) -> Result<String> {
        let payload = format!("{}:{}", token.platform.id(), token.value);
        let sealed = self.cipher.seal_bytes(payload.as_bytes())?;
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Opens a marker, returning the platform and state value it binds
    pub fn open(&self, marker: &str) -> Result<(Platform, String)> {
        let sealed = URL_SAFE_NO_PAD
            .decode(marker.trim())
            .map_err(|_| Error::CorrelationMismatch)?;
        let payload = self
            .cipher
            .open_bytes(&sealed)
            .map_err(|_| Error::CorrelationMismatch)?;
        let payload = String::from_utf8(payload).map_err(|_| Error::CorrelationMismatch)?;

        let (platform, value) = payload.split_once(':').ok_or(Error::CorrelationMismatch)?;
        let platform: Platform = platform.parse().map_err(|_| Error::CorrelationMismatch)?;

        Ok((platform, value.to_string()))
    }

    /// Checks that `state` arriving for `platform` matches the browser's marker
    pub fn check(&self, marker: Option<&str>, platform: Platform, state: &str) -> Result<()> {
        let marker = marker.ok_or(Error::CorrelationMismatch)?;
        let (sealed_platform, sealed_value) = self.open(marker)?;

        let same_value: bool = sealed_value.as_bytes().ct_eq(state.as_bytes()).into();
        if !same_value || sealed_platform != platform {
            return Err(Error::CorrelationMismatch);
        }

        Ok(())
    }
}

/// `Set-Cookie` value installing the marker
pub fn marker_cookie(marker: &str, max_age_seconds: i64) -> String {
    format!(
        "{}={}; Path={}; Max-Age={}; HttpOnly; Secure; SameSite=Lax",
        MARKER_COOKIE, marker, COOKIE_PATH, max_age_seconds
    )
}

/// `Set-Cookie` value removing the marker
pub fn clear_marker_cookie() -> String {
    format!(
        "{}=; Path={}; Max-Age=0; HttpOnly; Secure; SameSite=Lax",
        MARKER_COOKIE, COOKIE_PATH
    )
}

/// Finds the marker in a `Cookie` request header value
pub fn find_marker(cookie_header: &str) -> Option<&str> {
    cookie_header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == MARKER_COOKIE).then_some(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn marker() -> CorrelationMarker {
        CorrelationMarker::new(Arc::new(TokenCipher::from_bytes(&[3u8; 32]).unwrap()))
    }

    fn token(platform: Platform, value: &str) -> CorrelationToken {
        CorrelationToken {
            value: value.to_string(),
            platform,
            user_id: "user1".to_string(),
            created_at: Utc::now(),
            expires_at: Utc::now(),
        }
    }

    #[test]
    fn test_seal_and_check() {
        let marker = marker();
        let sealed = marker.seal(&token(Platform::Facebook, "xyz")).unwrap();

        assert!(!sealed.contains("xyz"));
        assert!(marker.check(Some(&sealed), Platform::Facebook, "xyz").is_ok());
    }

    #[test]
    fn test_check_rejects_other_state_or_platform() {
        let marker = marker();
        let sealed = marker.seal(&token(Platform::Facebook, "xyz")).unwrap();

        assert!(matches!(
            marker.check(Some(&sealed), Platform::Facebook, "forged"),
            Err(Error::CorrelationMismatch)
        ));
        assert!(matches!(
            marker.check(Some(&sealed), Platform::Instagram, "xyz"),
            Err(Error::CorrelationMismatch)
        ));
        assert!(matches!(
            marker.check(None, Platform::Facebook, "xyz"),
            Err(Error::CorrelationMismatch)
        ));
    }

    #[test]
    fn test_tampered_marker_rejected() {
        let marker = marker();
        let sealed = marker.seal(&token(Platform::Tiktok, "abc")).unwrap();

        let mut bytes = URL_SAFE_NO_PAD.decode(&sealed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = URL_SAFE_NO_PAD.encode(bytes);

        assert!(marker.open(&tampered).is_err());
        assert!(marker.open("not a marker").is_err());
    }

    #[test]
    fn test_marker_from_other_key_rejected() {
        let sealed = marker().seal(&token(Platform::Twitter, "abc")).unwrap();
        let other =
            CorrelationMarker::new(Arc::new(TokenCipher::from_bytes(&[4u8; 32]).unwrap()));

        assert!(other.check(Some(&sealed), Platform::Twitter, "abc").is_err());
    }

    #[test]
    fn test_cookie_helpers() {
        let cookie = marker_cookie("sealed-value", 600);
        assert!(cookie.starts_with("postpilot_oauth_state=sealed-value;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Max-Age=600"));
        assert!(clear_marker_cookie().contains("Max-Age=0"));

        let header = "theme=dark; postpilot_oauth_state=abc123; other=1";
        assert_eq!(find_marker(header), Some("abc123"));
        assert_eq!(find_marker("theme=dark"), None);
    }
}
