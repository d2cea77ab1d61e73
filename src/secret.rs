//! Wrapper for values that must never reach logs or error messages.

use serde::{Deserialize, Deserializer};
use std::fmt;

/// A sensitive string (access token, refresh token, client secret).
///
/// `Debug` and `Display` print `[redacted]`. It can be read from config but
/// has no `Serialize` impl; the plaintext is only reachable through [`Secret::expose`].
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Secret)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let secret = Secret::new("gho_supersecret");
        assert_eq!(format!("{}", secret), "[redacted]");
        assert_eq!(format!("{:?}", secret), "Secret([redacted])");
        assert_eq!(secret.expose(), "gho_supersecret");
    }

    #[test]
    fn test_secret_in_struct_debug() {
        #[derive(Debug)]
        struct Holder {
            #[allow(dead_code)]
            token: Secret,
        }

        let holder = Holder {
            token: Secret::from("abc123"),
        };
        assert!(!format!("{:?}", holder).contains("abc123"));
    }
}
