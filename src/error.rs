//! Error taxonomy for the connection lifecycle.
//!
//! Every variant is safe to log: token material is never formatted into an
//! error. Provider bodies are only carried for non-success responses, and
//! are truncated.

use crate::platform::Platform;
use std::fmt;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Maximum number of provider body characters kept in an error message.
const MAX_PROVIDER_BODY: usize = 256;

/// Whether a failure is expected to clear on its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureCause {
    /// Network error, timeout, or provider-side outage. Retried on the next
    /// scheduler pass.
    Transient,
    /// The provider rejected the grant. The user must reconnect.
    Terminal,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Transient => f.write_str("transient"),
            FailureCause::Terminal => f.write_str("terminal"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown or unconfigured platform '{0}'")]
    UnknownPlatform(String),

    #[error("OAuth state does not match any pending connection")]
    CorrelationMismatch,

    #[error("OAuth state has expired")]
    CorrelationExpired,

    #[error("Callback is missing the 'code' or 'state' parameter")]
    MissingCallbackParameters,

    /// The provider redirected back with `error=...` instead of a code.
    #[error("{platform} denied authorization: {reason}")]
    ProviderDenied { platform: Platform, reason: String },

    #[error("Token exchange with {platform} failed ({cause}, status {}): {message}", status_label(.status))]
    ExchangeFailed {
        platform: Platform,
        cause: FailureCause,
        status: Option<u16>,
        message: String,
    },

    #[error("Token refresh with {platform} failed ({cause}, status {}): {message}", status_label(.status))]
    RefreshFailed {
        platform: Platform,
        cause: FailureCause,
        status: Option<u16>,
        message: String,
    },

    #[error("Encryption failure: {0}")]
    Encryption(String),

    #[error("No active {platform} connection for user '{user_id}'")]
    NotFound { user_id: String, platform: Platform },

    #[error("Credential storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    }
}

/// Truncates a provider response body for inclusion in an error message.
pub(crate) fn truncate_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_PROVIDER_BODY {
        return trimmed.to_string();
    }
    let mut out: String = trimmed.chars().take(MAX_PROVIDER_BODY).collect();
    out.push_str("...");
    out
}

impl Error {
    /// Failure cause for exchange and refresh errors.
    pub fn cause(&self) -> Option<FailureCause> {
        match self {
            Error::ExchangeFailed { cause, .. } | Error::RefreshFailed { cause, .. } => {
                Some(*cause)
            }
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.cause() == Some(FailureCause::Terminal)
    }

    pub fn is_transient(&self) -> bool {
        self.cause() == Some(FailureCause::Transient)
    }

    /// Error code reported back to the connections view after a callback.
    ///
    /// The set is closed: `missing_parameters`, `invalid_state`,
    /// `connection_failed`, or `<platform>_error`.
    pub fn callback_code(&self) -> String {
        match self {
            Error::MissingCallbackParameters => "missing_parameters".to_string(),
            Error::CorrelationMismatch | Error::CorrelationExpired => "invalid_state".to_string(),
            Error::ProviderDenied { platform, .. } => format!("{}_error", platform.id()),
            _ => "connection_failed".to_string(),
        }
    }

    /// Short, specific message suitable for showing to the user.
    pub fn user_message(&self) -> String {
        match self {
            Error::UnknownPlatform(id) => format!("'{}' is not a supported platform.", id),
            Error::CorrelationMismatch => {
                "This connection link is not valid. Start the connection again.".to_string()
            }
            Error::CorrelationExpired => {
                "This connection link has expired. Start the connection again.".to_string()
            }
            Error::MissingCallbackParameters => {
                "The platform returned an incomplete response. Start the connection again."
                    .to_string()
            }
            Error::ProviderDenied { platform, .. } => format!(
                "{} did not grant access. Connect your {} account again to retry.",
                platform.display_name(),
                platform.display_name()
            ),
            Error::ExchangeFailed { platform, cause, .. } => match cause {
                FailureCause::Transient => format!(
                    "{} is not responding. Try connecting again in a few minutes.",
                    platform.display_name()
                ),
                FailureCause::Terminal => format!(
                    "{} rejected the connection. Connect your {} account again.",
                    platform.display_name(),
                    platform.display_name()
                ),
            },
            Error::RefreshFailed { platform, cause, .. } => match cause {
                FailureCause::Transient => format!(
                    "{} is temporarily unavailable. We will retry automatically.",
                    platform.display_name()
                ),
                FailureCause::Terminal => format!(
                    "Your {} access has expired. Reconnect your {} account.",
                    platform.display_name(),
                    platform.display_name()
                ),
            },
            Error::NotFound { platform, .. } => {
                format!("Your {} account is not connected.", platform.display_name())
            }
            Error::Encryption(_) | Error::Storage(_) | Error::Internal(_) => {
                "Something went wrong on our side. Try again later.".to_string()
            }
        }
    }
}
