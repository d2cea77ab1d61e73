//! Caller identity for the connections API.
//!
//! With auth enabled the user id is the bearer token itself
//! (`Authorization: Bearer <user id>`); an upstream gateway is expected to
//! have authenticated it. With auth disabled every request acts as
//! [`DEFAULT_USER`].

use axum::http::HeaderMap;
use thiserror::Error;


/// User id when auth is disabled
pub const DEFAULT_USER: &str = "default";

/// Longest user id accepted from a header
const MAX_USER_ID_LEN: usize = 128;

/// Resolve the calling user for a request
pub fn resolve_user_id(headers: &HeaderMap, auth_enabled: bool) -> Result<String, IdentityError> {
    if !auth_enabled {
        return Ok(DEFAULT_USER.to_string());
    }

    let user_id = extract_bearer_token(headers)?;

    if user_id.len() > MAX_USER_ID_LEN || user_id.chars().any(char::is_control) {
        return Err(IdentityError::InvalidFormat);
    }

    Ok(user_id)
}

/// Extract bearer token from HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <token>"
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, IdentityError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(IdentityError::Missing)?
        .to_str()
        .map_err(|_| IdentityError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

fn parse_bearer_token(header_value: &str) -> Result<String, IdentityError> {
    let (scheme, token) = header_value
        .split_once(' ')
        .ok_or(IdentityError::InvalidFormat)?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(IdentityError::InvalidFormat);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(IdentityError::Empty);
    }

    Ok(token.to_string())
}

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum IdentityError {
    #[error("Authorization token not provided")]
    Missing,
    /// Not "Bearer <token>", or not a usable user id
    #[error("Invalid authorization token format")]
    InvalidFormat,
    #[error("Authorization token is empty")]
    Empty,
}
