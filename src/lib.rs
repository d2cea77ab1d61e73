// Platform catalogue and secrets
pub mod platform;
pub mod secret;

// Configuration and errors
pub mod config;
pub mod error;

// SQLite helpers shared by the stores
pub mod db;

// OAuth flow: providers, state, token exchange
pub mod oauth;

// Encrypted credential storage
pub mod credentials;

// Background token refresh
pub mod refresh;

// Connection lifecycle and HTTP API
pub mod auth;
pub mod connections;
pub mod api;

pub use error::{Error, Result};
