//! OAuth 2.0 authorization-code machinery for platform connections.
//!
//! Implements the flow:
//! 1. User clicks "Connect" in the dashboard
//! 2. A single-use state is issued and sealed into a browser marker
//! 3. User is redirected to the provider and authorizes
//! 4. Provider redirects back with `code` + `state`
//! 5. Marker and state are verified, the code is exchanged for tokens
//! 6. Tokens are stored encrypted; the refresh scheduler keeps them fresh

mod exchange;
mod marker;
mod provider;
mod state_manager;
mod state_store;

pub use exchange::{classify_status, parse_profile, AccountProfile, TokenExchanger, Tokens};
pub use marker::{clear_marker_cookie, find_marker, marker_cookie, CorrelationMarker, MARKER_COOKIE};
pub use provider::{redirect_uri_for, ProviderConfig, ProviderRegistry};
pub use state_manager::{run_state_cleanup, StateManager, DEFAULT_STATE_LIFETIME_SECONDS};
pub use state_store::{
    CorrelationStore, CorrelationToken, MemoryCorrelationStore, SqliteCorrelationStore,
};
