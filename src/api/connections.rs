//! Connections API endpoints.
//!
//! The browser-facing half of the OAuth flow (`connect` and `callback`
//! answer with redirects) plus JSON endpoints for the dashboard.

use crate::auth::{resolve_user_id, IdentityError};
use crate::connections::{CallbackOutcome, CallbackParams, ConnectionService, PlatformStatus};
use crate::credentials::Credential;
use crate::error::{Error, FailureCause};
use crate::oauth::{clear_marker_cookie, find_marker, marker_cookie};
use crate::platform::Platform;
use crate::refresh::RefreshOutcome;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Redirect, Response},
    routing::{delete, get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};


/// Shared application state for the connections API
#[derive(Clone)]
pub struct ConnectionsAppState {
    pub service: Arc<ConnectionService>,
    pub auth_enabled: bool,
    /// Dashboard page the callback returns the browser to
    pub connections_url: String,
}

#[derive(Serialize)]
pub struct ListPlatformsResponse {
    pub platforms: Vec<PlatformStatus>,
}

#[derive(Serialize)]
pub struct ListConnectionsResponse {
    pub connections: Vec<Credential>,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub platform: Platform,
    pub history: Vec<Credential>,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct RefreshResponse {
    pub platform: Platform,
    /// `refreshed`, `not_refreshable`, `not_due` or `discarded`
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl RefreshResponse {
    fn new(platform: Platform, outcome: RefreshOutcome) -> Self {
        let (status, expires_at) = match outcome {
            RefreshOutcome::Refreshed { expires_at } => ("refreshed", expires_at),
            RefreshOutcome::NotDue => ("not_due", None),
            RefreshOutcome::NotRefreshable => ("not_refreshable", None),
            RefreshOutcome::Discarded => ("discarded", None),
        };
        Self {
            platform,
            status,
            expires_at,
        }
    }
}

#[derive(Serialize)]
pub struct DisconnectResponse {
    pub success: bool,
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
}

/// Application error for the JSON endpoints
enum AppError {
    Unauthorized(IdentityError),
    Domain(Error),
}

impl From<IdentityError> for AppError {
    fn from(e: IdentityError) -> Self {
        AppError::Unauthorized(e)
    }
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        AppError::Domain(e)
    }
}

/// Status and machine-readable code for a domain error
fn error_status(e: &Error) -> (StatusCode, &'static str) {
    match e {
        Error::UnknownPlatform(_) => (StatusCode::NOT_FOUND, "unknown_platform"),
        Error::NotFound { .. } => (StatusCode::NOT_FOUND, "not_connected"),
        Error::CorrelationMismatch | Error::CorrelationExpired => {
            (StatusCode::BAD_REQUEST, "invalid_state")
        }
        Error::MissingCallbackParameters => (StatusCode::BAD_REQUEST, "missing_parameters"),
        Error::ProviderDenied { .. } => (StatusCode::BAD_REQUEST, "provider_denied"),
        Error::RefreshFailed {
            cause: FailureCause::Terminal,
            ..
        } => (StatusCode::CONFLICT, "reconnect_required"),
        Error::ExchangeFailed {
            cause: FailureCause::Terminal,
            ..
        } => (StatusCode::BAD_GATEWAY, "provider_rejected"),
        Error::ExchangeFailed { .. } | Error::RefreshFailed { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "provider_unavailable")
        }
        Error::Encryption(_) | Error::Storage(_) | Error::Internal(_) => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Unauthorized(e) => (
                StatusCode::UNAUTHORIZED,
                ErrorResponse {
                    error: "unauthorized",
                    message: e.to_string(),
                },
            ),
            AppError::Domain(e) => {
                let (status, code) = error_status(&e);
                if status.is_server_error() {
                    error!(error = %e, "Request failed");
                }
                (
                    status,
                    ErrorResponse {
                        error: code,
                        message: e.user_message(),
                    },
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

/// Create connections API router
pub fn create_connections_router(state: ConnectionsAppState) -> Router {
    Router::new()
        .route("/api/platforms", get(list_platforms))
        .route("/api/connections", get(list_connections))
        .route("/api/connections/:platform", delete(disconnect))
        .route("/api/connections/:platform/connect", get(connect))
        .route("/api/connections/:platform/callback", get(callback))
        .route("/api/connections/:platform/refresh", post(refresh))
        .route("/api/connections/:platform/history", get(history))
        .with_state(Arc::new(state))
}

/// GET /api/platforms - Supported platforms and whether each is configured
async fn list_platforms(
    State(state): State<Arc<ConnectionsAppState>>,
) -> Json<ListPlatformsResponse> {
    Json(ListPlatformsResponse {
        platforms: state.service.platforms(),
    })
}

/// GET /api/connections - Active connections for the caller
async fn list_connections(
    State(state): State<Arc<ConnectionsAppState>>,
    headers: HeaderMap,
) -> Result<Json<ListConnectionsResponse>, AppError> {
    let user_id = resolve_user_id(&headers, state.auth_enabled)?;
    debug!(user_id = %user_id, "Listing connections");

    Ok(Json(ListConnectionsResponse {
        connections: state.service.list_active(&user_id)?,
    }))
}

/// GET /api/connections/:platform/connect
///
/// Redirects to the provider's consent page and installs the state marker
/// cookie.
async fn connect(
    State(state): State<Arc<ConnectionsAppState>>,
    Path(platform): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let user_id = resolve_user_id(&headers, state.auth_enabled)?;
    let platform: Platform = platform.parse()?;

    let redirect = state.service.connect(&user_id, platform)?;

    Ok((
        [(
            header::SET_COOKIE,
            marker_cookie(&redirect.marker, redirect.max_age_seconds),
        )],
        Redirect::temporary(&redirect.url),
    )
        .into_response())
}

/// GET /api/connections/:platform/callback
///
/// Provider redirect target. Always sends the browser back to the
/// connections view with `connected=<platform>` or `error=<code>`.
async fn callback(
    State(state): State<Arc<ConnectionsAppState>>,
    Path(platform): Path<String>,
    Query(params): Query<CallbackParams>,
    headers: HeaderMap,
) -> Response {
    let marker = headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(find_marker);

    let result = match platform.parse::<Platform>() {
        Ok(platform) => state.service.complete(platform, params, marker).await,
        Err(e) => Err(e),
    };

    match &result {
        Ok(credential) => info!(
            platform = %credential.platform,
            user_id = %credential.user_id,
            "Connection established"
        ),
        Err(e) => warn!(platform = %platform, error = %e, "OAuth callback failed"),
    }

    let target = CallbackOutcome::from_result(&result).redirect_target(&state.connections_url);

    (
        [(header::SET_COOKIE, clear_marker_cookie())],
        Redirect::temporary(&target),
    )
        .into_response()
}

/// POST /api/connections/:platform/refresh - Refresh now
async fn refresh(
    State(state): State<Arc<ConnectionsAppState>>,
    Path(platform): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RefreshResponse>, AppError> {
    let user_id = resolve_user_id(&headers, state.auth_enabled)?;
    let platform: Platform = platform.parse()?;

    let outcome = state.service.refresh_now(&user_id, platform).await?;

    Ok(Json(RefreshResponse::new(platform, outcome)))
}

/// DELETE /api/connections/:platform - Disconnect
async fn disconnect(
    State(state): State<Arc<ConnectionsAppState>>,
    Path(platform): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DisconnectResponse>, AppError> {
    let user_id = resolve_user_id(&headers, state.auth_enabled)?;
    let platform: Platform = platform.parse()?;

    state.service.disconnect(&user_id, platform)?;

    Ok(Json(DisconnectResponse { success: true }))
}

/// GET /api/connections/:platform/history - Every connection row, newest first
async fn history(
    State(state): State<Arc<ConnectionsAppState>>,
    Path(platform): Path<String>,
    headers: HeaderMap,
) -> Result<Json<HistoryResponse>, AppError> {
    let user_id = resolve_user_id(&headers, state.auth_enabled)?;
    let platform: Platform = platform.parse()?;

    Ok(Json(HistoryResponse {
        platform,
        history: state.service.history(&user_id, platform)?,
    }))
}
