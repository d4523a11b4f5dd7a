//! HTTP request handlers
//!
//! Token validation, refresh, sign-out and device management endpoints. Every
//! route runs behind the authentication middleware; handlers read the
//! request's [`Resolution`] from its extensions.

use axum::{
    extract::{Path as AxumPath, State},
    http::HeaderMap,
    middleware,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use devicetoken_auth::{DeviceInfo, Resolution};
use devicetoken_core::ClientId;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::ApiError;
use crate::middleware::{authenticate, require_auth, ForceRotation};
use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Token lifecycle
        .route("/auth/validate_token", get(validate_token_handler))
        .route("/auth/refresh_token", post(refresh_token_handler))
        .route("/auth/sign_out", delete(sign_out_handler))
        .route("/auth/password_changed", post(password_changed_handler))
        // Device management API
        .route("/auth/devices", get(list_devices_handler))
        .route("/auth/devices/:client", delete(revoke_device_handler))
        // Protected resource
        .route("/api/me", get(me_handler))
        .layer(middleware::from_fn_with_state(state.clone(), authenticate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Identity echoed by the token endpoints
#[derive(Debug, Serialize)]
pub struct TokenIdentity {
    pub uid: String,
    pub client: String,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data,
        })
    }
}

fn identity(resolution: &Resolution) -> Result<TokenIdentity, ApiError> {
    let (account, client_id) = require_auth(resolution)?;
    Ok(TokenIdentity {
        uid: account.id.to_string(),
        client: client_id.to_string(),
    })
}

// ============================================================================
// Token Handlers
// ============================================================================

/// Check the presented token; rotation happens in the middleware
async fn validate_token_handler(
    Extension(resolution): Extension<Resolution>,
) -> Result<Json<ApiResponse<TokenIdentity>>, ApiError> {
    identity(&resolution).map(ApiResponse::ok)
}

/// Like validate, but always hands out a new token
async fn refresh_token_handler(
    Extension(resolution): Extension<Resolution>,
) -> Result<(Extension<ForceRotation>, Json<ApiResponse<TokenIdentity>>), ApiError> {
    let body = identity(&resolution).map(ApiResponse::ok)?;
    Ok((Extension(ForceRotation), body))
}

/// Revoke the current client's token and end the session, if any
async fn sign_out_handler(
    State(state): State<Arc<AppState>>,
    Extension(resolution): Extension<Resolution>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let (account, client_id) = require_auth(&resolution)?;
    state.auth.tokens().account(&account.id).revoke(client_id).await?;
    state.sessions.end_session(&headers);
    info!("Account {} signed out client {}", account.id, client_id);
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Serialize)]
pub struct RevokedCount {
    pub revoked: usize,
}

/// Apply password-change revocation; the password change itself happens
/// elsewhere
async fn password_changed_handler(
    State(state): State<Arc<AppState>>,
    Extension(resolution): Extension<Resolution>,
) -> Result<Json<ApiResponse<RevokedCount>>, ApiError> {
    let (account, client_id) = require_auth(&resolution)?;
    let revoked = state
        .auth
        .tokens()
        .account(&account.id)
        .password_changed(Some(client_id))
        .await?;
    Ok(ApiResponse::ok(RevokedCount { revoked }))
}

// ============================================================================
// Device Management Handlers
// ============================================================================

/// List the authenticated account's devices
async fn list_devices_handler(
    State(state): State<Arc<AppState>>,
    Extension(resolution): Extension<Resolution>,
) -> Result<Json<ApiResponse<Vec<DeviceInfo>>>, ApiError> {
    let (account, _) = require_auth(&resolution)?;
    let devices = state.auth.tokens().account(&account.id).devices().await?;
    Ok(ApiResponse::ok(devices))
}

/// Revoke one of the authenticated account's devices
async fn revoke_device_handler(
    State(state): State<Arc<AppState>>,
    Extension(resolution): Extension<Resolution>,
    AxumPath(client): AxumPath<String>,
) -> Result<Json<Value>, ApiError> {
    let (account, _) = require_auth(&resolution)?;
    let client_id = ClientId::new(client);
    let revoked = state.auth.tokens().account(&account.id).revoke(&client_id).await?;
    if !revoked {
        return Err(ApiError::NotFound(format!("device {}", client_id)));
    }
    Ok(Json(json!({ "success": true })))
}

// ============================================================================
// Protected Resource
// ============================================================================

#[derive(Debug, Serialize)]
pub struct Me {
    pub uid: String,
    pub name: String,
    pub client: String,
    pub token_auth: bool,
}

async fn me_handler(
    Extension(resolution): Extension<Resolution>,
) -> Result<Json<ApiResponse<Me>>, ApiError> {
    let (account, client_id) = require_auth(&resolution)?;
    Ok(ApiResponse::ok(Me {
        uid: account.id.to_string(),
        name: account.name.clone(),
        client: client_id.to_string(),
        token_auth: resolution.used_token_auth(),
    }))
}
