//! Authentication middleware
//!
//! Resolves every request before its handler runs and stores the
//! [`Resolution`] as a request extension. After the handler, the resolver's
//! response step decides the auth headers merged into the response.

use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};
use devicetoken_auth::{Account, AuthHeaders, Credentials, Resolution};
use devicetoken_core::{ClientId, HeaderNames};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Response extension set by handlers that require a rotation even when
/// per-request rotation is disabled
#[derive(Debug, Clone, Copy)]
pub struct ForceRotation;

/// Extract credentials from headers, falling back to query parameters of the
/// same names
pub fn extract_credentials(names: &HeaderNames, headers: &HeaderMap, uri: &Uri) -> Credentials {
    let query = Query::<HashMap<String, String>>::try_from_uri(uri)
        .map(|Query(params)| params)
        .unwrap_or_default();

    let lookup = |name: &str| -> Option<String> {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .or_else(|| query.get(name).cloned())
    };

    let token = lookup(&names.access_token);
    let client = lookup(&names.client);
    Credentials::from_parts(token.as_deref(), client.as_deref())
}

/// Run the resolver around a request
pub async fn authenticate(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let credentials = extract_credentials(state.header_names(), request.headers(), request.uri());
    let session = state.sessions.session_account(request.headers());

    let resolution = match state.auth.resolve(&credentials, session.as_ref()).await {
        Ok(resolution) => resolution,
        Err(e) => return ApiError::from(e).into_response(),
    };
    request.extensions_mut().insert(resolution.clone());

    let mut response = next.run(request).await;
    if response.status() == StatusCode::UNAUTHORIZED {
        return response;
    }

    let force_rotation = response.extensions().get::<ForceRotation>().is_some();
    match state.auth.finish(&resolution, force_rotation).await {
        Ok(Some(headers)) => {
            apply_headers(response.headers_mut(), state.header_names(), &headers)
        }
        Ok(None) => {}
        Err(e) => return ApiError::from(e).into_response(),
    }
    response
}

fn apply_headers(target: &mut HeaderMap, names: &HeaderNames, headers: &AuthHeaders) {
    for (name, value) in headers.to_pairs(names) {
        match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                target.insert(name, value);
            }
            _ => warn!("Skipping unrepresentable auth header {}", name),
        }
    }
    debug!("Attached auth headers for client {}", headers.client);
}

/// The authenticated identity of a request, or 401
pub fn require_auth(resolution: &Resolution) -> Result<(&Account, &ClientId), ApiError> {
    match (resolution.account(), resolution.client_id()) {
        (Some(account), Some(client_id)) => Ok((account, client_id)),
        _ => Err(ApiError::Unauthorized),
    }
}
