//! Bearer token authentication
//!
//! Validates the `Authorization: Bearer <token>` header and makes the caller's
//! [`Identity`] available to handlers via Axum's Extension.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use certbroker_auth::{Identity, JwtError, JwtValidator};
use std::sync::Arc;
use tracing::debug;

use crate::error::{unauthorized, ApiError};

/// JWT validation state shared across middleware instances
#[derive(Clone)]
pub struct JwtState {
    pub validator: Arc<JwtValidator>,
}

impl JwtState {
    pub fn new(validator: JwtValidator) -> Self {
        Self {
            validator: Arc::new(validator),
        }
    }
}

/// Reject requests without a valid token, otherwise insert [`Identity`] into
/// the request extensions.
///
/// # Errors
/// Returns 401 Unauthorized if the header is missing or malformed, or the token
/// is invalid or expired.
pub async fn require_auth(
    State(state): State<Arc<JwtState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| unauthorized(JwtError::MissingToken))?;

    let identity: Identity = state.validator.identify(header).map_err(|e| {
        debug!("Rejected token: {}", e);
        unauthorized(e)
    })?;

    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}
