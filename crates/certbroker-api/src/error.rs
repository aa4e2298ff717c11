//! Mapping of service errors onto HTTP responses
//!
//! Only locally produced messages reach the client verbatim. Upstream
//! failures are logged in full and answered with a fixed description.

use axum::{http::StatusCode, Json};
use certbroker_auth::JwtError;
use certbroker_cert::CertError;
use certbroker_dns::DnsError;
use certbroker_domain::{DomainError, ErrorKind};
use tracing::{error, warn};

use crate::models::ErrorResponse;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub type ApiResult<T> = Result<T, ApiError>;

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::UpstreamUnavailable | ErrorKind::UpstreamRejected => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Canceled => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn fixed_description(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::UpstreamUnavailable => "Upstream service unavailable",
        ErrorKind::UpstreamRejected => "Request rejected by the certificate authority",
        ErrorKind::Timeout => "Operation timed out",
        ErrorKind::Canceled => "Request canceled",
        _ => "Internal server error",
    }
}

fn is_local(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::InvalidInput | ErrorKind::Forbidden | ErrorKind::NotFound | ErrorKind::Conflict
    )
}

pub fn api_error(kind: ErrorKind, message: impl Into<String>) -> ApiError {
    (
        status_for(kind),
        Json(ErrorResponse {
            error: message.into(),
            code: Some(kind.code().to_string()),
        }),
    )
}

fn respond(kind: ErrorKind, err: &dyn std::fmt::Display) -> ApiError {
    if is_local(kind) {
        return api_error(kind, err.to_string());
    }
    if kind == ErrorKind::Internal {
        error!("Request failed: {}", err);
    } else {
        warn!(code = kind.code(), "Request failed: {}", err);
    }
    api_error(kind, fixed_description(kind))
}

pub fn domain_error(err: DomainError) -> ApiError {
    respond(err.kind(), &err)
}

pub fn cert_error(err: CertError) -> ApiError {
    let kind = err.kind();
    if let CertError::Aggregate { total, failures } = &err {
        warn!(code = kind.code(), "Request failed: {}", err);
        let items: Vec<&str> = failures.iter().map(|f| f.item.as_str()).collect();
        return api_error(
            kind,
            format!("{} of {} items failed: {}", failures.len(), total, items.join(", ")),
        );
    }
    respond(kind, &err)
}

pub fn dns_error(err: DnsError) -> ApiError {
    let kind = match &err {
        DnsError::InvalidRecord(_) => ErrorKind::InvalidInput,
        DnsError::NoZone(_) => ErrorKind::NotFound,
        DnsError::Timeout(_) => ErrorKind::Timeout,
        _ => ErrorKind::UpstreamUnavailable,
    };
    respond(kind, &err)
}

pub fn unauthorized(err: JwtError) -> ApiError {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: err.to_string(),
            code: Some(
                match err {
                    JwtError::MissingToken => "missing_token",
                    JwtError::TokenExpired => "token_expired",
                    _ => "invalid_token",
                }
                .to_string(),
            ),
        }),
    )
}
