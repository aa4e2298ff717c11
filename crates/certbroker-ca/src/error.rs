//! CA client errors

use thiserror::Error;

/// Code the CA returns from collect while an order is still being processed
pub const CODE_STILL_PROCESSING: i64 = -1400;

/// Code the CA returns when revoking a certificate that is already revoked
pub const CODE_ALREADY_REVOKED: i64 = -1101;

/// Errors returned by the CA API
#[derive(Debug, Error)]
pub enum CaError {
    /// Network or TLS failure talking to the CA
    #[error("CA request failed: {0}")]
    Transport(String),

    #[error("CA request timed out")]
    Timeout,

    /// Error response from the CA
    #[error("CA returned HTTP {status}: {description} (code {code})")]
    Api {
        status: u16,
        code: i64,
        description: String,
    },

    #[error("Unexpected CA response: {0}")]
    Decode(String),

    #[error("Invalid CA configuration: {0}")]
    Configuration(String),
}

impl CaError {
    pub fn code(&self) -> Option<i64> {
        match self {
            CaError::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Collect was called before the certificate was ready
    pub fn is_still_processing(&self) -> bool {
        self.code() == Some(CODE_STILL_PROCESSING)
    }

    pub fn is_already_revoked(&self) -> bool {
        self.code() == Some(CODE_ALREADY_REVOKED)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CaError::Api { status: 404, .. })
    }

    /// Errors worth retrying later (network trouble, CA-side 5xx)
    pub fn is_transient(&self) -> bool {
        match self {
            CaError::Transport(_) | CaError::Timeout => true,
            CaError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for CaError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CaError::Timeout
        } else if err.is_decode() {
            CaError::Decode(err.to_string())
        } else {
            CaError::Transport(err.to_string())
        }
    }
}
