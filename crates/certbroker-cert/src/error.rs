//! Certificate lifecycle errors

use std::fmt;
use std::time::Duration;

use certbroker_ca::CaError;
use certbroker_dns::DnsError;
use certbroker_domain::{DomainError, ErrorKind};
use sea_orm::DbErr;
use thiserror::Error;

/// One failed item of a fan-out operation
#[derive(Debug)]
pub struct ItemError {
    /// Serial, common name or domain the item was about
    pub item: String,
    pub error: CertError,
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.item, self.error)
    }
}

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("CA error: {0}")]
    Ca(#[from] CaError),

    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// The CA declined or rejected the order
    #[error("Rejected by CA: {0}")]
    Rejected(String),

    #[error("Timed out after {elapsed:?} waiting for {operation}{}", .last.as_deref().map(|l| format!(" (last error: {})", l)).unwrap_or_default())]
    Timeout {
        operation: String,
        elapsed: Duration,
        last: Option<String>,
    },

    #[error("Operation canceled")]
    Canceled,

    #[error("{} of {total} items failed: {}", .failures.len(), .failures.iter().map(ItemError::to_string).collect::<Vec<_>>().join("; "))]
    Aggregate {
        total: usize,
        failures: Vec<ItemError>,
    },

    #[error("Mail delivery failed: {0}")]
    Mail(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("Database error: {0}")]
    Database(#[from] DbErr),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CertError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CertError::InvalidInput(_) => ErrorKind::InvalidInput,
            CertError::Conflict(_) => ErrorKind::Conflict,
            CertError::Forbidden(_) => ErrorKind::Forbidden,
            CertError::NotFound(_) => ErrorKind::NotFound,
            CertError::Ca(e) if e.is_transient() => ErrorKind::UpstreamUnavailable,
            CertError::Ca(CaError::Api { .. }) => ErrorKind::UpstreamRejected,
            CertError::Ca(_) => ErrorKind::UpstreamUnavailable,
            CertError::Dns(_) | CertError::Mail(_) => ErrorKind::UpstreamUnavailable,
            CertError::Rejected(_) => ErrorKind::UpstreamRejected,
            CertError::Timeout { .. } => ErrorKind::Timeout,
            CertError::Canceled => ErrorKind::Canceled,
            CertError::Aggregate { failures, .. } => {
                let mut kinds = failures.iter().map(|f| f.error.kind());
                match kinds.next() {
                    Some(first) if kinds.all(|k| k == first) => first,
                    _ => ErrorKind::UpstreamUnavailable,
                }
            }
            CertError::Domain(e) => e.kind(),
            CertError::Database(_) | CertError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Fail with [`CertError::Aggregate`] if any item failed
    pub fn aggregate(total: usize, failures: Vec<ItemError>) -> Result<()> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CertError::Aggregate { total, failures })
        }
    }
}

pub type Result<T> = std::result::Result<T, CertError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(CertError::Canceled.kind(), ErrorKind::Canceled);
        assert_eq!(
            CertError::Ca(CaError::Timeout).kind(),
            ErrorKind::UpstreamUnavailable
        );
        assert_eq!(
            CertError::Ca(CaError::Api {
                status: 400,
                code: -1,
                description: "bad".into()
            })
            .kind(),
            ErrorKind::UpstreamRejected
        );
        assert_eq!(
            CertError::Domain(DomainError::Forbidden("x".into())).kind(),
            ErrorKind::Forbidden
        );
    }

    #[test]
    fn test_aggregate_message_and_kind() {
        let err = CertError::Aggregate {
            total: 3,
            failures: vec![
                ItemError {
                    item: "0a".into(),
                    error: CertError::NotFound("0a".into()),
                },
                ItemError {
                    item: "0b".into(),
                    error: CertError::NotFound("0b".into()),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.starts_with("2 of 3 items failed"));
        assert!(text.contains("0a: Not found: 0a"));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert!(CertError::aggregate(3, vec![]).is_ok());
    }

    #[test]
    fn test_timeout_message() {
        let err = CertError::Timeout {
            operation: "collect".into(),
            elapsed: Duration::from_secs(1),
            last: Some("still processing".into()),
        };
        assert_eq!(
            err.to_string(),
            "Timed out after 1s waiting for collect (last error: still processing)"
        );
    }
}
