//! DNS client errors

use thiserror::Error;

/// TSIG signing and verification errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TsigError {
    #[error("Unsupported TSIG algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Invalid TSIG secret: {0}")]
    InvalidSecret(String),

    #[error("Invalid TSIG key name: {0}")]
    InvalidKeyName(String),

    /// Missing, mismatched, stale or out-of-order response signature
    #[error("TSIG signature mismatch")]
    BadSignature,
}

/// Errors returned by the zone client
#[derive(Debug, Error)]
pub enum DnsError {
    /// Network failure during an exchange
    #[error("I/O error talking to {server}: {source}")]
    Io {
        server: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Exchange with {0} timed out")]
    Timeout(String),

    /// Well-formed response with a non-success RCODE
    #[error("Server returned {0}")]
    Rcode(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Zone transfer did not start with SOA")]
    SoaMissing,

    #[error("No DNS zone configured for {0}")]
    NoZone(String),

    #[error("TSIG error: {0}")]
    Tsig(#[from] TsigError),
}

impl From<hickory_proto::error::ProtoError> for DnsError {
    fn from(err: hickory_proto::error::ProtoError) -> Self {
        DnsError::Protocol(err.to_string())
    }
}

impl DnsError {
    /// True for failures of the network exchange itself, as opposed to
    /// answers the server gave
    pub fn is_exchange_error(&self) -> bool {
        matches!(self, DnsError::Io { .. } | DnsError::Timeout(_))
    }
}
