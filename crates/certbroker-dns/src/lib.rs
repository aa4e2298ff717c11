//! DNS zone management over RFC 2136 dynamic update and AXFR
//!
//! Every outbound message is TSIG-signed through hickory's client streams.
//! Messages go over UDP when they fit in 512 bytes once signed and over TCP
//! otherwise; zone transfers always use TCP.
//!
//! [`DnsService`] is the boundary the rest of the system programs against.
//! [`ZoneClient`] implements it for a single zone and [`ZoneRouter`] fans out
//! to the most specific configured zone.

pub mod client;
pub mod error;
pub mod record;
pub mod router;
pub mod transport;
pub mod tsig;

#[cfg(test)]
mod testing;

use async_trait::async_trait;

pub use client::{ZoneClient, ZoneConfig};
pub use error::{DnsError, TsigError};
pub use record::{DnsRecord, RecordChange};
pub use router::ZoneRouter;
pub use tsig::{LegacyHmacSigner, TsigAlgorithm, TsigSigner};

/// Record management for a zone
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait DnsService: Send + Sync {
    async fn list(&self, zone: &str) -> Result<Vec<DnsRecord>, DnsError>;

    async fn add(&self, zone: &str, records: &[DnsRecord]) -> Result<(), DnsError>;

    async fn update(&self, zone: &str, changes: &[RecordChange]) -> Result<(), DnsError>;

    async fn delete(&self, zone: &str, records: &[DnsRecord]) -> Result<(), DnsError>;
}
