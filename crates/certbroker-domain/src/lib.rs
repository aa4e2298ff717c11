//! Who may request certificates for which names
//!
//! Domains form a hierarchy by DNS suffix. A user reaches the domains they
//! own or were delegated, plus every registered descendant of those. The
//! [`permissions`] module decides what the user may do with each one;
//! [`service::DomainService`] applies those decisions to the store inside a
//! single transaction per operation.

pub mod eab;
pub mod error;
pub mod permissions;
pub mod service;
pub mod suffix;

pub use eab::{EabCredentials, EabPermissionCheck, EabService};
pub use error::{DomainError, ErrorKind, Result};
pub use permissions::{compute_permissions, AccessContext, Coverage, Permissions};
pub use service::{
    access_context, upsert_domains, upsert_requested_domains, DomainEntry, DomainService, PermissionCheck,
    RegistrationStatus,
};
