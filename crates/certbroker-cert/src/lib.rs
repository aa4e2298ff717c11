//! Certificate lifecycle: issuance, revocation, reconciliation and upkeep
//!
//! Everything that talks to the CA on behalf of a certificate lives here.
//! Long waits go through [`wait::wait_for`]; per-item work against the CA
//! goes through [`fanout::fan_out`], which caps concurrency and turns every
//! item failure into an entry of an aggregate error.

pub mod catalog;
pub mod error;
pub mod expiry;
pub mod fanout;
pub mod issuance;
pub mod scheduler;
pub mod smime;
pub mod sync;
pub mod validation;
pub mod wait;
pub mod x509;

pub use catalog::CertificateRecord;
pub use error::{CertError, ItemError, Result};
pub use expiry::{
    ExpiryNotice, ExpiryNotifier, ExpirySweep, Mailer, NotifyReport, NotifySettings, SmtpMailer,
    SmtpSettings,
};
#[cfg(any(test, feature = "mock"))]
pub use expiry::MockMailer;
pub use issuance::{
    CertificateOrchestrator, IssuanceSettings, IssueRequest, IssuedCertificate, RevokeOutcome,
    RevokeSelector,
};
pub use scheduler::{ScheduleSettings, Scheduler};
pub use smime::{SmimeIssueRequest, SmimeOrchestrator, SmimeRevokeSelector};
pub use sync::{CertificateSyncer, SyncReport, SyncSettings};
pub use validation::{DomainValidationOrchestrator, ValidationReport, ValidationSettings};
pub use x509::{parse_certificates, validate_csr, CsrInfo, ParsedCertificate};
pub use tokio_util::sync::CancellationToken;
