//! Database entities

pub mod certificate;
pub mod certificate_domain;
pub mod delegation;
pub mod domain;
pub mod eab_account;

pub mod prelude {
    pub use super::certificate::Entity as Certificate;
    pub use super::certificate_domain::Entity as CertificateDomain;
    pub use super::delegation::Entity as Delegation;
    pub use super::domain::Entity as Domain;
    pub use super::eab_account::Entity as EabAccount;
}
