//! Certificate entity and its lifecycle state machine

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a certificate as reported by the CA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum CertificateStatus {
    /// Row created, CA not contacted yet
    #[sea_orm(string_value = "Init")]
    Init,

    #[sea_orm(string_value = "Requested")]
    Requested,

    /// Enrollment accepted by the CA
    #[sea_orm(string_value = "Applied")]
    Applied,

    #[sea_orm(string_value = "Approved")]
    Approved,

    /// Approved by a subscriber administrator
    #[sea_orm(string_value = "SAApproved")]
    SAApproved,

    #[sea_orm(string_value = "Issued")]
    Issued,

    #[sea_orm(string_value = "Revoked")]
    Revoked,

    #[sea_orm(string_value = "Expired")]
    Expired,

    #[sea_orm(string_value = "Replaced")]
    Replaced,

    #[sea_orm(string_value = "Declined")]
    Declined,

    #[sea_orm(string_value = "Rejected")]
    Rejected,

    #[sea_orm(string_value = "Invalid")]
    Invalid,

    /// Imported from the CA without a local enrollment
    #[sea_orm(string_value = "Unmanaged")]
    Unmanaged,
}

/// Returned when a status change is not allowed by the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: CertificateStatus,
    pub to: CertificateStatus,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "illegal certificate transition {} -> {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

impl CertificateStatus {
    /// Terminal states never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Revoked
                | Self::Expired
                | Self::Declined
                | Self::Rejected
                | Self::Invalid
                | Self::Replaced
        )
    }

    /// Certificate still counts as covering its SANs
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Revoked | Self::Expired | Self::Invalid)
    }

    /// Enrollment has been accepted locally but not yet resolved by the CA
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Init | Self::Requested | Self::Applied | Self::Approved | Self::SAApproved
        )
    }

    /// Validate moving from `self` to `to`.
    pub fn transition(self, to: CertificateStatus) -> Result<CertificateStatus, IllegalTransition> {
        use CertificateStatus::*;

        if self == to {
            return Ok(to);
        }

        let allowed = match (self, to) {
            (from, _) if from.is_terminal() => false,
            (_, Revoked) => true,
            (Unmanaged, _) => true,
            (Init | Requested, Requested | Applied | Approved | SAApproved | Issued) => true,
            (Applied | Approved | SAApproved, Applied | Approved | SAApproved | Issued) => true,
            (
                Init | Requested | Applied | Approved | SAApproved,
                Declined | Rejected | Invalid,
            ) => true,
            (Issued, Expired | Replaced) => true,
            _ => false,
        };

        if allowed {
            Ok(to)
        } else {
            Err(IllegalTransition { from: self, to })
        }
    }

    /// Map the CA's status text onto the lifecycle. Unknown values become
    /// `Unmanaged` so a sync never fails on a new CA status.
    pub fn from_ca_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().replace([' ', '_', '-'], "").as_str() {
            "init" => Self::Init,
            "requested" => Self::Requested,
            "applied" => Self::Applied,
            "approved" => Self::Approved,
            "saapproved" => Self::SAApproved,
            "issued" => Self::Issued,
            "revoked" => Self::Revoked,
            "expired" => Self::Expired,
            "replaced" => Self::Replaced,
            "declined" => Self::Declined,
            "rejected" => Self::Rejected,
            "invalid" => Self::Invalid,
            _ => Self::Unmanaged,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "Init",
            Self::Requested => "Requested",
            Self::Applied => "Applied",
            Self::Approved => "Approved",
            Self::SAApproved => "SAApproved",
            Self::Issued => "Issued",
            Self::Revoked => "Revoked",
            Self::Expired => "Expired",
            Self::Replaced => "Replaced",
            Self::Declined => "Declined",
            Self::Rejected => "Rejected",
            Self::Invalid => "Invalid",
            Self::Unmanaged => "Unmanaged",
        }
    }
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of certificate the row tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(8))")]
pub enum CertificateType {
    /// TLS server certificate
    #[sea_orm(string_value = "ssl")]
    Ssl,

    /// S/MIME client certificate
    #[sea_orm(string_value = "smime")]
    Smime,
}

impl CertificateType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ssl => "ssl",
            Self::Smime => "smime",
        }
    }
}

impl fmt::Display for CertificateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "certificates")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// CA-side numeric id, assigned on enrollment or backfilled by sync
    #[sea_orm(nullable)]
    pub ssl_id: Option<i64>,

    /// Normalized serial (lowercase hex, no separators), set once issued
    #[sea_orm(unique, nullable)]
    pub serial: Option<String>,

    pub common_name: String,

    pub status: CertificateStatus,

    pub certificate_type: CertificateType,

    #[sea_orm(nullable)]
    pub not_before: Option<ChronoDateTimeUtc>,

    #[sea_orm(nullable)]
    pub not_after: Option<ChronoDateTimeUtc>,

    /// Requesting user, or "<email> ..." as reported by the CA
    pub issued_by: String,

    /// Where the request came from (api, acme, sync)
    pub source: String,

    #[sea_orm(nullable)]
    pub created: Option<ChronoDateTimeUtc>,

    /// CSR in PEM format, used to detect duplicate in-flight requests
    #[sea_orm(column_type = "Text", nullable)]
    pub csr: Option<String>,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::certificate_domain::Entity")]
    CertificateDomain,
}

impl Related<super::certificate_domain::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CertificateDomain.def()
    }
}

impl Related<super::domain::Entity> for Entity {
    fn to() -> RelationDef {
        super::certificate_domain::Relation::Domain.def()
    }

    fn via() -> Option<RelationDef> {
        Some(super::certificate_domain::Relation::Certificate.def().rev())
    }
}

#[async_trait::async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        if insert {
            return Ok(self);
        }

        let Some(id) = self.id.try_as_ref() else {
            return Ok(self);
        };
        let Some(stored) = Entity::find_by_id(*id).one(db).await? else {
            return Ok(self);
        };

        if let Some(status) = self.status.try_as_ref() {
            stored
                .status
                .transition(*status)
                .map_err(|e| DbErr::Custom(e.to_string()))?;
        }

        if stored.status == CertificateStatus::Issued {
            if let Some(serial) = self.serial.try_as_ref() {
                if *serial != stored.serial {
                    return Err(DbErr::Custom(format!(
                        "certificate {} is issued; serial is immutable",
                        id
                    )));
                }
            }
            if let Some(not_after) = self.not_after.try_as_ref() {
                if *not_after != stored.not_after {
                    return Err(DbErr::Custom(format!(
                        "certificate {} is issued; not_after is immutable",
                        id
                    )));
                }
            }
        }

        Ok(self)
    }

    async fn before_delete<C>(self, _db: &C) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        Err(DbErr::Custom(
            "certificates are never deleted; change the status instead".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::CertificateStatus::*;
    use super::*;
    use sea_orm::Iterable;

    #[test]
    fn test_same_state_is_noop() {
        for status in CertificateStatus::iter() {
            assert_eq!(status.transition(status), Ok(status));
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        for from in CertificateStatus::iter().filter(|s| s.is_terminal()) {
            for to in CertificateStatus::iter().filter(|s| *s != from) {
                assert!(from.transition(to).is_err(), "{} -> {} allowed", from, to);
            }
        }
    }

    #[test]
    fn test_revoked_reachable_from_non_terminal() {
        for from in CertificateStatus::iter().filter(|s| !s.is_terminal()) {
            assert_eq!(from.transition(Revoked), Ok(Revoked));
        }
    }

    #[test]
    fn test_enrollment_path() {
        assert!(Requested.transition(Applied).is_ok());
        assert!(Applied.transition(Issued).is_ok());
        assert!(Approved.transition(Declined).is_ok());
        assert!(Issued.transition(Expired).is_ok());
        assert!(Issued.transition(Replaced).is_ok());
    }

    #[test]
    fn test_illegal_transitions() {
        assert_eq!(
            Revoked.transition(Issued),
            Err(IllegalTransition { from: Revoked, to: Issued })
        );
        assert!(Issued.transition(Requested).is_err());
        assert!(Issued.transition(Declined).is_err());
        assert!(Requested.transition(Expired).is_err());
        assert!(Unmanaged.transition(Issued).is_ok());
    }

    #[test]
    fn test_from_ca_status() {
        assert_eq!(CertificateStatus::from_ca_status("Issued"), Issued);
        assert_eq!(CertificateStatus::from_ca_status("SA Approved"), SAApproved);
        assert_eq!(CertificateStatus::from_ca_status("revoked"), Revoked);
        assert_eq!(CertificateStatus::from_ca_status("Not Enrolled"), Unmanaged);
    }

    #[test]
    fn test_liveness() {
        assert!(Issued.is_live());
        assert!(Requested.is_live());
        assert!(!Revoked.is_live());
        assert!(!Expired.is_live());
        assert!(!Invalid.is_live());
    }
}
