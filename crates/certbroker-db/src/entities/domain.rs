//! Domain entity: one node of the authorization graph

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "domains")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    /// Fully qualified name, unique and case-sensitive as stored
    #[sea_orm(unique)]
    pub fqdn: String,

    /// Owning user. Empty for names created implicitly as certificate SANs
    pub owner: String,

    /// Approval only ever moves false -> true
    pub approved: bool,

    pub created_at: ChronoDateTimeUtc,

    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::delegation::Entity")]
    Delegation,

    #[sea_orm(has_many = "super::certificate_domain::Entity")]
    CertificateDomain,
}

impl Related<super::delegation::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Delegation.def()
    }
}

impl Related<super::certificate_domain::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CertificateDomain.def()
    }
}

impl Related<super::certificate::Entity> for Entity {
    fn to() -> RelationDef {
        super::certificate_domain::Relation::Certificate.def()
    }

    fn via() -> Option<RelationDef> {
        Some(super::certificate_domain::Relation::Domain.def().rev())
    }
}

#[async_trait::async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        if let Some(fqdn) = self.fqdn.try_as_ref() {
            if fqdn.trim().is_empty() {
                return Err(DbErr::Custom("domain fqdn must not be empty".into()));
            }
        }

        if !insert && matches!(self.approved.try_as_ref(), Some(&false)) {
            if let Some(id) = self.id.try_as_ref() {
                let stored = Entity::find_by_id(*id).one(db).await?;
                if stored.map(|d| d.approved).unwrap_or(false) {
                    return Err(DbErr::Custom(format!(
                        "domain {} is approved; approval cannot be revoked",
                        id
                    )));
                }
            }
        }

        Ok(self)
    }
}
