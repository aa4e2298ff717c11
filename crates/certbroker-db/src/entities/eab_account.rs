//! External Account Binding credentials handed to ACME clients

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "eab_accounts")]
pub struct Model {
    /// Key identifier presented by the ACME client
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    /// User the binding resolves to
    pub user: String,

    /// Base64url-encoded HMAC key
    #[serde(skip_serializing)]
    pub hmac_key: String,

    pub comment: String,

    /// ACME account URL once a client has bound the key
    #[sea_orm(nullable)]
    pub bound_account: Option<String>,

    pub created_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
