//! External Account Binding keys for ACME clients

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use certbroker_db::entities::eab_account;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, ModelTrait,
    QueryFilter, QueryOrder, Set,
};
use serde::Serialize;
use tracing::info;

use crate::error::{DomainError, Result};
use crate::service::access_context;
use crate::suffix::normalize_fqdn;

const HMAC_KEY_BYTES: usize = 32;

/// Freshly created binding. The only place the HMAC key is ever returned.
#[derive(Debug, Clone, Serialize)]
pub struct EabCredentials {
    pub key_id: String,
    pub hmac_key: String,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EabPermissionCheck {
    pub user: String,
    pub allowed: bool,
    /// Requested names no approved domain of the user covers
    pub missing: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EabService {
    db: DatabaseConnection,
}

impl EabService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn create(&self, user: &str, comment: &str) -> Result<EabCredentials> {
        if user.trim().is_empty() {
            return Err(DomainError::Forbidden("anonymous users cannot create EAB keys".into()));
        }

        let mut key = [0u8; HMAC_KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut key);
        let hmac_key = URL_SAFE_NO_PAD.encode(key);
        let key_id = uuid::Uuid::new_v4().simple().to_string();

        let account = eab_account::ActiveModel {
            id: Set(key_id.clone()),
            user: Set(user.to_string()),
            hmac_key: Set(hmac_key.clone()),
            comment: Set(comment.to_string()),
            bound_account: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await?;

        info!(key_id = %key_id, user, "EAB key created");
        Ok(EabCredentials {
            key_id,
            hmac_key,
            comment: account.comment,
            created_at: account.created_at,
        })
    }

    pub async fn list(&self, user: &str) -> Result<Vec<eab_account::Model>> {
        Ok(eab_account::Entity::find()
            .filter(eab_account::Column::User.eq(user))
            .order_by_asc(eab_account::Column::CreatedAt)
            .all(&self.db)
            .await?)
    }

    pub async fn delete(&self, user: &str, key_id: &str) -> Result<()> {
        let account = self.owned(user, key_id).await?;
        account.delete(&self.db).await?;
        info!(key_id, user, "EAB key deleted");
        Ok(())
    }

    /// Record the ACME account a key was bound to. Rebinding to a different
    /// account is a conflict.
    pub async fn bind(&self, key_id: &str, account_url: &str) -> Result<eab_account::Model> {
        let account = eab_account::Entity::find_by_id(key_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("EAB key {}", key_id)))?;

        match account.bound_account.as_deref() {
            Some(bound) if bound == account_url => return Ok(account),
            Some(_) => {
                return Err(DomainError::Conflict(format!(
                    "EAB key {} is bound to another account",
                    key_id
                )))
            }
            None => {}
        }

        let mut active = account.into_active_model();
        active.bound_account = Set(Some(account_url.to_string()));
        Ok(active.update(&self.db).await?)
    }

    /// User behind a key id or a bound ACME account URL
    pub async fn resolve_account_id(&self, id: &str) -> Result<String> {
        if let Some(account) = eab_account::Entity::find_by_id(id).one(&self.db).await? {
            return Ok(account.user);
        }

        eab_account::Entity::find()
            .filter(eab_account::Column::BoundAccount.eq(id))
            .one(&self.db)
            .await?
            .map(|a| a.user)
            .ok_or_else(|| DomainError::NotFound(format!("EAB account {}", id)))
    }

    /// Whether the user behind `id` may obtain certificates for `domains`
    pub async fn check_eab_permissions(&self, id: &str, domains: &[String]) -> Result<EabPermissionCheck> {
        let user = self.resolve_account_id(id).await?;
        let ctx = access_context(&self.db, &user).await?;

        let missing: Vec<String> = domains
            .iter()
            .filter(|raw| {
                !normalize_fqdn(raw)
                    .map(|fqdn| ctx.is_authorized_for(&fqdn))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        Ok(EabPermissionCheck {
            user,
            allowed: missing.is_empty(),
            missing,
        })
    }

    async fn owned(&self, user: &str, key_id: &str) -> Result<eab_account::Model> {
        eab_account::Entity::find_by_id(key_id)
            .filter(eab_account::Column::User.eq(user))
            .one(&self.db)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("EAB key {}", key_id)))
    }
}
