//! Domain authorization graph backed by the store

use std::collections::HashSet;

use certbroker_db::entities::{certificate, delegation, domain};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, DatabaseConnection, DbErr,
    EntityTrait, IntoActiveModel, ModelTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{DomainError, Result};
use crate::permissions::{compute_permissions, AccessContext, Coverage, Permissions};
use crate::suffix::{ancestors, is_descendant, normalize_fqdn};

/// A domain as seen by one user
#[derive(Debug, Clone, Serialize)]
pub struct DomainEntry {
    #[serde(flatten)]
    pub domain: domain::Model,
    pub permissions: Permissions,
    pub delegations: Vec<delegation::Model>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionCheck {
    pub fqdn: String,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistrationStatus {
    pub fqdn: String,
    pub registered: bool,
    pub approved: bool,
}

/// Reachable part of the graph for `user`: owned and delegated domains plus
/// all their registered descendants.
pub async fn access_context<C: ConnectionTrait>(db: &C, user: &str) -> Result<AccessContext> {
    if user.trim().is_empty() {
        return Ok(AccessContext::default());
    }

    let delegated: HashSet<i32> = delegation::Entity::find()
        .filter(delegation::Column::User.eq(user))
        .all(db)
        .await?
        .into_iter()
        .map(|d| d.domain_id)
        .collect();

    let roots = domain::Entity::find()
        .filter(
            Condition::any()
                .add(domain::Column::Owner.eq(user))
                .add(domain::Column::Id.is_in(delegated.iter().copied())),
        )
        .order_by_asc(domain::Column::Fqdn)
        .all(db)
        .await?;

    let mut visible = roots.clone();
    if !roots.is_empty() {
        let mut descendants = Condition::any();
        for root in &roots {
            descendants = descendants.add(domain::Column::Fqdn.like(format!("%.{}", root.fqdn)));
        }

        // LIKE is only a prefilter: `_` is a wildcard and case handling differs per backend
        for candidate in domain::Entity::find().filter(descendants).all(db).await? {
            let below_root = roots.iter().any(|r| is_descendant(&candidate.fqdn, &r.fqdn));
            if below_root && !visible.iter().any(|v| v.id == candidate.id) {
                visible.push(candidate);
            }
        }
    }
    visible.sort_by(|a, b| a.fqdn.cmp(&b.fqdn));

    Ok(AccessContext {
        user: user.to_string(),
        roots,
        delegated,
        visible,
    })
}

/// Whether any approved domain, regardless of owner, is a proper ancestor
pub async fn has_approved_ancestor<C: ConnectionTrait>(db: &C, fqdn: &str) -> Result<bool> {
    let candidates = ancestors(fqdn);
    if candidates.is_empty() {
        return Ok(false);
    }

    let count = domain::Entity::find()
        .filter(domain::Column::Fqdn.is_in(candidates))
        .filter(domain::Column::Approved.eq(true))
        .count(db)
        .await?;
    Ok(count > 0)
}

/// Live certificates naming `domain` as a SAN, with their full SAN lists
pub async fn coverage<C: ConnectionTrait>(db: &C, domain: &domain::Model) -> Result<Vec<Coverage>> {
    let mut result = Vec::new();
    for cert in domain.find_related(certificate::Entity).all(db).await? {
        if !cert.status.is_live() {
            continue;
        }
        let sans = cert
            .find_related(domain::Entity)
            .all(db)
            .await?
            .into_iter()
            .map(|d| d.fqdn)
            .collect();
        result.push(Coverage {
            ssl_id: cert.ssl_id,
            sans,
        });
    }
    Ok(result)
}

pub async fn evaluate<C: ConnectionTrait>(
    db: &C,
    domain: &domain::Model,
    ctx: &AccessContext,
) -> Result<Permissions> {
    let ancestor = has_approved_ancestor(db, &domain.fqdn).await?;
    let coverage = coverage(db, domain).await?;
    Ok(compute_permissions(domain, ctx, ancestor, &coverage))
}

/// Find or create a domain row for every name. New rows start unapproved
/// and owned by `owner` (empty for names only known from the CA).
///
/// Concurrent callers racing on the same name are tolerated: a failed insert
/// is followed by a lookup.
pub async fn upsert_domains<C: ConnectionTrait>(
    db: &C,
    names: &[String],
    owner: &str,
) -> std::result::Result<Vec<domain::Model>, DbErr> {
    insert_missing(db, names, owner, |_| false).await
}

/// [`upsert_domains`] for names a user requested a certificate for. A new
/// name below one of the user's approved domains starts approved, the same
/// rule [`DomainService::create_domain`] applies.
pub async fn upsert_requested_domains<C: ConnectionTrait>(
    db: &C,
    names: &[String],
    user: &str,
) -> Result<Vec<domain::Model>> {
    let ctx = access_context(db, user).await?;
    Ok(insert_missing(db, names, user, |name| ctx.approved_ancestor(name).is_some()).await?)
}

async fn insert_missing<C, F>(
    db: &C,
    names: &[String],
    owner: &str,
    approve: F,
) -> std::result::Result<Vec<domain::Model>, DbErr>
where
    C: ConnectionTrait,
    F: Fn(&str) -> bool,
{
    let mut rows = Vec::with_capacity(names.len());
    for name in names {
        if let Some(existing) = find_by_fqdn(db, name).await? {
            rows.push(existing);
            continue;
        }

        let approved = approve(name);
        let now = Utc::now();
        let inserted = domain::ActiveModel {
            fqdn: Set(name.clone()),
            owner: Set(owner.to_string()),
            approved: Set(approved),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(db)
        .await;

        match inserted {
            Ok(row) => {
                debug!(domain = %name, approved, "Registered SAN domain");
                rows.push(row);
            }
            Err(e) => match find_by_fqdn(db, name).await? {
                Some(row) => rows.push(row),
                None => return Err(e),
            },
        }
    }
    Ok(rows)
}

async fn find_by_fqdn<C: ConnectionTrait>(db: &C, fqdn: &str) -> std::result::Result<Option<domain::Model>, DbErr> {
    domain::Entity::find()
        .filter(domain::Column::Fqdn.eq(fqdn))
        .one(db)
        .await
}

fn visible(ctx: &AccessContext, id: i32) -> Result<domain::Model> {
    ctx.find_visible(id)
        .cloned()
        .ok_or_else(|| DomainError::NotFound(id.to_string()))
}

fn require(allowed: bool, action: &str, domain: &domain::Model) -> Result<()> {
    if allowed {
        Ok(())
    } else {
        Err(DomainError::Forbidden(format!(
            "not allowed to {} {}",
            action, domain.fqdn
        )))
    }
}

/// Domain registration, approval, ownership and delegation
#[derive(Debug, Clone)]
pub struct DomainService {
    db: DatabaseConnection,
}

impl DomainService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Owned, delegated and descendant domains
    pub async fn list_accessible(&self, user: &str) -> Result<Vec<domain::Model>> {
        Ok(access_context(&self.db, user).await?.visible)
    }

    /// Accessible domains with the caller's permissions and delegations
    pub async fn list_domains(&self, user: &str) -> Result<Vec<DomainEntry>> {
        let txn = self.db.begin().await?;
        let ctx = access_context(&txn, user).await?;

        let mut entries = Vec::with_capacity(ctx.visible.len());
        for domain in &ctx.visible {
            entries.push(Self::entry(&txn, domain.clone(), &ctx).await?);
        }

        txn.commit().await?;
        Ok(entries)
    }

    pub async fn get_domain(&self, user: &str, id: i32) -> Result<DomainEntry> {
        let txn = self.db.begin().await?;
        let ctx = access_context(&txn, user).await?;
        let domain = visible(&ctx, id)?;
        let entry = Self::entry(&txn, domain, &ctx).await?;
        txn.commit().await?;
        Ok(entry)
    }

    async fn entry<C: ConnectionTrait>(
        db: &C,
        domain: domain::Model,
        ctx: &AccessContext,
    ) -> Result<DomainEntry> {
        let permissions = evaluate(db, &domain, ctx).await?;
        let delegations = domain
            .find_related(delegation::Entity)
            .order_by_asc(delegation::Column::Id)
            .all(db)
            .await?;
        Ok(DomainEntry {
            domain,
            permissions,
            delegations,
        })
    }

    /// Register `fqdn` for `user`. Approved immediately when an approved
    /// domain of the user sits above it.
    pub async fn create_domain(&self, user: &str, fqdn: &str) -> Result<domain::Model> {
        if user.trim().is_empty() {
            return Err(DomainError::Forbidden("anonymous users cannot register domains".into()));
        }
        let fqdn = normalize_fqdn(fqdn)?;

        let txn = self.db.begin().await?;
        if find_by_fqdn(&txn, &fqdn).await?.is_some() {
            return Err(DomainError::Conflict(format!("{} is already registered", fqdn)));
        }

        let ctx = access_context(&txn, user).await?;
        let approved = ctx.approved_ancestor(&fqdn).is_some();

        let now = Utc::now();
        let domain = domain::ActiveModel {
            fqdn: Set(fqdn.clone()),
            owner: Set(user.to_string()),
            approved: Set(approved),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;

        info!(domain = %fqdn, user, approved, "Domain registered");
        Ok(domain)
    }

    pub async fn approve(&self, user: &str, id: i32) -> Result<domain::Model> {
        let txn = self.db.begin().await?;
        let ctx = access_context(&txn, user).await?;
        let domain = visible(&ctx, id)?;
        require(evaluate(&txn, &domain, &ctx).await?.can_approve, "approve", &domain)?;

        let mut active = domain.into_active_model();
        active.approved = Set(true);
        active.updated_at = Set(Utc::now());
        let domain = active.update(&txn).await?;
        txn.commit().await?;

        info!(domain = %domain.fqdn, user, "Domain approved");
        Ok(domain)
    }

    pub async fn transfer(&self, user: &str, id: i32, new_owner: &str) -> Result<domain::Model> {
        let new_owner = new_owner.trim();
        if new_owner.is_empty() {
            return Err(DomainError::InvalidInput("new owner is empty".into()));
        }

        let txn = self.db.begin().await?;
        let ctx = access_context(&txn, user).await?;
        let domain = visible(&ctx, id)?;
        require(evaluate(&txn, &domain, &ctx).await?.can_transfer, "transfer", &domain)?;
        if domain.owner == new_owner {
            return Err(DomainError::Conflict(format!(
                "{} already owns {}",
                new_owner, domain.fqdn
            )));
        }

        // The new owner no longer needs a delegation
        delegation::Entity::delete_many()
            .filter(delegation::Column::DomainId.eq(domain.id))
            .filter(delegation::Column::User.eq(new_owner))
            .exec(&txn)
            .await?;

        let previous = domain.owner.clone();
        let mut active = domain.into_active_model();
        active.owner = Set(new_owner.to_string());
        active.updated_at = Set(Utc::now());
        let domain = active.update(&txn).await?;
        txn.commit().await?;

        info!(domain = %domain.fqdn, from = %previous, to = new_owner, "Domain transferred");
        Ok(domain)
    }

    pub async fn add_delegation(&self, user: &str, id: i32, delegate: &str) -> Result<delegation::Model> {
        let delegate = delegate.trim();
        if delegate.is_empty() {
            return Err(DomainError::InvalidInput("delegated user is empty".into()));
        }

        let txn = self.db.begin().await?;
        let ctx = access_context(&txn, user).await?;
        let domain = visible(&ctx, id)?;
        require(evaluate(&txn, &domain, &ctx).await?.can_delegate, "delegate", &domain)?;

        if domain.owner == delegate {
            return Err(DomainError::Conflict(format!("{} owns {}", delegate, domain.fqdn)));
        }
        let existing = domain
            .find_related(delegation::Entity)
            .filter(delegation::Column::User.eq(delegate))
            .count(&txn)
            .await?;
        if existing > 0 {
            return Err(DomainError::Conflict(format!(
                "{} is already delegated to {}",
                domain.fqdn, delegate
            )));
        }

        let delegation = delegation::ActiveModel {
            user: Set(delegate.to_string()),
            domain_id: Set(domain.id),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&txn)
        .await?;
        txn.commit().await?;

        info!(domain = %domain.fqdn, user, delegate, "Delegation added");
        Ok(delegation)
    }

    pub async fn remove_delegation(&self, user: &str, id: i32, delegation_id: i32) -> Result<()> {
        let txn = self.db.begin().await?;
        let ctx = access_context(&txn, user).await?;
        let domain = visible(&ctx, id)?;
        require(evaluate(&txn, &domain, &ctx).await?.can_delegate, "delegate", &domain)?;

        let delegation = delegation::Entity::find_by_id(delegation_id)
            .filter(delegation::Column::DomainId.eq(domain.id))
            .one(&txn)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("delegation {}", delegation_id)))?;

        let delegate = delegation.user.clone();
        delegation.delete(&txn).await?;
        txn.commit().await?;

        info!(domain = %domain.fqdn, user, delegate = %delegate, "Delegation removed");
        Ok(())
    }

    /// Delete a domain; delegations and certificate edges go with it
    pub async fn delete_domain(&self, user: &str, id: i32) -> Result<()> {
        let txn = self.db.begin().await?;
        let ctx = access_context(&txn, user).await?;
        let domain = visible(&ctx, id)?;
        require(evaluate(&txn, &domain, &ctx).await?.can_delete, "delete", &domain)?;

        let fqdn = domain.fqdn.clone();
        domain.delete(&txn).await?;
        txn.commit().await?;

        info!(domain = %fqdn, user, "Domain deleted");
        Ok(())
    }

    /// Per name: granted iff an approved accessible domain equals it or is
    /// its ancestor
    pub async fn check_permission(&self, user: &str, fqdns: &[String]) -> Result<Vec<PermissionCheck>> {
        let ctx = access_context(&self.db, user).await?;
        Ok(fqdns
            .iter()
            .map(|raw| {
                let granted = normalize_fqdn(raw)
                    .map(|fqdn| ctx.is_authorized_for(&fqdn))
                    .unwrap_or(false);
                PermissionCheck {
                    fqdn: raw.clone(),
                    granted,
                }
            })
            .collect())
    }

    /// Fails with `Forbidden` naming the first name the user may not use
    pub async fn authorize_names(&self, user: &str, fqdns: &[String]) -> Result<()> {
        let denied: Vec<String> = self
            .check_permission(user, fqdns)
            .await?
            .into_iter()
            .filter(|c| !c.granted)
            .map(|c| c.fqdn)
            .collect();

        if denied.is_empty() {
            Ok(())
        } else {
            Err(DomainError::Forbidden(format!(
                "no approved domain covers {}",
                denied.join(", ")
            )))
        }
    }

    pub async fn check_registration(&self, fqdns: &[String]) -> Result<Vec<RegistrationStatus>> {
        let mut result = Vec::with_capacity(fqdns.len());
        for raw in fqdns {
            let found = match normalize_fqdn(raw) {
                Ok(fqdn) => find_by_fqdn(&self.db, &fqdn).await?,
                Err(_) => None,
            };
            result.push(RegistrationStatus {
                fqdn: raw.clone(),
                registered: found.is_some(),
                approved: found.map(|d| d.approved).unwrap_or(false),
            });
        }
        Ok(result)
    }
}
