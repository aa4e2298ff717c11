//! Permission predicates over the domain graph

use std::collections::HashSet;

use certbroker_db::entities::domain;
use serde::Serialize;

use crate::suffix::{is_covered, is_descendant, is_same_or_descendant};

/// What a user may do with one domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Permissions {
    pub can_delete: bool,
    pub can_transfer: bool,
    pub can_delegate: bool,
    pub can_approve: bool,
}

/// A live certificate naming the domain as a SAN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coverage {
    /// CA-side id; `None` until the certificate has been synced
    pub ssl_id: Option<i64>,
    pub sans: Vec<String>,
}

/// The slice of the graph one user can reach
#[derive(Debug, Clone, Default)]
pub struct AccessContext {
    pub user: String,

    /// Domains owned by or delegated to the user
    pub roots: Vec<domain::Model>,

    /// Ids of domains delegated to the user
    pub delegated: HashSet<i32>,

    /// Roots plus every registered descendant of a root
    pub visible: Vec<domain::Model>,
}

impl AccessContext {
    /// Owned by or delegated to the user
    pub fn is_direct(&self, domain: &domain::Model) -> bool {
        (!self.user.is_empty() && domain.owner == self.user) || self.delegated.contains(&domain.id)
    }

    /// Nearest approved root that is a proper ancestor of `fqdn`
    pub fn approved_ancestor(&self, fqdn: &str) -> Option<&domain::Model> {
        self.roots
            .iter()
            .filter(|r| r.approved && is_descendant(fqdn, &r.fqdn))
            .max_by_key(|r| r.fqdn.len())
    }

    pub fn find_visible(&self, id: i32) -> Option<&domain::Model> {
        self.visible.iter().find(|d| d.id == id)
    }

    /// `name` is, or descends from, a visible domain
    pub fn controls(&self, name: &str) -> bool {
        let fqdns: Vec<&str> = self.visible.iter().map(|d| d.fqdn.as_str()).collect();
        is_covered(name, &fqdns)
    }

    /// `name` is, or descends from, an approved visible domain
    pub fn is_authorized_for(&self, name: &str) -> bool {
        self.visible
            .iter()
            .any(|d| d.approved && is_same_or_descendant(name, &d.fqdn))
    }
}

impl Coverage {
    /// Whether this certificate lets `ctx.user` delete one of its SANs
    pub fn allows_delete(&self, ctx: &AccessContext) -> bool {
        self.ssl_id.is_some() && self.sans.iter().all(|san| ctx.controls(san))
    }
}

/// Permissions of `ctx.user` on `domain`.
///
/// `has_approved_ancestor` is whether any approved domain, whoever owns it,
/// sits above `domain`. `coverage` lists the live certificates naming it.
pub fn compute_permissions(
    domain: &domain::Model,
    ctx: &AccessContext,
    has_approved_ancestor: bool,
    coverage: &[Coverage],
) -> Permissions {
    let mut permissions = Permissions::default();

    if ctx.is_direct(domain) {
        permissions.can_delete = true;
        if domain.approved {
            permissions.can_transfer = true;
            permissions.can_delegate = true;
        }
    }

    if ctx.approved_ancestor(&domain.fqdn).is_some() {
        permissions.can_approve = !domain.approved;
        permissions.can_delete = true;
        permissions.can_transfer = true;
        permissions.can_delegate = true;
    }

    // An approved top-level registration would lose its owner for good
    if domain.approved && !has_approved_ancestor {
        permissions.can_delete = false;
    }

    if permissions.can_delete && coverage.iter().any(|c| !c.allows_delete(ctx)) {
        permissions.can_delete = false;
    }

    permissions
}
