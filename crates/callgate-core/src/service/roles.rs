use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::store::RecordStore;
use crate::types::{Principal, ADMIN_ROLE, USER_ROLE};

/// Effective roles of a principal. Always contains `User`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSet(BTreeSet<String>);

impl RoleSet {
    /// Union of explicit memberships and the implicit `User` role.
    pub fn from_memberships<I, S>(memberships: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut roles: BTreeSet<String> = memberships.into_iter().map(Into::into).collect();
        roles.insert(USER_ROLE.to_string());
        Self(roles)
    }

    pub fn is_admin(&self) -> bool {
        self.0.contains(ADMIN_ROLE)
    }

    pub fn contains(&self, role: &str) -> bool {
        self.0.contains(role)
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Request-scoped role lookup. Memberships are fetched from the store at
/// most once per resolver, so build one per incoming request.
pub struct RoleResolver {
    store: Arc<dyn RecordStore>,
    resolved: OnceCell<RoleSet>,
}

impl RoleResolver {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            resolved: OnceCell::new(),
        }
    }

    /// Roles of the principal attached to the request.
    pub async fn resolve(&self, principal: Option<&Principal>) -> Result<&RoleSet> {
        let principal = principal.ok_or(GatewayError::Unauthenticated)?;
        self.resolved
            .get_or_try_init(|| async {
                let memberships = self.store.roles_of(&principal.id).await?;
                let roles = RoleSet::from_memberships(memberships);
                debug!("Resolved roles for {}: {:?}", principal.id, roles.names());
                Ok::<_, GatewayError>(roles)
            })
            .await
    }
}
