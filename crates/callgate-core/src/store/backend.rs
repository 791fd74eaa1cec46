use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::StoreError;
use crate::types::{Capability, Principal, RolePermission, VersionConfig};

use super::ChargeOutcome;

/// Trait for record store backends.
///
/// The store owns principals, role memberships, role permissions and
/// version policies. Only [`RecordStore::charge`] mutates usage counters.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Resolve the principal attached to a client session header.
    async fn principal_by_session(&self, session: &str) -> Result<Option<Principal>, StoreError>;

    /// Look up a principal by id.
    async fn principal(&self, id: &str) -> Result<Option<Principal>, StoreError>;

    /// Create a principal (if missing), enroll it in the `User` role and
    /// optionally bind a client session to it.
    async fn register_principal(&self, id: &str, session: Option<&str>) -> Result<Principal, StoreError>;

    /// Enroll a registered principal in `role`. Idempotent.
    async fn add_role_member(&self, role: &str, principal_id: &str) -> Result<(), StoreError>;

    /// Explicit role memberships of a principal. May be empty.
    async fn roles_of(&self, principal_id: &str) -> Result<Vec<String>, StoreError>;

    /// Permission rows whose role name is in `role_names`.
    async fn permissions_for(&self, role_names: &[String]) -> Result<Vec<RolePermission>, StoreError>;

    /// Version policy for a client build.
    async fn version_config(&self, version: &str) -> Result<Option<VersionConfig>, StoreError>;

    /// Atomically reset the counters if `today` differs from the stored
    /// date, then increment `capability` if it is below `limit`.
    ///
    /// Must be linearizable per principal.
    async fn charge(
        &self,
        principal_id: &str,
        capability: Capability,
        today: NaiveDate,
        limit: i64,
    ) -> Result<ChargeOutcome, StoreError>;
}
