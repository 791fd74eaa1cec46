use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use std::collections::BTreeSet;

use crate::error::StoreError;
use crate::service::quota::apply_charge;
use crate::types::{Capability, Principal, RolePermission, VersionConfig, USER_ROLE};

use super::backend::RecordStore;
use super::{ChargeOutcome, Records};

/// In-memory record store (for local dev/testing).
///
/// Charges run under the DashMap shard lock of the principal entry, which
/// serializes concurrent charges for the same principal.
pub struct MemoryStore {
    principals: DashMap<String, Principal>,
    sessions: DashMap<String, String>,
    roles: DashMap<String, BTreeSet<String>>,
    permissions: DashMap<String, RolePermission>,
    versions: DashMap<String, VersionConfig>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            principals: DashMap::new(),
            sessions: DashMap::new(),
            roles: DashMap::new(),
            permissions: DashMap::new(),
            versions: DashMap::new(),
        }
    }

    pub fn from_records(records: Records) -> Self {
        let mut store = Self::new();
        store.principals.extend(records.principals);
        store.sessions.extend(records.sessions);
        store.roles.extend(records.roles);
        store.permissions.extend(records.permissions);
        store.versions.extend(records.versions);
        store
    }

    pub fn put_principal(&self, principal: Principal) {
        self.principals.insert(principal.id.clone(), principal);
    }

    pub fn bind_session(&self, session: &str, principal_id: &str) {
        self.sessions
            .insert(session.to_string(), principal_id.to_string());
    }

    pub fn add_role_member(&self, role: &str, principal_id: &str) {
        self.roles
            .entry(role.to_string())
            .or_default()
            .insert(principal_id.to_string());
    }

    pub fn put_permission(&self, permission: RolePermission) {
        self.permissions
            .insert(permission.role_name.clone(), permission);
    }

    pub fn put_version(&self, version: VersionConfig) {
        self.versions.insert(version.version_name.clone(), version);
    }

    /// Current copy of a principal record.
    pub fn snapshot(&self, principal_id: &str) -> Option<Principal> {
        self.principals.get(principal_id).map(|p| p.value().clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn principal_by_session(&self, session: &str) -> Result<Option<Principal>, StoreError> {
        let id = match self.sessions.get(session) {
            Some(id) => id.value().clone(),
            None => return Ok(None),
        };
        Ok(self.snapshot(&id))
    }

    async fn principal(&self, id: &str) -> Result<Option<Principal>, StoreError> {
        Ok(self.snapshot(id))
    }

    async fn register_principal(&self, id: &str, session: Option<&str>) -> Result<Principal, StoreError> {
        let principal = self
            .principals
            .entry(id.to_string())
            .or_insert_with(|| Principal::new(id))
            .value()
            .clone();
        self.add_role_member(USER_ROLE, id);
        if let Some(session) = session {
            self.bind_session(session, id);
        }
        Ok(principal)
    }

    async fn add_role_member(&self, role: &str, principal_id: &str) -> Result<(), StoreError> {
        if !self.principals.contains_key(principal_id) {
            return Err(StoreError::PrincipalNotFound(principal_id.to_string()));
        }
        MemoryStore::add_role_member(self, role, principal_id);
        Ok(())
    }

    async fn roles_of(&self, principal_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .roles
            .iter()
            .filter(|entry| entry.value().contains(principal_id))
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn permissions_for(&self, role_names: &[String]) -> Result<Vec<RolePermission>, StoreError> {
        Ok(role_names
            .iter()
            .filter_map(|name| self.permissions.get(name).map(|p| p.value().clone()))
            .collect())
    }

    async fn version_config(&self, version: &str) -> Result<Option<VersionConfig>, StoreError> {
        Ok(self.versions.get(version).map(|v| v.value().clone()))
    }

    async fn charge(
        &self,
        principal_id: &str,
        capability: Capability,
        today: NaiveDate,
        limit: i64,
    ) -> Result<ChargeOutcome, StoreError> {
        let mut entry = self
            .principals
            .get_mut(principal_id)
            .ok_or_else(|| StoreError::PrincipalNotFound(principal_id.to_string()))?;
        Ok(apply_charge(entry.value_mut(), capability, today, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, d).unwrap()
    }

    #[tokio::test]
    async fn test_session_lookup() {
        let store = MemoryStore::new();
        store.register_principal("u1", Some("lc-1")).await.unwrap();
        let p = store.principal_by_session("lc-1").await.unwrap().unwrap();
        assert_eq!(p.id, "u1");
        assert!(store.principal_by_session("lc-2").await.unwrap().is_none());
        assert_eq!(store.roles_of("u1").await.unwrap(), vec![USER_ROLE.to_string()]);
    }

    #[tokio::test]
    async fn test_charge_until_exhausted() {
        let store = MemoryStore::new();
        store.register_principal("u1", None).await.unwrap();

        for expected in 1..=3 {
            let outcome = store.charge("u1", Capability::Tts, day(19), 3).await.unwrap();
            assert_eq!(outcome, ChargeOutcome::Charged { used: expected });
        }
        let outcome = store.charge("u1", Capability::Tts, day(19), 3).await.unwrap();
        assert_eq!(outcome, ChargeOutcome::Exhausted { used: 3 });
        assert_eq!(store.snapshot("u1").unwrap().tts_call_count, 3);
        assert_eq!(store.snapshot("u1").unwrap().llm_call_count, 0);
    }

    #[tokio::test]
    async fn test_charge_unknown_principal() {
        let store = MemoryStore::new();
        let err = store.charge("ghost", Capability::Llm, day(19), 3).await.unwrap_err();
        assert!(matches!(err, StoreError::PrincipalNotFound(_)));
    }

    #[tokio::test]
    async fn test_enroll_requires_registered_principal() {
        let store = MemoryStore::new();
        let err = RecordStore::add_role_member(&store, "Pro", "ghost").await.unwrap_err();
        assert!(matches!(err, StoreError::PrincipalNotFound(_)));

        store.register_principal("u1", None).await.unwrap();
        RecordStore::add_role_member(&store, "Pro", "u1").await.unwrap();
        RecordStore::add_role_member(&store, "Pro", "u1").await.unwrap();
        let mut roles = store.roles_of("u1").await.unwrap();
        roles.sort();
        assert_eq!(roles, vec!["Pro".to_string(), "User".to_string()]);
    }

    #[tokio::test]
    async fn test_from_records() {
        let mut records = Records::default();
        records.register_principal("u1", Some("lc-1"));
        records.add_role_member("Admin", "u1");
        records.put_permission(RolePermission::new("User").with_limit(Capability::Llm, 5));
        let store = MemoryStore::from_records(records);

        let mut roles = store.roles_of("u1").await.unwrap();
        roles.sort();
        assert_eq!(roles, vec!["Admin".to_string(), "User".to_string()]);
        let perms = store.permissions_for(&["User".to_string()]).await.unwrap();
        assert_eq!(perms[0].llm_limit, Some(5));
    }
}
