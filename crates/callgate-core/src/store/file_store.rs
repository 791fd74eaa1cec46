use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::service::quota::apply_charge;
use crate::types::{Capability, Principal, RolePermission, VersionConfig};

use super::backend::RecordStore;
use super::{ChargeOutcome, Records};

/// File-based record store: one JSON document holding every record.
///
/// All access goes through a single mutex, and every mutation rewrites the
/// file before the lock is released, so a charge is on disk before the
/// caller sees it succeed.
pub struct FileStore {
    path: PathBuf,
    records: Mutex<Records>,
}

impl FileStore {
    /// Open the records file, starting empty when it does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let records = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => Records::default(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Records file {} not found, starting empty", path.display());
                Records::default()
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merge a records document into the store and persist it.
    pub async fn seed(&self, records: Records) -> Result<(), StoreError> {
        self.update(|current| current.merge(records)).await
    }

    /// Apply an administrative edit (seeding roles, permissions, versions)
    /// and persist it.
    pub async fn update<F>(&self, edit: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Records),
    {
        let mut records = self.records.lock().await;
        edit(&mut records);
        self.persist(&records).await
    }

    async fn persist(&self, records: &Records) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Persisted records to {}", self.path.display());
        Ok(())
    }
}

#[async_trait]
impl RecordStore for FileStore {
    async fn principal_by_session(&self, session: &str) -> Result<Option<Principal>, StoreError> {
        Ok(self.records.lock().await.principal_by_session(session))
    }

    async fn principal(&self, id: &str) -> Result<Option<Principal>, StoreError> {
        Ok(self.records.lock().await.principals.get(id).cloned())
    }

    async fn register_principal(&self, id: &str, session: Option<&str>) -> Result<Principal, StoreError> {
        let mut records = self.records.lock().await;
        let principal = records.register_principal(id, session);
        self.persist(&records).await?;
        Ok(principal)
    }

    async fn add_role_member(&self, role: &str, principal_id: &str) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if !records.principals.contains_key(principal_id) {
            return Err(StoreError::PrincipalNotFound(principal_id.to_string()));
        }
        records.add_role_member(role, principal_id);
        self.persist(&records).await
    }

    async fn roles_of(&self, principal_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.records.lock().await.roles_of(principal_id))
    }

    async fn permissions_for(&self, role_names: &[String]) -> Result<Vec<RolePermission>, StoreError> {
        Ok(self.records.lock().await.permissions_for(role_names))
    }

    async fn version_config(&self, version: &str) -> Result<Option<VersionConfig>, StoreError> {
        Ok(self.records.lock().await.versions.get(version).cloned())
    }

    async fn charge(
        &self,
        principal_id: &str,
        capability: Capability,
        today: NaiveDate,
        limit: i64,
    ) -> Result<ChargeOutcome, StoreError> {
        let mut records = self.records.lock().await;
        let principal = records
            .principals
            .get_mut(principal_id)
            .ok_or_else(|| StoreError::PrincipalNotFound(principal_id.to_string()))?;

        let before = principal.clone();
        let outcome = apply_charge(principal, capability, today, limit);
        if let ChargeOutcome::Charged { .. } = outcome {
            if let Err(e) = self.persist(&records).await {
                // Keep memory and disk in agreement.
                records.principals.insert(principal_id.to_string(), before);
                return Err(e);
            }
        }
        Ok(outcome)
    }
}
