pub mod backend;
pub mod file_store;
pub mod memory_store;

#[cfg(feature = "dynamodb-backend")]
pub mod dynamo_store;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::StoreError;
use crate::types::{Principal, RolePermission, VersionConfig, USER_ROLE};

pub use backend::RecordStore;
pub use file_store::FileStore;
pub use memory_store::MemoryStore;

/// Result of an atomic charge attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeOutcome {
    /// Counter incremented; `used` is the value after the increment.
    Charged { used: u64 },
    /// Limit already reached; nothing was written.
    Exhausted { used: u64 },
}

/// The whole record document, as held by the memory and file backends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Records {
    pub principals: BTreeMap<String, Principal>,
    /// Client session token -> principal id.
    pub sessions: BTreeMap<String, String>,
    /// Role name -> member principal ids.
    pub roles: BTreeMap<String, BTreeSet<String>>,
    /// Role name -> permission row.
    pub permissions: BTreeMap<String, RolePermission>,
    /// Version name -> policy.
    pub versions: BTreeMap<String, VersionConfig>,
}

impl Records {
    pub fn principal_by_session(&self, session: &str) -> Option<Principal> {
        self.sessions
            .get(session)
            .and_then(|id| self.principals.get(id))
            .cloned()
    }

    pub fn register_principal(&mut self, id: &str, session: Option<&str>) -> Principal {
        let principal = self
            .principals
            .entry(id.to_string())
            .or_insert_with(|| Principal::new(id))
            .clone();
        self.roles
            .entry(USER_ROLE.to_string())
            .or_default()
            .insert(id.to_string());
        if let Some(session) = session {
            self.sessions.insert(session.to_string(), id.to_string());
        }
        principal
    }

    pub fn add_role_member(&mut self, role: &str, principal_id: &str) {
        self.roles
            .entry(role.to_string())
            .or_default()
            .insert(principal_id.to_string());
    }

    pub fn roles_of(&self, principal_id: &str) -> Vec<String> {
        self.roles
            .iter()
            .filter(|(_, members)| members.contains(principal_id))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn permissions_for(&self, role_names: &[String]) -> Vec<RolePermission> {
        role_names
            .iter()
            .filter_map(|name| self.permissions.get(name))
            .cloned()
            .collect()
    }

    pub fn put_permission(&mut self, permission: RolePermission) {
        self.permissions
            .insert(permission.role_name.clone(), permission);
    }

    pub fn put_version(&mut self, version: VersionConfig) {
        self.versions.insert(version.version_name.clone(), version);
    }

    /// Merge another document into this one.
    ///
    /// Permissions, versions and session bindings from `other` overwrite.
    /// Role memberships are unioned. Principals already present keep their
    /// counters.
    pub fn merge(&mut self, other: Records) {
        for (id, principal) in other.principals {
            self.principals.entry(id).or_insert(principal);
        }
        self.sessions.extend(other.sessions);
        for (role, members) in other.roles {
            self.roles.entry(role).or_default().extend(members);
        }
        self.permissions.extend(other.permissions);
        self.versions.extend(other.versions);
    }
}

/// Read a records document from disk.
pub async fn load_records(path: &Path) -> Result<Records, StoreError> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

/// Register a principal and enroll it in `extra_roles`.
pub async fn register(
    store: &dyn RecordStore,
    id: &str,
    session: Option<&str>,
    extra_roles: &[String],
) -> Result<Principal, StoreError> {
    let principal = store.register_principal(id, session).await?;
    for role in extra_roles {
        store.add_role_member(role, id).await?;
    }
    info!("Registered principal {} (extra roles: {:?})", id, extra_roles);
    Ok(principal)
}

/// Open the backend selected by the store configuration.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn RecordStore>, StoreError> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory record store; usage counters are lost on restart");
            match &config.seed {
                Some(path) => {
                    let records = load_records(path).await?;
                    info!(
                        "Seeded memory store from {} ({} principals)",
                        path.display(),
                        records.principals.len()
                    );
                    Ok(Arc::new(MemoryStore::from_records(records)))
                }
                None => {
                    tracing::warn!("No store.seed set; the memory store starts empty");
                    Ok(Arc::new(MemoryStore::new()))
                }
            }
        }
        StoreBackend::File => {
            let store = FileStore::open(config.file_path()).await?;
            Ok(Arc::new(store))
        }
        #[cfg(feature = "dynamodb-backend")]
        StoreBackend::Dynamodb => {
            let table = config
                .table
                .clone()
                .ok_or_else(|| StoreError::Backend("DynamoDB table name not configured".to_string()))?;
            Ok(Arc::new(dynamo_store::DynamoStore::from_env(table).await))
        }
        #[cfg(not(feature = "dynamodb-backend"))]
        StoreBackend::Dynamodb => Err(StoreError::Backend(
            "built without the dynamodb-backend feature".to_string(),
        )),
    }
}
