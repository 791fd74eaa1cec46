use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{AttributeValue, ReturnValue};
use aws_sdk_dynamodb::Client;
use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::types::{Capability, Principal, RolePermission, VersionConfig, USER_ROLE};

use super::backend::RecordStore;
use super::ChargeOutcome;

const PROFILE_SK: &str = "PROFILE";
/// Bound on the compare-and-swap loop when the day rolls over under contention.
const MAX_CHARGE_ATTEMPTS: usize = 5;

type Item = HashMap<String, AttributeValue>;

/// DynamoDB-based record store (single table, `pk`/`sk` keys).
///
/// Layout:
/// - `USER#{id}` / `PROFILE`: counters, `last_call_date`, `roles` list
/// - `SESSION#{token}` / `PRINCIPAL`: `user_id`
/// - `ROLE#{name}` / `PERMISSION`: `llm_limit`, `tts_limit`, `history_limit`
/// - `VERSION#{name}` / `CONFIG`: `status`, `update_message`, `update_url`
pub struct DynamoStore {
    client: Client,
    table: String,
}

impl DynamoStore {
    pub fn new(client: Client, table: String) -> Self {
        Self { client, table }
    }

    /// Build a client from the ambient AWS configuration.
    pub async fn from_env(table: String) -> Self {
        let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&aws_config), table)
    }

    async fn get(&self, pk: String, sk: &str) -> Result<Option<Item>, StoreError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("pk", AttributeValue::S(pk))
            .key("sk", AttributeValue::S(sk.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(backend_error)?;
        Ok(output.item)
    }

    /// Append `role` to the principal's `roles` list unless already present.
    async fn append_role(&self, id: &str, role: &str) -> Result<(), StoreError> {
        let appended = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("pk", AttributeValue::S(user_pk(id)))
            .key("sk", AttributeValue::S(PROFILE_SK.to_string()))
            .update_expression("SET #roles = list_append(if_not_exists(#roles, :empty), :role)")
            .condition_expression("attribute_not_exists(#roles) OR NOT contains(#roles, :role_name)")
            .expression_attribute_names("#roles", "roles")
            .expression_attribute_values(":empty", AttributeValue::L(vec![]))
            .expression_attribute_values(":role", AttributeValue::L(vec![AttributeValue::S(role.to_string())]))
            .expression_attribute_values(":role_name", AttributeValue::S(role.to_string()))
            .send()
            .await;
        match appended {
            Ok(_) => Ok(()),
            Err(e) if is_conditional_failure(&e) => Ok(()),
            Err(e) => Err(backend_error(e)),
        }
    }

    async fn load_principal(&self, id: &str) -> Result<Option<Principal>, StoreError> {
        Ok(self
            .get(user_pk(id), PROFILE_SK)
            .await?
            .map(|item| parse_principal(id, &item)))
    }

    /// Same-day increment. Fails the condition when the stored date is not
    /// `today` or the counter already reached the limit.
    async fn increment_same_day(
        &self,
        principal_id: &str,
        capability: Capability,
        today: NaiveDate,
        limit: i64,
    ) -> Result<Option<u64>, StoreError> {
        let count_attr = count_attr(capability);
        let result = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("pk", AttributeValue::S(user_pk(principal_id)))
            .key("sk", AttributeValue::S(PROFILE_SK.to_string()))
            .update_expression("SET #count = if_not_exists(#count, :zero) + :one")
            .condition_expression(
                "attribute_exists(pk) AND last_call_date = :today \
                 AND (attribute_not_exists(#count) OR #count < :limit)",
            )
            .expression_attribute_names("#count", count_attr)
            .expression_attribute_values(":zero", AttributeValue::N("0".to_string()))
            .expression_attribute_values(":one", AttributeValue::N("1".to_string()))
            .expression_attribute_values(":today", AttributeValue::S(today.to_string()))
            .expression_attribute_values(":limit", AttributeValue::N(limit.to_string()))
            .return_values(ReturnValue::UpdatedNew)
            .send()
            .await;

        match result {
            Ok(output) => Ok(Some(
                output
                    .attributes()
                    .and_then(|attrs| attrs.get(count_attr))
                    .and_then(|v| v.as_n().ok())
                    .and_then(|n| n.parse::<u64>().ok())
                    .unwrap_or(1),
            )),
            Err(e) if is_conditional_failure(&e) => Ok(None),
            Err(e) => Err(backend_error(e)),
        }
    }

    /// First charge of a new day: reset both counters and count this call.
    async fn reset_and_charge(
        &self,
        principal_id: &str,
        capability: Capability,
        today: NaiveDate,
    ) -> Result<bool, StoreError> {
        let (llm, tts) = match capability {
            Capability::Llm => ("1", "0"),
            Capability::Tts => ("0", "1"),
        };
        let result = self
            .client
            .update_item()
            .table_name(&self.table)
            .key("pk", AttributeValue::S(user_pk(principal_id)))
            .key("sk", AttributeValue::S(PROFILE_SK.to_string()))
            .update_expression(
                "SET last_call_date = :today, llm_call_count = :llm, tts_call_count = :tts",
            )
            .condition_expression(
                "attribute_exists(pk) AND (attribute_not_exists(last_call_date) OR last_call_date <> :today)",
            )
            .expression_attribute_values(":today", AttributeValue::S(today.to_string()))
            .expression_attribute_values(":llm", AttributeValue::N(llm.to_string()))
            .expression_attribute_values(":tts", AttributeValue::N(tts.to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_conditional_failure(&e) => Ok(false),
            Err(e) => Err(backend_error(e)),
        }
    }
}

#[async_trait]
impl RecordStore for DynamoStore {
    async fn principal_by_session(&self, session: &str) -> Result<Option<Principal>, StoreError> {
        let item = match self.get(format!("SESSION#{}", session), "PRINCIPAL").await? {
            Some(item) => item,
            None => return Ok(None),
        };
        match item.get("user_id").and_then(|v| v.as_s().ok()) {
            Some(user_id) => self.load_principal(user_id).await,
            None => {
                warn!("Session record without user_id");
                Ok(None)
            }
        }
    }

    async fn principal(&self, id: &str) -> Result<Option<Principal>, StoreError> {
        self.load_principal(id).await
    }

    async fn register_principal(&self, id: &str, session: Option<&str>) -> Result<Principal, StoreError> {
        let created = self
            .client
            .put_item()
            .table_name(&self.table)
            .item("pk", AttributeValue::S(user_pk(id)))
            .item("sk", AttributeValue::S(PROFILE_SK.to_string()))
            .item("user_id", AttributeValue::S(id.to_string()))
            .item("llm_call_count", AttributeValue::N("0".to_string()))
            .item("tts_call_count", AttributeValue::N("0".to_string()))
            .item("roles", AttributeValue::L(vec![AttributeValue::S(USER_ROLE.to_string())]))
            .item("created_at", AttributeValue::S(chrono::Utc::now().to_rfc3339()))
            .condition_expression("attribute_not_exists(pk)")
            .send()
            .await;

        match created {
            Ok(_) => debug!("Registered principal {}", id),
            // Existing principal: make sure the User membership is present.
            Err(e) if is_conditional_failure(&e) => self.append_role(id, USER_ROLE).await?,
            Err(e) => return Err(backend_error(e)),
        }

        if let Some(session) = session {
            self.client
                .put_item()
                .table_name(&self.table)
                .item("pk", AttributeValue::S(format!("SESSION#{}", session)))
                .item("sk", AttributeValue::S("PRINCIPAL".to_string()))
                .item("user_id", AttributeValue::S(id.to_string()))
                .send()
                .await
                .map_err(backend_error)?;
        }

        self.load_principal(id)
            .await?
            .ok_or_else(|| StoreError::PrincipalNotFound(id.to_string()))
    }

    async fn add_role_member(&self, role: &str, principal_id: &str) -> Result<(), StoreError> {
        if self.load_principal(principal_id).await?.is_none() {
            return Err(StoreError::PrincipalNotFound(principal_id.to_string()));
        }
        self.append_role(principal_id, role).await?;
        debug!("Enrolled {} in role {}", principal_id, role);
        Ok(())
    }

    async fn roles_of(&self, principal_id: &str) -> Result<Vec<String>, StoreError> {
        let item = self.get(user_pk(principal_id), PROFILE_SK).await?;
        Ok(item
            .and_then(|item| {
                item.get("roles").and_then(|v| v.as_l().ok()).map(|list| {
                    list.iter()
                        .filter_map(|v| v.as_s().ok().cloned())
                        .collect::<Vec<_>>()
                })
            })
            .unwrap_or_default())
    }

    async fn permissions_for(&self, role_names: &[String]) -> Result<Vec<RolePermission>, StoreError> {
        let mut permissions = Vec::with_capacity(role_names.len());
        for name in role_names {
            if let Some(item) = self.get(format!("ROLE#{}", name), "PERMISSION").await? {
                permissions.push(RolePermission {
                    role_name: name.clone(),
                    llm_limit: number(&item, "llm_limit"),
                    tts_limit: number(&item, "tts_limit"),
                    history_limit: number(&item, "history_limit"),
                });
            }
        }
        Ok(permissions)
    }

    async fn version_config(&self, version: &str) -> Result<Option<VersionConfig>, StoreError> {
        let item = match self.get(format!("VERSION#{}", version), "CONFIG").await? {
            Some(item) => item,
            None => return Ok(None),
        };
        let text = |key: &str| {
            item.get(key)
                .and_then(|v| v.as_s().ok())
                .cloned()
                .unwrap_or_default()
        };
        Ok(Some(VersionConfig {
            version_name: version.to_string(),
            status: text("status"),
            update_message: text("update_message"),
            update_url: text("update_url"),
        }))
    }

    async fn charge(
        &self,
        principal_id: &str,
        capability: Capability,
        today: NaiveDate,
        limit: i64,
    ) -> Result<ChargeOutcome, StoreError> {
        for _ in 0..MAX_CHARGE_ATTEMPTS {
            if let Some(used) = self
                .increment_same_day(principal_id, capability, today, limit)
                .await?
            {
                return Ok(ChargeOutcome::Charged { used });
            }

            let principal = self
                .load_principal(principal_id)
                .await?
                .ok_or_else(|| StoreError::PrincipalNotFound(principal_id.to_string()))?;

            if principal.last_call_date == Some(today) {
                let used = principal.usage(capability);
                if i64::try_from(used).unwrap_or(i64::MAX) >= limit {
                    return Ok(ChargeOutcome::Exhausted { used });
                }
                // Counter moved between the two reads; try again.
                continue;
            }

            if limit <= 0 {
                return Ok(ChargeOutcome::Exhausted { used: 0 });
            }
            if self.reset_and_charge(principal_id, capability, today).await? {
                return Ok(ChargeOutcome::Charged { used: 1 });
            }
            // Another request rolled the day over first; retry on the same-day path.
        }

        Err(StoreError::Backend(format!(
            "charge for {} did not settle after {} attempts",
            principal_id, MAX_CHARGE_ATTEMPTS
        )))
    }
}

fn user_pk(id: &str) -> String {
    format!("USER#{}", id)
}

fn count_attr(capability: Capability) -> &'static str {
    match capability {
        Capability::Llm => "llm_call_count",
        Capability::Tts => "tts_call_count",
    }
}

fn number(item: &Item, key: &str) -> Option<i64> {
    item.get(key)
        .and_then(|v| v.as_n().ok())
        .and_then(|n| n.parse::<i64>().ok())
}

fn parse_principal(id: &str, item: &Item) -> Principal {
    Principal {
        id: id.to_string(),
        llm_call_count: number(item, "llm_call_count").unwrap_or(0).max(0) as u64,
        tts_call_count: number(item, "tts_call_count").unwrap_or(0).max(0) as u64,
        last_call_date: item
            .get("last_call_date")
            .and_then(|v| v.as_s().ok())
            .and_then(|s| s.parse::<NaiveDate>().ok()),
    }
}

fn is_conditional_failure<E, R>(err: &SdkError<E, R>) -> bool
where
    E: ProvideErrorMetadata,
{
    err.as_service_error().and_then(|e| e.code()) == Some("ConditionalCheckFailedException")
}

fn backend_error<E, R>(err: SdkError<E, R>) -> StoreError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    StoreError::Backend(DisplayErrorContext(&err).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_principal() {
        let mut item = Item::new();
        item.insert("llm_call_count".into(), AttributeValue::N("4".into()));
        item.insert("last_call_date".into(), AttributeValue::S("2026-10-19".into()));
        let p = parse_principal("u1", &item);
        assert_eq!(p.llm_call_count, 4);
        assert_eq!(p.tts_call_count, 0);
        assert_eq!(p.last_call_date, NaiveDate::from_ymd_opt(2026, 10, 19));
    }

    #[test]
    fn test_count_attr() {
        assert_eq!(count_attr(Capability::Llm), "llm_call_count");
        assert_eq!(count_attr(Capability::Tts), "tts_call_count");
    }
}
