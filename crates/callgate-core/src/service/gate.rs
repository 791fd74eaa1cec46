use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::service::quota::{QuotaLedger, Reservation};
use crate::service::roles::{RoleResolver, RoleSet};
use crate::service::tokens::SessionTokens;
use crate::store::RecordStore;
use crate::types::{Capability, PermissionResponse, Principal, RolePermission, UNLIMITED};

/// Everything the gate needs to know about one incoming call.
pub struct RequestContext {
    pub session_token: Option<String>,
    pub principal: Option<Principal>,
    pub roles: RoleResolver,
}

impl RequestContext {
    pub fn new(store: Arc<dyn RecordStore>, session_token: Option<String>, principal: Option<Principal>) -> Self {
        Self {
            session_token,
            principal,
            roles: RoleResolver::new(store),
        }
    }
}

/// A call that passed identity and policy checks, before quota.
pub struct Admission {
    pub principal: Principal,
    pub roles: RoleSet,
    pub permissions: Vec<RolePermission>,
    pub history_limit: i64,
}

/// A call that also holds a quota slot.
pub struct Authorization {
    pub history_limit: i64,
    pub reservation: Reservation,
}

/// Per-request authorization: session token, principal, role policy, quota.
pub struct AccessGate {
    store: Arc<dyn RecordStore>,
    tokens: Arc<SessionTokens>,
    ledger: QuotaLedger,
    default_history_limit: i64,
}

impl AccessGate {
    pub fn new(
        store: Arc<dyn RecordStore>,
        tokens: Arc<SessionTokens>,
        ledger: QuotaLedger,
        default_history_limit: i64,
    ) -> Self {
        Self {
            store,
            tokens,
            ledger,
            default_history_limit,
        }
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    /// Identity and policy checks, in order: session token (403), principal
    /// (401), admin shortcut, permission rows (500 when none match).
    pub async fn admit(&self, ctx: &RequestContext) -> Result<Admission> {
        self.tokens.check(ctx.session_token.as_deref())?;
        let principal = ctx.principal.as_ref().ok_or(GatewayError::Unauthenticated)?;
        let roles = ctx.roles.resolve(Some(principal)).await?.clone();

        if roles.is_admin() {
            return Ok(Admission {
                principal: principal.clone(),
                roles,
                permissions: Vec::new(),
                history_limit: UNLIMITED,
            });
        }

        let permissions = self.store.permissions_for(&roles.names()).await?;
        if permissions.is_empty() {
            warn!("No permission rows for roles {:?} of {}", roles.names(), principal.id);
            return Err(GatewayError::misconfigured(format!(
                "RolePermission for {}",
                roles.names().join(", ")
            )));
        }

        let history_limit = permissions
            .iter()
            .map(|p| p.history_limit.unwrap_or(self.default_history_limit))
            .max()
            .unwrap_or(self.default_history_limit);
        debug!("Admitted {} (history limit {})", principal.id, history_limit);

        Ok(Admission {
            principal: principal.clone(),
            roles,
            permissions,
            history_limit,
        })
    }

    /// Admit and reserve one call of `capability`. The caller commits the
    /// reservation once the upstream has answered.
    pub async fn authorize(&self, ctx: &RequestContext, capability: Capability) -> Result<Authorization> {
        let admission = self.admit(ctx).await?;
        let reservation = self
            .ledger
            .reserve(&admission.principal, &admission.roles, capability, &admission.permissions)
            .await?;
        Ok(Authorization {
            history_limit: admission.history_limit,
            reservation,
        })
    }

    /// Admit and charge one call right away. Quota exhaustion is reported
    /// in the response instead of as an error.
    pub async fn request_permission(&self, ctx: &RequestContext, capability: Capability) -> Result<PermissionResponse> {
        let admission = self.admit(ctx).await?;
        let charged = self
            .ledger
            .check_and_charge(&admission.principal, &admission.roles, capability, &admission.permissions)
            .await;

        match charged {
            Ok(_) => Ok(PermissionResponse {
                can_call: true,
                message: String::new(),
                history_limit: admission.history_limit,
            }),
            Err(e @ GatewayError::QuotaExceeded { .. }) => Ok(PermissionResponse {
                can_call: false,
                message: e.client_message(),
                history_limit: admission.history_limit,
            }),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionTokenMode;
    use crate::store::MemoryStore;
    use crate::types::ADMIN_ROLE;
    use crate::util::SystemClock;

    struct Fixture {
        store: Arc<MemoryStore>,
        gate: AccessGate,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(SystemClock);
        let tokens = Arc::new(SessionTokens::new(SessionTokenMode::Presence, 60, clock.clone()));
        let ledger = QuotaLedger::new(store.clone(), clock);
        let gate = AccessGate::new(store.clone(), tokens, ledger, 15);
        Fixture { store, gate }
    }

    fn ctx(f: &Fixture, token: Option<&str>, principal: Option<&str>) -> RequestContext {
        RequestContext::new(
            f.store.clone(),
            token.map(String::from),
            principal.and_then(|id| f.store.snapshot(id)),
        )
    }

    #[tokio::test]
    async fn test_token_checked_before_principal() {
        let f = fixture();
        let err = f.gate.admit(&ctx(&f, None, None)).await.err().unwrap();
        assert!(matches!(err, GatewayError::ClientUnauthorized));

        let err = f.gate.admit(&ctx(&f, Some("tok"), None)).await.err().unwrap();
        assert!(matches!(err, GatewayError::Unauthenticated));
    }

    #[tokio::test]
    async fn test_missing_permission_rows_is_server_error() {
        let f = fixture();
        f.store.put_principal(Principal::new("u1"));
        let err = f.gate.admit(&ctx(&f, Some("tok"), Some("u1"))).await.err().unwrap();
        assert_eq!(err.status_code(), 500);
        assert!(!err.client_message().contains("RolePermission"));
    }

    #[tokio::test]
    async fn test_history_limit_is_max_with_default() {
        let f = fixture();
        f.store.put_principal(Principal::new("u1"));
        f.store.add_role_member("Pro", "u1");
        f.store.put_permission(RolePermission::new("User").with_limit(Capability::Llm, 5));
        f.store.put_permission(
            RolePermission::new("Pro")
                .with_limit(Capability::Llm, 10)
                .with_history_limit(40),
        );

        let admission = f.gate.admit(&ctx(&f, Some("tok"), Some("u1"))).await.unwrap();
        assert_eq!(admission.history_limit, 40);

        let f = fixture();
        f.store.put_principal(Principal::new("u2"));
        f.store.put_permission(RolePermission::new("User").with_history_limit(5));
        let admission = f.gate.admit(&ctx(&f, Some("tok"), Some("u2"))).await.unwrap();
        assert_eq!(admission.history_limit, 5);
    }

    #[tokio::test]
    async fn test_admin_gets_unlimited_history() {
        let f = fixture();
        f.store.put_principal(Principal::new("root"));
        f.store.add_role_member(ADMIN_ROLE, "root");

        let auth = f
            .gate
            .authorize(&ctx(&f, Some("tok"), Some("root")), Capability::Llm)
            .await
            .unwrap();
        assert_eq!(auth.history_limit, UNLIMITED);
        assert!(auth.reservation.is_unlimited());
    }

    #[tokio::test]
    async fn test_request_permission_reports_denial() {
        let f = fixture();
        let mut principal = Principal::new("u1");
        principal.llm_call_count = 49;
        principal.last_call_date = Some(chrono::Utc::now().date_naive());
        f.store.put_principal(principal);
        f.store.put_permission(RolePermission::new("User").with_limit(Capability::Llm, 50));

        let granted = f
            .gate
            .request_permission(&ctx(&f, Some("tok"), Some("u1")), Capability::Llm)
            .await
            .unwrap();
        assert!(granted.can_call);
        assert_eq!(granted.history_limit, 15);

        let denied = f
            .gate
            .request_permission(&ctx(&f, Some("tok"), Some("u1")), Capability::Llm)
            .await
            .unwrap();
        assert!(!denied.can_call);
        assert!(denied.message.contains("50"));
        assert_eq!(f.store.snapshot("u1").unwrap().llm_call_count, 50);
    }

    #[tokio::test]
    async fn test_authorize_raises_quota_exceeded() {
        let f = fixture();
        f.store.put_principal(Principal::new("u1"));
        f.store.put_permission(RolePermission::new("User").with_limit(Capability::Tts, 0));

        let err = f
            .gate
            .authorize(&ctx(&f, Some("tok"), Some("u1")), Capability::Tts)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, GatewayError::QuotaExceeded { limit: 0, .. }));
    }
}
