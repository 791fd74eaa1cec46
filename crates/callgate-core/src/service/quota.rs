//! Daily per-capability call quotas.
//!
//! A call is admitted in two steps. [`QuotaLedger::reserve`] takes an
//! in-flight slot against the effective limit, and [`Reservation::commit`]
//! turns the slot into a persisted charge once the upstream has answered.
//! Dropping a reservation without committing releases the slot and leaves
//! the stored counter untouched.

use chrono::NaiveDate;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::service::roles::RoleSet;
use crate::store::{ChargeOutcome, RecordStore};
use crate::types::{Capability, Principal, RolePermission, UNLIMITED};
use crate::util::Clock;

/// Return the principal as of `today`: counters zeroed and the date moved
/// forward if its last call was on another day.
pub fn reset_if_new_day(mut principal: Principal, today: NaiveDate) -> Principal {
    if principal.last_call_date != Some(today) {
        principal.llm_call_count = 0;
        principal.tts_call_count = 0;
        principal.last_call_date = Some(today);
    }
    principal
}

/// Largest configured limit for `capability` across the permission rows.
/// A row without a value for the capability counts as 0.
pub fn effective_limit(permissions: &[RolePermission], capability: Capability) -> i64 {
    permissions
        .iter()
        .map(|p| p.limit(capability).unwrap_or(0))
        .max()
        .unwrap_or(0)
}

/// Reset-then-increment on a principal record. Shared by every backend
/// that holds records in process.
pub fn apply_charge(
    principal: &mut Principal,
    capability: Capability,
    today: NaiveDate,
    limit: i64,
) -> ChargeOutcome {
    let reset = reset_if_new_day(principal.clone(), today);
    let used = reset.usage(capability);
    if used as i64 >= limit {
        return ChargeOutcome::Exhausted { used };
    }

    *principal = reset;
    let counter = principal.usage_mut(capability);
    *counter += 1;
    ChargeOutcome::Charged { used: *counter }
}

/// Per-principal admission state.
#[derive(Default)]
struct Slot {
    /// Serializes "read usage, check, take slot" and "charge, free slot".
    lock: tokio::sync::Mutex<()>,
    /// Reserved but not yet committed calls, indexed like [`Capability::ALL`].
    pending: [AtomicU32; 2],
}

impl Slot {
    fn pending(&self, capability: Capability) -> &AtomicU32 {
        match capability {
            Capability::Llm => &self.pending[0],
            Capability::Tts => &self.pending[1],
        }
    }
}

/// Decides and records whether a principal may make one more call today.
#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    slots: Arc<DashMap<String, Arc<Slot>>>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Take an in-flight slot for one call of `capability`.
    ///
    /// Admins get an unlimited reservation without touching the store.
    /// Otherwise persisted usage plus in-flight reservations must stay
    /// below the effective limit.
    pub async fn reserve(
        &self,
        principal: &Principal,
        roles: &RoleSet,
        capability: Capability,
        permissions: &[RolePermission],
    ) -> Result<Reservation> {
        if roles.is_admin() {
            debug!("Admin {} bypasses {} quota", principal.id, capability);
            return Ok(Reservation::unlimited(self.clone(), &principal.id, capability));
        }

        let limit = effective_limit(permissions, capability);
        let slot = self.slot(&principal.id);
        {
            let _lock = slot.lock.lock().await;
            let stored = self
                .store
                .principal(&principal.id)
                .await?
                .unwrap_or_else(|| principal.clone());
            let used = reset_if_new_day(stored, self.clock.today()).usage(capability);
            let pending = slot.pending(capability).load(Ordering::SeqCst);

            if used as i64 + pending as i64 >= limit {
                warn!(
                    "Principal {} reached {} limit ({} used, {} in flight, limit {})",
                    principal.id, capability, used, pending, limit
                );
                drop(_lock);
                drop(slot);
                self.prune(&principal.id);
                return Err(GatewayError::QuotaExceeded { capability, limit });
            }
            slot.pending(capability).fetch_add(1, Ordering::SeqCst);
        }

        Ok(Reservation {
            ledger: self.clone(),
            principal_id: principal.id.clone(),
            capability,
            limit,
            slot: Some(slot),
        })
    }

    /// Reserve and immediately commit one call.
    pub async fn check_and_charge(
        &self,
        principal: &Principal,
        roles: &RoleSet,
        capability: Capability,
        permissions: &[RolePermission],
    ) -> Result<Option<u64>> {
        self.reserve(principal, roles, capability, permissions)
            .await?
            .commit()
            .await
    }

    /// Number of uncommitted reservations for a principal.
    pub fn in_flight(&self, principal_id: &str, capability: Capability) -> u32 {
        self.slots
            .get(principal_id)
            .map(|slot| slot.pending(capability).load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn slot(&self, principal_id: &str) -> Arc<Slot> {
        self.slots
            .entry(principal_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Drop the slot once nobody holds it and nothing is pending.
    fn prune(&self, principal_id: &str) {
        self.slots.remove_if(principal_id, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot.pending.iter().all(|p| p.load(Ordering::SeqCst) == 0)
        });
    }
}

/// One admitted call. Commit it after the upstream succeeds, or drop it.
pub struct Reservation {
    ledger: QuotaLedger,
    principal_id: String,
    capability: Capability,
    limit: i64,
    /// `None` for admins and after release.
    slot: Option<Arc<Slot>>,
}

impl Reservation {
    fn unlimited(ledger: QuotaLedger, principal_id: &str, capability: Capability) -> Self {
        Self {
            ledger,
            principal_id: principal_id.to_string(),
            capability,
            limit: UNLIMITED,
            slot: None,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit == UNLIMITED && self.slot.is_none()
    }

    /// Persist the charge. Returns the new usage count, or `None` for an
    /// unlimited reservation.
    ///
    /// The store re-checks the limit atomically, so a principal that ran
    /// out through another gateway instance still gets `QuotaExceeded`.
    pub async fn commit(mut self) -> Result<Option<u64>> {
        let slot = match self.slot.take() {
            Some(slot) => slot,
            None => return Ok(None),
        };

        let outcome = {
            let _lock = slot.lock.lock().await;
            let today = self.ledger.clock.today();
            let outcome = self
                .ledger
                .store
                .charge(&self.principal_id, self.capability, today, self.limit)
                .await;
            slot.pending(self.capability).fetch_sub(1, Ordering::SeqCst);
            outcome
        };
        drop(slot);
        self.ledger.prune(&self.principal_id);

        match outcome? {
            ChargeOutcome::Charged { used } => {
                info!(
                    "Charged {} call to {} ({}/{})",
                    self.capability, self.principal_id, used, self.limit
                );
                Ok(Some(used))
            }
            ChargeOutcome::Exhausted { used } => {
                warn!(
                    "Principal {} exhausted {} quota at commit ({}/{})",
                    self.principal_id, self.capability, used, self.limit
                );
                Err(GatewayError::QuotaExceeded {
                    capability: self.capability,
                    limit: self.limit,
                })
            }
        }
    }

    /// Release the slot without charging.
    pub fn abandon(self) {}
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.pending(self.capability).fetch_sub(1, Ordering::SeqCst);
            drop(slot);
            self.ledger.prune(&self.principal_id);
            debug!("Released {} reservation for {}", self.capability, self.principal_id);
        }
    }
}
