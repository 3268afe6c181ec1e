use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::session::types::{TerminalUnit, UnitStatus};
use crate::store::{Store, StoreError};

/// Typed access to the terminal pool. Every mutation of a terminal row
/// funnels through here, and the claim is delegated to the store's atomic
/// conditional update.
#[derive(Clone)]
pub struct UnitRegistry {
    store: Arc<dyn Store>,
}

impl UnitRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn list(&self) -> Result<Vec<TerminalUnit>, StoreError> {
        self.store.list_units().await
    }

    pub async fn get(&self, id: i64) -> Result<Option<TerminalUnit>, StoreError> {
        self.store.get_unit(id).await
    }

    /// Claim the unit for `account_id` if it is Available and unlocked at
    /// the moment of the write. Returns `false` when another caller won the
    /// race or the unit stopped being claimable. `now` becomes the session
    /// start time on success.
    pub async fn conditional_claim(
        &self,
        id: i64,
        account_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let claimed = self.store.claim_unit(id, account_id, now).await?;
        if claimed {
            info!(unit_id = id, account_id, "terminal claimed");
        } else {
            debug!(unit_id = id, account_id, "conditional claim refused");
        }
        Ok(claimed)
    }

    /// Return the unit to Available. Idempotent; returns `true` only when a
    /// session was actually ended. With `expected_owner` set the release
    /// only applies while that account still owns the unit.
    pub async fn release(&self, id: i64, expected_owner: Option<i64>) -> Result<bool, StoreError> {
        let released = self.store.release_unit(id, expected_owner).await?;
        if released {
            debug!(unit_id = id, "terminal released");
        }
        Ok(released)
    }

    /// Toggle the administrative lock. Fails with `CannotLockOccupied` while
    /// a session is running.
    pub async fn set_locked(&self, id: i64, locked: bool) -> Result<(), StoreError> {
        self.store.set_unit_locked(id, locked).await?;
        info!(unit_id = id, locked, "terminal lock changed");
        Ok(())
    }

    /// Administrative Offline/Maintenance transitions.
    pub async fn set_status(&self, id: i64, status: UnitStatus) -> Result<(), StoreError> {
        self.store.set_unit_status(id, status).await?;
        info!(unit_id = id, %status, "terminal status changed");
        Ok(())
    }
}
