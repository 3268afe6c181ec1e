use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::session::billing::BillingScheduler;
use crate::session::lock::LockController;
use crate::session::registry::UnitRegistry;
use crate::session::types::{
    ClaimOutcome, ConflictReason, EndCause, SessionContext, SessionEvent, SessionSummary,
    UnitStatus,
};
use crate::store::{Store, StoreError};

/// The uniform cleanup path every termination cause funnels through:
/// disengage input blocking, return the terminal to the pool, notify the UI.
#[derive(Clone)]
pub struct SessionTeardown {
    registry: UnitRegistry,
    lock: Arc<LockController>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionTeardown {
    pub fn new(
        registry: UnitRegistry,
        lock: Arc<LockController>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            registry,
            lock,
            events,
        }
    }

    pub async fn run(&self, unit_id: i64, expected_owner: Option<i64>, cause: EndCause) {
        self.lock.on_session_end().await;
        let released = match self.registry.release(unit_id, expected_owner).await {
            Ok(released) => released,
            Err(e) => {
                // Cleanup is best-effort; the registry release is idempotent
                // and the admin can re-run it.
                warn!(unit_id, error = %e, "terminal release failed during teardown");
                false
            }
        };

        // An Interrupted session was already released out from under this
        // process, so the local UI still needs the notification. Any other
        // no-op release had no session to report on.
        if !released && cause != EndCause::Interrupted {
            debug!(unit_id, "release had no active session to end");
            return;
        }
        info!(unit_id, %cause, "session ended");
        let _ = self.events.send(SessionEvent::Ended { unit_id, cause });
    }
}

/// Claims and releases terminals for customers; defines the session
/// lifecycle.
pub struct SessionAllocator {
    store: Arc<dyn Store>,
    registry: UnitRegistry,
    billing: Arc<BillingScheduler>,
    teardown: SessionTeardown,
}

impl SessionAllocator {
    pub fn new(
        store: Arc<dyn Store>,
        registry: UnitRegistry,
        billing: Arc<BillingScheduler>,
        teardown: SessionTeardown,
    ) -> Self {
        Self {
            store,
            registry,
            billing,
            teardown,
        }
    }

    /// Try to assign `unit_id` to `account_id`.
    ///
    /// Preconditions are checked first and reject without mutating anything;
    /// the actual assignment is the registry's atomic conditional claim, so
    /// losing a race against another process comes back as
    /// `Conflict(LostRace)` rather than corrupting the terminal row.
    ///
    /// On `Claimed` the caller is expected to invoke
    /// `BillingScheduler::start` and `LockController::on_session_start` with
    /// the returned context.
    pub async fn claim(&self, unit_id: i64, account_id: i64) -> Result<ClaimOutcome, StoreError> {
        let account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(StoreError::AccountNotFound(account_id))?;
        if !account.approved {
            return Ok(ClaimOutcome::Conflict(ConflictReason::AccountNotApproved));
        }
        if account.balance <= Decimal::ZERO {
            return Ok(ClaimOutcome::Conflict(ConflictReason::AccountNoBalance));
        }

        let Some(unit) = self.registry.get(unit_id).await? else {
            return Ok(ClaimOutcome::Conflict(ConflictReason::NotFound));
        };
        if unit.is_locked {
            return Ok(ClaimOutcome::Conflict(ConflictReason::Locked));
        }
        if unit.status != UnitStatus::Available {
            return Ok(ClaimOutcome::Conflict(ConflictReason::NotAvailable));
        }

        let now = Utc::now();
        match self.registry.conditional_claim(unit_id, account_id, now).await {
            Ok(true) => Ok(ClaimOutcome::Claimed(SessionContext {
                unit_id,
                account_id,
                started_at: now,
            })),
            Ok(false) => Ok(ClaimOutcome::Conflict(ConflictReason::LostRace)),
            Err(StoreError::UnitNotFound(_)) => {
                Ok(ClaimOutcome::Conflict(ConflictReason::NotFound))
            }
            Err(e) => Err(e),
        }
    }

    /// End the session on `unit_id` for `cause`. Always succeeds and is
    /// idempotent; releasing an Available terminal is a no-op.
    pub async fn release(&self, unit_id: i64, cause: EndCause) {
        self.billing.stop(unit_id).await;
        self.teardown.run(unit_id, None, cause).await;
    }

    /// End-of-session accounting for the user-facing summary.
    pub async fn session_summary(
        &self,
        ctx: &SessionContext,
    ) -> Result<SessionSummary, StoreError> {
        let account = self
            .store
            .get_account(ctx.account_id)
            .await?
            .ok_or(StoreError::AccountNotFound(ctx.account_id))?;

        let elapsed_minutes = ctx.elapsed_minutes(Utc::now());
        Ok(SessionSummary {
            unit_id: ctx.unit_id,
            elapsed_minutes,
            hourly_rate: account.hourly_rate,
            total_cost: account.cost_per_minute() * Decimal::from(elapsed_minutes),
            final_balance: account.balance,
        })
    }
}
