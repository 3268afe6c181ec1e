use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::session::allocator::SessionTeardown;
use crate::session::types::{
    CustomerAccount, EndCause, SessionContext, SessionEvent, TerminalUnit, UnitStatus,
};
use crate::store::{Store, StoreError};

/// Per-session recurring billing task.
///
/// `start` hands the session to a cancellable tokio task that debits the
/// account once per interval; `stop` aborts it immediately, so a released
/// terminal can never receive a ghost tick afterward. Every tick re-reads
/// terminal and account fresh from the store before acting, which is how an
/// admin's force-logout or lock is guaranteed to be observed by the next
/// tick at the latest.
pub struct BillingScheduler {
    store: Arc<dyn Store>,
    teardown: SessionTeardown,
    events: broadcast::Sender<SessionEvent>,
    interval: Duration,
    low_balance_minutes: i64,
    handles: Arc<Mutex<HashMap<i64, BillingHandle>>>,
    next_generation: AtomicU64,
}

/// A task handle tagged with the incarnation that spawned it, so a stale
/// task winding down can never evict its successor's entry.
struct BillingHandle {
    generation: u64,
    task: JoinHandle<()>,
}

impl BillingScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        teardown: SessionTeardown,
        events: broadcast::Sender<SessionEvent>,
        interval: Duration,
        low_balance_minutes: i64,
    ) -> Self {
        Self {
            store,
            teardown,
            events,
            interval,
            low_balance_minutes,
            handles: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Begin recurring billing for the session. The first tick fires one
    /// full interval after the session start, not immediately.
    pub async fn start(&self, ctx: SessionContext) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut handles = self.handles.lock().await;
        if let Some(old) = handles.remove(&ctx.unit_id) {
            // A stale task for this terminal must never outlive a new session.
            old.task.abort();
            warn!(unit_id = ctx.unit_id, "replaced a previous billing task");
        }

        let store = self.store.clone();
        let teardown = self.teardown.clone();
        let events = self.events.clone();
        let low_balance_minutes = self.low_balance_minutes;
        let period = self.interval;
        let map = self.handles.clone();

        let handle = tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                match run_tick(store.as_ref(), &events, &ctx, low_balance_minutes).await {
                    TickFlow::Reschedule => {}
                    TickFlow::Terminate(cause) => {
                        // Owner-guarded so a drifted session can never end a
                        // successor's session on the same terminal.
                        teardown.run(ctx.unit_id, Some(ctx.account_id), cause).await;
                        break;
                    }
                }
            }
            // Remove only this incarnation's entry; a successor may have
            // replaced it while this task was winding down, and its handle
            // must stay cancellable through `stop`.
            let mut map = map.lock().await;
            if map
                .get(&ctx.unit_id)
                .is_some_and(|h| h.generation == generation)
            {
                map.remove(&ctx.unit_id);
            }
        });
        handles.insert(ctx.unit_id, BillingHandle { generation, task: handle });
        info!(
            unit_id = ctx.unit_id,
            account_id = ctx.account_id,
            interval_secs = period.as_secs(),
            "billing started"
        );
    }

    /// Cancel the billing task for a terminal. Immediate: no tick can fire
    /// for the prior session incarnation after this returns.
    pub async fn stop(&self, unit_id: i64) {
        if let Some(handle) = self.handles.lock().await.remove(&unit_id) {
            handle.task.abort();
            debug!(unit_id, "billing stopped");
        }
    }

    pub async fn is_running(&self, unit_id: i64) -> bool {
        self.handles
            .lock()
            .await
            .get(&unit_id)
            .map(|h| !h.task.is_finished())
            .unwrap_or(false)
    }
}

/// What the recurring task does after one tick.
enum TickFlow {
    Reschedule,
    Terminate(EndCause),
}

async fn run_tick(
    store: &dyn Store,
    events: &broadcast::Sender<SessionEvent>,
    ctx: &SessionContext,
    low_balance_minutes: i64,
) -> TickFlow {
    // Fresh reads every tick; cached state from scheduling time is never
    // trusted.
    let unit = match store.get_unit(ctx.unit_id).await {
        Ok(unit) => unit,
        Err(e) => return transient(ctx, e),
    };
    let account = match store.get_account(ctx.account_id).await {
        Ok(account) => account,
        Err(e) => return transient(ctx, e),
    };

    match evaluate_tick(
        unit.as_ref(),
        account.as_ref(),
        ctx,
        Utc::now(),
        low_balance_minutes,
    ) {
        TickVerdict::Interrupted => {
            info!(unit_id = ctx.unit_id, "terminal state changed underneath the session");
            TickFlow::Terminate(EndCause::Interrupted)
        }
        TickVerdict::End(cause) => TickFlow::Terminate(cause),
        TickVerdict::Debit { amount, after } => {
            let balance = match store.debit_account(ctx.account_id, amount).await {
                Ok(balance) => balance,
                Err(e) => return transient(ctx, e),
            };
            debug!(
                unit_id = ctx.unit_id,
                %amount,
                %balance,
                "billing tick applied"
            );

            match after {
                AfterDebit::Continue => TickFlow::Reschedule,
                AfterDebit::LowBalance { minutes_left } => {
                    let _ = events.send(SessionEvent::LowBalance {
                        unit_id: ctx.unit_id,
                        balance,
                        minutes_left,
                    });
                    TickFlow::Reschedule
                }
                AfterDebit::End(cause) => TickFlow::Terminate(cause),
            }
        }
    }
}

/// A store hiccup never ends a session; the tick is retried on the same
/// interval.
fn transient(ctx: &SessionContext, e: StoreError) -> TickFlow {
    warn!(unit_id = ctx.unit_id, error = %e, "billing tick failed, retrying next interval");
    TickFlow::Reschedule
}

/// Decision for a single tick, computed from a fresh snapshot.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TickVerdict {
    /// The terminal is no longer Occupied by this session's account, or got
    /// locked: self-cancel, never resurrect.
    Interrupted,
    /// Terminate before debiting anything.
    End(EndCause),
    /// Debit `amount` and then act on the projected balance.
    Debit { amount: Decimal, after: AfterDebit },
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum AfterDebit {
    Continue,
    LowBalance { minutes_left: i64 },
    End(EndCause),
}

/// Pure tick evaluation. Termination checks run in a fixed order: balance
/// exhaustion wins over time expiry when both hold on the same tick.
pub(crate) fn evaluate_tick(
    unit: Option<&TerminalUnit>,
    account: Option<&CustomerAccount>,
    ctx: &SessionContext,
    now: DateTime<Utc>,
    low_balance_minutes: i64,
) -> TickVerdict {
    let Some(unit) = unit else {
        return TickVerdict::Interrupted;
    };
    if unit.status != UnitStatus::Occupied
        || unit.owner_account_id != Some(ctx.account_id)
        || unit.is_locked
    {
        return TickVerdict::Interrupted;
    }
    let Some(account) = account else {
        return TickVerdict::Interrupted;
    };

    if account.balance <= Decimal::ZERO {
        return TickVerdict::End(EndCause::BalanceExhausted);
    }

    let cost = account.cost_per_minute();
    let amount = cost.min(account.balance);
    let new_balance = account.balance - amount;
    let elapsed = ctx.elapsed_minutes(now);

    let after = if new_balance <= Decimal::ZERO {
        AfterDebit::End(EndCause::BalanceExhausted)
    } else if elapsed >= account.session_time_limit_minutes {
        AfterDebit::End(EndCause::TimeExpired)
    } else if cost > Decimal::ZERO && new_balance <= cost * Decimal::from(low_balance_minutes) {
        let minutes_left = (new_balance / cost).floor().to_i64().unwrap_or(0);
        AfterDebit::LowBalance { minutes_left }
    } else {
        AfterDebit::Continue
    };

    TickVerdict::Debit { amount, after }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn make_test_unit(owner: i64) -> TerminalUnit {
        TerminalUnit {
            id: 1,
            name: "PC-01".to_string(),
            status: UnitStatus::Occupied,
            owner_account_id: Some(owner),
            session_started_at: Some(Utc::now()),
            is_locked: false,
        }
    }

    fn make_test_account(balance: Decimal) -> CustomerAccount {
        CustomerAccount {
            id: 7,
            username: "alice".to_string(),
            balance,
            hourly_rate: dec!(60.00),
            session_time_limit_minutes: 120,
            approved: true,
        }
    }

    fn make_test_ctx() -> SessionContext {
        SessionContext {
            unit_id: 1,
            account_id: 7,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn test_drift_detection_self_cancels() {
        let ctx = make_test_ctx();
        let account = make_test_account(dec!(100.00));
        let now = Utc::now();

        // Terminal gone.
        assert_eq!(
            evaluate_tick(None, Some(&account), &ctx, now, 10),
            TickVerdict::Interrupted
        );

        // Released by an admin.
        let mut unit = make_test_unit(7);
        unit.status = UnitStatus::Available;
        unit.owner_account_id = None;
        unit.session_started_at = None;
        assert_eq!(
            evaluate_tick(Some(&unit), Some(&account), &ctx, now, 10),
            TickVerdict::Interrupted
        );

        // Owner changed.
        let unit = make_test_unit(9);
        assert_eq!(
            evaluate_tick(Some(&unit), Some(&account), &ctx, now, 10),
            TickVerdict::Interrupted
        );

        // Locked while running.
        let mut unit = make_test_unit(7);
        unit.is_locked = true;
        assert_eq!(
            evaluate_tick(Some(&unit), Some(&account), &ctx, now, 10),
            TickVerdict::Interrupted
        );
    }

    #[test]
    fn test_billing_arithmetic_exhausts_in_ten_ticks() {
        // 60.00/hour is 1.00/minute; 10.00 lasts exactly 10 ticks.
        let ctx = make_test_ctx();
        let unit = make_test_unit(7);
        let mut account = make_test_account(dec!(10.00));

        let mut ticks = 0;
        loop {
            ticks += 1;
            match evaluate_tick(Some(&unit), Some(&account), &ctx, Utc::now(), 10) {
                TickVerdict::Debit { amount, after } => {
                    account.balance -= amount;
                    match after {
                        AfterDebit::End(cause) => {
                            assert_eq!(cause, EndCause::BalanceExhausted);
                            break;
                        }
                        _ => assert!(ticks < 10),
                    }
                }
                verdict => panic!("unexpected verdict: {verdict:?}"),
            }
        }

        assert_eq!(ticks, 10);
        assert_eq!(account.balance, dec!(0.00));
    }

    #[test]
    fn test_zero_balance_ends_before_debit() {
        let ctx = make_test_ctx();
        let unit = make_test_unit(7);
        let account = make_test_account(dec!(0.00));

        assert_eq!(
            evaluate_tick(Some(&unit), Some(&account), &ctx, Utc::now(), 10),
            TickVerdict::End(EndCause::BalanceExhausted)
        );
    }

    #[test]
    fn test_time_limit_fires_when_balance_survives() {
        let mut ctx = make_test_ctx();
        ctx.started_at = Utc::now() - chrono::Duration::minutes(6);
        let unit = make_test_unit(7);
        let mut account = make_test_account(dec!(500.00));
        account.session_time_limit_minutes = 5;

        match evaluate_tick(Some(&unit), Some(&account), &ctx, Utc::now(), 10) {
            TickVerdict::Debit { after, .. } => {
                assert_eq!(after, AfterDebit::End(EndCause::TimeExpired));
            }
            verdict => panic!("unexpected verdict: {verdict:?}"),
        }
    }

    #[test]
    fn test_balance_exhaustion_wins_over_time_expiry() {
        // Both conditions hold on the same tick; balance is checked first.
        let mut ctx = make_test_ctx();
        ctx.started_at = Utc::now() - chrono::Duration::minutes(10);
        let unit = make_test_unit(7);
        let mut account = make_test_account(dec!(1.00));
        account.session_time_limit_minutes = 5;

        match evaluate_tick(Some(&unit), Some(&account), &ctx, Utc::now(), 10) {
            TickVerdict::Debit { after, .. } => {
                assert_eq!(after, AfterDebit::End(EndCause::BalanceExhausted));
            }
            verdict => panic!("unexpected verdict: {verdict:?}"),
        }
    }

    #[test]
    fn test_low_balance_warning_threshold() {
        let ctx = make_test_ctx();
        let unit = make_test_unit(7);

        // 11.00 left after this debit: above the 10-minute threshold.
        let account = make_test_account(dec!(12.00));
        match evaluate_tick(Some(&unit), Some(&account), &ctx, Utc::now(), 10) {
            TickVerdict::Debit { after, .. } => assert_eq!(after, AfterDebit::Continue),
            verdict => panic!("unexpected verdict: {verdict:?}"),
        }

        // 10.00 left after this debit: warn with 10 minutes remaining.
        let account = make_test_account(dec!(11.00));
        match evaluate_tick(Some(&unit), Some(&account), &ctx, Utc::now(), 10) {
            TickVerdict::Debit { after, .. } => {
                assert_eq!(after, AfterDebit::LowBalance { minutes_left: 10 });
            }
            verdict => panic!("unexpected verdict: {verdict:?}"),
        }
    }

    #[test]
    fn test_final_partial_debit_is_clamped() {
        let ctx = make_test_ctx();
        let unit = make_test_unit(7);
        let account = make_test_account(dec!(0.40));

        match evaluate_tick(Some(&unit), Some(&account), &ctx, Utc::now(), 10) {
            TickVerdict::Debit { amount, after } => {
                assert_eq!(amount, dec!(0.40));
                assert_eq!(after, AfterDebit::End(EndCause::BalanceExhausted));
            }
            verdict => panic!("unexpected verdict: {verdict:?}"),
        }
    }
}
