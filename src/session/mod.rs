/// PC session and billing core.
///
/// This module owns the session lifecycle for a bank of rentable terminals:
/// - atomically assigning a terminal to exactly one customer
/// - metering elapsed time and prepaid balance on a recurring schedule
/// - terminating sessions on exhaustion or administrative action
/// - coordinating the terminal lock flag and the kiosk input-lock
pub mod allocator;
pub mod auth;
pub mod billing;
pub mod lock;
pub mod registry;
pub mod types;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::warn;

use crate::config::Config;
use crate::store::Store;

pub use allocator::{SessionAllocator, SessionTeardown};
pub use auth::AdminAuthenticator;
pub use billing::BillingScheduler;
pub use lock::{InputBlocker, LockController, OsInputBlocker};
pub use registry::UnitRegistry;
pub use types::{AdminActionError, ClaimOutcome, EndCause, SessionEvent, UnitStatus};

/// Wires the core components over one store. The terminal-selection UI and
/// the admin screens talk to these and nothing else.
pub struct SessionCore {
    pub registry: UnitRegistry,
    pub allocator: SessionAllocator,
    pub billing: Arc<BillingScheduler>,
    pub lock: Arc<LockController>,
    pub auth: AdminAuthenticator,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionCore {
    /// Build the core with OS-level input blocking. Must run inside a tokio
    /// runtime.
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
        Self::with_blocker(store, config, Arc::new(OsInputBlocker))
    }

    pub fn with_blocker(
        store: Arc<dyn Store>,
        config: &Config,
        blocker: Arc<dyn InputBlocker>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        let registry = UnitRegistry::new(store.clone());
        let auth = AdminAuthenticator::new(store.clone());
        let lock = Arc::new(LockController::new(
            store.clone(),
            auth.clone(),
            registry.clone(),
            blocker,
            events.clone(),
        ));
        let _ = lock.spawn_setting_watch();

        let teardown = SessionTeardown::new(registry.clone(), lock.clone(), events.clone());
        let billing = Arc::new(BillingScheduler::new(
            store.clone(),
            teardown.clone(),
            events.clone(),
            Duration::from_secs(config.billing_interval_secs),
            config.low_balance_minutes,
        ));
        let allocator = SessionAllocator::new(store, registry.clone(), billing.clone(), teardown);

        Self {
            registry,
            allocator,
            billing,
            lock,
            auth,
            events,
        }
    }

    /// Side-channel notifications (low balance, session ended, emergency
    /// unlock) for the UI collaborator.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Admin-gated force end of whatever session runs on `unit_id`.
    pub async fn force_logout(
        &self,
        unit_id: i64,
        username: &str,
        password: &str,
    ) -> Result<(), AdminActionError> {
        if !self.auth.verify(username, password).await? {
            return Err(AdminActionError::AuthenticationFailure);
        }
        warn!(unit_id, admin = username, "administrator forced logout");
        self.allocator.release(unit_id, EndCause::AdminForced).await;
        Ok(())
    }

    /// Admin-gated Offline/Maintenance transitions.
    pub async fn set_unit_status(
        &self,
        unit_id: i64,
        status: UnitStatus,
        username: &str,
        password: &str,
    ) -> Result<(), AdminActionError> {
        if !self.auth.verify(username, password).await? {
            return Err(AdminActionError::AuthenticationFailure);
        }
        self.registry.set_status(unit_id, status).await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::InputBlocker;
    use anyhow::Result;

    /// Input blocker that does nothing, for tests that only care about
    /// session mechanics.
    pub struct NoopBlocker;

    impl InputBlocker for NoopBlocker {
        fn engage(&self) -> Result<()> {
            Ok(())
        }

        fn disengage(&self) -> Result<()> {
            Ok(())
        }
    }
}
