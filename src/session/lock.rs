use anyhow::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, info, warn};

use crate::platform;
use crate::session::auth::AdminAuthenticator;
use crate::session::registry::UnitRegistry;
use crate::session::types::{AdminActionError, SessionContext, SessionEvent};
use crate::store::{KIOSK_MODE_KEY, Store};

/// OS-level input blocking used while kiosk mode is active.
pub trait InputBlocker: Send + Sync {
    fn engage(&self) -> Result<()>;
    fn disengage(&self) -> Result<()>;
}

/// Blocker backed by the platform module.
pub struct OsInputBlocker;

impl InputBlocker for OsInputBlocker {
    fn engage(&self) -> Result<()> {
        if !platform::blocking_supported() {
            warn!("input blocking is not supported on this platform");
            return Ok(());
        }
        platform::engage_input_block()
    }

    fn disengage(&self) -> Result<()> {
        if !platform::blocking_supported() {
            return Ok(());
        }
        platform::disengage_input_block()
    }
}

/// Per-process kiosk lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KioskState {
    Unlocked,
    Locked,
}

/// Owns the per-terminal administrative lock and the session-scoped kiosk
/// input-lock lifecycle.
///
/// The kiosk flag is process-local; only the global `kiosk_mode_enabled`
/// setting is shared between processes, and it is consulted fresh at each
/// session start.
pub struct LockController {
    store: Arc<dyn Store>,
    auth: AdminAuthenticator,
    registry: UnitRegistry,
    blocker: Arc<dyn InputBlocker>,
    kiosk: Mutex<KioskState>,
    // Last observed value of the global setting, used only when the store
    // cannot be read at session start.
    kiosk_pref: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

impl LockController {
    pub fn new(
        store: Arc<dyn Store>,
        auth: AdminAuthenticator,
        registry: UnitRegistry,
        blocker: Arc<dyn InputBlocker>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            store,
            auth,
            registry,
            blocker,
            kiosk: Mutex::new(KioskState::Unlocked),
            kiosk_pref: AtomicBool::new(true),
            events,
        }
    }

    /// Engage input blocking for the new session if kiosk mode is enabled.
    ///
    /// The setting is read fresh from the store; a toggle made while no
    /// session was running takes effect here and not before.
    pub async fn on_session_start(&self, ctx: &SessionContext) {
        let enabled = match self.store.get_setting(KIOSK_MODE_KEY).await {
            Ok(value) => value.as_deref().map(|v| v == "true").unwrap_or(true),
            Err(e) => {
                let cached = self.kiosk_pref.load(Ordering::Relaxed);
                warn!(error = %e, cached, "could not read kiosk setting, using last observed value");
                cached
            }
        };

        let mut kiosk = self.kiosk.lock().await;
        if !enabled {
            info!(unit_id = ctx.unit_id, "kiosk mode disabled, session runs unlocked");
            *kiosk = KioskState::Unlocked;
            return;
        }

        match self.blocker.engage() {
            Ok(()) => {
                info!(unit_id = ctx.unit_id, "kiosk input blocking engaged");
                *kiosk = KioskState::Locked;
            }
            Err(e) => {
                // The session goes on; billing does not depend on the lock.
                error!(error = %e, "failed to engage input blocking");
                *kiosk = KioskState::Unlocked;
            }
        }
    }

    /// Disengage input blocking, regardless of what the global setting says
    /// right now. A session never leaves the input blocked behind it.
    pub async fn on_session_end(&self) {
        let mut kiosk = self.kiosk.lock().await;
        if let Err(e) = self.blocker.disengage() {
            error!(error = %e, "failed to disengage input blocking");
        }
        *kiosk = KioskState::Unlocked;
        debug!("kiosk input blocking disengaged");
    }

    pub async fn kiosk_state(&self) -> KioskState {
        *self.kiosk.lock().await
    }

    /// Admin-gated toggle of a terminal's lock flag.
    pub async fn set_unit_locked(
        &self,
        unit_id: i64,
        locked: bool,
        username: &str,
        password: &str,
    ) -> Result<(), AdminActionError> {
        if !self.auth.verify(username, password).await? {
            return Err(AdminActionError::AuthenticationFailure);
        }
        self.registry.set_locked(unit_id, locked).await?;
        Ok(())
    }

    /// Admin-gated toggle of the global kiosk mode setting. Takes effect at
    /// the next session start; a session already running is unaffected.
    pub async fn set_kiosk_mode(
        &self,
        enabled: bool,
        username: &str,
        password: &str,
    ) -> Result<(), AdminActionError> {
        if !self.auth.verify(username, password).await? {
            return Err(AdminActionError::AuthenticationFailure);
        }
        self.store
            .set_setting(KIOSK_MODE_KEY, if enabled { "true" } else { "false" })
            .await?;
        info!(enabled, admin = username, "kiosk mode setting changed");
        Ok(())
    }

    /// Disengage input blocking immediately without ending the session.
    /// Billing keeps running. Logged as a deliberate security downgrade.
    pub async fn emergency_unlock(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(), AdminActionError> {
        if !self.auth.verify(username, password).await? {
            return Err(AdminActionError::AuthenticationFailure);
        }

        warn!(admin = username, "emergency unlock: input blocking disengaged mid-session");
        self.on_session_end_blocking_only().await;
        let _ = self.events.send(SessionEvent::EmergencyUnlock);
        Ok(())
    }

    async fn on_session_end_blocking_only(&self) {
        let mut kiosk = self.kiosk.lock().await;
        if let Err(e) = self.blocker.disengage() {
            error!(error = %e, "failed to disengage input blocking");
        }
        *kiosk = KioskState::Unlocked;
    }

    /// Watch the settings channel so kiosk toggles are observed as they
    /// happen instead of being discovered only at the next session start.
    pub fn spawn_setting_watch(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let controller = self.clone();
        let mut rx = controller.store.subscribe_settings();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok((key, value)) if key == KIOSK_MODE_KEY => {
                        let enabled = value == "true";
                        controller.kiosk_pref.store(enabled, Ordering::Relaxed);
                        info!(enabled, "kiosk mode setting observed");
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "settings watch lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
