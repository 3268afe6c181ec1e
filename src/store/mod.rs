/// Abstract persistence for the terminal pool, customer accounts, system
/// settings, and admin credentials.
///
/// The store is the only resource shared between independent terminal
/// processes, so every invariant that must hold under concurrency lives here
/// as a single check-and-set call. Nothing above this layer does
/// read-modify-write across two store calls.
pub mod json;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::session::types::{CustomerAccount, TerminalUnit, UnitStatus};

pub use json::JsonStore;
pub use memory::MemoryStore;

/// Settings key for the global kiosk mode preference.
pub const KIOSK_MODE_KEY: &str = "kiosk_mode_enabled";

/// A settings write, published to subscribers as `(key, value)`.
pub type SettingChange = (String, String);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("terminal unit {0} not found")]
    UnitNotFound(i64),
    #[error("account {0} not found")]
    AccountNotFound(i64),
    #[error("terminal unit '{0}' already exists")]
    UnitExists(String),
    #[error("cannot lock an occupied terminal")]
    CannotLockOccupied,
    #[error("persistence failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("persistence failure: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Fields for creating a customer account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub balance: Decimal,
    pub hourly_rate: Decimal,
    pub session_time_limit_minutes: i64,
    pub approved: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn list_units(&self) -> Result<Vec<TerminalUnit>, StoreError>;

    async fn get_unit(&self, id: i64) -> Result<Option<TerminalUnit>, StoreError>;

    /// Atomic conditional claim. Succeeds and transitions the unit to
    /// Occupied only if, at the moment of the write, it is Available and not
    /// locked. Returns `false` when the condition does not hold.
    async fn claim_unit(
        &self,
        id: i64,
        account_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Return the unit to Available and clear the owner and start time.
    /// Returns `true` if a session was actually ended.
    ///
    /// Idempotent: releasing an Available unit is a no-op success. When
    /// `expected_owner` is given, the release only applies while that account
    /// still owns the unit, so a stale caller can never end somebody else's
    /// session.
    async fn release_unit(&self, id: i64, expected_owner: Option<i64>) -> Result<bool, StoreError>;

    /// Set the administrative lock flag. Fails with `CannotLockOccupied`
    /// while a session is running on the unit.
    async fn set_unit_locked(&self, id: i64, locked: bool) -> Result<(), StoreError>;

    async fn set_unit_status(&self, id: i64, status: UnitStatus) -> Result<(), StoreError>;

    async fn get_account(&self, id: i64) -> Result<Option<CustomerAccount>, StoreError>;

    /// Debit up to `amount` from the balance, clamping at zero. Returns the
    /// new balance.
    async fn debit_account(&self, id: i64, amount: Decimal) -> Result<Decimal, StoreError>;

    /// Opaque top-up. Returns the new balance.
    async fn credit_account(&self, id: i64, amount: Decimal) -> Result<Decimal, StoreError>;

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Subscribe to settings writes. Lets interested components observe
    /// toggles like kiosk mode instead of being poked by their callers.
    fn subscribe_settings(&self) -> broadcast::Receiver<SettingChange>;

    async fn get_admin_hash(&self, username: &str) -> Result<Option<String>, StoreError>;

    async fn insert_unit(&self, name: &str) -> Result<TerminalUnit, StoreError>;

    async fn insert_account(&self, account: NewAccount) -> Result<CustomerAccount, StoreError>;

    async fn upsert_admin(&self, username: &str, password_hash: &str) -> Result<(), StoreError>;
}

/// The plain tables behind both store implementations. All mutations run
/// under one lock held by the owning store, which is what makes the claim a
/// single check-and-set.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) struct Tables {
    pub units: BTreeMap<i64, TerminalUnit>,
    pub accounts: BTreeMap<i64, CustomerAccount>,
    pub settings: BTreeMap<String, String>,
    pub admins: BTreeMap<String, String>,
    pub next_unit_id: i64,
    pub next_account_id: i64,
}

impl Default for Tables {
    fn default() -> Self {
        let mut settings = BTreeMap::new();
        // Kiosk mode defaults to enabled for security.
        settings.insert(KIOSK_MODE_KEY.to_string(), "true".to_string());

        Self {
            units: BTreeMap::new(),
            accounts: BTreeMap::new(),
            settings,
            admins: BTreeMap::new(),
            next_unit_id: 1,
            next_account_id: 1,
        }
    }
}

impl Tables {
    pub fn claim_unit(
        &mut self,
        id: i64,
        account_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let unit = self.units.get_mut(&id).ok_or(StoreError::UnitNotFound(id))?;
        if !unit.is_claimable() {
            return Ok(false);
        }

        unit.status = UnitStatus::Occupied;
        unit.owner_account_id = Some(account_id);
        unit.session_started_at = Some(now);
        Ok(true)
    }

    pub fn release_unit(&mut self, id: i64, expected_owner: Option<i64>) -> Result<bool, StoreError> {
        let unit = self.units.get_mut(&id).ok_or(StoreError::UnitNotFound(id))?;

        if unit.status != UnitStatus::Occupied {
            return Ok(false);
        }
        if let Some(owner) = expected_owner {
            if unit.owner_account_id != Some(owner) {
                return Ok(false);
            }
        }

        unit.status = UnitStatus::Available;
        unit.owner_account_id = None;
        unit.session_started_at = None;
        Ok(true)
    }

    pub fn set_unit_locked(&mut self, id: i64, locked: bool) -> Result<(), StoreError> {
        let unit = self.units.get_mut(&id).ok_or(StoreError::UnitNotFound(id))?;
        if unit.status == UnitStatus::Occupied {
            return Err(StoreError::CannotLockOccupied);
        }

        unit.is_locked = locked;
        Ok(())
    }

    pub fn set_unit_status(&mut self, id: i64, status: UnitStatus) -> Result<(), StoreError> {
        let unit = self.units.get_mut(&id).ok_or(StoreError::UnitNotFound(id))?;

        unit.status = status;
        if status != UnitStatus::Occupied {
            unit.owner_account_id = None;
            unit.session_started_at = None;
        }
        Ok(())
    }

    pub fn debit_account(&mut self, id: i64, amount: Decimal) -> Result<Decimal, StoreError> {
        let account = self
            .accounts
            .get_mut(&id)
            .ok_or(StoreError::AccountNotFound(id))?;

        account.balance = (account.balance - amount).max(Decimal::ZERO);
        Ok(account.balance)
    }

    pub fn credit_account(&mut self, id: i64, amount: Decimal) -> Result<Decimal, StoreError> {
        let account = self
            .accounts
            .get_mut(&id)
            .ok_or(StoreError::AccountNotFound(id))?;

        account.balance += amount;
        Ok(account.balance)
    }

    pub fn insert_unit(&mut self, name: &str) -> Result<TerminalUnit, StoreError> {
        if self.units.values().any(|u| u.name == name) {
            return Err(StoreError::UnitExists(name.to_string()));
        }

        let unit = TerminalUnit {
            id: self.next_unit_id,
            name: name.to_string(),
            status: UnitStatus::Available,
            owner_account_id: None,
            session_started_at: None,
            is_locked: false,
        };
        self.next_unit_id += 1;
        self.units.insert(unit.id, unit.clone());
        Ok(unit)
    }

    pub fn insert_account(&mut self, new: NewAccount) -> CustomerAccount {
        let account = CustomerAccount {
            id: self.next_account_id,
            username: new.username,
            balance: new.balance,
            hourly_rate: new.hourly_rate,
            session_time_limit_minutes: new.session_time_limit_minutes,
            approved: new.approved,
        };
        self.next_account_id += 1;
        self.accounts.insert(account.id, account.clone());
        account
    }
}
