use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

use crate::session::types::{CustomerAccount, TerminalUnit, UnitStatus};
use crate::store::{NewAccount, SettingChange, Store, StoreError, Tables};

/// JSON-file store. The whole table set is held behind one mutex and written
/// back atomically after every mutation, so a claim is still a single
/// check-and-set as far as callers are concerned.
pub struct JsonStore {
    path: PathBuf,
    tables: Mutex<Tables>,
    settings_tx: broadcast::Sender<SettingChange>,
}

impl JsonStore {
    /// Open the store at `path`, creating default tables if the file does
    /// not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tables = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            debug!(path = %path.display(), "store file not found, starting empty");
            Tables::default()
        };

        let (settings_tx, _) = broadcast::channel(16);
        Ok(Self {
            path,
            tables: Mutex::new(tables),
            settings_tx,
        })
    }

    /// Write tables to a temp file and rename into place, so a crash mid-
    /// write never leaves a truncated store behind.
    async fn persist(&self, tables: &Tables) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let content = serde_json::to_string_pretty(tables)?;
        let tmp = temp_path(&self.path);
        tokio::fs::write(&tmp, content.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Apply a mutation to a copy of the tables, persist that copy, then
    /// commit it. A failed persist leaves the in-memory tables untouched, so
    /// a caller that retries after a persistence error starts from the state
    /// on disk instead of stacking its change on top of a phantom one.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Tables) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut next = tables.clone();
        let value = f(&mut next)?;
        self.persist(&next).await?;
        *tables = next;
        Ok(value)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[async_trait]
impl Store for JsonStore {
    async fn list_units(&self) -> Result<Vec<TerminalUnit>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.units.values().cloned().collect())
    }

    async fn get_unit(&self, id: i64) -> Result<Option<TerminalUnit>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.units.get(&id).cloned())
    }

    async fn claim_unit(
        &self,
        id: i64,
        account_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut next = tables.clone();
        let claimed = next.claim_unit(id, account_id, now)?;
        if claimed {
            // Commit only once the claim is on disk; a persist failure must
            // not leave the unit Occupied in memory with no session running.
            self.persist(&next).await?;
            *tables = next;
        }
        Ok(claimed)
    }

    async fn release_unit(&self, id: i64, expected_owner: Option<i64>) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        let mut next = tables.clone();
        let released = next.release_unit(id, expected_owner)?;
        if released {
            self.persist(&next).await?;
            *tables = next;
        }
        Ok(released)
    }

    async fn set_unit_locked(&self, id: i64, locked: bool) -> Result<(), StoreError> {
        self.mutate(|tables| tables.set_unit_locked(id, locked)).await
    }

    async fn set_unit_status(&self, id: i64, status: UnitStatus) -> Result<(), StoreError> {
        self.mutate(|tables| tables.set_unit_status(id, status)).await
    }

    async fn get_account(&self, id: i64) -> Result<Option<CustomerAccount>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.accounts.get(&id).cloned())
    }

    async fn debit_account(&self, id: i64, amount: Decimal) -> Result<Decimal, StoreError> {
        self.mutate(|tables| tables.debit_account(id, amount)).await
    }

    async fn credit_account(&self, id: i64, amount: Decimal) -> Result<Decimal, StoreError> {
        self.mutate(|tables| tables.credit_account(id, amount)).await
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.mutate(|tables| {
            tables
                .settings
                .insert(key.to_string(), value.to_string());
            Ok(())
        })
        .await?;
        let _ = self.settings_tx.send((key.to_string(), value.to_string()));
        Ok(())
    }

    fn subscribe_settings(&self) -> broadcast::Receiver<SettingChange> {
        self.settings_tx.subscribe()
    }

    async fn get_admin_hash(&self, username: &str) -> Result<Option<String>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.admins.get(username).cloned())
    }

    async fn insert_unit(&self, name: &str) -> Result<TerminalUnit, StoreError> {
        self.mutate(|tables| tables.insert_unit(name)).await
    }

    async fn insert_account(&self, account: NewAccount) -> Result<CustomerAccount, StoreError> {
        self.mutate(|tables| Ok(tables.insert_account(account))).await
    }

    async fn upsert_admin(&self, username: &str, password_hash: &str) -> Result<(), StoreError> {
        self.mutate(|tables| {
            tables
                .admins
                .insert(username.to_string(), password_hash.to_string());
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        {
            let store = JsonStore::open(&path).await.unwrap();
            store.insert_unit("PC-01").await.unwrap();
            store
                .insert_account(NewAccount {
                    username: "alice".to_string(),
                    balance: dec!(100.00),
                    hourly_rate: dec!(60.00),
                    session_time_limit_minutes: 120,
                    approved: true,
                })
                .await
                .unwrap();
            store.claim_unit(1, 1, Utc::now()).await.unwrap();
        }

        let store = JsonStore::open(&path).await.unwrap();
        let unit = store.get_unit(1).await.unwrap().unwrap();
        // A terminal found Occupied after a restart still has its session.
        assert_eq!(unit.status, UnitStatus::Occupied);
        assert_eq!(unit.owner_account_id, Some(1));
        assert!(unit.session_started_at.is_some());
    }

    #[tokio::test]
    async fn test_open_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("store.json")).await.unwrap();
        assert!(store.list_units().await.unwrap().is_empty());
        assert_eq!(
            store
                .get_setting(crate::store::KIOSK_MODE_KEY)
                .await
                .unwrap()
                .as_deref(),
            Some("true")
        );
    }

    #[tokio::test]
    async fn test_failed_persist_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = JsonStore::open(&path).await.unwrap();
        store.insert_unit("PC-01").await.unwrap();
        store
            .insert_account(NewAccount {
                username: "alice".to_string(),
                balance: dec!(10.00),
                hourly_rate: dec!(60.00),
                session_time_limit_minutes: 120,
                approved: true,
            })
            .await
            .unwrap();

        // Wedge the temp path so the atomic write cannot complete.
        std::fs::create_dir(temp_path(&path)).unwrap();

        assert!(store.debit_account(1, dec!(1.00)).await.is_err());
        assert!(store.debit_account(1, dec!(1.00)).await.is_err());
        assert!(store.claim_unit(1, 1, Utc::now()).await.is_err());

        // Neither failed debit applied, and the failed claim did not leave
        // the unit Occupied with no session running.
        let account = store.get_account(1).await.unwrap().unwrap();
        assert_eq!(account.balance, dec!(10.00));
        let unit = store.get_unit(1).await.unwrap().unwrap();
        assert_eq!(unit.status, UnitStatus::Available);
        assert_eq!(unit.owner_account_id, None);

        // Once the store recovers, the same operations go through.
        std::fs::remove_dir(temp_path(&path)).unwrap();
        let balance = store.debit_account(1, dec!(1.00)).await.unwrap();
        assert_eq!(balance, dec!(9.00));
        assert!(store.claim_unit(1, 1, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_no_partial_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = JsonStore::open(&path).await.unwrap();
        store.insert_unit("PC-01").await.unwrap();

        assert!(path.exists());
        assert!(!temp_path(&path).exists());
    }
}
