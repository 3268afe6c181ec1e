use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, broadcast};

use crate::session::types::{CustomerAccount, TerminalUnit, UnitStatus};
use crate::store::{NewAccount, SettingChange, Store, StoreError, Tables};

/// In-memory store. The single mutex is the atomicity boundary: a claim is
/// one critical section, never a read followed by a write.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    settings_tx: broadcast::Sender<SettingChange>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (settings_tx, _) = broadcast::channel(16);
        Self {
            tables: Mutex::new(Tables::default()),
            settings_tx,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
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
        tables.claim_unit(id, account_id, now)
    }

    async fn release_unit(&self, id: i64, expected_owner: Option<i64>) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.release_unit(id, expected_owner)
    }

    async fn set_unit_locked(&self, id: i64, locked: bool) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.set_unit_locked(id, locked)
    }

    async fn set_unit_status(&self, id: i64, status: UnitStatus) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.set_unit_status(id, status)
    }

    async fn get_account(&self, id: i64) -> Result<Option<CustomerAccount>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.accounts.get(&id).cloned())
    }

    async fn debit_account(&self, id: i64, amount: Decimal) -> Result<Decimal, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.debit_account(id, amount)
    }

    async fn credit_account(&self, id: i64, amount: Decimal) -> Result<Decimal, StoreError> {
        let mut tables = self.tables.lock().await;
        tables.credit_account(id, amount)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.settings.get(key).cloned())
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables
            .settings
            .insert(key.to_string(), value.to_string());
        // No receivers is fine.
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
        let mut tables = self.tables.lock().await;
        tables.insert_unit(name)
    }

    async fn insert_account(&self, account: NewAccount) -> Result<CustomerAccount, StoreError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.insert_account(account))
    }

    async fn upsert_admin(&self, username: &str, password_hash: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables
            .admins
            .insert(username.to_string(), password_hash.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    pub(crate) fn make_test_account() -> NewAccount {
        NewAccount {
            username: "alice".to_string(),
            balance: dec!(100.00),
            hourly_rate: dec!(60.00),
            session_time_limit_minutes: 120,
            approved: true,
        }
    }

    #[tokio::test]
    async fn test_concurrent_claims_yield_one_winner() {
        let store = Arc::new(MemoryStore::new());
        store.insert_unit("PC-01").await.unwrap();

        let mut handles = Vec::new();
        for account_id in 1..=8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.claim_unit(1, account_id, Utc::now()).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        let unit = store.get_unit(1).await.unwrap().unwrap();
        assert_eq!(unit.status, UnitStatus::Occupied);
        assert!(unit.owner_account_id.is_some());
    }

    #[tokio::test]
    async fn test_settings_subscription_sees_writes() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe_settings();

        store
            .set_setting(crate::store::KIOSK_MODE_KEY, "false")
            .await
            .unwrap();

        let (key, value) = rx.recv().await.unwrap();
        assert_eq!(key, crate::store::KIOSK_MODE_KEY);
        assert_eq!(value, "false");
    }

    #[tokio::test]
    async fn test_credit_and_debit() {
        let store = MemoryStore::new();
        let account = store.insert_account(make_test_account()).await.unwrap();

        let balance = store.credit_account(account.id, dec!(25.00)).await.unwrap();
        assert_eq!(balance, dec!(125.00));

        let balance = store.debit_account(account.id, dec!(1.00)).await.unwrap();
        assert_eq!(balance, dec!(124.00));
    }
}
