use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

use crate::store::{Store, StoreError};

const MAX_ATTEMPTS: usize = 5;
const ATTEMPT_WINDOW_SECS: u64 = 60;

/// Verifies administrator credentials for force-logout, lock toggling, the
/// global kiosk switch, and emergency unlock.
#[derive(Clone)]
pub struct AdminAuthenticator {
    store: Arc<dyn Store>,
    limiter: Arc<Mutex<RateLimiter>>,
}

impl AdminAuthenticator {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            limiter: Arc::new(Mutex::new(RateLimiter::new(
                MAX_ATTEMPTS,
                Duration::from_secs(ATTEMPT_WINDOW_SECS),
            ))),
        }
    }

    /// Check a username/password pair against the stored credential.
    ///
    /// An unknown username and a wrong password are indistinguishable to the
    /// caller: both come back `Ok(false)`.
    pub async fn verify(&self, username: &str, password: &str) -> Result<bool, StoreError> {
        if !self.limiter.lock().await.allow() {
            warn!(username, "admin verification throttled");
            return Ok(false);
        }

        let Some(hash) = self.store.get_admin_hash(username).await? else {
            return Ok(false);
        };

        let ok = Self::verify_password(password, &hash);
        if ok {
            self.limiter.lock().await.reset();
        } else {
            warn!(username, "admin verification failed");
        }
        Ok(ok)
    }

    /// Hash a password with Argon2id, for credential bootstrap.
    pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
        let salt = SaltString::generate(&mut OsRng);
        Ok(Argon2::default()
            .hash_password(password.as_bytes(), &salt)?
            .to_string())
    }

    fn verify_password(password: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            warn!("stored admin hash is malformed");
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }
}

/// Sliding-window throttle for failed verification attempts.
struct RateLimiter {
    attempts: Vec<Instant>,
    max_attempts: usize,
    window: Duration,
}

impl RateLimiter {
    fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            attempts: Vec::new(),
            max_attempts,
            window,
        }
    }

    fn allow(&mut self) -> bool {
        let now = Instant::now();
        self.attempts
            .retain(|at| now.duration_since(*at) < self.window);

        if self.attempts.len() < self.max_attempts {
            self.attempts.push(now);
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.attempts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn make_test_auth(password: &str) -> AdminAuthenticator {
        let store = Arc::new(MemoryStore::new());
        let hash = AdminAuthenticator::hash_password(password).unwrap();
        store.upsert_admin("admin", &hash).await.unwrap();
        AdminAuthenticator::new(store)
    }

    #[tokio::test]
    async fn test_verify_accepts_correct_password() {
        let auth = make_test_auth("admin123").await;
        assert!(auth.verify("admin", "admin123").await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_password() {
        let auth = make_test_auth("admin123").await;
        assert!(!auth.verify("admin", "nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_user_indistinguishable_from_wrong_password() {
        let auth = make_test_auth("admin123").await;
        let unknown = auth.verify("ghost", "admin123").await.unwrap();
        let wrong = auth.verify("admin", "nope").await.unwrap();
        assert_eq!(unknown, wrong);
    }

    #[test]
    fn test_hash_salts_differ_but_both_verify() {
        let h1 = AdminAuthenticator::hash_password("secret").unwrap();
        let h2 = AdminAuthenticator::hash_password("secret").unwrap();
        assert_ne!(h1, h2);
        assert!(AdminAuthenticator::verify_password("secret", &h1));
        assert!(AdminAuthenticator::verify_password("secret", &h2));
    }

    #[test]
    fn test_rate_limiter_blocks_after_max_attempts() {
        let mut limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());

        limiter.reset();
        assert!(limiter.allow());
    }
}
