use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// Status of a rentable terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum UnitStatus {
    Available,
    Occupied,
    Offline,
    Maintenance,
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UnitStatus::Available => "Available",
            UnitStatus::Occupied => "Occupied",
            UnitStatus::Offline => "Offline",
            UnitStatus::Maintenance => "Maintenance",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for UnitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "available" => Ok(UnitStatus::Available),
            "occupied" => Ok(UnitStatus::Occupied),
            "offline" => Ok(UnitStatus::Offline),
            "maintenance" => Ok(UnitStatus::Maintenance),
            other => Err(format!("unknown unit status: {other}")),
        }
    }
}

/// One rentable terminal.
///
/// `owner_account_id` and `session_started_at` are both set exactly when
/// `status == Occupied`; together they are the whole state of the active
/// session, so a terminal found Occupied at startup simply still has one.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TerminalUnit {
    pub id: i64,
    pub name: String,
    pub status: UnitStatus,
    pub owner_account_id: Option<i64>,
    pub session_started_at: Option<DateTime<Utc>>,
    pub is_locked: bool,
}

impl TerminalUnit {
    /// A unit can only be claimed while Available and not admin-locked.
    pub fn is_claimable(&self) -> bool {
        self.status == UnitStatus::Available && !self.is_locked
    }
}

/// A prepaid customer account.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CustomerAccount {
    pub id: i64,
    pub username: String,
    pub balance: Decimal,
    pub hourly_rate: Decimal,
    pub session_time_limit_minutes: i64,
    pub approved: bool,
}

impl CustomerAccount {
    /// Per-minute billing cost derived from the hourly rate.
    pub fn cost_per_minute(&self) -> Decimal {
        self.hourly_rate / dec!(60)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndCause {
    /// User logged out normally.
    Logout,
    /// The session time limit was reached.
    TimeExpired,
    /// The prepaid balance reached zero.
    BalanceExhausted,
    /// An administrator force-ended the session.
    AdminForced,
    /// The billing task found the terminal state changed underneath it.
    Interrupted,
}

impl std::fmt::Display for EndCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EndCause::Logout => "logout",
            EndCause::TimeExpired => "time expired",
            EndCause::BalanceExhausted => "balance exhausted",
            EndCause::AdminForced => "ended by administrator",
            EndCause::Interrupted => "session interrupted",
        };
        f.write_str(s)
    }
}

/// Why a claim was rejected. Rejections never mutate state; the caller
/// re-prompts rather than retrying automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    NotFound,
    Locked,
    NotAvailable,
    AccountNotApproved,
    AccountNoBalance,
    /// Preconditions passed but another caller won the atomic claim.
    LostRace,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictReason::NotFound => "terminal not found",
            ConflictReason::Locked => "terminal is locked by an administrator",
            ConflictReason::NotAvailable => "terminal is not available",
            ConflictReason::AccountNotApproved => "account is waiting for approval",
            ConflictReason::AccountNoBalance => "account has no remaining balance",
            ConflictReason::LostRace => "terminal was claimed by another user",
        };
        f.write_str(s)
    }
}

/// Result of a claim attempt.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(SessionContext),
    Conflict(ConflictReason),
}

/// The explicit session value returned by a successful claim and passed to
/// every subsequent scheduler and lock call. No component discovers "who is
/// logged in" through shared globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionContext {
    pub unit_id: i64,
    pub account_id: i64,
    pub started_at: DateTime<Utc>,
}

impl SessionContext {
    /// Whole minutes elapsed since the session started, wall-clock.
    pub fn elapsed_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.started_at).num_minutes().max(0)
    }
}

/// Side-channel notifications for the UI collaborator.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    LowBalance {
        unit_id: i64,
        balance: Decimal,
        minutes_left: i64,
    },
    Ended {
        unit_id: i64,
        cause: EndCause,
    },
    /// An administrator disengaged input blocking without ending the session.
    EmergencyUnlock,
}

/// End-of-session accounting shown to the user at logout.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub unit_id: i64,
    pub elapsed_minutes: i64,
    pub hourly_rate: Decimal,
    pub total_cost: Decimal,
    pub final_balance: Decimal,
}

/// Errors from administrator-gated operations.
#[derive(Debug, Error)]
pub enum AdminActionError {
    /// Incorrect credentials. Callers must not reveal whether the username
    /// existed.
    #[error("authentication failed")]
    AuthenticationFailure,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn make_test_unit() -> TerminalUnit {
        TerminalUnit {
            id: 1,
            name: "PC-01".to_string(),
            status: UnitStatus::Available,
            owner_account_id: None,
            session_started_at: None,
            is_locked: false,
        }
    }

    #[test]
    fn test_claimable_only_when_available_and_unlocked() {
        let mut unit = make_test_unit();
        assert!(unit.is_claimable());

        unit.is_locked = true;
        assert!(!unit.is_claimable());

        unit.is_locked = false;
        unit.status = UnitStatus::Maintenance;
        assert!(!unit.is_claimable());
    }

    #[test]
    fn test_cost_per_minute() {
        let account = CustomerAccount {
            id: 1,
            username: "alice".to_string(),
            balance: dec!(100.00),
            hourly_rate: dec!(60.00),
            session_time_limit_minutes: 120,
            approved: true,
        };
        assert_eq!(account.cost_per_minute(), dec!(1.00));
    }

    #[test]
    fn test_elapsed_minutes_floors() {
        let started = Utc::now();
        let ctx = SessionContext {
            unit_id: 1,
            account_id: 1,
            started_at: started,
        };

        let now = started + Duration::seconds(119);
        assert_eq!(ctx.elapsed_minutes(now), 1);

        let now = started + Duration::seconds(120);
        assert_eq!(ctx.elapsed_minutes(now), 2);
    }

    #[test]
    fn test_elapsed_minutes_never_negative() {
        let started = Utc::now();
        let ctx = SessionContext {
            unit_id: 1,
            account_id: 1,
            started_at: started,
        };

        // Clock skew can put now before the recorded start.
        let now = started - Duration::seconds(90);
        assert_eq!(ctx.elapsed_minutes(now), 0);
    }

    #[test]
    fn test_unit_status_round_trip() {
        for status in [
            UnitStatus::Available,
            UnitStatus::Occupied,
            UnitStatus::Offline,
            UnitStatus::Maintenance,
        ] {
            let parsed: UnitStatus = status.to_string().to_lowercase().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }
}
