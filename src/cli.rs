use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;

use crate::session::types::UnitStatus;

/// Internet cafe terminal manager
///
/// Runs the per-terminal session agent, bills prepaid accounts by the
/// minute, and gives administrators lock, kiosk, and force-logout controls.
#[derive(Parser, Debug)]
#[command(name = "netcafe")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = "netcafe.toml", global = true)]
    pub config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the store with a terminal pool and a default administrator
    Init {
        /// Number of terminals to create (defaults to the configured pool size)
        #[arg(long)]
        units: Option<u32>,

        /// Administrator username
        #[arg(long, default_value = "admin")]
        admin_user: String,

        /// Administrator password
        #[arg(long)]
        admin_password: String,
    },
    /// Show the terminal pool
    Status,
    /// Run the terminal agent: claim a unit for a customer and bill until
    /// the session ends
    Agent {
        /// Terminal unit id
        #[arg(long)]
        unit: i64,

        /// Customer account id
        #[arg(long)]
        account: i64,
    },
    /// Administrator actions (all verify credentials first)
    Admin {
        #[command(subcommand)]
        command: AdminCommands,
    },
    /// Customer account management
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum AdminCommands {
    /// Lock a terminal so it cannot be claimed
    Lock {
        #[arg(long)]
        unit: i64,
        #[command(flatten)]
        creds: AdminCreds,
    },
    /// Unlock a terminal
    Unlock {
        #[arg(long)]
        unit: i64,
        #[command(flatten)]
        creds: AdminCreds,
    },
    /// Force-end the session running on a terminal
    ForceLogout {
        #[arg(long)]
        unit: i64,
        #[command(flatten)]
        creds: AdminCreds,
    },
    /// Toggle the global kiosk mode setting
    Kiosk {
        /// true to enable, false to disable
        enabled: bool,
        #[command(flatten)]
        creds: AdminCreds,
    },
    /// Move a terminal to Available, Offline, or Maintenance
    SetStatus {
        #[arg(long)]
        unit: i64,
        status: UnitStatus,
        #[command(flatten)]
        creds: AdminCreds,
    },
    /// Disengage input blocking on this terminal without ending the session
    EmergencyUnlock {
        #[command(flatten)]
        creds: AdminCreds,
    },
}

#[derive(clap::Args, Debug)]
pub struct AdminCreds {
    /// Administrator username
    #[arg(long, default_value = "admin")]
    pub user: String,

    /// Administrator password
    #[arg(long)]
    pub password: String,
}

#[derive(Subcommand, Debug)]
pub enum AccountCommands {
    /// Create a customer account
    Add {
        username: String,

        /// Opening balance
        #[arg(long, default_value = "0.00")]
        balance: Decimal,

        /// Hourly rate charged while a session runs
        #[arg(long, default_value = "20.00")]
        hourly_rate: Decimal,

        /// Maximum session length in minutes
        #[arg(long, default_value = "180")]
        time_limit: i64,

        /// Create the account unapproved, pending review
        #[arg(long)]
        pending: bool,
    },
    /// Add funds to an account
    Topup {
        #[arg(long)]
        account: i64,
        amount: Decimal,
    },
}
