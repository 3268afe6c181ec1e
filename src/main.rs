use anyhow::{Context, Result, bail};
use clap::Parser;
use std::sync::Arc;
use tracing::info;

mod cli;
mod config;
mod platform;
mod session;
mod store;

use cli::{AccountCommands, AdminCommands, Args, Commands};
use config::Config;
use session::{ClaimOutcome, EndCause, SessionCore, SessionEvent};
use store::{JsonStore, NewAccount, Store};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = Config::load(&args.config)?;

    match args.command {
        Commands::Init {
            units,
            admin_user,
            admin_password,
        } => cmd_init(&config, units, &admin_user, &admin_password).await,
        Commands::Status => cmd_status(&config).await,
        Commands::Agent { unit, account } => cmd_agent(&config, unit, account).await,
        Commands::Admin { command } => cmd_admin(&config, command).await,
        Commands::Account { command } => cmd_account(&config, command).await,
    }
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let level = if verbose { "debug" } else { "info" };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();
}

async fn open_store(config: &Config) -> Result<Arc<JsonStore>> {
    let store = JsonStore::open(&config.store_path)
        .await
        .with_context(|| format!("Failed to open store at {}", config.store_path.display()))?;
    Ok(Arc::new(store))
}

/// Bootstrap the terminal pool and the default administrator credential.
async fn cmd_init(
    config: &Config,
    units: Option<u32>,
    admin_user: &str,
    admin_password: &str,
) -> Result<()> {
    let store = open_store(config).await?;

    let pool_size = units.unwrap_or(config.unit_pool_size);
    let mut created = 0;
    for i in 1..=pool_size {
        let name = format!("PC-{i:02}");
        match store.insert_unit(&name).await {
            Ok(_) => created += 1,
            Err(store::StoreError::UnitExists(_)) => {}
            Err(e) => return Err(e).context("Failed to create terminal pool"),
        }
    }

    let hash = session::AdminAuthenticator::hash_password(admin_password)
        .map_err(|e| anyhow::anyhow!("Failed to hash admin password: {e}"))?;
    store.upsert_admin(admin_user, &hash).await?;

    println!(
        "Initialized store at {} ({created} new terminals, admin '{admin_user}')",
        config.store_path.display()
    );
    Ok(())
}

async fn cmd_status(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let units = store.list_units().await?;

    if units.is_empty() {
        println!("No terminals. Run `netcafe init` first.");
        return Ok(());
    }

    println!("{:<6} {:<10} {:<12} {:<8} {}", "ID", "NAME", "STATUS", "LOCKED", "SESSION");
    for unit in units {
        let session = match (unit.owner_account_id, unit.session_started_at) {
            (Some(owner), Some(started)) => {
                format!("account {owner} since {}", started.format("%H:%M:%S"))
            }
            _ => "-".to_string(),
        };
        println!(
            "{:<6} {:<10} {:<12} {:<8} {}",
            unit.id,
            unit.name,
            unit.status.to_string(),
            if unit.is_locked { "yes" } else { "no" },
            session
        );
    }
    Ok(())
}

/// The terminal-side agent: claim, start billing and kiosk blocking, then
/// follow session events until the session ends or the operator interrupts.
async fn cmd_agent(config: &Config, unit_id: i64, account_id: i64) -> Result<()> {
    let store = open_store(config).await?;
    let core = SessionCore::new(store, config);
    let mut events = core.subscribe();

    let ctx = match core.allocator.claim(unit_id, account_id).await? {
        ClaimOutcome::Claimed(ctx) => ctx,
        ClaimOutcome::Conflict(reason) => bail!("Cannot start session: {reason}"),
    };

    core.billing.start(ctx).await;
    core.lock.on_session_start(&ctx).await;
    info!(unit_id, account_id, "session running");
    println!("Session started on terminal {unit_id} for account {account_id}.");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::LowBalance { balance, minutes_left, .. }) => {
                    println!("Low balance warning: {balance} left, about {minutes_left} minutes remaining.");
                }
                Ok(SessionEvent::Ended { unit_id: ended_unit, cause }) if ended_unit == unit_id => {
                    println!("Session ended: {cause}.");
                    break;
                }
                Ok(SessionEvent::EmergencyUnlock) => {
                    println!("Input blocking disengaged by an administrator; session continues.");
                }
                Ok(_) => {}
                Err(e) => bail!("Event channel closed: {e}"),
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Logging out...");
                core.allocator.release(unit_id, EndCause::Logout).await;
                break;
            }
        }
    }

    if let Ok(summary) = core.allocator.session_summary(&ctx).await {
        println!(
            "Session summary: {}m used at {}/hour, cost {}, final balance {}",
            summary.elapsed_minutes, summary.hourly_rate, summary.total_cost, summary.final_balance
        );
    }
    Ok(())
}

async fn cmd_admin(config: &Config, command: AdminCommands) -> Result<()> {
    let store = open_store(config).await?;
    let core = SessionCore::new(store, config);

    match command {
        AdminCommands::Lock { unit, creds } => {
            core.lock
                .set_unit_locked(unit, true, &creds.user, &creds.password)
                .await
                .context("Failed to lock terminal")?;
            println!("Terminal {unit} locked.");
        }
        AdminCommands::Unlock { unit, creds } => {
            core.lock
                .set_unit_locked(unit, false, &creds.user, &creds.password)
                .await
                .context("Failed to unlock terminal")?;
            println!("Terminal {unit} unlocked.");
        }
        AdminCommands::ForceLogout { unit, creds } => {
            core.force_logout(unit, &creds.user, &creds.password)
                .await
                .context("Failed to force logout")?;
            println!("Session on terminal {unit} ended.");
        }
        AdminCommands::Kiosk { enabled, creds } => {
            core.lock
                .set_kiosk_mode(enabled, &creds.user, &creds.password)
                .await
                .context("Failed to change kiosk mode")?;
            println!(
                "Kiosk mode {}. Takes effect at the next session start.",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        AdminCommands::SetStatus { unit, status, creds } => {
            core.set_unit_status(unit, status, &creds.user, &creds.password)
                .await
                .context("Failed to change terminal status")?;
            println!("Terminal {unit} is now {status}.");
        }
        AdminCommands::EmergencyUnlock { creds } => {
            core.lock
                .emergency_unlock(&creds.user, &creds.password)
                .await
                .context("Emergency unlock refused")?;
            println!("Input blocking disengaged. The session keeps running.");
        }
    }
    Ok(())
}

async fn cmd_account(config: &Config, command: AccountCommands) -> Result<()> {
    let store = open_store(config).await?;

    match command {
        AccountCommands::Add {
            username,
            balance,
            hourly_rate,
            time_limit,
            pending,
        } => {
            let account = store
                .insert_account(NewAccount {
                    username,
                    balance,
                    hourly_rate,
                    session_time_limit_minutes: time_limit,
                    approved: !pending,
                })
                .await?;
            println!(
                "Created account {} ('{}', balance {}, {}).",
                account.id,
                account.username,
                account.balance,
                if account.approved { "approved" } else { "pending approval" }
            );
        }
        AccountCommands::Topup { account, amount } => {
            let balance = store.credit_account(account, amount).await?;
            println!("Account {account} topped up; new balance {balance}.");
        }
    }
    Ok(())
}
