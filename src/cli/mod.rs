//! Operator commands.
//!
//! Everything here works against durable state (database and credential
//! directory) and never opens a transport.

use std::sync::Arc;

use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::coordinator::InstanceCoordinator;
use crate::db::{Database, PgDatabase};
use crate::session::{SessionStatus, reset_agent};
use crate::vault::CredentialVault;

#[derive(Parser, Debug)]
#[command(name = "tether", version, about = "Session manager for long-lived messaging connections")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Apply pending database migrations
    Migrate,

    /// Show the durable status of an agent
    Status {
        /// Agent id
        agent: String,
    },

    /// Wipe credentials and mark the agent disconnected
    Reset {
        agent: String,
    },

    /// Take a credential snapshot now
    Backup {
        agent: String,
    },

    /// List credential snapshots, newest first
    Backups {
        agent: String,
    },

    /// Restore the newest usable credential snapshot
    Restore {
        agent: String,
    },

    /// Show recently stored messages
    Messages {
        agent: String,

        /// Maximum number of messages to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

/// Run an operator command.
pub async fn run_command(cmd: Command, config: Config) -> anyhow::Result<()> {
    let db = connect(&config).await?;
    let vault = CredentialVault::new(config.vault.clone(), Arc::clone(&db));

    match cmd {
        Command::Migrate => {
            // `connect` already migrated.
            println!("Migrations applied.");
            Ok(())
        }
        Command::Status { agent } => show_status(&db, &vault, &agent).await,
        Command::Reset { agent } => {
            let coordinator = InstanceCoordinator::new(config.coordinator.clone(), Arc::clone(&db));
            let report = reset_agent(&db, &vault, &coordinator, &agent).await?;
            println!(
                "Agent {} reset (was {}).",
                report.agent_id, report.previous_state
            );
            Ok(())
        }
        Command::Backup { agent } => {
            match vault.snapshot(&agent).await? {
                Some(path) => println!("Snapshot written: {}", path.display()),
                None => println!("No credentials stored for {}.", agent),
            }
            Ok(())
        }
        Command::Backups { agent } => {
            let backups = vault.list_backups(&agent).await?;
            if backups.is_empty() {
                println!("No snapshots for {}.", agent);
            }
            for path in backups {
                println!("  {}", path.display());
            }
            Ok(())
        }
        Command::Restore { agent } => {
            match vault.restore_latest_backup(&agent).await? {
                Some(path) => println!("Restored from {}", path.display()),
                None => anyhow::bail!("no usable snapshot for {}", agent),
            }
            Ok(())
        }
        Command::Messages { agent, limit } => {
            let messages = db.list_messages(&agent, limit).await?;
            for m in messages {
                println!(
                    "{}  {:<3} {:<14} {:<16} {}",
                    m.sent_at.format("%Y-%m-%d %H:%M:%S"),
                    m.direction.as_str(),
                    m.origin.as_str(),
                    m.peer,
                    m.content.body().unwrap_or(m.content.variant())
                );
            }
            Ok(())
        }
    }
}

async fn connect(config: &Config) -> anyhow::Result<Arc<dyn Database>> {
    let db = PgDatabase::new(config.require_database()?).await?;
    db.run_migrations().await?;
    Ok(Arc::new(db))
}

async fn show_status(db: &Arc<dyn Database>, vault: &CredentialVault, agent: &str) -> anyhow::Result<()> {
    let record = db.get_session_record(agent).await?;
    let status = SessionStatus::from_record(agent, record.as_ref());

    println!("Agent:       {}", agent);
    println!("State:       {}", status.state);
    println!("Identity:    {}", status.identity.as_deref().unwrap_or("-"));
    println!("Credentials: {}", if vault.exists(agent).await? { "stored" } else { "none" });
    if let Some(failure) = &status.failure {
        println!("Failure:     {} ({})", failure.kind, failure.reason);
    }
    if let Some(owner) = record.as_ref().and_then(|r| r.owner.as_ref()) {
        println!("Owner:       {} pid {} ({})", owner.host, owner.pid, owner.instance_id);
    }
    if let Some(at) = record.as_ref().and_then(|r| r.last_heartbeat_at) {
        println!("Heartbeat:   {}", at.to_rfc3339());
    }
    Ok(())
}
