//! Instance coordinator.
//!
//! Decides whether this process may drive an agent's session, based on the
//! ownership fields of the durable session record. Arbitration is heuristic:
//! a foreign owner is displaced only when its heartbeat is stale or, on the
//! same host, its process is no longer alive. Two instances racing past the
//! read can both claim; the last claim wins and the loser's heartbeat
//! refresh starts failing.

use std::sync::Arc;

use chrono::Utc;
use sysinfo::{Pid, System};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::db::{Database, OwnerIdentity};
use crate::error::{DatabaseError, SessionError};

/// Checks whether a process on this host is alive.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Process probe backed by the OS process table.
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let mut system = System::new();
        system.refresh_process(Pid::from_u32(pid))
    }
}

/// Why activation was allowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// Nobody owned the agent, or this instance already did.
    Claimed,
    /// A previous owner was displaced.
    TookOver { previous: OwnerIdentity },
}

pub struct InstanceCoordinator {
    config: CoordinatorConfig,
    db: Arc<dyn Database>,
    identity: OwnerIdentity,
    probe: Arc<dyn ProcessProbe>,
}

impl InstanceCoordinator {
    /// Coordinator identifying as the current process.
    pub fn new(config: CoordinatorConfig, db: Arc<dyn Database>) -> Self {
        let identity = OwnerIdentity {
            instance_id: Uuid::new_v4(),
            host: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            pid: std::process::id(),
        };
        Self::with_identity(config, db, identity, Arc::new(SystemProbe))
    }

    pub fn with_identity(
        config: CoordinatorConfig,
        db: Arc<dyn Database>,
        identity: OwnerIdentity,
        probe: Arc<dyn ProcessProbe>,
    ) -> Self {
        Self {
            config,
            db,
            identity,
            probe,
        }
    }

    pub fn identity(&self) -> &OwnerIdentity {
        &self.identity
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Claim the agent for this instance, or fail with an ownership conflict.
    pub async fn acquire(&self, agent_id: &str) -> Result<Acquisition, SessionError> {
        let now = Utc::now();
        let record = self.db.get_session_record(agent_id).await?;

        let current = record
            .as_ref()
            .and_then(|r| r.owner.clone().map(|o| (o, r.last_heartbeat_at)));

        let outcome = match current {
            None => Acquisition::Claimed,
            Some((owner, _)) if owner.instance_id == self.identity.instance_id => {
                Acquisition::Claimed
            }
            Some((owner, heartbeat)) => {
                let age = heartbeat.map(|at| now.signed_duration_since(at));
                let stale = match age {
                    None => true,
                    Some(age) => age.to_std().is_ok_and(|age| age > self.config.stale_after),
                };
                let dead_locally =
                    owner.host == self.identity.host && !self.probe.is_alive(owner.pid);

                if !stale && !dead_locally {
                    let heartbeat_age_secs = age.map(|a| a.num_seconds()).unwrap_or(-1);
                    tracing::warn!(
                        agent_id = %agent_id,
                        owner_instance = %owner.instance_id,
                        owner_host = %owner.host,
                        heartbeat_age_secs,
                        "Agent is owned by another live instance"
                    );
                    return Err(SessionError::OwnershipConflict {
                        agent_id: agent_id.to_string(),
                        owner_instance: owner.instance_id.to_string(),
                        owner_host: owner.host.clone(),
                        heartbeat_age_secs,
                    });
                }

                tracing::info!(
                    agent_id = %agent_id,
                    previous_instance = %owner.instance_id,
                    previous_host = %owner.host,
                    previous_pid = owner.pid,
                    stale,
                    dead_locally,
                    "Taking over agent ownership"
                );
                Acquisition::TookOver { previous: owner }
            }
        };

        self.db
            .claim_ownership(agent_id, &self.identity, now)
            .await?;
        Ok(outcome)
    }

    /// Refresh the heartbeat. Returns false if another instance now owns the
    /// agent.
    pub async fn heartbeat(&self, agent_id: &str) -> Result<bool, DatabaseError> {
        self.db
            .touch_heartbeat(agent_id, self.identity.instance_id, Utc::now())
            .await
    }

    /// Clear ownership fields unconditionally.
    pub async fn release(&self, agent_id: &str) -> Result<(), DatabaseError> {
        self.db.clear_ownership(agent_id).await?;
        tracing::debug!(agent_id = %agent_id, "Ownership released");
        Ok(())
    }
}
