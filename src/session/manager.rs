//! Session control surface.
//!
//! `SessionManager` is the entry point external callers use: start, stop,
//! status, send, manual disconnect. It owns the registry of running
//! drivers and the process-wide guards (initialization locks, cooldowns).

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, oneshot};

use crate::config::Config;
use crate::coordinator::{Acquisition, InstanceCoordinator};
use crate::db::{Database, LifecycleStatus, LifecycleUpdate, MessageRecord};
use crate::error::SessionError;
use crate::policy::ReconnectPolicy;
use crate::session::driver::{self, CleanupReport, Command, LifecycleNotification, SessionContext};
use crate::session::locks::{CooldownBook, InitLocks};
use crate::session::reducer::SessionEvent;
use crate::session::registry::{SessionHandle, SessionRegistry};
use crate::session::state::{SessionState, SessionStatus};
use crate::transport::{OutgoingContent, SendReceipt, TransportConnector};
use crate::vault::CredentialVault;
use crate::webhook::WebhookDispatcher;

pub struct SessionManager {
    ctx: Arc<SessionContext>,
    registry: SessionRegistry,
}

impl SessionManager {
    pub fn new(
        config: &Config,
        db: Arc<dyn Database>,
        connector: Arc<dyn TransportConnector>,
        webhook: Arc<dyn WebhookDispatcher>,
    ) -> Self {
        let vault = Arc::new(CredentialVault::new(config.vault.clone(), Arc::clone(&db)));
        let coordinator = Arc::new(InstanceCoordinator::new(
            config.coordinator.clone(),
            Arc::clone(&db),
        ));
        Self::with_components(config, db, vault, coordinator, connector, webhook)
    }

    /// Manager over explicitly constructed collaborators.
    pub fn with_components(
        config: &Config,
        db: Arc<dyn Database>,
        vault: Arc<CredentialVault>,
        coordinator: Arc<InstanceCoordinator>,
        connector: Arc<dyn TransportConnector>,
        webhook: Arc<dyn WebhookDispatcher>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(256);
        let ctx = SessionContext {
            db,
            vault,
            coordinator,
            connector,
            webhook,
            policy: ReconnectPolicy::new(config.reconnect.clone()),
            cooldowns: CooldownBook::new(),
            init_locks: InitLocks::new(config.session.init_lock_ceiling),
            notifications,
            session: config.session.clone(),
            health: config.health.clone(),
            dedup: config.dedup.clone(),
            forward_outbound: config.webhook.forward_outbound,
        };
        Self {
            ctx: Arc::new(ctx),
            registry: SessionRegistry::new(),
        }
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.ctx.vault
    }

    pub fn coordinator(&self) -> &Arc<InstanceCoordinator> {
        &self.ctx.coordinator
    }

    /// Receive every state transition of every session.
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleNotification> {
        self.ctx.notifications.subscribe()
    }

    /// Start (or return) the agent's session.
    ///
    /// Waits until the session has left INITIALIZING or the configured start
    /// wait elapses, so a fresh agent usually comes back in QR_PENDING with a
    /// pairing code and a resumed one in CONNECTED.
    pub async fn start(&self, agent_id: &str) -> Result<SessionStatus, SessionError> {
        self.ctx.vault.agent_dir(agent_id)?;

        if let Some((retry_after, reason)) = self.ctx.cooldowns.active(agent_id).await {
            tracing::info!(
                agent_id = %agent_id,
                retry_after_secs = retry_after.as_secs(),
                "Rejecting start during cooldown"
            );
            return Err(SessionError::Cooldown {
                agent_id: agent_id.to_string(),
                reason,
                retry_after,
            });
        }

        let existing = self.registry.get(agent_id).await;
        if let Some(handle) = &existing {
            let status = handle.status();
            if !handle.is_finished() && !status.state.is_parked() {
                return Ok(self.decorate(status).await);
            }
        }

        // A session registered but not yet started also looks parked, so
        // the lock is taken before anything is replaced.
        if !self.ctx.init_locks.try_acquire(agent_id).await {
            return Err(SessionError::InitializationInProgress {
                agent_id: agent_id.to_string(),
            });
        }
        // Ownership is settled before a parked session is touched, so a
        // conflict leaves it in place.
        let acquisition = match self.ctx.coordinator.acquire(agent_id).await {
            Ok(acquisition) => acquisition,
            Err(e) => {
                self.ctx.init_locks.release(agent_id).await;
                return Err(e);
            }
        };
        if let Some(handle) = existing {
            tracing::info!(
                agent_id = %agent_id,
                state = %handle.status().state,
                "Replacing parked session"
            );
            self.registry.remove(agent_id).await;
            self.request_cleanup(&handle, |reply| Command::Stop { reply })
                .await;
        }

        let result = self.activate(agent_id, acquisition).await;
        self.ctx.init_locks.release(agent_id).await;
        result
    }

    async fn activate(
        &self,
        agent_id: &str,
        acquisition: Acquisition,
    ) -> Result<SessionStatus, SessionError> {
        if let Acquisition::TookOver { previous } = acquisition {
            tracing::info!(
                agent_id = %agent_id,
                previous_instance = %previous.instance_id,
                "Activated after ownership takeover"
            );
        }

        let handle = driver::spawn(Arc::clone(&self.ctx), agent_id);
        let commands = handle.commands.clone();
        let mut status = handle.watch();
        if let Some(previous) = self.registry.update(handle).await {
            tracing::warn!(agent_id = %agent_id, "Registry already held a handle, replaced");
            self.request_cleanup(&previous, |reply| Command::Stop { reply })
                .await;
        }

        commands
            .send(Command::Event(SessionEvent::Start))
            .await
            .map_err(|_| SessionError::Terminated {
                agent_id: agent_id.to_string(),
            })?;

        let settled = match tokio::time::timeout(
            self.ctx.session.start_wait,
            status.wait_for(|s| {
                !matches!(s.state, SessionState::Uninitialized | SessionState::Initializing)
            }),
        )
        .await
        {
            Ok(Ok(snapshot)) => Some(snapshot.clone()),
            // Driver exited; its last status stands.
            Ok(Err(_)) => None,
            Err(_) => {
                tracing::warn!(agent_id = %agent_id, "Session still initializing after start wait");
                None
            }
        };
        let snapshot = settled.unwrap_or_else(|| status.borrow().clone());
        Ok(self.decorate(snapshot).await)
    }

    /// Stop the agent's session. Valid in every state, including when no
    /// session exists.
    pub async fn stop(&self, agent_id: &str) -> Result<CleanupReport, SessionError> {
        self.ctx.vault.agent_dir(agent_id)?;
        let mut report = match self.registry.remove(agent_id).await {
            Some(handle) => {
                self.request_cleanup(&handle, |reply| Command::Stop { reply })
                    .await
            }
            None => CleanupReport::new(agent_id, SessionState::Uninitialized),
        };
        report.init_lock_cleared = self.ctx.init_locks.release(agent_id).await;
        tracing::info!(agent_id = %agent_id, previous_state = %report.previous_state, "Session stopped");
        Ok(report)
    }

    /// Explicit user-initiated disconnect: unlink, wipe credentials, clear
    /// the cooldown, mark the record disconnected and release ownership.
    pub async fn disconnect(&self, agent_id: &str) -> Result<CleanupReport, SessionError> {
        self.ctx.vault.agent_dir(agent_id)?;
        if let Some(handle) = self.registry.remove(agent_id).await {
            if let Some(mut report) = self
                .try_request(&handle, |reply| Command::Disconnect { reply })
                .await
            {
                report.init_lock_cleared = self.ctx.init_locks.release(agent_id).await;
                return Ok(report);
            }
        }

        let mut report = reset_agent(&self.ctx.db, &self.ctx.vault, &self.ctx.coordinator, agent_id).await?;
        self.ctx.cooldowns.clear(agent_id).await;
        report.init_lock_cleared = self.ctx.init_locks.release(agent_id).await;
        let _ = self.ctx.notifications.send(LifecycleNotification {
            agent_id: agent_id.to_string(),
            from: report.previous_state,
            to: SessionState::Disconnected,
            at: Utc::now(),
        });
        Ok(report)
    }

    /// Coherent status snapshot. Agents without a live session are reported
    /// from their durable record.
    pub async fn get_status(&self, agent_id: &str) -> Result<SessionStatus, SessionError> {
        self.ctx.vault.agent_dir(agent_id)?;
        let status = match self.registry.get(agent_id).await {
            Some(handle) => handle.status(),
            None => {
                let record = self.ctx.db.get_session_record(agent_id).await?;
                SessionStatus::from_record(agent_id, record.as_ref())
            }
        };
        Ok(self.decorate(status).await)
    }

    pub async fn list_sessions(&self) -> Vec<SessionStatus> {
        let mut statuses = Vec::new();
        for handle in self.registry.list().await {
            statuses.push(self.decorate(handle.status()).await);
        }
        statuses
    }

    pub async fn send_message(
        &self,
        agent_id: &str,
        target: &str,
        content: OutgoingContent,
    ) -> Result<SendReceipt, SessionError> {
        let handle = self
            .registry
            .get(agent_id)
            .await
            .ok_or_else(|| SessionError::NotFound {
                agent_id: agent_id.to_string(),
            })?;
        let terminated = || SessionError::Terminated {
            agent_id: agent_id.to_string(),
        };

        let (reply, receipt) = oneshot::channel();
        handle
            .commands
            .send(Command::Send {
                target: target.to_string(),
                content,
                reply,
            })
            .await
            .map_err(|_| terminated())?;
        receipt.await.map_err(|_| terminated())?
    }

    /// Flag an inbound message as read. Returns false if no such message.
    pub async fn mark_read(&self, agent_id: &str, external_id: &str) -> Result<bool, SessionError> {
        Ok(self.ctx.db.mark_message_read(agent_id, external_id).await?)
    }

    pub async fn recent_messages(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, SessionError> {
        Ok(self.ctx.db.list_messages(agent_id, limit).await?)
    }

    /// Stop every session. Used on process shutdown.
    pub async fn shutdown(&self) -> Vec<CleanupReport> {
        let handles = self.registry.list().await;
        tracing::info!(sessions = handles.len(), "Shutting down sessions");
        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            self.registry.remove(&handle.agent_id).await;
            let mut report = self
                .request_cleanup(&handle, |reply| Command::Stop { reply })
                .await;
            report.init_lock_cleared = self.ctx.init_locks.release(&handle.agent_id).await;
            reports.push(report);
        }
        reports
    }

    /// Hide expired codes and attach the remaining cooldown.
    async fn decorate(&self, status: SessionStatus) -> SessionStatus {
        let mut status =
            status.without_expired_code(self.ctx.session.pairing_code_validity, Utc::now());
        if let Some((retry_after, _)) = self.ctx.cooldowns.active(&status.agent_id).await {
            status.retry_after = Some(retry_after);
        }
        status
    }

    async fn try_request<F>(&self, handle: &SessionHandle, command: F) -> Option<CleanupReport>
    where
        F: FnOnce(oneshot::Sender<CleanupReport>) -> Command,
    {
        let (reply, report) = oneshot::channel();
        handle.commands.send(command(reply)).await.ok()?;
        report.await.ok()
    }

    async fn request_cleanup<F>(&self, handle: &SessionHandle, command: F) -> CleanupReport
    where
        F: FnOnce(oneshot::Sender<CleanupReport>) -> Command,
    {
        if let Some(report) = self.try_request(handle, command).await {
            return report;
        }
        // The driver already exited and released what it held.
        CleanupReport::new(&handle.agent_id, handle.status().state)
    }
}

/// Manual disconnect against durable state only: wipe credential material,
/// mark the record disconnected and clear ownership.
pub async fn reset_agent(
    db: &Arc<dyn Database>,
    vault: &CredentialVault,
    coordinator: &InstanceCoordinator,
    agent_id: &str,
) -> Result<CleanupReport, SessionError> {
    let record = db.get_session_record(agent_id).await?;
    let previous = SessionStatus::from_record(agent_id, record.as_ref()).state;

    vault.delete(agent_id).await?;
    db.update_lifecycle(
        agent_id,
        &LifecycleUpdate::new(LifecycleStatus::Disconnected, false),
    )
    .await?;
    coordinator.release(agent_id).await?;
    tracing::info!(agent_id = %agent_id, "Agent reset to disconnected");

    let mut report = CleanupReport::new(agent_id, previous);
    report.ownership_released = true;
    Ok(report)
}
