//! Per-agent session driver.
//!
//! One task per agent owns the [`Session`], the live transport handle, and
//! the health monitor. Commands from the manager, transport events, health
//! reports and timers are all funneled into [`reduce`]; the driver then
//! performs the returned effects in order. Message ingestion runs on a
//! separate worker so a slow webhook never stalls the state machine, while
//! jobs for one agent are still processed in arrival order.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{DedupConfig, HealthConfig, SessionConfig};
use crate::coordinator::InstanceCoordinator;
use crate::db::Database;
use crate::error::{FailureInfo, FailureKind, SessionError, TransportError, VaultError};
use crate::health::{ActivityClock, HealthIssue, HealthMonitor, HealthReport, MonitorTargets};
use crate::ingest::IngestPipeline;
use crate::policy::ReconnectPolicy;
use crate::session::locks::{CooldownBook, InitLocks};
use crate::session::reducer::{Effect, ReduceContext, SessionEvent, reduce};
use crate::session::registry::SessionHandle;
use crate::session::state::{Session, SessionState, SessionStatus};
use crate::transport::{
    CloseSignal, OutgoingContent, RawMessage, SendReceipt, Transport, TransportConnector,
    TransportEvent, TransportSession, codes,
};
use crate::vault::{CredentialVault, Freshness, SaveOutcome};
use crate::webhook::WebhookDispatcher;

/// A state transition, published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleNotification {
    pub agent_id: String,
    pub from: SessionState,
    pub to: SessionState,
    pub at: DateTime<Utc>,
}

/// What `stop()` tore down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub agent_id: String,
    pub previous_state: SessionState,
    pub health_monitor_cancelled: bool,
    pub transport_closed: bool,
    pub ownership_released: bool,
    pub init_lock_cleared: bool,
}

impl CleanupReport {
    pub fn new(agent_id: impl Into<String>, previous_state: SessionState) -> Self {
        Self {
            agent_id: agent_id.into(),
            previous_state,
            health_monitor_cancelled: false,
            transport_closed: false,
            ownership_released: false,
            init_lock_cleared: false,
        }
    }
}

/// Collaborators shared by every driver in the process.
pub(crate) struct SessionContext {
    pub db: Arc<dyn Database>,
    pub vault: Arc<CredentialVault>,
    pub coordinator: Arc<InstanceCoordinator>,
    pub connector: Arc<dyn TransportConnector>,
    pub webhook: Arc<dyn WebhookDispatcher>,
    pub policy: ReconnectPolicy,
    pub cooldowns: CooldownBook,
    pub init_locks: InitLocks,
    pub notifications: broadcast::Sender<LifecycleNotification>,
    pub session: SessionConfig,
    pub health: HealthConfig,
    pub dedup: DedupConfig,
    pub forward_outbound: bool,
}

pub(crate) type SendReply = oneshot::Sender<Result<SendReceipt, SessionError>>;

/// Requests from the manager.
pub(crate) enum Command {
    Event(SessionEvent),
    Send {
        target: String,
        content: OutgoingContent,
        reply: SendReply,
    },
    Stop {
        reply: oneshot::Sender<CleanupReport>,
    },
    Disconnect {
        reply: oneshot::Sender<CleanupReport>,
    },
}

enum IngestJob {
    Raw {
        raw: RawMessage,
        own_identity: Option<String>,
    },
    LocalSend {
        own_identity: Option<String>,
        target: String,
        content: OutgoingContent,
        receipt: SendReceipt,
        reply: SendReply,
    },
}

enum Wake {
    Command(Option<Command>),
    Transport(Option<TransportEvent>),
    Health(HealthReport),
    RetryDue,
    CodeExpired,
}

struct Driver {
    ctx: Arc<SessionContext>,
    session: Session,
    commands: mpsc::Receiver<Command>,
    status: Arc<watch::Sender<SessionStatus>>,
    transport: Option<Arc<dyn Transport>>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    monitor: Option<HealthMonitor>,
    generation: u64,
    health_tx: mpsc::Sender<HealthReport>,
    health_rx: mpsc::Receiver<HealthReport>,
    clock: ActivityClock,
    retry_at: Option<Instant>,
    owns: bool,
    ingest: mpsc::UnboundedSender<IngestJob>,
    cleanup: Option<CleanupReport>,
    terminated: bool,
}

/// Spawn a driver for `agent_id`. The caller has already acquired ownership.
pub(crate) fn spawn(ctx: Arc<SessionContext>, agent_id: &str) -> SessionHandle {
    let session = Session::new(agent_id);
    let initial = session.status(ctx.session.pairing_code_validity, Utc::now());
    let (status_tx, status_rx) = watch::channel(initial);
    let status = Arc::new(status_tx);
    let (commands_tx, commands) = mpsc::channel(32);
    let (health_tx, health_rx) = mpsc::channel(8);

    let pipeline = Arc::new(IngestPipeline::new(
        agent_id,
        Arc::clone(&ctx.db),
        Arc::clone(&ctx.webhook),
        ctx.dedup.clone(),
        ctx.forward_outbound,
    ));
    let (ingest, jobs) = mpsc::unbounded_channel();
    let worker = spawn_ingest_worker(pipeline, jobs);

    let driver = Driver {
        ctx: Arc::clone(&ctx),
        session,
        commands,
        status: Arc::clone(&status),
        transport: None,
        events: None,
        monitor: None,
        generation: 0,
        health_tx,
        health_rx,
        clock: ActivityClock::new(),
        retry_at: None,
        owns: true,
        ingest,
        cleanup: None,
        terminated: false,
    };

    let id = agent_id.to_string();
    let task = tokio::spawn(async move {
        let result = tokio::spawn(driver.run()).await;
        if let Err(e) = result {
            if e.is_panic() {
                supervise_panic(&ctx, &id, &status).await;
            }
        }
        // Lets queued jobs finish; the worker exits when its sender drops.
        drop(worker);
    });

    SessionHandle::new(agent_id, commands_tx, status_rx, task)
}

/// A panicked driver leaves no session behind; record FATAL_ERROR and
/// release what it held.
async fn supervise_panic(
    ctx: &SessionContext,
    agent_id: &str,
    status: &watch::Sender<SessionStatus>,
) {
    tracing::error!(agent_id = %agent_id, "Session driver panicked");
    let mut from = SessionState::Uninitialized;
    status.send_modify(|s| {
        from = s.state;
        s.state = SessionState::FatalError;
        s.pairing_code = None;
        s.pairing_code_issued_at = None;
        s.failure = Some(FailureInfo::new(
            FailureKind::Unknown,
            "session driver panicked",
        ));
    });
    let _ = ctx.notifications.send(LifecycleNotification {
        agent_id: agent_id.to_string(),
        from,
        to: SessionState::FatalError,
        at: Utc::now(),
    });
    if let Err(e) = ctx.coordinator.release(agent_id).await {
        tracing::warn!(agent_id = %agent_id, "Failed to release ownership: {}", e);
    }
}

fn spawn_ingest_worker(
    pipeline: Arc<IngestPipeline>,
    mut jobs: mpsc::UnboundedReceiver<IngestJob>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(job) = jobs.recv().await {
            match job {
                IngestJob::Raw { raw, own_identity } => {
                    if let Err(e) = pipeline.ingest(&raw, own_identity.as_deref()).await {
                        tracing::error!(
                            agent_id = %pipeline.agent_id(),
                            message_id = ?raw.id,
                            "Failed to ingest message: {}",
                            e
                        );
                    }
                }
                IngestJob::LocalSend {
                    own_identity,
                    target,
                    content,
                    receipt,
                    reply,
                } => {
                    if let Err(e) = pipeline
                        .record_local_send(own_identity.as_deref(), &target, &content, &receipt)
                        .await
                    {
                        tracing::error!(
                            agent_id = %pipeline.agent_id(),
                            message_id = %receipt.message_id,
                            "Sent message could not be recorded: {}",
                            e
                        );
                    }
                    let _ = reply.send(Ok(receipt));
                }
            }
        }
    })
}

async fn recv_event(events: &mut Option<mpsc::Receiver<TransportEvent>>) -> Option<TransportEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        tracing::debug!(agent_id = %self.session.agent_id, "Session driver started");
        while !self.terminated {
            let retry_at = self.retry_at;
            let code_expiry = self.code_expiry();

            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                event = recv_event(&mut self.events) => Wake::Transport(event),
                Some(report) = self.health_rx.recv() => Wake::Health(report),
                _ = sleep_until_opt(retry_at) => Wake::RetryDue,
                _ = sleep_until_opt(code_expiry) => Wake::CodeExpired,
            };

            match wake {
                Wake::Command(Some(command)) => self.on_command(command).await,
                Wake::Command(None) => {
                    // Every handle is gone; nobody can stop us later.
                    self.dispatch(SessionEvent::Stop).await;
                }
                Wake::Transport(event) => self.on_transport_event(event).await,
                Wake::Health(report) => self.on_health_report(report).await,
                Wake::RetryDue => {
                    self.retry_at = None;
                    self.dispatch(SessionEvent::RetryTimerFired).await;
                }
                Wake::CodeExpired => self.dispatch(SessionEvent::PairingCodeExpired).await,
            }
        }
        tracing::debug!(agent_id = %self.session.agent_id, state = %self.session.state(), "Session driver exited");
    }

    fn code_expiry(&self) -> Option<Instant> {
        let code = self.session.pairing_code.as_ref()?;
        let validity = chrono::Duration::from_std(self.ctx.session.pairing_code_validity).ok()?;
        let remaining = (code.issued_at + validity - Utc::now())
            .to_std()
            .unwrap_or_default();
        Some(Instant::now() + remaining)
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Event(event) => self.dispatch(event).await,
            Command::Send {
                target,
                content,
                reply,
            } => self.send(target, content, reply).await,
            Command::Stop { reply } => {
                let report = self.tear_down(SessionEvent::Stop).await;
                let _ = reply.send(report);
            }
            Command::Disconnect { reply } => {
                let report = self.tear_down(SessionEvent::ManualReset).await;
                let _ = reply.send(report);
            }
        }
    }

    async fn tear_down(&mut self, event: SessionEvent) -> CleanupReport {
        let agent_id = self.session.agent_id.clone();
        let previous = self.session.state();
        self.cleanup = Some(CleanupReport::new(&agent_id, previous));
        self.dispatch(event).await;
        self.cleanup
            .take()
            .unwrap_or_else(|| CleanupReport::new(agent_id, previous))
    }

    async fn send(&mut self, target: String, content: OutgoingContent, reply: SendReply) {
        let transport = match (&self.transport, self.session.state()) {
            (Some(transport), SessionState::Connected) => Arc::clone(transport),
            (_, state) => {
                let _ = reply.send(Err(SessionError::NotConnected {
                    agent_id: self.session.agent_id.clone(),
                    state: state.to_string(),
                }));
                return;
            }
        };

        match transport.send(&target, &content).await {
            Ok(receipt) => {
                self.clock.touch();
                let job = IngestJob::LocalSend {
                    own_identity: self.session.identity.clone(),
                    target,
                    content,
                    receipt,
                    reply,
                };
                self.enqueue(job).await;
            }
            Err(e) => {
                tracing::warn!(agent_id = %self.session.agent_id, target = %target, "Send failed: {}", e);
                let _ = reply.send(Err(e.into()));
            }
        }
    }

    async fn enqueue(&mut self, job: IngestJob) {
        if self.ingest.send(job).is_err() {
            self.dispatch(SessionEvent::InternalError {
                reason: "ingest worker stopped".to_string(),
            })
            .await;
        }
    }

    async fn on_transport_event(&mut self, event: Option<TransportEvent>) {
        self.clock.touch();
        let event = match event {
            Some(event) => event,
            None => {
                self.events = None;
                let signal = CloseSignal::with_code(codes::CONNECTION_CLOSED, "transport stream ended");
                self.dispatch(SessionEvent::Closed(signal)).await;
                return;
            }
        };

        match event {
            TransportEvent::Opened { identity } => {
                self.dispatch(SessionEvent::TransportOpened { identity }).await
            }
            TransportEvent::Closed(signal) => self.dispatch(SessionEvent::Closed(signal)).await,
            TransportEvent::PairingCodeIssued(code) => {
                self.dispatch(SessionEvent::PairingCodeIssued {
                    code,
                    at: Utc::now(),
                })
                .await
            }
            TransportEvent::CredentialUpdated(material) => {
                match self.ctx.vault.save(&self.session.agent_id, &material).await {
                    Ok(SaveOutcome::Persisted { mirrored }) => {
                        tracing::debug!(agent_id = %self.session.agent_id, mirrored, "Credential update persisted");
                    }
                    Ok(SaveOutcome::Rejected(reason)) => {
                        tracing::warn!(
                            agent_id = %self.session.agent_id,
                            "Dropped invalid credential update: {}",
                            reason
                        );
                    }
                    Err(e) => {
                        tracing::error!(agent_id = %self.session.agent_id, "Failed to persist credentials: {}", e);
                    }
                }
            }
            TransportEvent::MessageReceived(raw) => {
                if self.session.state() != SessionState::Connected {
                    tracing::debug!(
                        agent_id = %self.session.agent_id,
                        state = %self.session.state(),
                        "Dropping message received outside CONNECTED"
                    );
                    return;
                }
                let job = IngestJob::Raw {
                    raw,
                    own_identity: self.session.identity.clone(),
                };
                self.enqueue(job).await;
            }
        }
    }

    async fn on_health_report(&mut self, report: HealthReport) {
        if self.monitor.is_none() || report.generation != self.generation {
            tracing::debug!(
                agent_id = %self.session.agent_id,
                generation = report.generation,
                "Ignoring report from detached monitor"
            );
            return;
        }
        tracing::warn!(
            agent_id = %self.session.agent_id,
            issue = ?report.issue,
            "Health monitor reported: {}",
            report.reason
        );
        let event = match report.issue {
            HealthIssue::ProbeFailed | HealthIssue::Silent => SessionEvent::HealthFailed {
                reason: report.reason,
            },
            HealthIssue::OwnershipLost => {
                self.owns = false;
                SessionEvent::OwnershipLost {
                    reason: report.reason,
                }
            }
        };
        self.dispatch(event).await;
    }

    /// Apply an event and everything it causes.
    async fn dispatch(&mut self, event: SessionEvent) {
        let ctx = Arc::clone(&self.ctx);
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let before = self.session.state();
            let reduce_ctx = ReduceContext {
                policy: &ctx.policy,
                pairing_code_validity: ctx.session.pairing_code_validity,
                now: Utc::now(),
            };
            let effects = reduce(&mut self.session, &event, &reduce_ctx);
            let after = self.session.state();

            if before != after {
                tracing::info!(
                    agent_id = %self.session.agent_id,
                    from = %before,
                    to = %after,
                    "Session state changed"
                );
                let _ = ctx.notifications.send(LifecycleNotification {
                    agent_id: self.session.agent_id.clone(),
                    from: before,
                    to: after,
                    at: Utc::now(),
                });
            }

            for effect in effects {
                if let Some(next) = self.perform(effect).await {
                    queue.push_back(next);
                }
            }
            self.publish();
        }
    }

    fn publish(&self) {
        let status = self
            .session
            .status(self.ctx.session.pairing_code_validity, Utc::now());
        self.status.send_replace(status);
    }

    async fn perform(&mut self, effect: Effect) -> Option<SessionEvent> {
        let agent_id = self.session.agent_id.clone();
        match effect {
            Effect::Connect => return self.connect().await,
            Effect::TearDownTransport => {
                self.retry_at = None;
                self.events = None;
                if let Some(transport) = self.transport.take() {
                    if let Err(e) = transport.close().await {
                        tracing::debug!(agent_id = %agent_id, "Transport close failed: {}", e);
                    }
                    if let Some(report) = self.cleanup.as_mut() {
                        report.transport_closed = true;
                    }
                }
            }
            Effect::Logout => {
                if let Some(transport) = &self.transport {
                    if let Err(e) = transport.logout().await {
                        tracing::warn!(agent_id = %agent_id, "Logout failed: {}", e);
                    }
                }
            }
            Effect::ScheduleReconnect(delay) => {
                tracing::info!(agent_id = %agent_id, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
                self.retry_at = Some(Instant::now() + delay);
            }
            Effect::WipeCredentials => {
                if let Err(e) = self.ctx.vault.delete(&agent_id).await {
                    tracing::error!(agent_id = %agent_id, "Failed to wipe credentials: {}", e);
                }
            }
            Effect::ArmCooldown { duration, reason } => {
                self.ctx.cooldowns.arm(&agent_id, duration, reason).await;
            }
            Effect::ClearCooldown => self.ctx.cooldowns.clear(&agent_id).await,
            Effect::AttachHealthMonitor => self.attach_monitor(),
            Effect::DetachHealthMonitor => {
                if let Some(mut monitor) = self.monitor.take() {
                    let cancelled = monitor.detach();
                    if let Some(report) = self.cleanup.as_mut() {
                        report.health_monitor_cancelled = cancelled;
                    }
                }
            }
            Effect::PersistLifecycle => {
                if let Some(update) = self.session.lifecycle_update() {
                    if let Err(e) = self.ctx.db.update_lifecycle(&agent_id, &update).await {
                        tracing::error!(agent_id = %agent_id, "Failed to persist lifecycle: {}", e);
                    }
                }
            }
            Effect::ReleaseOwnership => {
                if self.owns {
                    match self.ctx.coordinator.release(&agent_id).await {
                        Ok(()) => {
                            self.owns = false;
                            if let Some(report) = self.cleanup.as_mut() {
                                report.ownership_released = true;
                            }
                        }
                        Err(e) => {
                            tracing::error!(agent_id = %agent_id, "Failed to release ownership: {}", e);
                        }
                    }
                }
            }
            Effect::Terminate => self.terminated = true,
        }
        None
    }

    fn attach_monitor(&mut self) {
        let Some(transport) = self.transport.clone() else {
            tracing::warn!(agent_id = %self.session.agent_id, "Connected without a transport handle");
            return;
        };
        self.generation += 1;
        let targets = MonitorTargets {
            transport,
            clock: self.clock.clone(),
            coordinator: Arc::clone(&self.ctx.coordinator),
            vault: Arc::clone(&self.ctx.vault),
        };
        self.monitor = Some(HealthMonitor::attach(
            &self.session.agent_id,
            self.generation,
            &self.ctx.health,
            targets,
            self.health_tx.clone(),
        ));
    }

    /// Load usable credentials and open a transport. A failure comes back
    /// as a close event for the reducer.
    async fn connect(&mut self) -> Option<SessionEvent> {
        self.retry_at = None;
        self.events = None;
        if let Some(stale) = self.transport.take() {
            let _ = stale.close().await;
        }

        let agent_id = self.session.agent_id.clone();
        let credentials = match self.ctx.vault.load(&agent_id).await {
            Ok(Some(material)) => match self.ctx.vault.validate_freshness(&agent_id, &material).await {
                Freshness::Valid => Some(material),
                Freshness::Invalid(reason) => {
                    tracing::info!(agent_id = %agent_id, "Stored credentials not reusable: {}", reason);
                    None
                }
            },
            Ok(None) => None,
            Err(VaultError::Corrupted { reason, .. }) => {
                return Some(SessionEvent::Closed(CloseSignal::with_code(
                    codes::BAD_SESSION,
                    format!("stored credentials corrupted: {}", reason),
                )));
            }
            Err(e) => {
                return Some(SessionEvent::Closed(CloseSignal::new(
                    None,
                    format!("credential store unavailable: {}", e),
                )));
            }
        };

        tracing::info!(
            agent_id = %agent_id,
            resuming = credentials.is_some(),
            attempt = self.session.attempts.reconnect,
            "Opening transport"
        );
        match self.ctx.connector.connect(&agent_id, credentials).await {
            Ok(TransportSession { handle, events }) => {
                self.transport = Some(handle);
                self.events = Some(events);
                self.clock.touch();
                None
            }
            Err(TransportError::Handshake {
                signal: Some(signal),
                ..
            }) => Some(SessionEvent::Closed(signal)),
            Err(e) => Some(SessionEvent::Closed(CloseSignal::connection_lost(e.to_string()))),
        }
    }
}
