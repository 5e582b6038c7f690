//! Health monitor for connected sessions.
//!
//! While a session is CONNECTED four periodic tasks run next to it:
//!
//! - a keepalive probe with a per-probe timeout and a consecutive-failure
//!   limit
//! - a silence watchdog over the session's activity clock
//! - the ownership heartbeat
//! - a credential snapshot
//!
//! Problems are reported to the session driver over a channel; the monitor
//! never tears anything down itself. Reports carry the generation they were
//! attached under so the driver can drop reports from a detached monitor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::HealthConfig;
use crate::coordinator::InstanceCoordinator;
use crate::transport::Transport;
use crate::vault::CredentialVault;

/// What the monitor detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthIssue {
    ProbeFailed,
    Silent,
    OwnershipLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub generation: u64,
    pub issue: HealthIssue,
    pub reason: String,
}

/// Time of the last observed transport activity.
#[derive(Debug, Clone)]
pub struct ActivityClock {
    base: Instant,
    last_ms: Arc<AtomicU64>,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record activity now.
    pub fn touch(&self) {
        let elapsed = self.base.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    /// Time since the last recorded activity.
    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.base.elapsed().saturating_sub(last)
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// What the monitor watches.
pub struct MonitorTargets {
    pub transport: Arc<dyn Transport>,
    pub clock: ActivityClock,
    pub coordinator: Arc<InstanceCoordinator>,
    pub vault: Arc<CredentialVault>,
}

/// Handle to the tasks of one attached monitor. Dropping it detaches.
pub struct HealthMonitor {
    agent_id: String,
    tasks: Vec<JoinHandle<()>>,
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

impl HealthMonitor {
    pub fn attach(
        agent_id: &str,
        generation: u64,
        config: &HealthConfig,
        targets: MonitorTargets,
        reports: mpsc::Sender<HealthReport>,
    ) -> Self {
        tracing::debug!(agent_id = %agent_id, generation, "Attaching health monitor");
        let MonitorTargets {
            transport,
            clock,
            coordinator,
            vault,
        } = targets;

        let probe = {
            let agent_id = agent_id.to_string();
            let reports = reports.clone();
            let interval = config.probe_interval;
            let timeout = config.probe_timeout;
            let max_failures = config.max_probe_failures.max(1);
            tokio::spawn(async move {
                let mut ticks = ticker(interval);
                let mut failures = 0u32;
                loop {
                    ticks.tick().await;
                    let outcome = match tokio::time::timeout(timeout, transport.probe()).await {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => Some(e.to_string()),
                        Err(_) => Some(format!("probe timed out after {:?}", timeout)),
                    };
                    match outcome {
                        None => failures = 0,
                        Some(reason) => {
                            failures += 1;
                            tracing::warn!(
                                agent_id = %agent_id,
                                failures,
                                max_failures,
                                "Keepalive probe failed: {}",
                                reason
                            );
                            if failures >= max_failures {
                                let _ = reports
                                    .send(HealthReport {
                                        generation,
                                        issue: HealthIssue::ProbeFailed,
                                        reason: format!(
                                            "{} consecutive probe failures: {}",
                                            failures, reason
                                        ),
                                    })
                                    .await;
                                return;
                            }
                        }
                    }
                }
            })
        };

        let silence = {
            let agent_id = agent_id.to_string();
            let reports = reports.clone();
            let threshold = config.silence_threshold;
            let check = config.check_interval;
            tokio::spawn(async move {
                let mut ticks = ticker(check);
                loop {
                    ticks.tick().await;
                    let idle = clock.idle();
                    if idle >= threshold {
                        tracing::warn!(
                            agent_id = %agent_id,
                            idle_secs = idle.as_secs(),
                            "No transport activity within silence threshold"
                        );
                        let _ = reports
                            .send(HealthReport {
                                generation,
                                issue: HealthIssue::Silent,
                                reason: format!("no activity for {:?}", idle),
                            })
                            .await;
                        return;
                    }
                }
            })
        };

        let heartbeat = {
            let agent_id = agent_id.to_string();
            let interval = coordinator.config().heartbeat_interval;
            tokio::spawn(async move {
                let mut ticks = ticker(interval);
                loop {
                    ticks.tick().await;
                    match coordinator.heartbeat(&agent_id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            let _ = reports
                                .send(HealthReport {
                                    generation,
                                    issue: HealthIssue::OwnershipLost,
                                    reason: "another instance owns this agent".to_string(),
                                })
                                .await;
                            return;
                        }
                        Err(e) => {
                            tracing::warn!(agent_id = %agent_id, "Heartbeat refresh failed: {}", e);
                        }
                    }
                }
            })
        };

        let snapshot = {
            let agent_id = agent_id.to_string();
            let interval = vault.config().backup_interval;
            tokio::spawn(async move {
                let mut ticks = ticker(interval);
                loop {
                    ticks.tick().await;
                    if let Err(e) = vault.snapshot(&agent_id).await {
                        tracing::warn!(agent_id = %agent_id, "Credential snapshot failed: {}", e);
                    }
                }
            })
        };

        Self {
            agent_id: agent_id.to_string(),
            tasks: vec![probe, silence, heartbeat, snapshot],
        }
    }

    /// Cancel every monitoring task. Returns whether any were running.
    pub fn detach(&mut self) -> bool {
        let running = self.tasks.iter().any(|t| !t.is_finished());
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if running {
            tracing::debug!(agent_id = %self.agent_id, "Health monitor detached");
        }
        running
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::config::{CoordinatorConfig, VaultConfig};
    use crate::db::{Database, MemoryDatabase, OwnerIdentity};
    use crate::transport::scripted::ScriptedTransport;

    struct Fixture {
        _dir: TempDir,
        db: Arc<MemoryDatabase>,
        coordinator: Arc<InstanceCoordinator>,
        vault: Arc<CredentialVault>,
    }

    fn fixture(heartbeat_interval: Duration) -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(MemoryDatabase::new());
        let coordinator = Arc::new(InstanceCoordinator::new(
            CoordinatorConfig {
                heartbeat_interval,
                ..CoordinatorConfig::default()
            },
            db.clone(),
        ));
        let vault = Arc::new(CredentialVault::new(
            VaultConfig::default().with_root(dir.path()),
            db.clone(),
        ));
        Fixture {
            _dir: dir,
            db,
            coordinator,
            vault,
        }
    }

    fn quiet_config() -> HealthConfig {
        HealthConfig {
            probe_interval: Duration::from_secs(3600),
            probe_timeout: Duration::from_secs(1),
            max_probe_failures: 3,
            silence_threshold: Duration::from_secs(3600),
            check_interval: Duration::from_secs(3600),
        }
    }

    fn targets(f: &Fixture, transport: Arc<ScriptedTransport>, clock: ActivityClock) -> MonitorTargets {
        MonitorTargets {
            transport,
            clock,
            coordinator: f.coordinator.clone(),
            vault: f.vault.clone(),
        }
    }

    #[test]
    fn test_activity_clock() {
        let clock = ActivityClock::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(clock.idle() >= Duration::from_millis(20));
        clock.touch();
        assert!(clock.idle() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_probe_failures_are_reported_once() {
        let f = fixture(Duration::from_secs(3600));
        let (tx, mut rx) = mpsc::channel(8);
        let config = HealthConfig {
            probe_interval: Duration::from_millis(10),
            ..quiet_config()
        };
        let _monitor = HealthMonitor::attach(
            "A1",
            7,
            &config,
            targets(&f, ScriptedTransport::new(false), ActivityClock::new()),
            tx,
        );

        let report = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.generation, 7);
        assert_eq!(report.issue, HealthIssue::ProbeFailed);
        assert!(report.reason.starts_with("3 consecutive"));
    }

    #[tokio::test]
    async fn test_healthy_probe_reports_nothing() {
        let f = fixture(Duration::from_secs(3600));
        let (tx, mut rx) = mpsc::channel(8);
        let config = HealthConfig {
            probe_interval: Duration::from_millis(5),
            ..quiet_config()
        };
        let _monitor = HealthMonitor::attach(
            "A1",
            1,
            &config,
            targets(&f, ScriptedTransport::new(true), ActivityClock::new()),
            tx,
        );
        let got = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(got.is_err());
    }

    #[tokio::test]
    async fn test_silence_is_reported() {
        let f = fixture(Duration::from_secs(3600));
        let (tx, mut rx) = mpsc::channel(8);
        let config = HealthConfig {
            silence_threshold: Duration::from_millis(30),
            check_interval: Duration::from_millis(10),
            ..quiet_config()
        };
        let _monitor = HealthMonitor::attach(
            "A1",
            1,
            &config,
            targets(&f, ScriptedTransport::new(true), ActivityClock::new()),
            tx,
        );
        let report = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.issue, HealthIssue::Silent);
    }

    #[tokio::test]
    async fn test_lost_ownership_is_reported() {
        let f = fixture(Duration::from_millis(10));
        f.coordinator.acquire("A1").await.unwrap();
        let intruder = OwnerIdentity {
            instance_id: uuid::Uuid::new_v4(),
            host: "elsewhere".to_string(),
            pid: 1,
        };
        f.db.claim_ownership("A1", &intruder, chrono::Utc::now())
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let _monitor = HealthMonitor::attach(
            "A1",
            1,
            &quiet_config(),
            targets(&f, ScriptedTransport::new(true), ActivityClock::new()),
            tx,
        );
        let report = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.issue, HealthIssue::OwnershipLost);
    }

    #[tokio::test]
    async fn test_detach_stops_reporting() {
        let f = fixture(Duration::from_secs(3600));
        let (tx, mut rx) = mpsc::channel(8);
        let config = HealthConfig {
            probe_interval: Duration::from_millis(20),
            max_probe_failures: 1,
            ..quiet_config()
        };
        let mut monitor = HealthMonitor::attach(
            "A1",
            1,
            &config,
            targets(&f, ScriptedTransport::new(false), ActivityClock::new()),
            tx,
        );
        assert!(monitor.detach());
        assert!(!monitor.detach());

        // Every sender is gone once the tasks are aborted.
        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(got, Ok(None));
    }
}
