//! Session transition function.
//!
//! [`reduce`] applies one [`SessionEvent`] to a [`Session`] and returns the
//! side effects the driver must perform, in order. It does no I/O, so every
//! transition is testable without a transport.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{FailureInfo, FailureKind};
use crate::ingest::canonical_phone;
use crate::policy::{Classification, ReconnectAction, ReconnectPolicy};
use crate::session::state::{PairingCode, Session, SessionState};
use crate::transport::CloseSignal;

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Start,
    TransportOpened { identity: String },
    PairingCodeIssued { code: String, at: DateTime<Utc> },
    /// The pairing-code validity timer fired.
    PairingCodeExpired,
    Closed(CloseSignal),
    HealthFailed { reason: String },
    /// Another instance now holds the ownership record.
    OwnershipLost { reason: String },
    RetryTimerFired,
    ManualReset,
    Stop,
    InternalError { reason: String },
}

/// Side effects requested by a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Load credentials and open a transport.
    Connect,
    TearDownTransport,
    /// Unlink the device before tearing down.
    Logout,
    ScheduleReconnect(Duration),
    WipeCredentials,
    ArmCooldown { duration: Duration, reason: String },
    ClearCooldown,
    AttachHealthMonitor,
    DetachHealthMonitor,
    PersistLifecycle,
    ReleaseOwnership,
    /// Stop the driver; the session is discarded.
    Terminate,
}

/// Fixed inputs to a transition.
pub struct ReduceContext<'a> {
    pub policy: &'a ReconnectPolicy,
    pub pairing_code_validity: Duration,
    pub now: DateTime<Utc>,
}

/// Apply `event` to `session`. Events that make no sense in the current
/// state are ignored and yield no effects.
pub fn reduce(session: &mut Session, event: &SessionEvent, ctx: &ReduceContext<'_>) -> Vec<Effect> {
    use SessionState as S;

    match (session.state(), event) {
        (S::Uninitialized | S::Disconnected | S::FatalError, SessionEvent::Start) => {
            session.failure = None;
            session.attempts.reconnect = 0;
            session.enter(S::Initializing);
            vec![Effect::PersistLifecycle, Effect::Connect]
        }
        (S::ClosedRecoverable, SessionEvent::Start | SessionEvent::RetryTimerFired) => {
            session.enter(S::Initializing);
            vec![Effect::PersistLifecycle, Effect::Connect]
        }

        (S::Initializing | S::QrPending, SessionEvent::TransportOpened { identity }) => {
            session.identity = Some(canonical_phone(identity).unwrap_or_else(|| identity.clone()));
            session.connected_at = Some(ctx.now);
            session.failure = None;
            session.attempts.reconnect = 0;
            session.enter(S::Connected);
            vec![Effect::PersistLifecycle, Effect::AttachHealthMonitor]
        }

        (S::Initializing | S::QrPending, SessionEvent::PairingCodeIssued { code, at }) => {
            session.enter(S::QrPending);
            session.pairing_code = Some(PairingCode {
                code: code.clone(),
                issued_at: *at,
            });
            session.attempts.pairing_codes += 1;
            vec![Effect::PersistLifecycle]
        }
        (S::QrPending, SessionEvent::PairingCodeExpired) => {
            let expired = session
                .pairing_code
                .as_ref()
                .is_some_and(|p| p.is_expired(ctx.pairing_code_validity, ctx.now));
            if !expired {
                return Vec::new();
            }
            session.pairing_code = None;
            vec![Effect::PersistLifecycle]
        }

        (S::Initializing | S::QrPending | S::Connected, SessionEvent::Closed(signal)) => {
            on_close(session, signal, ctx)
        }
        (S::Connected, SessionEvent::HealthFailed { reason }) => {
            on_close(session, &CloseSignal::connection_lost(reason.clone()), ctx)
        }
        (S::Initializing | S::QrPending | S::Connected, SessionEvent::OwnershipLost { reason }) => {
            session.failure = Some(FailureInfo::new(FailureKind::OwnershipConflict, reason.clone()));
            session.enter(S::Conflict);
            // The record belongs to the new owner; leave it alone.
            vec![Effect::DetachHealthMonitor, Effect::TearDownTransport]
        }

        (_, SessionEvent::ManualReset) => {
            session.failure = None;
            session.attempts = Default::default();
            session.connected_at = None;
            session.enter(S::Disconnected);
            vec![
                Effect::DetachHealthMonitor,
                Effect::Logout,
                Effect::TearDownTransport,
                Effect::WipeCredentials,
                Effect::ClearCooldown,
                Effect::PersistLifecycle,
                Effect::ReleaseOwnership,
                Effect::Terminate,
            ]
        }
        (_, SessionEvent::Stop) => {
            session.enter(S::Uninitialized);
            vec![
                Effect::DetachHealthMonitor,
                Effect::TearDownTransport,
                Effect::ReleaseOwnership,
                Effect::Terminate,
            ]
        }
        (_, SessionEvent::InternalError { reason }) => {
            tracing::error!(
                agent_id = %session.agent_id,
                state = %session.state(),
                %reason,
                "Session hit an internal error"
            );
            session.failure = Some(FailureInfo::new(FailureKind::Unknown, reason.clone()));
            session.enter(S::FatalError);
            vec![
                Effect::DetachHealthMonitor,
                Effect::TearDownTransport,
                Effect::ReleaseOwnership,
                Effect::Terminate,
            ]
        }

        (state, event) => {
            tracing::debug!(agent_id = %session.agent_id, %state, ?event, "Ignoring event");
            Vec::new()
        }
    }
}

fn on_close(session: &mut Session, signal: &CloseSignal, ctx: &ReduceContext<'_>) -> Vec<Effect> {
    let class = ReconnectPolicy::classify(signal);
    let kind = ReconnectPolicy::failure_kind(class, signal);
    session.attempts.reconnect += 1;
    let attempt = session.attempts.reconnect;
    let action = ctx.policy.action(class, attempt);

    tracing::info!(
        agent_id = %session.agent_id,
        state = %session.state(),
        signal = %signal,
        ?class,
        ?action,
        attempt,
        "Connection closed"
    );
    session.failure = Some(FailureInfo::new(kind, signal.to_string()));

    let mut effects = vec![Effect::DetachHealthMonitor, Effect::TearDownTransport];
    match action {
        ReconnectAction::RetryNow | ReconnectAction::RetryAfter(_) => {
            let delay = match action {
                ReconnectAction::RetryAfter(delay) => delay,
                _ => Duration::ZERO,
            };
            session.enter(SessionState::ClosedRecoverable);
            effects.extend([Effect::PersistLifecycle, Effect::ScheduleReconnect(delay)]);
        }
        ReconnectAction::WipeAndRequireManualPairing => {
            session.enter(SessionState::Conflict);
            effects.extend([
                Effect::WipeCredentials,
                Effect::ArmCooldown {
                    duration: ctx.policy.config().credential_cooldown,
                    reason: format!("{}: {}", kind, signal.reason),
                },
                Effect::PersistLifecycle,
                Effect::ReleaseOwnership,
            ]);
        }
        ReconnectAction::CooldownThenManual(duration) => {
            if class == Classification::Unknown {
                tracing::warn!(
                    agent_id = %session.agent_id,
                    signal = %signal,
                    "Unclassified close signal, parking session for inspection"
                );
            }
            session.enter(SessionState::Conflict);
            effects.extend([
                Effect::ArmCooldown {
                    duration,
                    reason: format!("{}: {}", kind, signal.reason),
                },
                Effect::PersistLifecycle,
                Effect::ReleaseOwnership,
            ]);
        }
    }
    effects
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::ReconnectConfig;
    use crate::transport::codes;

    struct Harness {
        policy: ReconnectPolicy,
        session: Session,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                policy: ReconnectPolicy::new(ReconnectConfig::default().without_jitter()),
                session: Session::new("A1"),
            }
        }

        fn apply(&mut self, event: SessionEvent) -> Vec<Effect> {
            let ctx = ReduceContext {
                policy: &self.policy,
                pairing_code_validity: Duration::from_secs(60),
                now: Utc::now(),
            };
            reduce(&mut self.session, &event, &ctx)
        }

        fn state(&self) -> SessionState {
            self.session.state()
        }

        fn connected() -> Self {
            let mut h = Self::new();
            h.apply(SessionEvent::Start);
            h.apply(SessionEvent::TransportOpened {
                identity: "15551234567@s.whatsapp.net".to_string(),
            });
            h
        }
    }

    fn code(code: &str) -> SessionEvent {
        SessionEvent::PairingCodeIssued {
            code: code.to_string(),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_fresh_pairing_flow() {
        let mut h = Harness::new();
        assert_eq!(
            h.apply(SessionEvent::Start),
            vec![Effect::PersistLifecycle, Effect::Connect]
        );
        assert_eq!(h.state(), SessionState::Initializing);

        h.apply(code("Q-0001"));
        assert_eq!(h.state(), SessionState::QrPending);
        h.apply(code("Q-0002"));
        assert_eq!(h.session.attempts.pairing_codes, 2);
        assert_eq!(
            h.session.pairing_code.as_ref().map(|p| p.code.as_str()),
            Some("Q-0002")
        );

        let effects = h.apply(SessionEvent::TransportOpened {
            identity: "15551234567@s.whatsapp.net".to_string(),
        });
        assert_eq!(effects, vec![Effect::PersistLifecycle, Effect::AttachHealthMonitor]);
        assert_eq!(h.state(), SessionState::Connected);
        assert_eq!(h.session.identity.as_deref(), Some("+15551234567"));
        assert!(h.session.pairing_code.is_none());
    }

    #[test]
    fn test_restart_required_is_recoverable() {
        let mut h = Harness::connected();
        let effects = h.apply(SessionEvent::Closed(CloseSignal::restart_required()));
        assert_eq!(h.state(), SessionState::ClosedRecoverable);
        assert_eq!(
            effects,
            vec![
                Effect::DetachHealthMonitor,
                Effect::TearDownTransport,
                Effect::PersistLifecycle,
                Effect::ScheduleReconnect(Duration::from_millis(250)),
            ]
        );
        assert!(!effects.contains(&Effect::WipeCredentials));

        assert_eq!(
            h.apply(SessionEvent::RetryTimerFired),
            vec![Effect::PersistLifecycle, Effect::Connect]
        );
        assert_eq!(h.state(), SessionState::Initializing);
    }

    #[test]
    fn test_logged_out_wipes_and_arms_cooldown() {
        let mut h = Harness::connected();
        let effects = h.apply(SessionEvent::Closed(CloseSignal::logged_out()));
        assert_eq!(h.state(), SessionState::Conflict);
        assert!(effects.contains(&Effect::WipeCredentials));
        assert!(effects.contains(&Effect::ReleaseOwnership));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::ArmCooldown { duration, .. } if *duration == Duration::from_secs(600)
        )));
        assert_eq!(
            h.session.failure.as_ref().map(|f| f.kind),
            Some(FailureKind::CredentialInvalid)
        );

        // Automatic events do nothing while parked.
        assert!(h.apply(SessionEvent::RetryTimerFired).is_empty());
        assert!(h.apply(SessionEvent::Start).is_empty());
        assert_eq!(h.state(), SessionState::Conflict);
    }

    #[test]
    fn test_qr_pending_conflict_wipes() {
        let mut h = Harness::new();
        h.apply(SessionEvent::Start);
        h.apply(code("Q-0001"));
        let effects = h.apply(SessionEvent::Closed(CloseSignal::with_code(
            codes::CONNECTION_REPLACED,
            "replaced",
        )));
        assert_eq!(h.state(), SessionState::Conflict);
        assert!(effects.contains(&Effect::WipeCredentials));
        assert!(h.session.pairing_code.is_none());
    }

    #[test]
    fn test_unknown_close_parks_without_wipe() {
        let mut h = Harness::connected();
        let effects = h.apply(SessionEvent::Closed(CloseSignal::with_code(999, "???")));
        assert_eq!(h.state(), SessionState::Conflict);
        assert!(!effects.contains(&Effect::WipeCredentials));
        assert!(effects.contains(&Effect::ArmCooldown {
            duration: Duration::from_secs(120),
            reason: "unknown: ???".to_string(),
        }));
    }

    #[test]
    fn test_retries_exhaust_into_conflict() {
        let mut h = Harness::connected();
        for _ in 0..8 {
            h.apply(SessionEvent::Closed(CloseSignal::connection_lost("lost")));
            assert_eq!(h.state(), SessionState::ClosedRecoverable);
            h.apply(SessionEvent::RetryTimerFired);
        }
        h.apply(SessionEvent::Closed(CloseSignal::connection_lost("lost")));
        assert_eq!(h.state(), SessionState::Conflict);
        assert_eq!(h.session.attempts.reconnect, 9);
    }

    #[test]
    fn test_successful_open_resets_attempts() {
        let mut h = Harness::connected();
        h.apply(SessionEvent::Closed(CloseSignal::connection_lost("lost")));
        h.apply(SessionEvent::RetryTimerFired);
        h.apply(SessionEvent::TransportOpened {
            identity: "+15551234567".to_string(),
        });
        assert_eq!(h.session.attempts.reconnect, 0);
        assert!(h.session.failure.is_none());
    }

    #[test]
    fn test_health_failure_reconnects() {
        let mut h = Harness::connected();
        let effects = h.apply(SessionEvent::HealthFailed {
            reason: "probe timed out".to_string(),
        });
        assert_eq!(h.state(), SessionState::ClosedRecoverable);
        assert!(effects.contains(&Effect::DetachHealthMonitor));
        assert_eq!(
            h.session.failure.as_ref().map(|f| f.kind),
            Some(FailureKind::TransientNetwork)
        );
    }

    #[test]
    fn test_ownership_lost_does_not_release() {
        let mut h = Harness::connected();
        let effects = h.apply(SessionEvent::OwnershipLost {
            reason: "heartbeat rejected".to_string(),
        });
        assert_eq!(h.state(), SessionState::Conflict);
        assert!(!effects.contains(&Effect::ReleaseOwnership));
        assert!(!effects.contains(&Effect::WipeCredentials));
    }

    #[test]
    fn test_manual_reset_from_conflict() {
        let mut h = Harness::connected();
        h.apply(SessionEvent::Closed(CloseSignal::logged_out()));
        let effects = h.apply(SessionEvent::ManualReset);
        assert_eq!(h.state(), SessionState::Disconnected);
        assert!(effects.contains(&Effect::ClearCooldown));
        assert!(effects.contains(&Effect::WipeCredentials));
        assert_eq!(effects.last(), Some(&Effect::Terminate));
        assert!(h.session.failure.is_none());
    }

    #[test]
    fn test_stop_from_any_state_tears_down() {
        for setup in [Harness::new, Harness::connected] {
            let mut h = setup();
            let effects = h.apply(SessionEvent::Stop);
            assert_eq!(
                effects,
                vec![
                    Effect::DetachHealthMonitor,
                    Effect::TearDownTransport,
                    Effect::ReleaseOwnership,
                    Effect::Terminate,
                ]
            );
        }
    }

    #[test]
    fn test_pairing_expiry_only_clears_stale_code() {
        let mut h = Harness::new();
        h.apply(SessionEvent::Start);
        h.apply(code("Q-0001"));
        assert!(h.apply(SessionEvent::PairingCodeExpired).is_empty());

        h.apply(SessionEvent::PairingCodeIssued {
            code: "Q-0002".to_string(),
            at: Utc::now() - chrono::Duration::seconds(61),
        });
        assert_eq!(
            h.apply(SessionEvent::PairingCodeExpired),
            vec![Effect::PersistLifecycle]
        );
        assert!(h.session.pairing_code.is_none());
        assert_eq!(h.state(), SessionState::QrPending);
    }

    #[test]
    fn test_internal_error_is_fatal() {
        let mut h = Harness::connected();
        let effects = h.apply(SessionEvent::InternalError {
            reason: "driver panicked".to_string(),
        });
        assert_eq!(h.state(), SessionState::FatalError);
        assert_eq!(effects.last(), Some(&Effect::Terminate));
        // A fresh start is allowed afterwards.
        h.apply(SessionEvent::Start);
        assert_eq!(h.state(), SessionState::Initializing);
    }
}
