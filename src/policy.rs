//! Reconnection policy.
//!
//! Every close-signal-to-action rule lives here: [`ReconnectPolicy::classify`]
//! maps a transport close signal to a [`Classification`], and
//! [`ReconnectPolicy::action`] maps a classification plus the attempt number to
//! a [`ReconnectAction`]. Neither touches the transport.

use std::sync::LazyLock;
use std::time::Duration;

use rand::Rng;
use regex::Regex;

use crate::config::ReconnectConfig;
use crate::error::FailureKind;
use crate::transport::{CloseSignal, codes};

/// Coarse class of a close signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
    Recoverable,
    RestartRequired,
    CredentialInvalidated,
    RateLimited,
    Unknown,
}

/// What the state machine should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    RetryNow,
    RetryAfter(Duration),
    /// Park the session and reject automatic starts for the duration.
    ///
    /// Used for unclassified signals and exhausted retries. Unlike
    /// `WipeAndRequireManualPairing`, credential material is kept: an
    /// unknown signal is not evidence the credentials are bad, and a manual
    /// `disconnect` still wipes them.
    CooldownThenManual(Duration),
    WipeAndRequireManualPairing,
}

/// Reason-text patterns consulted when a signal carries no known code.
static REASON_RULES: LazyLock<Vec<(Regex, Classification)>> = LazyLock::new(|| {
    let rules = [
        (r"(?i)restart\s+required", Classification::RestartRequired),
        (
            r"(?i)logged\s*out|unauthori[sz]ed|forbidden|replaced|conflict|bad\s+session|bad\s+mac",
            Classification::CredentialInvalidated,
        ),
        (r"(?i)rate[\s-]*limit|too\s+many\s+requests", Classification::RateLimited),
        (
            r"(?i)timed?\s*out|connection\s+(closed|lost|reset)|unavailable|stream\s+errored|econn",
            Classification::Recoverable,
        ),
    ];
    rules
        .into_iter()
        .filter_map(|(pattern, class)| Regex::new(pattern).ok().map(|re| (re, class)))
        .collect()
});

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Classify a close signal by code, then by reason text.
    pub fn classify(signal: &CloseSignal) -> Classification {
        if let Some(code) = signal.code {
            match code {
                codes::RESTART_REQUIRED => return Classification::RestartRequired,
                codes::LOGGED_OUT
                | codes::FORBIDDEN
                | codes::DEVICE_MISMATCH
                | codes::CONNECTION_REPLACED
                | codes::BAD_SESSION => return Classification::CredentialInvalidated,
                codes::RATE_LIMITED => return Classification::RateLimited,
                codes::TIMED_OUT | codes::CONNECTION_CLOSED | codes::UNAVAILABLE => {
                    return Classification::Recoverable;
                }
                _ => {}
            }
        }

        REASON_RULES
            .iter()
            .find(|(re, _)| re.is_match(&signal.reason))
            .map(|(_, class)| *class)
            .unwrap_or(Classification::Unknown)
    }

    /// Failure kind recorded on the session for a classified signal.
    pub fn failure_kind(class: Classification, signal: &CloseSignal) -> FailureKind {
        match class {
            Classification::Recoverable => FailureKind::TransientNetwork,
            Classification::RestartRequired => FailureKind::RestartRequired,
            Classification::RateLimited => FailureKind::RateLimited,
            Classification::CredentialInvalidated if signal.code == Some(codes::BAD_SESSION) => {
                FailureKind::CorruptionDetected
            }
            Classification::CredentialInvalidated => FailureKind::CredentialInvalid,
            Classification::Unknown => FailureKind::Unknown,
        }
    }

    /// Decide the next action. `attempt` is 1 for the first failure in a row.
    pub fn action(&self, class: Classification, attempt: u32) -> ReconnectAction {
        self.action_with_rng(class, attempt, &mut rand::thread_rng())
    }

    pub fn action_with_rng<R: Rng + ?Sized>(
        &self,
        class: Classification,
        attempt: u32,
        rng: &mut R,
    ) -> ReconnectAction {
        let attempt = attempt.max(1);
        match class {
            Classification::CredentialInvalidated => ReconnectAction::WipeAndRequireManualPairing,
            Classification::Unknown => {
                ReconnectAction::CooldownThenManual(self.config.unknown_cooldown)
            }
            _ if attempt > self.config.max_attempts => {
                ReconnectAction::CooldownThenManual(self.config.unknown_cooldown)
            }
            Classification::RestartRequired if attempt == 1 => {
                if self.config.restart_delay.is_zero() {
                    ReconnectAction::RetryNow
                } else {
                    ReconnectAction::RetryAfter(self.config.restart_delay)
                }
            }
            Classification::RestartRequired | Classification::Recoverable => {
                let delay = backoff(self.config.base_delay, self.config.max_delay, attempt);
                ReconnectAction::RetryAfter(self.jitter(delay, rng))
            }
            Classification::RateLimited => {
                let delay = backoff(
                    self.config.rate_limit_base,
                    self.config.rate_limit_max,
                    attempt,
                );
                ReconnectAction::RetryAfter(self.jitter(delay, rng))
            }
        }
    }

    fn jitter<R: Rng + ?Sized>(&self, delay: Duration, rng: &mut R) -> Duration {
        let ratio = self.config.jitter_ratio;
        if ratio <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rng.gen_range((1.0 - ratio)..=(1.0 + ratio));
        delay.mul_f64(factor)
    }
}

/// `base * 2^(attempt - 1)`, capped at `max`.
fn backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exp).min(max)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig::default().without_jitter())
    }

    #[test]
    fn test_classify_by_code() {
        let cases = [
            (codes::RESTART_REQUIRED, Classification::RestartRequired),
            (codes::LOGGED_OUT, Classification::CredentialInvalidated),
            (codes::FORBIDDEN, Classification::CredentialInvalidated),
            (codes::DEVICE_MISMATCH, Classification::CredentialInvalidated),
            (codes::CONNECTION_REPLACED, Classification::CredentialInvalidated),
            (codes::BAD_SESSION, Classification::CredentialInvalidated),
            (codes::RATE_LIMITED, Classification::RateLimited),
            (codes::TIMED_OUT, Classification::Recoverable),
            (codes::CONNECTION_CLOSED, Classification::Recoverable),
            (codes::UNAVAILABLE, Classification::Recoverable),
        ];
        for (code, expected) in cases {
            let signal = CloseSignal::with_code(code, "");
            assert_eq!(ReconnectPolicy::classify(&signal), expected, "code {}", code);
        }
    }

    #[test]
    fn test_classify_by_reason_text() {
        assert_eq!(
            ReconnectPolicy::classify(&CloseSignal::new(None, "Stream Errored (restart required)")),
            Classification::RestartRequired
        );
        assert_eq!(
            ReconnectPolicy::classify(&CloseSignal::new(None, "Connection Lost")),
            Classification::Recoverable
        );
        assert_eq!(
            ReconnectPolicy::classify(&CloseSignal::new(None, "too many requests")),
            Classification::RateLimited
        );
        assert_eq!(
            ReconnectPolicy::classify(&CloseSignal::with_code(999, "mystery")),
            Classification::Unknown
        );
    }

    #[test]
    fn test_failure_kind_mapping() {
        let bad = CloseSignal::with_code(codes::BAD_SESSION, "");
        assert_eq!(
            ReconnectPolicy::failure_kind(Classification::CredentialInvalidated, &bad),
            FailureKind::CorruptionDetected
        );
        let out = CloseSignal::logged_out();
        assert_eq!(
            ReconnectPolicy::failure_kind(ReconnectPolicy::classify(&out), &out),
            FailureKind::CredentialInvalid
        );
    }

    #[test]
    fn test_restart_required_retries_promptly() {
        let p = policy();
        assert_eq!(
            p.action(Classification::RestartRequired, 1),
            ReconnectAction::RetryAfter(Duration::from_millis(250))
        );

        let mut config = ReconnectConfig::default().without_jitter();
        config.restart_delay = Duration::ZERO;
        assert_eq!(
            ReconnectPolicy::new(config).action(Classification::RestartRequired, 1),
            ReconnectAction::RetryNow
        );
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let p = policy();
        let delays: Vec<_> = (1..=7)
            .map(|n| p.action(Classification::Recoverable, n))
            .collect();
        assert_eq!(
            delays,
            vec![
                ReconnectAction::RetryAfter(Duration::from_secs(2)),
                ReconnectAction::RetryAfter(Duration::from_secs(4)),
                ReconnectAction::RetryAfter(Duration::from_secs(8)),
                ReconnectAction::RetryAfter(Duration::from_secs(16)),
                ReconnectAction::RetryAfter(Duration::from_secs(32)),
                ReconnectAction::RetryAfter(Duration::from_secs(60)),
                ReconnectAction::RetryAfter(Duration::from_secs(60)),
            ]
        );
    }

    #[test]
    fn test_rate_limited_backs_off_longer() {
        let p = policy();
        assert_eq!(
            p.action(Classification::RateLimited, 1),
            ReconnectAction::RetryAfter(Duration::from_secs(30))
        );
        assert_eq!(
            p.action(Classification::RateLimited, 8),
            ReconnectAction::RetryAfter(Duration::from_secs(600))
        );
    }

    #[test]
    fn test_terminal_classes() {
        let p = policy();
        assert_eq!(
            p.action(Classification::CredentialInvalidated, 1),
            ReconnectAction::WipeAndRequireManualPairing
        );
        assert_eq!(
            p.action(Classification::Unknown, 1),
            ReconnectAction::CooldownThenManual(Duration::from_secs(120))
        );
        assert_eq!(
            p.action(Classification::Recoverable, 9),
            ReconnectAction::CooldownThenManual(Duration::from_secs(120))
        );
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let p = ReconnectPolicy::new(ReconnectConfig::default());
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            match p.action_with_rng(Classification::Recoverable, 3, &mut rng) {
                ReconnectAction::RetryAfter(d) => {
                    assert!(d >= Duration::from_millis(6399) && d <= Duration::from_millis(9601));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }
}
