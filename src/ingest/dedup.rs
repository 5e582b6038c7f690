//! Dedup keys and echo tracking.
//!
//! The primary key is the external message id. The fallback key hashes
//! `direction|peer|normalized content|time bucket` and catches the same
//! message arriving through origin paths that disagree on ids. Lookups check
//! the current and previous bucket so a pair straddling a bucket boundary
//! still matches.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::DedupConfig;
use crate::db::Direction;

/// Normalize content text before hashing.
pub fn normalize_content(text: &str, config: &DedupConfig) -> String {
    let trimmed = text.trim();
    let collapsed = if config.collapse_whitespace {
        trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        trimmed.to_string()
    };
    if config.case_insensitive {
        collapsed.to_lowercase()
    } else {
        collapsed
    }
}

/// Direction tag used in the fallback key. Messages whose peer is the
/// agent's own address are tagged `self` regardless of which path reported
/// them, so a local send and its echo agree.
pub fn direction_tag(direction: Direction, peer: &str, own_identity: Option<&str>) -> &'static str {
    if own_identity.is_some_and(|own| own == peer) {
        "self"
    } else {
        direction.as_str()
    }
}

fn bucket(at: DateTime<Utc>, config: &DedupConfig) -> i64 {
    let width = config.bucket_width.as_secs().max(1) as i64;
    at.timestamp().div_euclid(width)
}

fn hash_key(tag: &str, peer: &str, normalized: &str, bucket: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    hasher.update(b"|");
    hasher.update(peer.as_bytes());
    hasher.update(b"|");
    hasher.update(normalized.as_bytes());
    hasher.update(b"|");
    hasher.update(bucket.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fallback keys of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackKeys {
    /// Key stored on the record.
    pub current: String,
    /// Key of the preceding bucket, checked on lookup only.
    pub previous: String,
}

impl FallbackKeys {
    pub fn compute(
        tag: &str,
        peer: &str,
        content_text: &str,
        at: DateTime<Utc>,
        config: &DedupConfig,
    ) -> Self {
        let normalized = normalize_content(content_text, config);
        let bucket = bucket(at, config);
        Self {
            current: hash_key(tag, peer, &normalized, bucket),
            previous: hash_key(tag, peer, &normalized, bucket - 1),
        }
    }

    pub fn lookup_keys(&self) -> Vec<String> {
        vec![self.current.clone(), self.previous.clone()]
    }
}

struct PendingEcho {
    peer: String,
    normalized: String,
    sent_at: DateTime<Utc>,
}

/// Recent local sends awaiting their network echo.
pub struct EchoTracker {
    config: DedupConfig,
    pending: Mutex<VecDeque<PendingEcho>>,
}

impl EchoTracker {
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Note a local send.
    pub async fn note(&self, peer: &str, content_text: &str, sent_at: DateTime<Utc>) {
        let mut pending = self.pending.lock().await;
        self.expire(&mut pending, sent_at);
        pending.push_back(PendingEcho {
            peer: peer.to_string(),
            normalized: normalize_content(content_text, &self.config),
            sent_at,
        });
    }

    /// Consume a pending local send matching this event, if any.
    pub async fn take_match(&self, peer: &str, content_text: &str, at: DateTime<Utc>) -> bool {
        let normalized = normalize_content(content_text, &self.config);
        let mut pending = self.pending.lock().await;
        self.expire(&mut pending, at);
        let window = self.window();
        let found = pending.iter().position(|p| {
            p.peer == peer
                && p.normalized == normalized
                && (at - p.sent_at).abs() <= window
        });
        match found {
            Some(index) => {
                pending.remove(index);
                true
            }
            None => false,
        }
    }

    fn window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.echo_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    fn expire(&self, pending: &mut VecDeque<PendingEcho>, now: DateTime<Utc>) {
        let window = self.window();
        while pending
            .front()
            .is_some_and(|p| now - p.sent_at > window)
        {
            pending.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_normalization_is_configurable() {
        let config = DedupConfig::default();
        assert_eq!(normalize_content("  hello \n  world ", &config), "hello world");
        assert_eq!(normalize_content("Hello", &config), "Hello");

        let config = DedupConfig {
            case_insensitive: true,
            collapse_whitespace: false,
            ..DedupConfig::default()
        };
        assert_eq!(normalize_content(" Hello  World ", &config), "hello  world");
    }

    #[test]
    fn test_same_bucket_same_key() {
        let config = DedupConfig::default();
        // 1_700_000_000 is a multiple of 10.
        let a = FallbackKeys::compute("in", "+1555", "hi  there", at(1), &config);
        let b = FallbackKeys::compute("in", "+1555", "hi there", at(8), &config);
        assert_eq!(a, b);

        let other_peer = FallbackKeys::compute("in", "+1556", "hi there", at(1), &config);
        assert_ne!(a.current, other_peer.current);
        let other_direction = FallbackKeys::compute("out", "+1555", "hi there", at(1), &config);
        assert_ne!(a.current, other_direction.current);
    }

    #[test]
    fn test_adjacent_bucket_matches_through_previous() {
        let config = DedupConfig::default();
        let first = FallbackKeys::compute("self", "+1555", "ping", at(9), &config);
        let echo = FallbackKeys::compute("self", "+1555", "ping", at(12), &config);
        assert_ne!(first.current, echo.current);
        assert!(echo.lookup_keys().contains(&first.current));

        let late = FallbackKeys::compute("self", "+1555", "ping", at(25), &config);
        assert!(!late.lookup_keys().contains(&first.current));
    }

    #[test]
    fn test_direction_tag_for_own_address() {
        assert_eq!(direction_tag(Direction::Outbound, "+1555", Some("+1555")), "self");
        assert_eq!(direction_tag(Direction::Inbound, "+1555", Some("+1555")), "self");
        assert_eq!(direction_tag(Direction::Inbound, "+1666", Some("+1555")), "in");
        assert_eq!(direction_tag(Direction::Outbound, "+1666", None), "out");
    }

    #[tokio::test]
    async fn test_echo_tracker_window() {
        let tracker = EchoTracker::new(DedupConfig::default());
        tracker.note("+1555", "hello", at(0)).await;

        assert!(!tracker.take_match("+1555", "other", at(3)).await);
        assert!(tracker.take_match("+1555", "hello ", at(3)).await);
        // Consumed.
        assert!(!tracker.take_match("+1555", "hello", at(4)).await);

        tracker.note("+1555", "late", at(0)).await;
        assert!(!tracker.take_match("+1555", "late", at(0) + Duration::seconds(31)).await);
    }
}
