//! In-process guards: initialization locks and cooldowns.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// One initialization at a time per agent.
///
/// A lock older than the ceiling is treated as abandoned and may be taken
/// again.
pub struct InitLocks {
    ceiling: Duration,
    held: Mutex<HashMap<String, Instant>>,
}

impl InitLocks {
    pub fn new(ceiling: Duration) -> Self {
        Self {
            ceiling,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Take the lock. Returns false while a live holder exists.
    pub async fn try_acquire(&self, agent_id: &str) -> bool {
        let mut held = self.held.lock().await;
        let now = Instant::now();
        if let Some(since) = held.get(agent_id) {
            let age = now.duration_since(*since);
            if age < self.ceiling {
                return false;
            }
            tracing::warn!(
                agent_id = %agent_id,
                age_secs = age.as_secs(),
                "Discarding stale initialization lock"
            );
        }
        held.insert(agent_id.to_string(), now);
        true
    }

    /// Release the lock. Returns whether one was held.
    pub async fn release(&self, agent_id: &str) -> bool {
        self.held.lock().await.remove(agent_id).is_some()
    }

    pub async fn is_held(&self, agent_id: &str) -> bool {
        let held = self.held.lock().await;
        held.get(agent_id)
            .is_some_and(|since| since.elapsed() < self.ceiling)
    }
}

struct Cooldown {
    until: Instant,
    reason: String,
}

/// Per-agent cooldowns that reject automatic starts.
#[derive(Default)]
pub struct CooldownBook {
    entries: Mutex<HashMap<String, Cooldown>>,
}

impl CooldownBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn arm(&self, agent_id: &str, duration: Duration, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::info!(
            agent_id = %agent_id,
            secs = duration.as_secs(),
            %reason,
            "Cooldown armed"
        );
        self.entries.lock().await.insert(
            agent_id.to_string(),
            Cooldown {
                until: Instant::now() + duration,
                reason,
            },
        );
    }

    pub async fn clear(&self, agent_id: &str) {
        self.entries.lock().await.remove(agent_id);
    }

    /// Remaining time and reason of an active cooldown. Elapsed entries are
    /// dropped.
    pub async fn active(&self, agent_id: &str) -> Option<(Duration, String)> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        match entries.get(agent_id) {
            Some(c) if c.until > now => Some((c.until - now, c.reason.clone())),
            Some(_) => {
                entries.remove(agent_id);
                None
            }
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_lock_is_exclusive() {
        let locks = InitLocks::new(Duration::from_secs(60));
        assert!(locks.try_acquire("A1").await);
        assert!(!locks.try_acquire("A1").await);
        assert!(locks.try_acquire("A2").await);
        assert!(locks.is_held("A1").await);

        assert!(locks.release("A1").await);
        assert!(!locks.release("A1").await);
        assert!(locks.try_acquire("A1").await);
    }

    #[tokio::test]
    async fn test_stale_init_lock_is_reclaimed() {
        let locks = InitLocks::new(Duration::from_millis(20));
        assert!(locks.try_acquire("A1").await);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!locks.is_held("A1").await);
        assert!(locks.try_acquire("A1").await);
    }

    #[tokio::test]
    async fn test_cooldown_expires() {
        let book = CooldownBook::new();
        assert!(book.active("A1").await.is_none());

        book.arm("A1", Duration::from_secs(600), "credential_invalid").await;
        let (remaining, reason) = book.active("A1").await.unwrap();
        assert!(remaining > Duration::from_secs(590));
        assert_eq!(reason, "credential_invalid");

        book.arm("A2", Duration::from_millis(10), "unknown").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(book.active("A2").await.is_none());

        book.clear("A1").await;
        assert!(book.active("A1").await.is_none());
    }
}
