use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{config::Config, domain::EventId};

/// Inbound-event filter: drops already-seen ids and stale backlog.
///
/// Entries expire after a TTL window; purging happens lazily on each `admit`
/// plus an explicit `sweep` for long-idle processes. A resent-but-distinct
/// event with a recycled id is treated as a duplicate; that false positive is
/// the price of at-most-once processing.
pub struct Deduplicator {
    ttl: Duration,
    staleness_threshold: Duration,
    replay_backlog: bool,
    seen: Mutex<HashMap<EventId, Instant>>,
}

impl Deduplicator {
    pub fn new(cfg: &Config) -> Self {
        Self::with_limits(cfg.dedup_ttl, cfg.staleness_threshold, cfg.replay_backlog)
    }

    pub fn with_limits(ttl: Duration, staleness_threshold: Duration, replay_backlog: bool) -> Self {
        Self {
            ttl,
            staleness_threshold,
            replay_backlog,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` when the event should be processed. A `false` means the
    /// event is a duplicate within the TTL window or stale backlog; either way
    /// the id is recorded so a replay of the same id stays dropped.
    pub async fn admit(&self, id: &EventId, created_at: DateTime<Utc>) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock().await;
        seen.retain(|_, expires| *expires > now);

        if seen.contains_key(id) {
            tracing::info!(event_id = %id.0, "event already received, ignoring");
            return false;
        }
        seen.insert(id.clone(), now + self.ttl);

        if !self.replay_backlog {
            let age = Utc::now().signed_duration_since(created_at);
            if age.num_seconds() > self.staleness_threshold.as_secs() as i64 {
                tracing::debug!(event_id = %id.0, "stale history event skipped");
                return false;
            }
        }
        true
    }

    /// Drop expired entries without admitting anything.
    pub async fn sweep(&self) {
        let now = Instant::now();
        self.seen.lock().await.retain(|_, expires| *expires > now);
    }

    #[cfg(test)]
    async fn recorded(&self) -> usize {
        self.seen.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dedup(ttl_secs: u64, replay: bool) -> Deduplicator {
        Deduplicator::with_limits(
            Duration::from_secs(ttl_secs),
            Duration::from_secs(60),
            replay,
        )
    }

    #[tokio::test]
    async fn second_admit_within_ttl_is_rejected() {
        let d = dedup(3600, false);
        let id = EventId("msg-1".to_string());
        assert!(d.admit(&id, Utc::now()).await);
        assert!(!d.admit(&id, Utc::now()).await);
    }

    #[tokio::test]
    async fn stale_event_is_rejected_and_still_recorded() {
        let d = dedup(3600, false);
        let id = EventId("msg-old".to_string());
        let old = Utc::now() - chrono::Duration::seconds(300);
        assert!(!d.admit(&id, old).await);
        // The id was recorded, so a fresh-looking replay is still a duplicate.
        assert!(!d.admit(&id, Utc::now()).await);
    }

    #[tokio::test]
    async fn replay_mode_admits_old_events() {
        let d = dedup(3600, true);
        let id = EventId("msg-backlog".to_string());
        let old = Utc::now() - chrono::Duration::seconds(300);
        assert!(d.admit(&id, old).await);
    }

    #[tokio::test]
    async fn sweep_purges_expired_entries() {
        let d = dedup(0, true);
        let id = EventId("msg-ttl".to_string());
        assert!(d.admit(&id, Utc::now()).await);
        d.sweep().await;
        assert_eq!(d.recorded().await, 0);
        // Entry expired, so the same id is admitted again.
        assert!(d.admit(&id, Utc::now()).await);
    }
}
