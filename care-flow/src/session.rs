use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::time::Duration;

use crate::error::Result;
use crate::state::Turn;

/// Short-term session memory: an ordered, append-only turn history per
/// caller-supplied session id, evicted after an idle TTL.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Append one turn to the session, creating the session on first use.
    async fn append(&self, session_id: &str, turn: Turn) -> Result<()>;

    /// The most recent `limit` turns in submission order. An unknown or
    /// expired session yields an empty history.
    async fn history(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>>;

    /// Drop all sessions idle longer than the TTL; returns how many were
    /// evicted.
    async fn evict_expired(&self) -> Result<usize>;
}

struct SessionEntry {
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
    turns: Vec<Turn>,
}

/// In-memory session store over `DashMap`. Per-session operations are
/// atomic through the map entry; there is no cross-session locking.
pub struct InMemorySessionStore {
    sessions: DashMap<String, SessionEntry>,
    idle_ttl: ChronoDuration,
}

impl InMemorySessionStore {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_ttl: ChronoDuration::from_std(idle_ttl)
                .unwrap_or_else(|_| ChronoDuration::hours(24)),
        }
    }

    fn expired(&self, entry: &SessionEntry) -> bool {
        Utc::now() - entry.last_active > self.idle_ttl
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn append(&self, session_id: &str, turn: Turn) -> Result<()> {
        let now = Utc::now();
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                created_at: now,
                last_active: now,
                turns: Vec::new(),
            });
        // An idle-expired session starts over rather than resuming its
        // stale history.
        if self.expired(&entry) {
            entry.turns.clear();
            entry.created_at = now;
        }
        entry.last_active = now;
        entry.turns.push(turn);
        Ok(())
    }

    async fn history(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>> {
        // The map guard must be released before removal to avoid
        // deadlocking on the shard.
        match self.sessions.get(session_id) {
            None => return Ok(Vec::new()),
            Some(entry) => {
                if !self.expired(&entry) {
                    let turns = &entry.turns;
                    let start = turns.len().saturating_sub(limit);
                    return Ok(turns[start..].to_vec());
                }
            }
        }
        self.sessions.remove(session_id);
        Ok(Vec::new())
    }

    async fn evict_expired(&self) -> Result<usize> {
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| {
            Utc::now() - entry.last_active <= self.idle_ttl
        });
        Ok(before - self.sessions.len())
    }
}
