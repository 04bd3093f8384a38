use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;
use tracing::info;

use crate::error::{FlowError, Result};
use crate::session::SessionStore;
use crate::state::Turn;

const CREATE_SESSIONS: &str = r#"
CREATE TABLE IF NOT EXISTS note_sessions (
    id TEXT PRIMARY KEY,
    created_at TIMESTAMPTZ NOT NULL,
    last_active TIMESTAMPTZ NOT NULL
)
"#;

const CREATE_TURNS: &str = r#"
CREATE TABLE IF NOT EXISTS note_session_turns (
    seq BIGSERIAL PRIMARY KEY,
    session_id TEXT NOT NULL,
    turn JSONB NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
)
"#;

fn storage_err(e: sqlx::Error) -> FlowError {
    FlowError::Storage(e.to_string())
}

/// Postgres-backed session memory. Turns are JSONB rows ordered by a
/// serial sequence; the idle TTL is enforced on read.
pub struct PostgresSessionStore {
    pool: PgPool,
    idle_ttl: Duration,
}

impl PostgresSessionStore {
    pub async fn connect(database_url: &str, idle_ttl: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(storage_err)?;

        sqlx::query(CREATE_SESSIONS)
            .execute(&pool)
            .await
            .map_err(storage_err)?;
        sqlx::query(CREATE_TURNS)
            .execute(&pool)
            .await
            .map_err(storage_err)?;

        info!("connected to postgres session store");
        Ok(Self { pool, idle_ttl })
    }

    fn ttl_seconds(&self) -> f64 {
        self.idle_ttl.as_secs_f64()
    }
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn append(&self, session_id: &str, turn: Turn) -> Result<()> {
        let now = Utc::now();
        let turn_json = serde_json::to_value(&turn)
            .map_err(|e| FlowError::Storage(format!("failed to serialize turn: {e}")))?;

        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        // Writing to a session idle past the TTL must not resurrect the
        // pre-expiry turns; drop them before the bump of last_active
        // makes the session look live again.
        sqlx::query(
            "DELETE FROM note_session_turns WHERE session_id = $1 AND EXISTS \
             (SELECT 1 FROM note_sessions s WHERE s.id = $1 \
              AND s.last_active <= now() - make_interval(secs => $2::double precision))",
        )
        .bind(session_id)
        .bind(self.ttl_seconds())
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "INSERT INTO note_sessions (id, created_at, last_active) VALUES ($1, $2, $2) \
             ON CONFLICT (id) DO UPDATE SET last_active = $2",
        )
        .bind(session_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "INSERT INTO note_session_turns (session_id, turn, created_at) VALUES ($1, $2, $3)",
        )
        .bind(session_id)
        .bind(turn_json)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn history(&self, session_id: &str, limit: usize) -> Result<Vec<Turn>> {
        let rows = sqlx::query(
            "SELECT t.turn FROM note_session_turns t \
             JOIN note_sessions s ON s.id = t.session_id \
             WHERE t.session_id = $1 \
               AND s.last_active > now() - make_interval(secs => $2::double precision) \
             ORDER BY t.seq DESC LIMIT $3",
        )
        .bind(session_id)
        .bind(self.ttl_seconds())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        let mut turns = Vec::with_capacity(rows.len());
        for row in rows {
            let value: serde_json::Value = row.try_get("turn").map_err(storage_err)?;
            let turn: Turn = serde_json::from_value(value)
                .map_err(|e| FlowError::Storage(format!("failed to decode turn: {e}")))?;
            turns.push(turn);
        }
        // Rows come newest-first; callers expect submission order.
        turns.reverse();
        Ok(turns)
    }

    async fn evict_expired(&self) -> Result<usize> {
        let result = sqlx::query(
            "DELETE FROM note_sessions \
             WHERE last_active <= now() - make_interval(secs => $1::double precision)",
        )
        .bind(self.ttl_seconds())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "DELETE FROM note_session_turns t WHERE NOT EXISTS \
             (SELECT 1 FROM note_sessions s WHERE s.id = t.session_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(result.rows_affected() as usize)
    }
}
