//! Session and transcript persistence.
//!
//! The orchestrator talks to a [`SessionStore`]; two implementations ship:
//! an in-memory map for single-node and test use, and a Postgres store
//! (JSONB state plus an append-only transcript) behind the same trait.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mentor_core::session::SessionState;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// One tutor turn as recorded for history prompts and audits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub at: DateTime<Utc>,
    pub step_idx: usize,
    pub moment_idx: usize,
    pub user_input: String,
    pub message: String,
    pub follow_up: String,
}

impl TranscriptEntry {
    /// Compact single-line form fed back into generation prompts.
    pub fn summary(&self) -> String {
        let mut s = String::new();
        if !self.user_input.is_empty() {
            s.push_str(&format!("Estudiante: {} | ", self.user_input));
        }
        s.push_str(&format!("Tutora: {}", self.message));
        if !self.follow_up.is_empty() {
            s.push_str(&format!(" {}", self.follow_up));
        }
        s
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<SessionState>>;
    async fn set(&self, key: &str, state: &SessionState) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn append_transcript(&self, key: &str, entry: &TranscriptEntry) -> Result<()>;
    /// The last `limit` entries, oldest first.
    async fn recent_transcript(&self, key: &str, limit: usize) -> Result<Vec<TranscriptEntry>>;
    async fn clear_transcript(&self, key: &str) -> Result<()>;
}

/// Process-local store.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, SessionState>>,
    transcripts: RwLock<HashMap<String, Vec<TranscriptEntry>>>,
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<SessionState>> {
        Ok(self.sessions.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, state: &SessionState) -> Result<()> {
        self.sessions
            .write()
            .await
            .insert(key.to_string(), state.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.sessions.write().await.remove(key);
        Ok(())
    }

    async fn append_transcript(&self, key: &str, entry: &TranscriptEntry) -> Result<()> {
        self.transcripts
            .write()
            .await
            .entry(key.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn recent_transcript(&self, key: &str, limit: usize) -> Result<Vec<TranscriptEntry>> {
        let transcripts = self.transcripts.read().await;
        let entries = transcripts.get(key).map(Vec::as_slice).unwrap_or_default();
        let start = entries.len().saturating_sub(limit);
        Ok(entries[start..].to_vec())
    }

    async fn clear_transcript(&self, key: &str) -> Result<()> {
        self.transcripts.write().await.remove(key);
        Ok(())
    }
}

/// Postgres-backed store. State goes to a JSONB column keyed by session key;
/// transcript rows are append-only.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<SessionState>> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT state_json FROM sessions WHERE session_key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some((value,)) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, state: &SessionState) -> Result<()> {
        let state_json = serde_json::to_value(state)?;
        sqlx::query(
            r#"
            INSERT INTO sessions (session_key, state_json)
            VALUES ($1, $2)
            ON CONFLICT (session_key)
            DO UPDATE SET state_json = EXCLUDED.state_json, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(state_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE session_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_transcript(&self, key: &str, entry: &TranscriptEntry) -> Result<()> {
        let entry_json = serde_json::to_value(entry)?;
        sqlx::query("INSERT INTO transcript (session_key, entry) VALUES ($1, $2)")
            .bind(key)
            .bind(entry_json)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recent_transcript(&self, key: &str, limit: usize) -> Result<Vec<TranscriptEntry>> {
        let rows: Vec<(serde_json::Value,)> = sqlx::query_as(
            "SELECT entry FROM transcript WHERE session_key = $1 ORDER BY id DESC LIMIT $2",
        )
        .bind(key)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut entries = rows
            .into_iter()
            .map(|(value,)| serde_json::from_value(value))
            .collect::<Result<Vec<TranscriptEntry>, _>>()?;
        entries.reverse();
        Ok(entries)
    }

    async fn clear_transcript(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM transcript WHERE session_key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
