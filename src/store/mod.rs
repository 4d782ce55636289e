//! Durable event sink backed by SQLite.
//!
//! The core runs fully in memory; this store is an optional sink that
//! mirrors the event stream and workflow rows for audit and operator
//! replay after a crash. Writes are idempotent keyed by workflow id
//! plus sequence number, so re-persisting a replayed stream is safe.
//! Migration is applied inline via `include_str!` on first open.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::bus::{BusItem, Event, Subscription};
use crate::types::Workflow;
use crate::workflow::approval::ApprovalRequest;

/// A persisted event row.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub seq: i64,
    pub kind: String,
    pub timestamp: String,
    pub payload: String,
}

/// SQLite-backed event and workflow sink.
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    /// Open (or create) the store at the given path and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create events db directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF")
            .pragma("foreign_keys", "ON");

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open events db at {}", path.display()))?;

        let migration_sql = include_str!("../../migrations/001_straylight_schema.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply events db schema migration")?;

        Ok(Self { pool })
    }

    /// Insert or update a workflow row.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn upsert_workflow(&self, workflow: &Workflow) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO workflows (workflow_id, target, user_intent, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(workflow_id) DO UPDATE SET status = ?4, updated_at = ?6",
        )
        .bind(workflow.id.to_string())
        .bind(&workflow.target)
        .bind(&workflow.user_intent)
        .bind(workflow.status.to_string())
        .bind(workflow.created_at.to_rfc3339())
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to upsert workflow row")?;
        Ok(())
    }

    /// Append one event. Idempotent: replaying an already-persisted
    /// `(workflow_id, seq)` pair is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn append_event(&self, event: &Event) -> anyhow::Result<()> {
        let payload =
            serde_json::to_string(&event.data).context("failed to serialize event payload")?;
        sqlx::query(
            "INSERT OR IGNORE INTO events (workflow_id, seq, kind, timestamp, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(event.workflow_id.to_string())
        .bind(i64::try_from(event.seq).unwrap_or(i64::MAX))
        .bind(event.kind.to_string())
        .bind(event.timestamp.to_rfc3339())
        .bind(payload)
        .execute(&self.pool)
        .await
        .context("failed to append event row")?;
        Ok(())
    }

    /// Record an approval request with its current status.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn record_approval(
        &self,
        request: &ApprovalRequest,
        status: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO approval_requests
                 (approval_id, workflow_id, phase, tool, target, reason, status, requested_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(approval_id) DO UPDATE SET status = ?7",
        )
        .bind(request.approval_id.to_string())
        .bind(request.workflow_id.to_string())
        .bind(request.phase.as_str())
        .bind(request.tool.as_deref())
        .bind(&request.target)
        .bind(&request.reason)
        .bind(status)
        .bind(request.requested_at.to_rfc3339())
        .bind(request.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to record approval request")?;
        Ok(())
    }

    /// Persisted events of a workflow, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn events_for(&self, workflow_id: Uuid) -> anyhow::Result<Vec<EventRow>> {
        let rows = sqlx::query(
            "SELECT seq, kind, timestamp, payload FROM events
             WHERE workflow_id = ?1 ORDER BY seq ASC",
        )
        .bind(workflow_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("failed to query events")?;

        Ok(rows
            .into_iter()
            .map(|row| EventRow {
                seq: row.get(0),
                kind: row.get(1),
                timestamp: row.get(2),
                payload: row.get(3),
            })
            .collect())
    }

    /// Spawn a task mirroring one workflow's event stream into the
    /// store until the stream ends.
    ///
    /// A lag marker means the sink fell behind the ring; the gap is
    /// logged and the mirror continues. Crash recovery remains
    /// best-effort.
    pub fn spawn_persister(store: Arc<Self>, workflow_id: Uuid, mut subscription: Subscription) {
        tokio::spawn(async move {
            while let Some(item) = subscription.recv().await {
                match item {
                    BusItem::Event(event) => {
                        if let Err(e) = store.append_event(&event).await {
                            warn!(workflow_id = %workflow_id, error = %e, "event persist failed");
                        }
                    }
                    BusItem::Lagged(n) => {
                        warn!(
                            workflow_id = %workflow_id,
                            dropped = n,
                            "event sink lagged; persisted log has a gap"
                        );
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, EventKind};
    use crate::types::WorkflowRequest;
    use serde_json::json;

    async fn store() -> (EventStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = EventStore::open(&dir.path().join("events.db"))
            .await
            .expect("open");
        (store, dir)
    }

    fn event(workflow_id: Uuid, seq: u64) -> Event {
        Event {
            kind: EventKind::InvocationProgress,
            workflow_id,
            seq,
            timestamp: chrono::Utc::now(),
            data: json!({"n": seq}),
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back_in_order() {
        let (store, _dir) = store().await;
        let id = Uuid::new_v4();

        for seq in [2_u64, 1, 3] {
            store.append_event(&event(id, seq)).await.expect("append");
        }

        let rows = store.events_for(id).await.expect("query");
        let seqs: Vec<i64> = rows.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_append_idempotent() {
        let (store, _dir) = store().await;
        let id = Uuid::new_v4();

        let first = event(id, 1);
        store.append_event(&first).await.expect("append");
        // Replaying the same seq with a different payload is ignored.
        let mut replay = event(id, 1);
        replay.data = json!({"different": true});
        store.append_event(&replay).await.expect("replay append");

        let rows = store.events_for(id).await.expect("query");
        assert_eq!(rows.len(), 1);
        assert!(rows[0].payload.contains("\"n\""), "first write wins");
    }

    #[tokio::test]
    async fn test_upsert_workflow_updates_status() {
        let (store, _dir) = store().await;
        let mut workflow = Workflow::from_request(WorkflowRequest {
            target: "example.com".to_owned(),
            user_intent: "scan".to_owned(),
            constraints: None,
            credentials: None,
        });

        store.upsert_workflow(&workflow).await.expect("insert");
        workflow.transition(crate::types::WorkflowStatus::Running);
        store.upsert_workflow(&workflow).await.expect("update");

        let status: String =
            sqlx::query("SELECT status FROM workflows WHERE workflow_id = ?1")
                .bind(workflow.id.to_string())
                .fetch_one(&store.pool)
                .await
                .expect("fetch")
                .get(0);
        assert_eq!(status, "running");
    }

    #[tokio::test]
    async fn test_persister_mirrors_stream() {
        let (store, _dir) = store().await;
        let store = Arc::new(store);
        let bus = EventBus::new();
        let id = Uuid::new_v4();

        let subscription = bus.subscribe(id).await;
        EventStore::spawn_persister(Arc::clone(&store), id, subscription);

        for _ in 0..3 {
            bus.publish(id, EventKind::InvocationProgress, json!({}))
                .await
                .expect("publish");
        }
        bus.close(id).await;

        // Give the mirror task a moment to drain.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let rows = store.events_for(id).await.expect("query");
        assert_eq!(rows.len(), 3);
    }
}
