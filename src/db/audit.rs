//! Append-only audit trail. Rows are inserted and read, never updated or deleted.

use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::db::models::{convert_all, AuditRow};
use crate::error::Result;
use crate::types::{now_ms, AuditLogEntry};

pub mod entity {
    pub const TRANSACTION: &str = "transaction";
    pub const MATCHING_RUN: &str = "matching_run";
    pub const MATCHING_CONFIG: &str = "matching_config";
    pub const WALLET_DRIFT: &str = "wallet_balance_drift";
}

pub mod action {
    pub const SUGGESTIONS_GENERATED: &str = "suggestions_generated";
    pub const MATCH_APPROVED: &str = "match_approved";
    pub const MATCH_FORCE_APPROVED: &str = "match_force_approved";
    pub const MATCH_REJECTED: &str = "match_rejected";
    pub const STATUS_MARKED: &str = "status_marked";
    pub const CONFIG_UPDATED: &str = "config_updated";
    pub const DRIFT_ALERT: &str = "drift_alert";
}

/// One mutating action to be recorded.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor: String,
    pub previous_state: Option<Value>,
    pub new_state: Option<Value>,
    pub metadata: Option<Value>,
}

impl AuditEvent {
    pub fn new(action: &str, entity_type: &str, entity_id: &str, actor: &str) -> Self {
        Self {
            action: action.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            actor: actor.to_string(),
            previous_state: None,
            new_state: None,
            metadata: None,
        }
    }

    pub fn before(mut self, state: Value) -> Self {
        self.previous_state = Some(state);
        self
    }

    pub fn after(mut self, state: Value) -> Self {
        self.new_state = Some(state);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Clone)]
pub struct AuditLog {
    pool: SqlitePool,
}

impl AuditLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn log(&self, event: AuditEvent) -> Result<AuditLogEntry> {
        let mut conn = self.pool.acquire().await?;
        self.log_with(&mut conn, event).await
    }

    /// Write the entry on a caller-held connection, typically the open
    /// transaction of the change being recorded, so both commit together.
    pub async fn log_with(
        &self,
        conn: &mut SqliteConnection,
        event: AuditEvent,
    ) -> Result<AuditLogEntry> {
        let entry = AuditLogEntry {
            id: Uuid::new_v4().to_string(),
            action: event.action,
            entity_type: event.entity_type,
            entity_id: event.entity_id,
            actor: event.actor,
            previous_state: event.previous_state,
            new_state: event.new_state,
            metadata: event.metadata,
            created_at: now_ms(),
        };

        sqlx::query(
            r#"
            INSERT INTO audit_log (
                id, action, entity_type, entity_id, actor,
                previous_state, new_state, metadata, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.id)
        .bind(&entry.action)
        .bind(&entry.entity_type)
        .bind(&entry.entity_id)
        .bind(&entry.actor)
        .bind(entry.previous_state.as_ref().map(Value::to_string))
        .bind(entry.new_state.as_ref().map(Value::to_string))
        .bind(entry.metadata.as_ref().map(Value::to_string))
        .bind(entry.created_at)
        .execute(&mut *conn)
        .await?;

        Ok(entry)
    }

    /// History of one entity, oldest first.
    pub async fn for_entity(&self, entity_type: &str, entity_id: &str) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, action, entity_type, entity_id, actor,
                   previous_state, new_state, metadata, created_at
            FROM audit_log
            WHERE entity_type = ? AND entity_id = ?
            ORDER BY created_at ASC, rowid ASC
            "#,
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }

    /// Most recent entries across all entities, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditLogEntry>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, action, entity_type, entity_id, actor,
                   previous_state, new_state, metadata, created_at
            FROM audit_log
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        convert_all(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use serde_json::json;

    #[tokio::test]
    async fn log_then_read_back_by_entity() {
        let audit = AuditLog::new(test_pool().await);
        audit
            .log(
                AuditEvent::new(action::MATCH_APPROVED, entity::TRANSACTION, "c1", "alice")
                    .before(json!({ "status": "pending" }))
                    .after(json!({ "status": "reconciled" })),
            )
            .await
            .unwrap();
        audit
            .log(AuditEvent::new(action::STATUS_MARKED, entity::TRANSACTION, "c2", "bob"))
            .await
            .unwrap();

        let history = audit.for_entity(entity::TRANSACTION, "c1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].actor, "alice");
        assert_eq!(history[0].previous_state, Some(json!({ "status": "pending" })));
        assert_eq!(history[0].new_state, Some(json!({ "status": "reconciled" })));
        assert!(history[0].metadata.is_none());

        let recent = audit.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].entity_id, "c2");
    }
}
