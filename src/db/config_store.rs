use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};

use crate::config::{config_keys, DriftThresholds, MatchingConfig, Tolerances, Weights};
use crate::db::audit::{action, entity, AuditEvent, AuditLog};
use crate::error::Result;
use crate::types::now_ms;

/// Persisted overrides for the engine settings. A stored value wins when it
/// parses and validates; anything else falls back to the built-in default.
#[derive(Clone)]
pub struct ConfigStore {
    pool: SqlitePool,
    audit: AuditLog,
}

impl ConfigStore {
    pub fn new(pool: SqlitePool, audit: AuditLog) -> Self {
        Self { pool, audit }
    }

    /// Never fails: each key degrades to its default independently.
    pub async fn load(&self) -> MatchingConfig {
        MatchingConfig {
            weights: self.load_key(config_keys::WEIGHTS, Weights::validate).await,
            tolerances: self.load_key(config_keys::TOLERANCES, Tolerances::validate).await,
            drift_thresholds: self
                .load_key(config_keys::DRIFT_THRESHOLDS, DriftThresholds::validate)
                .await,
        }
    }

    async fn load_key<T>(&self, key: &str, validate: fn(&T) -> Result<()>) -> T
    where
        T: DeserializeOwned + Default,
    {
        let raw = match self.raw(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return T::default(),
            Err(e) => {
                warn!(key, "Config read failed, using defaults: {e}");
                return T::default();
            }
        };
        match serde_json::from_value::<T>(raw) {
            Ok(value) => match validate(&value) {
                Ok(()) => value,
                Err(e) => {
                    warn!(key, "Stored config invalid, using defaults: {e}");
                    T::default()
                }
            },
            Err(e) => {
                warn!(key, "Stored config malformed, using defaults: {e}");
                T::default()
            }
        }
    }

    async fn raw(&self, key: &str) -> Result<Option<Value>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM matching_config WHERE key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value.map(|v| serde_json::from_str(&v)).transpose()?)
    }

    pub async fn update_weights(&self, weights: Weights, actor: &str) -> Result<()> {
        weights.validate()?;
        self.store(config_keys::WEIGHTS, &weights, actor).await
    }

    pub async fn update_tolerances(&self, tolerances: Tolerances, actor: &str) -> Result<()> {
        tolerances.validate()?;
        self.store(config_keys::TOLERANCES, &tolerances, actor).await
    }

    pub async fn update_drift_thresholds(
        &self,
        thresholds: DriftThresholds,
        actor: &str,
    ) -> Result<()> {
        thresholds.validate()?;
        self.store(config_keys::DRIFT_THRESHOLDS, &thresholds, actor)
            .await
    }

    async fn store<T: Serialize>(&self, key: &str, value: &T, actor: &str) -> Result<()> {
        let value = serde_json::to_value(value)?;
        let mut tx = self.pool.begin().await?;
        let previous = previous_value(&mut tx, key).await?;

        sqlx::query(
            r#"
            INSERT INTO matching_config (key, value, updated_by, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_by = excluded.updated_by,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value.to_string())
        .bind(actor)
        .bind(now_ms())
        .execute(&mut *tx)
        .await?;

        let mut event = AuditEvent::new(action::CONFIG_UPDATED, entity::MATCHING_CONFIG, key, actor)
            .after(value)
            .metadata(json!({ "key": key }));
        if let Some(previous) = previous {
            event = event.before(previous);
        }
        self.audit.log_with(&mut tx, event).await?;
        tx.commit().await?;

        info!(key, actor, "Matching config updated");
        Ok(())
    }
}

/// The value being replaced. A stored value that is not valid JSON is kept
/// verbatim as a string so the audit entry still shows what was there.
async fn previous_value(conn: &mut SqliteConnection, key: &str) -> Result<Option<Value>> {
    let stored: Option<String> =
        sqlx::query_scalar("SELECT value FROM matching_config WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(stored.map(|raw| match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            warn!(key, "Replacing malformed stored config: {e}");
            Value::String(raw)
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::error::AppError;

    async fn store() -> ConfigStore {
        let pool = test_pool().await;
        ConfigStore::new(pool.clone(), AuditLog::new(pool))
    }

    #[tokio::test]
    async fn empty_store_yields_defaults() {
        let store = store().await;
        assert_eq!(store.load().await, MatchingConfig::default());
    }

    #[tokio::test]
    async fn override_wins_and_is_audited() {
        let store = store().await;
        let weights = Weights {
            amount: 50.0,
            address: 20.0,
            time: 20.0,
            token: 10.0,
        };
        store.update_weights(weights, "admin").await.unwrap();

        let cfg = store.load().await;
        assert_eq!(cfg.weights, weights);
        assert_eq!(cfg.tolerances, Tolerances::default());

        let history = store
            .audit
            .for_entity(entity::MATCHING_CONFIG, config_keys::WEIGHTS)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, action::CONFIG_UPDATED);
        assert!(history[0].previous_state.is_none());
    }

    #[tokio::test]
    async fn invalid_update_is_refused() {
        let store = store().await;
        let err = store
            .update_weights(
                Weights {
                    amount: 90.0,
                    address: 30.0,
                    time: 20.0,
                    token: 10.0,
                },
                "admin",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert_eq!(store.load().await.weights, Weights::default());
    }

    #[tokio::test]
    async fn malformed_stored_value_falls_back_to_default() {
        let store = store().await;
        sqlx::query(
            "INSERT INTO matching_config (key, value, updated_by, updated_at) VALUES (?, ?, 'x', 0)",
        )
        .bind(config_keys::DRIFT_THRESHOLDS)
        .bind(r#"{"alert_percent": "lots"}"#)
        .execute(&store.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO matching_config (key, value, updated_by, updated_at) VALUES (?, ?, 'x', 0)",
        )
        .bind(config_keys::WEIGHTS)
        .bind(r#"{"amount": 10, "address": 10, "time": 10, "token": 10}"#)
        .execute(&store.pool)
        .await
        .unwrap();

        let cfg = store.load().await;
        assert_eq!(cfg.drift_thresholds, DriftThresholds::default());
        assert_eq!(cfg.weights, Weights::default());
    }

    #[tokio::test]
    async fn replacing_a_malformed_value_keeps_it_in_history() {
        let store = store().await;
        sqlx::query(
            "INSERT INTO matching_config (key, value, updated_by, updated_at) VALUES (?, ?, 'x', 0)",
        )
        .bind(config_keys::TOLERANCES)
        .bind("not json")
        .execute(&store.pool)
        .await
        .unwrap();

        store
            .update_tolerances(Tolerances::default(), "admin")
            .await
            .unwrap();

        let history = store
            .audit
            .for_entity(entity::MATCHING_CONFIG, config_keys::TOLERANCES)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].previous_state, Some(Value::String("not json".to_string())));
    }

    #[tokio::test]
    async fn update_without_audit_is_not_applied() {
        let store = store().await;
        sqlx::query("DROP TABLE audit_log")
            .execute(&store.pool)
            .await
            .unwrap();
        let drift = DriftThresholds {
            alert_percent: 2.0,
            critical_percent: 10.0,
        };
        assert!(store.update_drift_thresholds(drift, "admin").await.is_err());
        assert_eq!(store.load().await.drift_thresholds, DriftThresholds::default());
    }
}
