use std::sync::Arc;

use serde_json::json;
use sqlx::SqliteConnection;
use tracing::{error, info, warn};

use crate::config::{DriftThresholds, SYSTEM_ACTOR};
use crate::db::audit::{action, entity};
use crate::db::models::{convert_all, DriftRow};
use crate::db::{AuditEvent, AuditLog, ConfigStore, LedgerStore};
use crate::drift::BalanceSource;
use crate::error::{AppError, Result};
use crate::types::{now_ms, AlertLevel, SyncSummary, WalletBalanceDrift};

const DRIFT_COLUMNS: &str = "wallet, token_symbol, internal_balance, onchain_balance, drift, \
     drift_percentage, alert_level, last_updated";

/// Compares reconciled internal balances with an authoritative external
/// balance and keeps one drift row per (wallet, token).
#[derive(Clone)]
pub struct DriftService {
    ledger: LedgerStore,
    config: ConfigStore,
    audit: AuditLog,
    balances: Arc<dyn BalanceSource>,
}

impl DriftService {
    pub fn new(
        ledger: LedgerStore,
        config: ConfigStore,
        audit: AuditLog,
        balances: Arc<dyn BalanceSource>,
    ) -> Self {
        Self {
            ledger,
            config,
            audit,
            balances,
        }
    }

    pub async fn compute_drift(&self, wallet: &str, token: &str) -> Result<WalletBalanceDrift> {
        let thresholds = self.config.load().await.drift_thresholds;
        self.compute_with(wallet, token, &thresholds).await
    }

    async fn compute_with(
        &self,
        wallet: &str,
        token: &str,
        thresholds: &DriftThresholds,
    ) -> Result<WalletBalanceDrift> {
        let wallet = wallet.to_lowercase();
        let internal = self.ledger.reconciled_balance(&wallet, token).await?;

        // Degrade, don't fail: an unreadable external balance counts as zero.
        let external = match self.balances.read_balance(&wallet, token).await {
            Ok(balance) => balance,
            Err(e) => {
                warn!(wallet = %wallet, token, "External balance read failed, using 0: {e}");
                0.0
            }
        };

        let drift = external - internal;
        let drift_percentage = if external != 0.0 {
            drift / external * 100.0
        } else {
            0.0
        };
        let row = WalletBalanceDrift {
            alert_level: alert_level(drift_percentage, thresholds),
            wallet,
            token_symbol: token.to_string(),
            internal_balance: internal,
            onchain_balance: external,
            drift,
            drift_percentage,
            last_updated: now_ms(),
        };

        let mut tx = self.ledger.pool().begin().await?;
        let previous = fetch_with(&mut tx, &row.wallet, token).await?;
        upsert_with(&mut tx, &row).await?;

        if row.alert_level != AlertLevel::None {
            let entity_id = format!("{}:{}", row.wallet, row.token_symbol);
            let mut event =
                AuditEvent::new(action::DRIFT_ALERT, entity::WALLET_DRIFT, &entity_id, SYSTEM_ACTOR)
                    .after(serde_json::to_value(&row)?)
                    .metadata(json!({
                        "alert_percent": thresholds.alert_percent,
                        "critical_percent": thresholds.critical_percent,
                    }));
            if let Some(previous) = previous {
                event = event.before(serde_json::to_value(&previous)?);
            }
            self.audit.log_with(&mut tx, event).await?;
            warn!(
                wallet = %row.wallet,
                token,
                drift = row.drift,
                drift_pct = row.drift_percentage,
                level = %row.alert_level,
                "Balance drift alert"
            );
        }
        tx.commit().await?;

        Ok(row)
    }

    /// Recompute every (wallet, token) pair seen in the ledger. A failing pair
    /// is logged and skipped.
    pub async fn sync_all(&self) -> Result<SyncSummary> {
        let thresholds = self.config.load().await.drift_thresholds;
        let pairs = self.ledger.wallet_token_pairs().await?;

        let mut summary = SyncSummary::default();
        for (wallet, token) in &pairs {
            match self.compute_with(wallet, token, &thresholds).await {
                Ok(_) => summary.processed += 1,
                Err(e) => {
                    error!(wallet = %wallet, token = %token, "Drift computation failed: {e}");
                    summary.failed += 1;
                }
            }
        }

        info!(
            processed = summary.processed,
            failed = summary.failed,
            "Drift sync complete for {} wallet/token pairs",
            pairs.len()
        );
        Ok(summary)
    }

    pub async fn get_all(&self) -> Result<Vec<WalletBalanceDrift>> {
        let sql = format!(
            "SELECT {DRIFT_COLUMNS} FROM wallet_balance_drift ORDER BY wallet, token_symbol"
        );
        let rows = sqlx::query_as::<_, DriftRow>(&sql)
            .fetch_all(self.ledger.pool())
            .await?;
        convert_all(rows)
    }

    pub async fn get_by_wallet(&self, wallet: &str) -> Result<Vec<WalletBalanceDrift>> {
        let sql = format!(
            "SELECT {DRIFT_COLUMNS} FROM wallet_balance_drift WHERE wallet = ? ORDER BY token_symbol"
        );
        let rows = sqlx::query_as::<_, DriftRow>(&sql)
            .bind(wallet.to_lowercase())
            .fetch_all(self.ledger.pool())
            .await?;
        if rows.is_empty() {
            return Err(AppError::not_found("wallet", wallet));
        }
        convert_all(rows)
    }
}

async fn fetch_with(
    conn: &mut SqliteConnection,
    wallet: &str,
    token: &str,
) -> Result<Option<WalletBalanceDrift>> {
    let sql = format!(
        "SELECT {DRIFT_COLUMNS} FROM wallet_balance_drift WHERE wallet = ? AND token_symbol = ?"
    );
    let row = sqlx::query_as::<_, DriftRow>(&sql)
        .bind(wallet)
        .bind(token)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(WalletBalanceDrift::try_from).transpose()
}

async fn upsert_with(conn: &mut SqliteConnection, row: &WalletBalanceDrift) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO wallet_balance_drift (
            wallet, token_symbol, internal_balance, onchain_balance,
            drift, drift_percentage, alert_level, last_updated
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(wallet, token_symbol) DO UPDATE SET
            internal_balance = excluded.internal_balance,
            onchain_balance = excluded.onchain_balance,
            drift = excluded.drift,
            drift_percentage = excluded.drift_percentage,
            alert_level = excluded.alert_level,
            last_updated = excluded.last_updated
        "#,
    )
    .bind(&row.wallet)
    .bind(&row.token_symbol)
    .bind(row.internal_balance)
    .bind(row.onchain_balance)
    .bind(row.drift)
    .bind(row.drift_percentage)
    .bind(row.alert_level.as_str())
    .bind(row.last_updated)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Classify a drift percentage against the configured thresholds.
pub fn alert_level(drift_percentage: f64, thresholds: &DriftThresholds) -> AlertLevel {
    let magnitude = drift_percentage.abs();
    if magnitude >= thresholds.critical_percent {
        AlertLevel::Critical
    } else if magnitude >= thresholds.alert_percent {
        AlertLevel::Warning
    } else {
        AlertLevel::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fixtures::claim;
    use crate::db::test_pool;
    use async_trait::async_trait;
    use std::collections::HashMap;

    /// Fixed balances keyed by (wallet, token); unknown pairs fail the read.
    struct FixedBalances(HashMap<(String, String), f64>);

    #[async_trait]
    impl BalanceSource for FixedBalances {
        async fn read_balance(&self, wallet: &str, token: &str) -> Result<f64> {
            self.0
                .get(&(wallet.to_string(), token.to_string()))
                .copied()
                .ok_or_else(|| AppError::Balance("unreachable".to_string()))
        }
    }

    async fn service(balances: &[(&str, &str, f64)]) -> DriftService {
        let pool = test_pool().await;
        let audit = AuditLog::new(pool.clone());
        let map = balances
            .iter()
            .map(|(w, t, b)| ((w.to_string(), t.to_string()), *b))
            .collect();
        DriftService::new(
            LedgerStore::new(pool.clone()),
            ConfigStore::new(pool, audit.clone()),
            audit,
            Arc::new(FixedBalances(map)),
        )
    }

    async fn settle(svc: &DriftService, amount: f64, sender: &str, receiver: &str) {
        let c = svc
            .ledger
            .insert_claim(claim("DAI", amount, 1, sender, receiver))
            .await
            .unwrap();
        sqlx::query("UPDATE transactions SET status = 'reconciled' WHERE id = ?")
            .bind(&c.id)
            .execute(svc.ledger.pool())
            .await
            .unwrap();
    }

    #[test]
    fn alert_levels_follow_thresholds() {
        let t = DriftThresholds::default();
        assert_eq!(alert_level(0.5, &t), AlertLevel::None);
        assert_eq!(alert_level(-1.0, &t), AlertLevel::Warning);
        assert_eq!(alert_level(4.99, &t), AlertLevel::Warning);
        assert_eq!(alert_level(-5.0, &t), AlertLevel::Critical);
    }

    #[tokio::test]
    async fn matching_balances_have_no_drift_and_no_audit() {
        let svc = service(&[("0xw", "DAI", 100.0)]).await;
        settle(&svc, 100.0, "0xother", "0xw").await;

        let row = svc.compute_drift("0xW", "DAI").await.unwrap();
        assert_eq!(row.internal_balance, 100.0);
        assert_eq!(row.drift, 0.0);
        assert_eq!(row.alert_level, AlertLevel::None);
        assert!(svc.audit.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn critical_drift_is_stored_and_audited() {
        let svc = service(&[("0xw", "DAI", 100.0)]).await;
        settle(&svc, 90.0, "0xother", "0xw").await;

        let row = svc.compute_drift("0xw", "DAI").await.unwrap();
        assert_eq!(row.drift, 10.0);
        assert!((row.drift_percentage - 10.0).abs() < 1e-9);
        assert_eq!(row.alert_level, AlertLevel::Critical);

        let stored = svc.get_by_wallet("0xw").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].alert_level, AlertLevel::Critical);

        let audit = svc.audit.for_entity(entity::WALLET_DRIFT, "0xw:DAI").await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].action, action::DRIFT_ALERT);
    }

    #[tokio::test]
    async fn alert_without_audit_is_not_stored() {
        let svc = service(&[("0xw", "DAI", 100.0)]).await;
        settle(&svc, 90.0, "0xother", "0xw").await;
        sqlx::query("DROP TABLE audit_log")
            .execute(svc.ledger.pool())
            .await
            .unwrap();

        assert!(svc.compute_drift("0xw", "DAI").await.is_err());
        assert!(svc.get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_external_balance_never_divides() {
        let svc = service(&[("0xw", "DAI", 0.0)]).await;
        settle(&svc, 50.0, "0xother", "0xw").await;

        let row = svc.compute_drift("0xw", "DAI").await.unwrap();
        assert_eq!(row.drift, -50.0);
        assert_eq!(row.drift_percentage, 0.0);
        assert_eq!(row.alert_level, AlertLevel::None);
    }

    #[tokio::test]
    async fn failed_balance_read_degrades_to_zero() {
        let svc = service(&[]).await;
        settle(&svc, 25.0, "0xother", "0xw").await;

        let row = svc.compute_drift("0xw", "DAI").await.unwrap();
        assert_eq!(row.onchain_balance, 0.0);
        assert_eq!(row.internal_balance, 25.0);
    }

    #[tokio::test]
    async fn sync_all_covers_every_pair_and_upserts() {
        let svc = service(&[("0xa", "DAI", 10.0), ("0xb", "DAI", 0.0)]).await;
        settle(&svc, 10.0, "0xb", "0xa").await;

        let first = svc.sync_all().await.unwrap();
        assert_eq!(first.processed, 2);
        assert_eq!(first.failed, 0);
        let second = svc.sync_all().await.unwrap();
        assert_eq!(second.processed, 2);

        let all = svc.get_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].wallet, "0xa");
        assert_eq!(all[0].drift, 0.0);
        assert_eq!(all[1].internal_balance, -10.0);
    }

    #[tokio::test]
    async fn unknown_wallet_is_not_found() {
        let svc = service(&[]).await;
        let err = svc.get_by_wallet("0xnobody").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound { .. }));
    }
}
