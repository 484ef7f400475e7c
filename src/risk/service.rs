use tracing::{error, info};

use crate::db::models::{convert_all, RiskRow};
use crate::db::LedgerStore;
use crate::error::{AppError, Result};
use crate::risk::scoring::assess;
use crate::types::{now_ms, SyncSummary, WalletRiskScore};

const RISK_COLUMNS: &str = "wallet, risk_score, risk_breakdown, metadata, last_calculated";

#[derive(Clone)]
pub struct RiskService {
    ledger: LedgerStore,
}

impl RiskService {
    pub fn new(ledger: LedgerStore) -> Self {
        Self { ledger }
    }

    /// Recompute and persist the risk score of one wallet.
    pub async fn calculate(&self, wallet: &str) -> Result<WalletRiskScore> {
        let wallet = wallet.to_lowercase();
        let txs = self.ledger.transactions_for_wallet(&wallet).await?;
        if txs.is_empty() {
            return Err(AppError::not_found("wallet", wallet));
        }

        let assessment = assess(&wallet, &txs);
        let score = WalletRiskScore {
            wallet,
            risk_score: assessment.score,
            risk_breakdown: assessment.breakdown,
            metadata: assessment.metadata,
            last_calculated: now_ms(),
        };

        sqlx::query(
            r#"
            INSERT INTO wallet_risk_scores (wallet, risk_score, risk_breakdown, metadata, last_calculated)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(wallet) DO UPDATE SET
                risk_score = excluded.risk_score,
                risk_breakdown = excluded.risk_breakdown,
                metadata = excluded.metadata,
                last_calculated = excluded.last_calculated
            "#,
        )
        .bind(&score.wallet)
        .bind(score.risk_score)
        .bind(serde_json::to_string(&score.risk_breakdown)?)
        .bind(serde_json::to_string(&score.metadata)?)
        .bind(score.last_calculated)
        .execute(self.ledger.pool())
        .await?;

        Ok(score)
    }

    pub async fn recalculate_all(&self) -> Result<SyncSummary> {
        let wallets = self.ledger.wallets().await?;

        let mut summary = SyncSummary::default();
        for wallet in &wallets {
            match self.calculate(wallet).await {
                Ok(_) => summary.processed += 1,
                Err(e) => {
                    error!(wallet = %wallet, "Risk calculation failed: {e}");
                    summary.failed += 1;
                }
            }
        }

        info!(
            processed = summary.processed,
            failed = summary.failed,
            "Risk recalculation complete for {} wallets",
            wallets.len()
        );
        Ok(summary)
    }

    pub async fn get_by_wallet(&self, wallet: &str) -> Result<WalletRiskScore> {
        let sql = format!("SELECT {RISK_COLUMNS} FROM wallet_risk_scores WHERE wallet = ?");
        let row = sqlx::query_as::<_, RiskRow>(&sql)
            .bind(wallet.to_lowercase())
            .fetch_optional(self.ledger.pool())
            .await?
            .ok_or_else(|| AppError::not_found("wallet", wallet))?;
        row.try_into()
    }

    /// All stored scores, riskiest first.
    pub async fn get_all(&self) -> Result<Vec<WalletRiskScore>> {
        let sql = format!(
            "SELECT {RISK_COLUMNS} FROM wallet_risk_scores ORDER BY risk_score DESC, wallet"
        );
        let rows = sqlx::query_as::<_, RiskRow>(&sql)
            .fetch_all(self.ledger.pool())
            .await?;
        convert_all(rows)
    }
}
