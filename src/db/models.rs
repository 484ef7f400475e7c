//! Database row types matching the schema in `migrations/`.
//! Decoded with `sqlx::FromRow`, then converted into the domain types.

use serde::de::DeserializeOwned;

use crate::error::{AppError, Result};
use crate::types::{
    AuditLogEntry, MatchSuggestion, RejectedPair, Transaction, WalletBalanceDrift, WalletRiskScore,
};

/// Column list shared by every `SELECT` that decodes into [`TransactionRow`].
pub const TRANSACTION_COLUMNS: &str = "id, tx_hash, source, status, tx_type, token_symbol, \
     token_address, amount_gross, amount_net, gas_used, sender, receiver, timestamp, \
     block_number, matched_tx_id, match_score, score_breakdown, reconciled_by, reconciled_at, \
     force_reconciled, notes, metadata, created_at";

pub const SUGGESTION_COLUMNS: &str =
    "id, anchor_id, claim_id, score, score_breakdown, status, reviewed_by, reviewed_at, created_at";

#[derive(Debug, sqlx::FromRow)]
pub struct TransactionRow {
    pub id: String,
    pub tx_hash: Option<String>,
    pub source: String,
    pub status: String,
    pub tx_type: String,
    pub token_symbol: String,
    pub token_address: Option<String>,
    pub amount_gross: f64,
    pub amount_net: Option<f64>,
    pub gas_used: Option<f64>,
    pub sender: String,
    pub receiver: String,
    pub timestamp: i64,
    pub block_number: Option<i64>,
    pub matched_tx_id: Option<String>,
    pub match_score: Option<f64>,
    pub score_breakdown: Option<String>,
    pub reconciled_by: Option<String>,
    pub reconciled_at: Option<i64>,
    pub force_reconciled: i64,
    pub notes: Option<String>,
    pub metadata: Option<String>,
    pub created_at: i64,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = AppError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(Transaction {
            source: row.source.parse().map_err(|e| corrupt(&row.id, e))?,
            status: row.status.parse().map_err(|e| corrupt(&row.id, e))?,
            tx_type: row.tx_type.parse().map_err(|e| corrupt(&row.id, e))?,
            score_breakdown: parse_json_opt(row.score_breakdown.as_deref())?,
            metadata: parse_json_opt(row.metadata.as_deref())?,
            force_reconciled: row.force_reconciled != 0,
            id: row.id,
            tx_hash: row.tx_hash,
            token_symbol: row.token_symbol,
            token_address: row.token_address,
            amount_gross: row.amount_gross,
            amount_net: row.amount_net,
            gas_used: row.gas_used,
            sender: row.sender,
            receiver: row.receiver,
            timestamp: row.timestamp,
            block_number: row.block_number,
            matched_tx_id: row.matched_tx_id,
            match_score: row.match_score,
            reconciled_by: row.reconciled_by,
            reconciled_at: row.reconciled_at,
            notes: row.notes,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct SuggestionRow {
    pub id: String,
    pub anchor_id: String,
    pub claim_id: String,
    pub score: f64,
    pub score_breakdown: String,
    pub status: String,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<i64>,
    pub created_at: i64,
}

impl TryFrom<SuggestionRow> for MatchSuggestion {
    type Error = AppError;

    fn try_from(row: SuggestionRow) -> Result<Self> {
        Ok(MatchSuggestion {
            status: row.status.parse().map_err(|e| corrupt(&row.id, e))?,
            score_breakdown: serde_json::from_str(&row.score_breakdown)?,
            id: row.id,
            anchor_id: row.anchor_id,
            claim_id: row.claim_id,
            score: row.score,
            reviewed_by: row.reviewed_by,
            reviewed_at: row.reviewed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct RejectedPairRow {
    pub anchor_id: String,
    pub claim_id: String,
    pub rejected_by: String,
    pub reason: Option<String>,
    pub created_at: i64,
}

impl From<RejectedPairRow> for RejectedPair {
    fn from(row: RejectedPairRow) -> Self {
        RejectedPair {
            anchor_id: row.anchor_id,
            claim_id: row.claim_id,
            rejected_by: row.rejected_by,
            reason: row.reason,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct AuditRow {
    pub id: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor: String,
    pub previous_state: Option<String>,
    pub new_state: Option<String>,
    pub metadata: Option<String>,
    pub created_at: i64,
}

impl TryFrom<AuditRow> for AuditLogEntry {
    type Error = AppError;

    fn try_from(row: AuditRow) -> Result<Self> {
        Ok(AuditLogEntry {
            previous_state: parse_json_opt(row.previous_state.as_deref())?,
            new_state: parse_json_opt(row.new_state.as_deref())?,
            metadata: parse_json_opt(row.metadata.as_deref())?,
            id: row.id,
            action: row.action,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            actor: row.actor,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct DriftRow {
    pub wallet: String,
    pub token_symbol: String,
    pub internal_balance: f64,
    pub onchain_balance: f64,
    pub drift: f64,
    pub drift_percentage: f64,
    pub alert_level: String,
    pub last_updated: i64,
}

impl TryFrom<DriftRow> for WalletBalanceDrift {
    type Error = AppError;

    fn try_from(row: DriftRow) -> Result<Self> {
        Ok(WalletBalanceDrift {
            alert_level: row
                .alert_level
                .parse()
                .map_err(|e| corrupt(&format!("{}/{}", row.wallet, row.token_symbol), e))?,
            wallet: row.wallet,
            token_symbol: row.token_symbol,
            internal_balance: row.internal_balance,
            onchain_balance: row.onchain_balance,
            drift: row.drift,
            drift_percentage: row.drift_percentage,
            last_updated: row.last_updated,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
pub struct RiskRow {
    pub wallet: String,
    pub risk_score: i64,
    pub risk_breakdown: String,
    pub metadata: String,
    pub last_calculated: i64,
}

impl TryFrom<RiskRow> for WalletRiskScore {
    type Error = AppError;

    fn try_from(row: RiskRow) -> Result<Self> {
        Ok(WalletRiskScore {
            risk_breakdown: serde_json::from_str(&row.risk_breakdown)?,
            metadata: serde_json::from_str(&row.metadata)?,
            wallet: row.wallet,
            risk_score: row.risk_score,
            last_calculated: row.last_calculated,
        })
    }
}

/// Convert a batch of rows, failing on the first corrupt one.
pub fn convert_all<R, T>(rows: Vec<R>) -> Result<Vec<T>>
where
    T: TryFrom<R, Error = AppError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn parse_json_opt<T: DeserializeOwned>(raw: Option<&str>) -> Result<Option<T>> {
    raw.map(serde_json::from_str).transpose().map_err(AppError::from)
}

fn corrupt(id: &str, detail: String) -> AppError {
    AppError::Corrupt(format!("{id}: {detail}"))
}
