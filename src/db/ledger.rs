//! SQLite-backed ledger of anchors and claims.
//!
//! Serves as the candidate index and transaction lookup the matching,
//! reconciliation, drift and risk services read from. Candidate queries are
//! always bounded and index-driven; nothing here scans every claim.

use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::config::{Tolerances, CANDIDATE_LIMIT};
use crate::db::models::{
    convert_all, RejectedPairRow, SuggestionRow, TransactionRow, SUGGESTION_COLUMNS,
    TRANSACTION_COLUMNS,
};
use crate::error::{AppError, Result};
use crate::types::{
    now_ms, MatchSuggestion, NewTransaction, RejectedPair, SuggestionStatus, Transaction, TxStatus,
};

#[derive(Clone)]
pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<Transaction>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_by_id_with(&mut conn, id).await
    }

    /// Read through a caller-held connection or open transaction.
    pub async fn get_by_id_with(conn: &mut SqliteConnection, id: &str) -> Result<Option<Transaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?");
        let row = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        row.map(Transaction::try_from).transpose()
    }

    /// Like [`get_by_id`](Self::get_by_id) but absent rows are `NotFound`.
    pub async fn require(&self, entity: &'static str, id: &str) -> Result<Transaction> {
        self.get_by_id(id)
            .await?
            .ok_or_else(|| AppError::not_found(entity, id))
    }

    /// Record an off-chain claim in `pending`.
    pub async fn insert_claim(&self, new: NewTransaction) -> Result<Transaction> {
        if new.source.is_anchor() {
            return Err(AppError::InvalidInput(
                "claims must not be on-chain sourced".to_string(),
            ));
        }
        validate_fields(&new)?;
        let id = Uuid::new_v4().to_string();
        self.insert_row(&id, &new, TxStatus::Pending, false).await?;
        self.require("claim", &id).await
    }

    /// Record an on-chain anchor. Idempotent on (tx_hash, token, type): a
    /// duplicate returns the row already stored.
    pub async fn upsert_anchor(&self, new: NewTransaction) -> Result<Transaction> {
        if !new.source.is_anchor() {
            return Err(AppError::InvalidInput(
                "anchors must be on-chain sourced".to_string(),
            ));
        }
        let Some(hash) = new.tx_hash.clone().filter(|h| !h.is_empty()) else {
            return Err(AppError::InvalidInput("anchors require a tx_hash".to_string()));
        };
        validate_fields(&new)?;

        let id = Uuid::new_v4().to_string();
        let inserted = self.insert_row(&id, &new, TxStatus::Anchor, true).await?;
        if !inserted {
            debug!(tx_hash = %hash, token = %new.token_symbol, "Anchor already recorded");
        }

        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE source = 'onchain' AND tx_hash = ? AND token_symbol = ? AND tx_type = ?"
        );
        let row = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(&hash)
            .bind(&new.token_symbol)
            .bind(new.tx_type.as_str())
            .fetch_one(&self.pool)
            .await?;
        Transaction::try_from(row)
    }

    /// Returns false when an anchor with the same identity already existed.
    async fn insert_row(
        &self,
        id: &str,
        new: &NewTransaction,
        status: TxStatus,
        if_absent: bool,
    ) -> Result<bool> {
        let conflict = if if_absent {
            "ON CONFLICT (tx_hash, token_symbol, tx_type) WHERE source = 'onchain' DO NOTHING"
        } else {
            ""
        };
        let sql = format!(
            r#"
            INSERT INTO transactions (
                id, tx_hash, source, status, tx_type, token_symbol, token_address,
                amount_gross, amount_net, gas_used, sender, receiver, timestamp,
                block_number, notes, metadata, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            {conflict}
            "#
        );
        let metadata = new.metadata.as_ref().map(serde_json::to_string).transpose()?;
        let result = sqlx::query(&sql)
            .bind(id)
            .bind(&new.tx_hash)
            .bind(new.source.as_str())
            .bind(status.as_str())
            .bind(new.tx_type.as_str())
            .bind(&new.token_symbol)
            .bind(new.token_address.as_ref().map(|a| a.to_lowercase()))
            .bind(new.amount_gross)
            .bind(new.amount_net)
            .bind(new.gas_used)
            .bind(new.sender.to_lowercase())
            .bind(new.receiver.to_lowercase())
            .bind(new.timestamp)
            .bind(new.block_number)
            .bind(&new.notes)
            .bind(metadata)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Anchors not yet linked to a claim, oldest first.
    pub async fn unmatched_anchors(&self, token_filter: Option<&str>) -> Result<Vec<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE source = 'onchain' AND matched_tx_id IS NULL \
               AND (? IS NULL OR token_symbol = ?) \
             ORDER BY timestamp ASC"
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(token_filter)
            .bind(token_filter)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    /// Bounded candidate claims for one anchor: same token, timestamp within
    /// `± time_window_ms`, still open, and not permanently rejected for this
    /// anchor. The amount must sit within `amount_gross * amount_percent` of
    /// the anchor's gross amount or, when the anchor reports both a net amount
    /// and gas, of its net amount.
    pub async fn candidate_claims(
        &self,
        anchor: &Transaction,
        tolerances: &Tolerances,
    ) -> Result<Vec<Transaction>> {
        let gross = anchor.amount_gross;
        let slack = (gross * tolerances.amount_percent).abs();
        let net = match (anchor.amount_net, anchor.gas_used) {
            (Some(net), Some(_)) => net,
            _ => gross,
        };
        let sql = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS} FROM transactions t
            WHERE t.source != 'onchain'
              AND t.status IN ('pending', 'suggested_match')
              AND t.token_symbol = ?
              AND (t.amount_gross BETWEEN ? AND ? OR t.amount_gross BETWEEN ? AND ?)
              AND t.timestamp BETWEEN ? AND ?
              AND NOT EXISTS (
                  SELECT 1 FROM rejected_pairs r
                  WHERE r.anchor_id = ? AND r.claim_id = t.id
              )
            ORDER BY ABS(t.timestamp - ?) ASC
            LIMIT ?
            "#
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(&anchor.token_symbol)
            .bind(gross - slack)
            .bind(gross + slack)
            .bind(net - slack)
            .bind(net + slack)
            .bind(anchor.timestamp.saturating_sub(tolerances.time_window_ms))
            .bind(anchor.timestamp.saturating_add(tolerances.time_window_ms))
            .bind(&anchor.id)
            .bind(anchor.timestamp)
            .bind(CANDIDATE_LIMIT)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    /// Every transaction the wallet appears on, newest first.
    pub async fn transactions_for_wallet(&self, wallet: &str) -> Result<Vec<Transaction>> {
        let wallet = wallet.to_lowercase();
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE sender = ? OR receiver = ? \
             ORDER BY timestamp DESC, created_at DESC"
        );
        let rows = sqlx::query_as::<_, TransactionRow>(&sql)
            .bind(&wallet)
            .bind(&wallet)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    /// Signed sum of settled (reconciled / force-reconciled) transfers for one
    /// wallet and token: received amounts add, sent amounts subtract.
    pub async fn reconciled_balance(&self, wallet: &str, token: &str) -> Result<f64> {
        let wallet = wallet.to_lowercase();
        let rows: Vec<(f64, String, String)> = sqlx::query_as(
            r#"
            SELECT amount_gross, sender, receiver FROM transactions
            WHERE token_symbol = ?
              AND status IN ('reconciled', 'force_reconciled')
              AND (sender = ? OR receiver = ?)
            "#,
        )
        .bind(token)
        .bind(&wallet)
        .bind(&wallet)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|(amount, sender, receiver)| {
                let incoming = if *receiver == wallet { *amount } else { 0.0 };
                let outgoing = if *sender == wallet { *amount } else { 0.0 };
                incoming - outgoing
            })
            .sum())
    }

    /// Distinct (wallet, token) pairs seen on either side of any transaction.
    pub async fn wallet_token_pairs(&self) -> Result<Vec<(String, String)>> {
        let pairs = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT sender AS wallet, token_symbol FROM transactions
            UNION
            SELECT receiver AS wallet, token_symbol FROM transactions
            ORDER BY wallet, token_symbol
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(pairs)
    }

    /// Distinct wallets seen on either side of any transaction.
    pub async fn wallets(&self) -> Result<Vec<String>> {
        let wallets = sqlx::query_scalar::<_, String>(
            r#"
            SELECT sender AS wallet FROM transactions
            UNION
            SELECT receiver AS wallet FROM transactions
            ORDER BY wallet
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(wallets)
    }

    // -----------------------------------------------------------------------
    // Suggestions and suppression reads
    // -----------------------------------------------------------------------

    pub async fn suggestion_for_pair(
        &self,
        anchor_id: &str,
        claim_id: &str,
    ) -> Result<Option<MatchSuggestion>> {
        let sql = format!(
            "SELECT {SUGGESTION_COLUMNS} FROM match_suggestions WHERE anchor_id = ? AND claim_id = ?"
        );
        let row = sqlx::query_as::<_, SuggestionRow>(&sql)
            .bind(anchor_id)
            .bind(claim_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(MatchSuggestion::try_from).transpose()
    }

    /// Suggestions in `status`, best score first.
    pub async fn list_suggestions(
        &self,
        status: SuggestionStatus,
        limit: i64,
    ) -> Result<Vec<MatchSuggestion>> {
        let sql = format!(
            "SELECT {SUGGESTION_COLUMNS} FROM match_suggestions \
             WHERE status = ? ORDER BY score DESC, created_at ASC LIMIT ?"
        );
        let rows = sqlx::query_as::<_, SuggestionRow>(&sql)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    pub async fn rejected_pair(
        &self,
        anchor_id: &str,
        claim_id: &str,
    ) -> Result<Option<RejectedPair>> {
        let row = sqlx::query_as::<_, RejectedPairRow>(
            "SELECT anchor_id, claim_id, rejected_by, reason, created_at \
             FROM rejected_pairs WHERE anchor_id = ? AND claim_id = ?",
        )
        .bind(anchor_id)
        .bind(claim_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RejectedPair::from))
    }
}

fn validate_fields(new: &NewTransaction) -> Result<()> {
    if new.token_symbol.trim().is_empty() {
        return Err(AppError::InvalidInput("token_symbol is required".to_string()));
    }
    if !new.amount_gross.is_finite() || new.amount_gross < 0.0 {
        return Err(AppError::InvalidInput(format!(
            "amount_gross must be a non-negative number (got {})",
            new.amount_gross
        )));
    }
    if new.sender.trim().is_empty() || new.receiver.trim().is_empty() {
        return Err(AppError::InvalidInput(
            "sender and receiver are required".to_string(),
        ));
    }
    if new.amount_net.is_some_and(|n| !n.is_finite() || n < 0.0) {
        return Err(AppError::InvalidInput("amount_net must be non-negative".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fixtures::{anchor, claim};
    use crate::db::test_pool;

    #[tokio::test]
    async fn claims_start_pending_and_addresses_are_lowercased() {
        let store = LedgerStore::new(test_pool().await);
        let tx = store
            .insert_claim(claim("DAI", 10.0, 1_000, "0xAAA", "0xBBB"))
            .await
            .unwrap();
        assert_eq!(tx.status, TxStatus::Pending);
        assert_eq!(tx.sender, "0xaaa");
        assert_eq!(tx.receiver, "0xbbb");
    }

    #[tokio::test]
    async fn claim_with_onchain_source_is_rejected() {
        let store = LedgerStore::new(test_pool().await);
        let err = store
            .insert_claim(anchor("0x1", "DAI", 10.0, 1_000, "0xa", "0xb"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn anchor_upsert_is_idempotent() {
        let store = LedgerStore::new(test_pool().await);
        let first = store
            .upsert_anchor(anchor("0xhash", "DAI", 10.0, 1_000, "0xa", "0xb"))
            .await
            .unwrap();
        let second = store
            .upsert_anchor(anchor("0xhash", "DAI", 10.0, 1_000, "0xa", "0xb"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, TxStatus::Anchor);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transactions")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn candidates_are_filtered_by_token_amount_and_time() {
        let store = LedgerStore::new(test_pool().await);
        let a = store
            .upsert_anchor(anchor("0x1", "DAI", 100.0, 10_000, "0xa", "0xb"))
            .await
            .unwrap();
        let good = store
            .insert_claim(claim("DAI", 100.5, 10_500, "0xa", "0xb"))
            .await
            .unwrap();
        // wrong token
        store
            .insert_claim(claim("USDC", 100.0, 10_000, "0xa", "0xb"))
            .await
            .unwrap();
        // amount out of 1% tolerance
        store
            .insert_claim(claim("DAI", 102.0, 10_000, "0xa", "0xb"))
            .await
            .unwrap();
        // outside time window
        store
            .insert_claim(claim("DAI", 100.0, 10_000 + 7_200_000, "0xa", "0xb"))
            .await
            .unwrap();

        let candidates = store
            .candidate_claims(&a, &Tolerances::default())
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, good.id);
    }

    #[tokio::test]
    async fn candidates_include_claims_near_the_net_amount() {
        let store = LedgerStore::new(test_pool().await);
        let mut gassy = anchor("0x1", "DAI", 100.0, 10_000, "0xa", "0xb");
        gassy.amount_net = Some(97.0);
        gassy.gas_used = Some(3.0);
        let a = store.upsert_anchor(gassy).await.unwrap();
        let net_claim = store
            .insert_claim(claim("DAI", 97.0, 10_000, "0xa", "0xb"))
            .await
            .unwrap();
        // between the net and gross ranges
        store
            .insert_claim(claim("DAI", 98.5, 10_000, "0xa", "0xb"))
            .await
            .unwrap();

        let candidates = store
            .candidate_claims(&a, &Tolerances::default())
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, net_claim.id);

        // without gas the net amount is not a match target
        let mut no_gas = a.clone();
        no_gas.gas_used = None;
        assert!(store
            .candidate_claims(&no_gas, &Tolerances::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn reconciled_balance_is_signed_and_ignores_open_claims() {
        let store = LedgerStore::new(test_pool().await);
        let incoming = store
            .insert_claim(claim("DAI", 50.0, 1, "0xother", "0xwallet"))
            .await
            .unwrap();
        let outgoing = store
            .insert_claim(claim("DAI", 20.0, 2, "0xWALLET", "0xother"))
            .await
            .unwrap();
        store
            .insert_claim(claim("DAI", 999.0, 3, "0xother", "0xwallet"))
            .await
            .unwrap();
        sqlx::query("UPDATE transactions SET status = 'reconciled' WHERE id IN (?, ?)")
            .bind(&incoming.id)
            .bind(&outgoing.id)
            .execute(store.pool())
            .await
            .unwrap();

        let balance = store.reconciled_balance("0xWallet", "DAI").await.unwrap();
        assert!((balance - 30.0).abs() < 1e-9, "balance={balance}");
    }

    #[tokio::test]
    async fn wallet_discovery_covers_both_sides() {
        let store = LedgerStore::new(test_pool().await);
        store
            .insert_claim(claim("DAI", 1.0, 1, "0xa", "0xb"))
            .await
            .unwrap();
        store
            .insert_claim(claim("USDC", 1.0, 1, "0xb", "0xc"))
            .await
            .unwrap();

        assert_eq!(store.wallets().await.unwrap(), vec!["0xa", "0xb", "0xc"]);
        let pairs = store.wallet_token_pairs().await.unwrap();
        assert_eq!(pairs.len(), 4);
        assert!(pairs.contains(&("0xb".to_string(), "DAI".to_string())));
        assert!(pairs.contains(&("0xb".to_string(), "USDC".to_string())));
    }
}
