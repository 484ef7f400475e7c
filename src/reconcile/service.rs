use serde_json::json;
use sqlx::{Sqlite, Transaction as DbTransaction};
use tracing::{debug, info, warn};

use crate::config::BATCH_APPROVE_MAX;
use crate::db::audit::{action, entity};
use crate::db::{AuditEvent, AuditLog, ConfigStore, LedgerStore};
use crate::error::{AppError, Result};
use crate::matcher::score_match;
use crate::types::{
    now_ms, BatchApproveResult, BatchFailure, MatchScore, MatchSuggestion, PairRef,
    SuggestionStatus, Transaction, TxStatus,
};

/// Owns every claim status change after suggestion: approval, rejection and
/// administrative marking. Each change is one database transaction guarded by
/// a conditional update, so a racing caller observes `InvalidState` instead of
/// overwriting.
#[derive(Clone)]
pub struct ReconciliationService {
    ledger: LedgerStore,
    config: ConfigStore,
    audit: AuditLog,
}

impl ReconciliationService {
    pub fn new(ledger: LedgerStore, config: ConfigStore, audit: AuditLog) -> Self {
        Self {
            ledger,
            config,
            audit,
        }
    }

    /// Link `claim_id` to `anchor_id`. Returns the updated claim.
    pub async fn approve(
        &self,
        anchor_id: &str,
        claim_id: &str,
        actor: &str,
        force: bool,
    ) -> Result<Transaction> {
        let anchor = self.ledger.require("anchor", anchor_id).await?;
        let claim = self.ledger.require("claim", claim_id).await?;

        if !anchor.is_anchor() {
            return Err(AppError::invalid_state(
                anchor_id,
                anchor.status,
                format!("anchor side must be on-chain sourced (source: {})", anchor.source),
            ));
        }
        if claim.is_anchor() {
            return Err(AppError::invalid_state(
                claim_id,
                claim.status,
                "claim side must not be an on-chain anchor",
            ));
        }

        let target = if force {
            TxStatus::ForceReconciled
        } else {
            TxStatus::Reconciled
        };
        let allowed = TxStatus::sources_for(target);
        if !allowed.contains(&claim.status) {
            let detail = if force {
                "claim is in a terminal status"
            } else {
                "claim must be pending or suggested_match"
            };
            return Err(AppError::invalid_state(claim_id, claim.status, detail));
        }
        if let Some(existing) = anchor.matched_tx_id.as_deref().filter(|m| *m != claim_id) {
            return Err(AppError::invalid_state(
                anchor_id,
                anchor.status,
                format!("anchor already matched to {existing}"),
            ));
        }

        let suggestion = self.ledger.suggestion_for_pair(anchor_id, claim_id).await?;
        let score = match &suggestion {
            Some(s) => MatchScore {
                total: s.score,
                breakdown: s.score_breakdown,
            },
            None => {
                let cfg = self.config.load().await;
                score_match(&anchor, &claim, &cfg.weights, &cfg.tolerances)
            }
        };
        let breakdown = serde_json::to_string(&score.breakdown)?;
        let now = now_ms();

        let mut tx = self.ledger.pool().begin().await?;

        let sql = format!(
            r#"
            UPDATE transactions
            SET status = ?, matched_tx_id = ?, match_score = ?, score_breakdown = ?,
                reconciled_by = ?, reconciled_at = ?, force_reconciled = ?
            WHERE id = ? AND source != 'onchain' AND status IN ({})
            "#,
            status_list(&allowed)
        );
        let claimed = sqlx::query(&sql)
            .bind(target.as_str())
            .bind(anchor_id)
            .bind(score.total)
            .bind(&breakdown)
            .bind(actor)
            .bind(now)
            .bind(i64::from(force))
            .bind(claim_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if claimed == 0 {
            tx.rollback().await?;
            return Err(self.lost_race(claim_id, "claim was modified concurrently").await);
        }

        let linked = sqlx::query(
            r#"
            UPDATE transactions
            SET matched_tx_id = ?, match_score = ?, score_breakdown = ?,
                reconciled_by = ?, reconciled_at = ?
            WHERE id = ? AND source = 'onchain'
              AND (matched_tx_id IS NULL OR matched_tx_id = ?)
            "#,
        )
        .bind(claim_id)
        .bind(score.total)
        .bind(&breakdown)
        .bind(actor)
        .bind(now)
        .bind(anchor_id)
        .bind(claim_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if linked == 0 {
            tx.rollback().await?;
            return Err(self.lost_race(anchor_id, "anchor was matched concurrently").await);
        }

        if suggestion.is_some() {
            review_suggestion(&mut tx, anchor_id, claim_id, SuggestionStatus::Approved, actor, now)
                .await?;
        }

        let updated = LedgerStore::get_by_id_with(&mut tx, claim_id)
            .await?
            .ok_or_else(|| AppError::not_found("claim", claim_id))?;
        let audit_action = if force {
            action::MATCH_FORCE_APPROVED
        } else {
            action::MATCH_APPROVED
        };
        self.audit
            .log_with(
                &mut tx,
                AuditEvent::new(audit_action, entity::TRANSACTION, claim_id, actor)
                    .before(serde_json::to_value(&claim)?)
                    .after(serde_json::to_value(&updated)?)
                    .metadata(json!({
                        "anchor_id": anchor_id,
                        "score": score.total,
                        "force": force,
                        "suggestion_id": suggestion.as_ref().map(|s| s.id.as_str()),
                    })),
            )
            .await?;
        tx.commit().await?;

        info!(
            anchor_id,
            claim_id,
            actor,
            force,
            score = score.total,
            "Claim {} -> {}",
            claim.status,
            target,
        );
        Ok(updated)
    }

    /// Permanently suppress the pair, close its suggestion, and return the
    /// claim to `pending` if it was `suggested_match`. Returns false when
    /// nothing changed (a repeated reject).
    pub async fn reject(
        &self,
        anchor_id: &str,
        claim_id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<bool> {
        let anchor = self.ledger.require("anchor", anchor_id).await?;
        let claim = self.ledger.require("claim", claim_id).await?;
        if !anchor.is_anchor() {
            return Err(AppError::invalid_state(
                anchor_id,
                anchor.status,
                "anchor side must be on-chain sourced",
            ));
        }

        let now = now_ms();
        let mut tx = self.ledger.pool().begin().await?;

        let suppressed = sqlx::query(
            r#"
            INSERT INTO rejected_pairs (anchor_id, claim_id, rejected_by, reason, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (anchor_id, claim_id) DO NOTHING
            "#,
        )
        .bind(anchor_id)
        .bind(claim_id)
        .bind(actor)
        .bind(reason)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        let closed =
            review_suggestion(&mut tx, anchor_id, claim_id, SuggestionStatus::Rejected, actor, now)
                .await?;

        let reverted = sqlx::query(
            "UPDATE transactions SET status = ? WHERE id = ? AND source != 'onchain' AND status = ?",
        )
        .bind(TxStatus::Pending.as_str())
        .bind(claim_id)
        .bind(TxStatus::SuggestedMatch.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !(suppressed || closed || reverted) {
            tx.rollback().await?;
            debug!(anchor_id, claim_id, "Pair already rejected");
            return Ok(false);
        }

        let new_status = if reverted {
            TxStatus::Pending
        } else {
            claim.status
        };
        self.audit
            .log_with(
                &mut tx,
                AuditEvent::new(action::MATCH_REJECTED, entity::TRANSACTION, claim_id, actor)
                    .before(json!({ "status": claim.status }))
                    .after(json!({ "status": new_status }))
                    .metadata(json!({
                        "anchor_id": anchor_id,
                        "reason": reason,
                        "suggestion_closed": closed,
                    })),
            )
            .await?;
        tx.commit().await?;

        info!(anchor_id, claim_id, actor, reverted, "Pair rejected");
        Ok(true)
    }

    /// Approve each pair in order without force. Failures are collected and
    /// never stop the remaining pairs.
    pub async fn batch_approve(&self, pairs: &[PairRef], actor: &str) -> Result<BatchApproveResult> {
        if pairs.is_empty() || pairs.len() > BATCH_APPROVE_MAX {
            return Err(AppError::InvalidInput(format!(
                "batch must contain 1..={BATCH_APPROVE_MAX} pairs (got {})",
                pairs.len()
            )));
        }

        let mut result = BatchApproveResult::default();
        for pair in pairs {
            match self.approve(&pair.anchor_id, &pair.claim_id, actor, false).await {
                Ok(_) => result.approved += 1,
                Err(e) => {
                    warn!(
                        anchor_id = %pair.anchor_id,
                        claim_id = %pair.claim_id,
                        "Batch approval failed: {e}"
                    );
                    result.failed += 1;
                    result.failures.push(BatchFailure {
                        anchor_id: pair.anchor_id.clone(),
                        claim_id: pair.claim_id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            approved = result.approved,
            failed = result.failed,
            actor,
            "Batch approval complete"
        );
        Ok(result)
    }

    /// Administrative marking: `rejected`, `unreconciled`, or back to `pending`
    /// from `unreconciled`. The engine never calls this on its own.
    pub async fn mark(
        &self,
        claim_id: &str,
        to: TxStatus,
        actor: &str,
        note: Option<&str>,
    ) -> Result<Transaction> {
        if !matches!(
            to,
            TxStatus::Rejected | TxStatus::Unreconciled | TxStatus::Pending
        ) {
            return Err(AppError::InvalidInput(format!(
                "cannot mark a claim as {to}; use approve or reject"
            )));
        }
        let claim = self.ledger.require("claim", claim_id).await?;
        if claim.is_anchor() {
            return Err(AppError::invalid_state(
                claim_id,
                claim.status,
                "anchors cannot be marked",
            ));
        }
        if !claim.status.can_transition(to) {
            return Err(AppError::invalid_state(
                claim_id,
                claim.status,
                format!("transition to {to} not allowed"),
            ));
        }

        let now = now_ms();
        let mut tx = self.ledger.pool().begin().await?;
        let sql = format!(
            "UPDATE transactions SET status = ? WHERE id = ? AND source != 'onchain' AND status IN ({})",
            status_list(&TxStatus::sources_for(to))
        );
        let changed = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(claim_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if changed == 0 {
            tx.rollback().await?;
            return Err(self.lost_race(claim_id, "claim was modified concurrently").await);
        }
        if to == TxStatus::Rejected {
            sqlx::query(
                r#"
                UPDATE match_suggestions SET status = 'rejected', reviewed_by = ?, reviewed_at = ?
                WHERE claim_id = ? AND status = 'pending'
                "#,
            )
            .bind(actor)
            .bind(now)
            .bind(claim_id)
            .execute(&mut *tx)
            .await?;
        }
        let updated = LedgerStore::get_by_id_with(&mut tx, claim_id)
            .await?
            .ok_or_else(|| AppError::not_found("claim", claim_id))?;
        self.audit
            .log_with(
                &mut tx,
                AuditEvent::new(action::STATUS_MARKED, entity::TRANSACTION, claim_id, actor)
                    .before(json!({ "status": claim.status }))
                    .after(json!({ "status": to }))
                    .metadata(json!({ "note": note })),
            )
            .await?;
        tx.commit().await?;
        info!(claim_id, actor, "Claim marked {} -> {}", claim.status, to);
        Ok(updated)
    }

    pub async fn list_suggestions(
        &self,
        status: SuggestionStatus,
        limit: i64,
    ) -> Result<Vec<MatchSuggestion>> {
        self.ledger.list_suggestions(status, limit).await
    }

    /// Build the `InvalidState` reported to the loser of a race.
    async fn lost_race(&self, id: &str, detail: &str) -> AppError {
        match self.ledger.get_by_id(id).await {
            Ok(Some(current)) => AppError::invalid_state(id, current.status, detail),
            Ok(None) => AppError::not_found("transaction", id),
            Err(e) => e,
        }
    }
}

/// Close a still-pending suggestion. Returns whether a row changed.
async fn review_suggestion(
    tx: &mut DbTransaction<'_, Sqlite>,
    anchor_id: &str,
    claim_id: &str,
    status: SuggestionStatus,
    actor: &str,
    now: i64,
) -> Result<bool> {
    let changed = sqlx::query(
        r#"
        UPDATE match_suggestions SET status = ?, reviewed_by = ?, reviewed_at = ?
        WHERE anchor_id = ? AND claim_id = ? AND status = 'pending'
        "#,
    )
    .bind(status.as_str())
    .bind(actor)
    .bind(now)
    .bind(anchor_id)
    .bind(claim_id)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    Ok(changed > 0)
}

fn status_list(statuses: &[TxStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}
