use std::time::Instant;

use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::audit::{action, entity};
use crate::db::{AuditEvent, AuditLog, ConfigStore, LedgerStore};
use crate::error::Result;
use crate::matcher::scoring::score_match;
use crate::types::{now_ms, GenerationSummary, MatchScore, Transaction, TxStatus};

/// Scores unmatched anchors against their candidate claims and persists the
/// pairs that clear the run's minimum score.
#[derive(Clone)]
pub struct MatchingEngine {
    ledger: LedgerStore,
    config: ConfigStore,
    audit: AuditLog,
}

#[derive(Debug, PartialEq, Eq)]
enum Persisted {
    Created,
    Rescored,
    Closed,
}

impl MatchingEngine {
    pub fn new(ledger: LedgerStore, config: ConfigStore, audit: AuditLog) -> Self {
        Self {
            ledger,
            config,
            audit,
        }
    }

    pub async fn generate_suggestions(
        &self,
        token_filter: Option<&str>,
        min_score: f64,
        actor: &str,
    ) -> Result<GenerationSummary> {
        let started = Instant::now();
        let cfg = self.config.load().await;
        let anchors = self.ledger.unmatched_anchors(token_filter).await?;

        let mut summary = GenerationSummary {
            anchors_scanned: anchors.len(),
            ..GenerationSummary::default()
        };
        let mut rescored = 0usize;

        for anchor in &anchors {
            let candidates = self.ledger.candidate_claims(anchor, &cfg.tolerances).await?;

            for claim in &candidates {
                if claim.is_anchor() {
                    continue;
                }
                summary.pairs_scored += 1;
                let score = score_match(anchor, claim, &cfg.weights, &cfg.tolerances);
                if score.total < min_score {
                    continue;
                }

                // A conflicting concurrent writer only costs us this pair.
                match self.persist_suggestion(anchor, claim, &score).await {
                    Ok(Persisted::Created) => summary.new_suggestion_count += 1,
                    Ok(Persisted::Rescored) => rescored += 1,
                    Ok(Persisted::Closed) => {}
                    Err(e) if e.is_write_conflict() => {
                        warn!(
                            anchor_id = %anchor.id,
                            claim_id = %claim.id,
                            "Skipping suggestion after write conflict: {e}"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        summary.elapsed_ms = started.elapsed().as_millis() as u64;

        self.audit
            .log(
                AuditEvent::new(
                    action::SUGGESTIONS_GENERATED,
                    entity::MATCHING_RUN,
                    &Uuid::new_v4().to_string(),
                    actor,
                )
                .metadata(json!({
                    "token_filter": token_filter,
                    "min_score": min_score,
                    "anchors_scanned": summary.anchors_scanned,
                    "pairs_scored": summary.pairs_scored,
                    "new_suggestions": summary.new_suggestion_count,
                    "rescored": rescored,
                    "elapsed_ms": summary.elapsed_ms,
                })),
            )
            .await?;

        info!(
            anchors = summary.anchors_scanned,
            pairs = summary.pairs_scored,
            created = summary.new_suggestion_count,
            rescored,
            elapsed_ms = summary.elapsed_ms,
            "Suggestion run complete: {} new suggestions from {} anchors",
            summary.new_suggestion_count,
            summary.anchors_scanned,
        );

        Ok(summary)
    }

    /// Insert the suggestion if absent, otherwise refresh its score while it is
    /// still pending. Then flip the claim to `suggested_match`, but only if it
    /// is still `pending`.
    async fn persist_suggestion(
        &self,
        anchor: &Transaction,
        claim: &Transaction,
        score: &MatchScore,
    ) -> Result<Persisted> {
        let breakdown = serde_json::to_string(&score.breakdown)?;
        let now = now_ms();

        let inserted = sqlx::query(
            r#"
            INSERT INTO match_suggestions (id, anchor_id, claim_id, score, score_breakdown, status, created_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?)
            ON CONFLICT (anchor_id, claim_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&anchor.id)
        .bind(&claim.id)
        .bind(score.total)
        .bind(&breakdown)
        .bind(now)
        .execute(self.ledger.pool())
        .await?
        .rows_affected()
            == 1;

        let outcome = if inserted {
            Persisted::Created
        } else {
            let updated = sqlx::query(
                r#"
                UPDATE match_suggestions SET score = ?, score_breakdown = ?
                WHERE anchor_id = ? AND claim_id = ? AND status = 'pending'
                "#,
            )
            .bind(score.total)
            .bind(&breakdown)
            .bind(&anchor.id)
            .bind(&claim.id)
            .execute(self.ledger.pool())
            .await?
            .rows_affected();
            if updated == 0 {
                // Already approved or rejected; leave the claim alone.
                return Ok(Persisted::Closed);
            }
            Persisted::Rescored
        };

        let flipped = sqlx::query(
            "UPDATE transactions SET status = ? WHERE id = ? AND status = ? AND source != 'onchain'",
        )
        .bind(TxStatus::SuggestedMatch.as_str())
        .bind(&claim.id)
        .bind(TxStatus::Pending.as_str())
        .execute(self.ledger.pool())
        .await?
        .rows_affected();
        if flipped == 1 {
            debug!(claim_id = %claim.id, anchor_id = %anchor.id, score = score.total, "Claim suggested");
        }

        Ok(outcome)
    }
}
