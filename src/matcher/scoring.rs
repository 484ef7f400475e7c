use crate::config::{Tolerances, Weights};
use crate::types::{MatchScore, ScoreBreakdown, Transaction};

/// Score an anchor/claim pair on four independent components.
///
/// Sub-scores are rounded to 2 decimals and the total is the sum of the
/// rounded sub-scores, so the breakdown always adds up to the stored total.
pub fn score_match(
    anchor: &Transaction,
    claim: &Transaction,
    weights: &Weights,
    tolerances: &Tolerances,
) -> MatchScore {
    let breakdown = ScoreBreakdown {
        amount: round2(amount_score(anchor, claim, weights.amount, tolerances.amount_percent)),
        address: round2(address_score(anchor, claim, weights.address)),
        time: round2(time_score(
            anchor.timestamp,
            claim.timestamp,
            weights.time,
            tolerances.time_window_ms,
        )),
        token: round2(token_score(anchor, claim, weights.token)),
    };
    MatchScore {
        total: round2(breakdown.sum()),
        breakdown,
    }
}

/// Gross-vs-gross decay, plus a net-vs-gross comparison when the anchor
/// reports both a net amount and gas. The better of the two wins.
fn amount_score(anchor: &Transaction, claim: &Transaction, weight: f64, tolerance: f64) -> f64 {
    let threshold = anchor.amount_gross * tolerance;
    let gross = linear_decay((anchor.amount_gross - claim.amount_gross).abs(), threshold, weight);

    match (anchor.amount_net, anchor.gas_used) {
        (Some(net), Some(_gas)) => {
            let net_score = linear_decay((net - claim.amount_gross).abs(), threshold, weight);
            gross.max(net_score)
        }
        _ => gross,
    }
}

fn address_score(anchor: &Transaction, claim: &Transaction, weight: f64) -> f64 {
    let half = weight / 2.0;
    let mut score = 0.0;
    if anchor.sender.eq_ignore_ascii_case(&claim.sender) {
        score += half;
    }
    if anchor.receiver.eq_ignore_ascii_case(&claim.receiver) {
        score += half;
    }
    score
}

fn time_score(anchor_ts: i64, claim_ts: i64, weight: f64, window_ms: i64) -> f64 {
    let diff = anchor_ts.abs_diff(claim_ts) as f64;
    linear_decay(diff, window_ms as f64, weight)
}

fn token_score(anchor: &Transaction, claim: &Transaction, weight: f64) -> f64 {
    if anchor.token_symbol == claim.token_symbol {
        weight
    } else {
        0.0
    }
}

/// Full weight at zero difference, linear down to zero at `threshold`.
fn linear_decay(diff: f64, threshold: f64, weight: f64) -> f64 {
    if diff == 0.0 {
        weight
    } else if threshold > 0.0 && diff <= threshold {
        weight * (1.0 - diff / threshold)
    } else {
        0.0
    }
}

pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TxSource, TxStatus, TxType};

    fn tx(source: TxSource, amount: f64, ts: i64, token: &str, sender: &str, receiver: &str) -> Transaction {
        Transaction {
            id: format!("{source}-{amount}-{ts}"),
            tx_hash: None,
            source,
            status: if source.is_anchor() { TxStatus::Anchor } else { TxStatus::Pending },
            tx_type: TxType::Transfer,
            token_symbol: token.to_string(),
            token_address: None,
            amount_gross: amount,
            amount_net: None,
            gas_used: None,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            timestamp: ts,
            block_number: None,
            matched_tx_id: None,
            match_score: None,
            score_breakdown: None,
            reconciled_by: None,
            reconciled_at: None,
            force_reconciled: false,
            notes: None,
            metadata: None,
            created_at: 0,
        }
    }

    fn weights() -> Weights {
        Weights {
            amount: 40.0,
            address: 30.0,
            time: 20.0,
            token: 10.0,
        }
    }

    fn tolerances() -> Tolerances {
        Tolerances {
            amount_percent: 0.01,
            time_window_ms: 3_600_000,
            block_window: 0,
        }
    }

    fn anchor() -> Transaction {
        tx(TxSource::Onchain, 100.0, 1000, "DAI", "0xA", "0xB")
    }

    #[test]
    fn identical_pair_scores_100() {
        let claim = tx(TxSource::Local, 100.0, 1000, "DAI", "0xA", "0xB");
        let score = score_match(&anchor(), &claim, &weights(), &tolerances());
        assert_eq!(score.total, 100.0);
        assert_eq!(
            score.breakdown,
            ScoreBreakdown {
                amount: 40.0,
                address: 30.0,
                time: 20.0,
                token: 10.0
            }
        );
    }

    #[test]
    fn identical_pair_scores_100_for_any_weights() {
        let claim = tx(TxSource::Csv, 100.0, 1000, "DAI", "0xa", "0xb");
        for w in [
            Weights { amount: 25.0, address: 25.0, time: 25.0, token: 25.0 },
            Weights { amount: 100.0, address: 0.0, time: 0.0, token: 0.0 },
            Weights { amount: 33.33, address: 33.33, time: 33.34, token: 0.0 },
        ] {
            let score = score_match(&anchor(), &claim, &w, &tolerances());
            assert!((score.total - 100.0).abs() < 0.011, "weights {w:?} gave {}", score.total);
        }
    }

    #[test]
    fn half_percent_over_halves_amount_score() {
        let claim = tx(TxSource::Local, 100.5, 1000, "DAI", "0xA", "0xB");
        let score = score_match(&anchor(), &claim, &weights(), &tolerances());
        assert_eq!(score.breakdown.amount, 20.0);
        assert_eq!(score.total, 80.0);
    }

    #[test]
    fn amount_score_is_monotonic_and_reaches_zero_at_threshold() {
        let mut prev = f64::INFINITY;
        for step in 0..=20 {
            let amount = 100.0 + step as f64 * 0.1;
            let claim = tx(TxSource::Local, amount, 1000, "DAI", "0xA", "0xB");
            let s = score_match(&anchor(), &claim, &weights(), &tolerances()).breakdown.amount;
            assert!(s <= prev, "score rose at diff {}", amount - 100.0);
            if amount - 100.0 >= 1.0 - 1e-9 {
                assert_eq!(s, 0.0);
            }
            prev = s;
        }
    }

    #[test]
    fn gas_aware_amount_takes_the_better_comparison() {
        let mut a = anchor();
        a.amount_net = Some(99.0);
        a.gas_used = Some(1.0);
        // claim reports the net figure: gross diff = 1.0 (zero score), net diff = 0
        let claim = tx(TxSource::Local, 99.0, 1000, "DAI", "0xA", "0xB");
        let score = score_match(&a, &claim, &weights(), &tolerances());
        assert_eq!(score.breakdown.amount, 40.0);

        // without gas usage the net amount is ignored
        a.gas_used = None;
        let score = score_match(&a, &claim, &weights(), &tolerances());
        assert_eq!(score.breakdown.amount, 0.0);
    }

    #[test]
    fn addresses_contribute_half_each_case_insensitively() {
        let claim = tx(TxSource::Local, 100.0, 1000, "DAI", "0xa", "0xC");
        let score = score_match(&anchor(), &claim, &weights(), &tolerances());
        assert_eq!(score.breakdown.address, 15.0);
    }

    #[test]
    fn time_decays_within_window_and_zero_beyond() {
        let claim = tx(TxSource::Local, 100.0, 1000 + 1_800_000, "DAI", "0xA", "0xB");
        let score = score_match(&anchor(), &claim, &weights(), &tolerances());
        assert_eq!(score.breakdown.time, 10.0);

        let late = tx(TxSource::Local, 100.0, 1000 + 3_600_001, "DAI", "0xA", "0xB");
        let score = score_match(&anchor(), &late, &weights(), &tolerances());
        assert_eq!(score.breakdown.time, 0.0);
    }

    #[test]
    fn token_mismatch_drops_token_weight() {
        let claim = tx(TxSource::Local, 100.0, 1000, "USDC", "0xA", "0xB");
        let score = score_match(&anchor(), &claim, &weights(), &tolerances());
        assert_eq!(score.breakdown.token, 0.0);
        assert_eq!(score.total, 90.0);
    }

    #[test]
    fn breakdown_sums_to_total() {
        let claim = tx(TxSource::Local, 100.337, 1000 + 1_234_567, "DAI", "0xa", "0xz");
        let score = score_match(&anchor(), &claim, &weights(), &tolerances());
        assert!((score.breakdown.sum() - score.total).abs() <= 0.01);
    }

    #[test]
    fn zero_tolerance_only_rewards_exact_amounts() {
        let tol = Tolerances { amount_percent: 0.0, ..tolerances() };
        let claim = tx(TxSource::Local, 100.01, 1000, "DAI", "0xA", "0xB");
        assert_eq!(score_match(&anchor(), &claim, &weights(), &tol).breakdown.amount, 0.0);
    }
}
