use std::collections::HashSet;

use chrono::{DateTime, Timelike};

use crate::config::risk_weights as w;
use crate::types::{RiskBreakdown, RiskMetadata, Transaction};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskAssessment {
    pub score: i64,
    pub breakdown: RiskBreakdown,
    pub metadata: RiskMetadata,
}

/// Score the newest transaction of `wallet` against everything older.
///
/// `txs` must be ordered newest first. The first entry is the subject and the
/// remainder is the baseline; an empty baseline yields a zero score.
pub fn assess(wallet: &str, txs: &[Transaction]) -> RiskAssessment {
    let metadata = describe(wallet, txs);
    let (subject, history) = match txs.split_first() {
        Some((subject, history)) if !history.is_empty() => (subject, history),
        _ => {
            return RiskAssessment {
                score: 0,
                breakdown: RiskBreakdown::default(),
                metadata,
            }
        }
    };

    let seen_counterparties: HashSet<String> = history
        .iter()
        .filter_map(|t| t.counterparty_of(wallet))
        .map(str::to_lowercase)
        .collect();
    let seen_tokens: HashSet<&str> = history.iter().map(|t| t.token_symbol.as_str()).collect();
    let (mean, stddev) = (metadata.mean_amount, metadata.stddev_amount);

    let mut breakdown = RiskBreakdown::default();

    if let Some(cp) = subject.counterparty_of(wallet) {
        if !seen_counterparties.contains(&cp.to_lowercase()) {
            breakdown.new_counterparty = w::NEW_COUNTERPARTY;
        }
    }

    if stddev > 0.0 {
        let z = (subject.amount_gross - mean).abs() / stddev;
        breakdown.amount_anomaly = (z / w::Z_SATURATION * w::AMOUNT_ANOMALY_MAX)
            .round()
            .min(w::AMOUNT_ANOMALY_MAX);
    }

    if !seen_tokens.contains(subject.token_symbol.as_str()) {
        breakdown.new_token = w::NEW_TOKEN;
    }

    if utc_hour(subject.timestamp).is_some_and(|h| w::UNUSUAL_HOURS.contains(&h)) {
        breakdown.time_anomaly = w::TIME_ANOMALY;
    }

    RiskAssessment {
        score: (breakdown.sum().round() as i64).min(100),
        breakdown,
        metadata,
    }
}

fn describe(wallet: &str, txs: &[Transaction]) -> RiskMetadata {
    let history = txs.get(1..).unwrap_or_default();
    let (mean_amount, stddev_amount) = mean_stddev(history.iter().map(|t| t.amount_gross));
    let counterparties: HashSet<String> = txs
        .iter()
        .filter_map(|t| t.counterparty_of(wallet))
        .map(str::to_lowercase)
        .collect();
    let tokens: HashSet<&str> = txs.iter().map(|t| t.token_symbol.as_str()).collect();

    RiskMetadata {
        mean_amount,
        stddev_amount,
        total_tx_count: txs.len() as i64,
        unique_counterparties: counterparties.len() as i64,
        unique_tokens: tokens.len() as i64,
    }
}

/// Population mean and standard deviation; (0, 0) for an empty series.
fn mean_stddev(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let n = values.clone().count();
    if n == 0 {
        return (0.0, 0.0);
    }
    let mean = values.clone().sum::<f64>() / n as f64;
    let variance = values.map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    (mean, variance.sqrt())
}

fn utc_hour(timestamp_ms: i64) -> Option<u32> {
    DateTime::from_timestamp_millis(timestamp_ms).map(|dt| dt.hour())
}
