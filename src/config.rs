use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Upper bound on claims returned per anchor by the candidate query.
pub const CANDIDATE_LIMIT: i64 = 50;

/// Maximum number of pairs accepted by a single batch approval.
pub const BATCH_APPROVE_MAX: usize = 100;

/// Actor recorded on audit entries written by the periodic jobs.
pub const SYSTEM_ACTOR: &str = "system";

/// Timeout applied to each external balance read (seconds).
pub const BALANCE_READ_TIMEOUT_SECS: u64 = 10;

/// Fixed risk component weights. Not configurable.
pub mod risk_weights {
    pub const NEW_COUNTERPARTY: f64 = 30.0;
    pub const AMOUNT_ANOMALY_MAX: f64 = 30.0;
    pub const NEW_TOKEN: f64 = 20.0;
    pub const TIME_ANOMALY: f64 = 20.0;
    /// z-score at which the amount anomaly saturates.
    pub const Z_SATURATION: f64 = 3.0;
    /// Inclusive UTC hour range considered unusual.
    pub const UNUSUAL_HOURS: std::ops::RangeInclusive<u32> = 1..=5;
}

/// Keys of the persisted `matching_config` rows.
pub mod config_keys {
    pub const WEIGHTS: &str = "weights";
    pub const TOLERANCES: &str = "tolerances";
    pub const DRIFT_THRESHOLDS: &str = "drift_thresholds";
}

// ---------------------------------------------------------------------------
// Process configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    /// Base URL of the authoritative balance API (BALANCE_API_URL). Drift sync is
    /// disabled when unset.
    pub balance_api_url: Option<String>,
    /// Minimum score for a suggestion to be persisted (MATCH_MIN_SCORE)
    pub match_min_score: f64,
    /// Restrict suggestion generation to one token symbol (MATCH_TOKEN_FILTER)
    pub match_token_filter: Option<String>,
    pub match_interval_secs: u64,
    pub drift_interval_secs: u64,
    pub risk_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "reconciler.db".to_string()),
            balance_api_url: std::env::var("BALANCE_API_URL")
                .ok()
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty()),
            match_min_score: std::env::var("MATCH_MIN_SCORE")
                .unwrap_or_else(|_| "70".to_string())
                .parse::<f64>()
                .map_err(|_| AppError::Config("MATCH_MIN_SCORE must be a number".to_string()))?,
            match_token_filter: std::env::var("MATCH_TOKEN_FILTER")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            match_interval_secs: parse_secs("MATCH_INTERVAL_SECS", 60)?,
            drift_interval_secs: parse_secs("DRIFT_INTERVAL_SECS", 300)?,
            risk_interval_secs: parse_secs("RISK_INTERVAL_SECS", 300)?,
        })
    }
}

fn parse_secs(var: &str, default: u64) -> Result<u64> {
    match std::env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(0) | Err(_) => Err(AppError::Config(format!(
                "{var} must be a positive integer number of seconds"
            ))),
            Ok(v) => Ok(v),
        },
    }
}

// ---------------------------------------------------------------------------
// Engine configuration (persisted in matching_config, defaults below)
// ---------------------------------------------------------------------------

/// Scoring weights. Must sum to 100.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub amount: f64,
    pub address: f64,
    pub time: f64,
    pub token: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            amount: 40.0,
            address: 30.0,
            time: 20.0,
            token: 10.0,
        }
    }
}

impl Weights {
    pub fn validate(&self) -> Result<()> {
        let parts = [self.amount, self.address, self.time, self.token];
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(AppError::InvalidInput(
                "weights must be finite and non-negative".to_string(),
            ));
        }
        let sum: f64 = parts.iter().sum();
        if (sum - 100.0).abs() > 0.01 {
            return Err(AppError::InvalidInput(format!(
                "weights must sum to 100 (got {sum})"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerances {
    /// Fractional amount tolerance (0.01 = 1%).
    pub amount_percent: f64,
    pub time_window_ms: i64,
    pub block_window: i64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            amount_percent: 0.01,
            time_window_ms: 3_600_000,
            block_window: 100,
        }
    }
}

impl Tolerances {
    pub fn validate(&self) -> Result<()> {
        if !self.amount_percent.is_finite() || !(0.0..=1.0).contains(&self.amount_percent) {
            return Err(AppError::InvalidInput(
                "amount_percent must be within [0, 1]".to_string(),
            ));
        }
        if self.time_window_ms < 0 || self.block_window < 0 {
            return Err(AppError::InvalidInput(
                "time_window_ms and block_window must be non-negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Drift alert thresholds, in percent of the external balance.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DriftThresholds {
    pub alert_percent: f64,
    pub critical_percent: f64,
}

impl Default for DriftThresholds {
    fn default() -> Self {
        Self {
            alert_percent: 1.0,
            critical_percent: 5.0,
        }
    }
}

impl DriftThresholds {
    pub fn validate(&self) -> Result<()> {
        if !self.alert_percent.is_finite() || !self.critical_percent.is_finite() {
            return Err(AppError::InvalidInput(
                "drift thresholds must be finite".to_string(),
            ));
        }
        if self.alert_percent < 0.0 || self.alert_percent > self.critical_percent {
            return Err(AppError::InvalidInput(format!(
                "drift thresholds require 0 <= alert_percent ({}) <= critical_percent ({})",
                self.alert_percent, self.critical_percent
            )));
        }
        Ok(())
    }
}

/// Snapshot of all engine settings, loaded once per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub weights: Weights,
    pub tolerances: Tolerances,
    pub drift_thresholds: DriftThresholds,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = MatchingConfig::default();
        assert!(cfg.weights.validate().is_ok());
        assert!(cfg.tolerances.validate().is_ok());
        assert!(cfg.drift_thresholds.validate().is_ok());
    }

    #[test]
    fn weights_must_sum_to_100() {
        let w = Weights {
            amount: 50.0,
            address: 30.0,
            time: 20.0,
            token: 10.0,
        };
        assert!(matches!(w.validate(), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn negative_weight_rejected() {
        let w = Weights {
            amount: 110.0,
            address: -10.0,
            time: 0.0,
            token: 0.0,
        };
        assert!(w.validate().is_err());
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let t = DriftThresholds {
            alert_percent: 10.0,
            critical_percent: 5.0,
        };
        assert!(t.validate().is_err());
    }

    #[test]
    fn tolerance_above_one_rejected() {
        let t = Tolerances {
            amount_percent: 1.5,
            ..Tolerances::default()
        };
        assert!(t.validate().is_err());
    }
}
