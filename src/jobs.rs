use std::time::Duration;

use tracing::{error, info};

use crate::config::SYSTEM_ACTOR;
use crate::drift::DriftService;
use crate::matcher::MatchingEngine;
use crate::risk::RiskService;

// ---------------------------------------------------------------------------
// Suggestion generation
// ---------------------------------------------------------------------------

/// Background task that generates match suggestions on a fixed interval.
pub struct MatchJob {
    engine: MatchingEngine,
    token_filter: Option<String>,
    min_score: f64,
    interval_secs: u64,
}

impl MatchJob {
    pub fn new(
        engine: MatchingEngine,
        token_filter: Option<String>,
        min_score: f64,
        interval_secs: u64,
    ) -> Self {
        Self {
            engine,
            token_filter,
            min_score,
            interval_secs,
        }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs));
        interval.tick().await; // consume immediate first tick

        loop {
            interval.tick().await;
            match self
                .engine
                .generate_suggestions(self.token_filter.as_deref(), self.min_score, SYSTEM_ACTOR)
                .await
            {
                Ok(summary) => info!(
                    anchors = summary.anchors_scanned,
                    new = summary.new_suggestion_count,
                    elapsed_ms = summary.elapsed_ms,
                    "Match job tick"
                ),
                Err(e) => error!("Match job error: {e}"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Drift and risk recompute
// ---------------------------------------------------------------------------

/// Background task that recomputes balance drift for every wallet/token pair.
pub struct DriftJob {
    service: DriftService,
    interval_secs: u64,
}

impl DriftJob {
    pub fn new(service: DriftService, interval_secs: u64) -> Self {
        Self {
            service,
            interval_secs,
        }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs));
        interval.tick().await;

        loop {
            interval.tick().await;
            if let Err(e) = self.service.sync_all().await {
                error!("Drift job error: {e}");
            }
        }
    }
}

pub struct RiskJob {
    service: RiskService,
    interval_secs: u64,
}

impl RiskJob {
    pub fn new(service: RiskService, interval_secs: u64) -> Self {
        Self {
            service,
            interval_secs,
        }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs));
        interval.tick().await;

        loop {
            interval.tick().await;
            if let Err(e) = self.service.recalculate_all().await {
                error!("Risk job error: {e}");
            }
        }
    }
}
