use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chain_reconciler::config::Config;
use chain_reconciler::db::{self, AuditLog, ConfigStore, LedgerStore};
use chain_reconciler::drift::{DriftService, HttpBalanceSource};
use chain_reconciler::error::Result;
use chain_reconciler::jobs::{DriftJob, MatchJob, RiskJob};
use chain_reconciler::matcher::MatchingEngine;
use chain_reconciler::risk::RiskService;

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let pool = db::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    let audit = AuditLog::new(pool.clone());
    let ledger = LedgerStore::new(pool.clone());
    let config_store = ConfigStore::new(pool.clone(), audit.clone());

    let engine_cfg = config_store.load().await;
    info!(
        weights = ?engine_cfg.weights,
        tolerances = ?engine_cfg.tolerances,
        drift = ?engine_cfg.drift_thresholds,
        "Matching configuration loaded"
    );

    // --- Spawn jobs ---

    // Suggestion generation
    let engine = MatchingEngine::new(ledger.clone(), config_store.clone(), audit.clone());
    let match_job = MatchJob::new(
        engine,
        cfg.match_token_filter.clone(),
        cfg.match_min_score,
        cfg.match_interval_secs,
    );
    tokio::spawn(async move { match_job.run().await });

    // Balance drift (needs an external balance source)
    match &cfg.balance_api_url {
        Some(url) => {
            let balances = Arc::new(HttpBalanceSource::new(url)?);
            let drift = DriftService::new(ledger.clone(), config_store.clone(), audit.clone(), balances);
            let drift_job = DriftJob::new(drift, cfg.drift_interval_secs);
            tokio::spawn(async move { drift_job.run().await });
            info!("Drift sync every {}s against {url}", cfg.drift_interval_secs);
        }
        None => warn!("BALANCE_API_URL not set, drift sync disabled"),
    }

    // Wallet risk
    let risk_job = RiskJob::new(RiskService::new(ledger), cfg.risk_interval_secs);
    tokio::spawn(async move { risk_job.run().await });

    info!(
        match_every = cfg.match_interval_secs,
        risk_every = cfg.risk_interval_secs,
        min_score = cfg.match_min_score,
        "Reconciler running"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    Ok(())
}
