pub mod audit;
pub mod config_store;
pub mod ledger;
pub mod models;

pub use audit::{AuditEvent, AuditLog};
pub use config_store::ConfigStore;
pub use ledger::LedgerStore;

use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::Result;

/// Open (creating if needed) the SQLite database and apply migrations.
pub async fn connect(db_path: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Single-connection in-memory database with the schema applied.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    use std::str::FromStr;

    let options = SqliteConnectOptions::from_str("sqlite::memory:").expect("memory url");
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .expect("open in-memory db");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("apply migrations");
    pool
}

/// Builders for ledger rows used across the test modules.
#[cfg(test)]
pub mod fixtures {
    use crate::types::{NewTransaction, TxSource, TxType};

    pub fn anchor(
        hash: &str,
        token: &str,
        amount: f64,
        ts: i64,
        sender: &str,
        receiver: &str,
    ) -> NewTransaction {
        NewTransaction {
            tx_hash: Some(hash.to_string()),
            source: TxSource::Onchain,
            tx_type: TxType::Transfer,
            token_symbol: token.to_string(),
            token_address: None,
            amount_gross: amount,
            amount_net: None,
            gas_used: None,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            timestamp: ts,
            block_number: Some(1),
            notes: None,
            metadata: None,
        }
    }

    pub fn claim(
        token: &str,
        amount: f64,
        ts: i64,
        sender: &str,
        receiver: &str,
    ) -> NewTransaction {
        NewTransaction {
            tx_hash: None,
            source: TxSource::Local,
            ..anchor("", token, amount, ts, sender, receiver)
        }
    }
}
