use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::BALANCE_READ_TIMEOUT_SECS;
use crate::error::{AppError, Result};

/// Authoritative balance read for one wallet and token.
#[async_trait]
pub trait BalanceSource: Send + Sync {
    async fn read_balance(&self, wallet: &str, token: &str) -> Result<f64>;
}

/// Reads balances from a REST endpoint: `GET {base}/balances/{wallet}/{token}`
/// answering `{"balance": <number or decimal string>}`.
pub struct HttpBalanceSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBalanceSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(BALANCE_READ_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl BalanceSource for HttpBalanceSource {
    async fn read_balance(&self, wallet: &str, token: &str) -> Result<f64> {
        let url = format!("{}/balances/{wallet}/{token}", self.base_url);
        let resp: Value = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_balance(&resp)
    }
}

fn parse_balance(resp: &Value) -> Result<f64> {
    let parsed = match resp.get("balance") {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|b| b.is_finite())
        .ok_or_else(|| AppError::Balance(format!("unexpected balance payload: {resp}")))
}
