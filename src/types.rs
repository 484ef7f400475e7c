use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Transaction enums
// ---------------------------------------------------------------------------

/// Where a transaction record came from. Only `Onchain` records are anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxSource {
    Onchain,
    Local,
    Csv,
    Manual,
}

impl TxSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxSource::Onchain => "onchain",
            TxSource::Local => "local",
            TxSource::Csv => "csv",
            TxSource::Manual => "manual",
        }
    }

    pub fn is_anchor(&self) -> bool {
        matches!(self, TxSource::Onchain)
    }
}

impl std::fmt::Display for TxSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "onchain" => Ok(TxSource::Onchain),
            "local" => Ok(TxSource::Local),
            "csv" => Ok(TxSource::Csv),
            "manual" => Ok(TxSource::Manual),
            other => Err(format!("unknown source '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxType {
    Transfer,
    Approval,
    Mint,
}

impl TxType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxType::Transfer => "transfer",
            TxType::Approval => "approval",
            TxType::Mint => "mint",
        }
    }
}

impl std::fmt::Display for TxType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transfer" => Ok(TxType::Transfer),
            "approval" => Ok(TxType::Approval),
            "mint" => Ok(TxType::Mint),
            other => Err(format!("unknown tx type '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Status state machine
// ---------------------------------------------------------------------------

/// Lifecycle status of a transaction row.
///
/// Anchors sit in `Anchor` forever. Claims start in `Pending` and move only
/// along the edges in [`TxStatus::can_transition`]; every SQL status write is a
/// conditional update built from that table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Anchor,
    Pending,
    SuggestedMatch,
    Reconciled,
    ForceReconciled,
    /// Administrative terminal marking. Never set by the engine itself.
    Rejected,
    /// Administrative "needs investigation" marking. Never set by the engine itself.
    Unreconciled,
}

impl TxStatus {
    pub const ALL: [TxStatus; 7] = [
        TxStatus::Anchor,
        TxStatus::Pending,
        TxStatus::SuggestedMatch,
        TxStatus::Reconciled,
        TxStatus::ForceReconciled,
        TxStatus::Rejected,
        TxStatus::Unreconciled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Anchor => "anchor",
            TxStatus::Pending => "pending",
            TxStatus::SuggestedMatch => "suggested_match",
            TxStatus::Reconciled => "reconciled",
            TxStatus::ForceReconciled => "force_reconciled",
            TxStatus::Rejected => "rejected",
            TxStatus::Unreconciled => "unreconciled",
        }
    }

    /// The authorised transition table.
    pub fn can_transition(self, to: TxStatus) -> bool {
        use TxStatus::*;
        match self {
            Pending => matches!(
                to,
                SuggestedMatch | Reconciled | ForceReconciled | Rejected | Unreconciled
            ),
            SuggestedMatch => matches!(
                to,
                Pending | Reconciled | ForceReconciled | Rejected | Unreconciled
            ),
            Unreconciled => matches!(to, Pending | ForceReconciled | Rejected),
            Anchor | Reconciled | ForceReconciled | Rejected => false,
        }
    }

    /// Every status that may legally move to `to`.
    pub fn sources_for(to: TxStatus) -> Vec<TxStatus> {
        TxStatus::ALL
            .into_iter()
            .filter(|from| from.can_transition(to))
            .collect()
    }

    pub fn is_terminal(self) -> bool {
        TxStatus::ALL.iter().all(|to| !self.can_transition(*to))
    }

    /// Statuses that count toward a wallet's internal balance.
    pub fn is_settled(self) -> bool {
        matches!(self, TxStatus::Reconciled | TxStatus::ForceReconciled)
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TxStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| format!("unknown status '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Per-component match scores, each rounded to 2 decimals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub amount: f64,
    pub address: f64,
    pub time: f64,
    pub token: f64,
}

impl ScoreBreakdown {
    pub fn sum(&self) -> f64 {
        self.amount + self.address + self.time + self.token
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchScore {
    pub total: f64,
    pub breakdown: ScoreBreakdown,
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub tx_hash: Option<String>,
    pub source: TxSource,
    pub status: TxStatus,
    pub tx_type: TxType,
    pub token_symbol: String,
    pub token_address: Option<String>,
    pub amount_gross: f64,
    pub amount_net: Option<f64>,
    pub gas_used: Option<f64>,
    pub sender: String,
    pub receiver: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub block_number: Option<i64>,
    pub matched_tx_id: Option<String>,
    pub match_score: Option<f64>,
    pub score_breakdown: Option<ScoreBreakdown>,
    pub reconciled_by: Option<String>,
    pub reconciled_at: Option<i64>,
    pub force_reconciled: bool,
    pub notes: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
}

impl Transaction {
    pub fn is_anchor(&self) -> bool {
        self.source.is_anchor()
    }

    /// The address on the other side of `wallet`, if `wallet` participates.
    pub fn counterparty_of(&self, wallet: &str) -> Option<&str> {
        if self.sender.eq_ignore_ascii_case(wallet) {
            Some(&self.receiver)
        } else if self.receiver.eq_ignore_ascii_case(wallet) {
            Some(&self.sender)
        } else {
            None
        }
    }
}

/// Fields supplied by ingestion when creating an anchor or a claim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransaction {
    pub tx_hash: Option<String>,
    pub source: TxSource,
    pub tx_type: TxType,
    pub token_symbol: String,
    pub token_address: Option<String>,
    pub amount_gross: f64,
    pub amount_net: Option<f64>,
    pub gas_used: Option<f64>,
    pub sender: String,
    pub receiver: String,
    pub timestamp: i64,
    pub block_number: Option<i64>,
    pub notes: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// Suggestions, suppression, audit
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionStatus {
    Pending,
    Approved,
    Rejected,
}

impl SuggestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionStatus::Pending => "pending",
            SuggestionStatus::Approved => "approved",
            SuggestionStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for SuggestionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SuggestionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SuggestionStatus::Pending),
            "approved" => Ok(SuggestionStatus::Approved),
            "rejected" => Ok(SuggestionStatus::Rejected),
            other => Err(format!("unknown suggestion status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSuggestion {
    pub id: String,
    pub anchor_id: String,
    pub claim_id: String,
    pub score: f64,
    pub score_breakdown: ScoreBreakdown,
    pub status: SuggestionStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedPair {
    pub anchor_id: String,
    pub claim_id: String,
    pub rejected_by: String,
    pub reason: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub actor: String,
    pub previous_state: Option<serde_json::Value>,
    pub new_state: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
}

// ---------------------------------------------------------------------------
// Drift
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    None,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::None => "none",
            AlertLevel::Warning => "warning",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(AlertLevel::None),
            "warning" => Ok(AlertLevel::Warning),
            "critical" => Ok(AlertLevel::Critical),
            other => Err(format!("unknown alert level '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletBalanceDrift {
    pub wallet: String,
    pub token_symbol: String,
    pub internal_balance: f64,
    pub onchain_balance: f64,
    pub drift: f64,
    pub drift_percentage: f64,
    pub alert_level: AlertLevel,
    pub last_updated: i64,
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskBreakdown {
    pub new_counterparty: f64,
    pub amount_anomaly: f64,
    pub new_token: f64,
    pub time_anomaly: f64,
}

impl RiskBreakdown {
    pub fn sum(&self) -> f64 {
        self.new_counterparty + self.amount_anomaly + self.new_token + self.time_anomaly
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskMetadata {
    pub mean_amount: f64,
    pub stddev_amount: f64,
    pub total_tx_count: i64,
    pub unique_counterparties: i64,
    pub unique_tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletRiskScore {
    pub wallet: String,
    pub risk_score: i64,
    pub risk_breakdown: RiskBreakdown,
    pub metadata: RiskMetadata,
    pub last_calculated: i64,
}

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub anchors_scanned: usize,
    pub pairs_scored: usize,
    pub new_suggestion_count: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRef {
    pub anchor_id: String,
    pub claim_id: String,
}

impl PairRef {
    pub fn new(anchor_id: impl Into<String>, claim_id: impl Into<String>) -> Self {
        Self {
            anchor_id: anchor_id.into(),
            claim_id: claim_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub anchor_id: String,
    pub claim_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchApproveResult {
    pub approved: usize,
    pub failed: usize,
    pub failures: Vec<BatchFailure>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSummary {
    pub processed: usize,
    pub failed: usize,
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
