//! API request and response models.

use crate::chain::ReceiptStatus;
use crate::types::{Amount, EntryKind, EntryStatus, TreasuryEntry};
use crate::treasury::ReconciledEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// POST /api/games
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartGameBody {
    pub account: String,
    pub game_category: String,
    pub game_variant: String,
    pub stake: Amount,
}

/// POST /api/provider/fulfill
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillBody {
    pub sequence_number: u64,
    /// Hex, optionally `0x`-prefixed.
    pub revealed_seed: String,
    pub provider_random: String,
    #[serde(default)]
    pub tx_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillResponse {
    /// `settled` or `parked`
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// POST /api/treasury/deposit
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositBody {
    pub account: String,
    pub amount: Amount,
    pub tx_ref: String,
}

/// POST /api/treasury/withdraw
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawBody {
    pub account: String,
    pub amount: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryView {
    pub id: String,
    pub kind: EntryKind,
    pub account: String,
    pub amount: Amount,
    pub status: EntryStatus,
    pub tx_ref: Option<String>,
    pub reference: Option<String>,
    pub note: Option<String>,
    pub recorded_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_status: Option<ReceiptStatus>,
    pub mismatch: bool,
}

fn to_utc(millis: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis as i64).unwrap_or_default()
}

impl From<&TreasuryEntry> for EntryView {
    fn from(entry: &TreasuryEntry) -> Self {
        Self {
            id: entry.id.clone(),
            kind: entry.kind,
            account: entry.account.to_string(),
            amount: entry.amount,
            status: entry.status,
            tx_ref: entry.tx_ref.as_ref().map(|t| t.0.clone()),
            reference: entry.reference.as_ref().map(|r| r.to_string()),
            note: entry.note.clone(),
            recorded_at: to_utc(entry.timestamp),
            settled_at: entry.settled_at.map(to_utc),
            chain_status: None,
            mismatch: false,
        }
    }
}

impl From<&ReconciledEntry> for EntryView {
    fn from(reconciled: &ReconciledEntry) -> Self {
        Self {
            chain_status: reconciled.chain_status,
            mismatch: reconciled.mismatch,
            ..EntryView::from(&reconciled.entry)
        }
    }
}

/// GET /api/treasury/:account
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub account: String,
    /// Confirmed entries only.
    pub balance: i128,
    /// Balance minus pending withdrawals.
    pub available: i128,
    pub entries: Vec<EntryView>,
}

/// GET /api/treasury/health
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreasuryHealthResponse {
    pub treasury: String,
    pub on_chain_balance: Amount,
    pub ledger_liabilities: i128,
    pub pending_withdrawals: Amount,
    pub solvent: bool,
    pub adjustments: Vec<EntryView>,
    pub unresolved_withdrawals: Vec<EntryView>,
}

/// GET /api/requests/:id
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestResponse {
    pub request: crate::types::RandomnessRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<crate::coordinator::FrontEndResult>,
}
