//! Core data model shared by every component.
//!
//! Identifiers are newtypes so a request id can never be passed where a
//! transaction reference is expected. Fixed-width values serialize as hex.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Amount in base units of the relevant currency.
pub type Amount = u64;

/// Provider-assigned numeric handle of a funding resource (subscription).
pub type ResourceHandle = u64;

/// Provider-assigned correlation id of a randomness request.
pub type SequenceNumber = u64;

/// 32-byte hash or random word.
pub type Hash32 = [u8; 32];

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Serde helpers for `[u8; 32]` as a hex string.
pub mod hex32 {
    use super::Hash32;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Hash32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash32, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_hash32(&s).map_err(D::Error::custom)
    }

    pub mod option {
        use super::super::Hash32;
        use serde::{de::Error, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &Option<Hash32>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.serialize_some(&hex::encode(v)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Hash32>, D::Error> {
            let s: Option<String> = Option::deserialize(deserializer)?;
            s.map(|s| super::super::parse_hash32(&s).map_err(D::Error::custom))
                .transpose()
        }
    }
}

/// Parse a 32-byte value from hex, accepting an optional `0x` prefix.
pub fn parse_hash32(s: &str) -> Result<Hash32, String> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(trimmed).map_err(|e| format!("invalid hex: {}", e))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| format!("expected 32 bytes, got {}", v.len()))
}

/// Account or contract address. Stored lowercase so comparisons are exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Left-pad the address bytes into a 32-byte word for log topics.
    pub fn to_word(&self) -> Hash32 {
        let raw = self.0.strip_prefix("0x").unwrap_or(&self.0);
        let bytes = hex::decode(raw).unwrap_or_else(|_| raw.as_bytes().to_vec());
        let mut word = [0u8; 32];
        let take = bytes.len().min(32);
        word[32 - take..].copy_from_slice(&bytes[bytes.len() - take..]);
        word
    }

    /// Inverse of [`Address::to_word`] for 20-byte hex addresses.
    pub fn from_word(word: &Hash32) -> Self {
        Self(format!("0x{}", hex::encode(&word[12..])))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Opaque, deterministic request identifier (hex of a SHA-256 digest).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn from_digest(digest: &Hash32) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The digest bytes, used when the id is carried in provider calls.
    pub fn to_word(&self) -> Hash32 {
        parse_hash32(&self.0).unwrap_or([0u8; 32])
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RequestId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digest = parse_hash32(s)?;
        Ok(Self::from_digest(&digest))
    }
}

/// External transaction reference (hash or signature).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxRef(pub String);

impl fmt::Display for TxRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Block number a call or simulation is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockRef(pub u64);

/// Currency the provider charges request fees in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "symbol")]
pub enum FeeCurrency {
    Native,
    Token(String),
}

impl fmt::Display for FeeCurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeeCurrency::Native => write!(f, "native"),
            FeeCurrency::Token(symbol) => write!(f, "token:{}", symbol),
        }
    }
}

impl FromStr for FeeCurrency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "native" => Ok(FeeCurrency::Native),
            other => match other.strip_prefix("token:") {
                Some(symbol) if !symbol.is_empty() => Ok(FeeCurrency::Token(symbol.to_string())),
                _ => Err(format!("unknown fee currency '{}'", other)),
            },
        }
    }
}

/// Lifecycle of a randomness request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    Created,
    AwaitingFulfillment,
    Fulfilled,
    Expired,
}

impl RequestState {
    /// Forward-only transitions of the request state machine.
    pub fn can_advance_to(self, next: RequestState) -> bool {
        matches!(
            (self, next),
            (RequestState::Created, RequestState::AwaitingFulfillment)
                | (RequestState::AwaitingFulfillment, RequestState::Fulfilled)
                | (RequestState::AwaitingFulfillment, RequestState::Expired)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::Fulfilled | RequestState::Expired)
    }

    pub fn label(self) -> &'static str {
        match self {
            RequestState::Created => "created",
            RequestState::AwaitingFulfillment => "awaiting_fulfillment",
            RequestState::Fulfilled => "fulfilled",
            RequestState::Expired => "expired",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What is known about the provider-side submission of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmissionStatus {
    /// Nothing was sent to the provider yet.
    NotSubmitted,
    /// A submission was dispatched but its outcome is unknown (network error
    /// before any response). The provider may or may not hold the request.
    Dispatched,
    /// The provider accepted the submission.
    Accepted,
}

/// A single randomness request and its audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RandomnessRequest {
    pub id: RequestId,
    pub requester: Address,
    pub game_category: String,
    pub game_variant: String,
    pub stake: Amount,
    #[serde(with = "hex32")]
    pub commitment: Hash32,
    pub handle: ResourceHandle,
    pub sequence_number: Option<SequenceNumber>,
    pub state: RequestState,
    pub submission: SubmissionStatus,
    pub submission_tx: Option<TxRef>,
    pub fee_escrowed: Option<Amount>,
    #[serde(with = "hex32::option", default)]
    pub random_value: Option<Hash32>,
    pub fulfillment_tx: Option<TxRef>,
    /// Set when a fulfillment failed its commitment. Automatic processing of
    /// the request stops until an operator clears it.
    #[serde(default)]
    pub integrity_hold: bool,
    pub created_at: u64,
    pub fulfilled_at: Option<u64>,
    pub expired_at: Option<u64>,
}

impl RandomnessRequest {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: RequestId,
        requester: Address,
        game_category: impl Into<String>,
        game_variant: impl Into<String>,
        stake: Amount,
        commitment: Hash32,
        handle: ResourceHandle,
        created_at: u64,
    ) -> Self {
        Self {
            id,
            requester,
            game_category: game_category.into(),
            game_variant: game_variant.into(),
            stake,
            commitment,
            handle,
            sequence_number: None,
            state: RequestState::Created,
            submission: SubmissionStatus::NotSubmitted,
            submission_tx: None,
            fee_escrowed: None,
            random_value: None,
            fulfillment_tx: None,
            integrity_hold: false,
            created_at,
            fulfilled_at: None,
            expired_at: None,
        }
    }

    /// `random_value` is present exactly when the request is fulfilled.
    pub fn is_consistent(&self) -> bool {
        self.random_value.is_some() == (self.state == RequestState::Fulfilled)
    }
}

/// Subscription-style funding resource held by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingResource {
    pub handle: ResourceHandle,
    pub owner: Address,
    pub balance: Amount,
    pub consumers: BTreeSet<Address>,
    pub currency: FeeCurrency,
}

impl FundingResource {
    pub fn allows(&self, consumer: &Address) -> bool {
        self.consumers.contains(consumer)
    }
}

/// Kind of ledger entry. Deposits and withdrawals move funds on chain; the
/// rest are internal game movements and compensations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Deposit,
    Withdrawal,
    Stake,
    Payout,
    Refund,
    AdjustmentCredit,
    AdjustmentDebit,
}

impl EntryKind {
    pub fn is_credit(self) -> bool {
        matches!(
            self,
            EntryKind::Deposit | EntryKind::Payout | EntryKind::Refund | EntryKind::AdjustmentCredit
        )
    }

    /// Entries backed by an on-chain transfer.
    pub fn is_external(self) -> bool {
        matches!(self, EntryKind::Deposit | EntryKind::Withdrawal)
    }

    pub fn label(self) -> &'static str {
        match self {
            EntryKind::Deposit => "deposit",
            EntryKind::Withdrawal => "withdrawal",
            EntryKind::Stake => "stake",
            EntryKind::Payout => "payout",
            EntryKind::Refund => "refund",
            EntryKind::AdjustmentCredit => "adjustment_credit",
            EntryKind::AdjustmentDebit => "adjustment_debit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryStatus {
    Pending,
    Confirmed,
    Failed,
}

impl EntryStatus {
    pub fn label(self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::Confirmed => "confirmed",
            EntryStatus::Failed => "failed",
        }
    }
}

/// Custodial ledger entry. Immutable once Confirmed or Failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreasuryEntry {
    pub id: String,
    pub kind: EntryKind,
    pub account: Address,
    pub amount: Amount,
    pub status: EntryStatus,
    pub tx_ref: Option<TxRef>,
    /// Request this entry settles, for game movements and refunds.
    pub reference: Option<RequestId>,
    pub note: Option<String>,
    pub timestamp: u64,
    pub settled_at: Option<u64>,
}

impl TreasuryEntry {
    pub fn new(kind: EntryKind, account: Address, amount: Amount, status: EntryStatus) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            account,
            amount,
            status,
            tx_ref: None,
            reference: None,
            note: None,
            timestamp: now_millis(),
            settled_at: None,
        }
    }

    pub fn with_tx_ref(mut self, tx_ref: TxRef) -> Self {
        self.tx_ref = Some(tx_ref);
        self
    }

    pub fn with_reference(mut self, reference: RequestId) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Signed contribution of this entry to its account balance.
    pub fn signed_amount(&self) -> i128 {
        if self.kind.is_credit() {
            self.amount as i128
        } else {
            -(self.amount as i128)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

/// Append-only record written for integrity alerts and compensations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub severity: AuditSeverity,
    pub subject: String,
    pub detail: String,
    pub at: u64,
}

impl AuditRecord {
    pub fn new(severity: AuditSeverity, subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            severity,
            subject: subject.into(),
            detail: detail.into(),
            at: now_millis(),
        }
    }
}

/// Asynchronous fulfillment delivered by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fulfillment {
    pub sequence_number: SequenceNumber,
    #[serde(with = "hex32")]
    pub revealed_seed: Hash32,
    #[serde(with = "hex32")]
    pub provider_random: Hash32,
    pub tx_ref: Option<TxRef>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_is_forward_only() {
        use RequestState::*;
        assert!(Created.can_advance_to(AwaitingFulfillment));
        assert!(AwaitingFulfillment.can_advance_to(Fulfilled));
        assert!(AwaitingFulfillment.can_advance_to(Expired));
        assert!(!Created.can_advance_to(Fulfilled));
        assert!(!Fulfilled.can_advance_to(Expired));
        assert!(!Expired.can_advance_to(AwaitingFulfillment));
    }

    #[test]
    fn test_address_normalization_and_word() {
        let a = Address::new(" 0xABcdef0000000000000000000000000000000001 ");
        assert_eq!(a.as_str(), "0xabcdef0000000000000000000000000000000001");
        let word = a.to_word();
        assert_eq!(&word[..12], &[0u8; 12]);
        assert_eq!(Address::from_word(&word), a);
    }

    #[test]
    fn test_fee_currency_parse() {
        assert_eq!("native".parse::<FeeCurrency>().unwrap(), FeeCurrency::Native);
        assert_eq!(
            "token:LINK".parse::<FeeCurrency>().unwrap(),
            FeeCurrency::Token("LINK".to_string())
        );
        assert!("token:".parse::<FeeCurrency>().is_err());
        assert!("gold".parse::<FeeCurrency>().is_err());
    }

    #[test]
    fn test_signed_amounts() {
        let acct = Address::new("0x01");
        let deposit = TreasuryEntry::new(EntryKind::Deposit, acct.clone(), 10, EntryStatus::Confirmed);
        let stake = TreasuryEntry::new(EntryKind::Stake, acct, 4, EntryStatus::Confirmed);
        assert_eq!(deposit.signed_amount(), 10);
        assert_eq!(stake.signed_amount(), -4);
    }

    #[test]
    fn test_request_serde_keeps_hex() {
        let req = RandomnessRequest::new(
            RequestId::from_digest(&[7u8; 32]),
            Address::new("0x02"),
            "dice",
            "classic",
            5,
            [9u8; 32],
            1,
            0,
        );
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(&hex::encode([9u8; 32])));
        let back: RandomnessRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
        assert!(back.is_consistent());
    }
}
