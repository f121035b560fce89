//! Error types for the randomness and settlement engine
//!
//! Every component has its own error enum; `WagerError` nests them and
//! classifies each failure into one of the handling classes: transient,
//! rejected by policy, integrity violation, resolution failure or ledger
//! inconsistency.

use crate::types::{Amount, Address, RequestId, ResourceHandle, SequenceNumber};
use std::fmt;

/// Root error type for all engine operations
#[derive(Debug, thiserror::Error)]
pub enum WagerError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Integrity violation: {0}")]
    Integrity(#[from] CommitmentError),

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Subscription error: {0}")]
    Subscription(#[from] SubscriptionError),

    #[error("Request error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Treasury error: {0}")]
    Treasury(#[from] TreasuryError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

/// Failures reported by the randomness provider, registry or chain reader.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("call timed out after {0}ms")]
    Timeout(u64),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("nonce contention: {0}")]
    NonceContention(String),

    #[error("call reverted: {0}")]
    Reverted(String),

    #[error("caller {caller} is not the owner of resource {handle}")]
    NotOwner { handle: ResourceHandle, caller: Address },

    #[error("consumer {consumer} is not registered on resource {handle}")]
    ConsumerNotRegistered { handle: ResourceHandle, consumer: Address },

    #[error("insufficient caller balance: need {needed}, have {available}")]
    InsufficientCallerBalance { needed: Amount, available: Amount },

    #[error("insufficient resource balance on {handle}: fee {fee}, balance {balance}")]
    InsufficientResourceBalance { handle: ResourceHandle, fee: Amount, balance: Amount },

    #[error("unknown resource {0}")]
    UnknownResource(ResourceHandle),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ChainError {
    /// Network-level failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::Timeout(_) | ChainError::Transport(_) | ChainError::NonceContention(_)
        )
    }
}

/// Commitment verification failures. Always fatal for the affected request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommitmentError {
    #[error("revealed seed does not match commitment of request {request_id} (sequence {sequence})")]
    Mismatch { request_id: RequestId, sequence: SequenceNumber },
}

/// Handle or sequence number discovery failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("{subject} could not be resolved; tried: {}", .attempts.join("; "))]
    Unresolvable { subject: String, attempts: Vec<String> },

    #[error("scan limit of {limit} exceeded while resolving {subject}")]
    ScanLimitExceeded { subject: String, limit: u64 },
}

/// Funding resource lifecycle failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("funding amount must be greater than zero")]
    InvalidAmount,

    #[error("caller {caller} does not own resource {handle}")]
    NotOwner { handle: ResourceHandle, caller: Address },

    #[error("unknown resource {0}")]
    UnknownHandle(ResourceHandle),

    #[error("insufficient caller balance: need {needed}, have {available}")]
    InsufficientCallerBalance { needed: Amount, available: Amount },

    #[error("consumer {consumer} is not registered on resource {handle}")]
    ConsumerNotRegistered { handle: ResourceHandle, consumer: Address },

    #[error("insufficient resource balance on {handle}: fee {fee}, balance {balance}")]
    InsufficientResourceBalance { handle: ResourceHandle, fee: Amount, balance: Amount },

    #[error("no funding resource is configured")]
    NoActiveHandle,
}

/// Request state machine failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("request {0} not found")]
    RequestNotFound(RequestId),

    #[error("request {0} already exists")]
    AlreadyExists(RequestId),

    #[error("no request carries sequence number {0}")]
    UnknownSequence(SequenceNumber),

    #[error("request {id} is {state} and cannot {operation}")]
    InvalidState { id: RequestId, state: String, operation: &'static str },

    #[error("request {0} is held for integrity review")]
    IntegrityHold(RequestId),
}

/// Custodial ledger failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreasuryError {
    #[error("amount must be greater than zero")]
    InvalidAmount,

    #[error("insufficient treasury funds: requested {requested}, available {available}")]
    InsufficientTreasuryFunds { requested: Amount, available: Amount },

    #[error("insufficient balance for {account}: requested {requested}, available {available}")]
    InsufficientAccountBalance { account: Address, requested: Amount, available: Amount },

    #[error("ledger entry {0} not found")]
    EntryNotFound(String),

    #[error("ledger entry {id} is {status} and cannot be modified")]
    EntryImmutable { id: String, status: String },

    #[error("transaction {tx_ref} is already claimed by another account")]
    TransferClaimed { tx_ref: String },

    #[error("ledger entry {id} cannot be resolved by an operator: {reason}")]
    NotResolvable { id: String, reason: String },
}

/// Persistence failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("corrupted data: {0}")]
    CorruptedData(String),

    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    #[error("duplicate key: {0}")]
    Duplicate(String),
}

/// Configuration and validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue { field: String, value: String, reason: String },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

/// How a failure must be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with bounded backoff; surfaced only after the budget is spent.
    Transient,
    /// Not retried; returned immediately with an actionable message.
    Rejected,
    /// Commitment failure. Halts automatic processing of the request.
    Integrity,
    /// Handle or sequence number undiscoverable. Needs an operator.
    Resolution,
    /// Ledger inconsistency detected after the fact.
    Ledger,
}

impl ErrorClass {
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorClass::Integrity | ErrorClass::Resolution | ErrorClass::Ledger)
    }

    pub fn is_retryable(self) -> bool {
        self == ErrorClass::Transient
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Rejected => "rejected",
            ErrorClass::Integrity => "integrity",
            ErrorClass::Resolution => "resolution",
            ErrorClass::Ledger => "ledger",
        };
        f.write_str(label)
    }
}

pub const TRY_AGAIN_MESSAGE: &str = "Temporary problem, please try again";
pub const UNDER_REVIEW_MESSAGE: &str = "This request is under review";

impl WagerError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WagerError::Chain(e) if e.is_transient() => ErrorClass::Transient,
            WagerError::Chain(ChainError::Malformed(_)) => ErrorClass::Transient,
            WagerError::Chain(_) => ErrorClass::Rejected,
            WagerError::Integrity(_) => ErrorClass::Integrity,
            WagerError::Resolution(_) => ErrorClass::Resolution,
            WagerError::Subscription(_) => ErrorClass::Rejected,
            WagerError::Tracker(TrackerError::IntegrityHold(_)) => ErrorClass::Integrity,
            WagerError::Tracker(_) => ErrorClass::Rejected,
            WagerError::Treasury(TreasuryError::EntryImmutable { .. }) => ErrorClass::Ledger,
            WagerError::Treasury(_) => ErrorClass::Rejected,
            WagerError::Store(StoreError::ReadFailed(_) | StoreError::WriteFailed(_)) => ErrorClass::Transient,
            WagerError::Store(StoreError::Duplicate(_)) => ErrorClass::Rejected,
            WagerError::Store(_) => ErrorClass::Ledger,
            WagerError::Configuration(_) => ErrorClass::Rejected,
        }
    }

    /// Message safe to show to an end user. Fatal classes never expose
    /// internal state.
    pub fn user_message(&self) -> String {
        match self.class() {
            ErrorClass::Transient => TRY_AGAIN_MESSAGE.to_string(),
            ErrorClass::Rejected => self.policy_message(),
            _ => UNDER_REVIEW_MESSAGE.to_string(),
        }
    }

    fn policy_message(&self) -> String {
        match self {
            WagerError::Chain(e) => e.to_string(),
            WagerError::Subscription(e) => e.to_string(),
            WagerError::Tracker(e) => e.to_string(),
            WagerError::Treasury(e) => e.to_string(),
            WagerError::Store(e) => e.to_string(),
            WagerError::Configuration(e) => e.to_string(),
            other => other.to_string(),
        }
    }
}

impl From<ChainError> for SubscriptionError {
    fn from(e: ChainError) -> Self {
        match e {
            ChainError::NotOwner { handle, caller } => SubscriptionError::NotOwner { handle, caller },
            ChainError::InsufficientCallerBalance { needed, available } => {
                SubscriptionError::InsufficientCallerBalance { needed, available }
            }
            ChainError::ConsumerNotRegistered { handle, consumer } => {
                SubscriptionError::ConsumerNotRegistered { handle, consumer }
            }
            ChainError::InsufficientResourceBalance { handle, fee, balance } => {
                SubscriptionError::InsufficientResourceBalance { handle, fee, balance }
            }
            ChainError::UnknownResource(handle) => SubscriptionError::UnknownHandle(handle),
            // Only policy failures reach here through `lift_chain_error`.
            _ => SubscriptionError::NoActiveHandle,
        }
    }
}

/// Map a chain failure to the most specific engine error: policy rejections
/// from the registry become subscription errors, the rest stay chain errors.
pub fn lift_chain_error(e: ChainError) -> WagerError {
    match e {
        ChainError::NotOwner { .. }
        | ChainError::InsufficientCallerBalance { .. }
        | ChainError::ConsumerNotRegistered { .. }
        | ChainError::InsufficientResourceBalance { .. }
        | ChainError::UnknownResource(_) => WagerError::Subscription(e.into()),
        other => WagerError::Chain(other),
    }
}

// Convenience type alias for Results
pub type WagerResult<T> = Result<T, WagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err: WagerError = ConfigurationError::MissingRequired("provider.address".to_string()).into();
        assert!(err.to_string().contains("Configuration error"));
        assert!(err.to_string().contains("provider.address"));
    }

    #[test]
    fn test_classification() {
        let transient: WagerError = ChainError::Timeout(500).into();
        assert_eq!(transient.class(), ErrorClass::Transient);
        assert!(transient.class().is_retryable());

        let integrity: WagerError = CommitmentError::Mismatch {
            request_id: RequestId::from_digest(&[1u8; 32]),
            sequence: 7,
        }
        .into();
        assert_eq!(integrity.class(), ErrorClass::Integrity);
        assert!(integrity.class().is_fatal());

        let resolution: WagerError = ResolutionError::ScanLimitExceeded {
            subject: "handle".to_string(),
            limit: 10,
        }
        .into();
        assert!(resolution.class().is_fatal());

        let policy: WagerError = TreasuryError::InsufficientTreasuryFunds { requested: 10, available: 5 }.into();
        assert_eq!(policy.class(), ErrorClass::Rejected);
    }

    #[test]
    fn test_user_messages() {
        let policy: WagerError = TreasuryError::InsufficientTreasuryFunds { requested: 10, available: 5 }.into();
        assert!(policy.user_message().contains("insufficient treasury funds"));

        let transient: WagerError = ChainError::Transport("connection reset".to_string()).into();
        assert_eq!(transient.user_message(), TRY_AGAIN_MESSAGE);
        assert!(!transient.user_message().contains("connection reset"));

        let fatal: WagerError = ResolutionError::Unresolvable {
            subject: "handle for 0xabc".to_string(),
            attempts: vec!["event log: not found".to_string()],
        }
        .into();
        assert_eq!(fatal.user_message(), UNDER_REVIEW_MESSAGE);
    }

    #[test]
    fn test_lift_chain_error() {
        let lifted = lift_chain_error(ChainError::NotOwner {
            handle: 3,
            caller: Address::new("0xbeef"),
        });
        assert!(matches!(lifted, WagerError::Subscription(SubscriptionError::NotOwner { handle: 3, .. })));

        let kept = lift_chain_error(ChainError::Timeout(10));
        assert!(matches!(kept, WagerError::Chain(ChainError::Timeout(10))));
    }
}
