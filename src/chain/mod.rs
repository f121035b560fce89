//! Interfaces to the external collaborators: randomness provider, resource
//! registry, chain state reader and the treasury wallet.
//!
//! Loosely-typed call results are modelled as tagged variants: a lookup is
//! `Found`, `NotFound` or `Failed`, and a state-changing call either returns
//! its value or only a transaction reference whose output must be
//! discovered afterwards.

pub mod codec;
pub mod memory;
pub mod rpc;

use crate::errors::ChainError;
use crate::types::{
    Address, Amount, BlockRef, FeeCurrency, Fulfillment, FundingResource, Hash32, RequestId, ResourceHandle,
    SequenceNumber, TxRef,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result of a read that may legitimately find nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
    Failed(ChainError),
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            _ => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::NotFound => Lookup::NotFound,
            Lookup::Failed(e) => Lookup::Failed(e),
        }
    }

    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Lookup::Found(v),
            None => Lookup::NotFound,
        }
    }

    /// Treat `NotFound` as `None` and surface failures as errors.
    pub fn into_result(self) -> Result<Option<T>, ChainError> {
        match self {
            Lookup::Found(value) => Ok(Some(value)),
            Lookup::NotFound => Ok(None),
            Lookup::Failed(e) => Err(e),
        }
    }
}

/// Outcome of a state-changing call whose return value may be unreadable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<T> {
    /// The call's return value was decoded directly.
    Returned { value: T, tx_ref: TxRef },
    /// The transaction landed but its output could not be read.
    Unreadable { tx_ref: TxRef },
}

impl<T> CallOutcome<T> {
    pub fn tx_ref(&self) -> &TxRef {
        match self {
            CallOutcome::Returned { tx_ref, .. } | CallOutcome::Unreadable { tx_ref } => tx_ref,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

/// One emitted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub emitter: Address,
    pub topics: Vec<Hash32>,
    #[serde(with = "hex_vec")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_ref: TxRef,
    pub status: ReceiptStatus,
    pub block: BlockRef,
    /// Account that sent the transaction.
    pub from: Address,
    /// Recipient of the value moved, for plain transfers.
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub value: Amount,
    pub logs: Vec<LogEntry>,
}

/// A read-only call to re-execute at a pinned block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedCall {
    pub from: Address,
    pub target: Address,
    #[serde(with = "hex_vec")]
    pub data: Vec<u8>,
}

/// Parameters of a randomness submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitParams {
    pub handle: ResourceHandle,
    pub consumer: Address,
    pub request_id: RequestId,
    #[serde(with = "crate::types::hex32")]
    pub commitment: Hash32,
}

/// The provider's own record of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRequestRecord {
    pub sequence_number: SequenceNumber,
    pub request_id: RequestId,
    #[serde(with = "crate::types::hex32")]
    pub commitment: Hash32,
    pub handle: ResourceHandle,
    pub fee: Amount,
}

/// A page of fulfillments read from the provider's event stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentBatch {
    pub items: Vec<Fulfillment>,
    pub next_cursor: u64,
}

#[async_trait]
pub trait RandomnessProvider: Send + Sync {
    /// Current fee for one request against `handle`.
    async fn quote_fee(&self, handle: ResourceHandle) -> Result<Amount, ChainError>;

    /// Submit a request. The provider escrows the fee from the resource.
    async fn submit(&self, params: &SubmitParams) -> Result<CallOutcome<SequenceNumber>, ChainError>;

    /// The provider's record for a sequence number.
    async fn request_record(&self, sequence: SequenceNumber) -> Lookup<ProviderRequestRecord>;

    /// Highest sequence number assigned so far (0 if none).
    async fn latest_sequence(&self) -> Result<SequenceNumber, ChainError>;

    /// Fulfillments emitted after `cursor`, at most `limit` of them.
    async fn poll_fulfillments(&self, cursor: u64, limit: usize) -> Result<FulfillmentBatch, ChainError>;

    /// Address of the provider contract, used as the simulation target.
    fn provider_address(&self) -> Address;
}

#[async_trait]
pub trait ResourceRegistry: Send + Sync {
    async fn create_subscription(&self, owner: &Address) -> Result<CallOutcome<ResourceHandle>, ChainError>;

    async fn subscription(&self, handle: ResourceHandle) -> Lookup<FundingResource>;

    async fn fund(
        &self,
        handle: ResourceHandle,
        caller: &Address,
        amount: Amount,
        currency: &FeeCurrency,
    ) -> Result<TxRef, ChainError>;

    async fn add_consumer(&self, handle: ResourceHandle, caller: &Address, consumer: &Address) -> Result<TxRef, ChainError>;

    async fn remove_consumer(
        &self,
        handle: ResourceHandle,
        caller: &Address,
        consumer: &Address,
    ) -> Result<TxRef, ChainError>;

    /// Point the consuming contract at `handle`.
    async fn set_consumer_handle(
        &self,
        consumer_contract: &Address,
        caller: &Address,
        handle: ResourceHandle,
    ) -> Result<TxRef, ChainError>;

    /// Handle the consuming contract currently spends against.
    async fn consumer_handle(&self, consumer_contract: &Address) -> Lookup<ResourceHandle>;

    /// Address of the registry contract, used as the simulation target.
    fn registry_address(&self) -> Address;
}

#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn get_balance(&self, account: &Address) -> Result<Amount, ChainError>;

    async fn get_transaction_receipt(&self, tx_ref: &TxRef) -> Lookup<Receipt>;

    /// Re-execute `call` read-only against the state at `block`.
    async fn simulate_call(&self, call: &SimulatedCall, block: BlockRef) -> Lookup<Vec<u8>>;
}

#[async_trait]
pub trait TreasuryWallet: Send + Sync {
    fn treasury_account(&self) -> Address;

    /// Dispatch an outbound transfer. Settlement is only known from the
    /// receipt.
    ///
    /// `reference` is an idempotency key: a second transfer with the same
    /// reference returns the first transaction and moves nothing.
    async fn transfer(&self, to: &Address, amount: Amount, reference: &str) -> Result<TxRef, ChainError>;

    /// Transaction dispatched under `reference`, if any.
    async fn transfer_by_reference(&self, reference: &str) -> Lookup<TxRef>;
}

/// The full set of collaborators the engine is wired against.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn RandomnessProvider>,
    pub registry: Arc<dyn ResourceRegistry>,
    pub reader: Arc<dyn ChainReader>,
    pub wallet: Arc<dyn TreasuryWallet>,
}

impl Collaborators {
    /// Wire every role to one object implementing all four traits.
    pub fn from_single<C>(chain: Arc<C>) -> Self
    where
        C: RandomnessProvider + ResourceRegistry + ChainReader + TreasuryWallet + 'static,
    {
        Self {
            provider: chain.clone(),
            registry: chain.clone(),
            reader: chain.clone(),
            wallet: chain,
        }
    }
}

mod hex_vec {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(D::Error::custom)
    }
}
