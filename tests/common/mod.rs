//! Shared harness: an engine wired to the in-memory chain and store.

#![allow(dead_code)]

use fairwager::{
    chain::{memory::InMemoryChain, memory::TREASURY_ADDRESS, Collaborators},
    config::{ChainMode, StorageBackend, WagerConfig},
    errors::StoreError,
    factory::{Engine, EngineFactory},
    retry::RetryPolicy,
    store::{MemoryStore, SettlementStore},
    types::{
        Address, Amount, AuditRecord, Fulfillment, RandomnessRequest, RequestId, ResourceHandle, SequenceNumber,
        TreasuryEntry,
    },
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub const CONSUMER: &str = "0x00000000000000000000000000000000000000c0";
pub const OWNER: &str = "0x00000000000000000000000000000000000000a0";
pub const PLAYER: &str = "0x00000000000000000000000000000000000000d1";
pub const CALLBACK_SECRET: &str = "c0ffee00c0ffee00c0ffee00c0ffee00";

pub struct TestEngine {
    pub engine: Engine,
    pub chain: Arc<InMemoryChain>,
    pub handle: ResourceHandle,
}

pub fn config() -> WagerConfig {
    let mut config = WagerConfig::default();
    config.provider.mode = ChainMode::Simulated;
    config.provider.consumer_contract = CONSUMER.to_string();
    config.provider.subscription_owner = OWNER.to_string();
    config.provider.fee_currency = "native".to_string();
    config.provider.callback_secret = CALLBACK_SECRET.to_string();
    config.treasury.account = TREASURY_ADDRESS.to_string();
    config.treasury.auto_withdraw_refunds = false;
    config.storage.backend = StorageBackend::Memory;
    config.retry = RetryPolicy::immediate(3);
    config
}

pub fn player() -> Address {
    Address::new(PLAYER)
}

/// Engine with a funding resource holding `resource_balance` and a
/// provider charging `fee` per request.
pub async fn engine_with(config: WagerConfig, resource_balance: Amount, fee: Amount) -> TestEngine {
    engine_on(config, Arc::new(MemoryStore::new()), resource_balance, fee).await
}

/// Same as [`engine_with`] over a caller-supplied store.
pub async fn engine_on(
    config: WagerConfig,
    store: Arc<dyn SettlementStore>,
    resource_balance: Amount,
    fee: Amount,
) -> TestEngine {
    let chain = Arc::new(InMemoryChain::new());
    chain.set_fee(fee);
    let handle = chain.seed_subscription(&Address::new(OWNER), resource_balance, &[Address::new(CONSUMER)]);
    let engine = EngineFactory::build(config, Collaborators::from_single(chain.clone()), store).unwrap();
    engine.subscriptions.bootstrap(Some(handle)).await.unwrap();
    TestEngine { engine, chain, handle }
}

pub async fn engine(resource_balance: Amount, fee: Amount) -> TestEngine {
    engine_with(config(), resource_balance, fee).await
}

/// Move `amount` from `account` into the treasury and confirm it on the ledger.
pub async fn fund_player(t: &TestEngine, account: &Address, amount: Amount) {
    let tx = t.chain.external_transfer(account, amount);
    let entry = t.engine.ledger.record_deposit(account, amount, tx).unwrap();
    t.engine.ledger.confirm(&entry.id).await.unwrap();
}

/// Memory store whose request updates can be made to fail on demand.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing_request_updates: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` request updates with a write error.
    pub fn fail_request_updates(&self, n: u32) {
        self.failing_request_updates.store(n, Ordering::SeqCst);
    }
}

impl SettlementStore for FlakyStore {
    fn insert_request(&self, request: &RandomnessRequest) -> Result<(), StoreError> {
        self.inner.insert_request(request)
    }
    fn get_request(&self, id: &RequestId) -> Result<Option<RandomnessRequest>, StoreError> {
        self.inner.get_request(id)
    }
    fn update_request(&self, request: &RandomnessRequest) -> Result<(), StoreError> {
        let armed = self
            .failing_request_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(StoreError::WriteFailed("disk unavailable".to_string()));
        }
        self.inner.update_request(request)
    }
    fn request_by_sequence(&self, sequence: SequenceNumber) -> Result<Option<RequestId>, StoreError> {
        self.inner.request_by_sequence(sequence)
    }
    fn list_requests(&self) -> Result<Vec<RandomnessRequest>, StoreError> {
        self.inner.list_requests()
    }
    fn next_nonce(&self, requester: &Address) -> Result<u64, StoreError> {
        self.inner.next_nonce(requester)
    }
    fn insert_entry(&self, entry: &TreasuryEntry) -> Result<(), StoreError> {
        self.inner.insert_entry(entry)
    }
    fn get_entry(&self, id: &str) -> Result<Option<TreasuryEntry>, StoreError> {
        self.inner.get_entry(id)
    }
    fn update_entry(&self, entry: &TreasuryEntry) -> Result<(), StoreError> {
        self.inner.update_entry(entry)
    }
    fn list_entries(&self) -> Result<Vec<TreasuryEntry>, StoreError> {
        self.inner.list_entries()
    }
    fn append_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        self.inner.append_audit(record)
    }
    fn audit_records(&self) -> Result<Vec<AuditRecord>, StoreError> {
        self.inner.audit_records()
    }
    fn add_pending_credit(&self, id: &RequestId) -> Result<(), StoreError> {
        self.inner.add_pending_credit(id)
    }
    fn remove_pending_credit(&self, id: &RequestId) -> Result<(), StoreError> {
        self.inner.remove_pending_credit(id)
    }
    fn pending_credits(&self) -> Result<Vec<RequestId>, StoreError> {
        self.inner.pending_credits()
    }
    fn park_fulfillment(&self, fulfillment: &Fulfillment) -> Result<(), StoreError> {
        self.inner.park_fulfillment(fulfillment)
    }
    fn take_parked(&self, sequence: SequenceNumber) -> Result<Option<Fulfillment>, StoreError> {
        self.inner.take_parked(sequence)
    }
    fn parked_fulfillments(&self) -> Result<Vec<Fulfillment>, StoreError> {
        self.inner.parked_fulfillments()
    }
    fn fulfillment_cursor(&self) -> Result<u64, StoreError> {
        self.inner.fulfillment_cursor()
    }
    fn set_fulfillment_cursor(&self, cursor: u64) -> Result<(), StoreError> {
        self.inner.set_fulfillment_cursor(cursor)
    }
}
