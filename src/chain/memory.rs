//! In-process chain used by tests and `--simulate` mode.
//!
//! Behaves like the real collaborators closely enough to exercise every
//! recovery path: creation results can be hidden, events omitted,
//! simulation refused, receipts withheld, submissions left unmined and
//! individual operations made to fail transiently.

use super::codec::{self, DecodedCall};
use super::{
    CallOutcome, ChainReader, FulfillmentBatch, Lookup, ProviderRequestRecord, RandomnessProvider, Receipt,
    ReceiptStatus, ResourceRegistry, SimulatedCall, SubmitParams, TreasuryWallet,
};
use crate::errors::ChainError;
use crate::types::{
    Address, Amount, BlockRef, FeeCurrency, Fulfillment, FundingResource, Hash32, RequestId, ResourceHandle,
    SequenceNumber, TxRef,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

pub const PROVIDER_ADDRESS: &str = "0x00000000000000000000000000000000000000f1";
pub const REGISTRY_ADDRESS: &str = "0x00000000000000000000000000000000000000f2";
pub const TREASURY_ADDRESS: &str = "0x00000000000000000000000000000000000000f3";

#[derive(Default)]
struct Knobs {
    hide_return_values: bool,
    omit_events: bool,
    refuse_simulation: bool,
    withhold_receipts: bool,
    revert_transfers: bool,
    hold_submissions: bool,
    lose_submit_responses: u32,
    lose_transfer_responses: u32,
    fail_next: HashMap<&'static str, u32>,
}

struct State {
    block: u64,
    tx_counter: u64,
    fee: Amount,
    currency: FeeCurrency,
    balances: HashMap<Address, Amount>,
    token_balances: HashMap<Address, Amount>,
    subscriptions: BTreeMap<ResourceHandle, FundingResource>,
    next_handle: ResourceHandle,
    consumer_handles: HashMap<Address, ResourceHandle>,
    requests: BTreeMap<SequenceNumber, ProviderRequestRecord>,
    next_sequence: SequenceNumber,
    fulfillment_log: Vec<Fulfillment>,
    fulfilled: HashSet<SequenceNumber>,
    receipts: HashMap<TxRef, Receipt>,
    withheld: HashSet<TxRef>,
    creations: HashMap<(Address, u64), ResourceHandle>,
    submissions: HashMap<(RequestId, u64), SequenceNumber>,
    held_submissions: Vec<(TxRef, SubmitParams)>,
    /// Outbound treasury transfers whose receipt is withheld; funds move on release.
    unmined_transfers: Vec<(Address, Amount)>,
    transfer_refs: HashMap<String, TxRef>,
    calls: HashMap<&'static str, u32>,
    knobs: Knobs,
}

impl State {
    /// Count the call and consume one injected failure if armed.
    fn enter(&mut self, op: &'static str) -> Result<(), ChainError> {
        *self.calls.entry(op).or_insert(0) += 1;
        if let Some(remaining) = self.knobs.fail_next.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ChainError::Transport(format!("injected failure in {}", op)));
            }
        }
        Ok(())
    }

    fn next_tx_ref(&mut self) -> TxRef {
        self.tx_counter += 1;
        TxRef(format!("0x{:064x}", self.tx_counter))
    }

    fn mine(&mut self, from: Address, status: ReceiptStatus, logs: Vec<super::LogEntry>) -> TxRef {
        let tx_ref = self.next_tx_ref();
        self.record(Receipt {
            tx_ref: tx_ref.clone(),
            status,
            block: BlockRef(0),
            from,
            to: None,
            value: 0,
            logs,
        });
        tx_ref
    }

    fn mine_transfer(&mut self, from: Address, to: Address, value: Amount, status: ReceiptStatus) -> TxRef {
        let tx_ref = self.next_tx_ref();
        self.record(Receipt {
            tx_ref: tx_ref.clone(),
            status,
            block: BlockRef(0),
            from,
            to: Some(to),
            value,
            logs: Vec::new(),
        });
        tx_ref
    }

    /// Put `receipt` in the next block.
    fn record(&mut self, mut receipt: Receipt) {
        self.block += 1;
        receipt.block = BlockRef(self.block);
        if self.knobs.omit_events {
            receipt.logs.clear();
        }
        if self.knobs.withhold_receipts {
            self.withheld.insert(receipt.tx_ref.clone());
        }
        self.receipts.insert(receipt.tx_ref.clone(), receipt);
    }

    /// Escrow the fee and register the request with the provider.
    fn execute_submission(
        &mut self,
        provider: &Address,
        params: &SubmitParams,
        tx_ref: Option<TxRef>,
    ) -> Result<(SequenceNumber, TxRef), ChainError> {
        let fee = self.fee;
        let resource = self
            .subscriptions
            .get_mut(&params.handle)
            .ok_or(ChainError::UnknownResource(params.handle))?;
        if !resource.allows(&params.consumer) {
            return Err(ChainError::ConsumerNotRegistered {
                handle: params.handle,
                consumer: params.consumer.clone(),
            });
        }
        if resource.balance < fee {
            return Err(ChainError::InsufficientResourceBalance {
                handle: params.handle,
                fee,
                balance: resource.balance,
            });
        }
        resource.balance -= fee;

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.requests.insert(
            sequence,
            ProviderRequestRecord {
                sequence_number: sequence,
                request_id: params.request_id.clone(),
                commitment: params.commitment,
                handle: params.handle,
                fee,
            },
        );
        let log = codec::randomness_requested_log(provider.clone(), sequence, &params.request_id, &params.commitment);
        let tx_ref = tx_ref.unwrap_or_else(|| self.next_tx_ref());
        self.record(Receipt {
            tx_ref: tx_ref.clone(),
            status: ReceiptStatus::Success,
            block: BlockRef(0),
            from: params.consumer.clone(),
            to: None,
            value: 0,
            logs: vec![log],
        });
        let block = self.block;
        self.submissions.insert((params.request_id.clone(), block), sequence);
        Ok((sequence, tx_ref))
    }

    fn outcome<T>(&self, value: T, tx_ref: TxRef) -> CallOutcome<T> {
        if self.knobs.hide_return_values {
            CallOutcome::Unreadable { tx_ref }
        } else {
            CallOutcome::Returned { value, tx_ref }
        }
    }

    fn caller_balance(&mut self, caller: &Address, currency: &FeeCurrency) -> &mut Amount {
        match currency {
            FeeCurrency::Native => self.balances.entry(caller.clone()).or_insert(0),
            FeeCurrency::Token(_) => self.token_balances.entry(caller.clone()).or_insert(0),
        }
    }
}

pub struct InMemoryChain {
    provider: Address,
    registry: Address,
    treasury: Address,
    state: Mutex<State>,
}

impl Default for InMemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChain {
    pub fn new() -> Self {
        Self::with_currency(FeeCurrency::Native)
    }

    pub fn with_currency(currency: FeeCurrency) -> Self {
        Self {
            provider: Address::new(PROVIDER_ADDRESS),
            registry: Address::new(REGISTRY_ADDRESS),
            treasury: Address::new(TREASURY_ADDRESS),
            state: Mutex::new(State {
                block: 1,
                tx_counter: 0,
                fee: 0,
                currency,
                balances: HashMap::new(),
                token_balances: HashMap::new(),
                subscriptions: BTreeMap::new(),
                next_handle: 1,
                consumer_handles: HashMap::new(),
                requests: BTreeMap::new(),
                next_sequence: 1,
                fulfillment_log: Vec::new(),
                fulfilled: HashSet::new(),
                receipts: HashMap::new(),
                withheld: HashSet::new(),
                creations: HashMap::new(),
                submissions: HashMap::new(),
                held_submissions: Vec::new(),
                unmined_transfers: Vec::new(),
                transfer_refs: HashMap::new(),
                calls: HashMap::new(),
                knobs: Knobs::default(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_fee(&self, fee: Amount) {
        self.state().fee = fee;
    }

    pub fn set_balance(&self, account: &Address, amount: Amount) {
        self.state().balances.insert(account.clone(), amount);
    }

    pub fn set_token_balance(&self, account: &Address, amount: Amount) {
        self.state().token_balances.insert(account.clone(), amount);
    }

    pub fn balance_of(&self, account: &Address) -> Amount {
        self.state().balances.get(account).copied().unwrap_or(0)
    }

    pub fn hide_return_values(&self, hide: bool) {
        self.state().knobs.hide_return_values = hide;
    }

    pub fn omit_events(&self, omit: bool) {
        self.state().knobs.omit_events = omit;
    }

    pub fn refuse_simulation(&self, refuse: bool) {
        self.state().knobs.refuse_simulation = refuse;
    }

    pub fn revert_transfers(&self, revert: bool) {
        self.state().knobs.revert_transfers = revert;
    }

    /// Keep new receipts invisible until [`InMemoryChain::release_receipts`].
    /// Treasury transfers made meanwhile move funds only on release.
    pub fn withhold_receipts(&self, withhold: bool) {
        self.state().knobs.withhold_receipts = withhold;
    }

    pub fn release_receipts(&self) {
        let mut state = self.state();
        state.withheld.clear();
        let treasury = self.treasury.clone();
        for (to, amount) in std::mem::take(&mut state.unmined_transfers) {
            let held = state.balances.entry(treasury.clone()).or_insert(0);
            *held = held.saturating_sub(amount);
            *state.balances.entry(to).or_insert(0) += amount;
        }
    }

    /// Fail the next `times` calls of `op` with a transport error.
    pub fn fail_next(&self, op: &'static str, times: u32) {
        self.state().knobs.fail_next.insert(op, times);
    }

    /// Execute the next `times` submissions but report a transport error to
    /// the caller, as if the connection dropped after dispatch.
    pub fn lose_submit_responses(&self, times: u32) {
        self.state().knobs.lose_submit_responses = times;
    }

    /// Execute the next `times` transfers but report a transport error to
    /// the caller.
    pub fn lose_transfer_responses(&self, times: u32) {
        self.state().knobs.lose_transfer_responses = times;
    }

    /// Accept submissions without mining them: the caller gets a
    /// transaction reference, but no receipt or provider request exists
    /// until [`InMemoryChain::mine_held`].
    pub fn hold_submissions(&self, hold: bool) {
        self.state().knobs.hold_submissions = hold;
    }

    /// Mine every held submission. Returns how many landed.
    pub fn mine_held(&self) -> usize {
        let mut state = self.state();
        let held = std::mem::take(&mut state.held_submissions);
        let mut landed = 0;
        for (tx_ref, params) in held {
            match state.execute_submission(&self.provider, &params, Some(tx_ref.clone())) {
                Ok(_) => landed += 1,
                Err(_) => state.record(Receipt {
                    tx_ref,
                    status: ReceiptStatus::Reverted,
                    block: BlockRef(0),
                    from: params.consumer.clone(),
                    to: None,
                    value: 0,
                    logs: Vec::new(),
                }),
            }
        }
        landed
    }

    pub fn calls(&self, op: &str) -> u32 {
        self.state().calls.get(op).copied().unwrap_or(0)
    }

    /// Number of requests the provider holds.
    pub fn provider_request_count(&self) -> usize {
        self.state().requests.len()
    }

    pub fn provider_requests_for(&self, request_id: &RequestId) -> Vec<ProviderRequestRecord> {
        self.state()
            .requests
            .values()
            .filter(|r| &r.request_id == request_id)
            .cloned()
            .collect()
    }

    pub fn subscription_snapshot(&self, handle: ResourceHandle) -> Option<FundingResource> {
        self.state().subscriptions.get(&handle).cloned()
    }

    /// Insert a subscription directly, bypassing the creation call.
    pub fn seed_subscription(&self, owner: &Address, balance: Amount, consumers: &[Address]) -> ResourceHandle {
        let mut state = self.state();
        let handle = state.next_handle;
        state.next_handle += 1;
        let currency = state.currency.clone();
        state.subscriptions.insert(
            handle,
            FundingResource {
                handle,
                owner: owner.clone(),
                balance,
                consumers: consumers.iter().cloned().collect::<BTreeSet<_>>(),
                currency,
            },
        );
        handle
    }

    /// An inbound transfer to the treasury, as a user deposit would be.
    pub fn external_transfer(&self, from: &Address, amount: Amount) -> TxRef {
        let mut state = self.state();
        let treasury = self.treasury.clone();
        *state.balances.entry(treasury.clone()).or_insert(0) += amount;
        state.mine_transfer(from.clone(), treasury, amount, ReceiptStatus::Success)
    }

    /// Overwrite the status of an existing receipt.
    pub fn rewrite_receipt_status(&self, tx_ref: &TxRef, status: ReceiptStatus) {
        if let Some(receipt) = self.state().receipts.get_mut(tx_ref) {
            receipt.status = status;
        }
    }

    /// Requests the provider has not fulfilled yet, oldest first.
    pub fn unfulfilled(&self) -> Vec<ProviderRequestRecord> {
        let state = self.state();
        state
            .requests
            .values()
            .filter(|r| !state.fulfilled.contains(&r.sequence_number))
            .cloned()
            .collect()
    }

    /// Emit a fulfillment event for `sequence`.
    pub fn fulfill(&self, sequence: SequenceNumber, revealed_seed: Hash32, provider_random: Hash32) -> Fulfillment {
        let mut state = self.state();
        let provider = self.provider.clone();
        let tx_ref = state.mine(provider, ReceiptStatus::Success, Vec::new());
        let fulfillment = Fulfillment {
            sequence_number: sequence,
            revealed_seed,
            provider_random,
            tx_ref: Some(tx_ref),
        };
        state.fulfilled.insert(sequence);
        state.fulfillment_log.push(fulfillment.clone());
        fulfillment
    }
}

#[async_trait]
impl RandomnessProvider for InMemoryChain {
    async fn quote_fee(&self, handle: ResourceHandle) -> Result<Amount, ChainError> {
        let mut state = self.state();
        state.enter("quote_fee")?;
        if !state.subscriptions.contains_key(&handle) {
            return Err(ChainError::UnknownResource(handle));
        }
        Ok(state.fee)
    }

    async fn submit(&self, params: &SubmitParams) -> Result<CallOutcome<SequenceNumber>, ChainError> {
        let mut state = self.state();
        state.enter("submit")?;
        if state.knobs.hold_submissions {
            let tx_ref = state.next_tx_ref();
            state.held_submissions.push((tx_ref.clone(), params.clone()));
            return Ok(CallOutcome::Unreadable { tx_ref });
        }
        let (sequence, tx_ref) = state.execute_submission(&self.provider, params, None)?;

        if state.knobs.lose_submit_responses > 0 {
            state.knobs.lose_submit_responses -= 1;
            return Err(ChainError::Transport("connection reset after dispatch".to_string()));
        }
        Ok(state.outcome(sequence, tx_ref))
    }

    async fn request_record(&self, sequence: SequenceNumber) -> Lookup<ProviderRequestRecord> {
        let mut state = self.state();
        if let Err(e) = state.enter("request_record") {
            return Lookup::Failed(e);
        }
        Lookup::from_option(state.requests.get(&sequence).cloned())
    }

    async fn latest_sequence(&self) -> Result<SequenceNumber, ChainError> {
        let mut state = self.state();
        state.enter("latest_sequence")?;
        Ok(state.next_sequence - 1)
    }

    async fn poll_fulfillments(&self, cursor: u64, limit: usize) -> Result<FulfillmentBatch, ChainError> {
        let mut state = self.state();
        state.enter("poll_fulfillments")?;
        let start = (cursor as usize).min(state.fulfillment_log.len());
        let items: Vec<Fulfillment> = state.fulfillment_log[start..].iter().take(limit).cloned().collect();
        let next_cursor = cursor + items.len() as u64;
        Ok(FulfillmentBatch { items, next_cursor })
    }

    fn provider_address(&self) -> Address {
        self.provider.clone()
    }
}

#[async_trait]
impl ResourceRegistry for InMemoryChain {
    async fn create_subscription(&self, owner: &Address) -> Result<CallOutcome<ResourceHandle>, ChainError> {
        let mut state = self.state();
        state.enter("create_subscription")?;
        let handle = state.next_handle;
        state.next_handle += 1;
        let currency = state.currency.clone();
        state.subscriptions.insert(
            handle,
            FundingResource {
                handle,
                owner: owner.clone(),
                balance: 0,
                consumers: BTreeSet::new(),
                currency,
            },
        );
        let log = codec::subscription_created_log(self.registry.clone(), handle, owner);
        let tx_ref = state.mine(owner.clone(), ReceiptStatus::Success, vec![log]);
        let block = state.block;
        state.creations.insert((owner.clone(), block), handle);
        Ok(state.outcome(handle, tx_ref))
    }

    async fn subscription(&self, handle: ResourceHandle) -> Lookup<FundingResource> {
        let mut state = self.state();
        if let Err(e) = state.enter("subscription") {
            return Lookup::Failed(e);
        }
        Lookup::from_option(state.subscriptions.get(&handle).cloned())
    }

    async fn fund(
        &self,
        handle: ResourceHandle,
        caller: &Address,
        amount: Amount,
        currency: &FeeCurrency,
    ) -> Result<TxRef, ChainError> {
        let mut state = self.state();
        state.enter("fund")?;
        if !state.subscriptions.contains_key(&handle) {
            return Err(ChainError::UnknownResource(handle));
        }
        if currency != &state.currency {
            return Err(ChainError::Reverted(format!(
                "resource {} is funded in {}, not {}",
                handle, state.currency, currency
            )));
        }
        let available = state.caller_balance(caller, currency);
        if *available < amount {
            return Err(ChainError::InsufficientCallerBalance {
                needed: amount,
                available: *available,
            });
        }
        *available -= amount;
        if let Some(resource) = state.subscriptions.get_mut(&handle) {
            resource.balance += amount;
        }
        Ok(state.mine(caller.clone(), ReceiptStatus::Success, Vec::new()))
    }

    async fn add_consumer(&self, handle: ResourceHandle, caller: &Address, consumer: &Address) -> Result<TxRef, ChainError> {
        let mut state = self.state();
        state.enter("add_consumer")?;
        let resource = state
            .subscriptions
            .get_mut(&handle)
            .ok_or(ChainError::UnknownResource(handle))?;
        if &resource.owner != caller {
            return Err(ChainError::NotOwner {
                handle,
                caller: caller.clone(),
            });
        }
        if !resource.consumers.insert(consumer.clone()) {
            return Err(ChainError::Reverted(format!("consumer {} already added", consumer)));
        }
        Ok(state.mine(caller.clone(), ReceiptStatus::Success, Vec::new()))
    }

    async fn remove_consumer(
        &self,
        handle: ResourceHandle,
        caller: &Address,
        consumer: &Address,
    ) -> Result<TxRef, ChainError> {
        let mut state = self.state();
        state.enter("remove_consumer")?;
        let resource = state
            .subscriptions
            .get_mut(&handle)
            .ok_or(ChainError::UnknownResource(handle))?;
        if &resource.owner != caller {
            return Err(ChainError::NotOwner {
                handle,
                caller: caller.clone(),
            });
        }
        if !resource.consumers.remove(consumer) {
            return Err(ChainError::ConsumerNotRegistered {
                handle,
                consumer: consumer.clone(),
            });
        }
        Ok(state.mine(caller.clone(), ReceiptStatus::Success, Vec::new()))
    }

    async fn set_consumer_handle(
        &self,
        consumer_contract: &Address,
        caller: &Address,
        handle: ResourceHandle,
    ) -> Result<TxRef, ChainError> {
        let mut state = self.state();
        state.enter("set_consumer_handle")?;
        if !state.subscriptions.contains_key(&handle) {
            return Err(ChainError::UnknownResource(handle));
        }
        state.consumer_handles.insert(consumer_contract.clone(), handle);
        Ok(state.mine(caller.clone(), ReceiptStatus::Success, Vec::new()))
    }

    async fn consumer_handle(&self, consumer_contract: &Address) -> Lookup<ResourceHandle> {
        let mut state = self.state();
        if let Err(e) = state.enter("consumer_handle") {
            return Lookup::Failed(e);
        }
        Lookup::from_option(state.consumer_handles.get(consumer_contract).copied())
    }

    fn registry_address(&self) -> Address {
        self.registry.clone()
    }
}

#[async_trait]
impl ChainReader for InMemoryChain {
    async fn get_balance(&self, account: &Address) -> Result<Amount, ChainError> {
        let mut state = self.state();
        state.enter("get_balance")?;
        Ok(state.balances.get(account).copied().unwrap_or(0))
    }

    async fn get_transaction_receipt(&self, tx_ref: &TxRef) -> Lookup<Receipt> {
        let mut state = self.state();
        if let Err(e) = state.enter("get_transaction_receipt") {
            return Lookup::Failed(e);
        }
        if state.withheld.contains(tx_ref) {
            return Lookup::NotFound;
        }
        Lookup::from_option(state.receipts.get(tx_ref).cloned())
    }

    async fn simulate_call(&self, call: &SimulatedCall, block: BlockRef) -> Lookup<Vec<u8>> {
        let mut state = self.state();
        if let Err(e) = state.enter("simulate_call") {
            return Lookup::Failed(e);
        }
        if state.knobs.refuse_simulation {
            return Lookup::Failed(ChainError::Unsupported("call simulation".to_string()));
        }
        match codec::decode_call(&call.data) {
            Some(DecodedCall::CreateSubscription { owner }) if call.target == self.registry => {
                Lookup::from_option(state.creations.get(&(owner, block.0)).map(|h| codec::u64_word(*h).to_vec()))
            }
            Some(DecodedCall::RequestRandomness(params)) if call.target == self.provider => Lookup::from_option(
                state
                    .submissions
                    .get(&(params.request_id, block.0))
                    .map(|s| codec::u64_word(*s).to_vec()),
            ),
            _ => Lookup::Failed(ChainError::Reverted("unrecognized call".to_string())),
        }
    }
}

#[async_trait]
impl TreasuryWallet for InMemoryChain {
    fn treasury_account(&self) -> Address {
        self.treasury.clone()
    }

    async fn transfer(&self, to: &Address, amount: Amount, reference: &str) -> Result<TxRef, ChainError> {
        let mut state = self.state();
        state.enter("transfer")?;
        if let Some(existing) = state.transfer_refs.get(reference) {
            return Ok(existing.clone());
        }
        let treasury = self.treasury.clone();
        let unmined: Amount = state.unmined_transfers.iter().map(|(_, a)| *a).sum();
        let held = state.balances.get(&treasury).copied().unwrap_or(0).saturating_sub(unmined);
        let tx_ref = if state.knobs.revert_transfers || held < amount {
            state.mine_transfer(treasury, to.clone(), amount, ReceiptStatus::Reverted)
        } else {
            if state.knobs.withhold_receipts {
                state.unmined_transfers.push((to.clone(), amount));
            } else {
                *state.balances.entry(treasury.clone()).or_insert(0) -= amount;
                *state.balances.entry(to.clone()).or_insert(0) += amount;
            }
            state.mine_transfer(treasury, to.clone(), amount, ReceiptStatus::Success)
        };
        state.transfer_refs.insert(reference.to_string(), tx_ref.clone());

        if state.knobs.lose_transfer_responses > 0 {
            state.knobs.lose_transfer_responses -= 1;
            return Err(ChainError::Transport("connection reset after dispatch".to_string()));
        }
        Ok(tx_ref)
    }

    async fn transfer_by_reference(&self, reference: &str) -> Lookup<TxRef> {
        let mut state = self.state();
        if let Err(e) = state.enter("transfer_by_reference") {
            return Lookup::Failed(e);
        }
        Lookup::from_option(state.transfer_refs.get(reference).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::commit;

    fn consumer() -> Address {
        Address::new("0x00000000000000000000000000000000000000c1")
    }

    fn owner() -> Address {
        Address::new("0x00000000000000000000000000000000000000a1")
    }

    fn params(handle: ResourceHandle) -> SubmitParams {
        SubmitParams {
            handle,
            consumer: consumer(),
            request_id: RequestId::from_digest(&[1u8; 32]),
            commitment: commit(b"seed"),
        }
    }

    #[tokio::test]
    async fn test_submit_escrows_fee() {
        let chain = InMemoryChain::new();
        chain.set_fee(100);
        let handle = chain.seed_subscription(&owner(), 150, &[consumer()]);

        let outcome = chain.submit(&params(handle)).await.unwrap();
        assert!(matches!(outcome, CallOutcome::Returned { value: 1, .. }));
        assert_eq!(chain.subscription_snapshot(handle).unwrap().balance, 50);

        let err = chain.submit(&params(handle)).await.unwrap_err();
        assert!(matches!(err, ChainError::InsufficientResourceBalance { fee: 100, balance: 50, .. }));
    }

    #[tokio::test]
    async fn test_hidden_creation_is_recoverable_by_simulation() {
        let chain = InMemoryChain::new();
        chain.hide_return_values(true);
        let outcome = chain.create_subscription(&owner()).await.unwrap();
        let tx_ref = match outcome {
            CallOutcome::Unreadable { tx_ref } => tx_ref,
            other => panic!("expected unreadable outcome, got {:?}", other),
        };
        let receipt = chain.get_transaction_receipt(&tx_ref).await.found().unwrap();
        let call = SimulatedCall {
            from: owner(),
            target: chain.registry_address(),
            data: codec::encode_create_subscription(&owner()),
        };
        let output = chain.simulate_call(&call, receipt.block).await.found().unwrap();
        assert_eq!(codec::word_u64(&output), Some(1));
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let chain = InMemoryChain::new();
        chain.fail_next("get_balance", 1);
        assert!(chain.get_balance(&owner()).await.is_err());
        assert_eq!(chain.get_balance(&owner()).await.unwrap(), 0);
        assert_eq!(chain.calls("get_balance"), 2);
    }

    #[tokio::test]
    async fn test_transfer_beyond_balance_reverts() {
        let chain = InMemoryChain::new();
        chain.set_balance(&chain.treasury_account(), 5);
        let tx = chain.transfer(&owner(), 10, "w-1").await.unwrap();
        let receipt = chain.get_transaction_receipt(&tx).await.found().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Reverted);
        assert_eq!(chain.balance_of(&chain.treasury_account()), 5);
    }

    #[tokio::test]
    async fn test_transfer_reference_is_idempotent() {
        let chain = InMemoryChain::new();
        chain.set_balance(&chain.treasury_account(), 50);
        chain.lose_transfer_responses(1);
        assert!(chain.transfer(&owner(), 10, "w-2").await.is_err());

        let landed = chain.transfer_by_reference("w-2").await.found().unwrap();
        assert_eq!(chain.transfer(&owner(), 10, "w-2").await.unwrap(), landed);
        assert_eq!(chain.balance_of(&owner()), 10);

        let receipt = chain.get_transaction_receipt(&landed).await.found().unwrap();
        assert_eq!(receipt.to, Some(owner()));
        assert_eq!(receipt.value, 10);
        assert_eq!(receipt.from, chain.treasury_account());
        assert!(chain.transfer_by_reference("w-3").await.found().is_none());
    }

    #[tokio::test]
    async fn test_held_submission_has_no_receipt_until_mined() {
        let chain = InMemoryChain::new();
        chain.set_fee(10);
        let handle = chain.seed_subscription(&owner(), 100, &[consumer()]);
        chain.hold_submissions(true);

        let tx_ref = match chain.submit(&params(handle)).await.unwrap() {
            CallOutcome::Unreadable { tx_ref } => tx_ref,
            other => panic!("expected unreadable outcome, got {:?}", other),
        };
        assert!(chain.get_transaction_receipt(&tx_ref).await.found().is_none());
        assert_eq!(chain.provider_request_count(), 0);

        assert_eq!(chain.mine_held(), 1);
        let receipt = chain.get_transaction_receipt(&tx_ref).await.found().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Success);
        assert_eq!(chain.provider_request_count(), 1);
        assert_eq!(chain.subscription_snapshot(handle).unwrap().balance, 90);
    }
}
