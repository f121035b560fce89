//! Game settlement orchestration.
//!
//! Owns no state of its own beyond cross-references: requests live in the
//! tracker's store, balances in the treasury ledger.
//!
//! A game escrows its stake before the randomness request leaves the
//! process. A verified fulfillment credits the payout; an expired or
//! rejected request credits the stake back. A payout credit is queued when
//! the fulfillment is recorded and stays queued until it is written.

use crate::chain::RandomnessProvider;
use crate::commitment::{derive_request_id, SeedCommitment};
use crate::errors::{TrackerError, TreasuryError, WagerError, WagerResult};
use crate::metrics::WagerMetrics;
use crate::retry::{retry_transient, RetryPolicy};
use crate::store::SettlementStore;
use crate::subscription::SubscriptionManager;
use crate::tracker::{FulfillmentOutcome, RequestTracker};
use crate::treasury::TreasuryLedger;
use crate::types::{
    now_millis, Address, Amount, EntryKind, Fulfillment, Hash32, RandomnessRequest, RequestId, RequestState,
    SequenceNumber,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Maps a verified random value to a payout.
pub trait PayoutRule: Send + Sync {
    fn payout(&self, random_value: &Hash32, stake: Amount, variant: &str) -> Amount;
}

/// Even-money coin flip on the low bit of the random value.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoinFlip;

impl PayoutRule for CoinFlip {
    fn payout(&self, random_value: &Hash32, stake: Amount, _variant: &str) -> Amount {
        if random_value[31] & 1 == 0 {
            stake.saturating_mul(2)
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameRequest {
    pub account: Address,
    pub category: String,
    pub variant: String,
    pub stake: Amount,
}

/// Returned to the front end when a game starts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameTicket {
    pub request_id: RequestId,
    #[serde(with = "crate::types::hex32")]
    pub commitment: Hash32,
    /// Revealed to the player only; the provider sees the commitment.
    #[serde(with = "crate::types::hex32")]
    pub seed: Hash32,
    pub sequence_number: Option<SequenceNumber>,
    pub state: RequestState,
}

/// What the front end receives on fulfillment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrontEndResult {
    pub request_id: RequestId,
    pub sequence_number: SequenceNumber,
    #[serde(with = "crate::types::hex32")]
    pub random_value: Hash32,
    pub tx_ref: Option<String>,
    pub explorer_link: Option<String>,
    pub stake: Amount,
    pub payout: Amount,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryStats {
    pub category: String,
    pub variant: String,
    pub requests: u64,
    pub awaiting: u64,
    pub fulfilled: u64,
    pub expired: u64,
    pub total_staked: Amount,
}

pub struct SettlementCoordinator {
    store: Arc<dyn SettlementStore>,
    provider: Arc<dyn RandomnessProvider>,
    tracker: Arc<RequestTracker>,
    ledger: Arc<TreasuryLedger>,
    subscriptions: Arc<SubscriptionManager>,
    payout_rule: Arc<dyn PayoutRule>,
    retry: RetryPolicy,
    metrics: Arc<WagerMetrics>,
    explorer_tx_url: String,
    auto_withdraw_refunds: bool,
    poll_batch_size: usize,
}

impl SettlementCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SettlementStore>,
        provider: Arc<dyn RandomnessProvider>,
        tracker: Arc<RequestTracker>,
        ledger: Arc<TreasuryLedger>,
        subscriptions: Arc<SubscriptionManager>,
        payout_rule: Arc<dyn PayoutRule>,
        retry: RetryPolicy,
        metrics: Arc<WagerMetrics>,
    ) -> Self {
        Self {
            store,
            provider,
            tracker,
            ledger,
            subscriptions,
            payout_rule,
            retry,
            metrics,
            explorer_tx_url: String::new(),
            auto_withdraw_refunds: true,
            poll_batch_size: 100,
        }
    }

    pub fn with_explorer(mut self, explorer_tx_url: impl Into<String>) -> Self {
        self.explorer_tx_url = explorer_tx_url.into();
        self
    }

    pub fn with_auto_withdraw_refunds(mut self, enabled: bool) -> Self {
        self.auto_withdraw_refunds = enabled;
        self
    }

    pub fn with_poll_batch_size(mut self, size: usize) -> Self {
        self.poll_batch_size = size.max(1);
        self
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    pub fn ledger(&self) -> &TreasuryLedger {
        &self.ledger
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn metrics(&self) -> &WagerMetrics {
        &self.metrics
    }

    /// Commit to a fresh seed, escrow the stake and request randomness.
    pub async fn start_game(&self, game: GameRequest) -> WagerResult<GameTicket> {
        if game.stake == 0 {
            return Err(TreasuryError::InvalidAmount.into());
        }
        let handle = self.subscriptions.active_handle().await?;

        let seed = SeedCommitment::generate();
        let now = now_millis();
        let nonce = self.store.next_nonce(&game.account)?;
        let id = derive_request_id(&game.account, nonce, now);
        let request = RandomnessRequest::new(
            id.clone(),
            game.account.clone(),
            game.category,
            game.variant,
            game.stake,
            seed.commitment,
            handle,
            now,
        );
        self.tracker.register(&request)?;
        self.ledger.record_stake(&game.account, game.stake, &id).await?;

        let submitted = match self.tracker.submit(&id).await {
            Ok(submitted) => submitted,
            Err(e) => {
                // Only a request that never left `Created` is refunded here;
                // an awaiting one is refunded by expiry.
                if self.tracker.get(&id)?.state == RequestState::Created {
                    self.ledger.record_refund(&game.account, game.stake, &id)?;
                    self.metrics.refunds_total.inc();
                    warn!(request_id = %id, error = %e, "Submission rejected, stake refunded");
                }
                return Err(e);
            }
        };

        info!(
            request_id = %id,
            account = %game.account,
            stake = game.stake,
            sequence = ?submitted.sequence_number,
            "Game started"
        );
        if submitted.sequence_number.is_some() {
            self.replay_parked().await;
        }

        Ok(GameTicket {
            request_id: id,
            commitment: seed.commitment,
            seed: seed.seed,
            sequence_number: submitted.sequence_number,
            state: submitted.state,
        })
    }

    /// Verify a fulfillment and settle the game it belongs to.
    ///
    /// Returns `None` when the fulfillment was parked for a sequence number
    /// that is not known yet.
    pub async fn handle_fulfillment(&self, fulfillment: &Fulfillment) -> WagerResult<Option<FrontEndResult>> {
        match self.tracker.on_fulfillment(fulfillment).await? {
            FulfillmentOutcome::Parked => Ok(None),
            // The first delivery may have stopped short of crediting.
            FulfillmentOutcome::Duplicate(request) | FulfillmentOutcome::Fulfilled(request) => {
                self.credit_payout(&request).await?;
                Ok(Some(self.result_for(&request)?))
            }
        }
    }

    /// Credit the payout of a fulfilled request, retrying before leaving it
    /// queued. Crediting twice writes one entry.
    async fn credit_payout(&self, request: &RandomnessRequest) -> WagerResult<()> {
        let payout = self.payout_for(request)?;
        if payout == 0 {
            debug!(request_id = %request.id, "No payout");
            self.store.remove_pending_credit(&request.id)?;
            return Ok(());
        }
        let credited = retry_transient(&self.retry, "record_payout", || async {
            self.ledger.record_payout(&request.requester, payout, &request.id)
        })
        .await;
        match credited {
            Ok(_) => {
                self.store.remove_pending_credit(&request.id)?;
                info!(request_id = %request.id, account = %request.requester, payout, "Payout credited");
                Ok(())
            }
            Err(e) => {
                self.store.add_pending_credit(&request.id)?;
                self.metrics.settlement_retries_total.inc();
                error!(request_id = %request.id, error = %e, "Payout credit deferred to retry queue");
                Ok(())
            }
        }
    }

    fn payout_for(&self, request: &RandomnessRequest) -> WagerResult<Amount> {
        let random_value = request.random_value.ok_or_else(|| TrackerError::InvalidState {
            id: request.id.clone(),
            state: request.state.to_string(),
            operation: "be settled",
        })?;
        Ok(self
            .payout_rule
            .payout(&random_value, request.stake, &request.game_variant))
    }

    /// Refund the stake of an expired request and, when configured, pay it
    /// straight out of the treasury.
    pub async fn handle_expired(&self, request: &RandomnessRequest) -> WagerResult<()> {
        if request.state != RequestState::Expired {
            return Err(TrackerError::InvalidState {
                id: request.id.clone(),
                state: request.state.to_string(),
                operation: "be refunded",
            }
            .into());
        }
        if self.store.entry_for_reference(&request.id, EntryKind::Refund)?.is_some() {
            return Ok(());
        }
        self.ledger
            .record_refund(&request.requester, request.stake, &request.id)?;
        self.metrics.refunds_total.inc();
        info!(request_id = %request.id, account = %request.requester, stake = request.stake, "Stake refunded");

        if self.auto_withdraw_refunds {
            if let Err(e) = self.ledger.withdraw(&request.requester, request.stake).await {
                warn!(request_id = %request.id, error = %e, "Refund stays on the ledger, withdrawal failed");
            }
        }
        Ok(())
    }

    /// Expire overdue requests, then refund every expired request that has
    /// no refund yet, including ones expired by an earlier pass whose refund
    /// never landed. Returns how many expired in this pass.
    pub async fn sweep(&self, now: u64) -> WagerResult<usize> {
        let expired = self.tracker.sweep_expired(now).await?.len();
        for request in self.store.requests_in_state(RequestState::Expired)? {
            if self.store.entry_for_reference(&request.id, EntryKind::Refund)?.is_some() {
                continue;
            }
            if let Err(e) = self.handle_expired(&request).await {
                error!(request_id = %request.id, error = %e, "Refund failed");
            }
        }
        Ok(expired)
    }

    /// Credit queued payouts. A request that is queued but not fulfilled
    /// stays queued until its fulfillment is recorded; an expired one is
    /// dropped from the queue.
    pub async fn retry_pending_credits(&self) -> WagerResult<usize> {
        let mut credited = 0;
        for id in self.store.pending_credits()? {
            let request = self.tracker.get(&id)?;
            match request.state {
                RequestState::Fulfilled => {}
                RequestState::Expired => {
                    self.store.remove_pending_credit(&id)?;
                    continue;
                }
                _ => continue,
            }
            let payout = self.payout_for(&request)?;
            let written = if payout == 0 {
                Ok(())
            } else {
                self.ledger.record_payout(&request.requester, payout, &id).map(|_| ())
            };
            match written {
                Ok(()) => {
                    self.store.remove_pending_credit(&id)?;
                    credited += 1;
                    info!(request_id = %id, payout, "Deferred payout credited");
                }
                Err(e) => warn!(request_id = %id, error = %e, "Deferred payout still failing"),
            }
        }
        Ok(credited)
    }

    /// Pull new fulfillments from the provider and settle them.
    pub async fn poll_fulfillments(&self) -> WagerResult<usize> {
        let cursor = self.store.fulfillment_cursor()?;
        let batch = retry_transient(&self.retry, "poll_fulfillments", || {
            self.provider.poll_fulfillments(cursor, self.poll_batch_size)
        })
        .await?;

        let count = batch.items.len();
        for fulfillment in &batch.items {
            if let Err(e) = self.handle_fulfillment(fulfillment).await {
                self.report_unapplied(fulfillment, &e)?;
            }
        }
        self.store.set_fulfillment_cursor(batch.next_cursor)?;
        Ok(count)
    }

    /// Log a fulfillment that could not be applied. One that failed
    /// transiently is parked and replayed with the other parked items.
    fn report_unapplied(&self, fulfillment: &Fulfillment, e: &WagerError) -> WagerResult<()> {
        let sequence = fulfillment.sequence_number;
        if e.class().is_fatal() {
            error!(sequence, error = %e, "Fulfillment needs review");
        } else if e.class().is_retryable() {
            self.store.park_fulfillment(fulfillment)?;
            warn!(sequence, error = %e, "Fulfillment parked for retry");
        } else {
            warn!(sequence, error = %e, "Fulfillment not applied");
        }
        Ok(())
    }

    /// Resolve lost sequence numbers, then settle anything parked for them.
    pub async fn resolve_pending(&self) -> WagerResult<usize> {
        let resolved = self.tracker.resolve_pending_sequences().await?;
        self.replay_parked().await;
        Ok(resolved.len())
    }

    async fn replay_parked(&self) {
        let ready = match self.tracker.replayable_parked() {
            Ok(ready) => ready,
            Err(e) => {
                warn!(error = %e, "Could not read parked fulfillments");
                return;
            }
        };
        for fulfillment in ready {
            debug!(sequence = fulfillment.sequence_number, "Replaying parked fulfillment");
            if let Err(e) = self.handle_fulfillment(&fulfillment).await {
                if let Err(park_error) = self.report_unapplied(&fulfillment, &e) {
                    error!(sequence = fulfillment.sequence_number, error = %park_error, "Could not park fulfillment");
                }
            }
        }
    }

    pub fn request(&self, id: &RequestId) -> WagerResult<RandomnessRequest> {
        self.tracker.get(id)
    }

    /// Front-end view of a fulfilled request.
    pub fn result_for(&self, request: &RandomnessRequest) -> WagerResult<FrontEndResult> {
        let invalid = || -> WagerError {
            TrackerError::InvalidState {
                id: request.id.clone(),
                state: request.state.to_string(),
                operation: "report a result",
            }
            .into()
        };
        let random_value = request.random_value.ok_or_else(invalid)?;
        let sequence_number = request.sequence_number.ok_or_else(invalid)?;
        let tx_ref = request.fulfillment_tx.as_ref().map(|t| t.0.clone());
        let explorer_link = match (&tx_ref, self.explorer_tx_url.is_empty()) {
            (Some(tx), false) => Some(format!("{}{}", self.explorer_tx_url, tx)),
            _ => None,
        };
        Ok(FrontEndResult {
            request_id: request.id.clone(),
            sequence_number,
            random_value,
            tx_ref,
            explorer_link,
            stake: request.stake,
            payout: self.payout_rule.payout(&random_value, request.stake, &request.game_variant),
        })
    }

    /// Request counts and volume per game category and variant.
    pub fn category_stats(&self) -> WagerResult<Vec<CategoryStats>> {
        let mut stats: BTreeMap<(String, String), CategoryStats> = BTreeMap::new();
        for request in self.store.list_requests()? {
            let key = (request.game_category.clone(), request.game_variant.clone());
            let entry = stats.entry(key).or_insert_with(|| CategoryStats {
                category: request.game_category.clone(),
                variant: request.game_variant.clone(),
                ..CategoryStats::default()
            });
            entry.requests += 1;
            entry.total_staked = entry.total_staked.saturating_add(request.stake);
            match request.state {
                RequestState::AwaitingFulfillment => entry.awaiting += 1,
                RequestState::Fulfilled => entry.fulfilled += 1,
                RequestState::Expired => entry.expired += 1,
                RequestState::Created => {}
            }
        }
        Ok(stats.into_values().collect())
    }
}
