//! Request state machine: `Created -> AwaitingFulfillment -> {Fulfilled | Expired}`.
//!
//! Every transition of one request is serialized through a per-id async
//! mutex. Different requests never contend. A lock entry is dropped as soon
//! as no caller holds or waits on it.
//!
//! Submission is idempotent. A submission whose response was lost is never
//! blindly repeated: the provider is first probed for a record carrying the
//! request id. Only a definite "nothing there" allows another attempt; an
//! unknown answer parks the request as awaiting with no sequence number,
//! and [`RequestTracker::resolve_pending_sequences`] fills it in later.

use crate::chain::{CallOutcome, RandomnessProvider, SubmitParams};
use crate::commitment::{derive_random_value, verify};
use crate::config::TrackerConfig;
use crate::errors::{lift_chain_error, CommitmentError, StoreError, TrackerError, WagerError, WagerResult};
use crate::metrics::WagerMetrics;
use crate::resolver::Resolver;
use crate::retry::{jittered_backoff, with_timeout, RetryPolicy};
use crate::store::SettlementStore;
use crate::subscription::SubscriptionManager;
use crate::types::{
    now_millis, Amount, AuditRecord, AuditSeverity, Fulfillment, RandomnessRequest, RequestId, RequestState,
    SequenceNumber, SubmissionStatus, TxRef,
};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// What happened to a delivered fulfillment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillmentOutcome {
    /// Verified and recorded; settlement should follow.
    Fulfilled(RandomnessRequest),
    /// Delivered again after it was already recorded.
    Duplicate(RandomnessRequest),
    /// No request carries the sequence number yet. Replayed once it does.
    Parked,
}

pub struct RequestTracker {
    store: Arc<dyn SettlementStore>,
    provider: Arc<dyn RandomnessProvider>,
    subscriptions: Arc<SubscriptionManager>,
    resolver: Arc<Resolver>,
    config: TrackerConfig,
    retry: RetryPolicy,
    metrics: Arc<WagerMetrics>,
    locks: DashMap<RequestId, Arc<Mutex<()>>>,
}

impl RequestTracker {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        provider: Arc<dyn RandomnessProvider>,
        subscriptions: Arc<SubscriptionManager>,
        resolver: Arc<Resolver>,
        config: TrackerConfig,
        retry: RetryPolicy,
        metrics: Arc<WagerMetrics>,
    ) -> Self {
        Self {
            store,
            provider,
            subscriptions,
            resolver,
            config,
            retry,
            metrics,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, id: &RequestId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `op` holding `id`'s lock.
    async fn locked<T, F, Fut>(&self, id: &RequestId, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.lock_for(id);
        let result = {
            let _guard = lock.lock().await;
            op().await
        };
        drop(lock);
        self.locks.remove_if(id, |_, l| Arc::strong_count(l) == 1);
        result
    }

    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.locks.len()
    }

    fn load(&self, id: &RequestId) -> WagerResult<RandomnessRequest> {
        self.store
            .get_request(id)?
            .ok_or_else(|| TrackerError::RequestNotFound(id.clone()).into())
    }

    fn persist(&self, request: &RandomnessRequest) -> WagerResult<()> {
        self.store.update_request(request)?;
        self.metrics
            .record_request(&request.game_category, &request.game_variant, request.state.label());
        Ok(())
    }

    pub fn get(&self, id: &RequestId) -> WagerResult<RandomnessRequest> {
        self.load(id)
    }

    pub fn request_for_sequence(&self, sequence: SequenceNumber) -> WagerResult<Option<RandomnessRequest>> {
        match self.store.request_by_sequence(sequence)? {
            Some(id) => Ok(self.store.get_request(&id)?),
            None => Ok(None),
        }
    }

    /// Store a freshly created request. The commitment must already be set.
    pub fn register(&self, request: &RandomnessRequest) -> WagerResult<()> {
        if request.state != RequestState::Created {
            return Err(TrackerError::InvalidState {
                id: request.id.clone(),
                state: request.state.to_string(),
                operation: "be registered",
            }
            .into());
        }
        self.store.insert_request(request).map_err(|e| match e {
            StoreError::Duplicate(_) => TrackerError::AlreadyExists(request.id.clone()).into(),
            other => WagerError::from(other),
        })?;
        self.metrics
            .record_request(&request.game_category, &request.game_variant, request.state.label());
        debug!(request_id = %request.id, "Request registered");
        Ok(())
    }

    /// Submit `id` to the provider and escrow its fee.
    ///
    /// Calling this again for a request that is already awaiting fulfillment
    /// returns it unchanged; no second provider request is made.
    pub async fn submit(&self, id: &RequestId) -> WagerResult<RandomnessRequest> {
        self.locked(id, move || self.submit_locked(id)).await
    }

    async fn submit_locked(&self, id: &RequestId) -> WagerResult<RandomnessRequest> {
        let mut request = self.load(id)?;
        if request.integrity_hold {
            return Err(TrackerError::IntegrityHold(id.clone()).into());
        }
        match request.state {
            RequestState::Created => {}
            RequestState::AwaitingFulfillment => return Ok(request),
            state => {
                return Err(TrackerError::InvalidState {
                    id: id.clone(),
                    state: state.to_string(),
                    operation: "be submitted",
                }
                .into())
            }
        }

        let params = self.params_for(&request);

        // A previous attempt may have reached the provider.
        if request.submission == SubmissionStatus::Dispatched {
            match self.resolver.resolve_sequence(&params, request.submission_tx.as_ref()).await {
                Ok(Some(resolved)) => {
                    info!(request_id = %id, sequence = resolved.value, "Earlier submission found");
                    let (tx_ref, fee) = (request.submission_tx.clone(), request.fee_escrowed.unwrap_or(0));
                    self.mark_awaiting(&mut request, Some(resolved.value), tx_ref, fee)?;
                    return Ok(request);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(request_id = %id, error = %e, "Earlier submission unknown, awaiting resolution");
                    let (tx_ref, fee) = (request.submission_tx.clone(), request.fee_escrowed.unwrap_or(0));
                    self.mark_awaiting(&mut request, None, tx_ref, fee)?;
                    return Ok(request);
                }
            }
        }

        let fee = self.subscriptions.ensure_can_spend(request.handle).await?;
        self.dispatch(&mut request, &params, fee).await?;
        Ok(request)
    }

    fn params_for(&self, request: &RandomnessRequest) -> SubmitParams {
        SubmitParams {
            handle: request.handle,
            consumer: self.subscriptions.consumer_contract().clone(),
            request_id: request.id.clone(),
            commitment: request.commitment,
        }
    }

    /// Send the submission, probing before every repeat.
    async fn dispatch(&self, request: &mut RandomnessRequest, params: &SubmitParams, fee: Amount) -> WagerResult<()> {
        let attempts = self.retry.max_attempts.max(1);
        let mut backoff = Duration::from_millis(self.retry.initial_delay_ms);
        let max_delay = Duration::from_millis(self.retry.max_delay_ms);

        if request.state == RequestState::Created {
            request.submission = SubmissionStatus::Dispatched;
            request.fee_escrowed = Some(fee);
            self.store.update_request(request)?;
        }

        let mut attempt = 1;
        loop {
            match with_timeout(&self.retry, self.provider.submit(params)).await {
                Ok(CallOutcome::Returned { value, tx_ref }) => {
                    self.mark_awaiting(request, Some(value), Some(tx_ref), fee)?;
                    return Ok(());
                }
                Ok(CallOutcome::Unreadable { tx_ref }) => {
                    let sequence = match self.resolver.fetch_receipt(&tx_ref).await {
                        Ok(Some(receipt)) => self.resolver.sequence_from_event_log(&receipt, &request.id),
                        _ => None,
                    };
                    if sequence.is_none() {
                        info!(request_id = %request.id, %tx_ref, "Submission response unreadable, sequence pending");
                    }
                    self.mark_awaiting(request, sequence, Some(tx_ref), fee)?;
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    warn!(request_id = %request.id, attempt, error = %e, "Submission outcome unknown, probing provider");
                    match self.resolver.resolve_sequence(params, None).await {
                        Ok(Some(resolved)) => {
                            self.mark_awaiting(request, Some(resolved.value), None, fee)?;
                            return Ok(());
                        }
                        Ok(None) if attempt < attempts => {
                            let delay = {
                                let mut rng = rand::thread_rng();
                                jittered_backoff(&mut rng, backoff)
                            };
                            tokio::time::sleep(delay).await;
                            backoff = backoff.saturating_mul(2).min(max_delay);
                            attempt += 1;
                        }
                        Ok(None) => {
                            self.mark_not_submitted(request)?;
                            return Err(e.into());
                        }
                        Err(probe_error) => {
                            warn!(
                                request_id = %request.id,
                                error = %probe_error,
                                "Provider state unknown, awaiting sequence resolution"
                            );
                            self.mark_awaiting(request, None, None, fee)?;
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    self.mark_not_submitted(request)?;
                    return Err(lift_chain_error(e));
                }
            }
        }
    }

    fn mark_not_submitted(&self, request: &mut RandomnessRequest) -> WagerResult<()> {
        if request.state == RequestState::Created {
            request.submission = SubmissionStatus::NotSubmitted;
            request.fee_escrowed = None;
            self.store.update_request(request)?;
        }
        Ok(())
    }

    fn mark_awaiting(
        &self,
        request: &mut RandomnessRequest,
        sequence: Option<SequenceNumber>,
        tx_ref: Option<TxRef>,
        fee: Amount,
    ) -> WagerResult<()> {
        request.state = RequestState::AwaitingFulfillment;
        request.submission = if sequence.is_some() || tx_ref.is_some() {
            SubmissionStatus::Accepted
        } else {
            SubmissionStatus::Dispatched
        };
        if request.sequence_number.is_none() {
            request.sequence_number = sequence;
        }
        if tx_ref.is_some() {
            request.submission_tx = tx_ref;
        }
        request.fee_escrowed = Some(fee);
        self.persist(request)?;
        info!(
            request_id = %request.id,
            sequence = ?request.sequence_number,
            fee,
            "Request awaiting fulfillment"
        );
        Ok(())
    }

    /// Verify and record a fulfillment.
    ///
    /// A seed that fails its commitment leaves the request awaiting, puts it
    /// on integrity hold and returns [`CommitmentError::Mismatch`]. A
    /// verified fulfillment queues the request's payout credit in the same
    /// step that records it, so a crash before crediting is recovered by
    /// the credit retry loop.
    pub async fn on_fulfillment(&self, fulfillment: &Fulfillment) -> WagerResult<FulfillmentOutcome> {
        let sequence = fulfillment.sequence_number;
        let id = match self.store.request_by_sequence(sequence)? {
            Some(id) => id,
            None => {
                debug!(sequence, "Fulfillment for unknown sequence parked");
                self.store.park_fulfillment(fulfillment)?;
                self.metrics.record_fulfillment("parked");
                return Ok(FulfillmentOutcome::Parked);
            }
        };
        self.locked(&id, || async { self.apply_fulfillment(id.clone(), fulfillment) }).await
    }

    fn apply_fulfillment(&self, id: RequestId, fulfillment: &Fulfillment) -> WagerResult<FulfillmentOutcome> {
        let sequence = fulfillment.sequence_number;
        let mut request = self.load(&id)?;

        if request.integrity_hold {
            return Err(TrackerError::IntegrityHold(id).into());
        }
        match request.state {
            RequestState::AwaitingFulfillment => {}
            RequestState::Fulfilled => {
                self.metrics.record_fulfillment("duplicate");
                return Ok(FulfillmentOutcome::Duplicate(request));
            }
            state => {
                warn!(request_id = %id, sequence, %state, "Fulfillment rejected");
                self.metrics.record_fulfillment("rejected");
                return Err(TrackerError::InvalidState {
                    id,
                    state: state.to_string(),
                    operation: "accept a fulfillment",
                }
                .into());
            }
        }

        if !verify(&request.commitment, &fulfillment.revealed_seed) {
            request.integrity_hold = true;
            self.store.update_request(&request)?;
            self.store.append_audit(&AuditRecord::new(
                AuditSeverity::Critical,
                format!("request {}", id),
                format!(
                    "revealed seed for sequence {} does not match commitment {}",
                    sequence,
                    hex::encode(request.commitment)
                ),
            ))?;
            self.metrics.integrity_alerts_total.inc();
            self.metrics.record_fulfillment("integrity_violation");
            error!(request_id = %id, sequence, "Commitment mismatch, request held for review");
            return Err(CommitmentError::Mismatch { request_id: id, sequence }.into());
        }

        let now = now_millis();
        request.random_value = Some(derive_random_value(&fulfillment.revealed_seed, &fulfillment.provider_random));
        request.state = RequestState::Fulfilled;
        request.fulfilled_at = Some(now);
        request.fulfillment_tx = fulfillment.tx_ref.clone();
        self.store.add_pending_credit(&id)?;
        self.persist(&request)?;

        self.metrics.record_fulfillment("fulfilled");
        self.metrics
            .fulfillment_latency_seconds
            .observe(now.saturating_sub(request.created_at) as f64 / 1000.0);
        info!(request_id = %id, sequence, "Request fulfilled");
        Ok(FulfillmentOutcome::Fulfilled(request))
    }

    /// Expire every awaiting request older than the fulfillment timeout.
    /// Each request is returned at most once across all sweeps.
    pub async fn sweep_expired(&self, now: u64) -> WagerResult<Vec<RandomnessRequest>> {
        let timeout_ms = self.config.fulfillment_timeout_ms;
        let candidates: Vec<RequestId> = self
            .store
            .requests_in_state(RequestState::AwaitingFulfillment)?
            .into_iter()
            .filter(|r| !r.integrity_hold && r.created_at.saturating_add(timeout_ms) <= now)
            .map(|r| r.id)
            .collect();

        let mut expired = Vec::new();
        for id in candidates {
            if let Some(request) = self.locked(&id, || async { self.expire(&id, now) }).await? {
                expired.push(request);
            }
        }
        Ok(expired)
    }

    fn expire(&self, id: &RequestId, now: u64) -> WagerResult<Option<RandomnessRequest>> {
        let mut request = self.load(id)?;
        if request.state != RequestState::AwaitingFulfillment || request.integrity_hold {
            return Ok(None);
        }
        request.state = RequestState::Expired;
        request.expired_at = Some(now);
        self.persist(&request)?;
        self.metrics.expiries_total.inc();
        info!(request_id = %id, sequence = ?request.sequence_number, "Request expired");
        Ok(Some(request))
    }

    /// Find sequence numbers for awaiting requests whose submission
    /// response was lost. Returns the requests that gained one.
    pub async fn resolve_pending_sequences(&self) -> WagerResult<Vec<RandomnessRequest>> {
        let pending: Vec<RequestId> = self
            .store
            .requests_in_state(RequestState::AwaitingFulfillment)?
            .into_iter()
            .filter(|r| r.sequence_number.is_none() && !r.integrity_hold)
            .map(|r| r.id)
            .collect();

        let mut resolved = Vec::new();
        for id in pending {
            if let Some(request) = self.locked(&id, || self.resolve_one(&id)).await? {
                resolved.push(request);
            }
        }
        Ok(resolved)
    }

    async fn resolve_one(&self, id: &RequestId) -> WagerResult<Option<RandomnessRequest>> {
        let mut request = self.load(id)?;
        if request.state != RequestState::AwaitingFulfillment || request.sequence_number.is_some() {
            return Ok(None);
        }

        let params = self.params_for(&request);
        let fee = request.fee_escrowed.unwrap_or(0);
        match self.resolver.resolve_sequence(&params, request.submission_tx.as_ref()).await {
            Ok(Some(found)) => {
                self.mark_awaiting(&mut request, Some(found.value), None, fee)?;
                Ok(Some(request))
            }
            Ok(None) => {
                info!(request_id = %id, "Provider holds no request, submitting again");
                match self.dispatch(&mut request, &params, fee).await {
                    Ok(()) if request.sequence_number.is_some() => Ok(Some(request)),
                    Ok(()) => Ok(None),
                    Err(e) => {
                        warn!(request_id = %id, error = %e, "Resubmission failed");
                        Ok(None)
                    }
                }
            }
            Err(e) => {
                warn!(request_id = %id, error = %e, "Sequence still unresolved");
                Ok(None)
            }
        }
    }

    /// Parked fulfillments whose sequence number is now known.
    pub fn replayable_parked(&self) -> WagerResult<Vec<Fulfillment>> {
        let mut ready = Vec::new();
        for parked in self.store.parked_fulfillments()? {
            if self.store.request_by_sequence(parked.sequence_number)?.is_some() {
                if let Some(fulfillment) = self.store.take_parked(parked.sequence_number)? {
                    ready.push(fulfillment);
                }
            }
        }
        Ok(ready)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }
}
