//! Discovery of provider-assigned identifiers whose creating call did not
//! return them.
//!
//! Two subjects share the same three strategies, tried in order:
//!
//! 1. **event log** - decode the well-known event from the transaction
//!    receipt. No extra round-trips.
//! 2. **simulation** - re-execute the call read-only, pinned to the block
//!    the transaction landed in, and read its return value.
//! 3. **bounded scan** - probe candidate ids one by one and stop at the
//!    first match. Never more than the configured limit.
//!
//! Funding-resource handles are matched on owner; request sequence numbers
//! are matched on request id. When every strategy fails the caller gets a
//! [`ResolutionError`]; a guessed or zero value is never returned.

use crate::chain::codec;
use crate::chain::{ChainReader, Lookup, RandomnessProvider, Receipt, ReceiptStatus, ResourceRegistry, SimulatedCall, SubmitParams};
use crate::config::ResolverConfig;
use crate::errors::{ChainError, ResolutionError, WagerResult};
use crate::metrics::WagerMetrics;
use crate::retry::{retry_transient, RetryPolicy};
use crate::types::{Address, BlockRef, RequestId, ResourceHandle, SequenceNumber, TxRef};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    ReturnValue,
    EventLog,
    Simulation,
    Scan,
}

impl Strategy {
    pub fn label(self) -> &'static str {
        match self {
            Strategy::ReturnValue => "return_value",
            Strategy::EventLog => "event_log",
            Strategy::Simulation => "simulation",
            Strategy::Scan => "scan",
        }
    }
}

/// A discovered value and the strategy that found it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved<T> {
    pub value: T,
    pub strategy: Strategy,
}

/// Result of a bounded scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome<T> {
    Found(T),
    /// The whole search space was covered without a match.
    Exhausted,
    /// The limit was reached before the search space was covered.
    LimitReached { probed: u64 },
}

pub struct Resolver {
    registry: Arc<dyn ResourceRegistry>,
    provider: Arc<dyn RandomnessProvider>,
    reader: Arc<dyn ChainReader>,
    config: ResolverConfig,
    retry: RetryPolicy,
    metrics: Arc<WagerMetrics>,
}

impl Resolver {
    pub fn new(
        registry: Arc<dyn ResourceRegistry>,
        provider: Arc<dyn RandomnessProvider>,
        reader: Arc<dyn ChainReader>,
        config: ResolverConfig,
        retry: RetryPolicy,
        metrics: Arc<WagerMetrics>,
    ) -> Self {
        Self {
            registry,
            provider,
            reader,
            config,
            retry,
            metrics,
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Fetch a receipt, retrying transient read failures.
    pub async fn fetch_receipt(&self, tx_ref: &TxRef) -> Result<Option<Receipt>, ChainError> {
        retry_transient(&self.retry, "get_transaction_receipt", || async {
            self.reader.get_transaction_receipt(tx_ref).await.into_result()
        })
        .await
    }

    // ----- funding resource handles -----

    /// Handle announced by a `SubscriptionCreated` event for `owner`.
    pub fn resolve_from_event_log(&self, receipt: &Receipt, owner: &Address) -> Option<ResourceHandle> {
        let registry = self.registry.registry_address();
        receipt
            .logs
            .iter()
            .filter(|log| log.emitter == registry)
            .filter_map(codec::decode_subscription_created)
            .find(|(_, log_owner)| log_owner == owner)
            .map(|(handle, _)| handle)
    }

    /// Re-run the creation call as `creator` at `block` and decode its output.
    pub async fn resolve_from_simulation(&self, creator: &Address, block: BlockRef) -> Lookup<ResourceHandle> {
        let call = SimulatedCall {
            from: creator.clone(),
            target: self.registry.registry_address(),
            data: codec::encode_create_subscription(creator),
        };
        self.simulate_word(&call, block).await
    }

    /// Probe handles from `start`, at most `limit` of them, for one owned by
    /// `owner`. A handle the registry does not know ends the search space.
    pub async fn resolve_by_scan(&self, owner: &Address, start: ResourceHandle, limit: u64) -> WagerResult<ScanOutcome<ResourceHandle>> {
        let limit = limit.min(self.config.scan_limit);
        for offset in 0..limit {
            let handle = start.saturating_add(offset);
            let record = retry_transient(&self.retry, "subscription", || async {
                self.registry.subscription(handle).await.into_result()
            })
            .await?;
            match record {
                Some(resource) if &resource.owner == owner => return Ok(ScanOutcome::Found(handle)),
                Some(_) => continue,
                None => return Ok(ScanOutcome::Exhausted),
            }
        }
        Ok(ScanOutcome::LimitReached { probed: limit })
    }

    /// Full event-log, simulation, scan chain for a creation transaction.
    pub async fn resolve_handle(&self, tx_ref: &TxRef, owner: &Address) -> WagerResult<Resolved<ResourceHandle>> {
        let subject = format!("funding resource created by {} in {}", owner, tx_ref);
        let mut attempts = Vec::new();

        let receipt = match self.fetch_receipt(tx_ref).await {
            Ok(Some(receipt)) => Some(receipt),
            Ok(None) => {
                attempts.push("receipt: not found".to_string());
                None
            }
            Err(e) => {
                attempts.push(format!("receipt: {}", e));
                None
            }
        };

        if let Some(ref receipt) = receipt {
            match self.resolve_from_event_log(receipt, owner) {
                Some(handle) => return Ok(self.found("handle", handle, Strategy::EventLog)),
                None => attempts.push("event log: no matching event".to_string()),
            }

            match self.resolve_from_simulation(owner, receipt.block).await {
                Lookup::Found(handle) => return Ok(self.found("handle", handle, Strategy::Simulation)),
                Lookup::NotFound => attempts.push("simulation: no result".to_string()),
                Lookup::Failed(e) => attempts.push(format!("simulation: {}", e)),
            }
        } else {
            attempts.push("simulation: skipped without a receipt block".to_string());
        }

        debug!(%owner, scan_limit = self.config.scan_limit, "Falling back to handle scan");
        match self.resolve_by_scan(owner, self.config.scan_start, self.config.scan_limit).await {
            Ok(ScanOutcome::Found(handle)) => Ok(self.found("handle", handle, Strategy::Scan)),
            Ok(ScanOutcome::Exhausted) => {
                attempts.push("scan: no handle owned by the caller".to_string());
                Err(self.unresolvable("handle", subject, attempts))
            }
            Ok(ScanOutcome::LimitReached { probed }) => {
                self.metrics.record_resolution("handle", "failed");
                error!(%subject, probed, "Handle scan limit exceeded");
                Err(ResolutionError::ScanLimitExceeded {
                    subject,
                    limit: self.config.scan_limit,
                }
                .into())
            }
            Err(e) => {
                attempts.push(format!("scan: {}", e));
                Err(self.unresolvable("handle", subject, attempts))
            }
        }
    }

    // ----- request sequence numbers -----

    /// Sequence number announced for `request_id` in a submission receipt.
    pub fn sequence_from_event_log(&self, receipt: &Receipt, request_id: &RequestId) -> Option<SequenceNumber> {
        let provider = self.provider.provider_address();
        receipt
            .logs
            .iter()
            .filter(|log| log.emitter == provider)
            .filter_map(codec::decode_randomness_requested)
            .find(|(_, id, _)| id == request_id)
            .map(|(sequence, _, _)| sequence)
    }

    pub async fn sequence_from_simulation(&self, params: &SubmitParams, block: BlockRef) -> Lookup<SequenceNumber> {
        let call = SimulatedCall {
            from: params.consumer.clone(),
            target: self.provider.provider_address(),
            data: codec::encode_request_randomness(params),
        };
        self.simulate_word(&call, block).await
    }

    /// Walk back from the newest sequence number through the configured
    /// window looking for `request_id`.
    pub async fn sequence_by_scan(&self, request_id: &RequestId) -> WagerResult<ScanOutcome<SequenceNumber>> {
        let latest = retry_transient(&self.retry, "latest_sequence", || self.provider.latest_sequence()).await?;
        let window = self.config.sequence_scan_window;
        let oldest = latest.saturating_sub(window.saturating_sub(1)).max(1);

        let mut sequence = latest;
        while sequence >= oldest && sequence > 0 {
            let record = retry_transient(&self.retry, "request_record", || async {
                self.provider.request_record(sequence).await.into_result()
            })
            .await?;
            if matches!(record, Some(ref r) if &r.request_id == request_id) {
                return Ok(ScanOutcome::Found(sequence));
            }
            sequence -= 1;
        }

        if oldest > 1 {
            Ok(ScanOutcome::LimitReached { probed: window })
        } else {
            Ok(ScanOutcome::Exhausted)
        }
    }

    /// Find the sequence number the provider assigned to a submission.
    ///
    /// `Ok(None)` means the provider definitely holds no request for this
    /// id, so submitting again cannot create a duplicate: either the
    /// submission receipt reverted, or there was no submission transaction
    /// and the scan covered every sequence number. A known transaction whose
    /// receipt is missing may still be mined, so that case is an error.
    pub async fn resolve_sequence(
        &self,
        params: &SubmitParams,
        tx_ref: Option<&TxRef>,
    ) -> WagerResult<Option<Resolved<SequenceNumber>>> {
        let subject = format!("sequence number of request {}", params.request_id);
        let mut attempts = Vec::new();

        if let Some(tx_ref) = tx_ref {
            match self.fetch_receipt(tx_ref).await {
                Ok(Some(receipt)) if receipt.status == ReceiptStatus::Reverted => {
                    info!(request_id = %params.request_id, %tx_ref, "Submission reverted, provider holds no request");
                    return Ok(None);
                }
                Ok(Some(receipt)) => {
                    if let Some(sequence) = self.sequence_from_event_log(&receipt, &params.request_id) {
                        return Ok(Some(self.found("sequence", sequence, Strategy::EventLog)));
                    }
                    attempts.push("event log: no matching event".to_string());

                    match self.sequence_from_simulation(params, receipt.block).await {
                        Lookup::Found(sequence) => {
                            return Ok(Some(self.found("sequence", sequence, Strategy::Simulation)))
                        }
                        Lookup::NotFound => attempts.push("simulation: no result".to_string()),
                        Lookup::Failed(e) => attempts.push(format!("simulation: {}", e)),
                    }
                }
                Ok(None) => attempts.push("receipt: not found".to_string()),
                Err(e) => attempts.push(format!("receipt: {}", e)),
            }
        }

        match self.sequence_by_scan(&params.request_id).await {
            Ok(ScanOutcome::Found(sequence)) => Ok(Some(self.found("sequence", sequence, Strategy::Scan))),
            Ok(ScanOutcome::Exhausted) if tx_ref.is_none() => Ok(None),
            Ok(ScanOutcome::Exhausted) => {
                attempts.push("scan: no record carries the request id".to_string());
                Err(self.unresolvable("sequence", subject, attempts))
            }
            Ok(ScanOutcome::LimitReached { probed }) => {
                self.metrics.record_resolution("sequence", "failed");
                warn!(%subject, probed, "Sequence scan window exhausted");
                Err(ResolutionError::ScanLimitExceeded {
                    subject,
                    limit: self.config.sequence_scan_window,
                }
                .into())
            }
            Err(e) => {
                attempts.push(format!("scan: {}", e));
                Err(self.unresolvable("sequence", subject, attempts))
            }
        }
    }

    async fn simulate_word(&self, call: &SimulatedCall, block: BlockRef) -> Lookup<u64> {
        let output = retry_transient(&self.retry, "simulate_call", || async {
            self.reader.simulate_call(call, block).await.into_result()
        })
        .await;
        match output {
            Ok(Some(bytes)) => match codec::word_u64(&bytes) {
                Some(value) => Lookup::Found(value),
                None => Lookup::Failed(ChainError::Malformed(format!(
                    "simulation returned {} bytes, expected one word",
                    bytes.len()
                ))),
            },
            Ok(None) => Lookup::NotFound,
            Err(e) => Lookup::Failed(e),
        }
    }

    fn found<T: Copy + std::fmt::Display>(&self, subject: &str, value: T, strategy: Strategy) -> Resolved<T> {
        self.metrics.record_resolution(subject, strategy.label());
        info!(subject, %value, strategy = strategy.label(), "Resolved");
        Resolved { value, strategy }
    }

    fn unresolvable(&self, kind: &str, subject: String, attempts: Vec<String>) -> crate::errors::WagerError {
        self.metrics.record_resolution(kind, "failed");
        error!(%subject, attempts = ?attempts, "Resolution failed, operator action required");
        ResolutionError::Unresolvable { subject, attempts }.into()
    }
}
