//! Factory for wiring the engine from configuration
//!
//! Centralizes construction shared by the service binary, the operator tool
//! and the integration tests.

use crate::{
    chain::{memory::InMemoryChain, rpc::JsonRpcChain, rpc::RpcEndpoints, Collaborators},
    config::{ChainMode, StorageBackend, StorageConfig, WagerConfig},
    coordinator::{CoinFlip, PayoutRule, SettlementCoordinator},
    errors::{ConfigurationError, WagerResult},
    metrics::WagerMetrics,
    resolver::Resolver,
    store::{MemoryStore, RocksStore, SettlementStore},
    subscription::SubscriptionManager,
    tracker::RequestTracker,
    treasury::TreasuryLedger,
    types::Address,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Every component of a running engine.
#[derive(Clone)]
pub struct Engine {
    pub config: WagerConfig,
    pub metrics: Arc<WagerMetrics>,
    pub store: Arc<dyn SettlementStore>,
    pub chain: Collaborators,
    pub resolver: Arc<Resolver>,
    pub subscriptions: Arc<SubscriptionManager>,
    pub tracker: Arc<RequestTracker>,
    pub ledger: Arc<TreasuryLedger>,
    pub coordinator: Arc<SettlementCoordinator>,
}

pub struct EngineFactory;

impl EngineFactory {
    /// Open the configured store.
    pub fn open_store(config: &StorageConfig) -> WagerResult<Arc<dyn SettlementStore>> {
        match config.backend {
            StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
            StorageBackend::Rocksdb => {
                std::fs::create_dir_all(&config.data_dir).map_err(|e| {
                    ConfigurationError::InvalidValue {
                        field: "storage.data_dir".to_string(),
                        value: config.data_dir.clone(),
                        reason: e.to_string(),
                    }
                })?;
                info!(path = %config.data_dir, "Opening RocksDB store");
                Ok(Arc::new(RocksStore::open(&config.data_dir)?))
            }
        }
    }

    /// Collaborators for the configured chain mode. In simulated mode the
    /// in-memory chain is returned as well so the caller can drive it.
    pub fn collaborators(config: &WagerConfig) -> WagerResult<(Collaborators, Option<Arc<InMemoryChain>>)> {
        match config.provider.mode {
            ChainMode::Simulated => {
                let chain = Arc::new(InMemoryChain::with_currency(config.provider.fee_currency()?));
                let treasury = Address::new(&config.treasury.account);
                if treasury != crate::chain::TreasuryWallet::treasury_account(chain.as_ref()) {
                    warn!(%treasury, "Simulated chain uses its own treasury account");
                }
                Ok((Collaborators::from_single(chain.clone()), Some(chain)))
            }
            ChainMode::Rpc => {
                let endpoints = RpcEndpoints {
                    url: config.provider.rpc_url.clone(),
                    provider: Address::new(&config.provider.provider_address),
                    registry: Address::new(&config.provider.registry_address),
                    treasury: Address::new(&config.treasury.account),
                    timeout: config.provider.rpc_timeout(),
                };
                let chain = JsonRpcChain::new(endpoints, config.treasury.signing_key_bytes()?)?;
                Ok((Collaborators::from_single(Arc::new(chain)), None))
            }
        }
    }

    /// Build the engine with the default payout rule.
    pub fn build(config: WagerConfig, chain: Collaborators, store: Arc<dyn SettlementStore>) -> WagerResult<Engine> {
        Self::build_with_rule(config, chain, store, Arc::new(CoinFlip))
    }

    pub fn build_with_rule(
        config: WagerConfig,
        chain: Collaborators,
        store: Arc<dyn SettlementStore>,
        payout_rule: Arc<dyn PayoutRule>,
    ) -> WagerResult<Engine> {
        let metrics = Arc::new(WagerMetrics::new().map_err(|e| ConfigurationError::InvalidValue {
            field: "monitoring".to_string(),
            value: "prometheus registry".to_string(),
            reason: e.to_string(),
        })?);

        let resolver = Arc::new(Resolver::new(
            chain.registry.clone(),
            chain.provider.clone(),
            chain.reader.clone(),
            config.resolver.clone(),
            config.retry.clone(),
            metrics.clone(),
        ));
        let subscriptions = Arc::new(SubscriptionManager::new(
            chain.registry.clone(),
            chain.provider.clone(),
            resolver.clone(),
            config.provider.owner(),
            config.provider.consumer(),
            config.provider.fee_currency()?,
            config.retry.clone(),
        ));
        let tracker = Arc::new(RequestTracker::new(
            store.clone(),
            chain.provider.clone(),
            subscriptions.clone(),
            resolver.clone(),
            config.tracker.clone(),
            config.retry.clone(),
            metrics.clone(),
        ));
        let ledger = Arc::new(TreasuryLedger::new(
            store.clone(),
            chain.reader.clone(),
            chain.wallet.clone(),
            config.retry.clone(),
            metrics.clone(),
        ));
        let coordinator = Arc::new(
            SettlementCoordinator::new(
                store.clone(),
                chain.provider.clone(),
                tracker.clone(),
                ledger.clone(),
                subscriptions.clone(),
                payout_rule,
                config.retry.clone(),
                metrics.clone(),
            )
            .with_explorer(config.api.explorer_tx_url.clone())
            .with_auto_withdraw_refunds(config.treasury.auto_withdraw_refunds)
            .with_poll_batch_size(config.tracker.poll_batch_size),
        );

        Ok(Engine {
            config,
            metrics,
            store,
            chain,
            resolver,
            subscriptions,
            tracker,
            ledger,
            coordinator,
        })
    }
}
