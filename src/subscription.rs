//! Funding resource lifecycle: create, fund, consumer allow-list and the
//! consuming contract's configured handle.

use crate::chain::{CallOutcome, RandomnessProvider, ResourceRegistry};
use crate::errors::{lift_chain_error, ChainError, SubscriptionError, WagerResult};
use crate::resolver::Resolver;
use crate::retry::{retry_transient, with_timeout, RetryPolicy};
use crate::types::{Address, Amount, FeeCurrency, FundingResource, ResourceHandle, TxRef};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub struct SubscriptionManager {
    registry: Arc<dyn ResourceRegistry>,
    provider: Arc<dyn RandomnessProvider>,
    resolver: Arc<Resolver>,
    owner: Address,
    consumer_contract: Address,
    currency: FeeCurrency,
    retry: RetryPolicy,
    active: RwLock<Option<ResourceHandle>>,
}

impl SubscriptionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<dyn ResourceRegistry>,
        provider: Arc<dyn RandomnessProvider>,
        resolver: Arc<Resolver>,
        owner: Address,
        consumer_contract: Address,
        currency: FeeCurrency,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            provider,
            resolver,
            owner,
            consumer_contract,
            currency,
            retry,
            active: RwLock::new(None),
        }
    }

    pub fn owner(&self) -> &Address {
        &self.owner
    }

    pub fn consumer_contract(&self) -> &Address {
        &self.consumer_contract
    }

    pub async fn active_handle(&self) -> WagerResult<ResourceHandle> {
        self.active
            .read()
            .await
            .ok_or_else(|| SubscriptionError::NoActiveHandle.into())
    }

    /// Bring up the funding resource at start-up: adopt `configured` when
    /// given, otherwise create one. Either way the consuming contract is
    /// registered and pointed at the handle.
    pub async fn bootstrap(&self, configured: Option<ResourceHandle>) -> WagerResult<ResourceHandle> {
        let handle = match configured {
            Some(handle) => {
                let resource = self.resource(handle).await?;
                if resource.owner != self.owner {
                    return Err(SubscriptionError::NotOwner {
                        handle,
                        caller: self.owner.clone(),
                    }
                    .into());
                }
                *self.active.write().await = Some(handle);
                self.sync_consuming_contract(handle).await?;
                handle
            }
            None => self.create().await?,
        };
        let consumer = self.consumer_contract.clone();
        self.add_consumer(handle, &consumer).await?;
        Ok(handle)
    }

    /// Create a funding resource owned by the configured owner.
    ///
    /// Creation is never retried blindly: a second call would create a second
    /// resource. When the return value is unreadable the handle is recovered
    /// through the resolver.
    pub async fn create(&self) -> WagerResult<ResourceHandle> {
        let outcome = with_timeout(&self.retry, self.registry.create_subscription(&self.owner))
            .await
            .map_err(lift_chain_error)?;

        let handle = match outcome {
            CallOutcome::Returned { value, .. } => value,
            CallOutcome::Unreadable { tx_ref } => {
                info!(%tx_ref, owner = %self.owner, "Creation result unreadable, resolving handle");
                self.resolver.resolve_handle(&tx_ref, &self.owner).await?.value
            }
        };

        info!(handle, owner = %self.owner, "Funding resource created");
        *self.active.write().await = Some(handle);
        self.sync_consuming_contract(handle).await?;
        Ok(handle)
    }

    pub async fn resource(&self, handle: ResourceHandle) -> WagerResult<FundingResource> {
        retry_transient(&self.retry, "subscription", || async {
            self.registry.subscription(handle).await.into_result()
        })
        .await
        .map_err(lift_chain_error)?
        .ok_or_else(|| SubscriptionError::UnknownHandle(handle).into())
    }

    /// Add `amount` to the resource balance in the configured fee currency.
    pub async fn fund(&self, handle: ResourceHandle, amount: Amount) -> WagerResult<TxRef> {
        if amount == 0 {
            return Err(SubscriptionError::InvalidAmount.into());
        }
        let tx_ref = retry_transient(&self.retry, "fund", || {
            self.registry.fund(handle, &self.owner, amount, &self.currency)
        })
        .await
        .map_err(lift_chain_error)?;
        info!(handle, amount, currency = %self.currency, %tx_ref, "Funding resource topped up");
        Ok(tx_ref)
    }

    /// Allow `consumer` to spend against `handle`. Adding a consumer that is
    /// already present is a no-op and returns `None`.
    pub async fn add_consumer(&self, handle: ResourceHandle, consumer: &Address) -> WagerResult<Option<TxRef>> {
        let resource = self.owned_resource(handle).await?;
        if resource.allows(consumer) {
            return Ok(None);
        }

        let result = retry_transient(&self.retry, "add_consumer", || {
            self.registry.add_consumer(handle, &self.owner, consumer)
        })
        .await;
        match result {
            Ok(tx_ref) => {
                info!(handle, %consumer, %tx_ref, "Consumer registered");
                Ok(Some(tx_ref))
            }
            // An earlier attempt may have landed before its response was lost.
            Err(ChainError::Reverted(reason)) => {
                if self.resource(handle).await?.allows(consumer) {
                    warn!(handle, %consumer, %reason, "Consumer already present after retry");
                    Ok(None)
                } else {
                    Err(lift_chain_error(ChainError::Reverted(reason)))
                }
            }
            Err(e) => Err(lift_chain_error(e)),
        }
    }

    /// Revoke `consumer`. Removing an absent consumer is a no-op.
    pub async fn remove_consumer(&self, handle: ResourceHandle, consumer: &Address) -> WagerResult<Option<TxRef>> {
        let resource = self.owned_resource(handle).await?;
        if !resource.allows(consumer) {
            return Ok(None);
        }

        let result = retry_transient(&self.retry, "remove_consumer", || {
            self.registry.remove_consumer(handle, &self.owner, consumer)
        })
        .await;
        match result {
            Ok(tx_ref) => {
                info!(handle, %consumer, %tx_ref, "Consumer removed");
                Ok(Some(tx_ref))
            }
            Err(ChainError::ConsumerNotRegistered { .. }) => Ok(None),
            Err(e) => Err(lift_chain_error(e)),
        }
    }

    /// Point the consuming contract at `handle` unless it already is.
    pub async fn sync_consuming_contract(&self, handle: ResourceHandle) -> WagerResult<Option<TxRef>> {
        let current = retry_transient(&self.retry, "consumer_handle", || async {
            self.registry.consumer_handle(&self.consumer_contract).await.into_result()
        })
        .await
        .map_err(lift_chain_error)?;
        if current == Some(handle) {
            return Ok(None);
        }

        let tx_ref = retry_transient(&self.retry, "set_consumer_handle", || {
            self.registry
                .set_consumer_handle(&self.consumer_contract, &self.owner, handle)
        })
        .await
        .map_err(lift_chain_error)?;
        info!(
            handle,
            previous = ?current,
            contract = %self.consumer_contract,
            %tx_ref,
            "Consuming contract synced"
        );
        Ok(Some(tx_ref))
    }

    /// Check that the consuming contract may submit against `handle` and
    /// return the quoted fee.
    pub async fn ensure_can_spend(&self, handle: ResourceHandle) -> WagerResult<Amount> {
        let fee = retry_transient(&self.retry, "quote_fee", || self.provider.quote_fee(handle))
            .await
            .map_err(lift_chain_error)?;
        let resource = self.resource(handle).await?;
        if !resource.allows(&self.consumer_contract) {
            return Err(SubscriptionError::ConsumerNotRegistered {
                handle,
                consumer: self.consumer_contract.clone(),
            }
            .into());
        }
        if resource.balance < fee {
            return Err(SubscriptionError::InsufficientResourceBalance {
                handle,
                fee,
                balance: resource.balance,
            }
            .into());
        }
        Ok(fee)
    }

    async fn owned_resource(&self, handle: ResourceHandle) -> WagerResult<FundingResource> {
        let resource = self.resource(handle).await?;
        if resource.owner != self.owner {
            return Err(SubscriptionError::NotOwner {
                handle,
                caller: self.owner.clone(),
            }
            .into());
        }
        Ok(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::InMemoryChain;
    use crate::config::ResolverConfig;
    use crate::errors::{ErrorClass, WagerError};
    use crate::metrics::WagerMetrics;

    fn owner() -> Address {
        Address::new("0x00000000000000000000000000000000000000a1")
    }

    fn consumer() -> Address {
        Address::new("0x00000000000000000000000000000000000000c1")
    }

    fn manager(chain: &Arc<InMemoryChain>) -> SubscriptionManager {
        let resolver = Arc::new(Resolver::new(
            chain.clone(),
            chain.clone(),
            chain.clone(),
            ResolverConfig::default(),
            RetryPolicy::immediate(3),
            Arc::new(WagerMetrics::new().unwrap()),
        ));
        SubscriptionManager::new(
            chain.clone(),
            chain.clone(),
            resolver,
            owner(),
            consumer(),
            FeeCurrency::Native,
            RetryPolicy::immediate(3),
        )
    }

    #[tokio::test]
    async fn test_create_with_hidden_result_syncs_consumer_contract() {
        let chain = Arc::new(InMemoryChain::new());
        chain.hide_return_values(true);
        let m = manager(&chain);

        let handle = m.create().await.unwrap();
        assert_eq!(handle, 1);
        assert_eq!(m.active_handle().await.unwrap(), 1);
        assert_eq!(chain.consumer_handle(&consumer()).await, crate::chain::Lookup::Found(1));
        assert_eq!(m.sync_consuming_contract(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fund_validates_amount_and_balance() {
        let chain = Arc::new(InMemoryChain::new());
        let m = manager(&chain);
        let handle = m.create().await.unwrap();

        assert!(matches!(
            m.fund(handle, 0).await,
            Err(WagerError::Subscription(SubscriptionError::InvalidAmount))
        ));

        chain.set_balance(&owner(), 40);
        let err = m.fund(handle, 50).await.unwrap_err();
        assert!(matches!(
            err,
            WagerError::Subscription(SubscriptionError::InsufficientCallerBalance { needed: 50, available: 40 })
        ));
        assert_eq!(err.class(), ErrorClass::Rejected);

        chain.fail_next("fund", 2);
        m.fund(handle, 30).await.unwrap();
        assert_eq!(chain.calls("fund"), 4);
        assert_eq!(chain.subscription_snapshot(handle).unwrap().balance, 30);
    }

    #[tokio::test]
    async fn test_add_consumer_is_idempotent() {
        let chain = Arc::new(InMemoryChain::new());
        let m = manager(&chain);
        let handle = m.create().await.unwrap();

        assert!(m.add_consumer(handle, &consumer()).await.unwrap().is_some());
        assert!(m.add_consumer(handle, &consumer()).await.unwrap().is_none());
        assert_eq!(chain.calls("add_consumer"), 1);

        assert!(m.remove_consumer(handle, &consumer()).await.unwrap().is_some());
        assert!(m.remove_consumer(handle, &consumer()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_foreign_resource_is_rejected_without_retry() {
        let chain = Arc::new(InMemoryChain::new());
        let stranger = Address::new("0x00000000000000000000000000000000000000b2");
        let handle = chain.seed_subscription(&stranger, 0, &[]);
        let m = manager(&chain);

        let err = m.add_consumer(handle, &consumer()).await.unwrap_err();
        assert!(matches!(err, WagerError::Subscription(SubscriptionError::NotOwner { .. })));
        assert_eq!(chain.calls("add_consumer"), 0);

        assert!(m.bootstrap(Some(handle)).await.is_err());
    }

    #[tokio::test]
    async fn test_ensure_can_spend() {
        let chain = Arc::new(InMemoryChain::new());
        chain.set_fee(100);
        let m = manager(&chain);
        let handle = chain.seed_subscription(&owner(), 50, &[consumer()]);

        assert!(matches!(
            m.ensure_can_spend(handle).await,
            Err(WagerError::Subscription(SubscriptionError::InsufficientResourceBalance {
                fee: 100,
                balance: 50,
                ..
            }))
        ));

        let unlisted = chain.seed_subscription(&owner(), 500, &[]);
        assert!(matches!(
            m.ensure_can_spend(unlisted).await,
            Err(WagerError::Subscription(SubscriptionError::ConsumerNotRegistered { .. }))
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_creates_and_registers() {
        let chain = Arc::new(InMemoryChain::new());
        let m = manager(&chain);
        let handle = m.bootstrap(None).await.unwrap();
        assert!(chain.subscription_snapshot(handle).unwrap().allows(&consumer()));
        assert_eq!(m.bootstrap(Some(handle)).await.unwrap(), handle);
        assert_eq!(chain.calls("add_consumer"), 1);
    }
}
