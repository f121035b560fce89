//! JSON-RPC 2.0 adapter for a live provider and chain endpoint.
//!
//! Every collaborator call maps to one method on the endpoint. Reverts carry
//! a typed `data.reason` so policy failures keep their meaning across the
//! wire. Outbound treasury transfers are authorized with an HMAC-SHA256 tag
//! over the transfer fields.

use super::codec;
use super::{
    CallOutcome, ChainReader, FulfillmentBatch, Lookup, ProviderRequestRecord, RandomnessProvider, Receipt,
    ResourceRegistry, SimulatedCall, SubmitParams, TreasuryWallet,
};
use crate::errors::ChainError;
use crate::types::{Address, Amount, BlockRef, FeeCurrency, FundingResource, ResourceHandle, SequenceNumber, TxRef};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const CODE_NOT_FOUND: i64 = -32001;
const CODE_UNSUPPORTED: i64 = -32004;
const CODE_NONCE_CONTENTION: i64 = -32010;
const CODE_INTERNAL: i64 = -32603;
const CODE_REVERTED: i64 = 3;

#[derive(Serialize)]
struct JsonRpcRequest<'a, T: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: T,
}

#[derive(Deserialize, Debug)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Structured revert reasons.
#[derive(Deserialize, Debug)]
#[serde(tag = "reason")]
enum RevertData {
    NotOwner { handle: ResourceHandle, caller: Address },
    ConsumerNotRegistered { handle: ResourceHandle, consumer: Address },
    InsufficientBalance { needed: Amount, available: Amount },
    InsufficientResourceBalance { handle: ResourceHandle, fee: Amount, balance: Amount },
    UnknownResource { handle: ResourceHandle },
}

impl From<RevertData> for ChainError {
    fn from(data: RevertData) -> Self {
        match data {
            RevertData::NotOwner { handle, caller } => ChainError::NotOwner { handle, caller },
            RevertData::ConsumerNotRegistered { handle, consumer } => {
                ChainError::ConsumerNotRegistered { handle, consumer }
            }
            RevertData::InsufficientBalance { needed, available } => {
                ChainError::InsufficientCallerBalance { needed, available }
            }
            RevertData::InsufficientResourceBalance { handle, fee, balance } => {
                ChainError::InsufficientResourceBalance { handle, fee, balance }
            }
            RevertData::UnknownResource { handle } => ChainError::UnknownResource(handle),
        }
    }
}

fn map_rpc_error(err: JsonRpcError) -> ChainError {
    match err.code {
        CODE_UNSUPPORTED => ChainError::Unsupported(err.message),
        CODE_NONCE_CONTENTION => ChainError::NonceContention(err.message),
        CODE_INTERNAL => ChainError::Transport(err.message),
        CODE_REVERTED => err
            .data
            .and_then(|d| serde_json::from_value::<RevertData>(d).ok())
            .map(ChainError::from)
            .unwrap_or(ChainError::Reverted(err.message)),
        code => ChainError::Reverted(format!("rpc error {}: {}", code, err.message)),
    }
}

/// Result of a state-changing call on the endpoint.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TxResult {
    tx_ref: TxRef,
    #[serde(default)]
    return_data: Option<String>,
}

impl TxResult {
    fn into_outcome(self) -> CallOutcome<u64> {
        let value = self
            .return_data
            .as_deref()
            .and_then(|hex_data| hex::decode(hex_data.strip_prefix("0x").unwrap_or(hex_data)).ok())
            .and_then(|bytes| codec::word_u64(&bytes));
        match value {
            Some(value) => CallOutcome::Returned {
                value,
                tx_ref: self.tx_ref,
            },
            None => CallOutcome::Unreadable { tx_ref: self.tx_ref },
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcEndpoints {
    pub url: String,
    pub provider: Address,
    pub registry: Address,
    pub treasury: Address,
    pub timeout: Duration,
}

/// Client for the provider, registry and chain methods of one endpoint.
pub struct JsonRpcChain {
    endpoints: RpcEndpoints,
    signing_key: Vec<u8>,
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcChain {
    pub fn new(endpoints: RpcEndpoints, signing_key: Vec<u8>) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(endpoints.timeout)
            .build()
            .map_err(|e| ChainError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            endpoints,
            signing_key,
            http,
            next_id: AtomicU64::new(1),
        })
    }

    /// Call `method`; a `null` result or not-found error yields `None`.
    async fn call<P, R>(&self, method: &str, params: P) -> Result<Option<R>, ChainError>
    where
        P: Serialize + Send,
        R: DeserializeOwned + Send,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        debug!(method, id, "rpc call");

        let response = self
            .http
            .post(&self.endpoints.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let body: JsonRpcResponse<R> = response
            .json()
            .await
            .map_err(|e| ChainError::Malformed(format!("{}: {}", method, e)))?;

        match body.error {
            Some(err) if err.code == CODE_NOT_FOUND => Ok(None),
            Some(err) => Err(map_rpc_error(err)),
            None => Ok(body.result),
        }
    }

    async fn call_required<P, R>(&self, method: &str, params: P) -> Result<R, ChainError>
    where
        P: Serialize + Send,
        R: DeserializeOwned + Send,
    {
        self.call(method, params)
            .await?
            .ok_or_else(|| ChainError::Malformed(format!("{} returned no result", method)))
    }

    async fn lookup<P, R>(&self, method: &str, params: P) -> Lookup<R>
    where
        P: Serialize + Send,
        R: DeserializeOwned + Send,
    {
        match self.call(method, params).await {
            Ok(value) => Lookup::from_option(value),
            Err(e) => Lookup::Failed(e),
        }
    }

    fn transport_error(&self, e: reqwest::Error) -> ChainError {
        if e.is_timeout() {
            ChainError::Timeout(self.endpoints.timeout.as_millis() as u64)
        } else {
            ChainError::Transport(e.to_string())
        }
    }

    fn authorize_transfer(&self, to: &Address, amount: Amount, reference: &str) -> Result<String, ChainError> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|e| ChainError::Unsupported(format!("signing key rejected: {}", e)))?;
        mac.update(self.endpoints.treasury.as_str().as_bytes());
        mac.update(to.as_str().as_bytes());
        mac.update(&amount.to_be_bytes());
        mac.update(reference.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl RandomnessProvider for JsonRpcChain {
    async fn quote_fee(&self, handle: ResourceHandle) -> Result<Amount, ChainError> {
        self.call_required("vrf_quoteFee", serde_json::json!({ "handle": handle })).await
    }

    async fn submit(&self, params: &SubmitParams) -> Result<CallOutcome<SequenceNumber>, ChainError> {
        let result: TxResult = self
            .call_required(
                "vrf_requestRandomness",
                serde_json::json!({
                    "provider": self.endpoints.provider,
                    "data": format!("0x{}", hex::encode(codec::encode_request_randomness(params))),
                }),
            )
            .await?;
        Ok(result.into_outcome())
    }

    async fn request_record(&self, sequence: SequenceNumber) -> Lookup<ProviderRequestRecord> {
        self.lookup("vrf_getRequest", serde_json::json!({ "sequence": sequence })).await
    }

    async fn latest_sequence(&self) -> Result<SequenceNumber, ChainError> {
        self.call_required("vrf_latestSequence", serde_json::json!({})).await
    }

    async fn poll_fulfillments(&self, cursor: u64, limit: usize) -> Result<FulfillmentBatch, ChainError> {
        let batch: Option<FulfillmentBatch> = self
            .call("vrf_getFulfillments", serde_json::json!({ "cursor": cursor, "limit": limit }))
            .await?;
        Ok(batch.unwrap_or(FulfillmentBatch {
            items: Vec::new(),
            next_cursor: cursor,
        }))
    }

    fn provider_address(&self) -> Address {
        self.endpoints.provider.clone()
    }
}

#[async_trait]
impl ResourceRegistry for JsonRpcChain {
    async fn create_subscription(&self, owner: &Address) -> Result<CallOutcome<ResourceHandle>, ChainError> {
        let result: TxResult = self
            .call_required(
                "registry_createSubscription",
                serde_json::json!({
                    "registry": self.endpoints.registry,
                    "from": owner,
                    "data": format!("0x{}", hex::encode(codec::encode_create_subscription(owner))),
                }),
            )
            .await?;
        Ok(result.into_outcome())
    }

    async fn subscription(&self, handle: ResourceHandle) -> Lookup<FundingResource> {
        self.lookup("registry_getSubscription", serde_json::json!({ "handle": handle }))
            .await
    }

    async fn fund(
        &self,
        handle: ResourceHandle,
        caller: &Address,
        amount: Amount,
        currency: &FeeCurrency,
    ) -> Result<TxRef, ChainError> {
        let result: TxResult = self
            .call_required(
                "registry_fund",
                serde_json::json!({
                    "handle": handle,
                    "from": caller,
                    "amount": amount,
                    "currency": currency.to_string(),
                }),
            )
            .await?;
        Ok(result.tx_ref)
    }

    async fn add_consumer(&self, handle: ResourceHandle, caller: &Address, consumer: &Address) -> Result<TxRef, ChainError> {
        let result: TxResult = self
            .call_required(
                "registry_addConsumer",
                serde_json::json!({ "handle": handle, "from": caller, "consumer": consumer }),
            )
            .await?;
        Ok(result.tx_ref)
    }

    async fn remove_consumer(
        &self,
        handle: ResourceHandle,
        caller: &Address,
        consumer: &Address,
    ) -> Result<TxRef, ChainError> {
        let result: TxResult = self
            .call_required(
                "registry_removeConsumer",
                serde_json::json!({ "handle": handle, "from": caller, "consumer": consumer }),
            )
            .await?;
        Ok(result.tx_ref)
    }

    async fn set_consumer_handle(
        &self,
        consumer_contract: &Address,
        caller: &Address,
        handle: ResourceHandle,
    ) -> Result<TxRef, ChainError> {
        let result: TxResult = self
            .call_required(
                "consumer_setSubscription",
                serde_json::json!({ "contract": consumer_contract, "from": caller, "handle": handle }),
            )
            .await?;
        Ok(result.tx_ref)
    }

    async fn consumer_handle(&self, consumer_contract: &Address) -> Lookup<ResourceHandle> {
        self.lookup("consumer_getSubscription", serde_json::json!({ "contract": consumer_contract }))
            .await
    }

    fn registry_address(&self) -> Address {
        self.endpoints.registry.clone()
    }
}

#[async_trait]
impl ChainReader for JsonRpcChain {
    async fn get_balance(&self, account: &Address) -> Result<Amount, ChainError> {
        self.call_required("chain_getBalance", serde_json::json!({ "account": account }))
            .await
    }

    async fn get_transaction_receipt(&self, tx_ref: &TxRef) -> Lookup<Receipt> {
        self.lookup("chain_getTransactionReceipt", serde_json::json!({ "txRef": tx_ref }))
            .await
    }

    async fn simulate_call(&self, call: &SimulatedCall, block: BlockRef) -> Lookup<Vec<u8>> {
        let result: Lookup<String> = self
            .lookup(
                "chain_call",
                serde_json::json!({
                    "from": call.from,
                    "to": call.target,
                    "data": format!("0x{}", hex::encode(&call.data)),
                    "block": block.0,
                }),
            )
            .await;
        match result {
            Lookup::Found(hex_data) => match hex::decode(hex_data.strip_prefix("0x").unwrap_or(&hex_data)) {
                Ok(bytes) => Lookup::Found(bytes),
                Err(e) => Lookup::Failed(ChainError::Malformed(format!("chain_call output: {}", e))),
            },
            Lookup::NotFound => Lookup::NotFound,
            Lookup::Failed(e) => Lookup::Failed(e),
        }
    }
}

#[async_trait]
impl TreasuryWallet for JsonRpcChain {
    fn treasury_account(&self) -> Address {
        self.endpoints.treasury.clone()
    }

    async fn transfer(&self, to: &Address, amount: Amount, reference: &str) -> Result<TxRef, ChainError> {
        let authorization = self.authorize_transfer(to, amount, reference)?;
        let result: TxResult = self
            .call_required(
                "treasury_transfer",
                serde_json::json!({
                    "from": self.endpoints.treasury,
                    "to": to,
                    "amount": amount,
                    "reference": reference,
                    "authorization": authorization,
                }),
            )
            .await?;
        Ok(result.tx_ref)
    }

    async fn transfer_by_reference(&self, reference: &str) -> Lookup<TxRef> {
        let result: Lookup<TxResult> = self
            .lookup(
                "treasury_getTransfer",
                serde_json::json!({ "from": self.endpoints.treasury, "reference": reference }),
            )
            .await;
        result.map(|r| r.tx_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_reverts_survive_the_wire() {
        let err = JsonRpcError {
            code: CODE_REVERTED,
            message: "execution reverted".to_string(),
            data: Some(serde_json::json!({
                "reason": "NotOwner",
                "handle": 4,
                "caller": "0x00000000000000000000000000000000000000aa"
            })),
        };
        assert!(matches!(map_rpc_error(err), ChainError::NotOwner { handle: 4, .. }));

        let untyped = JsonRpcError {
            code: CODE_REVERTED,
            message: "execution reverted".to_string(),
            data: None,
        };
        assert_eq!(
            map_rpc_error(untyped),
            ChainError::Reverted("execution reverted".to_string())
        );
    }

    #[test]
    fn test_transient_codes() {
        let err = JsonRpcError {
            code: CODE_NONCE_CONTENTION,
            message: "nonce too low".to_string(),
            data: None,
        };
        assert!(map_rpc_error(err).is_transient());
    }

    #[test]
    fn test_missing_return_data_is_unreadable() {
        let result = TxResult {
            tx_ref: TxRef("0xabc".to_string()),
            return_data: None,
        };
        assert!(matches!(result.into_outcome(), CallOutcome::Unreadable { .. }));

        let result = TxResult {
            tx_ref: TxRef("0xabc".to_string()),
            return_data: Some(format!("0x{}", hex::encode(codec::u64_word(12)))),
        };
        assert!(matches!(result.into_outcome(), CallOutcome::Returned { value: 12, .. }));
    }

    #[test]
    fn test_transfer_authorization_is_keyed() {
        let endpoints = RpcEndpoints {
            url: "http://127.0.0.1:1".to_string(),
            provider: Address::new("0x01"),
            registry: Address::new("0x02"),
            treasury: Address::new("0x03"),
            timeout: Duration::from_secs(1),
        };
        let a = JsonRpcChain::new(endpoints.clone(), b"key-a".to_vec()).unwrap();
        let b = JsonRpcChain::new(endpoints, b"key-b".to_vec()).unwrap();
        let to = Address::new("0x04");
        assert_ne!(
            a.authorize_transfer(&to, 10, "w-1").unwrap(),
            b.authorize_transfer(&to, 10, "w-1").unwrap()
        );
        assert_eq!(
            a.authorize_transfer(&to, 10, "w-1").unwrap(),
            a.authorize_transfer(&to, 10, "w-1").unwrap()
        );
        assert_ne!(
            a.authorize_transfer(&to, 10, "w-1").unwrap(),
            a.authorize_transfer(&to, 10, "w-2").unwrap()
        );
    }
}
