//! Configuration management with validation and defaults
//!
//! Every externally supplied value (addresses, endpoint, key material, fee
//! currency, scan bound, fulfillment timeout) comes from a TOML file and/or
//! `FAIRWAGER_*` environment variables. Only tunables have defaults.

use crate::errors::{ConfigurationError, WagerResult};
use crate::retry::RetryPolicy;
use crate::types::{Address, FeeCurrency};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WagerConfig {
    pub provider: ProviderConfig,
    pub treasury: TreasuryConfig,
    pub resolver: ResolverConfig,
    pub tracker: TrackerConfig,
    pub retry: RetryPolicy,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub monitoring: MonitoringConfig,
}

/// Where collaborator calls go.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainMode {
    /// JSON-RPC endpoint.
    #[default]
    Rpc,
    /// In-process chain; nothing leaves the host.
    Simulated,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub mode: ChainMode,
    pub rpc_url: String,
    pub provider_address: String,
    pub registry_address: String,
    /// Contract that spends against the funding resource.
    pub consumer_contract: String,
    /// Account that owns the funding resource.
    pub subscription_owner: String,
    /// `native` or `token:<symbol>`.
    pub fee_currency: String,
    /// Existing funding resource; a new one is created when absent.
    pub subscription_handle: Option<u64>,
    pub rpc_timeout_ms: u64,
    /// Hex-encoded key the provider signs fulfillment callbacks with.
    pub callback_secret: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            mode: ChainMode::Rpc,
            rpc_url: String::new(),
            provider_address: String::new(),
            registry_address: String::new(),
            consumer_contract: String::new(),
            subscription_owner: String::new(),
            fee_currency: String::new(),
            subscription_handle: None,
            rpc_timeout_ms: 15_000,
            callback_secret: String::new(),
        }
    }
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("mode", &self.mode)
            .field("rpc_url", &self.rpc_url)
            .field("provider_address", &self.provider_address)
            .field("registry_address", &self.registry_address)
            .field("consumer_contract", &self.consumer_contract)
            .field("subscription_owner", &self.subscription_owner)
            .field("fee_currency", &self.fee_currency)
            .field("subscription_handle", &self.subscription_handle)
            .field("rpc_timeout_ms", &self.rpc_timeout_ms)
            .field("callback_secret", &"<redacted>")
            .finish()
    }
}

impl ProviderConfig {
    pub fn fee_currency(&self) -> Result<FeeCurrency, ConfigurationError> {
        self.fee_currency.parse().map_err(|reason| ConfigurationError::InvalidValue {
            field: "provider.fee_currency".to_string(),
            value: self.fee_currency.clone(),
            reason,
        })
    }

    pub fn consumer(&self) -> Address {
        Address::new(&self.consumer_contract)
    }

    pub fn owner(&self) -> Address {
        Address::new(&self.subscription_owner)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Key for verifying fulfillment callbacks. Empty when unset.
    pub fn callback_secret_bytes(&self) -> Result<Vec<u8>, ConfigurationError> {
        let raw = self.callback_secret.strip_prefix("0x").unwrap_or(&self.callback_secret);
        hex::decode(raw).map_err(|e| ConfigurationError::InvalidValue {
            field: "provider.callback_secret".to_string(),
            value: "<redacted>".to_string(),
            reason: format!("not valid hex: {}", e),
        })
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TreasuryConfig {
    pub account: String,
    /// Hex-encoded key used to authorize outbound transfers.
    pub signing_key: String,
    /// Send the refunded stake back on chain when a request expires.
    pub auto_withdraw_refunds: bool,
    pub confirmation_interval_ms: u64,
}

impl Default for TreasuryConfig {
    fn default() -> Self {
        Self {
            account: String::new(),
            signing_key: String::new(),
            auto_withdraw_refunds: true,
            confirmation_interval_ms: 5_000,
        }
    }
}

impl fmt::Debug for TreasuryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreasuryConfig")
            .field("account", &self.account)
            .field("signing_key", &"<redacted>")
            .field("auto_withdraw_refunds", &self.auto_withdraw_refunds)
            .field("confirmation_interval_ms", &self.confirmation_interval_ms)
            .finish()
    }
}

impl TreasuryConfig {
    pub fn signing_key_bytes(&self) -> Result<Vec<u8>, ConfigurationError> {
        let raw = self.signing_key.strip_prefix("0x").unwrap_or(&self.signing_key);
        hex::decode(raw).map_err(|e| ConfigurationError::InvalidValue {
            field: "treasury.signing_key".to_string(),
            value: "<redacted>".to_string(),
            reason: format!("not valid hex: {}", e),
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// First handle the ownership scan looks at.
    pub scan_start: u64,
    /// Hard upper bound on handles probed by one scan.
    pub scan_limit: u64,
    /// How many recent sequence numbers the request-id scan inspects.
    pub sequence_scan_window: u64,
    pub resolve_interval_ms: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            scan_start: 1,
            scan_limit: 256,
            sequence_scan_window: 512,
            resolve_interval_ms: 15_000,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Age after which an unfulfilled request expires.
    pub fulfillment_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_batch_size: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            fulfillment_timeout_ms: 300_000,
            sweep_interval_ms: 10_000,
            poll_interval_ms: 2_000,
            poll_batch_size: 100,
        }
    }
}

impl TrackerConfig {
    pub fn fulfillment_timeout(&self) -> Duration {
        Duration::from_millis(self.fulfillment_timeout_ms)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    Rocksdb,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Rocksdb,
            data_dir: "./DB/fairwager".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub request_timeout_secs: u64,
    pub allowed_origins: Vec<String>,
    /// Prefix for transaction links shown to players, e.g. `https://explorer/tx/`.
    pub explorer_tx_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            allowed_origins: vec!["*".to_string()],
            explorer_tx_url: String::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_filter: String,
    pub metrics_enabled: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_filter: "fairwager=info,tower_http=info".to_string(),
            metrics_enabled: true,
        }
    }
}

/// Configuration loader with environment variable support
#[derive(Default)]
pub struct ConfigLoader {
    config_path: Option<String>,
    mode: Option<ChainMode>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration file path
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Force the chain mode regardless of file and environment.
    pub fn with_mode(mut self, mode: ChainMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Load configuration from file and environment variables
    pub fn load(&self) -> WagerResult<WagerConfig> {
        let mut config = match self.config_path {
            Some(ref path) => self.load_from_file(path)?,
            None => WagerConfig::default(),
        };

        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        if let Some(mode) = self.mode {
            config.provider.mode = mode;
        }

        validate(&config)?;
        Ok(config)
    }

    fn load_from_file(&self, path: &str) -> WagerResult<WagerConfig> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to read {}: {}", path, e)))?;

        toml::from_str(&content)
            .map_err(|e| ConfigurationError::LoadFailed(format!("Failed to parse TOML: {}", e)).into())
    }

    /// Save configuration to file
    pub fn save(&self, config: &WagerConfig, path: &str) -> WagerResult<()> {
        let toml_string = toml::to_string_pretty(config)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, toml_string)
            .map_err(|e| ConfigurationError::SaveFailed(format!("Failed to write to {}: {}", path, e)).into())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: String, reason: &str) -> Result<T, ConfigurationError> {
    value.parse().map_err(|_| ConfigurationError::InvalidValue {
        field: key.to_string(),
        value,
        reason: reason.to_string(),
    })
}

/// Apply `FAIRWAGER_*` overrides read through `lookup`.
pub fn apply_env_overrides<F>(config: &mut WagerConfig, lookup: F) -> WagerResult<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(mode) = lookup("FAIRWAGER_CHAIN_MODE") {
        config.provider.mode = match mode.as_str() {
            "rpc" => ChainMode::Rpc,
            "simulated" => ChainMode::Simulated,
            _ => {
                return Err(ConfigurationError::InvalidValue {
                    field: "FAIRWAGER_CHAIN_MODE".to_string(),
                    value: mode,
                    reason: "expected 'rpc' or 'simulated'".to_string(),
                }
                .into())
            }
        };
    }
    if let Some(url) = lookup("FAIRWAGER_RPC_URL") {
        config.provider.rpc_url = url;
    }
    if let Some(addr) = lookup("FAIRWAGER_PROVIDER_ADDRESS") {
        config.provider.provider_address = addr;
    }
    if let Some(addr) = lookup("FAIRWAGER_REGISTRY_ADDRESS") {
        config.provider.registry_address = addr;
    }
    if let Some(addr) = lookup("FAIRWAGER_CONSUMER_CONTRACT") {
        config.provider.consumer_contract = addr;
    }
    if let Some(addr) = lookup("FAIRWAGER_SUBSCRIPTION_OWNER") {
        config.provider.subscription_owner = addr;
    }
    if let Some(currency) = lookup("FAIRWAGER_FEE_CURRENCY") {
        config.provider.fee_currency = currency;
    }
    if let Some(handle) = lookup("FAIRWAGER_SUBSCRIPTION_HANDLE") {
        config.provider.subscription_handle =
            Some(parse_env("FAIRWAGER_SUBSCRIPTION_HANDLE", handle, "Invalid handle")?);
    }

    if let Some(secret) = lookup("FAIRWAGER_PROVIDER_CALLBACK_SECRET") {
        config.provider.callback_secret = secret;
    }
    if let Some(account) = lookup("FAIRWAGER_TREASURY_ACCOUNT") {
        config.treasury.account = account;
    }
    if let Some(key) = lookup("FAIRWAGER_TREASURY_SIGNING_KEY") {
        config.treasury.signing_key = key;
    }

    if let Some(limit) = lookup("FAIRWAGER_SCAN_LIMIT") {
        config.resolver.scan_limit = parse_env("FAIRWAGER_SCAN_LIMIT", limit, "Invalid scan limit")?;
    }
    if let Some(timeout) = lookup("FAIRWAGER_FULFILLMENT_TIMEOUT_MS") {
        config.tracker.fulfillment_timeout_ms =
            parse_env("FAIRWAGER_FULFILLMENT_TIMEOUT_MS", timeout, "Invalid timeout value")?;
    }

    if let Some(data_dir) = lookup("FAIRWAGER_DATA_DIR") {
        config.storage.data_dir = data_dir;
    }
    if let Some(port) = lookup("FAIRWAGER_API_PORT") {
        config.api.port = parse_env("FAIRWAGER_API_PORT", port, "Invalid port number")?;
    }
    if let Some(filter) = lookup("FAIRWAGER_LOG") {
        config.monitoring.log_filter = filter;
    }

    Ok(())
}

fn require(field: &str, value: &str) -> WagerResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigurationError::MissingRequired(field.to_string()).into());
    }
    Ok(())
}

fn non_zero(field: &str, value: u64, reason: &str) -> WagerResult<()> {
    if value == 0 {
        return Err(ConfigurationError::InvalidValue {
            field: field.to_string(),
            value: "0".to_string(),
            reason: reason.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Validate configuration values
pub fn validate(config: &WagerConfig) -> WagerResult<()> {
    let provider = &config.provider;
    require("provider.consumer_contract", &provider.consumer_contract)?;
    require("provider.subscription_owner", &provider.subscription_owner)?;
    require("provider.fee_currency", &provider.fee_currency)?;
    provider.fee_currency()?;
    require("treasury.account", &config.treasury.account)?;

    if provider.mode == ChainMode::Rpc {
        require("provider.rpc_url", &provider.rpc_url)?;
        require("provider.provider_address", &provider.provider_address)?;
        require("provider.registry_address", &provider.registry_address)?;
        require("treasury.signing_key", &config.treasury.signing_key)?;
        config.treasury.signing_key_bytes()?;
        require("provider.callback_secret", &provider.callback_secret)?;
        provider.callback_secret_bytes()?;
        non_zero("provider.rpc_timeout_ms", provider.rpc_timeout_ms, "Timeout cannot be zero")?;
    }

    non_zero("resolver.scan_limit", config.resolver.scan_limit, "Scan limit cannot be zero")?;
    non_zero(
        "resolver.sequence_scan_window",
        config.resolver.sequence_scan_window,
        "Scan window cannot be zero",
    )?;
    non_zero(
        "tracker.fulfillment_timeout_ms",
        config.tracker.fulfillment_timeout_ms,
        "Timeout cannot be zero",
    )?;
    non_zero("tracker.sweep_interval_ms", config.tracker.sweep_interval_ms, "Interval cannot be zero")?;
    non_zero("tracker.poll_interval_ms", config.tracker.poll_interval_ms, "Interval cannot be zero")?;
    non_zero("retry.max_attempts", config.retry.max_attempts as u64, "At least one attempt is required")?;
    non_zero("retry.call_timeout_ms", config.retry.call_timeout_ms, "Timeout cannot be zero")?;

    if config.storage.backend == StorageBackend::Rocksdb {
        require("storage.data_dir", &config.storage.data_dir)?;
    }
    if config.api.enabled && config.api.port == 0 {
        return Err(ConfigurationError::InvalidValue {
            field: "api.port".to_string(),
            value: "0".to_string(),
            reason: "API port cannot be zero when API is enabled".to_string(),
        }
        .into());
    }

    Ok(())
}

/// Generate a sample configuration file
pub fn generate_sample_config(path: &str) -> WagerResult<()> {
    let mut config = WagerConfig::default();
    config.provider.rpc_url = "http://127.0.0.1:8545".to_string();
    config.provider.fee_currency = "native".to_string();
    ConfigLoader::new().save(&config, path)
}

#[cfg(test)]
pub(crate) fn test_config() -> WagerConfig {
    let mut config = WagerConfig::default();
    config.provider.mode = ChainMode::Simulated;
    config.provider.consumer_contract = "0x00000000000000000000000000000000000000c0".to_string();
    config.provider.subscription_owner = "0x00000000000000000000000000000000000000a0".to_string();
    config.provider.fee_currency = "native".to_string();
    config.treasury.account = crate::chain::memory::TREASURY_ADDRESS.to_string();
    config.storage.backend = StorageBackend::Memory;
    config.retry = RetryPolicy::immediate(3);
    config
}
