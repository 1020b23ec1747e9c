use crate::head::HeadTrackerConfig;
use crate::rpc::options::RpcClientOptions;
use crate::runtime::telemetry;
use crate::scheduler::{EthTxConfig, SchedulerConfig};
use crate::txm::{GasBumpPolicy, TxManagerConfig};
use alloy_primitives::{Address, U256};
use anyhow::{bail, Context, Result};
use std::time::Duration;

const GWEI: u64 = 1_000_000_000;
const DEFAULT_MIN_CONFIRMATIONS: u64 = 12;
const DEFAULT_GAS_PRICE_GWEI: u64 = 20;
const DEFAULT_GAS_LIMIT: u64 = 500_000;
const DEFAULT_GAS_BUMP_THRESHOLD: u64 = 12;
const DEFAULT_GAS_BUMP_PERCENT: u64 = 20;
const DEFAULT_GAS_BUMP_GWEI: u64 = 5;
const DEFAULT_MAX_REORG_DEPTH: u64 = 64;
const DEFAULT_MAX_BACKFILL_DEPTH: u64 = 256;
const DEFAULT_HEAD_WINDOW_SIZE: usize = 128;
const DEFAULT_HEAD_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_SCHEDULER_TICK_INTERVAL_SECS: u64 = 1;
const DEFAULT_RPC_TIMEOUT_SECS: u64 = 10;
const MIN_GAS_BUMP_PERCENT: u64 = 10;

/// Runtime configuration for an oracle node.
///
/// Instances only exist through [`NodeConfig::builder`] or [`NodeConfig::new`],
/// both of which validate before handing the value out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    rpc_url: String,
    rpc_user: Option<String>,
    rpc_password: Option<String>,
    account: Address,
    min_confirmations: u64,
    gas_price_default: U256,
    gas_limit_default: u64,
    gas_bump_threshold: u64,
    gas_bump_percent: u64,
    gas_bump_wei: U256,
    max_reorg_depth: u64,
    max_backfill_depth: u64,
    head_window_size: usize,
    head_poll_interval: Duration,
    scheduler_tick_interval: Duration,
    rpc_timeout: Duration,
    metrics_interval: Duration,
}

pub struct NodeConfigParams {
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub account: Address,
    pub min_confirmations: u64,
    pub gas_price_default: U256,
    pub gas_limit_default: u64,
    pub gas_bump_threshold: u64,
    pub gas_bump_percent: u64,
    pub gas_bump_wei: U256,
    pub max_reorg_depth: u64,
    pub max_backfill_depth: u64,
    pub head_window_size: usize,
    pub head_poll_interval: Duration,
    pub scheduler_tick_interval: Duration,
    pub rpc_timeout: Duration,
    pub metrics_interval: Duration,
}

impl NodeConfig {
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    /// Constructs a configuration from fully specified values and validates it.
    pub fn new(params: NodeConfigParams) -> Result<Self> {
        let NodeConfigParams {
            rpc_url,
            rpc_user,
            rpc_password,
            account,
            min_confirmations,
            gas_price_default,
            gas_limit_default,
            gas_bump_threshold,
            gas_bump_percent,
            gas_bump_wei,
            max_reorg_depth,
            max_backfill_depth,
            head_window_size,
            head_poll_interval,
            scheduler_tick_interval,
            rpc_timeout,
            metrics_interval,
        } = params;

        let config = Self {
            rpc_url: rpc_url.trim().to_owned(),
            rpc_user: non_blank(rpc_user),
            rpc_password: non_blank(rpc_password),
            account,
            min_confirmations,
            gas_price_default,
            gas_limit_default,
            gas_bump_threshold,
            gas_bump_percent,
            gas_bump_wei,
            max_reorg_depth,
            max_backfill_depth,
            head_window_size,
            head_poll_interval,
            scheduler_tick_interval,
            rpc_timeout,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Node JSON-RPC endpoint, including scheme.
    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }

    pub fn rpc_user(&self) -> Option<&str> {
        self.rpc_user.as_deref()
    }

    pub fn rpc_password(&self) -> Option<&str> {
        self.rpc_password.as_deref()
    }

    /// Account that signs and sends every transaction.
    pub fn account(&self) -> Address {
        self.account
    }

    /// Confirmations a transaction task needs when the task sets none.
    pub fn min_confirmations(&self) -> u64 {
        self.min_confirmations
    }

    pub fn gas_price_default(&self) -> U256 {
        self.gas_price_default
    }

    pub fn gas_limit_default(&self) -> u64 {
        self.gas_limit_default
    }

    /// Blocks an attempt may stay unmined before it is bumped.
    pub fn gas_bump_threshold(&self) -> u64 {
        self.gas_bump_threshold
    }

    pub fn gas_bump_percent(&self) -> u64 {
        self.gas_bump_percent
    }

    /// Smallest absolute increase applied by a bump.
    pub fn gas_bump_wei(&self) -> U256 {
        self.gas_bump_wei
    }

    pub fn max_reorg_depth(&self) -> u64 {
        self.max_reorg_depth
    }

    pub fn max_backfill_depth(&self) -> u64 {
        self.max_backfill_depth
    }

    /// Number of recent heads kept for ancestor lookups.
    pub fn head_window_size(&self) -> usize {
        self.head_window_size
    }

    pub fn head_poll_interval(&self) -> Duration {
        self.head_poll_interval
    }

    pub fn scheduler_tick_interval(&self) -> Duration {
        self.scheduler_tick_interval
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn head_tracker_config(&self) -> HeadTrackerConfig {
        HeadTrackerConfig {
            max_reorg_depth: self.max_reorg_depth,
            max_backfill_depth: self.max_backfill_depth,
            window_size: self.head_window_size,
            ..HeadTrackerConfig::default()
        }
    }

    pub fn tx_manager_config(&self) -> TxManagerConfig {
        TxManagerConfig {
            gas_bump: GasBumpPolicy {
                percent: self.gas_bump_percent,
                min_increase: self.gas_bump_wei,
                threshold_blocks: self.gas_bump_threshold,
            },
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            min_confirmations: self.min_confirmations,
            ..SchedulerConfig::default()
        }
    }

    /// Sending account and defaults used by the `ethtx` task.
    pub fn eth_tx_config(&self) -> EthTxConfig {
        EthTxConfig {
            from: self.account,
            gas_price: self.gas_price_default,
            gas_limit: self.gas_limit_default,
        }
    }

    pub fn rpc_client_options(&self) -> RpcClientOptions {
        RpcClientOptions {
            request_timeout: self.rpc_timeout,
            ..RpcClientOptions::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_url(&self.rpc_url)?;

        if self.rpc_user.is_some() != self.rpc_password.is_some() {
            bail!("rpc_user and rpc_password must be set together");
        }

        if self.account == Address::ZERO {
            bail!("account cannot be the zero address");
        }

        if self.gas_price_default.is_zero() {
            bail!("gas_price_default must be greater than 0");
        }

        if self.gas_limit_default == 0 {
            bail!("gas_limit_default must be greater than 0");
        }

        if self.gas_bump_threshold == 0 {
            bail!("gas_bump_threshold must be greater than 0");
        }

        if self.gas_bump_percent < MIN_GAS_BUMP_PERCENT {
            bail!(
                "gas_bump_percent ({}) must be at least {MIN_GAS_BUMP_PERCENT} so nodes accept \
                 the replacement",
                self.gas_bump_percent
            );
        }

        if self.max_reorg_depth == 0 {
            bail!("max_reorg_depth must be greater than 0");
        }

        if self.max_backfill_depth == 0 {
            bail!("max_backfill_depth must be greater than 0");
        }

        if (self.head_window_size as u64) < self.max_reorg_depth {
            bail!(
                "head_window_size ({}) must be at least max_reorg_depth ({})",
                self.head_window_size,
                self.max_reorg_depth
            );
        }

        if self.head_poll_interval.is_zero() {
            bail!("head_poll_interval must be greater than 0");
        }

        if self.scheduler_tick_interval.is_zero() {
            bail!("scheduler_tick_interval must be greater than 0");
        }

        if self.rpc_timeout.is_zero() {
            bail!("rpc_timeout must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct NodeConfigBuilder {
    rpc_url: Option<String>,
    rpc_user: Option<String>,
    rpc_password: Option<String>,
    account: Option<Address>,
    min_confirmations: Option<u64>,
    gas_price_default: Option<U256>,
    gas_limit_default: Option<u64>,
    gas_bump_threshold: Option<u64>,
    gas_bump_percent: Option<u64>,
    gas_bump_wei: Option<U256>,
    max_reorg_depth: Option<u64>,
    max_backfill_depth: Option<u64>,
    head_window_size: Option<usize>,
    head_poll_interval: Option<Duration>,
    scheduler_tick_interval: Option<Duration>,
    rpc_timeout: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl NodeConfigBuilder {
    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    pub fn rpc_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.rpc_user = Some(user.into());
        self.rpc_password = Some(password.into());
        self
    }

    pub fn account(mut self, account: Address) -> Self {
        self.account = Some(account);
        self
    }

    pub fn min_confirmations(mut self, confirmations: u64) -> Self {
        self.min_confirmations = Some(confirmations);
        self
    }

    pub fn gas_price_default(mut self, wei: U256) -> Self {
        self.gas_price_default = Some(wei);
        self
    }

    pub fn gas_limit_default(mut self, gas: u64) -> Self {
        self.gas_limit_default = Some(gas);
        self
    }

    pub fn gas_bump_threshold(mut self, blocks: u64) -> Self {
        self.gas_bump_threshold = Some(blocks);
        self
    }

    pub fn gas_bump_percent(mut self, percent: u64) -> Self {
        self.gas_bump_percent = Some(percent);
        self
    }

    pub fn gas_bump_wei(mut self, wei: U256) -> Self {
        self.gas_bump_wei = Some(wei);
        self
    }

    pub fn max_reorg_depth(mut self, depth: u64) -> Self {
        self.max_reorg_depth = Some(depth);
        self
    }

    pub fn max_backfill_depth(mut self, depth: u64) -> Self {
        self.max_backfill_depth = Some(depth);
        self
    }

    pub fn head_window_size(mut self, size: usize) -> Self {
        self.head_window_size = Some(size);
        self
    }

    pub fn head_poll_interval(mut self, interval: Duration) -> Self {
        self.head_poll_interval = Some(interval);
        self
    }

    pub fn scheduler_tick_interval(mut self, interval: Duration) -> Self {
        self.scheduler_tick_interval = Some(interval);
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<NodeConfig> {
        let params = NodeConfigParams {
            rpc_url: self.rpc_url.context("rpc_url is required")?,
            rpc_user: self.rpc_user,
            rpc_password: self.rpc_password,
            account: self.account.context("account is required")?,
            min_confirmations: self
                .min_confirmations
                .unwrap_or(DEFAULT_MIN_CONFIRMATIONS),
            gas_price_default: self
                .gas_price_default
                .unwrap_or_else(|| gwei(DEFAULT_GAS_PRICE_GWEI)),
            gas_limit_default: self.gas_limit_default.unwrap_or(DEFAULT_GAS_LIMIT),
            gas_bump_threshold: self
                .gas_bump_threshold
                .unwrap_or(DEFAULT_GAS_BUMP_THRESHOLD),
            gas_bump_percent: self.gas_bump_percent.unwrap_or(DEFAULT_GAS_BUMP_PERCENT),
            gas_bump_wei: self
                .gas_bump_wei
                .unwrap_or_else(|| gwei(DEFAULT_GAS_BUMP_GWEI)),
            max_reorg_depth: self.max_reorg_depth.unwrap_or(DEFAULT_MAX_REORG_DEPTH),
            max_backfill_depth: self
                .max_backfill_depth
                .unwrap_or(DEFAULT_MAX_BACKFILL_DEPTH),
            head_window_size: self.head_window_size.unwrap_or(DEFAULT_HEAD_WINDOW_SIZE),
            head_poll_interval: self
                .head_poll_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_HEAD_POLL_INTERVAL_SECS)),
            scheduler_tick_interval: self
                .scheduler_tick_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_SCHEDULER_TICK_INTERVAL_SECS)),
            rpc_timeout: self
                .rpc_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_RPC_TIMEOUT_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
        };

        NodeConfig::new(params)
    }
}

fn gwei(amount: u64) -> U256 {
    U256::from(amount) * U256::from(GWEI)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn validate_url(url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("rpc_url must start with http:// or https://");
    }
    Ok(())
}
