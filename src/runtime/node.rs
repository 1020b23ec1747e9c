use crate::head::{BlockFeed, HeadTracker};
use crate::rpc::{AsyncRpcClient, RpcBlockFeed};
use crate::runtime::config::NodeConfig;
use crate::runtime::lifecycle::{LifecycleHandles, LifecycleSpawnParams};
use crate::runtime::protocol::HeadSubscriber;
use crate::runtime::telemetry::Telemetry;
use crate::scheduler::{ExecutorRegistry, RunScheduler};
use crate::store::{MemoryStore, Store};
use crate::txm::{ChainClient, TxManager, TxSigner};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// External collaborators an [`OracleNode`] runs against.
pub struct NodeComponents {
    pub store: Arc<dyn Store>,
    pub feed: Arc<dyn BlockFeed>,
    pub chain: Arc<dyn ChainClient>,
    pub signer: Arc<dyn TxSigner>,
    /// Task executors added on top of the built-in ones.
    pub executors: ExecutorRegistry,
}

/// Wires the head tracker, transaction manager and run scheduler together and
/// owns their start/stop lifecycle.
///
/// The transaction manager is subscribed before the scheduler, so by the time
/// the scheduler checks confirmations for head N the manager has seen N too.
pub struct OracleNode {
    config: NodeConfig,
    store: Arc<dyn Store>,
    telemetry: Arc<Telemetry>,
    txm: Arc<TxManager>,
    scheduler: Arc<RunScheduler>,
    tracker: Arc<HeadTracker>,
    shutdown: CancellationToken,
    lifecycle: Option<LifecycleHandles>,
}

impl OracleNode {
    /// Node talking JSON-RPC to `config.rpc_url()` with an in-memory store.
    pub fn new(config: NodeConfig, signer: Arc<dyn TxSigner>) -> Result<Self> {
        let telemetry = Arc::new(Telemetry::default());
        let client =
            Arc::new(AsyncRpcClient::from_config(&config).context("failed to build RPC client")?);
        let feed = RpcBlockFeed::new(client.clone(), config.head_poll_interval())
            .with_max_catch_up(config.max_backfill_depth())
            .with_telemetry(telemetry.clone());

        Ok(Self::assemble(
            config,
            NodeComponents {
                store: Arc::new(MemoryStore::new()),
                feed: Arc::new(feed),
                chain: client,
                signer,
                executors: ExecutorRegistry::new(),
            },
            telemetry,
        ))
    }

    pub fn with_components(config: NodeConfig, components: NodeComponents) -> Self {
        Self::assemble(config, components, Arc::new(Telemetry::default()))
    }

    fn assemble(config: NodeConfig, components: NodeComponents, telemetry: Arc<Telemetry>) -> Self {
        let NodeComponents {
            store,
            feed,
            chain,
            signer,
            executors,
        } = components;

        let txm = Arc::new(TxManager::new(
            store.clone(),
            chain,
            signer,
            config.tx_manager_config(),
            telemetry.clone(),
        ));

        let mut registry = ExecutorRegistry::with_builtins(txm.clone(), config.eth_tx_config());
        registry.merge(executors);

        let scheduler = Arc::new(RunScheduler::new(
            store.clone(),
            txm.clone(),
            feed.clone(),
            registry,
            config.scheduler_config(),
            telemetry.clone(),
        ));

        let subscribers: Vec<Arc<dyn HeadSubscriber>> = vec![txm.clone(), scheduler.clone()];
        let tracker = Arc::new(HeadTracker::new(
            feed,
            store.clone(),
            subscribers,
            config.head_tracker_config(),
            telemetry.clone(),
        ));

        Self {
            config,
            store,
            telemetry,
            txm,
            scheduler,
            tracker,
            shutdown: CancellationToken::new(),
            lifecycle: None,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn tx_manager(&self) -> &Arc<TxManager> {
        &self.txm
    }

    pub fn scheduler(&self) -> &Arc<RunScheduler> {
        &self.scheduler
    }

    pub fn head_tracker(&self) -> &Arc<HeadTracker> {
        &self.tracker
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.is_some()
    }

    /// Root token; cancelling it stops the node at its next check.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Fatal error captured during the current run, if any.
    pub fn error(&self) -> Option<anyhow::Error> {
        self.lifecycle.as_ref().and_then(LifecycleHandles::error)
    }

    /// Restores persisted state, attaches subscribers and starts consuming the
    /// feed. A second call while running is a no-op.
    pub async fn start(&mut self) -> Result<()> {
        if self.lifecycle.is_some() {
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }

        tracing::info!(
            rpc_url = self.config.rpc_url(),
            account = %self.config.account(),
            min_confirmations = self.config.min_confirmations(),
            "starting oracle node"
        );

        let lifecycle = LifecycleHandles::spawn(LifecycleSpawnParams {
            shutdown_root: &self.shutdown,
            telemetry: self.telemetry.clone(),
            scheduler: self.scheduler.clone(),
            metrics_interval: self.config.metrics_interval(),
            tick_interval: self.config.scheduler_tick_interval(),
        });

        if let Err(err) = self
            .tracker
            .connect(lifecycle.fatal_handler(), &lifecycle.run_token)
            .await
        {
            lifecycle.run_token.cancel();
            lifecycle.shutdown().await;
            return Err(err.context("failed to connect head tracker"));
        }

        self.lifecycle = Some(lifecycle);
        Ok(())
    }

    /// Stops every background task and detaches subscribers. Returns the fatal
    /// error that halted the node, if one did.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(lifecycle) = self.lifecycle.take() else {
            return Ok(());
        };

        tracing::info!("stopping oracle node");
        let fatal = lifecycle.error();
        lifecycle.run_token.cancel();

        let disconnect = self.tracker.disconnect().await;
        lifecycle.shutdown().await;
        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }

        if let Some(err) = fatal {
            return Err(err);
        }
        disconnect
    }

    /// Runs until Ctrl-C, cancellation of the root token, or a fatal error.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        tracing::info!("oracle node started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down oracle node");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("oracle node shutdown token cancelled");
            }
        }

        self.shutdown.cancel();
        self.stop().await
    }
}
