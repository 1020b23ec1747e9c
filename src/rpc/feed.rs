//! `BlockFeed` over plain HTTP polling: the tip is refreshed on an interval
//! and any heights skipped since the last poll are fetched in one batch, so
//! the tracker sees headers in ascending order without gaps.

use crate::head::BlockFeed;
use crate::models::{BlockHeader, LogEvent, LogFilter};
use crate::rpc::client::{AsyncRpcClient, RpcError};
use crate::runtime::telemetry::Telemetry;
use anyhow::Result;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;
const DEFAULT_MAX_CATCH_UP: u64 = 256;

#[derive(Debug, Clone)]
pub struct RpcBlockFeed {
    client: Arc<AsyncRpcClient>,
    poll_interval: Duration,
    max_catch_up: u64,
    channel_capacity: usize,
    telemetry: Arc<Telemetry>,
}

impl RpcBlockFeed {
    pub fn new(client: Arc<AsyncRpcClient>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
            max_catch_up: DEFAULT_MAX_CATCH_UP,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            telemetry: Arc::new(Telemetry::default()),
        }
    }

    /// Counts failed polls into the node's shared counters.
    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Caps how many skipped heights one poll emits. Older heights are left to
    /// the tracker's backfill.
    pub fn with_max_catch_up(mut self, blocks: u64) -> Self {
        self.max_catch_up = blocks.max(1);
        self
    }

    pub fn client(&self) -> &Arc<AsyncRpcClient> {
        &self.client
    }
}

impl BlockFeed for RpcBlockFeed {
    fn subscribe(
        &self,
        shutdown: CancellationToken,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<BlockHeader>>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(self.channel_capacity);
            spawn_poll_loop(
                self.client.clone(),
                self.poll_interval,
                self.max_catch_up,
                self.telemetry.clone(),
                tx,
                shutdown,
            );
            Ok(rx)
        })
    }

    fn header_by_number(&self, number: u64) -> BoxFuture<'_, Result<BlockHeader>> {
        Box::pin(self.client.header_by_number(number))
    }

    fn logs<'a>(&'a self, filter: &'a LogFilter) -> BoxFuture<'a, Result<Vec<LogEvent>>> {
        Box::pin(self.client.logs(filter))
    }
}

fn spawn_poll_loop(
    client: Arc<AsyncRpcClient>,
    poll_interval: Duration,
    max_catch_up: u64,
    telemetry: Arc<Telemetry>,
    tx: mpsc::Sender<BlockHeader>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_emitted: Option<u64> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tx.closed() => break,
                _ = ticker.tick() => {
                    let tip = match client.block_number().await {
                        Ok(tip) => tip,
                        Err(err) => {
                            telemetry.record_rpc_error();
                            tracing::warn!(error = %err, "failed to refresh chain tip");
                            continue;
                        }
                    };

                    let numbers = pending_heights(last_emitted, tip, max_catch_up);
                    if numbers.is_empty() {
                        if matches!(last_emitted, Some(last) if tip < last) {
                            tracing::warn!(tip, previous_tip = ?last_emitted, "node tip moved backwards");
                            last_emitted = Some(tip);
                        }
                        continue;
                    }

                    let headers = match client.headers_by_number(&numbers).await {
                        Ok(headers) => headers,
                        Err(err) => {
                            if let Some(RpcError::HeightOutOfRange { height }) = err.downcast_ref::<RpcError>() {
                                tracing::debug!(height, tip, "node not caught up to its own tip yet");
                            } else {
                                telemetry.record_rpc_error();
                                tracing::warn!(error = %err, tip, "failed to fetch new headers");
                            }
                            continue;
                        }
                    };

                    for header in headers {
                        let number = header.number;
                        if tx.send(header).await.is_err() {
                            tracing::debug!("head subscription dropped by receiver");
                            return;
                        }
                        last_emitted = Some(number);
                    }
                }
            }
        }

        tracing::debug!("rpc block feed stopped");
    })
}

/// Heights to emit after `last_emitted` up to `tip`, keeping only the newest
/// `max_catch_up` of them.
fn pending_heights(last_emitted: Option<u64>, tip: u64, max_catch_up: u64) -> Vec<u64> {
    let from = match last_emitted {
        None => tip,
        Some(last) if tip <= last => return Vec::new(),
        Some(last) => last
            .saturating_add(1)
            .max(tip.saturating_sub(max_catch_up.saturating_sub(1))),
    };
    (from..=tip).collect()
}
