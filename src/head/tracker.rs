//! Head tracking: the single owner of the node's notion of the current head.
//!
//! Headers from the feed are reconciled against a window of recent canonical
//! hashes. Gaps are backfilled, forks are walked back to their common ancestor,
//! and every head is handed to all subscribers before the next header is
//! looked at.

use super::backoff::{retry_with_backoff, RetryBackoff};
use super::feed::BlockFeed;
use super::window::HeadWindow;
use crate::models::{BlockHeader, Head};
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::hooks::{run_cancellable, HookDecision};
use crate::runtime::protocol::{HeadSubscriber, SubscriberError};
use crate::runtime::telemetry::Telemetry;
use crate::store::Store;
use alloy_primitives::B256;
use anyhow::Result;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

const DEFAULT_MAX_REORG_DEPTH: u64 = 64;
const DEFAULT_MAX_BACKFILL_DEPTH: u64 = 256;
const DEFAULT_WINDOW_SIZE: usize = 128;
const DEFAULT_RESUBSCRIBE_INITIAL_BACKOFF_MS: u64 = 500;
const DEFAULT_RESUBSCRIBE_MAX_BACKOFF_MS: u64 = 10_000;

#[derive(Debug, Clone)]
pub struct HeadTrackerConfig {
    /// Deepest fork the tracker resolves; anything deeper halts the node.
    pub max_reorg_depth: u64,
    /// Widest gap backfilled header by header. Wider gaps re-anchor the
    /// tracker at the incoming header.
    pub max_backfill_depth: u64,
    pub window_size: usize,
    pub resubscribe_initial_backoff: Duration,
    pub resubscribe_max_backoff: Duration,
}

impl Default for HeadTrackerConfig {
    fn default() -> Self {
        Self {
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            max_backfill_depth: DEFAULT_MAX_BACKFILL_DEPTH,
            window_size: DEFAULT_WINDOW_SIZE,
            resubscribe_initial_backoff: Duration::from_millis(
                DEFAULT_RESUBSCRIBE_INITIAL_BACKOFF_MS,
            ),
            resubscribe_max_backoff: Duration::from_millis(DEFAULT_RESUBSCRIBE_MAX_BACKOFF_MS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeadTrackerError {
    #[error("reorg at block {head} is at least {depth} blocks deep; at most {max} are supported")]
    ReorgTooDeep { head: u64, depth: u64, max: u64 },
    #[error("feed returned block {number} with hash {actual}, expected {expected}")]
    FeedInconsistent {
        number: u64,
        expected: B256,
        actual: B256,
    },
}

struct TrackerState {
    current: Option<Head>,
    window: HeadWindow,
    /// Highest number handed to subscribers. Can sit above `current` after a
    /// reorg onto a shorter chain.
    delivered: Option<u64>,
    /// Deepest ancestor of reorgs not yet announced to subscribers.
    pending_reorg: Option<u64>,
}

impl TrackerState {
    fn is_fresh(&self, head: &Head) -> bool {
        self.delivered.map_or(true, |delivered| head.number > delivered)
    }

    fn note_reorg(&mut self, ancestor: u64) {
        self.pending_reorg = Some(self.pending_reorg.map_or(ancestor, |pending| pending.min(ancestor)));
    }
}

struct Connection {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct HeadTracker {
    feed: Arc<dyn BlockFeed>,
    store: Arc<dyn Store>,
    subscribers: Vec<Arc<dyn HeadSubscriber>>,
    config: HeadTrackerConfig,
    telemetry: Arc<Telemetry>,
    /// Held for the whole of `on_head`, delivery included.
    state: Mutex<TrackerState>,
    connection: StdMutex<Option<Connection>>,
}

impl HeadTracker {
    pub fn new(
        feed: Arc<dyn BlockFeed>,
        store: Arc<dyn Store>,
        subscribers: Vec<Arc<dyn HeadSubscriber>>,
        config: HeadTrackerConfig,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let window = HeadWindow::new(config.window_size);
        Self {
            feed,
            store,
            subscribers,
            config,
            telemetry,
            state: Mutex::new(TrackerState {
                current: None,
                window,
                delivered: None,
                pending_reorg: None,
            }),
            connection: StdMutex::new(None),
        }
    }

    pub async fn current_head(&self) -> Option<Head> {
        self.state.lock().await.current.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Restores the last persisted heads, attaches every subscriber and starts
    /// consuming the feed. A second call while connected is a no-op.
    ///
    /// A reorg deeper than `max_reorg_depth` goes to `fatal` and stops the
    /// head stream.
    pub async fn connect(
        self: &Arc<Self>,
        fatal: FatalErrorHandler,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let last_head = self.restore().await?;

        for subscriber in &self.subscribers {
            subscriber.connect(last_head.as_ref()).await?;
        }

        let token = shutdown.child_token();
        let handle = tokio::spawn(Arc::clone(self).consume(fatal, token.clone()));

        let mut connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = connection.replace(Connection {
            shutdown: token,
            handle,
        }) {
            previous.shutdown.cancel();
        }

        tracing::info!(
            head = last_head.as_ref().map(|head| head.number),
            subscribers = self.subscribers.len(),
            "head tracker connected"
        );
        Ok(())
    }

    /// Stops consuming the feed and detaches subscribers. Idempotent.
    pub async fn disconnect(&self) -> Result<()> {
        let connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(connection) = connection else {
            return Ok(());
        };

        connection.shutdown.cancel();
        if let Err(err) = connection.handle.await {
            tracing::warn!(error = %err, "head tracker task panicked");
        }

        let mut first_error: Option<SubscriberError> = None;
        for subscriber in &self.subscribers {
            if let Err(err) = subscriber.disconnect().await {
                tracing::warn!(subscriber = subscriber.name(), error = %err, "subscriber failed to disconnect");
                first_error.get_or_insert(err);
            }
        }

        tracing::info!("head tracker disconnected");
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Reconciles one header from the feed and delivers the resulting new
    /// heads, returning them in ascending order.
    ///
    /// A header that skips ahead is backfilled from its parents. One whose
    /// parent is not the current head is walked back to the common ancestor
    /// first, even when it sits at or below the current height, and the
    /// replacement chain becomes current and is persisted. Only heads above
    /// the highest one delivered so far reach subscribers, so they always see
    /// strictly increasing numbers; the first of them carries the reorg
    /// ancestor.
    pub async fn on_head(&self, header: BlockHeader) -> Result<Vec<Head>> {
        let mut state = self.state.lock().await;

        let Some(current) = state.current.clone() else {
            let mut head = Head::from(&header);
            self.store.save_head(&head).await?;
            state.window.push(head.number, head.hash);
            state.current = Some(head.clone());
            state.delivered = Some(head.number);
            head.reorg_ancestor = state.pending_reorg.take();
            tracing::info!(number = head.number, hash = %head.hash, "first head observed");
            self.deliver(std::slice::from_ref(&head)).await?;
            return Ok(vec![head]);
        };

        if state.window.find_hash(&header.hash).is_some() {
            tracing::trace!(
                number = header.number,
                hash = %header.hash,
                current = current.number,
                "ignoring header already on the canonical chain"
            );
            return Ok(Vec::new());
        }

        if header.number <= current.number {
            let parent_in_window = match (header.number.checked_sub(1), state.window.oldest()) {
                (Some(parent), Some(oldest)) => parent >= oldest,
                _ => false,
            };
            if !parent_in_window {
                tracing::debug!(
                    number = header.number,
                    hash = %header.hash,
                    current = current.number,
                    "ignoring competing header below the reorg window"
                );
                return Ok(Vec::new());
            }
        } else if header.number - current.number > self.config.max_backfill_depth {
            tracing::warn!(
                number = header.number,
                current = current.number,
                max_backfill_depth = self.config.max_backfill_depth,
                "head gap too wide to backfill; re-anchoring at incoming header"
            );
            let mut head = Head::from(&header);
            self.store.save_head(&head).await?;
            state.window.clear();
            state.window.push(head.number, head.hash);
            state.current = Some(head.clone());
            state.delivered = Some(head.number);
            head.reorg_ancestor = state.pending_reorg.take();
            self.deliver(std::slice::from_ref(&head)).await?;
            return Ok(vec![head]);
        }

        let (ancestor, segment) = self.walk_to_ancestor(&state.window, &current, header).await?;

        if ancestor < current.number {
            let depth = current.number - ancestor;
            self.telemetry.record_reorg();
            state.note_reorg(ancestor);
            tracing::warn!(
                ancestor,
                depth,
                previous_head = current.number,
                new_head = segment.last().map(|head| head.number),
                "chain reorganization resolved"
            );
        } else if segment.len() > 1 {
            tracing::debug!(
                from = ancestor.saturating_add(1),
                to = segment.last().map(|head| head.number),
                "backfilled skipped heads"
            );
        }

        for head in &segment {
            self.store.save_head(head).await?;
        }

        state.window.truncate_after(ancestor);
        for head in &segment {
            state.window.push(head.number, head.hash);
        }
        state.current = segment.last().cloned();

        let mut fresh: Vec<Head> = segment
            .into_iter()
            .filter(|head| state.is_fresh(head))
            .collect();
        if fresh.is_empty() {
            tracing::info!(
                current = state.current.as_ref().map(|head| head.number),
                delivered = state.delivered,
                "canonical head replaced without passing the delivered height"
            );
            return Ok(fresh);
        }
        fresh[0].reorg_ancestor = state.pending_reorg.take();
        state.delivered = fresh.last().map(|head| head.number);
        self.deliver(&fresh).await?;
        Ok(fresh)
    }

    /// Fetches parents of `header` until one matches the window. Returns the
    /// ancestor's number and the new canonical heads above it, ascending.
    async fn walk_to_ancestor(
        &self,
        window: &HeadWindow,
        current: &Head,
        header: BlockHeader,
    ) -> Result<(u64, Vec<Head>)> {
        let tip = header.number;
        let mut child = header.clone();
        let mut descending = vec![header];

        loop {
            let too_deep = |depth: u64| HeadTrackerError::ReorgTooDeep {
                head: tip,
                depth,
                max: self.config.max_reorg_depth,
            };

            let Some(parent_number) = child.number.checked_sub(1) else {
                return Err(too_deep(current.number.saturating_add(1)).into());
            };

            if window.hash_at(parent_number) == Some(child.parent_hash) {
                let heads = descending.iter().rev().map(Head::from).collect();
                return Ok((parent_number, heads));
            }

            if parent_number <= current.number {
                let depth = current.number - parent_number + 1;
                let below_window = window.oldest().map_or(true, |oldest| parent_number < oldest);
                if depth > self.config.max_reorg_depth || below_window {
                    return Err(too_deep(depth).into());
                }
            }

            let parent = self.feed.header_by_number(parent_number).await?;
            if parent.hash != child.parent_hash {
                return Err(HeadTrackerError::FeedInconsistent {
                    number: parent_number,
                    expected: child.parent_hash,
                    actual: parent.hash,
                }
                .into());
            }
            descending.push(parent.clone());
            child = parent;
        }
    }

    /// Every subscriber sees each head in order; one failing subscriber does
    /// not starve the others. The first failure is returned afterwards.
    async fn deliver(&self, heads: &[Head]) -> Result<()> {
        let mut first_error: Option<SubscriberError> = None;
        for head in heads {
            for subscriber in &self.subscribers {
                if let Err(err) = subscriber.on_new_head(head).await {
                    tracing::warn!(
                        subscriber = subscriber.name(),
                        number = head.number,
                        error = %err,
                        "subscriber failed to process head"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }
        self.telemetry.record_heads_delivered(heads.len() as u64);
        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    async fn restore(&self) -> Result<Option<Head>> {
        let heads = self.store.recent_heads(self.config.window_size).await?;
        let mut state = self.state.lock().await;
        if heads.is_empty() {
            return Ok(state.current.clone());
        }
        state.window.clear();
        for head in &heads {
            state.window.push(head.number, head.hash);
        }
        state.current = heads.last().cloned();
        state.delivered = state.current.as_ref().map(|head| head.number);
        state.pending_reorg = None;
        Ok(state.current.clone())
    }

    async fn consume(self: Arc<Self>, fatal: FatalErrorHandler, shutdown: CancellationToken) {
        loop {
            let subscription = retry_with_backoff(
                RetryBackoff::new(
                    self.config.resubscribe_initial_backoff,
                    self.config.resubscribe_max_backoff,
                )
                .with_cancellation(&shutdown),
                |_| self.feed.subscribe(shutdown.clone()),
                |attempt, backoff, err| {
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "failed to subscribe to block feed; retrying"
                    );
                },
            )
            .await;

            let mut headers = match subscription {
                Ok(headers) => headers,
                Err(_) => break,
            };

            loop {
                let header = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return,
                    header = headers.recv() => header,
                };
                let Some(header) = header else {
                    tracing::warn!("block feed closed; resubscribing");
                    break;
                };

                match run_cancellable(self.on_head(header), &shutdown).await {
                    HookDecision::Cancelled => return,
                    HookDecision::Finished(Ok(_)) => {}
                    HookDecision::Finished(Err(err)) => {
                        if matches!(
                            err.downcast_ref::<HeadTrackerError>(),
                            Some(HeadTrackerError::ReorgTooDeep { .. })
                        ) {
                            let _ = fatal.trigger("head tracker", err);
                            return;
                        }
                        tracing::warn!(error = %err, "failed to process header");
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.config.resubscribe_initial_backoff) => {}
            }
        }

        tracing::debug!("head tracker feed loop stopped");
    }
}
