use crate::models::{BlockHeader, LogEvent, LogFilter};
use anyhow::Result;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Source of block headers and logs from a chain node.
///
/// `subscribe` hands back a channel of new headers that closes when the
/// underlying connection drops or `shutdown` fires; the tracker resubscribes
/// on close. Headers may arrive with gaps or from competing forks.
pub trait BlockFeed: Send + Sync + 'static {
    fn subscribe(
        &self,
        shutdown: CancellationToken,
    ) -> BoxFuture<'_, Result<mpsc::Receiver<BlockHeader>>>;

    fn header_by_number(&self, number: u64) -> BoxFuture<'_, Result<BlockHeader>>;

    fn logs<'a>(&'a self, filter: &'a LogFilter) -> BoxFuture<'a, Result<Vec<LogEvent>>>;
}
