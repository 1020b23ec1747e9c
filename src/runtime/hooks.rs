use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Outcome of a hook that can be interrupted by a shutdown signal.
pub(crate) enum HookDecision<T> {
    Finished(T),
    Cancelled,
}

/// Races `future` against `shutdown`; shutdown wins ties.
pub(crate) async fn run_cancellable<F>(future: F, shutdown: &CancellationToken) -> HookDecision<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => HookDecision::Cancelled,
        output = future => HookDecision::Finished(output),
    }
}
