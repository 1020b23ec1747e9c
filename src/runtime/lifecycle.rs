//! Background tasks that live for one start/stop cycle of the node.

use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::{self, Telemetry};
use crate::scheduler::RunScheduler;
use anyhow::Error;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub(crate) struct LifecycleHandles {
    pub run_token: CancellationToken,
    fatal_handler: FatalErrorHandler,
    metrics_handle: Option<JoinHandle<()>>,
    ticker_handle: Option<JoinHandle<()>>,
}

pub(crate) struct LifecycleSpawnParams<'a> {
    pub shutdown_root: &'a CancellationToken,
    pub telemetry: Arc<Telemetry>,
    pub scheduler: Arc<RunScheduler>,
    pub metrics_interval: Duration,
    pub tick_interval: Duration,
}

impl LifecycleHandles {
    pub(crate) fn spawn(params: LifecycleSpawnParams<'_>) -> Self {
        let LifecycleSpawnParams {
            shutdown_root,
            telemetry,
            scheduler,
            metrics_interval,
            tick_interval,
        } = params;

        let run_token = shutdown_root.child_token();
        let fatal_handler = FatalErrorHandler::new(shutdown_root.clone(), run_token.clone());
        let metrics_handle =
            telemetry::spawn_metrics_reporter(telemetry, run_token.clone(), metrics_interval);
        let ticker_handle = spawn_scheduler_ticker(scheduler, tick_interval, run_token.clone());

        Self {
            run_token,
            fatal_handler,
            metrics_handle: Some(metrics_handle),
            ticker_handle: Some(ticker_handle),
        }
    }

    pub(crate) fn fatal_handler(&self) -> FatalErrorHandler {
        self.fatal_handler.clone()
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.fatal_handler.error()
    }

    /// Waits for the background tasks; `run_token` must already be cancelled.
    pub(crate) async fn shutdown(mut self) {
        if let Some(handle) = self.metrics_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }

        if let Some(handle) = self.ticker_handle.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "scheduler ticker task panicked");
            }
        }
    }
}

/// Drives time-based initiators (cron, run-at). Head-driven work happens in
/// the scheduler's head subscription, not here.
fn spawn_scheduler_ticker(
    scheduler: Arc<RunScheduler>,
    tick_interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match scheduler.tick(Utc::now()).await {
                        Ok(created) if !created.is_empty() => {
                            tracing::debug!(runs = created.len(), "time-based initiators fired");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!(error = %err, "scheduler tick failed"),
                    }
                }
            }
        }

        tracing::debug!("scheduler ticker stopped");
    })
}
