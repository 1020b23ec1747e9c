use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use oraclenode::{
    FatalErrorHandler, HeadSubscriber, HeadTracker, HeadTrackerConfig, HeadTrackerError,
    NodeConfig, Telemetry,
};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::support::{
    helpers::{
        account, assert_is_contiguous, init_tracing, memory_store, node_with, wait_until,
        RecordingSubscriber,
    },
    mock_chain::MockChain,
};

const WAIT: Duration = Duration::from_secs(5);

fn tracker_for(
    chain: &MockChain,
    recorder: &Arc<RecordingSubscriber>,
    config: HeadTrackerConfig,
) -> (Arc<HeadTracker>, Arc<Telemetry>) {
    let telemetry = Arc::new(Telemetry::default());
    let subscribers: Vec<Arc<dyn HeadSubscriber>> = vec![recorder.clone()];
    let tracker = Arc::new(HeadTracker::new(
        Arc::new(chain.clone()),
        memory_store(),
        subscribers,
        config,
        telemetry.clone(),
    ));
    (tracker, telemetry)
}

fn is_reorg_too_deep(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<HeadTrackerError>(),
            Some(HeadTrackerError::ReorgTooDeep { .. })
        )
    })
}

#[tokio::test]
async fn skipped_heads_are_backfilled_in_order() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(10);
    let recorder = Arc::new(RecordingSubscriber::default());
    let (tracker, telemetry) = tracker_for(&chain, &recorder, HeadTrackerConfig::default());

    tracker.on_head(chain.header(1).expect("block 1")).await?;
    let backfilled = tracker.on_head(chain.header(5).expect("block 5")).await?;
    assert_eq!(backfilled.len(), 4);

    let stale = tracker.on_head(chain.header(3).expect("block 3")).await?;
    assert!(stale.is_empty());
    let repeated = tracker.on_head(chain.header(5).expect("block 5")).await?;
    assert!(repeated.is_empty());

    assert_eq!(recorder.numbers(), vec![1, 2, 3, 4, 5]);
    assert_eq!(telemetry.snapshot().heads_delivered, 5);
    assert_eq!(
        tracker.current_head().await.map(|head| head.hash),
        chain.header(5).map(|header| header.hash)
    );
    Ok(())
}

#[tokio::test]
async fn feed_reorg_is_delivered_as_increasing_heads() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(6);
    let recorder = Arc::new(RecordingSubscriber::default());
    let (tracker, telemetry) = tracker_for(&chain, &recorder, HeadTrackerConfig::default());

    let root = CancellationToken::new();
    let run = root.child_token();
    let fatal = FatalErrorHandler::new(root.clone(), run.clone());
    tracker.connect(fatal.clone(), &run).await?;
    wait_until("feed subscription", WAIT, || async { chain.subscriber_count() == 1 }).await?;

    for number in 1..=6 {
        chain.emit(chain.header(number).expect("canonical block")).await;
    }
    wait_until("head 6", WAIT, || async { recorder.numbers().last() == Some(&6) }).await?;

    let fork = chain.force_reorg(4, 3)?;
    let new_tip = fork.last().cloned().expect("fork has blocks");
    chain.emit(new_tip.clone()).await;
    wait_until("head 7", WAIT, || async { recorder.numbers().last() == Some(&7) }).await?;

    let numbers = recorder.numbers();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5, 6, 7]);
    assert_is_contiguous(&numbers);
    assert_eq!(recorder.last(), Some((7, new_tip.hash)));
    assert_eq!(telemetry.snapshot().reorgs, 1);
    assert!(!fatal.is_triggered());

    tracker.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn reorg_deeper_than_the_limit_is_fatal() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(6);
    let recorder = Arc::new(RecordingSubscriber::default());
    let config = HeadTrackerConfig {
        max_reorg_depth: 2,
        window_size: 8,
        ..HeadTrackerConfig::default()
    };
    let (tracker, _telemetry) = tracker_for(&chain, &recorder, config);

    let root = CancellationToken::new();
    let run = root.child_token();
    let fatal = FatalErrorHandler::new(root.clone(), run.clone());
    tracker.connect(fatal.clone(), &run).await?;
    wait_until("feed subscription", WAIT, || async { chain.subscriber_count() == 1 }).await?;

    for number in 1..=6 {
        chain.emit(chain.header(number).expect("canonical block")).await;
    }
    wait_until("head 6", WAIT, || async { recorder.numbers().last() == Some(&6) }).await?;

    let fork = chain.force_reorg(2, 5)?;
    chain.emit(fork.last().cloned().expect("fork has blocks")).await;

    timeout(WAIT, root.cancelled()).await?;
    assert!(fatal.is_triggered());
    let err = fatal.error().expect("fatal error captured");
    assert!(is_reorg_too_deep(&err), "unexpected fatal error: {err:#}");
    assert_eq!(recorder.numbers(), vec![1, 2, 3, 4, 5, 6]);

    tracker.disconnect().await?;
    Ok(())
}

#[tokio::test]
async fn connect_and_disconnect_are_idempotent() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(3);
    let recorder = Arc::new(RecordingSubscriber::default());
    let (tracker, _telemetry) = tracker_for(&chain, &recorder, HeadTrackerConfig::default());

    tracker.on_head(chain.header(2).expect("block 2")).await?;

    let root = CancellationToken::new();
    let fatal = FatalErrorHandler::new(root.clone(), root.child_token());
    tracker.connect(fatal.clone(), &root).await?;
    tracker.connect(fatal, &root).await?;
    wait_until("feed subscription", WAIT, || async { chain.subscriber_count() == 1 }).await?;

    assert!(tracker.is_connected());
    assert_eq!(recorder.connects(), vec![Some(2)]);
    assert_eq!(chain.subscriber_count(), 1);

    tracker.disconnect().await?;
    tracker.disconnect().await?;
    assert!(!tracker.is_connected());
    Ok(())
}

#[tokio::test]
async fn node_halts_and_reports_a_deep_reorg() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(6);
    let config = NodeConfig::builder()
        .rpc_url("http://127.0.0.1:1")
        .account(account())
        .max_reorg_depth(2)
        .head_window_size(8)
        .scheduler_tick_interval(Duration::from_secs(3600))
        .build()?;
    let mut node = node_with(config, &chain, memory_store());

    node.start().await?;
    node.start().await?;
    assert!(node.is_running());
    wait_until("feed subscription", WAIT, || async { chain.subscriber_count() == 1 }).await?;

    for number in 1..=6 {
        chain.emit(chain.header(number).expect("canonical block")).await;
    }
    let tracker = node.head_tracker().clone();
    wait_until("head 6", WAIT, || {
        let tracker = tracker.clone();
        async move { tracker.current_head().await.map(|head| head.number) == Some(6) }
    })
    .await?;

    let fork = chain.force_reorg(2, 5)?;
    chain.emit(fork.last().cloned().expect("fork has blocks")).await;

    timeout(WAIT, node.cancellation_token().cancelled()).await?;
    let err = node.stop().await.expect_err("stop reports the fatal error");
    assert!(is_reorg_too_deep(&err), "unexpected fatal error: {err:#}");
    assert!(!node.is_running());
    assert_eq!(
        node.store().last_head().await?.map(|head| head.number),
        Some(6)
    );
    Ok(())
}
