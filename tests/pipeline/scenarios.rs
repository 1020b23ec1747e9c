use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::future::{join_all, BoxFuture};
use oraclenode::models::job::run_log_topic;
use oraclenode::models::{NewTx, SignedTx, UnsignedTx};
use oraclenode::{
    ConfirmationState, ExecutorRegistry, InitiatorKind, JobSpec, NodeComponents, OracleNode,
    RunStatus, TaskContext, TaskExecutor, TaskOutcome, TaskSpec, Telemetry, TxId, TxManager,
    TxManagerConfig, TxSigner,
};
use serde_json::{json, Value};
use tokio::time::{sleep, timeout};

use crate::support::{
    helpers::{
        account, gwei, init_tracing, load_run, memory_store, node_config, node_with,
        oracle_contract, wait_for_run, wait_for_run_status, wait_until, FakeSigner,
    },
    mock_chain::MockChain,
};

const WAIT: Duration = Duration::from_secs(5);

async fn deliver(node: &OracleNode, chain: &MockChain, number: u64) -> Result<()> {
    let header = chain
        .header(number)
        .with_context(|| format!("mock chain has no block {number}"))?;
    node.head_tracker().on_head(header).await?;
    Ok(())
}

/// Refuses to sign until opened, counting every request.
#[derive(Default)]
struct LockedKeystore {
    open: AtomicBool,
    requests: AtomicUsize,
}

impl TxSigner for LockedKeystore {
    fn sign<'a>(&'a self, tx: &'a UnsignedTx) -> BoxFuture<'a, Result<SignedTx>> {
        Box::pin(async move {
            let open = self.open.load(Ordering::SeqCst);
            self.requests.fetch_add(1, Ordering::SeqCst);
            if !open {
                bail!("keystore locked");
            }
            FakeSigner.sign(tx).await
        })
    }
}

/// A step that takes its time, like a slow external adapter.
struct Sluggish(Duration);

impl TaskExecutor for Sluggish {
    fn run<'a>(&'a self, ctx: &'a TaskContext) -> BoxFuture<'a, Result<TaskOutcome>> {
        Box::pin(async move {
            sleep(self.0).await;
            Ok(TaskOutcome::Completed(ctx.input.clone()))
        })
    }
}

fn eth_tx_task(confirmations: u64) -> TaskSpec {
    TaskSpec::new(
        "ethtx",
        json!({
            "address": oracle_contract(),
            "functionSelector": "0x12345678",
        }),
    )
    .with_confirmations(confirmations)
}

#[tokio::test]
async fn run_at_write_completes_once_deep_enough() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(6);
    let node = node_with(node_config()?, &chain, memory_store());
    deliver(&node, &chain, 1).await?;

    let job = JobSpec::new(
        vec![InitiatorKind::RunAt {
            time: Utc::now() - chrono::Duration::seconds(1),
        }],
        vec![eth_tx_task(3)],
    )?;
    let job_id = job.id;
    node.scheduler().add_job(job, Some(1)).await?;

    let created = node.scheduler().tick(Utc::now()).await?;
    assert_eq!(created.len(), 1);
    let run_id = created[0];

    let run = load_run(&node, run_id).await?;
    assert_eq!(run.status, RunStatus::PendingConfirmations);
    let output = &run.task_runs[0].result.as_ref().expect("step result").output;
    assert_eq!(output["sentAt"], json!(1));
    assert_eq!(chain.sent().len(), 1);

    chain.mine_sent(2)?;
    deliver(&node, &chain, 2).await?;
    deliver(&node, &chain, 3).await?;

    let run = wait_for_run(&node, run_id, "two confirmations", WAIT, |run| {
        run.task_runs[0].confirmations == 2
    })
    .await?;
    assert_eq!(run.status, RunStatus::PendingConfirmations);

    deliver(&node, &chain, 4).await?;
    let run = wait_for_run_status(&node, run_id, RunStatus::Completed, WAIT).await?;
    assert_eq!(run.task_runs[0].confirmations, 3);
    assert!(run.completed_at.is_some());

    let tx_id = run.task_runs[0].tx_id.expect("write step records its tx");
    assert!(node.tx_manager().find_tx(tx_id).await?.confirmed);
    assert_eq!(node.store().runs_for_job(job_id).await?.len(), 1);
    assert_eq!(node.telemetry().snapshot().runs_completed, 1);
    Ok(())
}

#[tokio::test]
async fn web_pipeline_feeds_each_output_forward() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(2);
    let node = node_with(node_config()?, &chain, memory_store());

    let job = JobSpec::new(
        vec![InitiatorKind::Web],
        vec![
            TaskSpec::new("jsonparse", json!({ "path": "data.price" })),
            TaskSpec::new("multiply", json!({ "times": 100 })),
            TaskSpec::new("noop", Value::Null),
        ],
    )?;
    let job_id = job.id;
    node.scheduler().add_job(job, None).await?;

    let run = node
        .scheduler()
        .create_web_run(job_id, json!({ "data": { "price": "12.5" } }))
        .await?;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.result.expect("run result").output, json!(1250));

    let failed = node
        .scheduler()
        .create_web_run(job_id, json!({ "data": {} }))
        .await?;
    assert_eq!(failed.status, RunStatus::Errored);
    assert_eq!(failed.task_runs[0].status, RunStatus::Errored);
    assert_eq!(failed.task_runs[1].status, RunStatus::Unstarted);
    assert_eq!(failed.task_runs[2].status, RunStatus::Unstarted);
    let error = failed.result.and_then(|result| result.error).expect("error message");
    assert!(error.contains("data.price"), "unexpected error: {error}");
    Ok(())
}

#[tokio::test]
async fn run_at_does_not_fire_again_after_restart() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(2);
    let store = memory_store();

    let first = node_with(node_config()?, &chain, store.clone());
    deliver(&first, &chain, 1).await?;
    let job = JobSpec::new(
        vec![InitiatorKind::RunAt {
            time: Utc::now() - chrono::Duration::seconds(5),
        }],
        vec![TaskSpec::new("noop", Value::Null)],
    )?;
    let job_id = job.id;
    first.scheduler().add_job(job, Some(1)).await?;
    assert_eq!(first.scheduler().tick(Utc::now()).await?.len(), 1);
    drop(first);

    let config = oraclenode::NodeConfig::builder()
        .rpc_url("http://127.0.0.1:1")
        .account(account())
        .scheduler_tick_interval(Duration::from_millis(10))
        .build()?;
    let mut second = node_with(config, &chain, store.clone());
    second.start().await?;
    sleep(Duration::from_millis(100)).await;
    assert!(second.scheduler().tick(Utc::now()).await?.is_empty());
    assert!(second.scheduler().jobs().is_empty());
    second.stop().await?;

    let runs = store.runs_for_job(job_id).await?;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Completed);
    Ok(())
}

#[tokio::test]
async fn run_log_waits_for_incoming_confirmations() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(6);
    let node = node_with(node_config()?, &chain, memory_store());
    deliver(&node, &chain, 1).await?;

    let job = JobSpec::new(
        vec![InitiatorKind::RunLog {
            address: Some(oracle_contract()),
        }],
        vec![TaskSpec::new("noop", Value::Null).with_confirmations(2)],
    )?;
    let job_id = job.id;
    chain.add_log(oracle_contract(), vec![run_log_topic(), job_id.as_topic()], 2)?;
    // Right contract, wrong job.
    chain.add_log(
        oracle_contract(),
        vec![run_log_topic(), oraclenode::JobId::new().as_topic()],
        2,
    )?;
    node.scheduler().add_job(job, Some(1)).await?;

    deliver(&node, &chain, 2).await?;
    let runs = node.store().runs_for_job(job_id).await?;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].creation_height, Some(2));
    wait_for_run_status(&node, runs[0].id, RunStatus::PendingConfirmations, WAIT).await?;

    deliver(&node, &chain, 3).await?;
    let run = wait_for_run(&node, runs[0].id, "one confirmation", WAIT, |run| {
        run.task_runs[0].confirmations == 1
    })
    .await?;
    assert_eq!(run.status, RunStatus::PendingConfirmations);

    deliver(&node, &chain, 4).await?;
    let run = wait_for_run_status(&node, runs[0].id, RunStatus::Completed, WAIT).await?;
    assert_eq!(run.task_runs[0].confirmations, 2);
    assert_eq!(run.result.expect("run result").output["blockNumber"], json!(2));

    deliver(&node, &chain, 5).await?;
    assert_eq!(node.store().runs_for_job(job_id).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn stalled_write_is_bumped_with_the_same_nonce() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(6);
    let config = oraclenode::NodeConfig::builder()
        .rpc_url("http://127.0.0.1:1")
        .account(account())
        .gas_price_default(gwei(20))
        .gas_bump_threshold(2)
        .build()?;
    let node = node_with(config, &chain, memory_store());
    deliver(&node, &chain, 1).await?;

    let job = JobSpec::new(vec![InitiatorKind::Web], vec![eth_tx_task(1)])?;
    let job_id = job.id;
    node.scheduler().add_job(job, Some(1)).await?;
    let run = node.scheduler().create_web_run(job_id, json!(42)).await?;
    let tx_id = run.task_runs[0].tx_id.expect("write step records its tx");

    deliver(&node, &chain, 2).await?;
    assert_eq!(node.store().attempts_for(tx_id).await?.len(), 1);

    deliver(&node, &chain, 3).await?;
    let store = node.store().clone();
    wait_until("gas bump", WAIT, || {
        let store = store.clone();
        async move { store.attempts_for(tx_id).await.map(|a| a.len()).unwrap_or(0) == 2 }
    })
    .await?;
    let attempts = node.store().attempts_for(tx_id).await?;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].gas_price, gwei(20));
    assert_eq!(attempts[1].gas_price, gwei(25));
    assert_eq!(attempts[1].sent_at, 3);
    assert_eq!(chain.sent(), vec![attempts[0].hash, attempts[1].hash]);

    let tx = node.tx_manager().find_tx(tx_id).await?;
    assert_eq!(tx.nonce, Some(0));
    assert_eq!(tx.active_attempt, Some(attempts[1].hash));

    chain.mine(attempts[1].hash, 4, true)?;
    deliver(&node, &chain, 4).await?;
    wait_for_run_status(&node, run.id, RunStatus::Completed, WAIT).await?;
    assert_eq!(node.telemetry().snapshot().gas_bumps, 1);
    Ok(())
}

#[tokio::test]
async fn reorg_that_drops_the_receipt_keeps_the_step_pending() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(3);
    let node = node_with(node_config()?, &chain, memory_store());
    deliver(&node, &chain, 1).await?;

    let job = JobSpec::new(vec![InitiatorKind::Web], vec![eth_tx_task(3)])?;
    let job_id = job.id;
    node.scheduler().add_job(job, Some(1)).await?;
    let run = node.scheduler().create_web_run(job_id, json!("0x2a")).await?;
    let tx_id = run.task_runs[0].tx_id.expect("write step records its tx");
    let hash = chain.mine_sent(2)?[0];

    deliver(&node, &chain, 2).await?;
    deliver(&node, &chain, 3).await?;
    wait_for_run(&node, run.id, "two confirmations", WAIT, |run| {
        run.task_runs[0].confirmations == 2
    })
    .await?;

    let fork = chain.force_reorg(1, 3)?;
    let tip = fork.last().cloned().expect("fork has blocks");
    let delivered = node.head_tracker().on_head(tip).await?;
    assert_eq!(delivered.iter().map(|head| head.number).collect::<Vec<_>>(), vec![4]);

    let pending = load_run(&node, run.id).await?;
    assert_eq!(pending.status, RunStatus::PendingConfirmations);
    assert_eq!(pending.task_runs[0].confirmations, 2);
    assert!(!node.tx_manager().find_tx(tx_id).await?.confirmed);

    chain.extend(1);
    chain.mine(hash, 5, true)?;
    deliver(&node, &chain, 5).await?;
    wait_for_run_status(&node, run.id, RunStatus::Completed, WAIT).await?;
    assert_eq!(node.telemetry().snapshot().reorgs, 1);
    Ok(())
}

#[tokio::test]
async fn confirmed_transaction_reverts_to_pending_when_orphaned() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(3);
    let store = memory_store();
    let txm = TxManager::new(
        store.clone(),
        Arc::new(chain.clone()),
        Arc::new(FakeSigner),
        TxManagerConfig::default(),
        Arc::new(Telemetry::default()),
    );

    let tx = txm
        .create_tx(NewTx {
            from: account(),
            to: oracle_contract(),
            data: Default::default(),
            value: Default::default(),
            gas_limit: 21_000,
        })
        .await?;
    txm.add_attempt(tx.id, gwei(20), 1).await?;
    chain.mine_sent(2)?;

    match txm.check_confirmation(tx.id, 3, 1).await? {
        ConfirmationState::Confirmed { confirmations, .. } => assert_eq!(confirmations, 2),
        other => panic!("expected confirmation, got {other:?}"),
    }
    assert!(txm.find_tx(tx.id).await?.confirmed);

    chain.force_reorg(1, 3)?;
    assert_eq!(
        txm.check_confirmation(tx.id, 4, 1).await?,
        ConfirmationState::Pending { confirmations: 0 }
    );
    assert!(!txm.find_tx(tx.id).await?.confirmed);
    assert!(store
        .attempts_for(tx.id)
        .await?
        .iter()
        .all(|attempt| !attempt.confirmed));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_take_contiguous_nonces() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(2);
    chain.set_pending_nonce(account(), 5);
    let node = node_with(node_config()?, &chain, memory_store());
    deliver(&node, &chain, 1).await?;

    let job = JobSpec::new(vec![InitiatorKind::Web], vec![eth_tx_task(1)])?;
    let job_id = job.id;
    node.scheduler().add_job(job, Some(1)).await?;

    let scheduler = node.scheduler();
    let runs = join_all((0..10u64).map(|value| scheduler.create_web_run(job_id, json!(value)))).await;

    let mut nonces = Vec::new();
    for run in runs {
        let run = run?;
        let tx_id = run.task_runs[0].tx_id.expect("write step records its tx");
        nonces.push(node.tx_manager().find_tx(tx_id).await?.nonce.expect("nonce assigned"));
    }
    nonces.sort_unstable();
    assert_eq!(nonces, (5..15).collect::<Vec<u64>>());
    assert_eq!(node.tx_manager().get_last_nonce(account()).await?, Some(14));
    Ok(())
}

#[tokio::test]
async fn run_log_mined_again_in_a_replacement_block_starts_one_run() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(3);
    let node = node_with(node_config()?, &chain, memory_store());
    deliver(&node, &chain, 1).await?;

    let job = JobSpec::new(
        vec![InitiatorKind::RunLog {
            address: Some(oracle_contract()),
        }],
        vec![TaskSpec::new("noop", Value::Null)],
    )?;
    let job_id = job.id;
    let topics = vec![run_log_topic(), job_id.as_topic()];
    node.scheduler().add_job(job, Some(1)).await?;

    let original = chain.add_log(oracle_contract(), topics.clone(), 2)?;
    deliver(&node, &chain, 2).await?;
    deliver(&node, &chain, 3).await?;
    assert_eq!(node.store().runs_for_job(job_id).await?.len(), 1);

    // Blocks 2 and 3 are replaced. The first request lands in 2' again and a
    // second one appears in 3', both below the height already scanned.
    let fork = chain.force_reorg(1, 3)?;
    chain.remine_log(&original, 2)?;
    chain.add_log(oracle_contract(), topics, 3)?;
    let tip = fork.last().cloned().expect("fork has blocks");
    let delivered = node.head_tracker().on_head(tip).await?;
    assert_eq!(delivered.iter().map(|head| head.number).collect::<Vec<_>>(), vec![4]);
    assert_eq!(delivered[0].reorg_ancestor, Some(1));

    let mut runs = node.store().runs_for_job(job_id).await?;
    runs.sort_by_key(|run| run.creation_height);
    assert_eq!(
        runs.iter().map(|run| run.creation_height).collect::<Vec<_>>(),
        vec![Some(2), Some(3)]
    );
    for run in &runs {
        wait_for_run_status(&node, run.id, RunStatus::Completed, WAIT).await?;
    }

    chain.extend(1);
    deliver(&node, &chain, 5).await?;
    assert_eq!(node.store().runs_for_job(job_id).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn write_that_cannot_be_signed_leaves_no_transaction_behind() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(4);
    let keystore = Arc::new(LockedKeystore::default());
    let node = OracleNode::with_components(
        node_config()?,
        NodeComponents {
            store: memory_store(),
            feed: Arc::new(chain.clone()),
            chain: Arc::new(chain.clone()),
            signer: keystore.clone(),
            executors: ExecutorRegistry::new(),
        },
    );
    deliver(&node, &chain, 1).await?;

    let job = JobSpec::new(vec![InitiatorKind::Web], vec![eth_tx_task(1)])?;
    let job_id = job.id;
    node.scheduler().add_job(job, Some(1)).await?;
    let run = node.scheduler().create_web_run(job_id, json!(7)).await?;
    assert_eq!(run.status, RunStatus::InProgress);
    assert_eq!(run.task_runs[0].tx_id, None);

    deliver(&node, &chain, 2).await?;
    deliver(&node, &chain, 3).await?;
    wait_until("signing retries", WAIT, || async {
        keystore.requests.load(Ordering::SeqCst) >= 3
    })
    .await?;
    assert_eq!(node.store().find_tx(TxId(1)).await?, None);
    assert_eq!(node.tx_manager().get_last_nonce(account()).await?, None);
    assert!(chain.sent().is_empty());

    keystore.open.store(true, Ordering::SeqCst);
    deliver(&node, &chain, 4).await?;
    let run = wait_for_run_status(&node, run.id, RunStatus::PendingConfirmations, WAIT).await?;
    let tx_id = run.task_runs[0].tx_id.expect("write step records its tx");
    assert_eq!(tx_id, TxId(1));

    let tx = node.tx_manager().find_tx(tx_id).await?;
    assert_eq!(tx.nonce, Some(0));
    assert!(tx.data.starts_with(&[0x12, 0x34, 0x56, 0x78]));
    let attempts = node.store().attempts_for(tx_id).await?;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].sent_at, 4);
    assert_eq!(tx.active_attempt, Some(attempts[0].hash));
    assert_eq!(chain.sent(), vec![attempts[0].hash]);
    Ok(())
}

#[tokio::test]
async fn slow_step_does_not_stall_the_head_tracker() -> Result<()> {
    init_tracing();
    let chain = MockChain::new(6);
    let mut executors = ExecutorRegistry::new();
    executors.register("sluggish", Arc::new(Sluggish(Duration::from_secs(2))));
    let node = OracleNode::with_components(
        node_config()?,
        NodeComponents {
            store: memory_store(),
            feed: Arc::new(chain.clone()),
            chain: Arc::new(chain.clone()),
            signer: Arc::new(FakeSigner),
            executors,
        },
    );
    deliver(&node, &chain, 1).await?;

    let job = JobSpec::new(
        vec![InitiatorKind::RunLog {
            address: Some(oracle_contract()),
        }],
        vec![TaskSpec::new("sluggish", Value::Null)],
    )?;
    let job_id = job.id;
    chain.add_log(oracle_contract(), vec![run_log_topic(), job_id.as_topic()], 2)?;
    node.scheduler().add_job(job, Some(1)).await?;

    let quick = Duration::from_millis(500);
    timeout(quick, deliver(&node, &chain, 2)).await??;
    let run_id = node.store().runs_for_job(job_id).await?[0].id;
    wait_for_run_status(&node, run_id, RunStatus::InProgress, WAIT).await?;

    for number in 3..=6 {
        timeout(quick, deliver(&node, &chain, number)).await??;
        let current = timeout(quick, node.head_tracker().current_head()).await?;
        assert_eq!(current.map(|head| head.number), Some(number));
    }
    assert_eq!(load_run(&node, run_id).await?.status, RunStatus::InProgress);

    wait_for_run_status(&node, run_id, RunStatus::Completed, WAIT).await?;
    Ok(())
}
