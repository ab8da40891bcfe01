use std::sync::Arc;
use std::time::Duration;

use bitcoin::OutPoint;

use crate::arbiter::{BreachArbiter, RetributionStore};
use crate::channel::{ChannelCloseSummary, ChannelStateStore, CloseType, LinkCloseReason, UnilateralCloseSummary};
use crate::store::Store;
use crate::test_utils::*;
use crate::wallet::StaticFeeEstimator;

struct ArbiterHarness {
    arbiter: Arc<BreachArbiter<Store>>,
    notifier: Arc<MockNotifier>,
    wallet: Arc<MockWallet>,
    switch: Arc<MockSwitch>,
    factory: Arc<MockChannelFactory>,
    store: Store,
    _dir: TempDir,
}

fn new_harness(prefix: &str) -> ArbiterHarness {
    init_tracing();

    let dir = TempDir::new(prefix);
    let store = Store::new(&dir).expect("create store");
    let notifier = MockNotifier::new(100);
    let wallet = MockWallet::new();
    let switch = MockSwitch::new();
    let factory = MockChannelFactory::new();

    let arbiter = Arc::new(BreachArbiter::new(
        notifier.clone(),
        wallet.clone(),
        MockSigner::new(),
        Arc::new(StaticFeeEstimator::default()),
        switch.clone(),
        factory.clone(),
        store.clone(),
    ));

    ArbiterHarness {
        arbiter,
        notifier,
        wallet,
        switch,
        factory,
        store,
        _dir: dir,
    }
}

fn retribution_count(store: &Store) -> usize {
    let mut count = 0;
    store
        .for_all_retributions(&mut |_| {
            count += 1;
            Ok(())
        })
        .expect("iterate retributions");
    count
}

fn close_summary(
    chan_point: OutPoint,
    closing_txid: bitcoin::Txid,
    close_type: CloseType,
    time_locked_balance: u64,
) -> ChannelCloseSummary {
    ChannelCloseSummary {
        chan_point,
        closing_txid,
        remote_pub: gen_rand_pubkey(),
        capacity: 100_000,
        settled_balance: 40_000,
        close_type,
        is_pending: true,
        time_locked_balance,
    }
}

#[tokio::test]
async fn test_cold_breach_end_to_end() {
    let h = new_harness("vigil-cold-breach");
    h.arbiter.clone().start().await.expect("start");

    let chan_point = gen_rand_outpoint();
    let (watched, channel) = mock_watched_channel(chan_point, Some(h.store.clone()));
    h.arbiter.new_contracts().send(watched).await.unwrap();

    let report = gen_breach_report(20_000, 60_000);
    let breach_txid = report.breach_txid;
    let local_outpoint = report.local_outpoint;
    let remote_outpoint = report.remote_outpoint;
    channel.breach_tx.send(report).await.unwrap();

    // The breach is checkpointed, the link torn down, and the channel
    // state deleted before anything happens on-chain.
    wait_until(|| retribution_count(&h.store) == 1, "retribution persisted").await;
    wait_until(
        || !channel.contract.deleted_summaries().is_empty(),
        "close summary written",
    )
    .await;
    assert_eq!(
        h.switch.closed_links(),
        vec![(chan_point, LinkCloseReason::Breach)]
    );
    let summary = h.store.get_closed_channel(&chan_point).expect("close summary");
    assert_eq!(summary.close_type, CloseType::Breach);
    assert!(summary.is_pending);

    // Confirm the breach transaction; justice follows.
    wait_until(
        || h.notifier.subscription_count(&breach_txid) == 1,
        "breach conf subscription",
    )
    .await;
    h.notifier.confirm(&breach_txid, 101);

    wait_until(|| h.wallet.published_count() == 1, "justice tx published").await;
    let justice_tx = h.wallet.published().remove(0);
    assert_eq!(justice_tx.input.len(), 2);
    assert_eq!(justice_tx.input[0].previous_output, local_outpoint);
    assert_eq!(justice_tx.input[1].previous_output, remote_outpoint);
    assert_eq!(justice_tx.output.len(), 1);
    assert_eq!(justice_tx.output[0].value.to_sat(), 75_000);
    assert_eq!(justice_tx.output[0].script_pubkey, h.wallet.sweep_script());

    // Confirm the justice transaction; the record is gone and the channel
    // fully closed, in that order of observable effects.
    let justice_txid = justice_tx.compute_txid();
    wait_until(
        || h.notifier.subscription_count(&justice_txid) == 1,
        "justice conf subscription",
    )
    .await;
    h.notifier.confirm(&justice_txid, 102);

    wait_until(|| retribution_count(&h.store) == 0, "retribution removed").await;
    let summary = h.store.get_closed_channel(&chan_point).expect("close summary");
    assert!(!summary.is_pending);

    h.arbiter.stop().await;
}

#[tokio::test]
async fn test_restart_promotes_breached_channel() {
    let h = new_harness("vigil-restart");

    // A breach made it to disk, but the process died before the channel
    // was closed in the channel database.
    let chan_point = gen_rand_outpoint();
    h.store
        .put_open_channel(&gen_open_channel(chan_point))
        .unwrap();
    let ret = gen_retribution_info(chan_point, 0);
    let breach_txid = ret.commit_hash;
    let self_amount = ret.self_output.amount;
    let revoked_amount = ret.revoked_output.amount;
    h.store.add_retribution(&ret).unwrap();

    h.arbiter.clone().start().await.expect("start");

    // Reconciliation promoted the channel to breached-and-closed.
    assert_eq!(
        h.switch.closed_links(),
        vec![(chan_point, LinkCloseReason::Breach)]
    );
    assert!(h.store.get_open_channel(&chan_point).is_none());
    let summary = h.store.get_closed_channel(&chan_point).expect("close summary");
    assert_eq!(summary.close_type, CloseType::Breach);
    assert!(summary.is_pending);

    // An executor is live, waiting on the breach confirmation.
    assert_eq!(h.notifier.subscription_count(&breach_txid), 1);

    // Drive it to completion.
    h.notifier.confirm(&breach_txid, 101);
    wait_until(|| h.wallet.published_count() == 1, "justice tx published").await;
    let justice_tx = h.wallet.published().remove(0);
    assert_eq!(
        justice_tx.output[0].value.to_sat(),
        self_amount + revoked_amount - 5_000
    );

    let justice_txid = justice_tx.compute_txid();
    wait_until(
        || h.notifier.subscription_count(&justice_txid) == 1,
        "justice conf subscription",
    )
    .await;
    h.notifier.confirm(&justice_txid, 102);

    wait_until(|| retribution_count(&h.store) == 0, "retribution removed").await;
    wait_until(
        || {
            h.store
                .get_closed_channel(&chan_point)
                .is_some_and(|summary| !summary.is_pending)
        },
        "channel fully closed",
    )
    .await;

    h.arbiter.stop().await;
}

#[tokio::test]
async fn test_settle_races_breach() {
    let h = new_harness("vigil-settle-race");
    h.arbiter.clone().start().await.expect("start");

    let chan_point = gen_rand_outpoint();
    let (watched, channel) = mock_watched_channel(chan_point, Some(h.store.clone()));
    h.arbiter.new_contracts().send(watched).await.unwrap();

    let settled_tx = h.arbiter.settled_contracts();
    let breach_tx = channel.breach_tx.clone();
    let report = gen_breach_report(20_000, 60_000);

    let settle = tokio::spawn(async move { settled_tx.send(chan_point).await });
    let breach = tokio::spawn(async move { breach_tx.send(report).await });
    settle.await.unwrap().unwrap();
    breach.await.unwrap().unwrap();

    // Exactly one terminal branch may act, never both.
    wait_until(
        || retribution_count(&h.store) == 1 || channel.contract.is_stopped(),
        "one terminal branch resolved",
    )
    .await;
    if channel.contract.is_stopped() {
        // Settle won: the breach was never acted upon.
        assert_eq!(retribution_count(&h.store), 0);
        assert!(channel.contract.deleted_summaries().is_empty());
    } else {
        // Breach won: checkpoint plus channel-state deletion, no stop.
        wait_until(
            || channel.contract.deleted_summaries().len() == 1,
            "channel state deleted",
        )
        .await;
        assert_eq!(retribution_count(&h.store), 1);
    }

    h.arbiter.stop().await;
}

#[tokio::test]
async fn test_stale_contract_replaced() {
    let h = new_harness("vigil-stale-contract");
    h.arbiter.clone().start().await.expect("start");

    let chan_point = gen_rand_outpoint();
    let (watched1, channel1) = mock_watched_channel(chan_point, None);
    let (watched2, channel2) = mock_watched_channel(chan_point, Some(h.store.clone()));

    h.arbiter.new_contracts().send(watched1).await.unwrap();
    h.arbiter.new_contracts().send(watched2).await.unwrap();

    // The first observer sees its settle signal close and stops its stale
    // contract.
    wait_until(|| channel1.contract.is_stopped(), "stale observer cancelled").await;

    // Only the second observer is live.
    channel2
        .breach_tx
        .send(gen_breach_report(20_000, 60_000))
        .await
        .unwrap();
    wait_until(|| retribution_count(&h.store) == 1, "breach acted on").await;
    assert_eq!(channel2.contract.deleted_summaries().len(), 1);
    assert!(channel1.contract.deleted_summaries().is_empty());

    h.arbiter.stop().await;
}

#[tokio::test]
async fn test_notifier_shutdown_exits_executor() {
    let h = new_harness("vigil-notifier-shutdown");

    let chan_point = gen_rand_outpoint();
    let ret = gen_retribution_info(chan_point, 0);
    let breach_txid = ret.commit_hash;
    h.store.add_retribution(&ret).unwrap();

    h.arbiter.clone().start().await.expect("start");
    assert_eq!(h.notifier.subscription_count(&breach_txid), 1);

    // The notifier goes away while the executor waits on the breach
    // confirmation: the executor must exit without publishing and without
    // touching the record.
    h.notifier.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.wallet.published_count(), 0);
    assert_eq!(retribution_count(&h.store), 1);

    // Stop returns promptly since the executor has already exited.
    h.arbiter.stop().await;
}

#[tokio::test]
async fn test_small_output_sweep_skipped_channel_still_closed() {
    let h = new_harness("vigil-small-sweep");
    h.arbiter.clone().start().await.expect("start");

    let chan_point = gen_rand_outpoint();
    let (watched, channel) = mock_watched_channel(chan_point, Some(h.store.clone()));
    h.arbiter.new_contracts().send(watched).await.unwrap();

    let spender_txid = gen_rand_txid();
    // The close summary the channel state machine records when it observes
    // the unilateral close.
    h.store
        .close_channel(&close_summary(
            chan_point,
            spender_txid,
            CloseType::ForceClose,
            0,
        ))
        .unwrap();

    channel
        .unilateral_tx
        .send(UnilateralCloseSummary {
            spender_txid,
            spending_height: 100,
            self_outpoint: Some(gen_rand_outpoint()),
            self_output_sign_desc: Some(gen_sign_descriptor(4_999, true)),
        })
        .await
        .unwrap();

    wait_until(
        || h.notifier.subscription_count(&spender_txid) == 1,
        "spending tx subscription",
    )
    .await;
    h.notifier.confirm(&spender_txid, 101);

    // The dust output is left behind, but the channel still resolves.
    wait_until(
        || {
            h.store
                .get_closed_channel(&chan_point)
                .is_some_and(|summary| !summary.is_pending)
        },
        "channel fully closed",
    )
    .await;
    assert_eq!(h.wallet.published_count(), 0);

    h.arbiter.stop().await;
}

#[tokio::test]
async fn test_pending_closes_resolved_on_start() {
    let h = new_harness("vigil-pending-close");

    let coop_point = gen_rand_outpoint();
    let coop_txid = gen_rand_txid();
    h.store
        .close_channel(&close_summary(coop_point, coop_txid, CloseType::Cooperative, 0))
        .unwrap();

    // A force close with a time-locked balance belongs to the nursery.
    let nursery_point = gen_rand_outpoint();
    let nursery_txid = gen_rand_txid();
    h.store
        .close_channel(&close_summary(
            nursery_point,
            nursery_txid,
            CloseType::ForceClose,
            10_000,
        ))
        .unwrap();

    h.arbiter.clone().start().await.expect("start");

    assert_eq!(h.notifier.subscription_count(&coop_txid), 1);
    assert_eq!(h.notifier.subscription_count(&nursery_txid), 0);

    h.notifier.confirm(&coop_txid, 101);
    wait_until(
        || {
            h.store
                .get_closed_channel(&coop_point)
                .is_some_and(|summary| !summary.is_pending)
        },
        "cooperative close resolved",
    )
    .await;

    h.arbiter.stop().await;
}

#[tokio::test]
async fn test_startup_watches_channels_from_factory() {
    let h = new_harness("vigil-startup-watch");

    // One clean open channel to watch on startup.
    let chan_point = gen_rand_outpoint();
    h.store
        .put_open_channel(&gen_open_channel(chan_point))
        .unwrap();
    let (watched, channel) = mock_watched_channel(chan_point, Some(h.store.clone()));
    h.factory.add_channel(watched);

    h.arbiter.clone().start().await.expect("start");

    // The observer built from the persisted stub reacts to a breach.
    channel
        .breach_tx
        .send(gen_breach_report(20_000, 60_000))
        .await
        .unwrap();
    wait_until(|| retribution_count(&h.store) == 1, "breach acted on").await;

    h.arbiter.stop().await;
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let h = new_harness("vigil-idempotent");

    h.arbiter.clone().start().await.expect("start");
    h.arbiter.clone().start().await.expect("second start is a no-op");

    let chan_point = gen_rand_outpoint();
    let (watched, _channel) = mock_watched_channel(chan_point, None);
    h.arbiter.new_contracts().send(watched).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.arbiter.stop().await;
    h.arbiter.stop().await;
}
