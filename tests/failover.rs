
use std::sync::Arc;
use std::time::Duration;

use kasgate::model::{EventSource, PaymentEvent};
use kasgate::poller::RestPoller;
use kasgate::rpc::RpcClient;
use kasgate::watcher::ChainWatcher;
use kaspa_consensus_core::network::{NetworkId, NetworkType};
use tokio::sync::mpsc;

fn make_watcher() -> (Arc<ChainWatcher>, mpsc::Sender<PaymentEvent>, mpsc::Receiver<PaymentEvent>) {
    let (raw_tx, raw_rx) = mpsc::channel(16);
    let (out_tx, out_rx) = mpsc::channel(16);
    let (rpc_events_tx, _rpc_events_rx) = mpsc::channel(16);
    let rpc = Arc::new(RpcClient::new(NetworkId::new(NetworkType::Testnet), None, rpc_events_tx));
    let poller = Arc::new(RestPoller::new("http://127.0.0.1:0", raw_tx.clone()));
    let watcher = Arc::new(ChainWatcher::new(rpc, poller, raw_rx, out_tx));
    (watcher, raw_tx, out_rx)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn a_fresh_event_passes_through_and_an_immediate_duplicate_is_suppressed() {
    let (watcher, raw_tx, mut out_rx) = make_watcher();
    let _run = tokio::spawn(Arc::clone(&watcher).run());

    let event = PaymentEvent { address: "kaspatest:q1".into(), tx_id: "tx1".into(), amount_sompi: 100, confirmations: 0, source: EventSource::RestPoller, removed: false };
    raw_tx.send(event.clone()).await.unwrap();
    settle().await;
    assert!(out_rx.try_recv().is_ok());

    raw_tx.send(event).await.unwrap();
    settle().await;
    // RPC is never connected in this harness, so this exercises the plain
    // 10-minute dedup window rather than the late-reconciliation path.
    assert!(out_rx.try_recv().is_err());
}

#[tokio::test]
async fn a_confirmation_count_bump_on_a_known_tx_is_forwarded_despite_dedup() {
    let (watcher, raw_tx, mut out_rx) = make_watcher();
    let _run = tokio::spawn(Arc::clone(&watcher).run());

    let base = PaymentEvent { address: "kaspatest:q2".into(), tx_id: "tx2".into(), amount_sompi: 100, confirmations: 0, source: EventSource::RestPoller, removed: false };
    raw_tx.send(base.clone()).await.unwrap();
    settle().await;
    assert!(out_rx.try_recv().is_ok());

    let bumped = PaymentEvent { confirmations: 2, ..base };
    raw_tx.send(bumped).await.unwrap();
    settle().await;
    assert!(out_rx.try_recv().is_ok());
}

#[tokio::test]
async fn distinct_addresses_never_suppress_each_other() {
    let (watcher, raw_tx, mut out_rx) = make_watcher();
    let _run = tokio::spawn(Arc::clone(&watcher).run());

    let a = PaymentEvent { address: "kaspatest:qa".into(), tx_id: "tx-a".into(), amount_sompi: 1, confirmations: 0, source: EventSource::RestPoller, removed: false };
    let b = PaymentEvent { address: "kaspatest:qb".into(), tx_id: "tx-b".into(), amount_sompi: 1, confirmations: 0, source: EventSource::RestPoller, removed: false };
    raw_tx.send(a).await.unwrap();
    raw_tx.send(b).await.unwrap();
    settle().await;
    assert!(out_rx.try_recv().is_ok());
    assert!(out_rx.try_recv().is_ok());
}

#[tokio::test]
async fn watch_and_unwatch_reach_both_the_rpc_subscription_set_and_the_poller() {
    let (watcher, _raw_tx, _out_rx) = make_watcher();
    watcher.watch_address("kaspatest:qwatched").await;
    watcher.unwatch_address("kaspatest:qwatched").await;
}
