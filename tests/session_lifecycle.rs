
use std::sync::Arc;
use std::time::Duration;

use kasgate::engine::Engine;
use kasgate::model::{EventSource, PaymentEvent, SessionStatus};
use kasgate::poller::RestPoller;
use kasgate::rpc::RpcClient;
use kasgate::store::Store;
use kasgate::watcher::ChainWatcher;
use kasgate::webhook::WebhookDispatcher;
use kaspa_consensus_core::network::{NetworkId, NetworkType};
use tokio::sync::mpsc;

/// Wires a full `Engine` with a real `ChainWatcher` but no live network
/// connections; `raw_tx` lets a test inject `PaymentEvent`s as if they came
/// from C3/C4.
async fn harness(store: Arc<Store>) -> (Arc<Engine>, mpsc::Sender<PaymentEvent>) {
    let (raw_tx, raw_rx) = mpsc::channel(64);
    let (session_tx, session_rx) = mpsc::channel(64);
    let rpc = Arc::new(RpcClient::new(NetworkId::new(NetworkType::Testnet), None, raw_tx.clone()));
    let poller = Arc::new(RestPoller::new("http://127.0.0.1:0", raw_tx.clone()));
    let watcher = Arc::new(ChainWatcher::new(rpc, poller, raw_rx, session_tx));
    let webhooks = Arc::new(WebhookDispatcher::new(Arc::clone(&store), 1, 8));
    let engine = Arc::new(Engine::new(store, fixtures::test_address_service(), Arc::clone(&watcher), webhooks, fixtures::test_config()));

    tokio::spawn(Arc::clone(&watcher).run());
    tokio::spawn(Arc::clone(&engine).run_event_loop(session_rx));
    (engine, raw_tx)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn happy_path_reaches_confirmed_at_required_confirmations() {
    let (store, _merchant) = fixtures::test_store_with_merchant("merchant-1", "http://127.0.0.1:0/hook");
    let (engine, raw_tx) = harness(Arc::clone(&store)).await;

    let session = engine.create_session("merchant-1", 100, 900, Some("order-1".into()), None).await.unwrap();
    assert_eq!(session.status, SessionStatus::Pending);

    raw_tx
        .send(PaymentEvent { address: session.address.clone(), tx_id: "tx-1".into(), amount_sompi: 100, confirmations: 0, source: EventSource::RestPoller, removed: false })
        .await
        .unwrap();
    settle().await;
    let confirming = engine.get_session(session.id).unwrap();
    assert_eq!(confirming.status, SessionStatus::Confirming);
    assert_eq!(confirming.tx_id.as_deref(), Some("tx-1"));

    raw_tx
        .send(PaymentEvent { address: session.address.clone(), tx_id: "tx-1".into(), amount_sompi: 100, confirmations: 3, source: EventSource::RestPoller, removed: false })
        .await
        .unwrap();
    settle().await;
    let confirmed = engine.get_session(session.id).unwrap();
    assert_eq!(confirmed.status, SessionStatus::Confirmed);
    assert!(confirmed.confirmed_at.is_some());
}

#[tokio::test]
async fn overpayment_is_accepted_and_underpayment_is_ignored() {
    let (store, _merchant) = fixtures::test_store_with_merchant("merchant-2", "http://127.0.0.1:0/hook");
    let (engine, raw_tx) = harness(Arc::clone(&store)).await;
    let session = engine.create_session("merchant-2", 1_000, 900, None, None).await.unwrap();

    raw_tx
        .send(PaymentEvent { address: session.address.clone(), tx_id: "tx-under".into(), amount_sompi: 999, confirmations: 0, source: EventSource::RestPoller, removed: false })
        .await
        .unwrap();
    settle().await;
    let still_pending = engine.get_session(session.id).unwrap();
    assert_eq!(still_pending.status, SessionStatus::Pending, "underpayment must not move the session forward");

    raw_tx
        .send(PaymentEvent { address: session.address.clone(), tx_id: "tx-over".into(), amount_sompi: 1_500, confirmations: 0, source: EventSource::RestPoller, removed: false })
        .await
        .unwrap();
    settle().await;
    let confirming = engine.get_session(session.id).unwrap();
    assert_eq!(confirming.status, SessionStatus::Confirming);
    assert_eq!(confirming.tx_id.as_deref(), Some("tx-over"));
}

#[tokio::test]
async fn reorg_reverts_a_confirming_session_back_to_pending() {
    let (store, _merchant) = fixtures::test_store_with_merchant("merchant-3", "http://127.0.0.1:0/hook");
    let (engine, raw_tx) = harness(Arc::clone(&store)).await;
    let session = engine.create_session("merchant-3", 100, 900, None, None).await.unwrap();

    raw_tx
        .send(PaymentEvent { address: session.address.clone(), tx_id: "tx-reorg".into(), amount_sompi: 100, confirmations: 0, source: EventSource::RestPoller, removed: false })
        .await
        .unwrap();
    settle().await;
    assert_eq!(engine.get_session(session.id).unwrap().status, SessionStatus::Confirming);

    raw_tx
        .send(PaymentEvent { address: session.address.clone(), tx_id: "tx-reorg".into(), amount_sompi: 100, confirmations: 1, source: EventSource::RestPoller, removed: true })
        .await
        .unwrap();
    settle().await;
    let reverted = engine.get_session(session.id).unwrap();
    assert_eq!(reverted.status, SessionStatus::Pending);
    assert!(reverted.tx_id.is_none());
    assert_eq!(reverted.confirmations, 0);
}

#[tokio::test]
async fn cancel_is_only_allowed_from_pending() {
    let (store, _merchant) = fixtures::test_store_with_merchant("merchant-4", "http://127.0.0.1:0/hook");
    let (engine, raw_tx) = harness(Arc::clone(&store)).await;
    let session = engine.create_session("merchant-4", 100, 900, None, None).await.unwrap();
    let cancelled = engine.cancel_session(session.id).await.unwrap();
    assert_eq!(cancelled.status, SessionStatus::Failed);

    let session2 = engine.create_session("merchant-4", 100, 900, None, None).await.unwrap();
    raw_tx
        .send(PaymentEvent { address: session2.address.clone(), tx_id: "tx-x".into(), amount_sompi: 100, confirmations: 0, source: EventSource::RestPoller, removed: false })
        .await
        .unwrap();
    settle().await;
    assert!(engine.cancel_session(session2.id).await.is_err());
}
