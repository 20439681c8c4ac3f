
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use hmac::{Hmac, Mac};
use kasgate::model::{Merchant, Session, SessionStatus, WebhookEventKind, WebhookLog};
use kasgate::store::Store;
use kasgate::webhook::{build_payload, WebhookDispatcher};
use sha2::Sha256;
use tokio::net::TcpListener;

#[derive(Clone)]
struct AppState {
    attempts: Arc<AtomicUsize>,
    secret: Vec<u8>,
    fail_first_n: usize,
}

async fn handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> StatusCode {
    let mut mac = Hmac::<Sha256>::new_from_slice(&state.secret).unwrap();
    mac.update(&body);
    let expected = hex::encode(mac.finalize().into_bytes());
    let got = headers.get("X-KasGate-Signature").unwrap().to_str().unwrap();
    assert_eq!(got, expected, "webhook signature must match HMAC-SHA256 of the raw body");
    assert!(headers.get("X-KasGate-Event").is_some());
    assert!(headers.get("X-KasGate-Delivery").is_some());
    assert!(headers.get("X-KasGate-Timestamp").is_some());

    let attempt = state.attempts.fetch_add(1, Ordering::SeqCst) + 1;
    if attempt <= state.fail_first_n {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

async fn spawn_mock_server(attempts: Arc<AtomicUsize>, secret: Vec<u8>, fail_first_n: usize) -> String {
    let state = AppState { attempts, secret, fail_first_n };
    let app = Router::new().route("/hook", post(handler)).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app.into_make_service()).await.unwrap() });
    format!("http://{addr}/hook")
}

fn sample_session(merchant_id: &str) -> Session {
    Session {
        id: kasgate::model::SessionId::new(),
        merchant_id: merchant_id.to_string(),
        address: "kaspatest:qsample".to_string(),
        address_index: 0,
        amount_sompi: 100,
        status: SessionStatus::Confirming,
        tx_id: Some("tx-1".to_string()),
        confirmations: 0,
        order_id: None,
        metadata: kasgate::metadata::Metadata::empty(),
        created_at: 0,
        expires_at: 900,
        paid_at: Some(0),
        confirmed_at: None,
        subscription_token: "tok".to_string(),
    }
}

fn enqueue(store: &Store, merchant: &Merchant, session: &Session) -> WebhookLog {
    let delivery_id = kasgate::model::DeliveryId::new();
    let payload = build_payload(session, WebhookEventKind::PaymentConfirming, delivery_id, 0, merchant);
    let log = WebhookLog {
        id: kasgate::model::WebhookLogId::new(),
        session_id: session.id,
        event: WebhookEventKind::PaymentConfirming,
        payload,
        delivery_id,
        attempts: 0,
        status_code: None,
        response: None,
        next_retry_at: Some(0),
        created_at: 0,
        delivered_at: None,
        claimed_at: None,
    };
    store.create_session(session).unwrap();
    store.record_webhook_outcome(&log, None).unwrap();
    log
}

#[tokio::test]
async fn delivers_and_retries_until_success() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let (store, merchant) = fixtures::test_store_with_merchant("merchant-wh", "unused");
    let url = spawn_mock_server(Arc::clone(&attempts), merchant.webhook_secret.clone(), 1).await;
    let mut merchant = merchant;
    merchant.webhook_url = url;
    store.put_merchant(&merchant).unwrap();

    let session = sample_session(&merchant.id);
    let log = enqueue(&store, &merchant, &session);

    let dispatcher = Arc::new(WebhookDispatcher::new(Arc::clone(&store), 1, 8));

    // The first `tokio::time::interval` tick fires immediately, so one short
    // run()/abort cycle exercises exactly one poll pass.
    let first_task = tokio::spawn(Arc::clone(&dispatcher).run());
    tokio::time::sleep(Duration::from_millis(300)).await;
    first_task.abort();
    let first = store.get_webhook_log(log.id).unwrap().unwrap();
    assert_eq!(first.attempts, 1);
    assert!(first.delivered_at.is_none());

    // Backoff base is 30s; a manual retry (as an operator-triggered resend
    // would do) resets nextRetryAt so the next poll pass redelivers now.
    dispatcher.manual_retry(log.id).unwrap();
    let second_task = tokio::spawn(Arc::clone(&dispatcher).run());
    tokio::time::sleep(Duration::from_millis(300)).await;
    second_task.abort();
    let second = store.get_webhook_log(log.id).unwrap().unwrap();
    assert!(second.delivered_at.is_some());
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn a_log_is_dead_lettered_after_max_attempts_and_manual_retry_resets_it() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let (store, merchant) = fixtures::test_store_with_merchant("merchant-wh-2", "unused");
    let url = spawn_mock_server(Arc::clone(&attempts), merchant.webhook_secret.clone(), usize::MAX).await;
    let mut merchant = merchant;
    merchant.webhook_url = url;
    store.put_merchant(&merchant).unwrap();

    let session = sample_session(&merchant.id);
    let mut log = enqueue(&store, &merchant, &session);
    // Simulate a log that is already one failure away from the dead-letter
    // threshold, so a single poll pass is enough to observe the transition.
    log.attempts = 1;
    store.record_webhook_outcome(&log, Some(0)).unwrap();

    let dispatcher = Arc::new(WebhookDispatcher::new(Arc::clone(&store), 1, 2));
    let task = tokio::spawn(Arc::clone(&dispatcher).run());
    tokio::time::sleep(Duration::from_millis(300)).await;
    task.abort();

    let final_state = store.get_webhook_log(log.id).unwrap().unwrap();
    assert!(final_state.is_dead_lettered(2));
    assert!(final_state.next_retry_at.is_none());

    dispatcher.manual_retry(log.id).unwrap();
    let reset = store.get_webhook_log(log.id).unwrap().unwrap();
    assert_eq!(reset.attempts, 0);
    assert!(!reset.is_dead_lettered(2));
}
