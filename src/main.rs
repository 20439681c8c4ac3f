//! Process entry point: wires `Config::from_env()` into the full component
//! graph and runs it until SIGINT, per spec §5's graceful-shutdown window.
//! No CLI framework (bootstrap/operator tooling is out of scope) — runtime
//! behavior is entirely environment-variable driven, per `Config`.

use std::sync::Arc;

use kaspa_consensus_core::network::{NetworkId, NetworkType};
use log::info;
use tokio::sync::mpsc;

use kasgate::address::AddressService;
use kasgate::config::Config;
use kasgate::engine::Engine;
use kasgate::rpc::RpcClient;
use kasgate::store::Store;
use kasgate::watcher::ChainWatcher;
use kasgate::webhook::WebhookDispatcher;
use kasgate::poller::RestPoller;

const RAW_EVENT_CHANNEL_CAPACITY: usize = 1024;
const SESSION_EVENT_CHANNEL_CAPACITY: usize = 1024;
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

#[tokio::main]
async fn main() {
    env_logger::init();
    let config = Config::from_env();
    info!("starting kasgated on network {}", config.network);

    let store = Arc::new(Store::open(Some(&config.data_dir)).expect("failed to open data directory"));
    let addresses = Arc::new(AddressService::new(config.network.clone()));

    let network_id = NetworkId::new(if config.network == "mainnet" { NetworkType::Mainnet } else { NetworkType::Testnet });
    let (raw_tx, raw_rx) = mpsc::channel(RAW_EVENT_CHANNEL_CAPACITY);
    let (session_tx, session_rx) = mpsc::channel(SESSION_EVENT_CHANNEL_CAPACITY);

    let rpc = Arc::new(RpcClient::new(network_id, config.rpc_url.clone(), raw_tx.clone()));
    let poller = Arc::new(RestPoller::new(config.rest_api_url.clone(), raw_tx));
    let watcher = Arc::new(ChainWatcher::new(Arc::clone(&rpc), Arc::clone(&poller), raw_rx, session_tx));
    let webhooks = Arc::new(WebhookDispatcher::new(Arc::clone(&store), config.webhook_workers, config.webhook_max_attempts));

    let engine = Arc::new(Engine::new(Arc::clone(&store), addresses, Arc::clone(&watcher), Arc::clone(&webhooks), config.clone()));

    let rpc_task = tokio::spawn(Arc::clone(&rpc).run());
    let poller_task = tokio::spawn(Arc::clone(&poller).run());
    let watcher_task = tokio::spawn(Arc::clone(&watcher).run());
    let webhook_task = tokio::spawn(Arc::clone(&webhooks).run());
    let event_loop_task = tokio::spawn(Arc::clone(&engine).run_event_loop(session_rx));
    let sweeper_task = tokio::spawn(Arc::clone(&engine).run_expiry_sweeper());

    tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    info!("shutdown requested, waiting up to {:?} for in-flight work", SHUTDOWN_GRACE);

    // Stop feeding new work first: the upstream observers and the sweeper
    // have no in-flight suspension points worth draining.
    rpc_task.abort();
    poller_task.abort();
    watcher_task.abort();
    sweeper_task.abort();

    // The event loop and webhook dispatcher may be mid-transaction or
    // mid-POST (up to the 10s webhook timeout); give them the grace window
    // to finish naturally before forcing termination.
    let event_loop_abort = event_loop_task.abort_handle();
    let webhook_abort = webhook_task.abort_handle();
    let drain = async {
        let _ = event_loop_task.await;
        let _ = webhook_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        info!("grace window elapsed; forcing remaining tasks to stop");
        event_loop_abort.abort();
        webhook_abort.abort();
    }

    store.flush().expect("failed to flush store on shutdown");
    info!("kasgated stopped");
}
