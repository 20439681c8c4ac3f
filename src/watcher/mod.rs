//! ChainWatcher (C5): merges C3 (RpcClient) and C4 (RestPoller) into a single
//! `PaymentEvent` stream for C6, owning the failover policy between them.
//!
//! Pure in-process merge logic (spec §9's "typed `PaymentEvent` stream with a
//! single consumer" design note) — no new external dependency beyond `tokio`
//! and the `lru` crate already used by C4's dedup.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use lru::LruCache;
use tokio::sync::{mpsc, Mutex};

use crate::model::{EventSource, PaymentEvent};
use crate::poller::{Cadence, RestPoller};
use crate::rpc::RpcClient;

const DEDUP_WINDOW: Duration = Duration::from_secs(10 * 60);
const LATE_RECONCILIATION_WINDOW: Duration = Duration::from_secs(30);
const DEDUP_CAPACITY: usize = 100_000;

/// Merges the raw feeds from C3/C4 into the deduped, failover-aware stream
/// C6 consumes. Owns no Store reference — it is pure event-shaping.
pub struct ChainWatcher {
    rpc: Arc<RpcClient>,
    poller: Arc<RestPoller>,
    raw_rx: Mutex<mpsc::Receiver<PaymentEvent>>,
    out_tx: mpsc::Sender<PaymentEvent>,
    seen: Mutex<LruCache<(String, String), Instant>>,
    /// Tracks, per `(address, txId)`, the last time RPC itself surfaced the
    /// pair — used for the 30s late-reconciliation window against poller
    /// events observed while RPC is connected.
    rpc_observed: Mutex<HashMap<(String, String), Instant>>,
    /// Edge-detects the Disconnected -> Connected transition so the
    /// reconciliation sweep below runs once per recovery, not every tick.
    rpc_was_connected: AtomicBool,
}

impl ChainWatcher {
    pub fn new(
        rpc: Arc<RpcClient>,
        poller: Arc<RestPoller>,
        raw_rx: mpsc::Receiver<PaymentEvent>,
        out_tx: mpsc::Sender<PaymentEvent>,
    ) -> Self {
        ChainWatcher {
            rpc,
            poller,
            raw_rx: Mutex::new(raw_rx),
            out_tx,
            seen: Mutex::new(LruCache::new(NonZeroUsize::new(DEDUP_CAPACITY).unwrap())),
            rpc_observed: Mutex::new(HashMap::new()),
            rpc_was_connected: AtomicBool::new(false),
        }
    }

    pub async fn watch_address(&self, address: &str) {
        let _ = self.rpc.subscribe(address).await;
        self.poller.watch(address).await;
    }

    pub async fn unwatch_address(&self, address: &str) {
        let _ = self.rpc.unsubscribe(address).await;
        self.poller.unwatch(address).await;
    }

    /// Single-consumer merge loop: reads every event from C3/C4's shared raw
    /// channel, applies the failover and dedup policy, and forwards the
    /// surviving events to C6 one at a time.
    pub async fn run(self: Arc<Self>) {
        self.sync_poller_cadence().await;
        let mut cadence_ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            let mut rx = self.raw_rx.lock().await;
            tokio::select! {
                event = rx.recv() => {
                    drop(rx);
                    match event {
                        Some(event) => self.handle_raw_event(event).await,
                        None => return,
                    }
                }
                _ = cadence_ticker.tick() => {
                    drop(rx);
                    self.sync_poller_cadence().await;
                }
            }
        }
    }

    /// Flips poller cadence with RPC's connection state and, on the
    /// Disconnected -> Connected edge, runs a full `getUtxos` reconciliation
    /// sweep of every watched address before settling into standby (spec
    /// §4.5: "a full reconciliation sweep ... is issued via `getUtxos` and
    /// diffed against observed state before returning to standby").
    async fn sync_poller_cadence(&self) {
        let connected = self.rpc.is_connected().await;
        let was_connected = self.rpc_was_connected.swap(connected, Ordering::SeqCst);
        let cadence = if connected { Cadence::Standby } else { Cadence::Active };
        self.poller.set_cadence(cadence).await;
        if connected && !was_connected {
            self.reconcile_after_reconnect().await;
        }
    }

    async fn reconcile_after_reconnect(&self) {
        let addresses = self.rpc.watched_addresses().await;
        info!("rpc recovered; reconciling {} watched addresses via getUtxos before standby", addresses.len());
        for address in addresses {
            if let Err(e) = self.rpc.reconcile_address(&address).await {
                warn!("post-reconnect reconciliation failed for {address}: {e}");
            }
        }
    }

    async fn handle_raw_event(&self, event: PaymentEvent) {
        let now = Instant::now();
        let key = (event.address.clone(), event.tx_id.clone());

        if event.source == EventSource::Rpc {
            self.rpc_observed.lock().await.insert(key.clone(), now);
        }

        if event.source == EventSource::RestPoller && self.rpc.is_connected().await {
            // RPC is primary; a standby-cadence poller event is only worth
            // forwarding if RPC hasn't surfaced the same pair recently.
            let observed_recently = self
                .rpc_observed
                .lock()
                .await
                .get(&key)
                .map(|t| now.duration_since(*t) < LATE_RECONCILIATION_WINDOW)
                .unwrap_or(false);
            if observed_recently {
                return;
            }
        }

        let mut seen = self.seen.lock().await;
        let is_confirmation_update = seen.contains(&key);
        if is_confirmation_update && !event.removed {
            seen.put(key.clone(), now);
            drop(seen);
            let _ = self.out_tx.send(event).await;
            return;
        }
        if let Some(last) = seen.peek(&key) {
            if now.duration_since(*last) < DEDUP_WINDOW && !event.removed {
                return;
            }
        }
        seen.put(key, now);
        drop(seen);
        let _ = self.out_tx.send(event).await;
    }
}
