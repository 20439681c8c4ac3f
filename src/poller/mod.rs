//! RestPoller (C4): periodic REST-API fallback source for watched addresses.
//!
//! Grounded in `webhook.rs`'s `reqwest::Client` timeout pattern, generalized
//! to a polling loop; per-address dedup uses `lru`, the same crate
//! `kdapp/src/proxy.rs`'s `TxOutputCache` wraps.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;

use crate::error::GatewayError;
use crate::model::{EventSource, PaymentEvent};

const ACTIVE_CADENCE: Duration = Duration::from_secs(3);
const STANDBY_CADENCE: Duration = Duration::from_secs(30);
const DEDUP_CAPACITY_PER_ADDRESS: usize = 10_000;
/// REST-poller reorg-detection signal (DESIGN.md Open Question #2): a tx
/// that was present in a previous tick and is absent from this many
/// consecutive later ticks is treated as removed.
const ABSENT_TICKS_BEFORE_REORG: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cadence {
    Active,
    Standby,
}

#[derive(Debug, Deserialize)]
struct FullTransactionsResponse {
    transactions: Vec<RestTransaction>,
}

#[derive(Debug, Deserialize)]
struct RestTransaction {
    #[serde(rename = "transaction_id")]
    tx_id: String,
    outputs: Vec<RestOutput>,
    #[serde(default)]
    confirmations: u64,
}

#[derive(Debug, Deserialize)]
struct RestOutput {
    amount: u64,
    index: u32,
}

pub struct RestPoller {
    client: Client,
    base_url: String,
    watched: Mutex<HashSet<String>>,
    seen: Mutex<LruCache<(String, String, u32), u64>>,
    cadence: Mutex<Cadence>,
    events: mpsc::Sender<PaymentEvent>,
    /// Per-address set of tx ids observed live in the previous tick, used to
    /// detect a tx's disappearance across consecutive ticks.
    active_txs: Mutex<HashMap<String, HashSet<String>>>,
    /// Consecutive-absence counter per `(address, txId)`.
    absent_ticks: Mutex<HashMap<(String, String), u32>>,
}

impl RestPoller {
    pub fn new(base_url: impl Into<String>, events: mpsc::Sender<PaymentEvent>) -> Self {
        RestPoller {
            client: Client::builder().timeout(Duration::from_secs(5)).build().expect("reqwest client builds"),
            base_url: base_url.into(),
            watched: Mutex::new(HashSet::new()),
            seen: Mutex::new(LruCache::new(NonZeroUsize::new(DEDUP_CAPACITY_PER_ADDRESS).unwrap())),
            cadence: Mutex::new(Cadence::Standby),
            events,
            active_txs: Mutex::new(HashMap::new()),
            absent_ticks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn watch(&self, address: &str) {
        self.watched.lock().await.insert(address.to_string());
    }

    pub async fn unwatch(&self, address: &str) {
        self.watched.lock().await.remove(address);
    }

    pub async fn set_cadence(&self, cadence: Cadence) {
        *self.cadence.lock().await = cadence;
    }

    /// Runs the polling loop forever. `suppress` controls whether emitted
    /// events are forwarded (standby, RPC-primary mode) or dropped entirely
    /// — `ChainWatcher` owns the late-reconciliation decision, so in standby
    /// mode the poller still ticks (to detect late-reconciliation candidates)
    /// but `ChainWatcher`, not this loop, decides whether to surface them.
    pub async fn run(self: Arc<Self>) {
        loop {
            let cadence = *self.cadence.lock().await;
            let delay = match cadence {
                Cadence::Active => ACTIVE_CADENCE,
                Cadence::Standby => STANDBY_CADENCE,
            };
            tokio::time::sleep(delay).await;
            if let Err(e) = self.tick().await {
                log::warn!("REST poll tick failed: {e}");
            }
        }
    }

    async fn tick(&self) -> Result<(), GatewayError> {
        let addresses: Vec<String> = self.watched.lock().await.iter().cloned().collect();
        for address in addresses {
            let url = format!("{}/addresses/{address}/full-transactions", self.base_url);
            let response = self.client.get(&url).send().await?;
            if !response.status().is_success() {
                continue;
            }
            let body: FullTransactionsResponse = response.json().await.map_err(GatewayError::from)?;
            let mut live_tx_ids: HashSet<String> = HashSet::new();
            for tx in &body.transactions {
                live_tx_ids.insert(tx.tx_id.clone());
                for output in &tx.outputs {
                    let key = (address.clone(), tx.tx_id.clone(), output.index);
                    let mut seen = self.seen.lock().await;
                    let previously_seen_confirmations = seen.get(&key).copied();
                    seen.put(key, tx.confirmations);
                    drop(seen);
                    // Identical re-observations are deduped; a confirmation-count
                    // change for an already-seen key bypasses dedup (spec §4.5).
                    if previously_seen_confirmations == Some(tx.confirmations) {
                        continue;
                    }
                    let event = PaymentEvent {
                        address: address.clone(),
                        tx_id: tx.tx_id.clone(),
                        amount_sompi: output.amount,
                        confirmations: tx.confirmations,
                        source: EventSource::RestPoller,
                        removed: false,
                    };
                    let _ = self.events.send(event).await;
                }
            }
            self.detect_disappearances(&address, &live_tx_ids).await;
        }
        Ok(())
    }

    /// Reorg-detection signal for the REST path (DESIGN.md Open Question
    /// #2): a tx previously seen live for this address that is missing from
    /// `live_tx_ids` for `ABSENT_TICKS_BEFORE_REORG` consecutive ticks emits
    /// a synthetic `removed` `PaymentEvent`, mirroring C3's UTXO-removal
    /// notification.
    async fn detect_disappearances(&self, address: &str, live_tx_ids: &HashSet<String>) {
        let mut active_txs = self.active_txs.lock().await;
        let previously_active = active_txs.entry(address.to_string()).or_default();
        let missing: Vec<String> = previously_active.difference(live_tx_ids).cloned().collect();
        let mut absent_ticks = self.absent_ticks.lock().await;
        for tx_id in missing {
            let key = (address.to_string(), tx_id.clone());
            let count = absent_ticks.entry(key.clone()).or_insert(0);
            *count += 1;
            if *count >= ABSENT_TICKS_BEFORE_REORG {
                let event = PaymentEvent {
                    address: address.to_string(),
                    tx_id,
                    amount_sompi: 0,
                    confirmations: 0,
                    source: EventSource::RestPoller,
                    removed: true,
                };
                let _ = self.events.send(event).await;
                absent_ticks.remove(&key);
            }
        }
        for tx_id in live_tx_ids {
            absent_ticks.remove(&(address.to_string(), tx_id.clone()));
        }
        *previously_active = live_tx_ids.clone();
    }
}
