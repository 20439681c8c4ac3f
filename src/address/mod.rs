//! Address derivation (C2): deterministic BIP-32/BIP-44 child-key derivation
//! from a merchant xPub, with atomically-incremented per-merchant indices.
//!
//! Per spec §1 the BIP-32 library itself is an opaque oracle exposing
//! `derive(xpub, path) -> publicKey` and `address(publicKey, network) -> string`;
//! `DerivationOracle` below is exactly that boundary, backed by `kaspa_bip32`
//! (the same crate `kdapp-merchant`'s key-to-address helpers in `main.rs`
//! build on) and `kaspa_addresses::Address` for formatting.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;

use kaspa_addresses::{Address, Prefix, Version};
use kaspa_bip32::{ChildNumber, ExtendedPublicKey, PublicKey};

use crate::error::GatewayError;
use crate::store::Store;

/// The BIP-44 leaf the gateway derives under a merchant's xPub, which itself
/// already represents `m/44'/111111'/0'`.
fn leaf_path(index: u32) -> [ChildNumber; 2] {
    [ChildNumber::new(0, false).expect("0 is a valid non-hardened child index"), ChildNumber::new(index, false).unwrap_or(ChildNumber::new(0, false).unwrap())]
}

/// Renders the same leaf `leaf_path` derives under, for the `path` half of
/// `deriveAddress`'s `{address, path}` contract (spec §1).
fn leaf_path_string(index: u32) -> String {
    format!("m/44'/111111'/0'/0/{index}")
}

/// The opaque derivation oracle boundary (spec §1). A panic inside the
/// underlying crypto library is caught and mapped to `GatewayError::Internal`
/// rather than propagated (spec §4.2).
pub trait DerivationOracle: Send + Sync {
    fn derive_child_public_key(&self, xpub: &str, index: u32) -> Result<[u8; 32], GatewayError>;
}

/// Caches each xPub's parsed `ExtendedPublicKey` so repeat derivations for
/// the same xPub (the common case: one merchant, many session addresses)
/// skip re-parsing it from base58 every time.
pub struct KaspaBip32Oracle {
    cache: RwLock<HashMap<String, ExtendedPublicKey<PublicKey>>>,
}

impl KaspaBip32Oracle {
    pub fn new() -> Self {
        KaspaBip32Oracle { cache: RwLock::new(HashMap::new()) }
    }

    fn parsed_parent(&self, xpub: &str) -> Result<ExtendedPublicKey<PublicKey>, GatewayError> {
        if let Some(parent) = self.cache.read().expect("oracle cache lock poisoned").get(xpub) {
            return Ok(parent.clone());
        }
        let parent: ExtendedPublicKey<PublicKey> =
            ExtendedPublicKey::from_str(xpub).map_err(|e| GatewayError::validation(format!("invalid xpub: {e}")))?;
        self.cache.write().expect("oracle cache lock poisoned").insert(xpub.to_string(), parent.clone());
        Ok(parent)
    }
}

impl Default for KaspaBip32Oracle {
    fn default() -> Self {
        Self::new()
    }
}

impl DerivationOracle for KaspaBip32Oracle {
    fn derive_child_public_key(&self, xpub: &str, index: u32) -> Result<[u8; 32], GatewayError> {
        let parent = self.parsed_parent(xpub)?;
        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| derive_from_parent(parent, index)))
            .map_err(|_| GatewayError::internal("derivation oracle panicked"))?
    }
}

fn derive_from_parent(parent: ExtendedPublicKey<PublicKey>, index: u32) -> Result<[u8; 32], GatewayError> {
    let mut child = parent;
    for step in leaf_path(index) {
        child = child.derive_child(step).map_err(|e| GatewayError::internal(format!("derivation failed: {e}")))?;
    }
    let compressed = child.public_key().to_bytes();
    // Kaspa addresses carry the x-only (Schnorr) coordinate; drop the sign-prefix byte.
    let mut out = [0u8; 32];
    out.copy_from_slice(&compressed[compressed.len() - 32..]);
    Ok(out)
}

fn network_prefix(network: &str) -> Prefix {
    match network {
        "mainnet" => Prefix::Mainnet,
        _ => Prefix::Testnet,
    }
}

pub struct AddressService {
    oracle: Box<dyn DerivationOracle>,
    network: String,
}

impl AddressService {
    pub fn new(network: impl Into<String>) -> Self {
        AddressService { oracle: Box::new(KaspaBip32Oracle::new()), network: network.into() }
    }

    /// Test-only constructor for swapping in a fake oracle; not `cfg(test)`
    /// because integration tests under `tests/` link the crate as an
    /// ordinary dependency and need it too.
    pub fn with_oracle(network: impl Into<String>, oracle: Box<dyn DerivationOracle>) -> Self {
        AddressService { oracle, network: network.into() }
    }

    /// `deriveAddress(xpub, index) -> {address, path}`. Pure function of its
    /// inputs.
    pub fn derive_address(&self, xpub: &str, index: u32) -> Result<(String, String), GatewayError> {
        let payload = self.oracle.derive_child_public_key(xpub, index)?;
        let address = Address::new(network_prefix(&self.network), Version::PubKey, &payload);
        Ok((address.to_str(), leaf_path_string(index)))
    }

    /// `allocateNextAddress(merchantId) -> {address, path, index}`. The index
    /// read-increment-write and the derivation that consumes it run inside
    /// one `Store::allocate_next_address_index` transaction, so a derivation
    /// failure aborts before the index is committed instead of burning it.
    pub fn allocate_next_address(&self, store: &Store, merchant_id: &str) -> Result<(String, String, u64), GatewayError> {
        let (index, (address, path)) = store.allocate_next_address_index(merchant_id, |xpub, idx| self.derive_address(xpub, idx))?;
        Ok((address, path, index))
    }

    /// `verifyAddress(xpub, address, maxIndex) -> index?`. Brute-force search
    /// used by recovery paths; bounded by `max_index` to stay O(1)-ish.
    pub fn verify_address(&self, xpub: &str, address: &str, max_index: u32) -> Result<Option<u32>, GatewayError> {
        for index in 0..max_index {
            let (candidate, _path) = self.derive_address(xpub, index)?;
            if candidate == address {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }
}
