//! Data model (spec §3): `Merchant`, `Session`, `WebhookLog`, and the
//! `PaymentEvent` shape C5 hands to C6.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metadata::Metadata;

/// Wraps a `uuid::Uuid` so it can ride in Borsh-encoded rows; `uuid` does not
/// implement Borsh itself. Same technique as `kdapp::pki::PubKey` wrapping
/// `secp256k1::PublicKey`.
macro_rules! uuid_newtype {
    ($name:ident) => {
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                $name(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl BorshSerialize for $name {
            fn serialize<W: std::io::Write>(&self, writer: &mut W) -> std::io::Result<()> {
                writer.write_all(self.0.as_bytes())
            }
        }

        impl BorshDeserialize for $name {
            fn deserialize_reader<R: std::io::Read>(reader: &mut R) -> std::io::Result<Self> {
                let mut buf = [0u8; 16];
                reader.read_exact(&mut buf)?;
                Ok($name(Uuid::from_bytes(buf)))
            }
        }
    };
}

uuid_newtype!(SessionId);
uuid_newtype!(WebhookLogId);
uuid_newtype!(DeliveryId);

#[derive(Clone, Debug, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Merchant {
    pub id: String,
    pub xpub: String,
    pub next_address_index: u64,
    pub api_key_hash: Vec<u8>,
    pub webhook_url: String,
    pub webhook_secret: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub enum SessionStatus {
    Pending,
    Confirming,
    Confirmed,
    Expired,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Confirmed | SessionStatus::Expired | SessionStatus::Failed)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct Session {
    pub id: SessionId,
    pub merchant_id: String,
    pub address: String,
    pub address_index: u64,
    pub amount_sompi: u64,
    pub status: SessionStatus,
    pub tx_id: Option<String>,
    pub confirmations: u64,
    pub order_id: Option<String>,
    pub metadata: Metadata,
    pub created_at: i64,
    pub expires_at: i64,
    pub paid_at: Option<i64>,
    pub confirmed_at: Option<i64>,
    pub subscription_token: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub enum WebhookEventKind {
    PaymentPending,
    PaymentConfirming,
    PaymentConfirmed,
    PaymentExpired,
}

impl WebhookEventKind {
    pub fn wire_name(&self) -> &'static str {
        match self {
            WebhookEventKind::PaymentPending => "payment.pending",
            WebhookEventKind::PaymentConfirming => "payment.confirming",
            WebhookEventKind::PaymentConfirmed => "payment.confirmed",
            WebhookEventKind::PaymentExpired => "payment.expired",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, BorshSerialize, BorshDeserialize)]
pub struct WebhookLog {
    pub id: WebhookLogId,
    pub session_id: SessionId,
    pub event: WebhookEventKind,
    pub payload: Vec<u8>,
    pub delivery_id: DeliveryId,
    pub attempts: u32,
    pub status_code: Option<u16>,
    pub response: Option<String>,
    pub next_retry_at: Option<i64>,
    pub created_at: i64,
    pub delivered_at: Option<i64>,
    pub claimed_at: Option<i64>,
}

impl WebhookLog {
    pub fn is_dead_lettered(&self, max_attempts: u32) -> bool {
        self.delivered_at.is_none() && self.attempts >= max_attempts
    }
}

/// Event source for `PaymentEvent`, as used by C5's dedup and late-reconciliation policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventSource {
    Rpc,
    RestPoller,
}

/// The unified event C5 emits to C6, merging C3's and C4's feeds.
#[derive(Clone, Debug)]
pub struct PaymentEvent {
    pub address: String,
    pub tx_id: String,
    pub amount_sompi: u64,
    pub confirmations: u64,
    pub source: EventSource,
    /// True when this event signals the transaction has disappeared from the
    /// chain (the reorg signal resolved in DESIGN.md's Open Question #2).
    pub removed: bool,
}
