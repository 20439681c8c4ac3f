//! KasGate: a self-hosted payment gateway for the Kaspa cryptocurrency.
//!
//! Wires together address derivation (`address`), chain observation
//! (`rpc`/`poller`/`watcher`), session/payment bookkeeping (`engine`), durable
//! webhook delivery (`webhook`), and embedded storage (`store`) behind an
//! explicit `engine::Engine` composition root.

pub mod address;
pub mod amount;
pub mod config;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod model;
pub mod poller;
pub mod rpc;
pub mod sanitize;
pub mod store;
pub mod watcher;
pub mod webhook;

pub use config::Config;
pub use engine::Engine;
pub use error::GatewayError;
pub use model::{Merchant, PaymentEvent, Session, SessionStatus, WebhookEventKind, WebhookLog};
pub use store::Store;
