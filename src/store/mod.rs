//! Durable persistence (C1): merchants, sessions, webhook logs, and the
//! secondary indexes C2/C6/C7 need.
//!
//! Grounded in `kdapp-merchant/src/storage.rs`'s sled + Borsh pattern, but
//! held as an explicit value owned by `Engine` rather than a
//! `once_cell::sync::Lazy<Db>` global (spec §9's Design Note on ambient
//! state) — tests open an isolated temporary `Store` per case instead of
//! sharing process-wide state.

use std::path::Path;

use sled::transaction::{abort, TransactionError, Transactional};
use sled::{Db, Tree};

use crate::error::GatewayError;
use crate::model::{Merchant, Session, SessionId, SessionStatus, WebhookLog, WebhookLogId};

const MERCHANTS: &str = "merchants";
const SESSIONS: &str = "sessions";
const SESSIONS_BY_ADDRESS: &str = "sessions_by_address";
const SESSIONS_BY_EXPIRY: &str = "sessions_by_expiry";
const WEBHOOK_LOGS: &str = "webhook_logs";
const WEBHOOK_LOGS_BY_RETRY: &str = "webhook_logs_by_retry";

pub struct Store {
    db: Db,
    merchants: Tree,
    sessions: Tree,
    sessions_by_address: Tree,
    sessions_by_expiry: Tree,
    webhook_logs: Tree,
    webhook_logs_by_retry: Tree,
}

fn expiry_key(expires_at: i64, session_id: SessionId) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + 16);
    key.extend_from_slice(&expires_at.to_be_bytes());
    key.extend_from_slice(session_id.0.as_bytes());
    key
}

fn retry_key(next_retry_at: i64, log_id: WebhookLogId) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + 16);
    key.extend_from_slice(&next_retry_at.to_be_bytes());
    key.extend_from_slice(log_id.0.as_bytes());
    key
}

impl Store {
    /// Opens (creating if absent) a sled database at `path`. Pass `None` to
    /// open a temporary, self-destructing store — used by tests.
    pub fn open(path: Option<&Path>) -> Result<Self, GatewayError> {
        let db = match path {
            Some(path) => sled::Config::new().path(path).flush_every_ms(Some(500)).open()?,
            None => sled::Config::new().temporary(true).open()?,
        };
        let merchants = db.open_tree(MERCHANTS)?;
        let sessions = db.open_tree(SESSIONS)?;
        let sessions_by_address = db.open_tree(SESSIONS_BY_ADDRESS)?;
        let sessions_by_expiry = db.open_tree(SESSIONS_BY_EXPIRY)?;
        let webhook_logs = db.open_tree(WEBHOOK_LOGS)?;
        let webhook_logs_by_retry = db.open_tree(WEBHOOK_LOGS_BY_RETRY)?;
        Ok(Store { db, merchants, sessions, sessions_by_address, sessions_by_expiry, webhook_logs, webhook_logs_by_retry })
    }

    pub fn flush(&self) -> Result<(), GatewayError> {
        self.db.flush()?;
        Ok(())
    }

    // ---- merchants --------------------------------------------------

    pub fn put_merchant(&self, merchant: &Merchant) -> Result<(), GatewayError> {
        let value = borsh::to_vec(merchant).map_err(|e| GatewayError::internal(e.to_string()))?;
        self.merchants.insert(merchant.id.as_bytes(), value)?;
        Ok(())
    }

    pub fn get_merchant(&self, id: &str) -> Result<Option<Merchant>, GatewayError> {
        match self.merchants.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(borsh::from_slice(&bytes).map_err(|e| GatewayError::internal(e.to_string()))?)),
            None => Ok(None),
        }
    }

    /// Reads `nextAddressIndex`, derives whatever `derive` produces for it,
    /// and only then increments and writes the index back — all inside one
    /// transaction on the merchants tree. A failing `derive` aborts the
    /// transaction, so a derivation error never burns an index: the next
    /// caller observes the same `nextAddressIndex` it would have seen had
    /// this call never happened.
    pub fn allocate_next_address_index<F, T>(&self, merchant_id: &str, derive: F) -> Result<(u64, T), GatewayError>
    where
        F: Fn(&str, u32) -> Result<T, GatewayError>,
    {
        let result = self.merchants.transaction(|tree| {
            let raw = tree
                .get(merchant_id.as_bytes())?
                .ok_or_else(|| abort(GatewayError::validation(format!("unknown merchant `{merchant_id}`"))))?;
            let mut merchant: Merchant =
                borsh::from_slice(&raw).map_err(|e| abort(GatewayError::internal(e.to_string())))?;
            let index = merchant.next_address_index;
            let derived = derive(&merchant.xpub, index as u32).map_err(abort)?;
            merchant.next_address_index += 1;
            let encoded = borsh::to_vec(&merchant).map_err(|e| abort(GatewayError::internal(e.to_string())))?;
            tree.insert(merchant_id.as_bytes(), encoded)?;
            Ok((index, derived))
        });
        result.map_err(GatewayError::from)
    }

    // ---- sessions -----------------------------------------------------

    /// Inserts a new session row plus its `(address)` and `(expiresAt)`
    /// secondary-index entries in one transaction (spec §4.6's creation
    /// contract requires this atomic with address allocation at a higher
    /// level; here it is atomic with the index writes).
    pub fn create_session(&self, session: &Session) -> Result<(), GatewayError> {
        let trees = (&self.sessions, &self.sessions_by_address, &self.sessions_by_expiry);
        let result = trees.transaction(|(sessions, by_address, by_expiry)| {
            let key = session.id.0.as_bytes();
            if sessions.get(key)?.is_some() {
                return Err(abort(GatewayError::conflict(format!("session {} already exists", session.id))));
            }
            let encoded = borsh::to_vec(session).map_err(|e| abort(GatewayError::internal(e.to_string())))?;
            sessions.insert(key.as_slice(), encoded)?;
            by_address.insert(session.address.as_bytes(), key.as_slice())?;
            by_expiry.insert(expiry_key(session.expires_at, session.id), &[] as &[u8])?;
            Ok(())
        });
        result.map_err(GatewayError::from)
    }

    pub fn get_session(&self, id: SessionId) -> Result<Option<Session>, GatewayError> {
        match self.sessions.get(id.0.as_bytes())? {
            Some(bytes) => Ok(Some(borsh::from_slice(&bytes).map_err(|e| GatewayError::internal(e.to_string()))?)),
            None => Ok(None),
        }
    }

    pub fn get_session_by_address(&self, address: &str) -> Result<Option<Session>, GatewayError> {
        match self.sessions_by_address.get(address.as_bytes())? {
            Some(id_bytes) => match self.sessions.get(id_bytes.as_ref())? {
                Some(bytes) => Ok(Some(borsh::from_slice(&bytes).map_err(|e| GatewayError::internal(e.to_string()))?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    pub fn list_sessions_for_merchant(&self, merchant_id: &str) -> Result<Vec<Session>, GatewayError> {
        let mut out = Vec::new();
        for entry in self.sessions.iter() {
            let (_, bytes) = entry?;
            let session: Session = borsh::from_slice(&bytes).map_err(|e| GatewayError::internal(e.to_string()))?;
            if session.merchant_id == merchant_id {
                out.push(session);
            }
        }
        Ok(out)
    }

    /// Overwrites a session row in place. Callers are responsible for only
    /// ever moving `status` forward along the §4.6 DAG.
    pub fn put_session(&self, session: &Session) -> Result<(), GatewayError> {
        let encoded = borsh::to_vec(session).map_err(|e| GatewayError::internal(e.to_string()))?;
        self.sessions.insert(session.id.0.as_bytes(), encoded)?;
        Ok(())
    }

    /// Persists a session transition together with the webhook log it
    /// enqueues, atomically — spec §4.6 step 7: "webhook enqueue is inside
    /// the same transaction" as the state mutation.
    pub fn apply_transition_with_webhook(&self, session: &Session, webhook: Option<&WebhookLog>) -> Result<(), GatewayError> {
        let trees = (&self.sessions, &self.webhook_logs, &self.webhook_logs_by_retry);
        let result = trees.transaction(|(sessions, logs, logs_by_retry)| {
            let encoded = borsh::to_vec(session).map_err(|e| abort(GatewayError::internal(e.to_string())))?;
            sessions.insert(session.id.0.as_bytes(), encoded)?;
            if let Some(log) = webhook {
                let encoded_log = borsh::to_vec(log).map_err(|e| abort(GatewayError::internal(e.to_string())))?;
                logs.insert(log.id.0.as_bytes(), encoded_log)?;
                if let Some(next_retry_at) = log.next_retry_at {
                    logs_by_retry.insert(retry_key(next_retry_at, log.id), &[] as &[u8])?;
                }
            }
            Ok(())
        });
        result.map_err(GatewayError::from)
    }

    /// Scans `sessions_by_expiry` for rows due at or before `now`, returning
    /// up to `limit` still-pending sessions for the sweeper to advance.
    pub fn list_expired_candidates(&self, now: i64, limit: usize) -> Result<Vec<Session>, GatewayError> {
        let mut out = Vec::new();
        for entry in self.sessions_by_expiry.iter() {
            let (key, _) = entry?;
            if key.len() < 8 {
                continue;
            }
            let mut expiry_bytes = [0u8; 8];
            expiry_bytes.copy_from_slice(&key[..8]);
            let expires_at = i64::from_be_bytes(expiry_bytes);
            if expires_at > now {
                break;
            }
            let mut id_bytes = [0u8; 16];
            id_bytes.copy_from_slice(&key[8..24]);
            let id = SessionId(uuid::Uuid::from_bytes(id_bytes));
            if let Some(session) = self.get_session(id)? {
                if session.status == SessionStatus::Pending {
                    out.push(session);
                }
            }
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    // ---- webhook logs ---------------------------------------------------

    pub fn get_webhook_log(&self, id: WebhookLogId) -> Result<Option<WebhookLog>, GatewayError> {
        match self.webhook_logs.get(id.0.as_bytes())? {
            Some(bytes) => Ok(Some(borsh::from_slice(&bytes).map_err(|e| GatewayError::internal(e.to_string()))?)),
            None => Ok(None),
        }
    }

    /// Scans `webhook_logs_by_retry` for rows due at or before `now`.
    pub fn list_due_webhook_logs(&self, now: i64, limit: usize) -> Result<Vec<WebhookLog>, GatewayError> {
        let mut out = Vec::new();
        for entry in self.webhook_logs_by_retry.iter() {
            let (key, _) = entry?;
            if key.len() < 8 {
                continue;
            }
            let mut retry_bytes = [0u8; 8];
            retry_bytes.copy_from_slice(&key[..8]);
            let next_retry_at = i64::from_be_bytes(retry_bytes);
            if next_retry_at > now {
                break;
            }
            let mut id_bytes = [0u8; 16];
            id_bytes.copy_from_slice(&key[8..24]);
            let id = WebhookLogId(uuid::Uuid::from_bytes(id_bytes));
            if let Some(log) = self.get_webhook_log(id)? {
                if log.delivered_at.is_none() {
                    out.push(log);
                }
            }
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    /// Claims a due row for delivery: `claimedAt` is set to `now` only if it
    /// was unset or stale (older than `2 * delivery_timeout_secs` ago),
    /// preventing double-dispatch across workers (spec §4.7).
    pub fn claim_webhook_log(
        &self,
        id: WebhookLogId,
        now: i64,
        delivery_timeout_secs: i64,
    ) -> Result<Option<WebhookLog>, GatewayError> {
        let result: Result<Option<WebhookLog>, TransactionError<GatewayError>> = self.webhook_logs.transaction(|tree| {
            let raw = match tree.get(id.0.as_bytes())? {
                Some(raw) => raw,
                None => return Ok(None),
            };
            let mut log: WebhookLog = borsh::from_slice(&raw).map_err(|e| abort(GatewayError::internal(e.to_string())))?;
            let stale_before = now - 2 * delivery_timeout_secs;
            let claimable = match log.claimed_at {
                None => true,
                Some(claimed_at) => claimed_at < stale_before,
            };
            if !claimable {
                return Ok(None);
            }
            log.claimed_at = Some(now);
            let encoded = borsh::to_vec(&log).map_err(|e| abort(GatewayError::internal(e.to_string())))?;
            tree.insert(id.0.as_bytes(), encoded)?;
            Ok(Some(log))
        });
        result.map_err(GatewayError::from)
    }

    /// Writes back a delivery outcome and updates the retry index: removes
    /// the old `(nextRetryAt, id)` key and inserts the new one, if any.
    pub fn record_webhook_outcome(&self, log: &WebhookLog, old_next_retry_at: Option<i64>) -> Result<(), GatewayError> {
        let trees = (&self.webhook_logs, &self.webhook_logs_by_retry);
        let result = trees.transaction(|(logs, logs_by_retry)| {
            let encoded = borsh::to_vec(log).map_err(|e| abort(GatewayError::internal(e.to_string())))?;
            logs.insert(log.id.0.as_bytes(), encoded)?;
            if let Some(old) = old_next_retry_at {
                logs_by_retry.remove(retry_key(old, log.id))?;
            }
            if let Some(new_retry) = log.next_retry_at {
                logs_by_retry.insert(retry_key(new_retry, log.id), &[] as &[u8])?;
            }
            Ok(())
        });
        result.map_err(GatewayError::from)
    }

    /// Manual retry on a dead-lettered log: resets `attempts=0`,
    /// `nextRetryAt=now`, and restores the retry-index entry.
    pub fn reset_webhook_for_retry(&self, id: WebhookLogId, now: i64) -> Result<(), GatewayError> {
        let trees = (&self.webhook_logs, &self.webhook_logs_by_retry);
        let result = trees.transaction(|(logs, logs_by_retry)| {
            let raw = logs.get(id.0.as_bytes())?.ok_or_else(|| abort(GatewayError::validation("unknown webhook log")))?;
            let mut log: WebhookLog = borsh::from_slice(&raw).map_err(|e| abort(GatewayError::internal(e.to_string())))?;
            log.attempts = 0;
            log.next_retry_at = Some(now);
            log.claimed_at = None;
            let encoded = borsh::to_vec(&log).map_err(|e| abort(GatewayError::internal(e.to_string())))?;
            logs.insert(id.0.as_bytes(), encoded)?;
            logs_by_retry.insert(retry_key(now, id), &[] as &[u8])?;
            Ok(())
        });
        result.map_err(GatewayError::from)
    }
}
