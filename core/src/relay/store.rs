// Relay persistence: held ciphertexts and the name registry.
//
// The relay is honest-but-curious: it sees fingerprints, sizes, and timing,
// never payloads. Held blobs are keyed by msg_id (deposit is an upsert);
// registry entries are keyed by lower-cased name, last writer wins.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::debug;

use super::protocol::{DepositRequest, HeldMessage, RegisterRequest, RegistryEntry, RelayStats};

#[derive(Debug, Error)]
pub enum RelayStoreError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("record codec error: {0}")]
    Codec(#[from] Box<bincode::ErrorKind>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HeldRecord {
    msg_id: String,
    recipient_fingerprint: String,
    sender_fingerprint: String,
    encrypted_envelope: String,
    signature: String,
    deposited_at: f64,
    expires_at: f64,
}

pub(crate) fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub struct RelayStore {
    #[allow(dead_code)] // keeps the sled::Db alive
    db: sled::Db,
    held: sled::Tree,
    registry: sled::Tree,
    write_lock: Mutex<()>,
}

impl RelayStore {
    pub fn open(path: &Path) -> Result<Self, RelayStoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            held: db.open_tree("held_messages")?,
            registry: db.open_tree("registry")?,
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Upsert by msg_id. Signatures are not validated here; authenticity is
    /// end-to-end between the clients.
    pub fn deposit(&self, req: &DepositRequest) -> Result<(), RelayStoreError> {
        let now = now_ts();
        let record = HeldRecord {
            msg_id: req.msg_id.clone(),
            recipient_fingerprint: req.recipient_fingerprint.clone(),
            sender_fingerprint: req.sender_fingerprint.clone(),
            encrypted_envelope: req.encrypted_envelope.clone(),
            signature: req.signature.clone(),
            deposited_at: now,
            expires_at: now + req.ttl_sec as f64,
        };
        let bytes = bincode::serialize(&record)?;

        let _guard = self.write_lock.lock();
        self.held.insert(record.msg_id.as_bytes(), bytes)?;
        Ok(())
    }

    /// Unexpired messages for a recipient deposited after `since`, oldest
    /// first.
    pub fn pickup(&self, recipient: &str, since: f64) -> Result<Vec<HeldMessage>, RelayStoreError> {
        let now = now_ts();
        let mut records = Vec::new();
        for item in self.held.iter() {
            let (_, value) = item?;
            let record: HeldRecord = bincode::deserialize(&value)?;
            if record.recipient_fingerprint == recipient
                && record.deposited_at > since
                && record.expires_at > now
            {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.deposited_at.total_cmp(&b.deposited_at));
        Ok(records
            .into_iter()
            .map(|r| HeldMessage {
                msg_id: r.msg_id,
                sender_fingerprint: r.sender_fingerprint,
                encrypted_envelope: r.encrypted_envelope,
                deposited_at: r.deposited_at,
                expires_at: r.expires_at,
            })
            .collect())
    }

    /// Delete only rows matching both the id list and the recipient, so one
    /// recipient can never delete another's mail.
    pub fn ack(&self, recipient: &str, msg_ids: &[String]) -> Result<u64, RelayStoreError> {
        let mut removed = 0;
        let _guard = self.write_lock.lock();
        for msg_id in msg_ids {
            let Some(value) = self.held.get(msg_id.as_bytes())? else {
                continue;
            };
            let record: HeldRecord = bincode::deserialize(&value)?;
            if record.recipient_fingerprint == recipient {
                self.held.remove(msg_id.as_bytes())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn cleanup_expired(&self) -> Result<u64, RelayStoreError> {
        let now = now_ts();
        let mut expired_keys = Vec::new();
        for item in self.held.iter() {
            let (key, value) = item?;
            let record: HeldRecord = bincode::deserialize(&value)?;
            if record.expires_at < now {
                expired_keys.push(key.to_vec());
            }
        }

        let _guard = self.write_lock.lock();
        let mut removed = 0;
        for key in expired_keys {
            self.held.remove(key)?;
            removed += 1;
        }
        if removed > 0 {
            debug!("removed {} expired message(s)", removed);
        }
        Ok(removed)
    }

    /// Names are case-insensitive; last writer wins.
    pub fn register(&self, req: &RegisterRequest) -> Result<(), RelayStoreError> {
        let name = req.name.to_lowercase();
        let entry = RegistryEntry {
            name: name.clone(),
            fingerprint: req.fingerprint.clone(),
            pubkey: req.pubkey.clone(),
            encrypt_pubkey: req.encrypt_pubkey.clone(),
            registered_at: now_ts(),
        };
        let bytes = bincode::serialize(&entry)?;

        let _guard = self.write_lock.lock();
        self.registry.insert(name.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Result<Option<RegistryEntry>, RelayStoreError> {
        match self.registry.get(name.to_lowercase().as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    pub fn stats(&self) -> Result<RelayStats, RelayStoreError> {
        let mut messages_held = 0;
        let mut total_bytes = 0;
        for item in self.held.iter() {
            let (_, value) = item?;
            let record: HeldRecord = bincode::deserialize(&value)?;
            messages_held += 1;
            total_bytes += record.encrypted_envelope.len() as u64;
        }
        Ok(RelayStats {
            messages_held,
            total_bytes,
        })
    }
}
