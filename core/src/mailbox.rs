// Durable local store for messages, peers, and the outbox queue.
//
// One sled tree per table. msg_id is the primary key of the message log and,
// via the outbox_ids index, of the outbox; the outbox tree itself is keyed
// by a monotonic sequence number so pending entries drain in insertion
// order. Multi-tree writes serialize behind a single mutex; readers scan
// committed state without taking it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::message::{now_iso, Intent, MessageEnvelope, PeerInfo};

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("record codec error: {0}")]
    Codec(#[from] Box<bincode::ErrorKind>),
    #[error("envelope encoding error: {0}")]
    Envelope(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound" => Some(Direction::Inbound),
            "outbound" => Some(Direction::Outbound),
            _ => None,
        }
    }
}

/// Where an envelope ended up. Log writes are idempotent by msg_id, so a
/// late direct delivery and an earlier relay deposit converge on one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Sending,
    Delivered,
    Relayed,
    Queued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutboxState {
    Pending,
    Sent,
}

/// One row of the message log: every envelope this node has emitted or
/// accepted, with the routing fields lifted out for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub msg_id: String,
    pub thread_id: Option<String>,
    pub from_addr: String,
    pub to_addr: String,
    pub sent_at: String,
    pub subject: String,
    pub intent: Intent,
    pub body: String,
    pub envelope_json: String,
    pub encrypted: bool,
    pub direction: Direction,
    pub status: DeliveryState,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub msg_id: String,
    pub to_addr: String,
    pub envelope_json: String,
    pub attempts: u32,
    pub status: OutboxState,
}

pub struct Mailbox {
    db: sled::Db,
    messages: sled::Tree,
    peers: sled::Tree,
    peer_addrs: sled::Tree,
    outbox: sled::Tree,
    outbox_ids: sled::Tree,
    write_lock: Mutex<()>,
}

impl Mailbox {
    pub fn open(path: &Path) -> Result<Self, MailboxError> {
        let db = sled::open(path)?;
        Ok(Self {
            messages: db.open_tree("messages")?,
            peers: db.open_tree("peers")?,
            peer_addrs: db.open_tree("peer_addrs")?,
            outbox: db.open_tree("outbox")?,
            outbox_ids: db.open_tree("outbox_ids")?,
            db,
            write_lock: Mutex::new(()),
        })
    }

    /// Upsert a log row by msg_id, advancing its status.
    pub fn store_message(
        &self,
        envelope: &MessageEnvelope,
        direction: Direction,
        status: DeliveryState,
    ) -> Result<(), MailboxError> {
        let record = MessageRecord {
            msg_id: envelope.msg_id.clone(),
            thread_id: envelope.thread_id.clone(),
            from_addr: envelope.from_addr.clone(),
            to_addr: envelope.to_addr.clone(),
            sent_at: envelope.sent_at.clone(),
            subject: envelope.payload.subject.clone(),
            intent: envelope.payload.intent,
            body: envelope.payload.body.clone(),
            envelope_json: serde_json::to_string(envelope)?,
            encrypted: envelope.encrypted,
            direction,
            status,
            created_at: now_iso(),
        };
        let bytes = bincode::serialize(&record)?;

        let _guard = self.write_lock.lock();
        self.messages.insert(record.msg_id.as_bytes(), bytes)?;
        debug!(
            "stored message {} ({:?}/{:?})",
            record.msg_id, direction, status
        );
        Ok(())
    }

    /// Newest first by `sent_at`, optionally filtered by direction.
    pub fn get_messages(
        &self,
        direction: Option<Direction>,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, MailboxError> {
        let mut records = Vec::new();
        for item in self.messages.iter() {
            let (_, value) = item?;
            let record: MessageRecord = bincode::deserialize(&value)?;
            if direction.map_or(true, |d| record.direction == d) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.sent_at.cmp(&a.sent_at));
        records.truncate(limit);
        Ok(records)
    }

    pub fn get_message(&self, msg_id: &str) -> Result<Option<MessageRecord>, MailboxError> {
        match self.messages.get(msg_id.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Upsert by node_id; the record is also reachable by address.
    pub fn upsert_peer(&self, peer: &PeerInfo) -> Result<(), MailboxError> {
        let bytes = bincode::serialize(peer)?;

        let _guard = self.write_lock.lock();
        if let Some(prev) = self.peers.get(peer.node_id.as_bytes())? {
            let prev: PeerInfo = bincode::deserialize(&prev)?;
            if prev.address != peer.address {
                self.peer_addrs.remove(prev.address.as_bytes())?;
            }
        }
        self.peers.insert(peer.node_id.as_bytes(), bytes)?;
        self.peer_addrs
            .insert(peer.address.as_bytes(), peer.node_id.as_bytes())?;
        Ok(())
    }

    /// All known peers, most recently seen first.
    pub fn get_peers(&self) -> Result<Vec<PeerInfo>, MailboxError> {
        let mut peers = Vec::new();
        for item in self.peers.iter() {
            let (_, value) = item?;
            peers.push(bincode::deserialize::<PeerInfo>(&value)?);
        }
        peers.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(peers)
    }

    pub fn get_peer_by_address(&self, address: &str) -> Result<Option<PeerInfo>, MailboxError> {
        let Some(node_id) = self.peer_addrs.get(address.as_bytes())? else {
            return Ok(None);
        };
        match self.peers.get(&node_id)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Queue an envelope for retry. Re-queueing an existing msg_id replaces
    /// the prior entry and moves it to the tail.
    pub fn queue_outbox(&self, envelope: &MessageEnvelope) -> Result<(), MailboxError> {
        let entry = OutboxEntry {
            msg_id: envelope.msg_id.clone(),
            to_addr: envelope.to_addr.clone(),
            envelope_json: serde_json::to_string(envelope)?,
            attempts: 0,
            status: OutboxState::Pending,
        };
        let bytes = bincode::serialize(&entry)?;

        let _guard = self.write_lock.lock();
        if let Some(prev_key) = self.outbox_ids.get(entry.msg_id.as_bytes())? {
            self.outbox.remove(&prev_key)?;
        }
        let key = self.db.generate_id()?.to_be_bytes();
        self.outbox.insert(key, bytes)?;
        self.outbox_ids
            .insert(entry.msg_id.as_bytes(), key.to_vec())?;
        debug!("queued {} for {}", entry.msg_id, entry.to_addr);
        Ok(())
    }

    /// Pending entries in insertion order.
    pub fn get_pending_outbox(&self) -> Result<Vec<OutboxEntry>, MailboxError> {
        let mut entries = Vec::new();
        for item in self.outbox.iter() {
            let (_, value) = item?;
            let entry: OutboxEntry = bincode::deserialize(&value)?;
            if entry.status == OutboxState::Pending {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub fn is_outbox_pending(&self, msg_id: &str) -> Result<bool, MailboxError> {
        let Some(key) = self.outbox_ids.get(msg_id.as_bytes())? else {
            return Ok(false);
        };
        match self.outbox.get(&key)? {
            Some(value) => {
                let entry: OutboxEntry = bincode::deserialize(&value)?;
                Ok(entry.status == OutboxState::Pending)
            }
            None => Ok(false),
        }
    }

    pub fn mark_outbox_sent(&self, msg_id: &str) -> Result<(), MailboxError> {
        self.update_outbox_entry(msg_id, |entry| entry.status = OutboxState::Sent)
    }

    pub fn mark_outbox_failed(&self, msg_id: &str, attempts: u32) -> Result<(), MailboxError> {
        self.update_outbox_entry(msg_id, |entry| {
            entry.attempts = attempts;
            entry.status = OutboxState::Pending;
        })
    }

    fn update_outbox_entry(
        &self,
        msg_id: &str,
        apply: impl FnOnce(&mut OutboxEntry),
    ) -> Result<(), MailboxError> {
        let _guard = self.write_lock.lock();
        let Some(key) = self.outbox_ids.get(msg_id.as_bytes())? else {
            return Ok(());
        };
        let Some(value) = self.outbox.get(&key)? else {
            return Ok(());
        };
        let mut entry: OutboxEntry = bincode::deserialize(&value)?;
        apply(&mut entry);
        self.outbox.insert(&key, bincode::serialize(&entry)?)?;
        Ok(())
    }
}
