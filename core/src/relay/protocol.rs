// Relay wire protocol, shared by the relay server and its clients.

use serde::{Deserialize, Serialize};

use crate::message::DEFAULT_TTL_SEC;

fn default_ttl() -> u64 {
    DEFAULT_TTL_SEC
}

/// Sender deposits an opaque envelope for an offline recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositRequest {
    pub msg_id: String,
    pub recipient_fingerprint: String,
    pub sender_fingerprint: String,
    /// Envelope JSON; the relay never parses it.
    pub encrypted_envelope: String,
    /// Sender signature over "<msg_id>:<recipient_fingerprint>".
    pub signature: String,
    #[serde(default = "default_ttl")]
    pub ttl_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositResponse {
    pub status: String,
    pub msg_id: String,
}

/// One held message as returned by pickup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeldMessage {
    pub msg_id: String,
    pub sender_fingerprint: String,
    pub encrypted_envelope: String,
    pub deposited_at: f64,
    pub expires_at: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickupResponse {
    pub messages: Vec<HeldMessage>,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRequest {
    pub msg_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    pub status: String,
    pub removed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub fingerprint: String,
    pub pubkey: String,
    pub encrypt_pubkey: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub status: String,
    pub name: String,
}

/// Directory record: name → fingerprint + public keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub name: String,
    pub fingerprint: String,
    pub pubkey: String,
    pub encrypt_pubkey: String,
    pub registered_at: f64,
}

/// Operator stats; carries no identifying material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayStats {
    pub messages_held: u64,
    pub total_bytes: u64,
}
