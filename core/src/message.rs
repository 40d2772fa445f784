// Message envelope and peer models.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope protocol version.
pub const PROTOCOL_VERSION: u32 = 0;

/// Default envelope time-to-live: 7 days.
pub const DEFAULT_TTL_SEC: u64 = 604_800;

pub fn new_msg_id() -> String {
    Uuid::new_v4().to_string()
}

/// RFC3339 UTC timestamp with fixed-width microseconds so stored timestamps
/// compare lexicographically.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

fn default_ttl() -> u64 {
    DEFAULT_TTL_SEC
}

fn default_true() -> bool {
    true
}

/// Semantic kind of a payload. `Encrypted` is the on-the-wire sealed form,
/// not a user-facing intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    HumanMessage,
    Task,
    Notify,
    Ask,
    ToolCall,
    ToolResult,
    Encrypted,
}

impl Default for Intent {
    fn default() -> Self {
        Intent::HumanMessage
    }
}

/// Optional descriptor of the agent behind a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub requires_human_approval: bool,
}

fn default_agent_name() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default)]
    pub intent: Intent,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub agent: Option<AgentInfo>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl MessagePayload {
    /// The sealed form carried on the wire when an envelope is encrypted.
    pub fn encrypted_sentinel(sealed_b64: String) -> Self {
        Self {
            intent: Intent::Encrypted,
            subject: "[encrypted]".to_string(),
            body: sealed_b64,
            agent: None,
            metadata: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(default)]
    pub v: u32,
    #[serde(default = "new_msg_id")]
    pub msg_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
    pub from_addr: String,
    pub to_addr: String,
    #[serde(default = "now_iso")]
    pub sent_at: String,
    #[serde(default = "default_ttl")]
    pub ttl_sec: u64,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub payload: MessagePayload,
}

impl MessageEnvelope {
    pub fn new(from_addr: String, to_addr: String, payload: MessagePayload) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            msg_id: new_msg_id(),
            thread_id: None,
            from_addr,
            to_addr,
            sent_at: now_iso(),
            ttl_sec: DEFAULT_TTL_SEC,
            signature: None,
            encrypted: false,
            payload,
        }
    }

    /// Canonical signature pre-image. Signatures cover routing and timing,
    /// never the (possibly re-encrypted) payload bytes.
    pub fn signing_bytes(&self) -> Vec<u8> {
        format!(
            "{}:{}:{}:{}",
            self.msg_id, self.from_addr, self.to_addr, self.sent_at
        )
        .into_bytes()
    }
}

/// A known peer: keys always, network location when the LAN has seen it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: String,
    pub node_name: String,
    /// Routing address, e.g. "alice@alice.local".
    pub address: String,
    /// IP on the local network; empty for relay-only peers.
    pub host: String,
    pub port: u16,
    /// Base64 Ed25519 verify key.
    pub pubkey: String,
    /// Base64 X25519 encryption key.
    pub encrypt_pubkey: String,
    #[serde(default = "now_iso")]
    pub last_seen: String,
}

/// Body of POST /v0/send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub to: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub intent: Intent,
    #[serde(default = "default_true")]
    pub encrypt: bool,
}

/// Response of GET /v0/identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: String,
    pub node_name: String,
    pub address: String,
    pub pubkey: String,
    pub encrypt_pubkey: String,
    pub fingerprint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_defaults() {
        let env = MessageEnvelope::new(
            "alice@alice.local".into(),
            "bob@bob.local".into(),
            MessagePayload::default(),
        );
        assert_eq!(env.v, PROTOCOL_VERSION);
        assert_eq!(env.ttl_sec, DEFAULT_TTL_SEC);
        assert!(!env.encrypted);
        assert!(env.signature.is_none());
        assert!(env.thread_id.is_none());

        let other = MessageEnvelope::new(
            "alice@alice.local".into(),
            "bob@bob.local".into(),
            MessagePayload::default(),
        );
        assert_ne!(env.msg_id, other.msg_id);
    }

    #[test]
    fn test_signing_bytes_layout() {
        let mut env = MessageEnvelope::new(
            "alice@alice.local".into(),
            "bob@bob.local".into(),
            MessagePayload::default(),
        );
        env.msg_id = "m1".into();
        env.sent_at = "2026-08-01T00:00:00.000000+00:00".into();
        assert_eq!(
            env.signing_bytes(),
            b"m1:alice@alice.local:bob@bob.local:2026-08-01T00:00:00.000000+00:00".to_vec()
        );
    }

    #[test]
    fn test_intent_wire_names() {
        assert_eq!(
            serde_json::to_string(&Intent::HumanMessage).unwrap(),
            "\"human_message\""
        );
        assert_eq!(
            serde_json::from_str::<Intent>("\"tool_call\"").unwrap(),
            Intent::ToolCall
        );
    }

    #[test]
    fn test_encrypted_sentinel_shape() {
        let payload = MessagePayload::encrypted_sentinel("c2VhbGVk".into());
        assert_eq!(payload.intent, Intent::Encrypted);
        assert_eq!(payload.subject, "[encrypted]");
        assert_eq!(payload.body, "c2VhbGVk");
        assert!(payload.agent.is_none());
    }

    #[test]
    fn test_send_request_minimal_json() {
        let req: SendRequest = serde_json::from_str(r#"{"to":"bob@bob.local"}"#).unwrap();
        assert_eq!(req.to, "bob@bob.local");
        assert_eq!(req.intent, Intent::HumanMessage);
        assert!(req.encrypt);
        assert!(req.subject.is_empty());
    }

    #[test]
    fn test_envelope_json_round_trip() {
        let mut env = MessageEnvelope::new(
            "alice@alice.local".into(),
            "bob@bob.local".into(),
            MessagePayload {
                intent: Intent::Task,
                subject: "deploy".into(),
                body: "ship it".into(),
                agent: Some(AgentInfo {
                    name: "builder".into(),
                    capabilities: vec!["deploy".into()],
                    requires_human_approval: true,
                }),
                metadata: serde_json::Map::new(),
            },
        );
        env.thread_id = Some("t-1".into());

        let json = serde_json::to_string(&env).unwrap();
        let back: MessageEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(env, back);
    }

    #[test]
    fn test_now_iso_is_fixed_width() {
        let a = now_iso();
        let b = now_iso();
        assert_eq!(a.len(), b.len());
        assert!(a.ends_with("+00:00"));
    }
}
