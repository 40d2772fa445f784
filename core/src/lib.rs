// AgentMail — local-first peer-to-peer mail for software agents.
//
// A node owns a signing identity, advertises itself over mDNS, keeps its
// mail in a local sled database, and exchanges signed (optionally sealed)
// envelopes with peers over HTTP, falling back to a relay for offline
// recipients.

pub mod api;
pub mod config;
pub mod discovery;
pub mod identity;
pub mod mailbox;
pub mod message;
pub mod node;
pub mod relay;
pub mod router;

pub use config::{NodeConfig, RelayConfig};
pub use identity::Identity;
pub use mailbox::Mailbox;
pub use message::{Intent, MessageEnvelope, MessagePayload, PeerInfo, SendRequest};
pub use node::NodeHandle;
pub use router::Router;
