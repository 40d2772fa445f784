// Routing state machine: compose and sign outgoing envelopes, drive each to
// a terminal state (delivered, relayed, queued), and process inbound mail.
//
// Network failures never surface to the caller; they select the next
// fallback. Store failures do surface — the log is the source of truth.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::identity::{fingerprint_of_b64, Identity};
use crate::mailbox::{DeliveryState, Direction, Mailbox, MailboxError};
use crate::message::{now_iso, Intent, MessageEnvelope, MessagePayload, PeerInfo};
use crate::relay::client::RelayClient;
use crate::relay::protocol::{DepositRequest, RegisterRequest};

/// Timeout for a direct POST to a peer's inbox.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Mailbox(#[from] MailboxError),
    #[error("payload encoding error: {0}")]
    Payload(#[from] serde_json::Error),
}

pub struct Router {
    identity: Arc<Identity>,
    mailbox: Arc<Mailbox>,
    node_address: String,
    relay: Option<RelayClient>,
    http: reqwest::Client,
}

impl Router {
    pub fn new(
        identity: Arc<Identity>,
        mailbox: Arc<Mailbox>,
        node_address: String,
        relay_url: Option<&str>,
    ) -> Self {
        let http = reqwest::Client::new();
        let relay = relay_url.map(|url| RelayClient::new(url, http.clone()));
        Self {
            identity,
            mailbox,
            node_address,
            relay,
            http,
        }
    }

    pub fn node_address(&self) -> &str {
        &self.node_address
    }

    /// Compose, sign, and deliver a message.
    ///
    /// Routing order:
    ///   1. known reachable peer → direct POST to its inbox
    ///   2. relay configured and peer keys known → relay deposit
    ///   3. otherwise → outbox queue for retry
    pub async fn send(
        &self,
        to_addr: &str,
        subject: &str,
        body: &str,
        intent: Intent,
        encrypt: bool,
    ) -> Result<MessageEnvelope, RouterError> {
        let mut envelope = MessageEnvelope::new(
            self.node_address.clone(),
            to_addr.to_string(),
            MessagePayload {
                intent,
                subject: subject.to_string(),
                body: body.to_string(),
                ..Default::default()
            },
        );
        envelope.signature = Some(self.identity.sign(&envelope.signing_bytes()));

        let mut peer = self.mailbox.get_peer_by_address(to_addr)?;
        if peer.is_none() && self.relay.is_some() {
            peer = self.lookup_from_relay(to_addr).await?;
        }

        if encrypt {
            match peer.as_ref().filter(|p| !p.encrypt_pubkey.is_empty()) {
                Some(p) => {
                    let payload_json = serde_json::to_vec(&envelope.payload)?;
                    match self.identity.seal_for(&payload_json, &p.encrypt_pubkey) {
                        Ok(sealed) => {
                            envelope.payload = MessagePayload::encrypted_sentinel(sealed);
                            envelope.encrypted = true;
                        }
                        Err(e) => {
                            warn!("could not seal payload for {to_addr}: {e}; sending in the clear")
                        }
                    }
                }
                None => warn!("no encryption key known for {to_addr}, sending in the clear"),
            }
        }

        self.mailbox
            .store_message(&envelope, Direction::Outbound, DeliveryState::Sending)?;

        let mut delivered = false;
        if let Some(p) = peer.as_ref() {
            delivered = self.deliver_to_peer(&envelope, p).await;
        }

        if !delivered && self.relay.is_some() {
            if let Some(p) = peer.as_ref() {
                if self.deposit_to_relay(&envelope, p).await {
                    self.mailbox.store_message(
                        &envelope,
                        Direction::Outbound,
                        DeliveryState::Relayed,
                    )?;
                    return Ok(envelope);
                }
            }
        }

        if delivered {
            self.mailbox
                .store_message(&envelope, Direction::Outbound, DeliveryState::Delivered)?;
        } else {
            self.mailbox.queue_outbox(&envelope)?;
            self.mailbox
                .store_message(&envelope, Direction::Outbound, DeliveryState::Queued)?;
            warn!("peer not reachable, queued message {}", envelope.msg_id);
        }
        Ok(envelope)
    }

    /// Resolve an address through the relay directory and cache the result
    /// as a relay-only peer. Lookup misses and network failures are not
    /// errors; they fall through to queueing.
    async fn lookup_from_relay(&self, to_addr: &str) -> Result<Option<PeerInfo>, RouterError> {
        let Some(relay) = self.relay.as_ref() else {
            return Ok(None);
        };
        let name = to_addr.split('@').next().unwrap_or(to_addr);
        match relay.lookup(name).await {
            Ok(Some(entry)) => {
                let peer = PeerInfo {
                    node_id: entry.fingerprint,
                    node_name: name.to_string(),
                    address: to_addr.to_string(),
                    host: String::new(), // no direct route; relay only
                    port: 0,
                    pubkey: entry.pubkey,
                    encrypt_pubkey: entry.encrypt_pubkey,
                    last_seen: now_iso(),
                };
                self.mailbox.upsert_peer(&peer)?;
                info!("resolved '{name}' from relay registry");
                Ok(Some(peer))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                warn!("relay lookup failed: {e}");
                Ok(None)
            }
        }
    }

    /// Direct HTTP delivery. Relay-only peer records have no route and are
    /// skipped.
    async fn deliver_to_peer(&self, envelope: &MessageEnvelope, peer: &PeerInfo) -> bool {
        if peer.host.is_empty() || peer.port == 0 {
            return false;
        }
        let url = format!("http://{}:{}/v0/inbox", peer.host, peer.port);
        match self
            .http
            .post(&url)
            .timeout(DELIVERY_TIMEOUT)
            .json(envelope)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                info!("delivered {} to {}:{}", envelope.msg_id, peer.host, peer.port);
                true
            }
            Ok(resp) => {
                warn!("delivery to {url} failed: {}", resp.status());
                false
            }
            Err(e) => {
                warn!("could not reach peer at {url}: {e}");
                false
            }
        }
    }

    async fn deposit_to_relay(&self, envelope: &MessageEnvelope, peer: &PeerInfo) -> bool {
        let Some(relay) = self.relay.as_ref() else {
            return false;
        };
        // The relay routing handle is recomputed from the peer's signing
        // key with the same rule as identity fingerprints.
        let recipient_fp = match fingerprint_of_b64(&peer.pubkey) {
            Ok(fp) => fp,
            Err(e) => {
                warn!("bad signing key cached for {}: {e}", peer.address);
                return false;
            }
        };
        let envelope_json = match serde_json::to_string(envelope) {
            Ok(json) => json,
            Err(e) => {
                error!("could not encode envelope {}: {e}", envelope.msg_id);
                return false;
            }
        };
        let sig_data = format!("{}:{}", envelope.msg_id, recipient_fp);
        let req = DepositRequest {
            msg_id: envelope.msg_id.clone(),
            recipient_fingerprint: recipient_fp.clone(),
            sender_fingerprint: self.identity.fingerprint(),
            encrypted_envelope: envelope_json,
            signature: self.identity.sign(sig_data.as_bytes()),
            ttl_sec: envelope.ttl_sec,
        };
        match relay.deposit(&req).await {
            Ok(()) => {
                info!("deposited {} to relay for {}", envelope.msg_id, recipient_fp);
                true
            }
            Err(e) => {
                warn!("relay deposit failed: {e}");
                false
            }
        }
    }

    /// Process an inbound envelope: verify, open, dedupe, persist.
    pub async fn receive(
        &self,
        mut envelope: MessageEnvelope,
    ) -> Result<MessageEnvelope, RouterError> {
        if let Some(signature) = envelope.signature.as_deref() {
            match self.mailbox.get_peer_by_address(&envelope.from_addr)? {
                Some(peer) => {
                    if !Identity::verify(&envelope.signing_bytes(), signature, &peer.pubkey) {
                        warn!(
                            "invalid signature on message {} from {}",
                            envelope.msg_id, envelope.from_addr
                        );
                    }
                }
                // Relay-delivered mail can arrive before discovery has
                // cached the sender's key; dropping it would lose mail.
                None => warn!(
                    "no key cached for {}, accepting {} unverified",
                    envelope.from_addr, envelope.msg_id
                ),
            }
        }

        if envelope.encrypted && envelope.payload.intent == Intent::Encrypted {
            match self.identity.open(&envelope.payload.body) {
                Ok(plaintext) => match serde_json::from_slice::<MessagePayload>(&plaintext) {
                    Ok(payload) => {
                        envelope.payload = payload;
                        envelope.encrypted = false;
                    }
                    Err(e) => error!(
                        "decrypted payload of {} is malformed: {e}",
                        envelope.msg_id
                    ),
                },
                // Keep the sealed form so a later key can still recover it.
                Err(e) => error!("failed to decrypt message {}: {e}", envelope.msg_id),
            }
        }

        if let Some(existing) = self.mailbox.get_message(&envelope.msg_id)? {
            if existing.direction == Direction::Inbound {
                return Ok(envelope);
            }
        }

        self.mailbox
            .store_message(&envelope, Direction::Inbound, DeliveryState::Delivered)?;
        info!("received message {} from {}", envelope.msg_id, envelope.from_addr);
        Ok(envelope)
    }

    /// One pass over the pending outbox in insertion order: direct delivery
    /// first, relay second; failure increments the attempt counter and
    /// leaves the entry pending.
    pub async fn retry_queued(&self) -> Result<(), RouterError> {
        for entry in self.mailbox.get_pending_outbox()? {
            let envelope: MessageEnvelope = match serde_json::from_str(&entry.envelope_json) {
                Ok(env) => env,
                Err(e) => {
                    error!("corrupt outbox entry {}: {e}", entry.msg_id);
                    continue;
                }
            };
            let Some(peer) = self.mailbox.get_peer_by_address(&envelope.to_addr)? else {
                continue;
            };

            if self.deliver_to_peer(&envelope, &peer).await {
                self.mailbox.mark_outbox_sent(&envelope.msg_id)?;
                self.mailbox
                    .store_message(&envelope, Direction::Outbound, DeliveryState::Delivered)?;
                info!("retry succeeded for {}", envelope.msg_id);
            } else if self.relay.is_some() && self.deposit_to_relay(&envelope, &peer).await {
                self.mailbox.mark_outbox_sent(&envelope.msg_id)?;
                self.mailbox
                    .store_message(&envelope, Direction::Outbound, DeliveryState::Relayed)?;
            } else {
                self.mailbox
                    .mark_outbox_failed(&envelope.msg_id, entry.attempts + 1)?;
            }
        }
        Ok(())
    }

    /// Pull waiting messages from the relay, feed them through the receive
    /// path, and acknowledge only the ones that were processed.
    pub async fn pull_from_relay(&self) -> Result<(), RouterError> {
        let Some(relay) = self.relay.as_ref() else {
            return Ok(());
        };
        let fingerprint = self.identity.fingerprint();
        let messages = match relay.pickup(&fingerprint, 0.0).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("could not pull from relay: {e}");
                return Ok(());
            }
        };
        if messages.is_empty() {
            return Ok(());
        }

        let mut acked = Vec::new();
        for held in messages {
            match serde_json::from_str::<MessageEnvelope>(&held.encrypted_envelope) {
                Ok(envelope) => match self.receive(envelope).await {
                    Ok(_) => {
                        info!("pulled {} from relay", held.msg_id);
                        acked.push(held.msg_id);
                    }
                    Err(e) => error!("failed to process relay message {}: {e}", held.msg_id),
                },
                Err(e) => error!("bad envelope in relay message {}: {e}", held.msg_id),
            }
        }

        if !acked.is_empty() {
            match relay.ack(&fingerprint, &acked).await {
                Ok(removed) => info!("acknowledged {removed} message(s) from relay"),
                Err(e) => warn!("relay ack failed: {e}"),
            }
        }
        Ok(())
    }

    /// Best-effort registration of this node in the relay directory so
    /// other nodes can resolve it by name.
    pub async fn register_with_relay(&self, node_name: &str) {
        let Some(relay) = self.relay.as_ref() else {
            return;
        };
        let req = RegisterRequest {
            name: node_name.to_string(),
            fingerprint: self.identity.fingerprint(),
            pubkey: self.identity.pubkey_b64(),
            encrypt_pubkey: self.identity.encrypt_pubkey_b64(),
        };
        match relay.register(&req).await {
            Ok(()) => info!("registered as '{node_name}' on relay {}", relay.base_url()),
            Err(e) => warn!("could not register with relay: {e}"),
        }
    }
}
