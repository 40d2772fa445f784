// End-to-end delivery across real HTTP servers on ephemeral ports:
// direct LAN delivery, retry convergence, and relay store-and-forward.

use std::net::SocketAddr;
use std::time::Duration;

use agentmail_core::config::{NodeConfig, RelayConfig};
use agentmail_core::mailbox::{DeliveryState, MessageRecord};
use agentmail_core::message::{now_iso, NodeIdentity, PeerInfo};
use agentmail_core::{identity, node, relay};
use tempfile::TempDir;

fn node_config(name: &str, dir: &TempDir, relay_url: &str) -> NodeConfig {
    NodeConfig {
        node_name: name.into(),
        host: "127.0.0.1".into(),
        port: 0,
        data_dir: dir.path().to_path_buf(),
        relay_url: relay_url.into(),
        enable_mdns: false,
    }
}

async fn fetch_identity(addr: SocketAddr) -> NodeIdentity {
    reqwest::get(format!("http://{addr}/v0/identity"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn post_send(addr: SocketAddr, to: &str, subject: &str, body: &str) -> serde_json::Value {
    reqwest::Client::new()
        .post(format!("http://{addr}/v0/send"))
        .json(&serde_json::json!({
            "to": to,
            "subject": subject,
            "body": body,
            "intent": "human_message",
            "encrypt": true
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn fetch_inbound(addr: SocketAddr) -> Vec<MessageRecord> {
    reqwest::get(format!("http://{addr}/v0/messages?direction=inbound"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

fn peer_record(identity: &NodeIdentity, name: &str, host: &str, port: u16) -> PeerInfo {
    PeerInfo {
        node_id: identity.fingerprint.clone(),
        node_name: name.into(),
        address: format!("{name}@{name}.local"),
        host: host.into(),
        port,
        pubkey: identity.pubkey.clone(),
        encrypt_pubkey: identity.encrypt_pubkey.clone(),
        last_seen: now_iso(),
    }
}

#[tokio::test]
async fn lan_direct_delivery() {
    let bob_dir = tempfile::tempdir().unwrap();
    let alice_dir = tempfile::tempdir().unwrap();

    let bob = node::start(node_config("bob", &bob_dir, "")).await.unwrap();
    let alice = node::start(node_config("alice", &alice_dir, ""))
        .await
        .unwrap();

    // Stand in for mDNS: hand alice the peer record discovery would build.
    let bob_identity = fetch_identity(bob.local_addr).await;
    alice
        .mailbox
        .upsert_peer(&peer_record(
            &bob_identity,
            "bob",
            "127.0.0.1",
            bob.local_addr.port(),
        ))
        .unwrap();

    let resp = post_send(alice.local_addr, "bob@bob.local", "hi", "ping").await;
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["delivered"], true);
    let msg_id = resp["msg_id"].as_str().unwrap().to_string();

    let inbound = fetch_inbound(bob.local_addr).await;
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].subject, "hi");
    assert_eq!(inbound[0].body, "ping");
    assert_eq!(inbound[0].from_addr, "alice@alice.local");
    // sealed on the wire, opened in place on receipt
    assert!(!inbound[0].encrypted);

    let record = alice.mailbox.get_message(&msg_id).unwrap().unwrap();
    assert_eq!(record.status, DeliveryState::Delivered);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn retry_converges_when_peer_comes_back() {
    let bob_dir = tempfile::tempdir().unwrap();
    let alice_dir = tempfile::tempdir().unwrap();

    // Bob's identity exists on disk but his node is not running yet.
    std::fs::create_dir_all(bob_dir.path().join("keys")).unwrap();
    let bob_identity = {
        let id =
            identity::store::load_or_create(&bob_dir.path().join("keys/identity.json")).unwrap();
        NodeIdentity {
            node_id: id.fingerprint(),
            node_name: "bob".into(),
            address: "bob@bob.local".into(),
            pubkey: id.pubkey_b64(),
            encrypt_pubkey: id.encrypt_pubkey_b64(),
            fingerprint: id.fingerprint(),
        }
    };

    // Reserve a port for bob, then free it so the send fails first.
    let bob_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let alice = node::start(node_config("alice", &alice_dir, ""))
        .await
        .unwrap();
    alice
        .mailbox
        .upsert_peer(&peer_record(&bob_identity, "bob", "127.0.0.1", bob_port))
        .unwrap();

    let resp = post_send(alice.local_addr, "bob@bob.local", "queued", "see you later").await;
    assert_eq!(resp["delivered"], false);
    let msg_id = resp["msg_id"].as_str().unwrap().to_string();
    assert!(alice.mailbox.is_outbox_pending(&msg_id).unwrap());

    // Bob comes online on the reserved port.
    let mut bob_config = node_config("bob", &bob_dir, "");
    bob_config.port = bob_port;
    let bob = node::start(bob_config).await.unwrap();

    alice.router.retry_queued().await.unwrap();

    assert!(!alice.mailbox.is_outbox_pending(&msg_id).unwrap());
    let record = alice.mailbox.get_message(&msg_id).unwrap().unwrap();
    assert_eq!(record.status, DeliveryState::Delivered);

    let inbound = fetch_inbound(bob.local_addr).await;
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].subject, "queued");
    assert_eq!(inbound[0].body, "see you later");

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn relay_carries_mail_to_offline_recipient() {
    let relay_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();
    let alice_dir = tempfile::tempdir().unwrap();

    let relay_handle = relay::server::start(&RelayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        data_dir: relay_dir.path().to_path_buf(),
    })
    .await
    .unwrap();
    let relay_url = format!("http://{}", relay_handle.local_addr);

    // Bob registers in the directory, then goes offline.
    let bob = node::start(node_config("bob", &bob_dir, &relay_url))
        .await
        .unwrap();
    bob.shutdown().await;

    let alice = node::start(node_config("alice", &alice_dir, &relay_url))
        .await
        .unwrap();

    // No peer record for bob: the send resolves him via the directory and
    // deposits to the relay.
    let resp = post_send(alice.local_addr, "bob@bob.local", "hi", "ping").await;
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["delivered"], true); // relayed counts as delivered
    let msg_id = resp["msg_id"].as_str().unwrap().to_string();

    let record = alice.mailbox.get_message(&msg_id).unwrap().unwrap();
    assert_eq!(record.status, DeliveryState::Relayed);
    assert!(relay_handle.store.stats().unwrap().messages_held >= 1);

    // Bob comes back with the same identity and pulls his mail.
    let bob = node::start(node_config("bob", &bob_dir, &relay_url))
        .await
        .unwrap();
    bob.router.pull_from_relay().await.unwrap();

    let inbound = wait_for_inbound(bob.local_addr).await;
    assert_eq!(inbound[0].subject, "hi");
    assert_eq!(inbound[0].body, "ping");
    assert_eq!(inbound[0].from_addr, "alice@alice.local");
    assert!(!inbound[0].encrypted);

    // Acknowledged mail leaves the relay.
    let mut held = relay_handle.store.stats().unwrap().messages_held;
    for _ in 0..50 {
        if held == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        held = relay_handle.store.stats().unwrap().messages_held;
    }
    assert_eq!(held, 0);

    alice.shutdown().await;
    bob.shutdown().await;
    relay_handle.shutdown().await;
}

async fn wait_for_inbound(addr: SocketAddr) -> Vec<MessageRecord> {
    for _ in 0..50 {
        let inbound = fetch_inbound(addr).await;
        if !inbound.is_empty() {
            return inbound;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("no inbound message arrived");
}
