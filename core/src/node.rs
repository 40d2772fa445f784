// Node runtime: wires identity, mailbox, discovery, router, and the HTTP
// surface together, and runs the background loops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::api::{self, AppState};
use crate::config::NodeConfig;
use crate::discovery::{DiscoveredPeer, DiscoveryConfig, PeerDiscovery};
use crate::identity;
use crate::mailbox::Mailbox;
use crate::message::{now_iso, PeerInfo};
use crate::router::Router;

/// Outbox retry cadence.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(15);
/// Relay pickup cadence.
pub const RELAY_PULL_INTERVAL: Duration = Duration::from_secs(10);

/// A running node.
pub struct NodeHandle {
    pub local_addr: SocketAddr,
    pub mailbox: Arc<Mailbox>,
    pub router: Arc<Router>,
    shutdown_tx: oneshot::Sender<()>,
    server: JoinHandle<()>,
    retry: JoinHandle<()>,
    relay_pull: Option<JoinHandle<()>>,
    discovery: Option<PeerDiscovery>,
}

impl NodeHandle {
    /// Stop the loops, unregister from the LAN, and let in-flight HTTP
    /// requests drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        // Await the aborted loops so every store handle they hold is
        // released before the caller reopens the data directory.
        self.retry.abort();
        let _ = self.retry.await;
        if let Some(task) = self.relay_pull {
            task.abort();
            let _ = task.await;
        }
        if let Some(discovery) = &self.discovery {
            discovery.shutdown();
        }
        let _ = self.server.await;
        info!("agentmail daemon stopped");
    }
}

/// Bring a node up: load identity, open the mailbox, start discovery and the
/// background loops, and serve the HTTP API.
pub async fn start(config: NodeConfig) -> anyhow::Result<NodeHandle> {
    config.ensure_dirs()?;

    let identity = Arc::new(identity::store::load_or_create(&config.identity_path())?);
    info!("node identity: {}", identity.fingerprint());

    let mailbox = Arc::new(Mailbox::open(&config.db_path())?);
    let node_address = config.address();
    let relay_url = config.relay();
    let router = Arc::new(Router::new(
        identity.clone(),
        mailbox.clone(),
        node_address.clone(),
        relay_url.as_deref(),
    ));

    let state = Arc::new(AppState {
        identity: identity.clone(),
        mailbox: mailbox.clone(),
        router: router.clone(),
        node_name: config.node_name.clone(),
        node_address: node_address.clone(),
    });
    let bind_addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (local_addr, server_fut) =
        warp::serve(api::routes(state)).try_bind_with_graceful_shutdown(bind_addr, async move {
            shutdown_rx.await.ok();
        })?;
    let server = tokio::spawn(server_fut);

    // Advertise the port we actually bound, not the configured one (which
    // may be 0 for an ephemeral port).
    let discovery = if config.enable_mdns {
        let registry = mailbox.clone();
        let on_found = move |peer: DiscoveredPeer| {
            let record = PeerInfo {
                address: format!("{}@{}.local", peer.node_name, peer.node_name),
                node_id: peer.node_id,
                node_name: peer.node_name,
                host: peer.host,
                port: peer.port,
                pubkey: peer.pubkey,
                encrypt_pubkey: peer.encrypt_pubkey,
                last_seen: now_iso(),
            };
            match registry.upsert_peer(&record) {
                Ok(()) => info!(
                    "peer registered: {} ({}:{})",
                    record.node_name, record.host, record.port
                ),
                Err(e) => error!("failed to register peer {}: {e}", record.node_name),
            }
        };
        let on_removed = |name: String| info!("peer left the LAN: {name}");
        Some(PeerDiscovery::start(
            DiscoveryConfig {
                node_id: identity.fingerprint(),
                node_name: config.node_name.clone(),
                port: local_addr.port(),
                pubkey: identity.pubkey_b64(),
                encrypt_pubkey: identity.encrypt_pubkey_b64(),
            },
            Arc::new(on_found),
            Arc::new(on_removed),
        )?)
    } else {
        None
    };

    // Directory registration so other nodes can resolve us by name.
    router.register_with_relay(&config.node_name).await;

    let retry = tokio::spawn(retry_loop(router.clone()));
    let relay_pull = relay_url
        .is_some()
        .then(|| tokio::spawn(relay_pull_loop(router.clone())));

    info!("agentmail daemon listening on {local_addr} as {node_address}");
    if let Some(url) = &relay_url {
        info!("relay: {url}");
    }

    Ok(NodeHandle {
        local_addr,
        mailbox,
        router,
        shutdown_tx,
        server,
        retry,
        relay_pull,
        discovery,
    })
}

async fn retry_loop(router: Arc<Router>) {
    loop {
        if let Err(e) = router.retry_queued().await {
            error!("retry loop error: {e}");
        }
        tokio::time::sleep(RETRY_INTERVAL).await;
    }
}

async fn relay_pull_loop(router: Arc<Router>) {
    loop {
        if let Err(e) = router.pull_from_relay().await {
            error!("relay pull error: {e}");
        }
        tokio::time::sleep(RELAY_PULL_INTERVAL).await;
    }
}
