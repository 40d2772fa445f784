// LAN peer discovery: advertise this node over mDNS and keep a live view of
// the peers around it.
//
// Resolution failures are logged and dropped; a later advertisement refresh
// re-triggers resolution. Removals are advisory only — the mailbox keeps the
// peer record for future re-resolution.

use std::sync::Arc;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const SERVICE_TYPE: &str = "_agentmail._tcp.local.";

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mdns error: {0}")]
    Mdns(#[from] mdns_sd::Error),
}

/// A peer resolved from its mDNS advertisement.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub node_id: String,
    pub node_name: String,
    pub host: String,
    pub port: u16,
    pub pubkey: String,
    pub encrypt_pubkey: String,
}

pub type PeerFoundFn = dyn Fn(DiscoveredPeer) + Send + Sync;
pub type PeerRemovedFn = dyn Fn(String) + Send + Sync;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub node_id: String,
    pub node_name: String,
    pub port: u16,
    pub pubkey: String,
    pub encrypt_pubkey: String,
}

/// Advertises this node and browses for others until shut down.
pub struct PeerDiscovery {
    daemon: ServiceDaemon,
    fullname: String,
    browse_task: JoinHandle<()>,
}

impl PeerDiscovery {
    pub fn start(
        config: DiscoveryConfig,
        on_peer_found: Arc<PeerFoundFn>,
        on_peer_removed: Arc<PeerRemovedFn>,
    ) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new()?;

        let local_ip = local_ip();
        let prefix_len = config.node_id.len().min(8);
        let instance = format!("{}-{}", config.node_name, &config.node_id[..prefix_len]);
        let host_name = format!("{}.local.", instance);
        let properties = [
            ("node_id", config.node_id.as_str()),
            ("node_name", config.node_name.as_str()),
            ("pubkey", config.pubkey.as_str()),
            ("encrypt_pubkey", config.encrypt_pubkey.as_str()),
            ("v", "0"),
        ];
        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &instance,
            &host_name,
            local_ip.as_str(),
            config.port,
            &properties[..],
        )?;
        let fullname = service.get_fullname().to_string();
        daemon.register(service)?;
        info!("advertising as {fullname} at {local_ip}:{}", config.port);

        let receiver = daemon.browse(SERVICE_TYPE)?;
        let self_id = config.node_id.clone();
        let browse_task = tokio::spawn(async move {
            while let Ok(event) = receiver.recv_async().await {
                match event {
                    ServiceEvent::ServiceResolved(resolved) => {
                        handle_resolved(&resolved, &self_id, on_peer_found.as_ref());
                    }
                    ServiceEvent::ServiceRemoved(_, name) => {
                        on_peer_removed(name);
                    }
                    _ => {}
                }
            }
        });

        Ok(Self {
            daemon,
            fullname,
            browse_task,
        })
    }

    pub fn shutdown(&self) {
        self.browse_task.abort();
        if let Err(e) = self.daemon.unregister(&self.fullname) {
            warn!("mdns unregister failed: {e}");
        }
        if let Err(e) = self.daemon.shutdown() {
            warn!("mdns shutdown failed: {e}");
        }
        info!("discovery stopped");
    }
}

fn handle_resolved(resolved: &ServiceInfo, self_id: &str, on_peer_found: &PeerFoundFn) {
    let node_id = resolved
        .get_property_val_str("node_id")
        .unwrap_or_default()
        .to_string();
    // Never register our own advertisement; a node must not route to itself.
    if node_id.is_empty() || node_id == self_id {
        return;
    }

    let Some(address) = resolved.get_addresses().iter().next() else {
        debug!("service {} resolved without addresses", resolved.get_fullname());
        return;
    };

    let peer = DiscoveredPeer {
        node_id,
        node_name: resolved
            .get_property_val_str("node_name")
            .unwrap_or("unknown")
            .to_string(),
        host: address.to_string(),
        port: resolved.get_port(),
        pubkey: resolved
            .get_property_val_str("pubkey")
            .unwrap_or_default()
            .to_string(),
        encrypt_pubkey: resolved
            .get_property_val_str("encrypt_pubkey")
            .unwrap_or_default()
            .to_string(),
    };
    info!(
        "discovered peer {} at {}:{}",
        peer.node_name, peer.host, peer.port
    );
    on_peer_found(peer);
}

/// LAN address of this machine. A connect-only UDP probe reads the local
/// endpoint without sending a packet; loopback if there is no route.
pub fn local_ip() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_service(node_id: &str, name: &str) -> ServiceInfo {
        let properties = [
            ("node_id", node_id),
            ("node_name", name),
            ("pubkey", "pk"),
            ("encrypt_pubkey", "ek"),
            ("v", "0"),
        ];
        ServiceInfo::new(
            SERVICE_TYPE,
            &format!("{name}-{node_id}"),
            &format!("{name}.local."),
            "192.168.1.42",
            7443,
            &properties[..],
        )
        .unwrap()
    }

    #[test]
    fn test_local_ip_is_parseable() {
        let ip = local_ip();
        assert!(ip.parse::<std::net::IpAddr>().is_ok());
    }

    #[test]
    fn test_resolved_service_becomes_peer() {
        let found = Arc::new(AtomicUsize::new(0));
        let found_clone = found.clone();
        let service = make_service("fp_bob", "bob");

        handle_resolved(&service, "fp_alice", &move |peer: DiscoveredPeer| {
            assert_eq!(peer.node_id, "fp_bob");
            assert_eq!(peer.node_name, "bob");
            assert_eq!(peer.host, "192.168.1.42");
            assert_eq!(peer.port, 7443);
            assert_eq!(peer.pubkey, "pk");
            found_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(found.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_own_advertisement_is_skipped() {
        let service = make_service("fp_alice", "alice");
        handle_resolved(&service, "fp_alice", &|_| {
            panic!("must not report self as a peer");
        });
    }
}
