// Relay HTTP surface (/v0) and background cleanup.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};
use warp::http::StatusCode;
use warp::Filter;

use super::protocol::{
    AckRequest, AckResponse, DepositRequest, DepositResponse, PickupResponse, RegisterRequest,
    RegisterResponse,
};
use super::store::RelayStore;
use crate::config::RelayConfig;

/// Expired rows are swept on this cadence.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

type JsonReply = warp::reply::WithStatus<warp::reply::Json>;

fn json_ok<T: Serialize>(value: &T) -> JsonReply {
    warp::reply::with_status(warp::reply::json(value), StatusCode::OK)
}

fn json_detail(code: StatusCode, detail: &str) -> JsonReply {
    warp::reply::with_status(
        warp::reply::json(&serde_json::json!({ "detail": detail })),
        code,
    )
}

fn with_store(
    store: Arc<RelayStore>,
) -> impl Filter<Extract = (Arc<RelayStore>,), Error = Infallible> + Clone {
    warp::any().map(move || store.clone())
}

#[derive(Debug, Deserialize)]
struct PickupQuery {
    #[serde(default)]
    since: f64,
}

/// The full /v0 filter tree over a shared store.
pub fn routes(
    store: Arc<RelayStore>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let deposit = warp::path!("v0" / "deposit")
        .and(warp::post())
        .and(warp::body::content_length_limit(1 << 20))
        .and(warp::body::json())
        .and(with_store(store.clone()))
        .and_then(handle_deposit);

    let pickup = warp::path!("v0" / "pickup" / String)
        .and(warp::get())
        .and(warp::query::<PickupQuery>())
        .and(with_store(store.clone()))
        .and_then(handle_pickup);

    let ack = warp::path!("v0" / "ack" / String)
        .and(warp::post())
        .and(warp::body::content_length_limit(1 << 20))
        .and(warp::body::json())
        .and(with_store(store.clone()))
        .and_then(handle_ack);

    let register = warp::path!("v0" / "register")
        .and(warp::post())
        .and(warp::body::content_length_limit(64 * 1024))
        .and(warp::body::json())
        .and(with_store(store.clone()))
        .and_then(handle_register);

    let lookup = warp::path!("v0" / "lookup" / String)
        .and(warp::get())
        .and(with_store(store.clone()))
        .and_then(handle_lookup);

    let stats = warp::path!("v0" / "stats")
        .and(warp::get())
        .and(with_store(store))
        .and_then(handle_stats);

    deposit.or(pickup).or(ack).or(register).or(lookup).or(stats)
}

async fn handle_deposit(
    req: DepositRequest,
    store: Arc<RelayStore>,
) -> Result<JsonReply, warp::Rejection> {
    match store.deposit(&req) {
        Ok(()) => {
            info!(
                "deposited {} for {} from {}",
                req.msg_id, req.recipient_fingerprint, req.sender_fingerprint
            );
            Ok(json_ok(&DepositResponse {
                status: "ok".into(),
                msg_id: req.msg_id,
            }))
        }
        Err(e) => {
            error!("deposit failed: {e}");
            Ok(json_detail(StatusCode::INTERNAL_SERVER_ERROR, "store error"))
        }
    }
}

async fn handle_pickup(
    recipient: String,
    query: PickupQuery,
    store: Arc<RelayStore>,
) -> Result<JsonReply, warp::Rejection> {
    match store.pickup(&recipient, query.since) {
        Ok(messages) => {
            let count = messages.len();
            Ok(json_ok(&PickupResponse { messages, count }))
        }
        Err(e) => {
            error!("pickup failed: {e}");
            Ok(json_detail(StatusCode::INTERNAL_SERVER_ERROR, "store error"))
        }
    }
}

async fn handle_ack(
    recipient: String,
    req: AckRequest,
    store: Arc<RelayStore>,
) -> Result<JsonReply, warp::Rejection> {
    match store.ack(&recipient, &req.msg_ids) {
        Ok(removed) => Ok(json_ok(&AckResponse {
            status: "ok".into(),
            removed,
        })),
        Err(e) => {
            error!("ack failed: {e}");
            Ok(json_detail(StatusCode::INTERNAL_SERVER_ERROR, "store error"))
        }
    }
}

async fn handle_register(
    req: RegisterRequest,
    store: Arc<RelayStore>,
) -> Result<JsonReply, warp::Rejection> {
    match store.register(&req) {
        Ok(()) => {
            info!("registered: {} -> {}", req.name, req.fingerprint);
            Ok(json_ok(&RegisterResponse {
                status: "ok".into(),
                name: req.name,
            }))
        }
        Err(e) => {
            error!("register failed: {e}");
            Ok(json_detail(StatusCode::INTERNAL_SERVER_ERROR, "store error"))
        }
    }
}

async fn handle_lookup(
    name: String,
    store: Arc<RelayStore>,
) -> Result<JsonReply, warp::Rejection> {
    match store.lookup(&name) {
        Ok(Some(entry)) => Ok(json_ok(&entry)),
        Ok(None) => Ok(json_detail(
            StatusCode::NOT_FOUND,
            &format!("Agent '{name}' not found"),
        )),
        Err(e) => {
            error!("lookup failed: {e}");
            Ok(json_detail(StatusCode::INTERNAL_SERVER_ERROR, "store error"))
        }
    }
}

async fn handle_stats(store: Arc<RelayStore>) -> Result<JsonReply, warp::Rejection> {
    match store.stats() {
        Ok(stats) => Ok(json_ok(&stats)),
        Err(e) => {
            error!("stats failed: {e}");
            Ok(json_detail(StatusCode::INTERNAL_SERVER_ERROR, "store error"))
        }
    }
}

async fn cleanup_loop(store: Arc<RelayStore>) {
    loop {
        match store.cleanup_expired() {
            Ok(removed) if removed > 0 => info!("cleaned up {} expired message(s)", removed),
            Ok(_) => {}
            Err(e) => error!("cleanup error: {e}"),
        }
        tokio::time::sleep(CLEANUP_INTERVAL).await;
    }
}

/// A running relay server.
pub struct RelayHandle {
    pub local_addr: SocketAddr,
    pub store: Arc<RelayStore>,
    shutdown_tx: oneshot::Sender<()>,
    server: JoinHandle<()>,
    cleanup: JoinHandle<()>,
}

impl RelayHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        self.cleanup.abort();
        let _ = self.cleanup.await;
        let _ = self.server.await;
    }
}

/// Open the store, start the cleanup loop, and serve the relay API.
pub async fn start(config: &RelayConfig) -> anyhow::Result<RelayHandle> {
    config.ensure_dirs()?;
    let store = Arc::new(RelayStore::open(&config.db_path())?);

    let stats = store.stats()?;
    info!(
        "relay holding {} message(s) ({} bytes)",
        stats.messages_held, stats.total_bytes
    );

    let cleanup = tokio::spawn(cleanup_loop(store.clone()));

    let bind_addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (local_addr, server_fut) = warp::serve(routes(store.clone()))
        .try_bind_with_graceful_shutdown(bind_addr, async move {
            shutdown_rx.await.ok();
        })?;
    let server = tokio::spawn(server_fut);
    info!("relay listening on {local_addr}");

    Ok(RelayHandle {
        local_addr,
        store,
        shutdown_tx,
        server,
        cleanup,
    })
}
