// Node HTTP surface (/v0): identity, peers, messages, send, inbox ingest.

use std::convert::Infallible;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::error;
use warp::http::StatusCode;
use warp::Filter;

use crate::identity::Identity;
use crate::mailbox::{Direction, Mailbox};
use crate::message::{MessageEnvelope, NodeIdentity, SendRequest};
use crate::router::Router;

const DEFAULT_LIST_LIMIT: usize = 100;
const BODY_LIMIT: u64 = 1 << 20;

/// Shared state behind every handler.
pub struct AppState {
    pub identity: Arc<Identity>,
    pub mailbox: Arc<Mailbox>,
    pub router: Arc<Router>,
    pub node_name: String,
    pub node_address: String,
}

#[derive(Debug, Serialize)]
struct SendResponse {
    status: String,
    msg_id: String,
    delivered: bool,
}

#[derive(Debug, Serialize)]
struct InboxResponse {
    status: String,
    msg_id: String,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    direction: Option<String>,
    limit: Option<usize>,
}

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

fn with_state(
    state: Arc<AppState>,
) -> impl Filter<Extract = (Arc<AppState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// The full /v0 filter tree.
pub fn routes(
    state: Arc<AppState>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let identity = warp::path!("v0" / "identity")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_identity);

    let peers = warp::path!("v0" / "peers")
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_peers);

    let messages = warp::path!("v0" / "messages")
        .and(warp::get())
        .and(warp::query::<MessagesQuery>())
        .and(with_state(state.clone()))
        .and_then(get_messages);

    let message = warp::path!("v0" / "messages" / String)
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(get_message);

    let send = warp::path!("v0" / "send")
        .and(warp::post())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_state(state.clone()))
        .and_then(post_send);

    let inbox = warp::path!("v0" / "inbox")
        .and(warp::post())
        .and(warp::body::content_length_limit(BODY_LIMIT))
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(post_inbox);

    identity.or(peers).or(messages).or(message).or(send).or(inbox)
}

async fn get_identity(state: Arc<AppState>) -> Result<JsonReply, warp::Rejection> {
    let fingerprint = state.identity.fingerprint();
    Ok(json_ok(&NodeIdentity {
        node_id: fingerprint.clone(),
        node_name: state.node_name.clone(),
        address: state.node_address.clone(),
        pubkey: state.identity.pubkey_b64(),
        encrypt_pubkey: state.identity.encrypt_pubkey_b64(),
        fingerprint,
    }))
}

async fn get_peers(state: Arc<AppState>) -> Result<JsonReply, warp::Rejection> {
    match state.mailbox.get_peers() {
        Ok(peers) => Ok(json_ok(&peers)),
        Err(e) => {
            error!("peer listing failed: {e}");
            Ok(json_detail(StatusCode::INTERNAL_SERVER_ERROR, "store error"))
        }
    }
}

async fn get_messages(
    query: MessagesQuery,
    state: Arc<AppState>,
) -> Result<JsonReply, warp::Rejection> {
    let direction = match query.direction.as_deref() {
        None | Some("") => None,
        Some(raw) => match Direction::parse(raw) {
            Some(direction) => Some(direction),
            // an unknown direction matches nothing
            None => return Ok(json_ok(&Vec::<crate::mailbox::MessageRecord>::new())),
        },
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    match state.mailbox.get_messages(direction, limit) {
        Ok(records) => Ok(json_ok(&records)),
        Err(e) => {
            error!("message listing failed: {e}");
            Ok(json_detail(StatusCode::INTERNAL_SERVER_ERROR, "store error"))
        }
    }
}

async fn get_message(msg_id: String, state: Arc<AppState>) -> Result<JsonReply, warp::Rejection> {
    match state.mailbox.get_message(&msg_id) {
        Ok(Some(record)) => Ok(json_ok(&record)),
        Ok(None) => Ok(json_detail(StatusCode::NOT_FOUND, "Message not found")),
        Err(e) => {
            error!("message fetch failed: {e}");
            Ok(json_detail(StatusCode::INTERNAL_SERVER_ERROR, "store error"))
        }
    }
}

async fn post_send(req: SendRequest, state: Arc<AppState>) -> Result<JsonReply, warp::Rejection> {
    let envelope = match state
        .router
        .send(&req.to, &req.subject, &req.body, req.intent, req.encrypt)
        .await
    {
        Ok(envelope) => envelope,
        Err(e) => {
            error!("send failed: {e}");
            return Ok(json_detail(StatusCode::INTERNAL_SERVER_ERROR, "store error"));
        }
    };
    // delivered means "not waiting in the outbox": direct or relayed.
    let delivered = match state.mailbox.is_outbox_pending(&envelope.msg_id) {
        Ok(pending) => !pending,
        Err(e) => {
            error!("outbox check failed: {e}");
            return Ok(json_detail(StatusCode::INTERNAL_SERVER_ERROR, "store error"));
        }
    };
    Ok(json_ok(&SendResponse {
        status: "ok".into(),
        msg_id: envelope.msg_id,
        delivered,
    }))
}

async fn post_inbox(
    envelope: MessageEnvelope,
    state: Arc<AppState>,
) -> Result<JsonReply, warp::Rejection> {
    match state.router.receive(envelope).await {
        Ok(processed) => Ok(json_ok(&InboxResponse {
            status: "ok".into(),
            msg_id: processed.msg_id,
        })),
        Err(e) => {
            error!("inbox ingest failed: {e}");
            Ok(json_detail(StatusCode::INTERNAL_SERVER_ERROR, "store error"))
        }
    }
}
