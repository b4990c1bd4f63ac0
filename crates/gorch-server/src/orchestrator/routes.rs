use std::net::IpAddr;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use gorch_core::action::{LOOPBACK, STREAM_ADDR_KEY};
use gorch_core::config::{validate_node_name, DispatchMode};

use super::registry::{NodeConnection, Registered};
use super::OrchestratorState;
use crate::error::AppError;
use crate::node::routes::{peer_ip, BODY_LIMIT};

// ---------------------------------------------------------------------------
// Hop-by-hop headers; never forwarded in either direction.
// ---------------------------------------------------------------------------

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn forwardable(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower != "host" && lower != "content-length" && !HOP_BY_HOP.contains(&lower.as_str())
}

/// GET /: orchestrator status.
pub async fn status(State(orch): State<OrchestratorState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "up",
        "num_nodes": orch.registry.len(),
        "dispatch": orch.config.dispatch,
    }))
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    pub name: String,
    #[serde(default)]
    pub addr: String,
    pub port: u16,
}

/// POST /register: add a node. An empty `addr` means the sender's address.
pub async fn register(
    State(orch): State<OrchestratorState>,
    req: Request,
) -> Result<Json<serde_json::Value>, AppError> {
    let peer = peer_ip(&req);
    let body = axum::body::to_bytes(req.into_body(), BODY_LIMIT)
        .await
        .map_err(|e| AppError::bad_request(format!("unreadable body: {e}")))?;
    let reg: RegisterBody = serde_json::from_slice(&body)
        .map_err(|e| AppError::bad_request(format!("invalid registration: {e}")))?;
    validate_node_name(&reg.name)?;

    let addr = if reg.addr.trim().is_empty() {
        peer.map(|ip| ip.to_string())
            .ok_or_else(|| AppError::bad_request("registration has no address"))?
    } else {
        reg.addr
    };

    let outcome = orch.registry.register(&reg.name, &addr, reg.port);
    Ok(Json(serde_json::json!({
        "name": reg.name,
        "new": outcome == Registered::New,
        "num_nodes": orch.registry.len(),
    })))
}

/// POST /ping/:name: refresh a node's heartbeat.
pub async fn ping(
    State(orch): State<OrchestratorState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    if let Err(e) = orch.registry.ping(&name) {
        tracing::warn!(node = %name, "ping from unregistered node");
        return Err(e.into());
    }
    Ok(StatusCode::OK)
}

/// POST /disconnect/:name: drop a node.
pub async fn disconnect(
    State(orch): State<OrchestratorState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    if orch.registry.disconnect(&name) {
        Ok(StatusCode::OK)
    } else {
        Err(gorch_core::GorchError::NodeNotRegistered(name).into())
    }
}

/// GET /nodes: registry snapshot.
pub async fn list_nodes(
    State(orch): State<OrchestratorState>,
) -> Json<std::collections::BTreeMap<String, NodeConnection>> {
    Json(orch.registry.list())
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// GET|POST /:node/*rest: forward to, or redirect at, the named node.
pub async fn dispatch(
    State(orch): State<OrchestratorState>,
    Path((node, rest)): Path<(String, String)>,
    req: Request,
) -> Result<Response, AppError> {
    let conn = orch.registry.lookup(&node)?;
    let mut url = format!("{}/{}", conn.base_url(), rest.trim_start_matches('/'));
    if let Some(query) = req.uri().query() {
        url.push('?');
        url.push_str(query);
    }

    match orch.config.dispatch {
        DispatchMode::Redirect => {
            tracing::info!(node = %conn.name, path = %rest, "redirecting request");
            Ok((
                StatusCode::TEMPORARY_REDIRECT,
                [(header::LOCATION, url)],
            )
                .into_response())
        }
        DispatchMode::Forward => forward(&orch, &conn, url, req).await,
    }
}

async fn forward(
    orch: &OrchestratorState,
    conn: &NodeConnection,
    url: String,
    req: Request,
) -> Result<Response, AppError> {
    tracing::info!(node = %conn.name, url = %url, "forwarding request");
    let peer = peer_ip(&req);
    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);

    let headers = forward_headers(req.headers());

    let mut body = axum::body::to_bytes(req.into_body(), BODY_LIMIT)
        .await
        .map_err(|e| AppError::bad_request(format!("unreadable body: {e}")))?
        .to_vec();
    if let Some(peer) = peer {
        if let Some(rewritten) = rewrite_loopback(&body, peer) {
            tracing::debug!(node = %conn.name, %peer, "resolved loopback stream address");
            body = rewritten;
        }
    }

    let upstream = orch
        .http
        .request(method, &url)
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| AppError::bad_gateway(format!("node {} unreachable: {e}", conn.name)))?;

    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if HOP_BY_HOP.contains(&name.as_str()) || *name == reqwest::header::CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| AppError::bad_gateway(format!("node {} response failed: {e}", conn.name)))?;
    builder
        .body(Body::from(bytes))
        .map_err(|e| AppError(e.into()))
}

/// Request headers to pass on to the node. Repeated headers keep every value.
fn forward_headers(incoming: &header::HeaderMap) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in incoming {
        if !forwardable(name.as_str()) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(n, v);
        }
    }
    headers
}

/// If `body` is a JSON object whose `stream_addr` is `loopback`, return it
/// with the address replaced by `peer`.
pub fn rewrite_loopback(body: &[u8], peer: IpAddr) -> Option<Vec<u8>> {
    let mut value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let object = value.as_object_mut()?;
    if object.get(STREAM_ADDR_KEY)?.as_str()? != LOOPBACK {
        return None;
    }
    object.insert(
        STREAM_ADDR_KEY.to_string(),
        serde_json::Value::String(peer.to_string()),
    );
    serde_json::to_vec(&value).ok()
}
