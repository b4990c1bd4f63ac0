use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Path, Request, State};
use axum::Json;

use gorch_core::action::{Action, ActionRequest};
use gorch_core::GorchError;

use super::NodeState;
use crate::error::AppError;

/// Request bodies larger than this are refused.
pub const BODY_LIMIT: usize = 10 * 1024 * 1024;

/// The address of whoever sent `req`, when the server recorded it.
pub fn peer_ip(req: &Request) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

async fn read_body(req: Request) -> Result<axum::body::Bytes, AppError> {
    axum::body::to_bytes(req.into_body(), BODY_LIMIT)
        .await
        .map_err(|e| AppError::bad_request(format!("unreadable body: {e}")))
}

/// GET /: node status.
pub async fn status(State(node): State<NodeState>) -> Json<serde_json::Value> {
    tracing::debug!("status check");
    let actions = node.actions().await;
    Json(serde_json::json!({
        "name": node.config.name,
        "status": "up",
        "actions": actions.len(),
        "running": node.resources().active_handles(),
        "resources": node.resources().groups(),
    }))
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

/// GET /data/: every loaded data file.
pub async fn get_all_data(
    State(node): State<NodeState>,
) -> Result<Json<serde_json::Value>, AppError> {
    Ok(Json(serde_json::to_value(&*node.data().await)?))
}

/// GET /data/:file
pub async fn get_data_file(
    State(node): State<NodeState>,
    Path(file): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let data = node.data().await;
    let object = data.get(&file)?;
    Ok(Json(serde_json::Value::Object(object.clone())))
}

/// GET /list/: names of the loaded data files.
pub async fn list_data(State(node): State<NodeState>) -> Json<Vec<String>> {
    let data = node.data().await;
    Json(data.files().into_iter().map(str::to_string).collect())
}

/// GET /list/:file: top-level keys of one data file.
pub async fn list_data_file(
    State(node): State<NodeState>,
    Path(file): Path<String>,
) -> Result<Json<Vec<String>>, AppError> {
    let data = node.data().await;
    let keys = data.keys(&file)?;
    Ok(Json(keys.into_iter().map(str::to_string).collect()))
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// GET /action/: the loaded action table.
pub async fn list_actions(
    State(node): State<NodeState>,
) -> Result<Json<serde_json::Value>, AppError> {
    Ok(Json(serde_json::to_value(&*node.actions().await)?))
}

/// GET /action/:name
pub async fn get_action(
    State(node): State<NodeState>,
    Path(name): Path<String>,
) -> Result<Json<Action>, AppError> {
    let actions = node.actions().await;
    let action = actions
        .get(&name)
        .cloned()
        .ok_or(GorchError::ActionNotFound(name))?;
    Ok(Json(action))
}

/// POST /action/:name: run a loaded action.
pub async fn run_action(
    State(node): State<NodeState>,
    Path(name): Path<String>,
    req: Request,
) -> Result<String, AppError> {
    tracing::debug!(action = %name, "run action");
    let peer = peer_ip(&req);
    let body = read_body(req).await?;
    let parsed = ActionRequest::parse(&body)?;

    let actions = node.actions().await;
    let action = actions
        .get(&name)
        .ok_or_else(|| GorchError::ActionNotFound(name.clone()))?;

    let stream = parsed.stream.map(|s| s.resolve(peer));
    let outcome = node.executor.run(action, stream, &parsed.params).await?;
    Ok(outcome.into_body())
}

/// POST /action/: run an action defined in the request body.
pub async fn run_adhoc_action(
    State(node): State<NodeState>,
    req: Request,
) -> Result<String, AppError> {
    if !node.config.arbitrary_actions {
        tracing::debug!("ad hoc action refused");
        return Err(GorchError::AdhocDisabled.into());
    }
    let peer = peer_ip(&req);
    let body = read_body(req).await?;
    let parsed = ActionRequest::parse(&body)?;
    let mut action = parsed
        .adhoc
        .ok_or_else(|| AppError::bad_request("missing 'action' definition"))?;
    if action.name.is_empty() {
        action.name = "adhoc".to_string();
    }
    tracing::debug!(action = %action.name, "run ad hoc action");

    let stream = parsed.stream.map(|s| s.resolve(peer));
    let outcome = node.executor.run(&action, stream, &parsed.params).await?;
    Ok(outcome.into_body())
}

/// POST /reload/: re-read actions and data from disk.
pub async fn reload(State(node): State<NodeState>) -> Result<Json<serde_json::Value>, AppError> {
    let (actions, data_files) = node.reload().await?;
    Ok(Json(serde_json::json!({
        "actions": actions,
        "data_files": data_files,
    })))
}
