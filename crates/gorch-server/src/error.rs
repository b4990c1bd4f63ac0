use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use gorch_core::GorchError;

// ---------------------------------------------------------------------------
// Internal sentinel for upstream failures
// ---------------------------------------------------------------------------

/// Carries an explicit 502 through the `anyhow::Error` chain when a node
/// cannot be reached from the orchestrator.
#[derive(Debug)]
struct UpstreamError(String);

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for UpstreamError {}

// ---------------------------------------------------------------------------
// AppError: unified error type for HTTP responses
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self(GorchError::InvalidBody(msg.into()).into())
    }

    pub fn bad_gateway(msg: impl Into<String>) -> Self {
        Self(UpstreamError(msg.into()).into())
    }

    /// Status code this error will be rendered with.
    pub fn status(&self) -> StatusCode {
        if self.0.downcast_ref::<UpstreamError>().is_some() {
            return StatusCode::BAD_GATEWAY;
        }
        match self.0.downcast_ref::<GorchError>() {
            Some(e) => match e {
                GorchError::InsufficientResources(_) | GorchError::ActionsBusy(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                GorchError::ActionNotFound(_)
                | GorchError::NodeNotRegistered(_)
                | GorchError::DataNotFound(_) => StatusCode::NOT_FOUND,
                GorchError::AdhocDisabled => StatusCode::FORBIDDEN,
                GorchError::UnknownResourceGroup(_)
                | GorchError::ReservedResourceGroup(_)
                | GorchError::InvalidResourceCount { .. }
                | GorchError::InvalidNodeName(_)
                | GorchError::TemplateParse { .. }
                | GorchError::MissingParameter(_)
                | GorchError::InvalidBody(_)
                | GorchError::CommandSpawn { .. }
                | GorchError::CommandFailed { .. } => StatusCode::BAD_REQUEST,
                GorchError::Io(_) | GorchError::Yaml(_) | GorchError::Json(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.0, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self.0, "request rejected");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn status_of(e: GorchError) -> StatusCode {
        AppError(e.into()).into_response().status()
    }

    #[test]
    fn admission_rejection_maps_to_503() {
        assert_eq!(
            status_of(GorchError::ActionsBusy(4)),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(GorchError::InsufficientResources("gpu".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn not_found_variants_map_to_404() {
        assert_eq!(
            status_of(GorchError::ActionNotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(GorchError::NodeNotRegistered("n".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(GorchError::DataNotFound("f".into())),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn command_failure_maps_to_400() {
        let e = GorchError::CommandFailed {
            command: "false".into(),
            status: "exit status: 1".into(),
            stderr: String::new(),
        };
        assert_eq!(status_of(e), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_of(GorchError::MissingParameter("x".into())),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn adhoc_disabled_maps_to_403() {
        assert_eq!(status_of(GorchError::AdhocDisabled), StatusCode::FORBIDDEN);
    }

    #[test]
    fn bad_gateway_constructor_maps_to_502() {
        let response = AppError::bad_gateway("node unreachable").into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn other_errors_map_to_500() {
        let response = AppError(anyhow::anyhow!("boom")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn body_carries_error_message() {
        let response = AppError(GorchError::ActionsBusy(3).into()).into_response();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "3 actions already running");
    }
}
