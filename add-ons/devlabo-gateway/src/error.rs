//! HTTP error mapping. Every handler returns `Result<_, ApiError>`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use devlabo_core::SandboxError;

#[derive(Debug)]
pub enum ApiError {
    Sandbox(SandboxError),
    BadRequest(String),
    MethodNotAllowed(String),
    /// Upstream module server refused or dropped the connection.
    ProxyConnect(String),
    ProxyTimeout(String),
    AgentUnavailable,
    Agent(String),
}

impl From<SandboxError> for ApiError {
    fn from(err: SandboxError) -> Self {
        ApiError::Sandbox(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Sandbox(e) => match e {
                SandboxError::PathTraversal(_) | SandboxError::NotFound(_) => StatusCode::NOT_FOUND,
                SandboxError::UnknownModule(_) | SandboxError::InvalidProjectKey(_) => {
                    StatusCode::BAD_REQUEST
                }
                SandboxError::InstanceStartFailure(_)
                | SandboxError::ModuleCrashed(_)
                | SandboxError::ModuleUnavailable(_)
                | SandboxError::SyncPullFailure(_)
                | SandboxError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
                SandboxError::SyncPushFailure(_) => StatusCode::BAD_GATEWAY,
                SandboxError::Io(io) if io.kind() == std::io::ErrorKind::AlreadyExists => {
                    StatusCode::CONFLICT
                }
                SandboxError::Io(io) if io.kind() == std::io::ErrorKind::InvalidInput => {
                    StatusCode::BAD_REQUEST
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::ProxyConnect(_) | ApiError::Agent(_) => StatusCode::BAD_GATEWAY,
            ApiError::ProxyTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::AgentUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Sandbox(e) => e.code(),
            ApiError::BadRequest(_) => "bad_request",
            ApiError::MethodNotAllowed(_) => "method_not_allowed",
            ApiError::ProxyConnect(_) => "upstream_unreachable",
            ApiError::ProxyTimeout(_) => "upstream_timeout",
            ApiError::AgentUnavailable => "agent_unavailable",
            ApiError::Agent(_) => "agent_error",
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Sandbox(e) => e.to_string(),
            ApiError::BadRequest(m)
            | ApiError::MethodNotAllowed(m)
            | ApiError::ProxyConnect(m)
            | ApiError::ProxyTimeout(m)
            | ApiError::Agent(m) => m.clone(),
            ApiError::AgentUnavailable => "no agent configured".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::warn!(target: "devlabo::gateway", status = status.as_u16(), error = %self.message(), "request failed");
        }
        let body = serde_json::json!({
            "error": self.code(),
            "message": self.message(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devlabo_core::Module;

    #[test]
    fn sandbox_errors_map_to_http() {
        let cases = [
            (SandboxError::PathTraversal("x".into()), StatusCode::NOT_FOUND),
            (SandboxError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (SandboxError::UnknownModule("x".into()), StatusCode::BAD_REQUEST),
            (SandboxError::ModuleCrashed(Module::Frontend), StatusCode::SERVICE_UNAVAILABLE),
            (SandboxError::Timeout("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (SandboxError::SyncPushFailure("x".into()), StatusCode::BAD_GATEWAY),
            (SandboxError::Process("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
        assert_eq!(ApiError::ProxyTimeout("t".into()).status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ApiError::ProxyConnect("c".into()).status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn body_carries_code_and_message() {
        let res = ApiError::from(SandboxError::UnknownModule("admin".into())).into_response();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["error"], "unknown_module");
        assert!(json["message"].as_str().unwrap().contains("admin"));
    }
}
