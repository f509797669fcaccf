//! Reserved per-module endpoints under `/connect/{user}/{project}/{module}/api/...`.
//! These are answered by the sandbox instance itself, never proxied.

use crate::error::ApiError;
use axum::body::Body;
use axum::extract::Query;
use axum::http::{Method, Request};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use devlabo_core::{Module, SandboxInstance};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Upper bound on file API request bodies.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRoute {
    Files,
    Status,
    Sync,
    Restart,
}

impl ApiRoute {
    /// Matches the module-relative request path against the reserved endpoints.
    pub fn parse(path: &str) -> Option<Self> {
        match path.trim_matches('/') {
            "api/files" => Some(ApiRoute::Files),
            "api/status" => Some(ApiRoute::Status),
            "api/sync" => Some(ApiRoute::Sync),
            "api/restart" => Some(ApiRoute::Restart),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PathQuery {
    path: Option<String>,
}

/// How `content` is carried in file API bodies. Files that are not valid UTF-8 are read
/// back as base64.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    #[serde(rename = "utf-8", alias = "utf8")]
    Utf8,
    Base64,
}

impl ContentEncoding {
    /// Text when `bytes` is UTF-8, base64 otherwise.
    pub fn encode(bytes: &[u8]) -> (Self, String) {
        match std::str::from_utf8(bytes) {
            Ok(text) => (ContentEncoding::Utf8, text.to_string()),
            Err(_) => (ContentEncoding::Base64, BASE64.encode(bytes)),
        }
    }

    pub fn decode(self, content: &str) -> Result<Vec<u8>, ApiError> {
        match self {
            ContentEncoding::Utf8 => Ok(content.as_bytes().to_vec()),
            ContentEncoding::Base64 => BASE64
                .decode(content)
                .map_err(|e| ApiError::BadRequest(format!("invalid base64 content: {e}"))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WriteRequest {
    path: String,
    content: String,
    #[serde(default)]
    encoding: ContentEncoding,
}

#[derive(Debug, Deserialize)]
struct RenameRequest {
    old_path: String,
    new_path: String,
}

async fn json_body<T: DeserializeOwned>(body: Body) -> Result<T, ApiError> {
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::BadRequest(format!("unreadable body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

fn query_path(req: &Request<Body>) -> Result<Option<String>, ApiError> {
    let Query(q) = Query::<PathQuery>::try_from_uri(req.uri())
        .map_err(|e| ApiError::BadRequest(e.body_text()))?;
    Ok(q.path.filter(|p| !p.is_empty()))
}

fn required_path(req: &Request<Body>) -> Result<String, ApiError> {
    query_path(req)?.ok_or_else(|| ApiError::BadRequest("missing ?path=".into()))
}

pub async fn serve(
    instance: &SandboxInstance,
    module: Module,
    route: ApiRoute,
    req: Request<Body>,
) -> Result<Response, ApiError> {
    match (route, req.method().clone()) {
        (ApiRoute::Files, Method::GET) => match query_path(&req)? {
            None => Ok(Json(instance.file_list(module).await?).into_response()),
            Some(path) => {
                let record = instance.file_stat(module, &path).await?;
                let (encoding, content) =
                    ContentEncoding::encode(record.content.as_deref().unwrap_or_default());
                Ok(Json(json!({
                    "path": path,
                    "content": content,
                    "encoding": encoding,
                    "content_hash": record.content_hash,
                    "last_modified": record.last_modified,
                }))
                .into_response())
            }
        },
        (ApiRoute::Files, Method::POST) => {
            let body: WriteRequest = json_body(req.into_body()).await?;
            let content = body.encoding.decode(&body.content)?;
            let bytes = instance.file_write(module, &body.path, &content).await?;
            Ok(Json(json!({ "status": "ok", "path": body.path, "bytes": bytes })).into_response())
        }
        (ApiRoute::Files, Method::DELETE) => {
            let path = required_path(&req)?;
            instance.file_delete(module, &path).await?;
            Ok(Json(json!({ "status": "ok", "path": path })).into_response())
        }
        (ApiRoute::Files, Method::PATCH) => {
            let body: RenameRequest = json_body(req.into_body()).await?;
            instance
                .file_rename(module, &body.old_path, &body.new_path)
                .await?;
            Ok(Json(json!({
                "status": "ok",
                "old_path": body.old_path,
                "new_path": body.new_path,
            }))
            .into_response())
        }
        (ApiRoute::Status, Method::GET) => Ok(Json(instance.status().await).into_response()),
        (ApiRoute::Sync, Method::POST) => Ok(Json(instance.sync_now().await?).into_response()),
        (ApiRoute::Restart, Method::POST) => {
            instance.restart_module(module).await?;
            Ok(Json(json!({ "status": "ok", "module": module })).into_response())
        }
        (route, method) => Err(ApiError::MethodNotAllowed(format!(
            "{method} not allowed on {route:?}"
        ))),
    }
}
