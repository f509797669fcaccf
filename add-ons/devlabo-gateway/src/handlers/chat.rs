//! Agent chat: validates the caller's project context and relays the message to the
//! configured agent service together with the file API base it should edit through.

use crate::error::ApiError;
use crate::router::AppState;
use axum::extract::State;
use axum::Json;
use devlabo_core::{Module, ProjectKey};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatContext {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "projectId")]
    pub project_id: String,
    #[serde(rename = "activeModule")]
    pub active_module: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub chat_history: Vec<serde_json::Value>,
    pub context: ChatContext,
}

/// What the agent service receives.
#[derive(Debug, Serialize)]
struct AgentRequest<'a> {
    message: &'a str,
    chat_history: &'a [serde_json::Value],
    context: &'a ChatContext,
    file_api: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<serde_json::Value>,
}

/// Gateway-relative base of the file API for `module` in `key`.
pub fn file_api_base(key: &ProjectKey, module: Module) -> String {
    format!("/connect/{}/{}/{}/api/files", key.user_id, key.project_id, module)
}

/// POST /agent/chat
pub async fn agent_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let key = ProjectKey::new(&req.context.user_id, &req.context.project_id)?;
    let module: Module = req.context.active_module.parse()?;
    let agent_url = state
        .config
        .agent_url
        .as_deref()
        .ok_or(ApiError::AgentUnavailable)?;

    tracing::info!(target: "devlabo::gateway", user = %key.user_id, project = %key.project_id, module = %module, "agent chat");

    let payload = AgentRequest {
        message: &req.message,
        chat_history: &req.chat_history,
        context: &req.context,
        file_api: file_api_base(&key, module),
    };
    let res = state
        .http
        .post(agent_url)
        .json(&payload)
        .timeout(state.config.proxy_timeout())
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ApiError::ProxyTimeout(format!("agent timed out: {e}"))
            } else {
                ApiError::Agent(format!("agent unreachable: {e}"))
            }
        })?;
    if !res.status().is_success() {
        return Err(ApiError::Agent(format!("agent returned {}", res.status())));
    }
    let reply: ChatResponse = res
        .json()
        .await
        .map_err(|e| ApiError::Agent(format!("invalid agent response: {e}")))?;
    Ok(Json(reply))
}
