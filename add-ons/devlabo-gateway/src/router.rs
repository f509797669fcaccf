use crate::error::ApiError;
use crate::files::{self, ApiRoute};
use crate::handlers::chat::agent_chat;
use crate::{proxy, websocket};
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State, WebSocketUpgrade};
use axum::http::Request;
use axum::response::Response;
use axum::routing::{any, get, post};
use axum::{Json, Router};
use devlabo_core::{InstanceRegistry, Module, ProjectKey, SandboxConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub registry: InstanceRegistry,
    pub config: Arc<SandboxConfig>,
    /// Shared client for proxying and the agent. Never follows redirects so the
    /// browser sees the module server's own `Location` headers.
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(registry: InstanceRegistry) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .pool_max_idle_per_host(20)
            .build()?;
        Ok(Self {
            config: registry.config().clone(),
            registry,
            http,
        })
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agent/chat", post(agent_chat))
        .route("/connect/:user/:project/:module", any(connect_root))
        .route("/connect/:user/:project/:module/", any(connect_root))
        .route("/connect/:user/:project/:module/*path", any(connect_path))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "gateway": "ok",
        "instances": state.registry.snapshot(),
    }))
}

async fn connect_root(
    State(state): State<AppState>,
    Path((user, project, module)): Path<(String, String, String)>,
    client: Option<ConnectInfo<SocketAddr>>,
    upgrade: Option<WebSocketUpgrade>,
    req: Request<Body>,
) -> Result<Response, ApiError> {
    let target = Target {
        user,
        project,
        module,
        path: String::new(),
    };
    dispatch(state, target, client, upgrade, req).await
}

async fn connect_path(
    State(state): State<AppState>,
    Path((user, project, module, path)): Path<(String, String, String, String)>,
    client: Option<ConnectInfo<SocketAddr>>,
    upgrade: Option<WebSocketUpgrade>,
    req: Request<Body>,
) -> Result<Response, ApiError> {
    let target = Target {
        user,
        project,
        module,
        path,
    };
    dispatch(state, target, client, upgrade, req).await
}

/// Raw `/connect/{user}/{project}/{module}/{path}` segments.
struct Target {
    user: String,
    project: String,
    module: String,
    path: String,
}

/// Resolves the instance (cold-starting it if needed), then serves a reserved
/// endpoint, bridges a WebSocket upgrade, or proxies to the module's dev server.
async fn dispatch(
    state: AppState,
    target: Target,
    client: Option<ConnectInfo<SocketAddr>>,
    upgrade: Option<WebSocketUpgrade>,
    req: Request<Body>,
) -> Result<Response, ApiError> {
    let module: Module = target.module.parse()?;
    let key = ProjectKey::new(target.user, target.project)?;
    let instance = state.registry.get_or_create(&key).await?;
    let path = target.path;

    match (ApiRoute::parse(&path), upgrade) {
        (Some(route), _) => files::serve(&instance, module, route, req).await,
        (None, Some(upgrade)) => {
            websocket::forward(
                &state,
                &instance,
                module,
                &path,
                req.headers(),
                req.uri().query(),
                upgrade,
            )
            .await
        }
        (None, None) => {
            let client = client.map(|ConnectInfo(addr)| addr);
            proxy::forward(&state, &instance, module, &path, client, req).await
        }
    }
}
