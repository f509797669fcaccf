//! DevLabo gateway binary.

use devlabo_core::{build_store, InstanceRegistry, SandboxConfig};
use devlabo_gateway::{build_app, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[devlabo-gateway] .env not loaded: {} (using system environment)", e);
    }

    let config = match SandboxConfig::load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("[devlabo-gateway] invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    // Daily rolling file next to stdout when log_dir is set. The guard flushes on exit.
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "devlabo-gateway.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    let store = match build_store(&config).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(target: "devlabo::gateway", error = %e, "object store unavailable");
            std::process::exit(1);
        }
    };
    tracing::info!(
        target: "devlabo::gateway",
        backend = store.backend(),
        workspace_root = %config.workspace_root.display(),
        "object store ready"
    );

    let registry = match InstanceRegistry::new(config.clone(), store) {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!(target: "devlabo::gateway", error = %e, "registry init failed");
            std::process::exit(1);
        }
    };
    let state = match AppState::new(registry.clone()) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(target: "devlabo::gateway", error = %e, "http client init failed");
            std::process::exit(1);
        }
    };
    let sweeper = registry.spawn_sweeper();
    let app = build_app(state);

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(target: "devlabo::gateway", addr = %config.bind_addr, error = %e, "bind failed");
            std::process::exit(1);
        }
    };
    tracing::info!(target: "devlabo::gateway", addr = %config.bind_addr, "DevLabo gateway listening");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!(target: "devlabo::gateway", "shutdown requested, draining instances");
    });
    if let Err(e) = server.await {
        tracing::error!(target: "devlabo::gateway", error = %e, "server error");
    }

    sweeper.abort();
    registry.shutdown_all().await;
    tracing::info!(target: "devlabo::gateway", "shutdown complete");
}
