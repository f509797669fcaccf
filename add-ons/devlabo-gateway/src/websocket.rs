//! WebSocket bridge from `/connect/...` to a module dev server, used by hot-reload clients.

use crate::error::ApiError;
use crate::proxy::upstream_url;
use crate::router::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::Response;
use devlabo_core::{Module, SandboxInstance};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as UpstreamCloseFrame;
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens the upstream socket first so a dead module fails the request with a normal HTTP
/// error, then upgrades the client and relays frames both ways until either side closes.
pub async fn forward(
    state: &AppState,
    instance: &SandboxInstance,
    module: Module,
    path: &str,
    headers: &HeaderMap,
    query: Option<&str>,
    upgrade: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let port = instance.module_endpoint(module).await?;
    instance.touch();
    let key = instance.key().clone();
    let url = upstream_url("ws", port, path, query);

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| ApiError::ProxyConnect(format!("invalid upstream url {url}: {e}")))?;
    let outgoing = request.headers_mut();
    if let Some(protocols) = headers.get(axum::http::header::SEC_WEBSOCKET_PROTOCOL) {
        if let Ok(value) = HeaderValue::from_bytes(protocols.as_bytes()) {
            outgoing.insert(SEC_WEBSOCKET_PROTOCOL, value);
        }
    }
    for (name, value) in [
        ("x-devlabo-user", key.user_id.as_str()),
        ("x-devlabo-project", key.project_id.as_str()),
    ] {
        if let Ok(value) = HeaderValue::from_str(value) {
            outgoing.insert(HeaderName::from_static(name), value);
        }
    }

    debug!(target: "devlabo::gateway", user = %key.user_id, project = %key.project_id, module = %module, %url, "opening websocket");
    let connect = tokio_tungstenite::connect_async(request);
    let (upstream, response) = tokio::time::timeout(state.config.proxy_timeout(), connect)
        .await
        .map_err(|_| ApiError::ProxyTimeout(format!("{module} websocket handshake timed out")))?
        .map_err(|e| ApiError::ProxyConnect(format!("cannot open {module} websocket: {e}")))?;

    let selected = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let upgrade = match selected {
        Some(protocol) => upgrade.protocols([protocol]),
        None => upgrade,
    };
    let label = format!("{key}/{module}");
    Ok(upgrade.on_upgrade(move |socket| relay(socket, upstream, label)))
}

async fn relay(client: WebSocket, upstream: Upstream, label: String) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let inbound = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            if let Some(msg) = to_upstream(msg) {
                if upstream_tx.send(msg).await.is_err() {
                    break;
                }
            }
        }
        let _ = upstream_tx.close().await;
    };
    let outbound = async {
        while let Some(Ok(msg)) = upstream_rx.next().await {
            if let Some(msg) = to_client(msg) {
                if client_tx.send(msg).await.is_err() {
                    break;
                }
            }
        }
        let _ = client_tx.close().await;
    };
    tokio::select! {
        _ = inbound => {}
        _ = outbound => {}
    }
    debug!(target: "devlabo::gateway", socket = %label, "websocket closed");
}

// Each side answers its own pings, so control frames are not relayed.
fn to_upstream(msg: Message) -> Option<UpstreamMessage> {
    match msg {
        Message::Text(text) => Some(UpstreamMessage::Text(text)),
        Message::Binary(data) => Some(UpstreamMessage::Binary(data)),
        Message::Close(frame) => Some(UpstreamMessage::Close(frame.map(|f| UpstreamCloseFrame {
            code: CloseCode::from(f.code),
            reason: f.reason,
        }))),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

fn to_client(msg: UpstreamMessage) -> Option<Message> {
    match msg {
        UpstreamMessage::Text(text) => Some(Message::Text(text)),
        UpstreamMessage::Binary(data) => Some(Message::Binary(data)),
        UpstreamMessage::Close(frame) => Some(Message::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason,
        }))),
        UpstreamMessage::Ping(_) | UpstreamMessage::Pong(_) | UpstreamMessage::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_and_close_frames_cross_control_frames_do_not() {
        assert_eq!(
            to_upstream(Message::Text("reload".into())),
            Some(UpstreamMessage::Text("reload".into()))
        );
        assert_eq!(
            to_client(UpstreamMessage::Binary(vec![1, 2])),
            Some(Message::Binary(vec![1, 2]))
        );
        assert!(to_upstream(Message::Ping(vec![0])).is_none());
        assert!(to_client(UpstreamMessage::Pong(vec![0])).is_none());

        let closed = to_client(UpstreamMessage::Close(Some(UpstreamCloseFrame {
            code: CloseCode::Away,
            reason: "server restart".into(),
        })));
        match closed {
            Some(Message::Close(Some(frame))) => {
                assert_eq!(frame.code, 1001);
                assert_eq!(frame.reason, "server restart");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
