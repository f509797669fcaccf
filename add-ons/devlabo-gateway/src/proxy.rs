//! Streaming reverse proxy from `/connect/...` to a module dev server on loopback.

use crate::error::ApiError;
use crate::router::AppState;
use axum::body::Body;
use axum::http::header::HOST;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request};
use axum::response::Response;
use devlabo_core::{Module, ProjectKey, SandboxInstance};
use std::net::SocketAddr;

/// Connection-scoped headers that must not cross the proxy in either direction.
pub const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Copy of `headers` without hop-by-hop entries.
pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

pub(crate) fn upstream_url(scheme: &str, port: u16, path: &str, query: Option<&str>) -> String {
    let mut url = format!("{scheme}://127.0.0.1:{port}/{}", path.trim_start_matches('/'));
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(q);
    }
    url
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Forwards `req` to the module's dev server and streams the answer back.
pub async fn forward(
    state: &AppState,
    instance: &SandboxInstance,
    module: Module,
    path: &str,
    client: Option<SocketAddr>,
    req: Request<Body>,
) -> Result<Response, ApiError> {
    let port = instance.module_endpoint(module).await?;
    instance.touch();
    let key: &ProjectKey = instance.key();
    let url = upstream_url("http", port, path, req.uri().query());

    let (parts, body) = req.into_parts();
    let mut headers = filter_headers(&parts.headers);
    headers.remove(HOST);
    set_header(
        &mut headers,
        "x-forwarded-for",
        &client.map(|c| c.ip().to_string()).unwrap_or_else(|| "unknown".into()),
    );
    set_header(
        &mut headers,
        "x-forwarded-proto",
        parts.uri.scheme_str().unwrap_or("http"),
    );
    set_header(&mut headers, "x-devlabo-user", &key.user_id);
    set_header(&mut headers, "x-devlabo-project", &key.project_id);

    tracing::debug!(target: "devlabo::gateway", user = %key.user_id, project = %key.project_id, module = %module, method = %parts.method, %url, "proxying");

    let upstream = state
        .http
        .request(parts.method, &url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()))
        .timeout(state.config.proxy_timeout())
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ApiError::ProxyTimeout(format!("{module} server timed out"))
            } else {
                ApiError::ProxyConnect(format!("cannot reach {module} server: {e}"))
            }
        })?;

    let mut response = Response::builder().status(upstream.status());
    if let Some(out) = response.headers_mut() {
        *out = filter_headers(upstream.headers());
    }
    response
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| ApiError::ProxyConnect(format!("invalid upstream response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("content-type", HeaderValue::from_static("text/html"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let filtered = filter_headers(&headers);
        assert_eq!(filtered.len(), 3);
        assert!(filtered.get("connection").is_none());
        assert!(filtered.get("transfer-encoding").is_none());
        assert_eq!(filtered.get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn builds_loopback_urls() {
        assert_eq!(upstream_url("http", 3002, "", None), "http://127.0.0.1:3002/");
        assert_eq!(
            upstream_url("http", 3002, "src/main.js", Some("v=1&t=2")),
            "http://127.0.0.1:3002/src/main.js?v=1&t=2"
        );
        assert_eq!(upstream_url("http", 3001, "/a", Some("")), "http://127.0.0.1:3001/a");
        assert_eq!(upstream_url("ws", 3001, "hmr", Some("token=1")), "ws://127.0.0.1:3001/hmr?token=1");
    }
}
