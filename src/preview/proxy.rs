//! Catch-all reverse proxy to the active local preview.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue, Method, header};
use axum::response::Response;
use tracing::debug;

use super::local::LocalPreviewManager;
use crate::errors::{OrchestratorError, OrchestratorResult};

/// Response headers that belong to a single hop and are never relayed.
const HOP_BY_HOP: &[header::HeaderName] = &[header::TRANSFER_ENCODING, header::CONNECTION];

#[derive(Clone)]
pub struct PreviewProxy {
    local: Arc<LocalPreviewManager>,
    client: reqwest::Client,
}

impl PreviewProxy {
    pub fn new(local: Arc<LocalPreviewManager>) -> anyhow::Result<Self> {
        // Redirects are relayed to the caller, never followed here.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { local, client })
    }

    /// Forward `req` verbatim to the ready preview and stream the answer back.
    pub async fn forward(&self, req: Request) -> OrchestratorResult<Response> {
        let (host, port) = self
            .local
            .ready_target()
            .ok_or(OrchestratorError::PreviewNotReady)?;
        let authority = format!("{}:{}", host, port);

        let (parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://{}{}", authority, path_and_query);
        debug!(method = %parts.method, %url, "Proxying to local preview");

        let mut headers = parts.headers;
        headers.remove(header::HOST);
        if let Ok(value) = HeaderValue::from_str(&authority) {
            headers.insert(header::HOST, value);
        }

        let mut upstream = self
            .client
            .request(parts.method.clone(), &url)
            .headers(headers);
        if parts.method != Method::GET && parts.method != Method::HEAD {
            upstream = upstream.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let resp = upstream
            .send()
            .await
            .map_err(|e| OrchestratorError::UpstreamUnreachable(e.to_string()))?;

        let status = resp.status();
        let mut response_headers = HeaderMap::with_capacity(resp.headers().len());
        for (name, value) in resp.headers() {
            if !HOP_BY_HOP.contains(name) {
                response_headers.append(name.clone(), value.clone());
            }
        }

        let mut response = Response::new(Body::from_stream(resp.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalPreviewSection;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::response::{IntoResponse, Redirect};
    use axum::routing::{get, post};
    use http_body_util::BodyExt;

    async fn echo(headers: HeaderMap, body: axum::body::Bytes) -> impl IntoResponse {
        let host = headers
            .get(header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string();
        ([("x-upstream-host", host)], body)
    }

    async fn upstream() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let app = Router::new()
            .route("/", get(|| async { "home" }))
            .route("/login", get(|| async { Redirect::to("/dashboard?from=login") }))
            .route("/echo", post(echo));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    async fn ready_proxy(port: u16) -> (PreviewProxy, Arc<LocalPreviewManager>, tempfile::TempDir) {
        let local = Arc::new(LocalPreviewManager::new(LocalPreviewSection {
            host: "127.0.0.1".into(),
            port,
            start_command: vec!["sleep".into(), "30".into()],
            start_timeout_secs: 10,
            health_path: "/".into(),
            probe_interval_ms: 50,
        }));
        let dir = tempfile::tempdir().unwrap();
        local.start("gen-1", dir.path()).await.unwrap();
        (PreviewProxy::new(local.clone()).unwrap(), local, dir)
    }

    #[tokio::test]
    async fn test_no_active_preview_is_not_ready() {
        let local = Arc::new(LocalPreviewManager::new(LocalPreviewSection::default()));
        let proxy = PreviewProxy::new(local).unwrap();
        let req = Request::builder().uri("/anything").body(Body::empty()).unwrap();
        let err = proxy.forward(req).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PreviewNotReady));
    }

    #[tokio::test]
    async fn test_redirect_is_relayed_untouched() {
        let port = upstream().await;
        let (proxy, local, _dir) = ready_proxy(port).await;

        let req = Request::builder()
            .uri("/login")
            .header(header::HOST, "public.example.com")
            .body(Body::empty())
            .unwrap();
        let resp = proxy.forward(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SEE_OTHER);
        assert_eq!(
            resp.headers().get(header::LOCATION).unwrap(),
            "/dashboard?from=login"
        );
        local.stop().await;
    }

    #[tokio::test]
    async fn test_post_body_and_host_reach_upstream() {
        let port = upstream().await;
        let (proxy, local, _dir) = ready_proxy(port).await;

        let req = Request::builder()
            .method("POST")
            .uri("/echo")
            .header(header::HOST, "public.example.com")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"a":1}"#))
            .unwrap();
        let resp = proxy.forward(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("x-upstream-host").unwrap().to_str().unwrap(),
            format!("127.0.0.1:{}", port)
        );
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], br#"{"a":1}"#);
        local.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_upstream() {
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let local = Arc::new(LocalPreviewManager::new(LocalPreviewSection {
            host: "127.0.0.1".into(),
            port,
            start_command: vec!["sleep".into(), "30".into()],
            start_timeout_secs: 1,
            health_path: "/".into(),
            probe_interval_ms: 50,
        }));
        let dir = tempfile::tempdir().unwrap();
        // nothing listens, so readiness comes from the start timeout
        local.start("gen-1", dir.path()).await.unwrap();

        let proxy = PreviewProxy::new(local.clone()).unwrap();
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let err = proxy.forward(req).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::UpstreamUnreachable(_)));
        local.stop().await;
    }
}
