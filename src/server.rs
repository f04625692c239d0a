//! HTTPS webhook server and plain-HTTP metrics server
//!
//! The webhook server terminates TLS itself so the serving certificate can
//! be swapped under live connections: the rustls config delegates to the
//! [`CertStore`] resolver, and each handshake picks up whatever keypair the
//! watcher installed last.
//!
//! The admission adapter owns the wire contract: body-size and content-type
//! policing, envelope decode, echoing the request `uid`, and preserving the
//! request's `apiVersion` for backwards compatibility.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Request;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpBuilder;
use hyper_util::service::TowerToHyperService;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::admission::{AdmitFn, Hook};
use crate::cert_provider::CertStore;
use crate::error::Error;
use crate::metrics;

/// Maximum accepted admission request body: 10 MiB
pub const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Webhook server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// HTTPS port
    pub port: u16,
    /// Health check path
    pub healthz_path: String,
    /// Readiness check path
    pub readyz_path: String,
}

/// The webhook HTTPS server
pub struct WebhookServer {
    store: Arc<CertStore>,
    hooks: Vec<Hook>,
    config: ServerConfig,
}

impl WebhookServer {
    /// Create a server presenting certificates from `store` and dispatching
    /// to `hooks`
    pub fn new(store: Arc<CertStore>, hooks: Vec<Hook>, config: ServerConfig) -> Self {
        Self {
            store,
            hooks,
            config,
        }
    }

    /// Build the router: health endpoints plus one POST route per hook
    pub fn router(&self) -> Router {
        let mut router = Router::new().route(&self.config.healthz_path, get(healthz));

        let store = Arc::clone(&self.store);
        router = router.route(
            &self.config.readyz_path,
            get(move || {
                let store = Arc::clone(&store);
                async move { readyz(&store) }
            }),
        );

        for hook in &self.hooks {
            let admit = hook.admit.clone();
            router = router.route(
                &hook.path,
                post(move |req: Request| {
                    let admit = admit.clone();
                    async move { handle_admission(admit, req).await }
                }),
            );
            info!(path = %hook.path, kind = %hook.hook_type, "Registered webhook");
        }

        router
    }

    /// Serve HTTPS until the token is cancelled.
    ///
    /// TLS handshakes fail until the first serving certificate lands in the
    /// store; the readiness probe keeps traffic away until then.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), Error> {
        let router = self.router();

        let tls_config = rustls::ServerConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS12,
            &rustls::version::TLS13,
        ])
        .with_no_client_auth()
        .with_cert_resolver(Arc::clone(&self.store) as Arc<dyn rustls::server::ResolvesServerCert>);
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "Webhook HTTPS server listening");

        loop {
            let (tcp_stream, remote_addr) = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Webhook server shutting down");
                    return Ok(());
                }
                result = listener.accept() => match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!(error = %e, "Failed to accept TCP connection");
                        continue;
                    }
                }
            };

            let acceptor = acceptor.clone();
            let router = router.clone();
            tokio::spawn(async move {
                let tls_stream = match acceptor.accept(tcp_stream).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(%remote_addr, error = %e, "TLS handshake failed");
                        return;
                    }
                };

                let service = TowerToHyperService::new(router);
                if let Err(e) = HttpBuilder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(tls_stream), service)
                    .await
                {
                    debug!(%remote_addr, error = %e, "Error serving connection");
                }
            });
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

fn readyz(store: &CertStore) -> Response {
    if store.ready() {
        (StatusCode::OK, "ok").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "certificate not ready").into_response()
    }
}

/// Decode an admission review, dispatch to the hook, and write the envelope
async fn handle_admission(admit: AdmitFn, req: Request) -> Response {
    let content_type = req
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    if content_type != "application/json" && !content_type.starts_with("application/json;") {
        return (
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            format!("unsupported content type: {}", content_type),
        )
            .into_response();
    }

    let body = match axum::body::to_bytes(req.into_body(), MAX_REQUEST_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                "request body too large or unreadable",
            )
                .into_response();
        }
    };
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "empty request body").into_response();
    }

    let review: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                format!("failed to decode admission review: {}", e),
            )
                .into_response();
        }
    };
    let request_api_version = review.types.api_version.clone();

    let request: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(r) => r,
        Err(e) => {
            // Envelope without a usable request: answer inside the envelope
            // so the API server gets a structured failure.
            let response = AdmissionResponse::invalid(format!("invalid admission review: {}", e));
            return (
                StatusCode::OK,
                Json(finalize_review(response, request_api_version)),
            )
                .into_response();
        }
    };

    debug!(
        uid = %request.uid,
        operation = ?request.operation,
        name = %request.name,
        "Handling admission request"
    );

    let mut response = (admit)(&request);
    // The adapter owns the uid contract; handlers cannot break it.
    response.uid = request.uid.clone();

    (
        StatusCode::OK,
        Json(finalize_review(response, request_api_version)),
    )
        .into_response()
}

/// Wrap a response into a review envelope, preserving the request apiVersion
fn finalize_review(
    response: AdmissionResponse,
    request_api_version: String,
) -> AdmissionReview<DynamicObject> {
    let mut review = response.into_review();
    if !request_api_version.is_empty() {
        review.types.api_version = request_api_version;
    }
    review
}

/// Serve the metrics registry over plain HTTP until the token is cancelled
pub async fn start_metrics_server(
    port: u16,
    path: &str,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let router = Router::new().route(path, get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, path, "Metrics server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            info!("Metrics server shutting down");
        })
        .await?;
    Ok(())
}

async fn metrics_handler() -> Response {
    match metrics::encode_metrics() {
        Ok(body) => (
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::HookType;
    use crate::pki::SigningAuthority;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn allow_all_hook() -> Hook {
        Hook::new("/mutate", HookType::Mutating, |req| {
            AdmissionResponse::from(req)
        })
    }

    fn server_with(store: Arc<CertStore>) -> WebhookServer {
        WebhookServer::new(
            store,
            vec![allow_all_hook()],
            ServerConfig {
                port: 8443,
                healthz_path: "/healthz".to_string(),
                readyz_path: "/readyz".to_string(),
            },
        )
    }

    fn review_body(api_version: &str) -> String {
        json!({
            "apiVersion": api_version,
            "kind": "AdmissionReview",
            "request": {
                "uid": "e9137d7d-c318-11e8-bbad-025000000001",
                "kind": {"group": "", "version": "v1", "kind": "Pod"},
                "resource": {"group": "", "version": "v1", "resource": "pods"},
                "name": "web",
                "namespace": "default",
                "operation": "CREATE",
                "userInfo": {"username": "admin"},
                "object": {
                    "apiVersion": "v1",
                    "kind": "Pod",
                    "metadata": {"name": "web", "namespace": "default"}
                }
            }
        })
        .to_string()
    }

    fn post_json(path: &str, body: impl Into<Body>) -> Request {
        axum::http::Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_is_always_ok() {
        let router = server_with(Arc::new(CertStore::default())).router();
        let resp = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn readyz_reflects_certificate_state() {
        let store = Arc::new(CertStore::default());
        let router = server_with(Arc::clone(&store)).router();

        let resp = router
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/readyz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let ca = SigningAuthority::mint("test", Duration::from_secs(3600)).unwrap();
        let (cert_pem, key_pem) = ca
            .issue_serving(&["svc".to_string()], Duration::from_secs(3600))
            .unwrap();
        store.install(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();

        let resp = router
            .oneshot(
                axum::http::Request::builder()
                    .uri("/readyz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn admission_echoes_uid_and_allows() {
        let router = server_with(Arc::new(CertStore::default())).router();
        let resp = router
            .oneshot(post_json("/mutate", review_body("admission.k8s.io/v1")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["apiVersion"], "admission.k8s.io/v1");
        assert_eq!(body["kind"], "AdmissionReview");
        assert_eq!(
            body["response"]["uid"],
            "e9137d7d-c318-11e8-bbad-025000000001"
        );
        assert_eq!(body["response"]["allowed"], true);
    }

    #[tokio::test]
    async fn admission_preserves_request_api_version() {
        let router = server_with(Arc::new(CertStore::default())).router();
        let resp = router
            .oneshot(post_json("/mutate", review_body("admission.k8s.io/v1beta1")))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["apiVersion"], "admission.k8s.io/v1beta1");
    }

    #[tokio::test]
    async fn adapter_overrides_handler_uid() {
        let hook = Hook::new("/mutate", HookType::Mutating, |_req| {
            // A handler that forgets the uid entirely.
            AdmissionResponse::invalid("ignored")
        });
        let server = WebhookServer::new(
            Arc::new(CertStore::default()),
            vec![hook],
            ServerConfig {
                port: 8443,
                healthz_path: "/healthz".to_string(),
                readyz_path: "/readyz".to_string(),
            },
        );
        let resp = server
            .router()
            .oneshot(post_json("/mutate", review_body("admission.k8s.io/v1")))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(
            body["response"]["uid"],
            "e9137d7d-c318-11e8-bbad-025000000001"
        );
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let router = server_with(Arc::new(CertStore::default())).router();
        let resp = router
            .oneshot(post_json("/mutate", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn wrong_content_type_is_rejected() {
        let router = server_with(Arc::new(CertStore::default())).router();
        let req = axum::http::Request::builder()
            .method("POST")
            .uri("/mutate")
            .header(header::CONTENT_TYPE, "text/yaml")
            .body(Body::from(review_body("admission.k8s.io/v1")))
            .unwrap();
        let resp = router.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn undecodable_review_is_rejected() {
        let router = server_with(Arc::new(CertStore::default())).router();
        let resp = router
            .oneshot(post_json("/mutate", "{not json"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn review_without_request_gets_structured_failure() {
        let router = server_with(Arc::new(CertStore::default())).router();
        let body = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview"
        })
        .to_string();
        let resp = router.oneshot(post_json("/mutate", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["response"]["allowed"], false);
        assert!(body["response"]["status"]["message"]
            .as_str()
            .unwrap_or_default()
            .contains("invalid admission review")
            || body["response"]["result"]["message"]
                .as_str()
                .unwrap_or_default()
                .contains("invalid admission review"));
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let router = server_with(Arc::new(CertStore::default())).router();
        let oversized = vec![b' '; MAX_REQUEST_BODY_BYTES + 1];
        let resp = router
            .oneshot(post_json("/mutate", oversized))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let router = server_with(Arc::new(CertStore::default())).router();
        let resp = router
            .oneshot(post_json("/unknown", review_body("admission.k8s.io/v1")))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
