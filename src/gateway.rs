//! Gateway: one HTTP listener shared by every platform binding.
//!
//! Routes are registered before the listener starts and never change after;
//! only their readiness flags flip. The gateway owns no business logic: it
//! checks path, method and readiness, then hands the raw request to the
//! registered handler.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use secrecy::{ExposeSecret, SecretString};
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::coordinator::RunCoordinator;
use crate::error::GatewayError;

const HEALTH_PATH: &str = "/health";

/// Raw inbound request as handed to a route handler.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Handler owning one registered path.
#[async_trait]
pub trait RouteHandler: Send + Sync + 'static {
    async fn handle(&self, request: InboundRequest) -> Result<Response, GatewayError>;
}

struct Route {
    handler: Arc<dyn RouteHandler>,
    ready: AtomicBool,
}

#[derive(Clone)]
struct GatewayState {
    service: Arc<str>,
    routes: Arc<HashMap<String, Arc<Route>>>,
    coordinator: Option<Arc<RunCoordinator>>,
}

/// The shared listener and its route table.
pub struct Gateway {
    service: Arc<str>,
    max_body_bytes: usize,
    routes: HashMap<String, Arc<Route>>,
    coordinator: Option<Arc<RunCoordinator>>,
}

impl Gateway {
    pub fn new(service: &str, max_body_bytes: usize) -> Self {
        Self {
            service: Arc::from(service),
            max_body_bytes,
            routes: HashMap::new(),
            coordinator: None,
        }
    }

    /// Report active runs on `/health`.
    pub fn with_coordinator(mut self, coordinator: Arc<RunCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Add a route in the not-ready state.
    pub fn register(
        &mut self,
        path: &str,
        handler: Arc<dyn RouteHandler>,
    ) -> Result<(), GatewayError> {
        if !path.starts_with('/') || path == HEALTH_PATH {
            return Err(GatewayError::InvalidPath(path.to_string()));
        }
        if self.routes.contains_key(path) {
            return Err(GatewayError::DuplicateRoute(path.to_string()));
        }
        self.routes.insert(
            path.to_string(),
            Arc::new(Route {
                handler,
                ready: AtomicBool::new(false),
            }),
        );
        info!(path, "Route registered");
        Ok(())
    }

    /// Flip a route live. Returns `false` for an unknown path.
    pub fn mark_ready(&self, path: &str) -> bool {
        match self.routes.get(path) {
            Some(route) => {
                route.ready.store(true, Ordering::Release);
                info!(path, "Route ready");
                true
            }
            None => {
                warn!(path, "mark_ready on unregistered route");
                false
            }
        }
    }

    pub fn is_ready(&self, path: &str) -> bool {
        self.routes
            .get(path)
            .is_some_and(|r| r.ready.load(Ordering::Acquire))
    }

    /// Build the axum router. Readiness changes made after this call are
    /// still observed.
    pub fn router(&self) -> Router {
        let state = GatewayState {
            service: Arc::clone(&self.service),
            routes: Arc::new(self.routes.clone()),
            coordinator: self.coordinator.clone(),
        };

        Router::new()
            .route(HEALTH_PATH, get(health))
            .fallback(dispatch)
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(DefaultBodyLimit::max(self.max_body_bytes)),
            )
            .with_state(state)
    }

    /// Bind the listener and serve in the background.
    pub async fn start(&self, port: u16) -> Result<GatewayHandle, GatewayError> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| GatewayError::Bind { port, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| GatewayError::Bind { port, source })?;

        let app = self.router();
        let join = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Gateway listener stopped");
            }
        });

        info!(addr = %local_addr, routes = self.routes.len(), "Gateway listening");
        Ok(GatewayHandle { local_addr, join })
    }
}

/// A running listener.
pub struct GatewayHandle {
    local_addr: SocketAddr,
    join: JoinHandle<()>,
}

impl GatewayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the listener task to exit.
    pub async fn wait(self) {
        let _ = self.join.await;
    }

    pub fn shutdown(self) {
        self.join.abort();
    }
}

async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    let routes: BTreeMap<&str, bool> = state
        .routes
        .iter()
        .map(|(path, route)| (path.as_str(), route.ready.load(Ordering::Acquire)))
        .collect();

    let mut body = serde_json::json!({
        "status": "ok",
        "service": &*state.service,
        "routes": routes,
    });
    if let Some(coordinator) = &state.coordinator {
        body["running"] = serde_json::json!(coordinator.running_conversations());
    }
    Json(body)
}

async fn dispatch(
    State(state): State<GatewayState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path();
    let Some(route) = state.routes.get(path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if method != Method::POST {
        let mut response = StatusCode::METHOD_NOT_ALLOWED.into_response();
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("POST"));
        return response;
    }

    if !route.ready.load(Ordering::Acquire) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let handler = Arc::clone(&route.handler);
    let request = InboundRequest { headers, body };
    // Run on its own task so a panicking handler cannot take the listener down.
    match tokio::spawn(async move { handler.handle(request).await }).await {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            let status = e.status();
            if status.is_server_error() {
                error!(path, error = %e, "Route handler failed");
            } else {
                warn!(path, status = %status, error = %e, "Request rejected");
            }
            (status, e.to_string()).into_response()
        }
        Err(e) => {
            error!(path, error = %e, "Route handler panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Check a shared-secret header. A missing header counts as a mismatch.
pub fn require_secret(
    headers: &HeaderMap,
    header_name: &str,
    expected: &SecretString,
) -> Result<(), GatewayError> {
    let provided = headers
        .get(header_name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if constant_time_eq(provided.as_bytes(), expected.expose_secret().as_bytes()) {
        Ok(())
    } else {
        Err(GatewayError::Rejected {
            status: StatusCode::UNAUTHORIZED,
            reason: format!("missing or wrong {header_name} header"),
        })
    }
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct Echo;

    #[async_trait]
    impl RouteHandler for Echo {
        async fn handle(&self, request: InboundRequest) -> Result<Response, GatewayError> {
            Ok((StatusCode::OK, request.body).into_response())
        }
    }

    struct Panics;

    #[async_trait]
    impl RouteHandler for Panics {
        async fn handle(&self, _request: InboundRequest) -> Result<Response, GatewayError> {
            panic!("handler exploded");
        }
    }

    struct Rejects;

    #[async_trait]
    impl RouteHandler for Rejects {
        async fn handle(&self, _request: InboundRequest) -> Result<Response, GatewayError> {
            Err(GatewayError::Rejected {
                status: StatusCode::UNAUTHORIZED,
                reason: "bad secret".into(),
            })
        }
    }

    fn post(path: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_succeeds_regardless_of_readiness() {
        let mut gateway = Gateway::new("relay", 1024);
        gateway.register("/hook", Arc::new(Echo)).unwrap();

        let response = gateway
            .router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"], "relay");
        assert_eq!(json["routes"]["/hook"], false);
    }

    #[tokio::test]
    async fn not_ready_then_ready() {
        let mut gateway = Gateway::new("relay", 1024);
        gateway.register("/hook", Arc::new(Echo)).unwrap();
        let router = gateway.router();

        let response = router.clone().oneshot(post("/hook", "hi")).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        assert!(gateway.mark_ready("/hook"));
        let response = router.oneshot(post("/hook", "hi")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "hi");
    }

    #[tokio::test]
    async fn unknown_path_and_wrong_method() {
        let mut gateway = Gateway::new("relay", 1024);
        gateway.register("/hook", Arc::new(Echo)).unwrap();
        gateway.mark_ready("/hook");
        let router = gateway.router();

        let response = router.clone().oneshot(post("/nope", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router
            .oneshot(Request::get("/hook").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "POST");
    }

    #[tokio::test]
    async fn handler_panic_becomes_500() {
        let mut gateway = Gateway::new("relay", 1024);
        gateway.register("/boom", Arc::new(Panics)).unwrap();
        gateway.register("/hook", Arc::new(Echo)).unwrap();
        gateway.mark_ready("/boom");
        gateway.mark_ready("/hook");
        let router = gateway.router();

        let response = router.clone().oneshot(post("/boom", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let response = router.oneshot(post("/hook", "still up")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn handler_rejection_keeps_its_status() {
        let mut gateway = Gateway::new("relay", 1024);
        gateway.register("/hook", Arc::new(Rejects)).unwrap();
        gateway.mark_ready("/hook");

        let response = gateway.router().oneshot(post("/hook", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let mut gateway = Gateway::new("relay", 8);
        gateway.register("/hook", Arc::new(Echo)).unwrap();
        gateway.mark_ready("/hook");

        let response = gateway
            .router()
            .oneshot(post("/hook", "far more than eight bytes"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn registration_rules() {
        let mut gateway = Gateway::new("relay", 1024);
        gateway.register("/hook", Arc::new(Echo)).unwrap();
        assert!(matches!(
            gateway.register("/hook", Arc::new(Echo)),
            Err(GatewayError::DuplicateRoute(_))
        ));
        assert!(matches!(
            gateway.register("hook", Arc::new(Echo)),
            Err(GatewayError::InvalidPath(_))
        ));
        assert!(matches!(
            gateway.register("/health", Arc::new(Echo)),
            Err(GatewayError::InvalidPath(_))
        ));
        assert!(!gateway.mark_ready("/other"));
        assert!(!gateway.is_ready("/hook"));
    }

    #[test]
    fn constant_time_eq_behaviour() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn shared_secret_header() {
        let secret = SecretString::from("letmein");
        let mut headers = HeaderMap::new();
        let err = require_secret(&headers, "x-relay-token", &secret).unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        headers.insert("x-relay-token", HeaderValue::from_static("nope"));
        assert!(require_secret(&headers, "x-relay-token", &secret).is_err());

        headers.insert("x-relay-token", HeaderValue::from_static("letmein"));
        assert!(require_secret(&headers, "x-relay-token", &secret).is_ok());
    }
}
