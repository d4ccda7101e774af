//! Process wiring: shared state, the top-level router, and serving with
//! graceful shutdown.

use std::collections::VecDeque;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::stream;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::crypto::KeyCipher;
use crate::facade;
use crate::health::HealthRegistry;
use crate::logbus::{LogBus, LogEvent};
use crate::metrics::Metrics;
use crate::probes;
use crate::router::Router as UpstreamRouter;
use crate::snapshot::SnapshotLoader;
use crate::store::ConfigStore;
use crate::upstream::UpstreamClient;

/// The client token resolved by the auth middleware, attached as a request
/// extension and used as the pool lookup key.
#[derive(Clone, Debug, Default)]
pub struct ClientKey(pub String);

pub struct AppState {
    pub router: Arc<UpstreamRouter>,
    pub loader: Arc<SnapshotLoader>,
    pub health: Arc<HealthRegistry>,
    pub bus: Arc<LogBus>,
    pub metrics: Arc<Metrics>,
    pub store: Arc<dyn ConfigStore>,
    pub cipher: Arc<KeyCipher>,
    pub upstream: UpstreamClient,
    /// Plain client for the pool loopback probe.
    pub http: reqwest::Client,
    pub client_token: Option<String>,
    pub admin_token: String,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        cipher: KeyCipher,
        client_token: Option<String>,
        admin_token: String,
    ) -> Arc<Self> {
        let cipher = Arc::new(cipher);
        let loader = Arc::new(SnapshotLoader::new(store.clone()));
        let health = Arc::new(HealthRegistry::new());
        let router = Arc::new(UpstreamRouter::new(
            loader.clone(),
            health.clone(),
            cipher.clone(),
        ));
        let bus = Arc::new(LogBus::new(Some(store.clone()), 500));
        Arc::new(Self {
            router,
            loader,
            health,
            bus,
            metrics: Arc::new(Metrics::new()),
            store,
            cipher,
            upstream: UpstreamClient::new(),
            http: reqwest::Client::new(),
            client_token,
            admin_token,
        })
    }
}

pub fn app(state: Arc<AppState>, cors_origins: &[String]) -> axum::Router {
    let admin = axum::Router::new()
        .route("/admin/logs/stream", get(stream_logs))
        .route("/admin/credentials/{id}/test", post(probes::test_credential))
        .route(
            "/admin/providers/{id}/test",
            post(probes::test_provider_credentials),
        )
        .route("/admin/pools/{id}/test", post(probes::test_pool))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth));

    axum::Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(render_metrics))
        .merge(facade::routes(state.clone()))
        .merge(admin)
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn render_metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

async fn admin_auth(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let token = facade::extract_client_token(req.headers());
    if token.is_empty() || token != state.admin_token {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    next.run(req).await
}

/// `GET /admin/logs/stream` — flush the ring snapshot, then live events
/// until the subscriber disconnects.
async fn stream_logs(State(state): State<Arc<AppState>>) -> Response {
    let (snapshot, rx) = state.bus.subscribe();

    fn frame(event: &LogEvent) -> Bytes {
        let body = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
        Bytes::from(format!("data: {body}\n\n"))
    }

    let backlog: VecDeque<Bytes> = snapshot.iter().map(frame).collect();
    let stream = stream::unfold(
        (backlog, rx),
        |(mut backlog, mut rx)| async move {
            if let Some(next) = backlog.pop_front() {
                return Some((Ok::<_, std::io::Error>(next), (backlog, rx)));
            }
            match rx.recv().await {
                Some(event) => Some((Ok(frame(&event)), (backlog, rx))),
                None => None,
            }
        },
    );

    let mut response = Response::new(Body::from_stream(stream));
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream; charset=utf-8"),
    );
    response.headers_mut().insert(
        axum::http::header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    );
    response
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);
    if origins.iter().any(|origin| origin == "*") {
        layer.allow_origin(Any)
    } else {
        let list: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(list))
    }
}

pub async fn serve(
    state: Arc<AppState>,
    addr: &str,
    cors_origins: &[String],
) -> std::io::Result<()> {
    let app = app(state, cors_origins);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutting down");
}
