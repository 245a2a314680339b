//! HTTP surface: state wiring, router construction and the serve loop.

mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderValue, Method, StatusCode,
};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::cache::{CacheRefresher, RefreshCache};
use crate::columnar::ColumnarClient;
use crate::config::Config;
use crate::error::FabricError;
use crate::graph::GraphClient;
use crate::query::history::HistoryEngine;
use crate::query::impact::ImpactEngine;
use crate::query::metro::MetroEngine;
use crate::query::paths::PathEngine;
use crate::query::redundancy::RedundancyEngine;
use crate::query::status::StatusBuilder;
use crate::query::topology::TopologyEngine;
use crate::timeline::TimelineEngine;

pub struct AppState {
    pub config: Config,
    pub graph: Arc<GraphClient>,
    pub columnar: ColumnarClient,
    pub paths: Arc<PathEngine>,
    pub metro: Arc<MetroEngine>,
    pub impact: Arc<ImpactEngine>,
    pub redundancy: Arc<RedundancyEngine>,
    pub topology: Arc<TopologyEngine>,
    pub status: Arc<StatusBuilder>,
    pub history: Arc<HistoryEngine>,
    pub timeline: Arc<TimelineEngine>,
    pub cache: Arc<RefreshCache>,
}

impl AppState {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.config.http.request_timeout_secs)
    }
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0}")]
    Upstream(String),
}

impl From<FabricError> for ApiError {
    fn from(err: FabricError) -> Self {
        match err {
            FabricError::InvalidArgument(reason) => ApiError::BadRequest(reason),
            FabricError::NotFound(entity) => ApiError::NotFound(entity),
            other => ApiError::Upstream(other.user_message()),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorPayload {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(ErrorPayload {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

pub fn build_router(state: SharedState) -> Router {
    let cors = build_cors_layer(&state.config.http.allow_origins);

    let mut router = Router::new()
        .route("/health", get(handlers::health))
        .route("/isis/topology", get(handlers::isis_topology))
        .route("/isis/path", get(handlers::isis_path))
        .route("/isis/paths", get(handlers::isis_paths))
        .route("/isis/compare", get(handlers::isis_compare))
        .route("/isis/impact/:pk", get(handlers::isis_impact))
        .route("/isis/critical-links", get(handlers::isis_critical_links))
        .route("/isis/redundancy", get(handlers::isis_redundancy))
        .route("/metro/connectivity", get(handlers::metro_connectivity))
        .route("/metro/path-latency", get(handlers::metro_path_latency))
        .route("/metro/path/detail", get(handlers::metro_path_detail))
        .route("/metro/device-paths", get(handlers::metro_device_paths))
        .route("/maintenance/impact", post(handlers::maintenance_impact))
        .route("/status", get(handlers::status))
        .route("/link-history", get(handlers::link_history))
        .route("/device-history", get(handlers::device_history))
        .route(
            "/device-history/interfaces",
            get(handlers::device_interface_history),
        )
        .route("/timeline", get(handlers::timeline))
        .route("/timeline/bounds", get(handlers::timeline_bounds));

    if let Some(layer) = cors {
        router = router.layer(layer);
    }

    router.with_state(state).layer(TraceLayer::new_for_http())
}

fn build_cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let mut allowed = Vec::new();
    for origin in origins {
        let trimmed = origin.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        match HeaderValue::from_str(trimmed) {
            Ok(value) => allowed.push(value),
            Err(_) => tracing::warn!(%origin, "ignoring invalid CORS origin"),
        }
    }
    if allowed.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(allowed))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([ACCEPT, CONTENT_TYPE]),
    )
}

/// Wires the clients and engines, starts the refresh loop and serves until
/// shutdown.
pub async fn serve(config: Config) -> crate::error::Result<()> {
    crate::logging::install();

    let graph = Arc::new(GraphClient::connect(&config.graph).await?);
    let columnar = ColumnarClient::connect(&config.columnar);

    let paths = Arc::new(PathEngine::new(Arc::clone(&graph), columnar.clone()));
    let metro = Arc::new(MetroEngine::new(Arc::clone(&graph), Arc::clone(&paths)));
    let impact = Arc::new(ImpactEngine::new(Arc::clone(&graph), columnar.clone()));
    let redundancy = Arc::new(RedundancyEngine::new(Arc::clone(&graph)));
    let topology = Arc::new(TopologyEngine::new(Arc::clone(&graph), columnar.clone()));
    let status = Arc::new(StatusBuilder::new(Arc::clone(&graph), columnar.clone()));
    let history = Arc::new(HistoryEngine::new(columnar.clone()));
    let timeline = Arc::new(TimelineEngine::new(
        columnar.clone(),
        config.timeline.internal_owner_pubkeys.clone(),
    ));
    let cache = Arc::new(RefreshCache::default());

    if config.cache.enabled {
        CacheRefresher {
            cache: Arc::clone(&cache),
            status: Arc::clone(&status),
            history: Arc::clone(&history),
            timeline: Arc::clone(&timeline),
            metro: Arc::clone(&metro),
            interval: Duration::from_secs(config.cache.refresh_interval_secs),
        }
        .spawn();
    }

    let addr = SocketAddr::from((config.http.host, config.http.port));
    let state = Arc::new(AppState {
        config,
        graph,
        columnar,
        paths,
        metro,
        impact,
        redundancy,
        topology,
        status,
        history,
        timeline,
        cache,
    });
    let app = build_router(state);

    let listener = TcpListener::bind(addr).await.map_err(|err| {
        FabricError::Config(format!("cannot bind {addr}: {err}"))
    })?;
    tracing::info!(%addr, "fabricview listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| FabricError::Config(format!("server error: {err}")))?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown signal received"),
        Err(err) => tracing::error!(?err, "failed to listen for shutdown signal"),
    }
}
