//! Endpoint handlers: parameter parsing, cache consultation and response
//! shaping. Composite endpoints return 200 with an embedded `error` field on
//! partial failure; parameter problems are 400, single-entity misses 404.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::{ApiError, SharedState};
use crate::cache::RefreshCache;
use crate::metrics;
use crate::query::history::{BucketSpec, HistoryRange, DEFAULT_BUCKETS};
use crate::query::impact::MaintenanceRequest;
use crate::query::paths::{PathMode, DEFAULT_K};
use crate::timeline::event::{ActionCategory, EntityType, EventSeverity};
use crate::timeline::{DzFilter, TimeWindow, TimelineParams, DEFAULT_LIMIT, DEFAULT_RANGE_SECS};

const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

fn cached_json<T: Serialize>(value: &T, hit: bool) -> Response {
    let mut response = Json(value).into_response();
    response.headers_mut().insert(
        X_CACHE,
        HeaderValue::from_static(if hit { "HIT" } else { "MISS" }),
    );
    response
}

async fn with_deadline<T>(
    deadline: Duration,
    fut: impl std::future::Future<Output = Result<T, ApiError>>,
) -> Result<T, ApiError> {
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| ApiError::Upstream("request deadline exceeded".into()))?
}

// ---------------------------------------------------------------------------
// Parameter parsing
// ---------------------------------------------------------------------------

fn parse_mode(raw: Option<&str>) -> Result<PathMode, ApiError> {
    PathMode::parse(raw.unwrap_or(""))
        .ok_or_else(|| ApiError::BadRequest("mode must be one of: hops, latency".into()))
}

fn require<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, ApiError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ApiError::BadRequest(format!("{name} is required"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct KPathQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub k: Option<usize>,
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OptimizeQuery {
    pub optimize: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MetroPairQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub optimize: Option<String>,
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub range: Option<String>,
    pub buckets: Option<usize>,
    pub device: Option<String>,
}

impl HistoryQuery {
    fn spec(&self) -> Result<BucketSpec, ApiError> {
        let range = HistoryRange::parse(self.range.as_deref().unwrap_or(""))
            .ok_or_else(|| ApiError::BadRequest("range must be one of: 1h, 3h, 6h, 12h, 24h, 3d, 7d".into()))?;
        Ok(BucketSpec::new(range, self.buckets.unwrap_or(DEFAULT_BUCKETS)))
    }

    fn cache_key(&self) -> (HistoryRange, usize) {
        (
            HistoryRange::parse(self.range.as_deref().unwrap_or("")).unwrap_or(HistoryRange::H24),
            self.buckets.unwrap_or(DEFAULT_BUCKETS),
        )
    }
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub range: Option<String>,
    pub category: Option<String>,
    pub entity_type: Option<String>,
    pub severity: Option<String>,
    pub action: Option<String>,
    pub dz_filter: Option<String>,
    pub min_stake_pct: Option<f64>,
    pub search: Option<String>,
    pub include_internal: Option<bool>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl TimelineQuery {
    /// Returns the parsed params plus whether the caller pinned the window
    /// explicitly (which bypasses the cache).
    fn parse(&self, now: i64) -> Result<(TimelineParams, bool), ApiError> {
        let mut explicit_window = false;
        let window = match (self.start, self.end, self.range.as_deref()) {
            (Some(start), Some(end), _) => {
                if end <= start {
                    return Err(ApiError::BadRequest("end must be after start".into()));
                }
                explicit_window = true;
                TimeWindow::new(start, end)
            }
            (None, None, Some(range)) => {
                let range = HistoryRange::parse(range).ok_or_else(|| {
                    ApiError::BadRequest("range must be one of: 1h, 3h, 6h, 12h, 24h, 3d, 7d".into())
                })?;
                if range != HistoryRange::H24 {
                    explicit_window = true;
                }
                TimeWindow::new(now - range.hours() * 3600, now)
            }
            (None, None, None) => TimeWindow::new(now - DEFAULT_RANGE_SECS, now),
            _ => {
                return Err(ApiError::BadRequest(
                    "start and end must be provided together".into(),
                ))
            }
        };

        let entity_type = match self.entity_type.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(EntityType::parse(raw).ok_or_else(|| {
                ApiError::BadRequest(format!("unrecognized entity_type: {raw}"))
            })?),
        };
        let severity = match self.severity.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(EventSeverity::parse(raw).ok_or_else(|| {
                ApiError::BadRequest(format!("unrecognized severity: {raw}"))
            })?),
        };
        // `action` and legacy `category` are aliases for the action bucket
        let category_raw = self.action.as_deref().or(self.category.as_deref());
        let category = match category_raw {
            None | Some("") => None,
            Some(raw) => Some(ActionCategory::parse(raw).ok_or_else(|| {
                ApiError::BadRequest(format!("unrecognized action: {raw}"))
            })?),
        };
        let dz_filter = match self.dz_filter.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(DzFilter::parse(raw).ok_or_else(|| {
                ApiError::BadRequest(format!("unrecognized dz_filter: {raw}"))
            })?),
        };

        Ok((
            TimelineParams {
                window,
                entity_type,
                severity,
                category,
                dz_filter,
                min_stake_pct: self.min_stake_pct,
                search: self.search.clone().filter(|s| !s.is_empty()),
                include_internal: self.include_internal.unwrap_or(false),
                limit: self.limit.unwrap_or(DEFAULT_LIMIT),
                offset: self.offset.unwrap_or(0),
            },
            explicit_window,
        ))
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub graph_ok: bool,
    pub columnar_ok: bool,
    pub queries: std::collections::HashMap<&'static str, metrics::QueryStats>,
}

pub async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let (graph_ok, columnar_ok) = tokio::join!(state.graph.ping(), state.columnar.ping());
    Json(HealthResponse {
        status: if graph_ok && columnar_ok { "ok" } else { "degraded" },
        graph_ok,
        columnar_ok,
        queries: metrics::registry().snapshot(),
    })
}

pub async fn isis_topology(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let doc = with_deadline(state.request_deadline(), async {
        Ok(state.topology.topology().await?)
    })
    .await?;
    Ok(Json(doc).into_response())
}

pub async fn isis_path(
    State(state): State<SharedState>,
    Query(params): Query<PathQuery>,
) -> Result<Response, ApiError> {
    let from = require(params.from.as_deref(), "from")?;
    let to = require(params.to.as_deref(), "to")?;
    let mode = parse_mode(params.mode.as_deref())?;
    let path = with_deadline(state.request_deadline(), async {
        Ok(state.paths.shortest_path(from, to, mode).await?)
    })
    .await?;
    Ok(Json(path).into_response())
}

pub async fn isis_paths(
    State(state): State<SharedState>,
    Query(params): Query<KPathQuery>,
) -> Result<Response, ApiError> {
    let from = require(params.from.as_deref(), "from")?;
    let to = require(params.to.as_deref(), "to")?;
    let mode = parse_mode(params.mode.as_deref())?;
    let k = params.k.unwrap_or(DEFAULT_K);
    let paths = with_deadline(state.request_deadline(), async {
        Ok(state.paths.k_shortest_paths(from, to, k, mode).await?)
    })
    .await?;
    Ok(Json(paths).into_response())
}

pub async fn isis_compare(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let report = with_deadline(state.request_deadline(), async {
        Ok(state.topology.compare().await?)
    })
    .await?;
    Ok(Json(report).into_response())
}

pub async fn isis_impact(
    State(state): State<SharedState>,
    Path(pk): Path<String>,
) -> Result<Response, ApiError> {
    let impact = with_deadline(state.request_deadline(), async {
        Ok(state.impact.failure_impact(&pk).await?)
    })
    .await?;
    Ok(Json(impact).into_response())
}

pub async fn isis_critical_links(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let links = with_deadline(state.request_deadline(), async {
        Ok(state.redundancy.critical_links().await?)
    })
    .await?;
    Ok(Json(links).into_response())
}

pub async fn isis_redundancy(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let report = with_deadline(state.request_deadline(), async {
        Ok(state.redundancy.report().await?)
    })
    .await?;
    Ok(Json(report).into_response())
}

pub async fn metro_connectivity(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let matrix = with_deadline(state.request_deadline(), async {
        Ok(state.metro.connectivity().await?)
    })
    .await?;
    Ok(Json(matrix).into_response())
}

pub async fn metro_path_latency(
    State(state): State<SharedState>,
    Query(params): Query<OptimizeQuery>,
) -> Result<Response, ApiError> {
    let mode = parse_mode(params.optimize.as_deref())?;
    if let Some(cached) = state.cache.metro_path_latency.get(&mode) {
        return Ok(cached_json(cached.as_ref(), true));
    }
    let entries = state
        .metro
        .path_latency_matrix(mode)
        .await
        .map_err(ApiError::from)?;
    Ok(cached_json(&entries, false))
}

pub async fn metro_path_detail(
    State(state): State<SharedState>,
    Query(params): Query<MetroPairQuery>,
) -> Result<Response, ApiError> {
    let from = require(params.from.as_deref(), "from")?;
    let to = require(params.to.as_deref(), "to")?;
    let mode = parse_mode(params.optimize.as_deref().or(params.mode.as_deref()))?;
    let detail = state
        .metro
        .device_paths(from, to, mode)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(detail).into_response())
}

pub async fn metro_device_paths(
    State(state): State<SharedState>,
    Query(params): Query<MetroPairQuery>,
) -> Result<Response, ApiError> {
    let from = require(params.from.as_deref(), "from")?;
    let to = require(params.to.as_deref(), "to")?;
    let mode = parse_mode(params.mode.as_deref().or(params.optimize.as_deref()))?;
    let result = state
        .metro
        .device_paths(from, to, mode)
        .await
        .map_err(ApiError::from)?;
    Ok(Json(result).into_response())
}

pub async fn maintenance_impact(
    State(state): State<SharedState>,
    Json(request): Json<MaintenanceRequest>,
) -> Result<Response, ApiError> {
    let impact = with_deadline(state.request_deadline(), async {
        Ok(state.impact.maintenance_impact(&request).await?)
    })
    .await?;
    Ok(Json(impact).into_response())
}

pub async fn status(State(state): State<SharedState>) -> Result<Response, ApiError> {
    if let Some(cached) = state.cache.status.get() {
        return Ok(cached_json(cached.as_ref(), true));
    }
    let document = tokio::time::timeout(state.request_deadline(), state.status.build())
        .await
        .map_err(|_| ApiError::Upstream("request deadline exceeded".into()))?;
    Ok(cached_json(&document, false))
}

pub async fn link_history(
    State(state): State<SharedState>,
    Query(params): Query<HistoryQuery>,
) -> Result<Response, ApiError> {
    let spec = params.spec()?;
    if params.cache_key() == RefreshCache::default_history_key() {
        if let Some(cached) = state.cache.link_history.get(&params.cache_key()) {
            return Ok(cached_json(cached.as_ref(), true));
        }
    }
    let response = with_deadline(state.request_deadline(), async {
        Ok(state.history.link_history(spec).await?)
    })
    .await?;
    Ok(cached_json(&response, false))
}

pub async fn device_history(
    State(state): State<SharedState>,
    Query(params): Query<HistoryQuery>,
) -> Result<Response, ApiError> {
    let spec = params.spec()?;
    if params.cache_key() == RefreshCache::default_history_key() {
        if let Some(cached) = state.cache.device_history.get(&params.cache_key()) {
            return Ok(cached_json(cached.as_ref(), true));
        }
    }
    let response = with_deadline(state.request_deadline(), async {
        Ok(state.history.device_history(spec).await?)
    })
    .await?;
    Ok(cached_json(&response, false))
}

pub async fn device_interface_history(
    State(state): State<SharedState>,
    Query(params): Query<HistoryQuery>,
) -> Result<Response, ApiError> {
    let device = require(params.device.as_deref(), "device")?.to_string();
    let spec = params.spec()?;
    let response = with_deadline(state.request_deadline(), async {
        Ok(state
            .history
            .device_interface_history(&device, spec)
            .await?)
    })
    .await?;
    Ok(Json(response).into_response())
}

pub async fn timeline(
    State(state): State<SharedState>,
    Query(params): Query<TimelineQuery>,
) -> Result<Response, ApiError> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let (parsed, explicit_window) = params.parse(now)?;
    if !explicit_window && parsed.is_default_shape() {
        if let Some(cached) = state.cache.timeline.get() {
            return Ok(cached_json(cached.as_ref(), true));
        }
    }
    let response = with_deadline(state.request_deadline(), async {
        Ok(state.timeline.build(&parsed).await?)
    })
    .await?;
    Ok(cached_json(&response, false))
}

pub async fn timeline_bounds(State(state): State<SharedState>) -> Result<Response, ApiError> {
    let bounds = with_deadline(state.request_deadline(), async {
        Ok(state.timeline.bounds().await?)
    })
    .await?;
    Ok(Json(bounds).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_window_resolution() {
        let now = 1_700_000_000;
        let query = TimelineQuery {
            start: None,
            end: None,
            range: None,
            category: None,
            entity_type: None,
            severity: None,
            action: None,
            dz_filter: None,
            min_stake_pct: None,
            search: None,
            include_internal: None,
            limit: None,
            offset: None,
        };
        let (params, explicit) = query.parse(now).unwrap();
        assert!(!explicit);
        assert_eq!(params.window.end - params.window.start, DEFAULT_RANGE_SECS);
        assert!(params.is_default_shape());
    }

    #[test]
    fn timeline_rejects_half_open_window() {
        let query = TimelineQuery {
            start: Some(100),
            end: None,
            range: None,
            category: None,
            entity_type: None,
            severity: None,
            action: None,
            dz_filter: None,
            min_stake_pct: None,
            search: None,
            include_internal: None,
            limit: None,
            offset: None,
        };
        assert!(query.parse(1_700_000_000).is_err());
    }

    #[test]
    fn timeline_rejects_unknown_enums() {
        let query = TimelineQuery {
            start: None,
            end: None,
            range: None,
            category: None,
            entity_type: Some("starship".into()),
            severity: None,
            action: None,
            dz_filter: None,
            min_stake_pct: None,
            search: None,
            include_internal: None,
            limit: None,
            offset: None,
        };
        assert!(query.parse(1_700_000_000).is_err());
    }

    #[test]
    fn explicit_range_bypasses_cache_shape() {
        let query = TimelineQuery {
            start: None,
            end: None,
            range: Some("3h".into()),
            category: None,
            entity_type: None,
            severity: None,
            action: None,
            dz_filter: None,
            min_stake_pct: None,
            search: None,
            include_internal: None,
            limit: None,
            offset: None,
        };
        let (_, explicit) = query.parse(1_700_000_000).unwrap();
        assert!(explicit);
    }

    #[test]
    fn history_query_spec_validates_range() {
        let query = HistoryQuery {
            range: Some("5h".into()),
            buckets: None,
            device: None,
        };
        assert!(query.spec().is_err());

        let query = HistoryQuery {
            range: Some("24h".into()),
            buckets: Some(72),
            device: None,
        };
        let spec = query.spec().unwrap();
        assert_eq!(spec.bucket_count, 72);
        assert_eq!(query.cache_key(), RefreshCache::default_history_key());
    }
}
