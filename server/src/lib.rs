pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod validation;

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, Method},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::GlobalKeyExtractor, GovernorLayer};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{debug, info, warn};
use tts_core::encode_stream;

use crate::config::ServerConfig;
use crate::engine::{SpeechEngine, SynthesisRequest};
use crate::error::ApiError;
use crate::metrics::{MetricsResponse, StreamMetrics, SystemMetrics};
use crate::validation::validate_narration_request;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<dyn SpeechEngine>,
    pub metrics: StreamMetrics,
    pub request_count: Arc<AtomicU64>,
    pub config: ServerConfig,
}

impl AppState {
    pub fn new(engine: Arc<dyn SpeechEngine>, config: ServerConfig) -> Self {
        Self {
            engine,
            metrics: StreamMetrics::new(),
            request_count: Arc::new(AtomicU64::new(0)),
            config,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NarrateRequest {
    pub text: String,
    pub voice: Option<String>,
}

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Build the full application: routes under `/` and `/api`, plus middleware.
pub fn build_router(state: AppState) -> anyhow::Result<Router> {
    let _ = START_TIME.get_or_init(Instant::now);
    let config = &state.config;

    let cors = cors_layer(config);

    // Global key: all clients share one budget, which also works behind proxies.
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(u64::from((config.rate_limit_per_minute / 60).max(1)))
            .burst_size(config.rate_limit_per_minute.max(1))
            .key_extractor(GlobalKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limit configuration"))?,
    );
    info!("Rate limiting: {} requests per minute", config.rate_limit_per_minute);

    let middleware_stack = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(GovernorLayer::new(governor_conf))
        .layer(TimeoutLayer::new(config.request_timeout()))
        .layer(cors)
        .into_inner();

    let api = Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(health_check))
        .route("/narrate", post(narrate_endpoint))
        .route("/metrics", get(metrics_endpoint));

    Ok(Router::new()
        .merge(api.clone())
        .nest("/api", api)
        .layer(axum::middleware::from_fn(add_request_id))
        .layer(middleware_stack)
        .with_state(state))
}

fn cors_layer(config: &ServerConfig) -> CorsLayer {
    let methods = [Method::GET, Method::POST, Method::OPTIONS];
    let origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .flatten()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();

    if origins.is_empty() {
        if config.cors_allowed_origins.is_some() {
            warn!("CORS_ALLOWED_ORIGINS has no valid origins, falling back to permissive CORS");
        } else {
            warn!("CORS_ALLOWED_ORIGINS not set, allowing all origins (development mode)");
        }
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(methods)
            .allow_headers(tower_http::cors::Any)
            .allow_credentials(false)
    } else {
        info!("CORS configured for {} origin(s)", origins.len());
        CorsLayer::new()
            .allow_origin(tower_http::cors::AllowOrigin::list(origins))
            .allow_methods(methods)
            .allow_headers(tower_http::cors::Any)
            .allow_credentials(false)
    }
}

async fn add_request_id(mut request: Request, next: Next) -> Response {
    let request_id = HeaderValue::from_str(&uuid::Uuid::new_v4().to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    request.headers_mut().insert("x-request-id", request_id.clone());
    let mut response = next.run(request).await;
    response.headers_mut().insert("x-request-id", request_id);
    response
}

pub async fn health_check() -> &'static str {
    "ok"
}

/// Stream a narration as newline-delimited chunk records.
///
/// Chunks are flushed as soon as each one is complete; the end marker is
/// always sent once the engine stops, even if it stopped with an error.
pub async fn narrate_endpoint(
    State(state): State<AppState>,
    Json(req): Json<NarrateRequest>,
) -> Result<Response, ApiError> {
    state.request_count.fetch_add(1, Ordering::Relaxed);
    validate_narration_request(&req.text, req.voice.as_deref())?;

    let started = Instant::now();
    let request = SynthesisRequest {
        text: req.text,
        voice: req.voice,
        sample_rate: state.config.sample_rate,
    };
    debug!(chars = request.text.chars().count(), voice = ?request.voice, "narration requested");

    let pcm = state.engine.synthesize(&request).await.map_err(|e| {
        state.metrics.record_engine_error();
        ApiError::EngineError(e)
    })?;

    let metrics = state.metrics.clone();
    let pcm = pcm.inspect(move |item| {
        if item.is_err() {
            metrics.record_engine_error();
        }
    });

    let mut tracker = state.metrics.track(started);
    let body = encode_stream(pcm, state.config.encoder_config()).map(move |record| {
        tracker.observe(&record);
        Ok::<_, Infallible>(record.to_line())
    });

    Ok((
        [
            (header::CONTENT_TYPE, NDJSON_CONTENT_TYPE),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(body),
    )
        .into_response())
}

pub async fn metrics_endpoint(State(state): State<AppState>) -> Json<MetricsResponse> {
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();

    let memory_used = system.used_memory();
    let memory_total = system.total_memory();
    let memory_usage_percent = if memory_total > 0 {
        (memory_used as f64 / memory_total as f64 * 100.0) as f32
    } else {
        0.0
    };

    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);

    // Unix-like systems only
    let system_load = {
        #[cfg(unix)]
        {
            std::fs::read_to_string("/proc/loadavg")
                .ok()
                .and_then(|loadavg| loadavg.split_whitespace().next()?.parse::<f64>().ok())
        }
        #[cfg(not(unix))]
        None
    };

    Json(MetricsResponse {
        timestamp: chrono::Utc::now(),
        system: SystemMetrics {
            cpu_usage_percent: system.global_cpu_info().cpu_usage(),
            memory_used_mb: memory_used / 1024 / 1024,
            memory_total_mb: memory_total / 1024 / 1024,
            memory_usage_percent,
            request_count: state.request_count.load(Ordering::Relaxed),
            uptime_seconds: uptime,
            system_load,
        },
        streaming: state.metrics.snapshot(),
    })
}
