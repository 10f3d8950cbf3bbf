use crate::gate::GateStatus;
use crate::stats::CaptureStats;
use crate::storage::Storage;
use axum::{
    extract::{Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub stats: Arc<CaptureStats>,
    pub storage: Arc<Storage>,
    pub gate: Arc<GateStatus>,
    pub start_time: Instant,
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

struct Metrics {
    registry: Registry,
    packets_total: Counter,
    bytes_total: Counter,
    decode_errors_total: Counter,
    capture_active: Gauge,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let packets_total = Counter::default();
        let bytes_total = Counter::default();
        let decode_errors_total = Counter::default();
        let capture_active = Gauge::default();

        registry.register(
            "ipwatch_packets_total",
            "Total number of captured datagrams",
            packets_total.clone(),
        );
        registry.register(
            "ipwatch_bytes_total",
            "Total bytes captured",
            bytes_total.clone(),
        );
        registry.register(
            "ipwatch_decode_errors_total",
            "Datagrams rejected by the header decoder",
            decode_errors_total.clone(),
        );
        registry.register(
            "ipwatch_capture_active",
            "Whether the capture socket is currently open",
            capture_active.clone(),
        );

        Self {
            registry,
            packets_total,
            bytes_total,
            decode_errors_total,
            capture_active,
        }
    }
}

// ── Response Types ────────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    capture_active: bool,
    total_packets: u64,
}

#[derive(Serialize)]
pub struct StatsResponse {
    uptime_seconds: u64,
    total_packets: u64,
    total_bytes: u64,
    decode_errors: u64,
    active_peers: usize,
    packets_per_second: f64,
    bytes_per_second: f64,
}

#[derive(Serialize)]
pub struct GateResponse {
    capture_active: bool,
    instances: HashMap<String, u32>,
}

#[derive(Deserialize)]
pub struct HistoryParams {
    limit: Option<usize>,
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>) -> Router {
    let metrics = Arc::new(Metrics::new());

    Router::new()
        .route("/api/health", get(get_health))
        .route("/api/stats", get(get_stats))
        .route("/api/gate", get(get_gate))
        .route("/api/history", get(get_history))
        .route("/metrics", get({
            let m = metrics.clone();
            let s = state.clone();
            move || get_metrics(s.clone(), m.clone())
        }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        capture_active: state.gate.is_active(),
        total_packets: state.stats.total_packets.load(Ordering::Relaxed),
    })
}

async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let uptime = state.start_time.elapsed().as_secs();
    let total_packets = state.stats.total_packets.load(Ordering::Relaxed);
    let total_bytes = state.stats.total_bytes.load(Ordering::Relaxed);
    let decode_errors = state.stats.decode_errors.load(Ordering::Relaxed);
    let active_peers = state.stats.active_peers.load(Ordering::Relaxed);

    let packets_per_second = if uptime > 0 {
        total_packets as f64 / uptime as f64
    } else {
        0.0
    };
    let bytes_per_second = if uptime > 0 {
        total_bytes as f64 / uptime as f64
    } else {
        0.0
    };

    Json(StatsResponse {
        uptime_seconds: uptime,
        total_packets,
        total_bytes,
        decode_errors,
        active_peers,
        packets_per_second,
        bytes_per_second,
    })
}

async fn get_gate(State(state): State<Arc<AppState>>) -> Json<GateResponse> {
    Json(GateResponse {
        capture_active: state.gate.is_active(),
        instances: state.gate.instance_counts(),
    })
}

async fn get_history(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Json<serde_json::Value> {
    let limit = params.limit.unwrap_or(100).min(1000);
    match state.storage.query_history(limit) {
        Ok(data) => Json(serde_json::json!(data)),
        Err(e) => Json(serde_json::json!({ "error": e.to_string() })),
    }
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> impl IntoResponse {
    let total_pkts = state.stats.total_packets.load(Ordering::Relaxed);
    let total_b = state.stats.total_bytes.load(Ordering::Relaxed);
    let errors = state.stats.decode_errors.load(Ordering::Relaxed);

    // prometheus-client Counters are monotonic so we increment by the delta
    // between the atomic state and the last scrape.
    let current_pkts = metrics.packets_total.get();
    if total_pkts > current_pkts {
        metrics.packets_total.inc_by(total_pkts - current_pkts);
    }
    let current_b = metrics.bytes_total.get();
    if total_b > current_b {
        metrics.bytes_total.inc_by(total_b - current_b);
    }
    let current_errors = metrics.decode_errors_total.get();
    if errors > current_errors {
        metrics.decode_errors_total.inc_by(errors - current_errors);
    }
    metrics
        .capture_active
        .set(i64::from(state.gate.is_active()));

    let mut buf = String::new();
    encode(&mut buf, &metrics.registry).unwrap();
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
}
