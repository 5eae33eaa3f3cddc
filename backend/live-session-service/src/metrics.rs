use std::rc::Rc;
use std::time::{Duration, Instant};

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error, HttpResponse,
};
use futures::future::{ready, LocalBoxFuture, Ready};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder,
};

fn register<C: prometheus::core::Collector + Clone + 'static>(collector: C, name: &str) -> C {
    prometheus::default_registry()
        .register(Box::new(collector.clone()))
        .unwrap_or_else(|e| panic!("failed to register {name}: {e}"));
    collector
}

static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "live_session_http_requests_total",
            "Total HTTP requests handled by live-session-service",
        ),
        &["method", "path", "status"],
    )
    .expect("failed to create live_session_http_requests_total");
    register(counter, "live_session_http_requests_total")
});

static HTTP_REQUEST_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let histogram = HistogramVec::new(
        HistogramOpts::new(
            "live_session_http_request_duration_seconds",
            "HTTP request latency for live-session-service",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]),
        &["method", "path", "status"],
    )
    .expect("failed to create live_session_http_request_duration_seconds");
    register(histogram, "live_session_http_request_duration_seconds")
});

static SESSIONS_STARTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("live_sessions_started_total", "Sessions created by startStream")
        .expect("failed to create live_sessions_started_total");
    register(counter, "live_sessions_started_total")
});

static SESSION_TRANSITIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "live_session_transitions_total",
            "Session state transitions by target state",
        ),
        &["state"],
    )
    .expect("failed to create live_session_transitions_total");
    register(counter, "live_session_transitions_total")
});

static LIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("live_sessions_live", "Sessions currently in LIVE state")
        .expect("failed to create live_sessions_live");
    register(gauge, "live_sessions_live")
});

static INGEST_BYTES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("live_ingest_bytes_total", "Raw media bytes accepted by ingest")
        .expect("failed to create live_ingest_bytes_total");
    register(counter, "live_ingest_bytes_total")
});

static INGEST_THROTTLED_DROPS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "live_ingest_throttled_drops_total",
        "Ingest chunks dropped after the bounded backpressure wait",
    )
    .expect("failed to create live_ingest_throttled_drops_total");
    register(counter, "live_ingest_throttled_drops_total")
});

static TRANSCODE_JOBS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("live_transcode_jobs_total", "Transcode jobs by outcome"),
        &["target", "outcome"],
    )
    .expect("failed to create live_transcode_jobs_total");
    register(counter, "live_transcode_jobs_total")
});

static TRANSCODE_RETRIES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "live_transcode_retries_total",
        "Transcode attempts beyond the first",
    )
    .expect("failed to create live_transcode_retries_total");
    register(counter, "live_transcode_retries_total")
});

static SEGMENTS_PUBLISHED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("live_segments_published_total", "Segments appended to manifests"),
        &["variant"],
    )
    .expect("failed to create live_segments_published_total");
    register(counter, "live_segments_published_total")
});

static MANIFEST_GAPS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "live_manifest_gaps_skipped_total",
        "Manifest slots skipped after failure or timeout",
    )
    .expect("failed to create live_manifest_gaps_skipped_total");
    register(counter, "live_manifest_gaps_skipped_total")
});

static CHAT_EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("live_chat_events_published_total", "Channel events fanned out"),
        &["kind"],
    )
    .expect("failed to create live_chat_events_published_total");
    register(counter, "live_chat_events_published_total")
});

static SLOW_CONSUMER_DISCONNECTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "live_chat_slow_consumer_disconnects_total",
        "Subscribers disconnected after overflowing their buffer",
    )
    .expect("failed to create live_chat_slow_consumer_disconnects_total");
    register(counter, "live_chat_slow_consumer_disconnects_total")
});

static MODERATION_DECISIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("live_moderation_decisions_total", "Moderation gate decisions"),
        &["action", "decision"],
    )
    .expect("failed to create live_moderation_decisions_total");
    register(counter, "live_moderation_decisions_total")
});

pub fn observe_http_request(method: &str, path: &str, status: u16, elapsed: Duration) {
    let status_label = status.to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status_label])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path, &status_label])
        .observe(elapsed.as_secs_f64());
}

pub fn session_started() {
    SESSIONS_STARTED_TOTAL.inc();
}

pub fn session_transition(state: &str) {
    SESSION_TRANSITIONS_TOTAL.with_label_values(&[state]).inc();
}

pub fn live_sessions_inc() {
    LIVE_SESSIONS.inc();
}

pub fn live_sessions_dec() {
    LIVE_SESSIONS.dec();
}

pub fn ingest_bytes(bytes: usize) {
    INGEST_BYTES_TOTAL.inc_by(bytes as u64);
}

pub fn ingest_throttled_drop() {
    INGEST_THROTTLED_DROPS_TOTAL.inc();
}

pub fn transcode_job(target: &str, outcome: &str) {
    TRANSCODE_JOBS_TOTAL.with_label_values(&[target, outcome]).inc();
}

pub fn transcode_retries(count: u32) {
    TRANSCODE_RETRIES_TOTAL.inc_by(count as u64);
}

pub fn segment_published(variant: &str) {
    SEGMENTS_PUBLISHED_TOTAL.with_label_values(&[variant]).inc();
}

pub fn manifest_gap_skipped() {
    MANIFEST_GAPS_TOTAL.inc();
}

pub fn chat_event_published(kind: &str) {
    CHAT_EVENTS_TOTAL.with_label_values(&[kind]).inc();
}

pub fn slow_consumer_disconnected() {
    SLOW_CONSUMER_DISCONNECTS_TOTAL.inc();
}

pub fn moderation_decision(action: &str, decision: &str) {
    MODERATION_DECISIONS_TOTAL
        .with_label_values(&[action, decision])
        .inc();
}

pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

/// Records request count and latency per route pattern
///
/// The route pattern is used as the label, so ingest keys and ids never end
/// up in metric labels.
pub struct MetricsMiddleware;

impl<S, B> Transform<S, ServiceRequest> for MetricsMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = MetricsMiddlewareService<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MetricsMiddlewareService {
            service: Rc::new(service),
        }))
    }
}

pub struct MetricsMiddlewareService<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for MetricsMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = self.service.clone();
        let path = req
            .match_pattern()
            .unwrap_or_else(|| "unmatched".to_string());
        let method = req.method().to_string();
        let start = Instant::now();

        Box::pin(async move {
            let result = service.call(req).await;
            let elapsed = start.elapsed();
            match &result {
                Ok(response) => {
                    observe_http_request(&method, &path, response.status().as_u16(), elapsed);
                }
                Err(_) => {
                    observe_http_request(&method, &path, 500, elapsed);
                }
            }
            result
        })
    }
}
