//! HTTP exposition: `/metrics` (Prometheus text), `/`, `/api/metrics`, and
//! `/stream` (dashboard SSE) over the shared registry. A background task
//! also applies incoming `telemetry.metrics` samples directly to the
//! registry so the scraper is usable standalone without an aggregator.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::Stream;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::bus::Bus;
use crate::telemetry::contracts::MetricSample;
use crate::telemetry::registry::MetricRegistry;

#[derive(Clone)]
struct ScraperState {
    registry: MetricRegistry,
    auth_token: Option<Arc<String>>,
}

fn check_auth(state: &ScraperState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(token) = &state.auth_token else {
        return Ok(());
    };
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(token.as_str()) {
        Ok(())
    } else {
        Err((StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response())
    }
}

fn format_labels(label_names: &[String], key: &[String]) -> String {
    if label_names.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<(String, String)> = label_names
        .iter()
        .cloned()
        .zip(key.iter().cloned())
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    let body = pairs
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect::<Vec<_>>()
        .join(",");
    format!("{{{body}}}")
}

/// Renders the full text exposition format for the current registry
/// snapshot. Families with no observations still emit a HELP/TYPE header
/// and a single zero-value placeholder line.
pub fn render_prometheus_text(registry: &MetricRegistry) -> String {
    let snapshot = registry.collect_all();
    let mut out = String::new();

    for (name, family) in &snapshot.counters {
        out.push_str(&format!("# HELP {name} {}\n", family.help));
        out.push_str(&format!("# TYPE {name} counter\n"));
        if family.values.is_empty() {
            out.push_str(&format!("{name} 0.0\n"));
        }
        for (key, value) in &family.values {
            let labels = format_labels(&family.label_names, key);
            out.push_str(&format!("{name}{labels} {value}\n"));
        }
    }

    for (name, family) in &snapshot.gauges {
        out.push_str(&format!("# HELP {name} {}\n", family.help));
        out.push_str(&format!("# TYPE {name} gauge\n"));
        if family.values.is_empty() {
            out.push_str(&format!("{name} 0.0\n"));
        }
        for (key, value) in &family.values {
            let labels = format_labels(&family.label_names, key);
            out.push_str(&format!("{name}{labels} {value}\n"));
        }
    }

    for (name, family) in &snapshot.histograms {
        out.push_str(&format!("# HELP {name} {}\n", family.help));
        out.push_str(&format!("# TYPE {name} histogram\n"));
        if family.counts.is_empty() {
            for bound in &family.buckets {
                out.push_str(&format!("{name}_bucket{{le=\"{bound}\"}} 0\n"));
            }
            out.push_str(&format!("{name}_bucket{{le=\"+Inf\"}} 0\n"));
            out.push_str(&format!("{name}_sum 0.0\n"));
            out.push_str(&format!("{name}_count 0\n"));
        }
        for (key, (counts, sum, count)) in &family.counts {
            let base_labels = format_labels(&family.label_names, key);
            for (bound, bucket_count) in family.buckets.iter().zip(counts.iter()) {
                let le_labels = with_le(&base_labels, &bound.to_string());
                out.push_str(&format!("{name}_bucket{le_labels} {bucket_count}\n"));
            }
            let inf_labels = with_le(&base_labels, "+Inf");
            out.push_str(&format!("{name}_bucket{inf_labels} {count}\n"));
            out.push_str(&format!("{name}_sum{base_labels} {sum}\n"));
            out.push_str(&format!("{name}_count{base_labels} {count}\n"));
        }
    }

    for (name, family) in &snapshot.summaries {
        out.push_str(&format!("# HELP {name} {}\n", family.help));
        out.push_str(&format!("# TYPE {name} summary\n"));
        for (key, (_, sum, count)) in &family.observations {
            let base_labels = format_labels(&family.label_names, key);
            for quantile in &family.quantiles {
                let q_labels = with_le(&base_labels, &quantile.to_string());
                out.push_str(&format!("{name}{q_labels} {sum}\n"));
            }
            out.push_str(&format!("{name}_sum{base_labels} {sum}\n"));
            out.push_str(&format!("{name}_count{base_labels} {count}\n"));
        }
    }

    out
}

fn with_le(base_labels: &str, le: &str) -> String {
    if base_labels.is_empty() {
        format!("{{le=\"{le}\"}}")
    } else {
        format!("{}{}", &base_labels[..base_labels.len() - 1], format!(",le=\"{le}\"}}"))
    }
}

fn gauge_sum(registry: &MetricRegistry, name: &str) -> f64 {
    registry
        .get_gauge(name)
        .map(|_| registry.collect_all())
        .and_then(|snap| snap.gauges.get(name).map(|f| f.values.values().sum()))
        .unwrap_or(0.0)
}

fn counter_sum(registry: &MetricRegistry, name: &str) -> f64 {
    registry
        .get_counter(name)
        .map(|_| registry.collect_all())
        .and_then(|snap| snap.counters.get(name).map(|f| f.values.values().sum()))
        .unwrap_or(0.0)
}

/// Builds the dashboard snapshot shape by scanning well-known metric
/// names. Known limitation, preserved intentionally: `portfolio.daily_pnl`
/// sums `njord_strategy_pnl_usd` across every label-tuple, so a strategy
/// with multiple label combinations under the same `strategy_id` is
/// double-counted.
pub fn build_dashboard_snapshot(registry: &MetricRegistry, now_ms: i64) -> serde_json::Value {
    json!({
        "timestamp": now_ms,
        "portfolio": {
            "equity": 0.0,
            "daily_pnl": gauge_sum(registry, "njord_strategy_pnl_usd"),
            "position_count": gauge_sum(registry, "njord_position_size") as i64,
        },
        "strategies": [],
        "risk": {
            "killswitch_active": false,
            "caps_utilization": 0.0,
        },
        "activity": {
            "total_orders": counter_sum(registry, "njord_orders_placed_total") as i64,
            "total_fills": counter_sum(registry, "njord_fills_generated_total") as i64,
        },
        "system": {
            "event_loop_lag_ms": gauge_sum(registry, "njord_event_loop_lag_seconds") * 1000.0,
            "memory_usage_mb": gauge_sum(registry, "njord_memory_usage_mb"),
        },
    })
}

async fn metrics_handler(State(state): State<ScraperState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }
    render_prometheus_text(&state.registry).into_response()
}

async fn api_metrics_handler(State(state): State<ScraperState>, headers: HeaderMap) -> Response {
    if let Err(resp) = check_auth(&state, &headers) {
        return resp;
    }
    let now_ms = chrono::Utc::now().timestamp_millis();
    axum::Json(build_dashboard_snapshot(&state.registry, now_ms)).into_response()
}

async fn stream_handler(
    State(state): State<ScraperState>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, Response> {
    check_auth(&state, &headers)?;
    let registry = state.registry.clone();
    let interval = tokio::time::interval(Duration::from_secs(1));
    let stream = IntervalStream::new(interval).map(move |_| {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let snapshot = build_dashboard_snapshot(&registry, now_ms);
        Ok(Event::default().data(snapshot.to_string()))
    });
    Ok(Sse::new(stream))
}

async fn index_handler() -> Html<&'static str> {
    Html(
        "<!doctype html><html><body><h1>njord dashboard</h1>\
         <script>const es = new EventSource('/stream'); \
         es.onmessage = (e) => console.log(JSON.parse(e.data));</script>\
         </body></html>",
    )
}

pub struct Scraper {
    bus: Bus,
    registry: MetricRegistry,
    auth_token: Option<String>,
}

impl Scraper {
    pub fn new(bus: Bus, registry: MetricRegistry, auth_token: Option<String>) -> Self {
        Self { bus, registry, auth_token }
    }

    fn router(&self) -> Router {
        let state = ScraperState {
            registry: self.registry.clone(),
            auth_token: self.auth_token.clone().map(Arc::new),
        };
        Router::new()
            .route("/", get(index_handler))
            .route("/metrics", get(metrics_handler))
            .route("/api/metrics", get(api_metrics_handler))
            .route("/stream", get(stream_handler))
            .with_state(state)
    }

    /// Runs the bus-consumer task and the HTTP server until the bus
    /// closes or the listener errors.
    pub async fn run(&self, bind_host: &str, port: u16) -> anyhow::Result<()> {
        let registry = self.registry.clone();
        let mut sub = self.bus.subscribe("telemetry.metrics");
        let consumer = async move {
            while let Some(payload) = sub.recv().await {
                if let Ok(sample) = serde_json::from_value::<MetricSample>(payload) {
                    apply_sample(&registry, &sample);
                }
            }
        };

        let addr = format!("{bind_host}:{port}");
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "scraper listening");
        let server = axum::serve(listener, self.router());

        tokio::select! {
            _ = consumer => {}
            result = server => { result?; }
        }
        Ok(())
    }
}

/// Applies a bus sample directly to the registry. Never auto-registers —
/// samples for unknown families are logged and dropped, consistent with
/// the aggregator owning registration.
fn apply_sample(registry: &MetricRegistry, sample: &MetricSample) {
    use crate::telemetry::contracts::MetricType;
    let labels: crate::telemetry::registry::Labels =
        sample.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    let result = match sample.metric_type {
        MetricType::Counter => registry
            .get_counter(&sample.name)
            .map(|h| h.inc(sample.value, &labels)),
        MetricType::Gauge => registry
            .get_gauge(&sample.name)
            .map(|h| h.set(sample.value, &labels)),
        MetricType::Histogram => registry
            .get_histogram(&sample.name)
            .map(|h| h.observe(sample.value, &labels)),
        MetricType::Summary => registry
            .get_summary(&sample.name)
            .map(|h| h.observe(sample.value, &labels)),
    };
    match result {
        None => warn!(metric = %sample.name, "sample for unregistered metric, dropping"),
        Some(Err(err)) => warn!(metric = %sample.name, error = %err, "failed to apply sample"),
        Some(Ok(())) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    #[test]
    fn renders_help_type_and_zero_placeholder_for_empty_family() {
        let registry = MetricRegistry::new();
        registry.register_gauge("idle_gauge", "an idle gauge", vec![]).unwrap();
        let text = render_prometheus_text(&registry);
        assert!(text.contains("# HELP idle_gauge an idle gauge"));
        assert!(text.contains("# TYPE idle_gauge gauge"));
        assert!(text.contains("idle_gauge 0.0"));
    }

    #[test]
    fn renders_sorted_labels() {
        let registry = MetricRegistry::new();
        let counter = registry
            .register_counter("orders_total", "help", vec!["strategy".into(), "symbol".into()])
            .unwrap();
        let mut labels = StdHashMap::new();
        labels.insert("strategy".to_string(), "twap_v1".to_string());
        labels.insert("symbol".to_string(), "BTC/USDT".to_string());
        counter.inc(5.0, &labels).unwrap();

        let text = render_prometheus_text(&registry);
        assert!(text.contains("orders_total{strategy=\"twap_v1\",symbol=\"BTC/USDT\"} 5"));
    }

    #[test]
    fn histogram_bucket_lines_are_cumulative_plus_inf() {
        let registry = MetricRegistry::new();
        let hist = registry
            .register_histogram("latency_ms", "help", vec![], vec![10.0, 100.0])
            .unwrap();
        hist.observe(5.0, &StdHashMap::new()).unwrap();
        let text = render_prometheus_text(&registry);
        assert!(text.contains("latency_ms_bucket{le=\"10\"} 1"));
        assert!(text.contains("latency_ms_bucket{le=\"+Inf\"} 1"));
        assert!(text.contains("latency_ms_sum 5"));
        assert!(text.contains("latency_ms_count 1"));
    }

    #[test]
    fn dashboard_snapshot_has_expected_shape() {
        let registry = MetricRegistry::new();
        let snapshot = build_dashboard_snapshot(&registry, 123);
        assert_eq!(snapshot["timestamp"], 123);
        assert!(snapshot["portfolio"].is_object());
        assert!(snapshot["activity"].is_object());
    }
}
