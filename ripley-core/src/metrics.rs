//! The metrics facade: either a no-op or a `prometheus`-backed set of
//! counters/histograms, plus the small `trillium` HTTP server used to serve
//! them in Prometheus text format — a tiny router over a single GET
//! handler.

use std::net::SocketAddr;
use std::sync::Arc;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use trillium::{Conn, KnownHeaderName};
use trillium_router::Router;

struct PrometheusMetrics {
    registry: Registry,
    requests_total: IntCounter,
    errors_total: IntCounterVec,
    request_duration_seconds: HistogramVec,
    response_status_total: IntCounterVec,
    worker_pool_size: IntGauge,
    request_queue_size: IntGauge,
    result_queue_size: IntGauge,
    pacer_phase: prometheus::GaugeVec,
    pacer_phase_wall_seconds: prometheus::CounterVec,
    connections_opened_total: IntCounterVec,
    connections_closed_total: IntCounterVec,
    connections_failed_total: IntCounterVec,
    connections_read_bytes_total: IntCounterVec,
    connections_write_bytes_total: IntCounterVec,
}

/// No-op or Prometheus-backed metrics, selected once at start-up from
/// `--metrics-enable`.
pub enum Metrics {
    Noop,
    Prometheus(PrometheusMetrics),
}

impl Metrics {
    pub fn noop() -> Arc<Metrics> {
        Arc::new(Metrics::Noop)
    }

    pub fn prometheus() -> Result<Arc<Metrics>, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounter::new("requests_total", "total requests dispatched")?;
        let errors_total = IntCounterVec::new(
            Opts::new("errors_total", "transport errors, by destination host"),
            &["host"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "request_duration_seconds",
                "request latency in seconds, by destination host",
            ),
            &["host"],
        )?;
        let response_status_total = IntCounterVec::new(
            Opts::new("response_status_total", "responses by status code and host"),
            &["status", "host"],
        )?;
        let worker_pool_size = IntGauge::new("worker_pool_size", "configured worker pool size")?;
        let request_queue_size = IntGauge::new("request_queue_size", "requests queued for workers")?;
        let result_queue_size = IntGauge::new("result_queue_size", "results queued for the handler")?;
        let pacer_phase = prometheus::GaugeVec::new(
            Opts::new("pacer_phase", "current phase rate multiplier"),
            &["phase"],
        )?;
        let pacer_phase_wall_seconds = prometheus::CounterVec::new(
            Opts::new("pacer_phase_wall_seconds", "wall-clock seconds spent in each phase"),
            &["phase"],
        )?;
        let connections_opened_total = IntCounterVec::new(
            Opts::new("connections_opened_total", "clients created, by host"),
            &["host"],
        )?;
        let connections_closed_total = IntCounterVec::new(
            Opts::new("connections_closed_total", "clients evicted, by host"),
            &["host"],
        )?;
        let connections_failed_total = IntCounterVec::new(
            Opts::new("connections_failed_total", "client construction failures, by host"),
            &["host"],
        )?;
        let connections_read_bytes_total = IntCounterVec::new(
            Opts::new(
                "connections_read_bytes_total",
                "bytes read, by host (approximated from response bodies)",
            ),
            &["host"],
        )?;
        let connections_write_bytes_total = IntCounterVec::new(
            Opts::new(
                "connections_write_bytes_total",
                "bytes written, by host (approximated from request bodies)",
            ),
            &["host"],
        )?;

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(errors_total.clone()),
            Box::new(request_duration_seconds.clone()),
            Box::new(response_status_total.clone()),
            Box::new(worker_pool_size.clone()),
            Box::new(request_queue_size.clone()),
            Box::new(result_queue_size.clone()),
            Box::new(pacer_phase.clone()),
            Box::new(pacer_phase_wall_seconds.clone()),
            Box::new(connections_opened_total.clone()),
            Box::new(connections_closed_total.clone()),
            Box::new(connections_failed_total.clone()),
            Box::new(connections_read_bytes_total.clone()),
            Box::new(connections_write_bytes_total.clone()),
        ] {
            registry.register(collector)?;
        }

        Ok(Arc::new(Metrics::Prometheus(PrometheusMetrics {
            registry,
            requests_total,
            errors_total,
            request_duration_seconds,
            response_status_total,
            worker_pool_size,
            request_queue_size,
            result_queue_size,
            pacer_phase,
            pacer_phase_wall_seconds,
            connections_opened_total,
            connections_closed_total,
            connections_failed_total,
            connections_read_bytes_total,
            connections_write_bytes_total,
        })))
    }

    pub fn inc_requests_total(&self) {
        if let Metrics::Prometheus(m) = self {
            m.requests_total.inc();
        }
    }

    pub fn inc_errors_total(&self, host: &str) {
        if let Metrics::Prometheus(m) = self {
            m.errors_total.with_label_values(&[host]).inc();
        }
    }

    pub fn observe_latency_seconds(&self, host: &str, seconds: f64) {
        if let Metrics::Prometheus(m) = self {
            m.request_duration_seconds
                .with_label_values(&[host])
                .observe(seconds);
        }
    }

    pub fn inc_response_status(&self, status: i32, host: &str) {
        if let Metrics::Prometheus(m) = self {
            m.response_status_total
                .with_label_values(&[&status.to_string(), host])
                .inc();
        }
    }

    pub fn set_worker_pool_size(&self, n: i64) {
        if let Metrics::Prometheus(m) = self {
            m.worker_pool_size.set(n);
        }
    }

    pub fn set_request_queue_size(&self, n: i64) {
        if let Metrics::Prometheus(m) = self {
            m.request_queue_size.set(n);
        }
    }

    pub fn set_result_queue_size(&self, n: i64) {
        if let Metrics::Prometheus(m) = self {
            m.result_queue_size.set(n);
        }
    }

    pub fn set_pacer_phase_rate(&self, phase: &str, rate: f64) {
        if let Metrics::Prometheus(m) = self {
            m.pacer_phase.with_label_values(&[phase]).set(rate);
        }
    }

    pub fn inc_pacer_phase_wall_seconds(&self, phase: &str, seconds: f64) {
        if let Metrics::Prometheus(m) = self {
            m.pacer_phase_wall_seconds
                .with_label_values(&[phase])
                .inc_by(seconds);
        }
    }

    pub fn inc_connections_opened(&self, host: &str) {
        if let Metrics::Prometheus(m) = self {
            m.connections_opened_total.with_label_values(&[host]).inc();
        }
    }

    pub fn inc_connections_closed(&self, host: &str) {
        if let Metrics::Prometheus(m) = self {
            m.connections_closed_total.with_label_values(&[host]).inc();
        }
    }

    pub fn inc_connections_failed(&self, host: &str) {
        if let Metrics::Prometheus(m) = self {
            m.connections_failed_total.with_label_values(&[host]).inc();
        }
    }

    pub fn inc_connections_read_bytes(&self, host: &str, n: u64) {
        if let Metrics::Prometheus(m) = self {
            m.connections_read_bytes_total
                .with_label_values(&[host])
                .inc_by(n);
        }
    }

    pub fn inc_connections_write_bytes(&self, host: &str, n: u64) {
        if let Metrics::Prometheus(m) = self {
            m.connections_write_bytes_total
                .with_label_values(&[host])
                .inc_by(n);
        }
    }

    /// Render the current state in Prometheus text exposition format.
    /// Returns `None` for the no-op facade (the `/metrics` server is never
    /// started in that case).
    pub fn render(&self) -> Option<String> {
        match self {
            Metrics::Noop => None,
            Metrics::Prometheus(m) => {
                let metric_families = m.registry.gather();
                let encoder = TextEncoder::new();
                let mut buffer = Vec::new();
                encoder.encode(&metric_families, &mut buffer).ok()?;
                String::from_utf8(buffer).ok()
            }
        }
    }
}

/// Starts the `/metrics` scrape endpoint: a minimal `trillium_tokio` server
/// with one router and one handler, run as a detached task.
pub async fn serve_metrics(address: SocketAddr, metrics: Arc<Metrics>) {
    let handler = Router::new().get("/metrics", move |conn: Conn| {
        let metrics = Arc::clone(&metrics);
        async move {
            match metrics.render() {
                Some(body) => conn
                    .with_header(KnownHeaderName::ContentType, "text/plain; version=0.0.4")
                    .ok(body),
                None => conn.with_status(trillium::Status::NotFound).halt(),
            }
        }
    });

    trillium_tokio::config()
        .with_port(address.port())
        .with_host(&address.ip().to_string())
        .without_signals()
        .run_async(handler)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_render_is_none() {
        let metrics = Metrics::noop();
        metrics.inc_requests_total();
        assert!(metrics.render().is_none());
    }

    #[test]
    fn prometheus_render_contains_registered_metrics() {
        let metrics = Metrics::prometheus().unwrap();
        metrics.inc_requests_total();
        metrics.inc_response_status(200, "example.com:80");
        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("requests_total"));
        assert!(rendered.contains("response_status_total"));
    }
}
