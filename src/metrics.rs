//! Process-wide metrics, exposed in Prometheus text format.

use std::sync::OnceLock;

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

/// All registered metrics.
pub struct Metrics {
    registry: Registry,

    /// Proxy requests denied by the allowlist.
    pub proxy_blocked_total: IntCounter,
    /// Proxy request latency by method.
    pub proxy_request_duration_seconds: HistogramVec,
    /// Execute outcomes: success / error / timeout.
    pub requests_total: IntCounterVec,
    /// Sandboxes that crashed mid-stream.
    pub container_crashes_total: IntCounter,
    /// Sandboxes reaped by the GC.
    pub gc_destroyed_total: IntCounter,
    /// GC cycles by outcome.
    pub gc_cycles_total: IntCounterVec,
    /// Blob store operations by operation and status.
    pub s3_operations_total: IntCounterVec,
    /// Warm pool creation failures.
    pub warm_pool_create_failures_total: IntCounter,

    /// Sandboxes currently bound to conversations.
    pub active_containers: IntGauge,
    /// Current warm pool size.
    pub warm_pool_size: IntGauge,

    /// Time to bind a sandbox to a conversation.
    pub container_startup_seconds: Histogram,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let proxy_blocked_total = IntCounter::with_opts(Opts::new(
            "workspace_proxy_blocked_total",
            "Proxy requests denied by the domain allowlist",
        ))
        .expect("metric opts");

        let proxy_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "workspace_proxy_request_duration_seconds",
                "Proxy request duration in seconds",
            )
            .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["method"],
        )
        .expect("metric opts");

        let requests_total = IntCounterVec::new(
            Opts::new(
                "workspace_requests_total",
                "Execute requests by terminal status",
            ),
            &["status"],
        )
        .expect("metric opts");

        let container_crashes_total = IntCounter::with_opts(Opts::new(
            "workspace_container_crashes_total",
            "Sandbox crashes observed during execution",
        ))
        .expect("metric opts");

        let gc_destroyed_total = IntCounter::with_opts(Opts::new(
            "workspace_gc_destroyed_total",
            "Sandboxes destroyed by the garbage collector",
        ))
        .expect("metric opts");

        let gc_cycles_total = IntCounterVec::new(
            Opts::new("workspace_gc_cycles_total", "GC cycles by outcome"),
            &["outcome"],
        )
        .expect("metric opts");

        let s3_operations_total = IntCounterVec::new(
            Opts::new(
                "workspace_s3_operations_total",
                "Blob store operations by operation and status",
            ),
            &["operation", "status"],
        )
        .expect("metric opts");

        let warm_pool_create_failures_total = IntCounter::with_opts(Opts::new(
            "workspace_warm_pool_create_failures_total",
            "Warm pool sandbox creations that failed after retries",
        ))
        .expect("metric opts");

        let active_containers = IntGauge::with_opts(Opts::new(
            "workspace_active_containers",
            "Sandboxes currently bound to conversations",
        ))
        .expect("metric opts");

        let warm_pool_size = IntGauge::with_opts(Opts::new(
            "workspace_warm_pool_size",
            "Sandboxes waiting in the warm pool",
        ))
        .expect("metric opts");

        let container_startup_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "workspace_container_startup_seconds",
                "Time to bind a sandbox to a conversation",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )
        .expect("metric opts");

        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(proxy_blocked_total.clone()),
            Box::new(proxy_request_duration_seconds.clone()),
            Box::new(requests_total.clone()),
            Box::new(container_crashes_total.clone()),
            Box::new(gc_destroyed_total.clone()),
            Box::new(gc_cycles_total.clone()),
            Box::new(s3_operations_total.clone()),
            Box::new(warm_pool_create_failures_total.clone()),
            Box::new(active_containers.clone()),
            Box::new(warm_pool_size.clone()),
            Box::new(container_startup_seconds.clone()),
        ];
        for collector in collectors {
            registry.register(collector).expect("register metric");
        }

        Self {
            registry,
            proxy_blocked_total,
            proxy_request_duration_seconds,
            requests_total,
            container_crashes_total,
            gc_destroyed_total,
            gc_cycles_total,
            s3_operations_total,
            warm_pool_create_failures_total,
            active_containers,
            warm_pool_size,
            container_startup_seconds,
        }
    }

    /// Render every registered metric in Prometheus text format.
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

/// Process-wide metrics handle.
pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_increment() {
        let m = metrics();
        let before = m.proxy_blocked_total.get();
        m.proxy_blocked_total.inc();
        assert_eq!(m.proxy_blocked_total.get(), before + 1);
    }

    #[test]
    fn test_render_exposes_text_format() {
        let m = metrics();
        m.requests_total.with_label_values(&["success"]).inc();
        let text = m.render();
        assert!(text.contains("# TYPE workspace_requests_total counter"));
        assert!(text.contains("workspace_requests_total{status=\"success\"}"));
    }

    #[test]
    fn test_gauge_up_down() {
        let m = metrics();
        let before = m.active_containers.get();
        m.active_containers.inc();
        m.active_containers.dec();
        assert_eq!(m.active_containers.get(), before);
    }
}
