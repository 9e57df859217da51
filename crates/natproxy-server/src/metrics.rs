//! Metrics collection and export

use std::time::{Duration, Instant};

use prometheus::{
    core::Collector, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Relay-wide counters
pub struct RelayMetrics {
    active_sessions: IntGauge,
    total_sessions: IntCounter,
    rejected_connections: IntCounter,
    login_success: IntCounter,
    login_failures: IntCounter,
    active_channels: IntGauge,
    total_channels: IntCounter,
    channel_duration: Histogram,
    upload_bytes: IntCounter,
    upload_packets: IntCounter,
    download_bytes: IntCounter,
    download_packets: IntCounter,
    dropped_datagrams: IntCounter,
    protocol_resyncs: IntCounter,
    registry: Registry,
    start_time: Instant,
}

fn register<C: Collector + Clone + 'static>(
    registry: &Registry,
    metric: C,
) -> Result<C, prometheus::Error> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    register(registry, IntCounter::with_opts(Opts::new(name, help))?)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    register(registry, IntGauge::with_opts(Opts::new(name, help))?)
}

impl RelayMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let channel_duration = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "natproxy_channel_duration_seconds",
                    "Relay channel lifetime in seconds",
                )
                .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 4.0 * 3600.0]),
            )?,
        )?;

        Ok(Self {
            active_sessions: gauge(
                &registry,
                "natproxy_active_sessions",
                "Connected control sessions",
            )?,
            total_sessions: counter(
                &registry,
                "natproxy_sessions_total",
                "Control sessions accepted",
            )?,
            rejected_connections: counter(
                &registry,
                "natproxy_rejected_connections_total",
                "Connections closed at accept because of the session limit",
            )?,
            login_success: counter(
                &registry,
                "natproxy_login_success_total",
                "Successful logins",
            )?,
            login_failures: counter(
                &registry,
                "natproxy_login_failures_total",
                "Rejected logins",
            )?,
            active_channels: gauge(
                &registry,
                "natproxy_active_channels",
                "Open relay channels",
            )?,
            total_channels: counter(
                &registry,
                "natproxy_channels_total",
                "Relay channels created",
            )?,
            channel_duration,
            upload_bytes: counter(
                &registry,
                "natproxy_upload_bytes_total",
                "Bytes relayed from requester to destination",
            )?,
            upload_packets: counter(
                &registry,
                "natproxy_upload_packets_total",
                "Datagrams relayed from requester to destination",
            )?,
            download_bytes: counter(
                &registry,
                "natproxy_download_bytes_total",
                "Bytes relayed from destination to requester",
            )?,
            download_packets: counter(
                &registry,
                "natproxy_download_packets_total",
                "Datagrams relayed from destination to requester",
            )?,
            dropped_datagrams: counter(
                &registry,
                "natproxy_dropped_datagrams_total",
                "Datagrams dropped (foreign source, peer not authenticated)",
            )?,
            protocol_resyncs: counter(
                &registry,
                "natproxy_protocol_resyncs_total",
                "Bad control headers skipped",
            )?,
            registry,
            start_time: Instant::now(),
        })
    }

    pub fn session_opened(&self) {
        self.total_sessions.inc();
        self.active_sessions.inc();
    }

    pub fn session_closed(&self) {
        self.active_sessions.dec();
    }

    pub fn connection_rejected(&self) {
        self.rejected_connections.inc();
    }

    pub fn login_succeeded(&self) {
        self.login_success.inc();
    }

    pub fn login_failed(&self) {
        self.login_failures.inc();
    }

    pub fn channel_opened(&self) {
        self.total_channels.inc();
        self.active_channels.inc();
    }

    pub fn channel_closed(&self, lifetime: Duration) {
        self.active_channels.dec();
        self.channel_duration.observe(lifetime.as_secs_f64());
    }

    pub fn record_upload(&self, bytes: usize) {
        self.upload_bytes.inc_by(bytes as u64);
        self.upload_packets.inc();
    }

    pub fn record_download(&self, bytes: usize) {
        self.download_bytes.inc_by(bytes as u64);
        self.download_packets.inc();
    }

    pub fn record_drop(&self) {
        self.dropped_datagrams.inc();
    }

    pub fn record_resync(&self) {
        self.protocol_resyncs.inc();
    }

    /// Export Prometheus format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    pub fn total_sessions(&self) -> u64 {
        self.total_sessions.get()
    }

    pub fn total_channels(&self) -> u64 {
        self.total_channels.get()
    }

    pub fn active_channels(&self) -> i64 {
        self.active_channels.get()
    }

    pub fn bytes_forwarded(&self) -> u64 {
        self.upload_bytes.get() + self.download_bytes.get()
    }

    pub fn packets_forwarded(&self) -> u64 {
        self.upload_packets.get() + self.download_packets.get()
    }

    pub fn dropped_datagrams(&self) -> u64 {
        self.dropped_datagrams.get()
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}
