use std::net::SocketAddr;

use metrics::{counter, gauge};

/// Thin wrappers over the `metrics` facade. Without an installed recorder
/// every call is a no-op, so library code records unconditionally.
pub struct MetricsCollector;

impl MetricsCollector {
    /// Install the Prometheus exporter with its own HTTP listener.
    /// Must be called from within a tokio runtime.
    pub fn init(bind_address: SocketAddr) {
        if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(bind_address)
            .install()
        {
            tracing::warn!("Failed to install Prometheus exporter: {}", e);
        }
    }

    pub fn record_packet_received(size: usize) {
        counter!("rtp_packets_received_total").increment(1);
        counter!("rtp_bytes_received_total").increment(size as u64);
    }

    pub fn record_packet_dropped(stage: &'static str) {
        counter!("rtp_packets_dropped_total", "stage" => stage).increment(1);
    }

    pub fn record_rtcp_received() {
        counter!("rtcp_packets_received_total").increment(1);
    }

    pub fn record_rtsp_request(method: &str) {
        counter!("rtsp_requests_total", "method" => method.to_string()).increment(1);
    }

    pub fn record_hls_segment() {
        counter!("hls_segments_written_total").increment(1);
    }

    pub fn update_client_count(stream_type: &'static str, count: usize) {
        gauge!("stream_clients", "stream_type" => stream_type).set(count as f64);
    }
}
