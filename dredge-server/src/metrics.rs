//! Prometheus metrics for the relay server.
//!
//! This module provides:
//! - Metrics registry with counters, gauges, and histograms
//! - HTTP server to expose metrics at `/metrics` endpoint

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Publish duration histogram buckets (in seconds).
const DURATION_BUCKETS: &[f64] = &[0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.0];

/// Prometheus metrics for the relay server.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Total downstream connections accepted.
    pub connections_total: Counter,
    /// Currently open downstream connections.
    pub connections_active: Gauge,
    /// Total sensor sessions started.
    pub sessions_total: Counter,
    /// Currently running sensor sessions.
    pub sessions_active: Gauge,
    /// Sensor dials that failed or timed out.
    pub dial_failures_total: Counter,
    /// Frames that passed validation.
    pub frames_decoded_total: Counter,
    /// Frames dropped, by reason.
    pub frames_rejected_total: CounterVec,
    /// Samples written to relay clients.
    pub samples_published_total: Counter,
    /// Session terminations, by cause.
    pub session_terminations_total: CounterVec,
    /// Time spent writing one sample to a relay client.
    pub publish_duration: Histogram,
}

impl Metrics {
    /// Creates a new Metrics instance with all metrics registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Connections
        let connections_total = Counter::with_opts(Opts::new(
            "dredge_connections_total",
            "Total number of downstream connections accepted",
        ))?;
        registry.register(Box::new(connections_total.clone()))?;

        let connections_active = Gauge::with_opts(Opts::new(
            "dredge_connections_active",
            "Number of currently open downstream connections",
        ))?;
        registry.register(Box::new(connections_active.clone()))?;

        // Sessions
        let sessions_total = Counter::with_opts(Opts::new(
            "dredge_sessions_total",
            "Total number of sensor sessions started",
        ))?;
        registry.register(Box::new(sessions_total.clone()))?;

        let sessions_active = Gauge::with_opts(Opts::new(
            "dredge_sessions_active",
            "Number of currently running sensor sessions",
        ))?;
        registry.register(Box::new(sessions_active.clone()))?;

        let dial_failures_total = Counter::with_opts(Opts::new(
            "dredge_dial_failures_total",
            "Total sensor connection attempts that failed",
        ))?;
        registry.register(Box::new(dial_failures_total.clone()))?;

        let session_terminations_total = CounterVec::new(
            Opts::new(
                "dredge_session_terminations_total",
                "Total session terminations by cause",
            ),
            &["cause"],
        )?;
        registry.register(Box::new(session_terminations_total.clone()))?;

        // Frames
        let frames_decoded_total = Counter::with_opts(Opts::new(
            "dredge_frames_decoded_total",
            "Total frames decoded into samples",
        ))?;
        registry.register(Box::new(frames_decoded_total.clone()))?;

        let frames_rejected_total = CounterVec::new(
            Opts::new(
                "dredge_frames_rejected_total",
                "Total frames dropped by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(frames_rejected_total.clone()))?;

        // Relay
        let samples_published_total = Counter::with_opts(Opts::new(
            "dredge_samples_published_total",
            "Total samples written to relay clients",
        ))?;
        registry.register(Box::new(samples_published_total.clone()))?;

        let publish_duration = Histogram::with_opts(
            HistogramOpts::new(
                "dredge_publish_duration_seconds",
                "Time to write one sample to a relay client in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
        )?;
        registry.register(Box::new(publish_duration.clone()))?;

        Ok(Self {
            registry,
            connections_total,
            connections_active,
            sessions_total,
            sessions_active,
            dial_failures_total,
            frames_decoded_total,
            frames_rejected_total,
            samples_published_total,
            session_terminations_total,
            publish_duration,
        })
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
        }
        buffer
    }

    /// Returns a reference to the registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Runs the HTTP metrics server.
///
/// Serves metrics at `/metrics` and a liveness probe at `/health`.
pub async fn run_metrics_server(
    addr: SocketAddr,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                async move { handle_request(req, metrics).await }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("Metrics connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Metrics server shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Handles an HTTP request to the metrics server.
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let response = match req.uri().path() {
        "/metrics" => text_response(
            StatusCode::OK,
            Some("text/plain; version=0.0.4; charset=utf-8"),
            metrics.encode(),
        ),
        "/health" | "/healthz" => text_response(StatusCode::OK, None, "OK"),
        _ => text_response(StatusCode::NOT_FOUND, None, "Not Found"),
    };

    Ok(response)
}

fn text_response(
    status: StatusCode,
    content_type: Option<&'static str>,
    body: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Some(content_type) = content_type {
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.connections_total.inc();
        metrics.sessions_active.inc();
        metrics.frames_decoded_total.inc();
        metrics
            .frames_rejected_total
            .with_label_values(&["checksum_mismatch"])
            .inc();
        metrics
            .session_terminations_total
            .with_label_values(&["sensor_closed"])
            .inc();
        metrics.publish_duration.observe(0.002);

        let encoded = String::from_utf8(metrics.encode()).unwrap();

        assert!(encoded.contains("dredge_connections_total 1"));
        assert!(encoded.contains("dredge_sessions_active 1"));
        assert!(encoded.contains("dredge_frames_decoded_total 1"));
        assert!(encoded.contains(r#"dredge_frames_rejected_total{reason="checksum_mismatch"} 1"#));
        assert!(encoded.contains(r#"dredge_session_terminations_total{cause="sensor_closed"} 1"#));
        assert!(encoded.contains("dredge_publish_duration_seconds"));
    }

    #[test]
    fn test_text_response() {
        let response = text_response(StatusCode::NOT_FOUND, None, "Not Found");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get(CONTENT_TYPE).is_none());

        let response = text_response(StatusCode::OK, Some("text/plain"), Vec::new());
        assert_eq!(response.headers()[CONTENT_TYPE], "text/plain");
    }

    #[tokio::test]
    async fn test_metrics_server_shuts_down() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let (tx, rx) = broadcast::channel(1);

        let server = tokio::spawn(run_metrics_server(
            "127.0.0.1:0".parse().unwrap(),
            metrics,
            rx,
        ));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tx.send(()).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
