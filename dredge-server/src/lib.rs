//! # dredge-server
//!
//! Telemetry relay server for dredger sensor units.
//!
//! This crate provides:
//! - Sensor sessions: polling, frame decoding and relaying under one
//!   single-shot shutdown signal
//! - A downstream TCP server that opens one session per client request
//! - Layered configuration (defaults, YAML file, environment)
//! - Prometheus metrics

pub mod config;
pub mod error;
pub mod metrics;
pub mod poller;
pub mod relay;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::{
    Config, ConfigError, MetricsConfig, NetworkConfig, RelayConfig, SensorConfig, VesselProfile,
    VesselsConfig,
};
pub use error::{ServerError, SessionError};
pub use metrics::{run_metrics_server, Metrics};
pub use poller::PollScheduler;
pub use relay::RelayPublisher;
pub use server::{Server, ServerConfig, ServerStats, MAX_REQUEST_LINE};
pub use session::{
    dial_sensor, open_session, ConnectionSession, OpenError, SessionConfig, SessionContext,
    SessionHandle, SessionOutcome, SessionState, SessionStats,
};
pub use shutdown::ShutdownSignal;
