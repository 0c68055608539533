//! Server error types.

use crate::config::ConfigError;
use dredge_protocol::ProtocolError;
use std::time::Duration;
use thiserror::Error;

/// Errors that prevent a session from starting or end a running one.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to connect to sensor {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to sensor {addr} after {timeout:?}")]
    DialTimeout { addr: String, timeout: Duration },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("sensor write failed: {0}")]
    SensorWrite(#[source] std::io::Error),

    #[error("sensor read failed: {0}")]
    SensorRead(#[source] std::io::Error),

    #[error("sensor closed the connection")]
    SensorClosed,

    #[error("relay write failed: {0}")]
    RelayWrite(#[source] std::io::Error),

    #[error("relay read failed: {0}")]
    RelayRead(#[source] std::io::Error),

    #[error("relay client disconnected")]
    RelayClosed,

    #[error("relay client did not accept data within {timeout:?}")]
    RelayBackpressure { timeout: Duration },

    #[error("sensor stream lost framing: {0}")]
    FrameTooLong(#[source] ProtocolError),

    #[error("session closed by caller")]
    ClosedByCaller,

    #[error("server shutting down")]
    ServerShutdown,

    #[error("session task failed: {0}")]
    TaskFailed(String),
}

impl SessionError {
    /// Returns whether the session never reached the sensor.
    pub fn is_dial_failure(&self) -> bool {
        matches!(
            self,
            SessionError::Dial { .. } | SessionError::DialTimeout { .. }
        )
    }

    /// Returns whether the relay connection itself is unusable.
    pub fn is_relay_side(&self) -> bool {
        matches!(
            self,
            SessionError::RelayWrite(_)
                | SessionError::RelayRead(_)
                | SessionError::RelayClosed
                | SessionError::RelayBackpressure { .. }
        )
    }

    /// Stable short label, used for metrics and notices.
    pub fn cause_label(&self) -> &'static str {
        match self {
            SessionError::Dial { .. } => "dial",
            SessionError::DialTimeout { .. } => "dial_timeout",
            SessionError::Config(_) => "config",
            SessionError::SensorWrite(_) => "sensor_write",
            SessionError::SensorRead(_) => "sensor_read",
            SessionError::SensorClosed => "sensor_closed",
            SessionError::RelayWrite(_) => "relay_write",
            SessionError::RelayRead(_) => "relay_read",
            SessionError::RelayClosed => "relay_closed",
            SessionError::RelayBackpressure { .. } => "relay_backpressure",
            SessionError::FrameTooLong(_) => "frame_too_long",
            SessionError::ClosedByCaller => "closed_by_caller",
            SessionError::ServerShutdown => "server_shutdown",
            SessionError::TaskFailed(_) => "task_failed",
        }
    }
}

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("server shutting down")]
    ShuttingDown,
}
