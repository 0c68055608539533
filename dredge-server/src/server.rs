//! Downstream TCP server.
//!
//! Each client connection sends one request line naming a sensor, then
//! receives JSON lines for the lifetime of the resulting session.

use crate::config::{Config, VesselsConfig};
use crate::error::{ServerError, SessionError};
use crate::metrics::Metrics;
use crate::session::{open_session, SessionConfig, SessionContext};
use dredge_protocol::{encode_line, OpenRequest, RelayNotice};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

/// Longest request line a client may send, excluding the newline.
pub const MAX_REQUEST_LINE: usize = 1024;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Settings applied to every session.
    pub session: SessionConfig,
    /// Vessel profiles clients may request.
    pub vessels: VesselsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            max_connections: config.network.max_connections,
            session: SessionConfig::from_config(config),
            vessels: config.vessels.clone(),
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.session.metrics = Some(metrics);
        self
    }

    fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.session.metrics.as_ref()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub sessions_total: AtomicU64,
    pub dial_failures: AtomicU64,
    pub errors_total: AtomicU64,
}

/// Relay server.
pub struct Server {
    config: ServerConfig,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and runs the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Runs the server on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Relay server listening on {}", listener.local_addr()?);

        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.stats.connections_active.load(Ordering::Relaxed)
                                >= self.config.max_connections as u64
                            {
                                tracing::warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }

                            self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
                            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
                            if let Some(metrics) = self.config.metrics() {
                                metrics.connections_total.inc();
                                metrics.connections_active.inc();
                            }

                            let stats = self.stats.clone();
                            let config = self.config.clone();
                            let mut conn_shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                let result = Self::handle_connection(
                                    stream,
                                    addr,
                                    &config,
                                    &stats,
                                    &mut conn_shutdown,
                                )
                                .await;

                                if let Err(e) = result {
                                    tracing::debug!("Connection {} error: {}", addr, e);
                                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                                }

                                stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                                if let Some(metrics) = config.metrics() {
                                    metrics.connections_active.dec();
                                }

                                tracing::info!("Client disconnected: {}", addr);
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Reads request lines until a session starts, then waits for it to end.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        config: &ServerConfig,
        stats: &ServerStats,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        tracing::info!("Client connected: {}", addr);
        let _ = stream.set_nodelay(true);

        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut writer = write_half;
        let mut line = String::new();

        loop {
            line.clear();
            let mut limited = (&mut reader).take(MAX_REQUEST_LINE as u64 + 1);
            let n = tokio::select! {
                result = limited.read_line(&mut line) => result?,
                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    return Err(ServerError::ShuttingDown);
                }
            };
            if n == 0 {
                tracing::debug!("[{}] Connection closed before a session started", addr);
                return Ok(());
            }
            if line.len() > MAX_REQUEST_LINE && !line.ends_with('\n') {
                tracing::warn!("[{}] Request line exceeds {} bytes", addr, MAX_REQUEST_LINE);
                let notice = RelayNotice::InvalidRequest {
                    message: format!("request line exceeds {} bytes", MAX_REQUEST_LINE),
                };
                send_notice(&mut writer, &notice).await?;
                return Ok(());
            }

            let request = match OpenRequest::parse(&line) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!("[{}] Invalid request: {}", addr, e);
                    let notice = RelayNotice::InvalidRequest {
                        message: e.to_string(),
                    };
                    send_notice(&mut writer, &notice).await?;
                    continue;
                }
            };

            let vessel = request
                .vessel
                .unwrap_or_else(|| config.vessels.default_profile.clone());
            let channels = match config.vessels.resolve(&vessel) {
                Ok(channels) => channels,
                Err(e) => {
                    tracing::warn!("[{}] Rejecting request for {}: {}", addr, request.sensor, e);
                    let notice = RelayNotice::ConfigError {
                        message: SessionError::from(e).to_string(),
                    };
                    send_notice(&mut writer, &notice).await?;
                    continue;
                }
            };

            tracing::info!(
                "[{}] Opening session: sensor={} vessel={}",
                addr,
                request.sensor,
                vessel
            );
            let ctx = SessionContext {
                vessel,
                channels,
                config: config.session.clone(),
            };

            let handle = match open_session(&request.sensor, reader, writer, ctx).await {
                Ok(handle) => handle,
                Err(failed) => {
                    stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("[{}] {}", addr, failed.error);
                    reader = failed.relay_reader;
                    writer = failed.relay_writer;
                    let notice = RelayNotice::DialFailed {
                        sensor: request.sensor,
                        message: failed.error.to_string(),
                    };
                    send_notice(&mut writer, &notice).await?;
                    continue;
                }
            };

            stats.sessions_total.fetch_add(1, Ordering::Relaxed);
            let signal = handle.signal();
            let stop = async {
                let _ = shutdown.recv().await;
                signal.trigger(SessionError::ServerShutdown);
                std::future::pending::<Infallible>().await
            };
            let outcome = tokio::select! {
                outcome = handle.wait() => outcome,
                never = stop => match never {},
            };

            tracing::info!(
                "[{}] Session {} ended: {}",
                addr,
                outcome.session_id,
                outcome.cause
            );
            return Ok(());
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns a receiver that fires when the server shuts down.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

async fn send_notice<W>(writer: &mut W, notice: &RelayNotice) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin,
{
    let line = encode_line(notice)?;
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}
