//! Sensor sessions.
//!
//! A session pairs one sensor connection with one relay client and runs
//! three tasks until the first terminal failure:
//!
//! - the poller writes poll commands to the sensor,
//! - the reader assembles, decodes and publishes frames,
//! - the watcher detects the relay client going away.
//!
//! All three share a [`ShutdownSignal`]. Once every task has returned, the
//! coordinator tears both connections down exactly once.

use crate::config::Config;
use crate::error::SessionError;
use crate::metrics::Metrics;
use crate::poller::PollScheduler;
use crate::relay::RelayPublisher;
use crate::shutdown::ShutdownSignal;
use dredge_protocol::{
    AiLengthUnit, ChannelMap, FloatByteOrder, FrameAssembler, FrameDecoder, RelayNotice,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Dialing the sensor or announcing the session to the relay client.
    Connecting,
    /// Polling and relaying.
    Active,
    /// A terminal failure occurred; tearing down.
    Closing,
    /// Both connections are closed.
    Closed,
}

/// Settings shared by every session of a server.
#[derive(Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub poll_interval: Duration,
    pub read_buffer_size: usize,
    pub max_buffer_size: usize,
    pub ai_length_unit: AiLengthUnit,
    pub float_byte_order: FloatByteOrder,
    pub publish_timeout: Duration,
    pub notice_timeout: Duration,
    pub teardown_timeout: Duration,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("read_buffer_size", &self.read_buffer_size)
            .field("max_buffer_size", &self.max_buffer_size)
            .field("ai_length_unit", &self.ai_length_unit)
            .field("float_byte_order", &self.float_byte_order)
            .field("publish_timeout", &self.publish_timeout)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SessionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: config.sensor.connect_timeout(),
            poll_interval: config.sensor.poll_interval(),
            read_buffer_size: config.sensor.read_buffer_size.max(1),
            max_buffer_size: config.sensor.max_buffer_size,
            ai_length_unit: config.sensor.ai_length_unit,
            float_byte_order: config.sensor.float_byte_order,
            publish_timeout: config.relay.publish_timeout(),
            notice_timeout: config.relay.notice_timeout(),
            teardown_timeout: config.relay.teardown_timeout(),
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Everything a session needs besides its connections.
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Vessel profile name, reported to the client.
    pub vessel: String,
    pub channels: ChannelMap,
    pub config: SessionConfig,
}

/// Per-session counters, returned when the session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub polls_sent: u64,
    pub bytes_read: u64,
    pub frames_decoded: u64,
    pub frames_rejected: u64,
    pub samples_published: u64,
}

/// Result of a finished session.
#[derive(Debug)]
pub struct SessionOutcome {
    pub session_id: String,
    /// The failure that ended the session.
    pub cause: SessionError,
    pub stats: SessionStats,
}

/// A failed [`open_session`], handing the relay halves back to the caller.
pub struct OpenError<RR, RW> {
    pub error: SessionError,
    pub relay_reader: RR,
    pub relay_writer: RW,
}

impl<RR, RW> std::fmt::Debug for OpenError<RR, RW> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Dials the sensor within the configured timeout.
pub async fn dial_sensor(addr: &str, timeout: Duration) -> Result<TcpStream, SessionError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(source)) => Err(SessionError::Dial {
            addr: addr.to_string(),
            source,
        }),
        Err(_) => Err(SessionError::DialTimeout {
            addr: addr.to_string(),
            timeout,
        }),
    }
}

/// Connects to the sensor and starts a session relaying to the given client.
///
/// On dial failure the relay halves are returned unused so the caller can
/// report the failure and let the client retry.
pub async fn open_session<RR, RW>(
    sensor_addr: &str,
    relay_reader: RR,
    relay_writer: RW,
    ctx: SessionContext,
) -> Result<SessionHandle, OpenError<RR, RW>>
where
    RR: AsyncRead + Send + Unpin + 'static,
    RW: AsyncWrite + Send + Unpin + 'static,
{
    tracing::debug!("Dialing sensor {}", sensor_addr);
    let stream = match dial_sensor(sensor_addr, ctx.config.connect_timeout).await {
        Ok(stream) => stream,
        Err(error) => {
            if let Some(ref metrics) = ctx.config.metrics {
                metrics.dial_failures_total.inc();
            }
            return Err(OpenError {
                error,
                relay_reader,
                relay_writer,
            });
        }
    };

    let (sensor_reader, sensor_writer) = stream.into_split();
    Ok(ConnectionSession::new(
        sensor_addr,
        (sensor_reader, sensor_writer),
        (relay_reader, relay_writer),
        ctx,
    )
    .start())
}

/// One sensor connection relayed to one client.
pub struct ConnectionSession<SR, SW, RR, RW> {
    id: String,
    sensor_addr: String,
    sensor_reader: SR,
    sensor_writer: SW,
    relay_reader: RR,
    relay_writer: RW,
    ctx: SessionContext,
    signal: Arc<ShutdownSignal>,
    state: watch::Sender<SessionState>,
}

impl<SR, SW, RR, RW> ConnectionSession<SR, SW, RR, RW>
where
    SR: AsyncRead + Send + Unpin + 'static,
    SW: AsyncWrite + Send + Unpin + 'static,
    RR: AsyncRead + Send + Unpin + 'static,
    RW: AsyncWrite + Send + Unpin + 'static,
{
    /// Creates a session over already-connected streams.
    pub fn new(
        sensor_addr: impl Into<String>,
        sensor: (SR, SW),
        relay: (RR, RW),
        ctx: SessionContext,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            id: Uuid::new_v4().to_string(),
            sensor_addr: sensor_addr.into(),
            sensor_reader: sensor.0,
            sensor_writer: sensor.1,
            relay_reader: relay.0,
            relay_writer: relay.1,
            ctx,
            signal: Arc::new(ShutdownSignal::new()),
            state,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Spawns the session and returns a handle to it.
    pub fn start(self) -> SessionHandle {
        let id = self.id.clone();
        let sensor_addr = self.sensor_addr.clone();
        let signal = self.signal.clone();
        let state = self.state.subscribe();
        let task = tokio::spawn(self.run());
        SessionHandle {
            id,
            sensor_addr,
            signal,
            state,
            task,
        }
    }

    async fn run(self) -> SessionOutcome {
        let Self {
            id,
            sensor_addr,
            sensor_reader,
            sensor_writer,
            relay_reader,
            relay_writer,
            ctx,
            signal,
            state,
        } = self;
        let config = ctx.config.clone();
        let metrics = config.metrics.clone();

        let mut publisher = RelayPublisher::new(relay_writer, config.publish_timeout)
            .with_metrics(metrics.clone());

        if let Some(ref m) = metrics {
            m.sessions_total.inc();
            m.sessions_active.inc();
        }

        let started = RelayNotice::SessionStarted {
            session_id: id.clone(),
            sensor: sensor_addr.clone(),
            vessel: ctx.vessel.clone(),
        };
        match publisher.notify(&started).await {
            Ok(()) => {
                state.send_replace(SessionState::Active);
                tracing::info!(
                    "[{}] Session active: sensor={} vessel={} channels={}",
                    id,
                    sensor_addr,
                    ctx.vessel,
                    ctx.channels.len()
                );
            }
            Err(e) => {
                tracing::warn!("[{}] Relay client did not accept the session: {}", id, e);
                signal.trigger(e);
            }
        }

        let poller_task = tokio::spawn(poll_task(
            id.clone(),
            sensor_writer,
            config.poll_interval,
            signal.clone(),
        ));
        let reader_task = tokio::spawn(read_task(
            id.clone(),
            sensor_reader,
            publisher,
            ctx,
            signal.clone(),
        ));
        let watcher_task = tokio::spawn(watch_task(id.clone(), relay_reader, signal.clone()));

        let (poller, reader, watcher) = tokio::join!(poller_task, reader_task, watcher_task);

        let mut stats = SessionStats::default();
        let mut sensor_writer = None;
        let mut publisher = None;
        match poller {
            Ok((writer, polls)) => {
                stats.polls_sent = polls;
                sensor_writer = Some(writer);
            }
            Err(e) => {
                signal.trigger(SessionError::TaskFailed(e.to_string()));
            }
        }
        match reader {
            Ok((relay, read_stats)) => {
                stats.bytes_read = read_stats.bytes_read;
                stats.frames_decoded = read_stats.frames_decoded;
                stats.frames_rejected = read_stats.frames_rejected;
                stats.samples_published = read_stats.samples_published;
                publisher = Some(relay);
            }
            Err(e) => {
                signal.trigger(SessionError::TaskFailed(e.to_string()));
            }
        }
        if let Err(e) = watcher {
            signal.trigger(SessionError::TaskFailed(e.to_string()));
        }

        state.send_replace(SessionState::Closing);
        let cause = signal
            .take_cause()
            .unwrap_or_else(|| SessionError::TaskFailed("session ended without a cause".to_string()));
        tracing::info!("[{}] Session closing: {}", id, cause);

        if let Some(mut publisher) = publisher {
            if !cause.is_relay_side() && publisher.is_intact() {
                let notice = RelayNotice::ConnectionLost {
                    session_id: id.clone(),
                    sensor: sensor_addr.clone(),
                    cause: cause.to_string(),
                };
                match tokio::time::timeout(config.notice_timeout, publisher.notify(&notice)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::debug!("[{}] Failed to notify relay client: {}", id, e),
                    Err(_) => tracing::debug!("[{}] Timed out notifying relay client", id),
                }
            }
            if tokio::time::timeout(config.teardown_timeout, publisher.shutdown())
                .await
                .is_err()
            {
                tracing::debug!("[{}] Timed out closing relay stream", id);
            }
        }
        if let Some(mut writer) = sensor_writer {
            if tokio::time::timeout(config.teardown_timeout, writer.shutdown())
                .await
                .is_err()
            {
                tracing::debug!("[{}] Timed out closing sensor stream", id);
            }
        }

        state.send_replace(SessionState::Closed);
        if let Some(ref m) = metrics {
            m.sessions_active.dec();
            m.session_terminations_total
                .with_label_values(&[cause.cause_label()])
                .inc();
        }
        tracing::info!(
            "[{}] Session closed: cause={} polls={} frames={} rejected={} published={}",
            id,
            cause.cause_label(),
            stats.polls_sent,
            stats.frames_decoded,
            stats.frames_rejected,
            stats.samples_published
        );

        SessionOutcome {
            session_id: id,
            cause,
            stats,
        }
    }
}

/// Handle to a running session.
pub struct SessionHandle {
    id: String,
    sensor_addr: String,
    signal: Arc<ShutdownSignal>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<SessionOutcome>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sensor_addr(&self) -> &str {
        &self.sensor_addr
    }

    /// Returns the current session state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Returns a receiver that observes state changes.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Returns the session's shutdown signal.
    pub fn signal(&self) -> Arc<ShutdownSignal> {
        self.signal.clone()
    }

    /// Requests the session to stop. Returns `false` if it was already stopping.
    pub fn close(&self) -> bool {
        self.signal.trigger(SessionError::ClosedByCaller)
    }

    /// Waits for the session to finish.
    pub async fn wait(self) -> SessionOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => SessionOutcome {
                session_id: self.id,
                cause: SessionError::TaskFailed(e.to_string()),
                stats: SessionStats::default(),
            },
        }
    }
}

async fn poll_task<W>(
    id: String,
    mut writer: W,
    interval: Duration,
    signal: Arc<ShutdownSignal>,
) -> (W, u64)
where
    W: AsyncWrite + Unpin,
{
    let mut poller = PollScheduler::new(interval);
    if let Err(e) = poller.run(&mut writer, &signal).await {
        tracing::warn!("[{}] Poller stopped: {}", id, e);
        signal.trigger(e);
    }
    (writer, poller.polls_sent())
}

#[derive(Debug, Default)]
struct ReadStats {
    bytes_read: u64,
    frames_decoded: u64,
    frames_rejected: u64,
    samples_published: u64,
}

async fn read_task<R, W>(
    id: String,
    mut reader: R,
    mut publisher: RelayPublisher<W>,
    ctx: SessionContext,
    signal: Arc<ShutdownSignal>,
) -> (RelayPublisher<W>, ReadStats)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stats = ReadStats::default();
    if let Err(e) = read_loop(&id, &mut reader, &mut publisher, &ctx, &signal, &mut stats).await {
        tracing::warn!("[{}] Reader stopped: {}", id, e);
        signal.trigger(e);
    }
    (publisher, stats)
}

/// Reads, assembles, decodes and publishes until the signal fires or a
/// terminal error occurs.
async fn read_loop<R, W>(
    id: &str,
    reader: &mut R,
    publisher: &mut RelayPublisher<W>,
    ctx: &SessionContext,
    signal: &ShutdownSignal,
    stats: &mut ReadStats,
) -> Result<(), SessionError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let config = &ctx.config;
    let mut assembler = FrameAssembler::new()
        .with_ai_length_unit(config.ai_length_unit)
        .with_max_buffer_size(config.max_buffer_size);
    let decoder = FrameDecoder::new(ctx.channels.clone())
        .with_ai_length_unit(config.ai_length_unit)
        .with_byte_order(config.float_byte_order);
    let mut buf = vec![0u8; config.read_buffer_size];

    loop {
        let n = tokio::select! {
            biased;
            _ = signal.cancelled() => return Ok(()),
            result = reader.read(&mut buf) => result.map_err(SessionError::SensorRead)?,
        };
        if n == 0 {
            return Err(SessionError::SensorClosed);
        }
        stats.bytes_read += n as u64;
        tracing::debug!("[{}] Received {} bytes", id, n);
        assembler.extend(&buf[..n]);

        while let Some(frame) = assembler.next_frame().map_err(SessionError::FrameTooLong)? {
            let sample = match decoder.decode(&frame) {
                Ok(sample) => sample,
                Err(e) => {
                    stats.frames_rejected += 1;
                    if let Some(ref m) = config.metrics {
                        m.frames_rejected_total.with_label_values(&[e.reason()]).inc();
                    }
                    tracing::warn!("[{}] Dropping frame of {} bytes: {}", id, frame.len(), e);
                    continue;
                }
            };

            stats.frames_decoded += 1;
            if let Some(ref m) = config.metrics {
                m.frames_decoded_total.inc();
            }

            // Never cancelled mid-line; bounded by the publish timeout.
            publisher.publish(&sample).await?;
            stats.samples_published += 1;
        }
    }
}

async fn watch_task<R>(id: String, mut reader: R, signal: Arc<ShutdownSignal>) -> R
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            biased;
            _ = signal.cancelled() => break,
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    tracing::debug!("[{}] Relay client disconnected", id);
                    signal.trigger(SessionError::RelayClosed);
                    break;
                }
                Ok(n) => {
                    tracing::debug!("[{}] Ignoring {} bytes from relay client", id, n);
                }
                Err(e) => {
                    signal.trigger(SessionError::RelayRead(e));
                    break;
                }
            },
        }
    }
    reader
}
