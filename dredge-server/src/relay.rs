//! Relay of decoded samples to the downstream client.

use crate::error::SessionError;
use crate::metrics::Metrics;
use dredge_protocol::{encode_line, DecodedSample, ProtocolError, RelayNotice};
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Writes samples and notices to the relay stream as JSON lines.
///
/// There is no internal queue: a write that does not complete within the
/// publish timeout ends the session with [`SessionError::RelayBackpressure`].
/// After any failed write the stream may hold a partial line, so every
/// later write is refused.
pub struct RelayPublisher<W> {
    writer: W,
    timeout: Duration,
    published: u64,
    broken: bool,
    metrics: Option<Arc<Metrics>>,
}

impl<W> RelayPublisher<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W, timeout: Duration) -> Self {
        Self {
            writer,
            timeout,
            published: 0,
            broken: false,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Option<Arc<Metrics>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Writes one sample.
    pub async fn publish(&mut self, sample: &DecodedSample) -> Result<(), SessionError> {
        let line = encode_line(sample).map_err(encode_error)?;
        let start = Instant::now();
        self.write_line(&line).await?;

        self.published += 1;
        if let Some(ref metrics) = self.metrics {
            metrics.samples_published_total.inc();
            metrics
                .publish_duration
                .observe(start.elapsed().as_secs_f64());
        }
        Ok(())
    }

    /// Writes one lifecycle notice.
    pub async fn notify(&mut self, notice: &RelayNotice) -> Result<(), SessionError> {
        let line = encode_line(notice).map_err(encode_error)?;
        self.write_line(&line).await
    }

    async fn write_line(&mut self, line: &[u8]) -> Result<(), SessionError> {
        if self.broken {
            return Err(SessionError::RelayWrite(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "relay stream left mid-line by an earlier failed write",
            )));
        }

        let timeout = self.timeout;
        let writer = &mut self.writer;
        let write = async {
            writer.write_all(line).await?;
            writer.flush().await
        };
        let result = match tokio::time::timeout(timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::RelayWrite(e)),
            Err(_) => Err(SessionError::RelayBackpressure { timeout }),
        };
        self.broken = result.is_err();
        result
    }

    /// Returns whether every line written so far was written whole.
    pub fn is_intact(&self) -> bool {
        !self.broken
    }

    /// Shuts down the write side of the relay stream.
    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }

    /// Number of samples written so far.
    pub fn published(&self) -> u64 {
        self.published
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

fn encode_error(e: ProtocolError) -> SessionError {
    SessionError::RelayWrite(io::Error::new(io::ErrorKind::InvalidData, e))
}
