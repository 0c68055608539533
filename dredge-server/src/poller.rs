//! Periodic poll commands to the sensor.

use crate::error::SessionError;
use crate::shutdown::ShutdownSignal;
use dredge_protocol::POLL_COMMAND;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::MissedTickBehavior;

/// Writes the poll command at a fixed interval, starting immediately.
#[derive(Debug)]
pub struct PollScheduler {
    interval: Duration,
    polls_sent: u64,
}

impl PollScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            polls_sent: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Number of poll commands written so far.
    pub fn polls_sent(&self) -> u64 {
        self.polls_sent
    }

    /// Polls until the signal fires or a write fails.
    ///
    /// Returns `Ok(())` when stopped by the signal. A write failure is
    /// returned as [`SessionError::SensorWrite`]; firing the signal is left
    /// to the caller.
    pub async fn run<W>(&mut self, writer: &mut W, signal: &ShutdownSignal) -> Result<(), SessionError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = signal.cancelled() => return Ok(()),
                _ = ticker.tick() => {}
            }

            let write = async {
                writer.write_all(&POLL_COMMAND).await?;
                writer.flush().await
            };
            tokio::select! {
                biased;
                _ = signal.cancelled() => return Ok(()),
                result = write => result.map_err(SessionError::SensorWrite)?,
            }

            self.polls_sent += 1;
            tracing::trace!("Poll command sent ({} total)", self.polls_sent);
        }
    }
}
