//! Single-shot cancellation shared by the tasks of one session.

use crate::error::SessionError;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

/// Fires once with the cause that ended a session.
///
/// The first [`trigger`](Self::trigger) wins; later calls are ignored, so
/// concurrent failures in different tasks produce exactly one teardown.
pub struct ShutdownSignal {
    fired: AtomicBool,
    cause: parking_lot::Mutex<Option<SessionError>>,
    tx: watch::Sender<bool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            fired: AtomicBool::new(false),
            cause: parking_lot::Mutex::new(None),
            tx,
        }
    }

    /// Fires the signal. Returns `true` only for the call that fired it.
    pub fn trigger(&self, cause: SessionError) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Shutdown already triggered, ignoring: {}", cause);
            return false;
        }
        *self.cause.lock() = Some(cause);
        self.tx.send_replace(true);
        true
    }

    /// Returns whether the signal has fired.
    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Completes once the signal has fired.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|fired| *fired).await;
    }

    /// Takes the recorded cause. Returns `None` before the signal fires.
    pub fn take_cause(&self) -> Option<SessionError> {
        self.cause.lock().take()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_first_trigger_wins() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.take_cause().is_none());

        assert!(signal.trigger(SessionError::SensorClosed));
        assert!(!signal.trigger(SessionError::RelayClosed));
        assert!(signal.is_triggered());

        assert!(matches!(
            signal.take_cause(),
            Some(SessionError::SensorClosed)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_after_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger(SessionError::ClosedByCaller);
        tokio::time::timeout(Duration::from_millis(100), signal.cancelled())
            .await
            .expect("already-fired signal should complete immediately");
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let signal = Arc::new(ShutdownSignal::new());

        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let signal = signal.clone();
                tokio::spawn(async move { signal.cancelled().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger(SessionError::ServerShutdown);

        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_concurrent_triggers_fire_once() {
        let signal = Arc::new(ShutdownSignal::new());

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let signal = signal.clone();
                tokio::spawn(async move {
                    let cause = if i % 2 == 0 {
                        SessionError::SensorRead(std::io::Error::from(
                            std::io::ErrorKind::ConnectionReset,
                        ))
                    } else {
                        SessionError::RelayWrite(std::io::Error::from(
                            std::io::ErrorKind::BrokenPipe,
                        ))
                    };
                    signal.trigger(cause)
                })
            })
            .collect();

        let mut fired = 0;
        for task in tasks {
            if task.await.unwrap() {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
        assert!(signal.take_cause().is_some());
        assert!(signal.take_cause().is_none());
    }
}
