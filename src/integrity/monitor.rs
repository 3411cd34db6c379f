//! Background polling loop and the events it publishes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::result::{DeviceSecurityState, ValidationResult};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateChangeEvent {
    pub previous: DeviceSecurityState,
    pub current: DeviceSecurityState,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SecurityEvent {
    StateChanged(StateChangeEvent),
    /// The lightweight verdict gained violations since the previous tick.
    VerdictDegraded(ValidationResult),
}

/// A running monitor loop. Dropping the handle also ends the loop, at its
/// next wakeup.
pub struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Runs `tick` every `period` until stopped or until `tick` returns
    /// false. The first tick fires immediately.
    pub fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let (shutdown, mut signal) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = signal.changed() => {
                        if changed.is_err() || *signal.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if !tick().await {
                            break;
                        }
                    }
                }
            }
            debug!("Integrity monitor loop exited");
        });
        Self { shutdown, task }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the loop and waits for it. A tick already running completes
    /// first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!("Integrity monitor task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let handle = MonitorHandle::spawn(Duration::from_millis(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });

        tokio::time::sleep(Duration::from_millis(60)).await;
        tokio::time::timeout(Duration::from_secs(1), handle.stop())
            .await
            .unwrap();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_tick_can_end_loop() {
        let handle = MonitorHandle::spawn(Duration::from_millis(5), || async { false });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
        handle.stop().await;
    }
}
