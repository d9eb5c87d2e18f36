use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum TimerIdRefresh {
    Perm,
    Binding,
}

#[async_trait]
pub(crate) trait PeriodicTimerTimeoutHandler {
    async fn on_timeout(&self, id: TimerIdRefresh);
}

/// PeriodicTimer is a periodic timer. The timer task holds only a weak
/// handle to its handler, so an abandoned handler stops the timer.
pub(crate) struct PeriodicTimer {
    id: TimerIdRefresh,
    interval: Duration,
    close_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl PeriodicTimer {
    pub(crate) fn new(id: TimerIdRefresh, interval: Duration) -> Self {
        PeriodicTimer {
            id,
            interval,
            close_tx: Mutex::new(None),
        }
    }

    /// Starts the timer task. Returns false when it is already running.
    pub(crate) async fn start<T>(&self, handler: Weak<T>) -> bool
    where
        T: PeriodicTimerTimeoutHandler + Send + Sync + 'static,
    {
        let mut close_tx = self.close_tx.lock().await;
        if close_tx.is_some() {
            return false;
        }

        let (tx, mut rx) = mpsc::channel::<()>(1);
        let interval = self.interval;
        let id = self.id;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(interval) => {
                        let Some(handler) = handler.upgrade() else {
                            break;
                        };
                        handler.on_timeout(id).await;
                    }
                    _ = rx.recv() => break,
                }
            }
        });
        *close_tx = Some(tx);

        true
    }

    /// Stops the timer task; the next tick never fires. Idempotent.
    pub(crate) async fn stop(&self) {
        self.close_tx.lock().await.take();
    }

    pub(crate) async fn is_running(&self) -> bool {
        self.close_tx.lock().await.is_some()
    }
}
