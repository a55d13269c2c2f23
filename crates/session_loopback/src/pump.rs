use std::{sync::Arc, time::Duration};

use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, trace};

use crate::backend::LoopbackSessionBackend;

/// Background task that pumps queued completions on a fixed tick, the way an online
/// service's callback loop would run them.
///
/// Must be spawned from inside a tokio runtime. Dropping the pump aborts the task.
pub struct CallbackPump {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl CallbackPump {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(16);

    pub fn spawn(backends: Vec<Arc<LoopbackSessionBackend>>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let delivered: usize = backends.iter().map(|backend| backend.pump()).sum();
                        if delivered > 0 {
                            trace!(delivered, "pumped loopback completions");
                        }
                    }
                }
            }
            debug!("callback pump stopped");
        });

        Self {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    /// Stops the task and waits for it to finish its current tick.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for CallbackPump {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
