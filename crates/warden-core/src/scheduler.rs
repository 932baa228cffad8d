//! Cancelable periodic tasks.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::access::AccessGate;

/// A named task that runs `job` every `period` until stopped.
///
/// The first run happens one full period after spawning.
pub struct RepeatingTask {
    name: &'static str,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RepeatingTask {
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut job: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let tok = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                  _ = tok.cancelled() => break,
                  _ = tick.tick() => {
                    // A run in progress finishes before cancellation is observed.
                    job().await;
                  }
                }
            }
            tracing::debug!(task = name, "repeating task stopped");
        });

        tracing::info!(task = name, period_secs = period.as_secs(), "repeating task started");
        Self {
            name,
            cancel,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Cancel and wait for the task to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            tracing::warn!(task = self.name, "repeating task ended abnormally: {e}");
        }
    }
}

/// The two housekeeping loops that run next to the transport.
pub struct MaintenanceScheduler {
    tasks: Vec<RepeatingTask>,
}

impl MaintenanceScheduler {
    pub fn start(
        gate: Arc<AccessGate>,
        maintenance_every: Duration,
        expiry_every: Duration,
    ) -> Self {
        let g = gate.clone();
        let maintenance = RepeatingTask::spawn("maintenance", maintenance_every, move || {
            let gate = g.clone();
            async move {
                gate.maintenance_sweep().await;
            }
        });

        let expiry = RepeatingTask::spawn("access-expiry", expiry_every, move || {
            let gate = gate.clone();
            async move {
                let expired = gate.expiry_sweep().await;
                if !expired.is_empty() {
                    tracing::info!(count = expired.len(), "expired users swept");
                }
            }
        });

        Self {
            tasks: vec![maintenance, expiry],
        }
    }

    /// Stop both loops; returns once neither can touch the gate again.
    pub async fn shutdown(self) {
        for task in self.tasks {
            task.stop().await;
        }
    }
}
