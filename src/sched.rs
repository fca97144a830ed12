//! Poll scheduling
//!
//! Starts one independent periodic task per registered handler with a
//! poll interval. Ticks fire at fixed intervals with no catch-up; a
//! missed tick is simply skipped. Every task cooperatively shuts down on
//! the daemon-wide shutdown signal, and a fatal store error inside a
//! tick is reported so the daemon can exit instead of silently losing
//! samples.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::error::MadError;
use crate::handler::Registry;
#[cfg(test)]
use crate::handler::Handler;
use crate::metrics::DaemonMetrics;

/// Owns the periodic poll tasks for the lifetime of the daemon
pub struct Scheduler {
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start one periodic task per handler with `poll_interval > 0`.
    ///
    /// Each task subscribes to `shutdown` and reports unrecoverable
    /// errors on `fatal`.
    pub fn start(
        registry: &Registry,
        metrics: Arc<DaemonMetrics>,
        shutdown: &broadcast::Sender<()>,
        fatal: mpsc::Sender<MadError>,
    ) -> Self {
        let mut tasks = Vec::new();

        for handler in registry.iter() {
            let Some(interval) = handler.poll_interval() else {
                continue;
            };
            info!(path = handler.path(), interval = ?interval, "Starting poll task");

            let handler = handler.clone();
            let metrics = metrics.clone();
            let fatal = fatal.clone();
            let mut shutdown_rx = shutdown.subscribe();

            tasks.push(tokio::spawn(async move {
                // First tick fires one interval from now, not immediately
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            info!(path = handler.path(), "Poll task stopping");
                            return;
                        }
                        _ = ticker.tick() => {}
                    }

                    let start = Instant::now();
                    match handler.execute().await {
                        Ok(written) => {
                            metrics.record_poll(handler.path(), written, start.elapsed());
                        }
                        Err(e) if e.is_fatal() => {
                            error!(path = handler.path(), error = %e, "Fatal error in poll task");
                            let _ = fatal.send(e).await;
                            return;
                        }
                        Err(e) => {
                            warn!(path = handler.path(), error = %e, "Poll tick failed");
                            metrics.record_poll_error(handler.path());
                        }
                    }
                }
            }));
        }
        Self { tasks }
    }

    /// Number of running poll tasks
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every poll task to observe the shutdown signal
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
