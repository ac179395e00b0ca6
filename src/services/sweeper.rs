//! Background sweep: evicts stale presence every heartbeat interval until stopped.

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::services::presence::SweepReport;

/// Handle to the running sweep task.
pub(crate) struct Sweeper {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Sweeper {
    /// Run `sweep` once per `period`, first after one full period, until shut down.
    pub(crate) fn spawn<F>(period: Duration, sweep: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, SweepReport> + Send + Sync + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_secs = period.as_secs(), "presence sweeper started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // A panicking iteration must not end expiry for the process.
                        match AssertUnwindSafe(async { sweep().await }).catch_unwind().await {
                            Ok(report) => {
                                debug!(entries = report.entries_removed(), "sweep done");
                            }
                            Err(panic) => {
                                error!(reason = %panic_message(&*panic), "presence sweep failed");
                            }
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            info!("presence sweeper stopped");
        });
        Self { shutdown_tx, task }
    }

    /// Signal the task and wait for it to exit.
    pub(crate) async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            error!(error = %e, "presence sweeper task ended abnormally");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
