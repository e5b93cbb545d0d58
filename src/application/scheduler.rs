//! Background flushing of the report builder.
//!
//! The flush task wakes on a fixed interval and whenever ingest reports
//! that the pending key watermark was reached. Stopping it goes through
//! [`FlushHandle::shutdown`], which runs one last flush before the task
//! exits.

use crate::application::aggregator::{Accumulator, FlushSummary, ReportBuilder};
use crate::application::ports::Storage;
use crate::domain::key::ReportKey;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Error returned when the flush task could not be stopped cleanly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShutdownError {
    /// The flush task panicked
    #[error("flush task panicked")]
    TaskPanicked,
    /// The flush task was cancelled before it finished
    #[error("flush task was cancelled")]
    TaskCancelled,
}

/// Handle to a running flush task.
///
/// Dropping the handle does not stop the task; call
/// [`shutdown`](FlushHandle::shutdown) to stop it and flush what is left.
#[derive(Debug)]
pub struct FlushHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    join_handle: JoinHandle<FlushSummary>,
}

impl FlushHandle {
    /// Stop the task after a final flush and return that flush's summary.
    pub async fn shutdown(mut self) -> Result<FlushSummary, ShutdownError> {
        if let Some(tx) = self.shutdown_tx.take() {
            // The task may already be gone; the join below reports why.
            let _ = tx.send(());
        }
        (&mut self.join_handle).await.map_err(|e| {
            if e.is_panic() {
                ShutdownError::TaskPanicked
            } else {
                ShutdownError::TaskCancelled
            }
        })
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }
}

/// Spawn the flush task for `builder`.
///
/// Must be called from within a tokio runtime.
pub fn start_flush_task<S>(builder: ReportBuilder<S>) -> FlushHandle
where
    S: Storage<ReportKey, Accumulator> + Clone + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    let signal = builder.flush_signal();
    let period = builder.config().flush_interval;

    let join_handle = tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        let mut detached = false;
        loop {
            tokio::select! {
                biased;
                result = &mut shutdown_rx, if !detached => {
                    if result.is_ok() {
                        break;
                    }
                    // Handle dropped without shutdown: keep flushing.
                    detached = true;
                    continue;
                }
                _ = signal.notified() => {
                    tracing::debug!("pending key watermark reached, flushing early");
                }
                _ = ticker.tick() => {}
            }
            builder.flush().await;
        }

        let summary = builder.flush().await;
        tracing::debug!(
            value_sets = summary.value_sets,
            batches_dropped = summary.batches_dropped,
            "flush task stopped after final flush"
        );
        summary
    });

    FlushHandle {
        shutdown_tx: Some(shutdown_tx),
        join_handle,
    }
}
