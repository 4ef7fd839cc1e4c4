//! Fixed-interval driver for outstanding remote operations.
//!
//! The poller submits every item once, then sweeps the outstanding set on a
//! fixed cadence until it drains. Failures are terminal per item and never
//! abort the rest of the set.

use std::time::Duration;

use futures::future::BoxFuture;
use snapmgr_common::{ManagementApi, Result, SessionRef, TaskRef, TaskState};
use tracing::{debug, warn};

/// Cadence of status sweeps over the outstanding set.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Submission thunk paired with caller context. Invoked exactly once; a
/// submission failure is terminal for the item.
pub struct PollItem<'a, C> {
    pub context: C,
    pub session: SessionRef,
    pub submit: BoxFuture<'a, Result<TaskRef>>,
}

#[derive(Debug, Clone)]
pub enum PollerEvent<C> {
    /// The item's remote task reported success.
    Completed { context: C },

    /// Submission failed, the task reported failure, or polling the handle
    /// itself failed. Terminal either way.
    Failed { context: C, message: String },

    /// One aggregate sample per sweep, emitted after that sweep's per-item
    /// events. `running_progress` is the summed fractional progress of the
    /// still-outstanding tasks.
    Progress {
        completed: usize,
        total: usize,
        running_progress: u64,
        percent: f64,
    },

    /// The outstanding set is empty. Always the final event.
    Drained,
}

/// What happened to every item, in terminal-observation order.
#[derive(Debug)]
pub struct PollReport<C> {
    pub completed: Vec<C>,
    pub failed: Vec<(C, String)>,
}

pub struct TaskPoller<'a> {
    api: &'a dyn ManagementApi,
    interval: Duration,
}

impl<'a> TaskPoller<'a> {
    pub fn new(api: &'a dyn ManagementApi) -> Self {
        Self {
            api,
            interval: POLL_INTERVAL,
        }
    }

    /// Tests shrink the interval; production callers keep [`POLL_INTERVAL`].
    pub fn with_interval(api: &'a dyn ManagementApi, interval: Duration) -> Self {
        Self { api, interval }
    }

    /// Drives every item to a terminal state and reports the outcome.
    /// Emits exactly one `Completed` or `Failed` per item and exactly one
    /// final `Drained`.
    pub async fn drive<C, F>(&self, items: Vec<PollItem<'_, C>>, mut emit: F) -> PollReport<C>
    where
        C: Clone,
        F: FnMut(PollerEvent<C>),
    {
        let total = items.len();
        let mut report = PollReport {
            completed: Vec::new(),
            failed: Vec::new(),
        };

        let mut outstanding: Vec<(C, SessionRef, TaskRef)> = Vec::new();
        for item in items {
            match item.submit.await {
                Ok(task) => outstanding.push((item.context, item.session, task)),
                Err(e) => {
                    let message = e.to_string();
                    emit(PollerEvent::Failed {
                        context: item.context.clone(),
                        message: message.clone(),
                    });
                    report.failed.push((item.context, message));
                }
            }
        }

        let mut ticker = tokio::time::interval(self.interval);
        while !outstanding.is_empty() {
            ticker.tick().await;

            let mut running_progress: u64 = 0;
            let mut still_outstanding = Vec::with_capacity(outstanding.len());

            for (context, session, task) in outstanding {
                match self.api.poll_task(&session, &task).await {
                    Ok(status) => match status.state {
                        TaskState::Succeeded => {
                            emit(PollerEvent::Completed {
                                context: context.clone(),
                            });
                            report.completed.push(context);
                        }
                        TaskState::Failed => {
                            let message = status
                                .error
                                .unwrap_or_else(|| "task failed without a message".to_string());
                            emit(PollerEvent::Failed {
                                context: context.clone(),
                                message: message.clone(),
                            });
                            report.failed.push((context, message));
                        }
                        TaskState::Running => {
                            running_progress += u64::from(status.progress.unwrap_or(0));
                            still_outstanding.push((context, session, task));
                        }
                    },
                    Err(e) => {
                        // A monitoring failure is terminal for this item
                        // only, never for the sweep.
                        warn!(task = %task, error = %e, "failed to poll task");
                        let message = format!("monitoring failed: {e}");
                        emit(PollerEvent::Failed {
                            context: context.clone(),
                            message: message.clone(),
                        });
                        report.failed.push((context, message));
                    }
                }
            }

            outstanding = still_outstanding;

            let percent = (report.completed.len() as f64 * 100.0 + running_progress as f64)
                / total as f64;
            emit(PollerEvent::Progress {
                completed: report.completed.len(),
                total,
                running_progress,
                percent,
            });
        }

        debug!(
            completed = report.completed.len(),
            failed = report.failed.len(),
            total,
            "poller drained"
        );
        emit(PollerEvent::Drained);
        report
    }
}
