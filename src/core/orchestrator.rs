use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{info, warn};

use super::auth::AuthObserver;
use super::error::{QueueError, Rejection};
use super::models::{FileRef, TaskId, TaskOutcome, TaskStatus, TaskView};
use super::scheduler::{self, Command, QueueConfig, TaskEvent};
use super::transfer_engine::TransferRouter;
use super::validator;

/// Result of a submission: accepted ids in submission order, plus the files
/// refused by validation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SubmitReport {
    pub accepted: Vec<TaskId>,
    pub rejected: Vec<Rejection>,
}

/// Cloneable handle to a running scheduler.
///
/// Every method is a message to the scheduler's control task; none of them
/// blocks on a transfer. Once the scheduler has shut down, calls return
/// [`QueueError::Closed`].
#[derive(Clone)]
pub struct Orchestrator {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<TaskEvent>,
}

impl Orchestrator {
    /// Spawn the scheduler on the current tokio runtime.
    pub fn new(
        router: TransferRouter,
        config: QueueConfig,
        auth_observer: Option<Arc<dyn AuthObserver>>,
    ) -> Self {
        let (commands, events) = scheduler::spawn(config, Arc::new(router), auth_observer);
        Self { commands, events }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, QueueError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| QueueError::Closed)?;
        response.await.map_err(|_| QueueError::Closed)
    }

    /// Validate and enqueue. Returns as soon as the accepted files are queued.
    pub async fn submit(&self, files: Vec<FileRef>) -> Result<SubmitReport, QueueError> {
        let (accepted, rejected) = validator::validate_batch(files);
        for rejection in &rejected {
            warn!(
                file = %rejection.file_name,
                code = rejection.code.as_str(),
                "{}",
                rejection.message
            );
        }

        let accepted = if accepted.is_empty() {
            Vec::new()
        } else {
            self.request(|reply| Command::Submit {
                files: accepted,
                reply,
            })
            .await?
        };

        Ok(SubmitReport { accepted, rejected })
    }

    /// Wait until every listed task is terminal. Ids that were never issued,
    /// or whose tasks have already been evicted, resolve to
    /// [`TaskOutcome::Unknown`].
    pub async fn await_all(&self, ids: &[TaskId]) -> Result<Vec<(TaskId, TaskOutcome)>, QueueError> {
        let watchers = self
            .request(|reply| Command::Watch {
                ids: ids.to_vec(),
                reply,
            })
            .await?;

        let mut outcomes = Vec::with_capacity(watchers.len());
        for (id, watcher) in watchers {
            let outcome = match watcher {
                None => TaskOutcome::Unknown,
                Some(mut rx) => {
                    let resolved = rx
                        .wait_for(Option::is_some)
                        .await
                        .ok()
                        .and_then(|outcome| (*outcome).clone());
                    // The sender is dropped on eviction; its last value stays readable.
                    resolved
                        .or_else(|| (*rx.borrow()).clone())
                        .unwrap_or(TaskOutcome::Unknown)
                }
            };
            outcomes.push((id, outcome));
        }
        Ok(outcomes)
    }

    /// Cancel one task. Terminal tasks are left alone and their status is
    /// returned.
    pub async fn cancel(&self, id: TaskId) -> Result<TaskStatus, QueueError> {
        self.request(|reply| Command::Cancel { id, reply }).await?
    }

    /// Cancel every task that has not finished. Returns how many were.
    pub async fn cancel_all(&self) -> Result<usize, QueueError> {
        let cancelled = self.request(|reply| Command::CancelAll { reply }).await?;
        if cancelled > 0 {
            info!(cancelled, "Cancelled all pending transfers");
        }
        Ok(cancelled)
    }

    /// Evict completed tasks. Failed and cancelled ones stay until retention
    /// expires or they are removed.
    pub async fn clear_terminal(&self) -> Result<usize, QueueError> {
        self.request(|reply| Command::ClearTerminal { reply }).await
    }

    /// Cancel if needed, then evict immediately.
    pub async fn remove(&self, id: TaskId) -> Result<(), QueueError> {
        self.request(|reply| Command::Remove { id, reply }).await?
    }

    pub async fn snapshot(&self) -> Result<Vec<TaskView>, QueueError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Cancel everything and stop the scheduler.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
