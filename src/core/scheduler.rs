//! The task queue and its scheduler.
//!
//! A single control task owns every task record. Callers, transfer workers
//! and the retention sweep all reach it through [`Command`]s on one unbounded
//! channel, so mutations are applied strictly one at a time.
//!
//! Admission is FIFO with at most `concurrency` executions in flight. A
//! cancelled active task turns `Cancelled` at once but keeps its slot until
//! its worker has observed the token and reported back.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::auth::{AuthFailure, AuthObserver};
use super::error::{QueueError, TransferError};
use super::models::{Category, FileRef, TaskFailure, TaskId, TaskOutcome, TaskStatus, TaskView};
use super::transfer_engine::{
    ProgressEvent, ProgressReporter, StrategyKind, TransferJob, TransferRouter,
};
use crate::remote::RemoteObject;

pub type OutcomeReceiver = watch::Receiver<Option<TaskOutcome>>;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Transfers executing at once.
    pub concurrency: usize,
    /// How long terminal tasks stay visible before eviction.
    pub retention: Duration,
    pub sweep_interval: Duration,
    pub event_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            retention: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(1),
            event_capacity: 256,
        }
    }
}

/// Task lifecycle notifications, in the order the scheduler applied them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Queued {
        id: TaskId,
    },
    Started {
        id: TaskId,
        strategy: StrategyKind,
    },
    Progress {
        id: TaskId,
        percent: u8,
        bytes_per_sec: Option<f64>,
        eta_secs: Option<u64>,
    },
    Finalizing {
        id: TaskId,
    },
    Completed {
        id: TaskId,
        remote_object_id: String,
    },
    Failed {
        id: TaskId,
        failure: TaskFailure,
    },
    Cancelled {
        id: TaskId,
    },
    Evicted {
        id: TaskId,
    },
    AuthorizationFailed(AuthFailure),
}

pub(crate) enum Command {
    Submit {
        files: Vec<(FileRef, Category)>,
        reply: oneshot::Sender<Vec<TaskId>>,
    },
    Cancel {
        id: TaskId,
        reply: oneshot::Sender<Result<TaskStatus, QueueError>>,
    },
    CancelAll {
        reply: oneshot::Sender<usize>,
    },
    Remove {
        id: TaskId,
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    ClearTerminal {
        reply: oneshot::Sender<usize>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<TaskView>>,
    },
    Watch {
        ids: Vec<TaskId>,
        reply: oneshot::Sender<Vec<(TaskId, Option<OutcomeReceiver>)>>,
    },
    Progress {
        id: TaskId,
        event: ProgressEvent,
    },
    Finished {
        id: TaskId,
        result: Result<RemoteObject, TransferError>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct TaskEntry {
    id: TaskId,
    file: FileRef,
    category: Category,
    status: TaskStatus,
    strategy: Option<StrategyKind>,
    progress_percent: u8,
    bytes_per_sec: Option<f64>,
    eta_secs: Option<u64>,
    error: Option<TaskFailure>,
    remote_object_id: Option<String>,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    terminal_at: Option<Instant>,
    cancel: CancellationToken,
    outcome: watch::Sender<Option<TaskOutcome>>,
}

impl TaskEntry {
    fn new(file: FileRef, category: Category, cancel: CancellationToken) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            id: TaskId::new(),
            file,
            category,
            status: TaskStatus::Queued,
            strategy: None,
            progress_percent: 0,
            bytes_per_sec: None,
            eta_secs: None,
            error: None,
            remote_object_id: None,
            created_at: Utc::now(),
            finished_at: None,
            terminal_at: None,
            cancel,
            outcome,
        }
    }

    /// The single terminal transition. Resolves the completion channel and
    /// returns the event to publish.
    fn finish(&mut self, outcome: TaskOutcome) -> TaskEvent {
        let id = self.id;
        let (status, event) = match &outcome {
            TaskOutcome::Completed { remote_object_id } => {
                self.progress_percent = 100;
                self.remote_object_id = Some(remote_object_id.clone());
                let event = TaskEvent::Completed {
                    id,
                    remote_object_id: remote_object_id.clone(),
                };
                (TaskStatus::Completed, event)
            }
            TaskOutcome::Failed(failure) => {
                self.error = Some(failure.clone());
                let event = TaskEvent::Failed {
                    id,
                    failure: failure.clone(),
                };
                (TaskStatus::Failed, event)
            }
            TaskOutcome::Cancelled | TaskOutcome::Unknown => {
                (TaskStatus::Cancelled, TaskEvent::Cancelled { id })
            }
        };

        self.status = status;
        self.bytes_per_sec = None;
        self.eta_secs = None;
        self.finished_at = Some(Utc::now());
        self.terminal_at = Some(Instant::now());
        self.outcome.send_replace(Some(outcome));
        event
    }

    fn view(&self) -> TaskView {
        TaskView {
            id: self.id,
            name: self.file.name.clone(),
            byte_size: self.file.byte_size,
            mime_type: self.file.mime_type.clone(),
            category: self.category,
            status: self.status,
            strategy: self.strategy,
            progress_percent: self.progress_percent,
            bytes_per_sec: self.bytes_per_sec,
            eta_secs: self.eta_secs,
            error: self.error.clone(),
            remote_object_id: self.remote_object_id.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

pub(crate) struct Scheduler {
    config: QueueConfig,
    router: Arc<TransferRouter>,
    auth_observer: Option<Arc<dyn AuthObserver>>,
    events: broadcast::Sender<TaskEvent>,
    /// Handed to workers. Weak so the loop ends once every handle is gone.
    commands: mpsc::WeakUnboundedSender<Command>,
    root: CancellationToken,
    arena: Vec<Option<TaskEntry>>,
    index: HashMap<TaskId, usize>,
    queued: VecDeque<TaskId>,
    executing: HashSet<TaskId>,
}

/// Start the control task. Must be called inside a tokio runtime.
pub(crate) fn spawn(
    config: QueueConfig,
    router: Arc<TransferRouter>,
    auth_observer: Option<Arc<dyn AuthObserver>>,
) -> (mpsc::UnboundedSender<Command>, broadcast::Sender<TaskEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(config.event_capacity.max(1));
    let scheduler = Scheduler::new(config, router, auth_observer, tx.downgrade(), events.clone());
    tokio::spawn(scheduler.run(rx));
    (tx, events)
}

impl Scheduler {
    fn new(
        config: QueueConfig,
        router: Arc<TransferRouter>,
        auth_observer: Option<Arc<dyn AuthObserver>>,
        commands: mpsc::WeakUnboundedSender<Command>,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        Self {
            config,
            router,
            auth_observer,
            events,
            commands,
            root: CancellationToken::new(),
            arena: Vec::new(),
            index: HashMap::new(),
            queued: VecDeque::new(),
            executing: HashSet::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(concurrency = self.config.concurrency, "Scheduler started");

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.cancel_all();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = sweep.tick() => self.sweep(),
            }
        }

        self.root.cancel();
        info!("Scheduler stopped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { files, reply } => {
                let ids = self.enqueue(files);
                let _ = reply.send(ids);
            }
            Command::Cancel { id, reply } => {
                let _ = reply.send(self.cancel(id));
            }
            Command::CancelAll { reply } => {
                let _ = reply.send(self.cancel_all());
            }
            Command::Remove { id, reply } => {
                let result = self.cancel(id).map(|_| self.evict(id));
                let _ = reply.send(result);
            }
            Command::ClearTerminal { reply } => {
                let _ = reply.send(self.clear_terminal());
            }
            Command::Snapshot { reply } => {
                let views = self.arena.iter().flatten().map(TaskEntry::view).collect();
                let _ = reply.send(views);
            }
            Command::Watch { ids, reply } => {
                let watchers = ids
                    .into_iter()
                    .map(|id| {
                        let receiver = self.entry(id).map(|entry| entry.outcome.subscribe());
                        (id, receiver)
                    })
                    .collect();
                let _ = reply.send(watchers);
            }
            Command::Progress { id, event } => self.progress(id, event),
            Command::Finished { id, result } => self.finished(id, result),
            Command::Shutdown { reply } => {
                self.cancel_all();
                let _ = reply.send(());
            }
        }
    }

    fn entry(&self, id: TaskId) -> Option<&TaskEntry> {
        let slot = *self.index.get(&id)?;
        self.arena.get(slot)?.as_ref()
    }

    fn entry_mut(&mut self, id: TaskId) -> Option<&mut TaskEntry> {
        let slot = *self.index.get(&id)?;
        self.arena.get_mut(slot)?.as_mut()
    }

    fn publish(&self, event: TaskEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn enqueue(&mut self, files: Vec<(FileRef, Category)>) -> Vec<TaskId> {
        let mut ids = Vec::with_capacity(files.len());

        for (file, category) in files {
            let entry = TaskEntry::new(file, category, self.root.child_token());
            let id = entry.id;
            info!(
                task_id = %id.short(),
                file = %entry.file.name,
                bytes = entry.file.byte_size,
                category = %category,
                "Task queued"
            );

            self.index.insert(id, self.arena.len());
            self.arena.push(Some(entry));
            self.queued.push_back(id);
            self.publish(TaskEvent::Queued { id });
            ids.push(id);
        }

        self.admit();
        ids
    }

    /// Start queued tasks in submission order while slots are free.
    fn admit(&mut self) {
        let limit = self.config.concurrency.max(1);
        while self.executing.len() < limit {
            let Some(id) = self.queued.pop_front() else {
                break;
            };
            if self
                .entry(id)
                .is_some_and(|entry| entry.status == TaskStatus::Queued)
            {
                self.start(id);
            }
        }
    }

    fn start(&mut self, id: TaskId) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let router = Arc::clone(&self.router);
        let Some(entry) = self.entry_mut(id) else {
            return;
        };

        let strategy = router.strategy_for(&entry.file);
        entry.status = TaskStatus::Active;
        entry.strategy = Some(strategy);

        let job = TransferJob {
            task_id: id,
            file: entry.file.clone(),
            category: entry.category,
            strategy,
        };
        let cancel = entry.cancel.clone();
        let span = info_span!(
            "transfer",
            task_id = %id.short(),
            file = %entry.file.name,
            strategy = %strategy
        );

        let progress_tx = commands.clone();
        let reporter = Arc::new(ProgressReporter::new(
            router.config().sample_interval,
            move |event| {
                let _ = progress_tx.send(Command::Progress { id, event });
            },
        ));

        self.executing.insert(id);
        self.publish(TaskEvent::Started { id, strategy });

        tokio::spawn(
            async move {
                info!(bytes = job.file.byte_size, "Transfer started");
                let started = Instant::now();
                let result = router.execute(&job, &reporter, &cancel).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;

                match &result {
                    Ok(object) => info!(object_id = %object.id, elapsed_ms, "Transfer completed"),
                    Err(TransferError::Cancelled) => info!(elapsed_ms, "Transfer cancelled"),
                    Err(e) => warn!(error = %e, code = e.code(), elapsed_ms, "Transfer failed"),
                }

                let _ = commands.send(Command::Finished { id, result });
            }
            .instrument(span),
        );
    }

    fn progress(&mut self, id: TaskId, event: ProgressEvent) {
        let Some(entry) = self.entry_mut(id) else {
            return;
        };
        if !entry.status.is_running() {
            return;
        }

        let published = match event {
            ProgressEvent::Bytes {
                percent,
                bytes_per_sec,
                eta_secs,
            } => {
                // A retried request starts its byte count over; the task's
                // percentage keeps its high-water mark. 100 is reserved for
                // the transition to Completed.
                entry.progress_percent = entry.progress_percent.max(percent.min(99));
                entry.bytes_per_sec = bytes_per_sec;
                entry.eta_secs = eta_secs;
                TaskEvent::Progress {
                    id,
                    percent: entry.progress_percent,
                    bytes_per_sec,
                    eta_secs,
                }
            }
            ProgressEvent::Finalizing => {
                if entry.status != TaskStatus::Active {
                    return;
                }
                entry.status = TaskStatus::FinalizingRemote;
                entry.eta_secs = None;
                debug!(task_id = %id.short(), "Finalizing with remote");
                TaskEvent::Finalizing { id }
            }
        };

        self.publish(published);
    }

    fn finished(&mut self, id: TaskId, result: Result<RemoteObject, TransferError>) {
        self.executing.remove(&id);

        let mut auth_failure = None;
        let event = match self.entry_mut(id) {
            Some(entry) if !entry.status.is_terminal() => {
                let outcome = match result {
                    Ok(object) => TaskOutcome::Completed {
                        remote_object_id: object.id,
                    },
                    Err(TransferError::Cancelled) => TaskOutcome::Cancelled,
                    Err(err) => {
                        if let TransferError::Unauthorized { status } = err {
                            auth_failure = Some(AuthFailure {
                                task_id: id,
                                file_name: entry.file.name.clone(),
                                status,
                            });
                        }
                        TaskOutcome::Failed(err.to_failure())
                    }
                };
                Some(entry.finish(outcome))
            }
            // Cancelled or removed while running; only the slot is released.
            _ => None,
        };

        if let Some(event) = event {
            self.publish(event);
        }
        if let Some(failure) = auth_failure {
            self.authorization_failed(failure);
        }

        self.admit();
    }

    fn authorization_failed(&self, failure: AuthFailure) {
        warn!(
            task_id = %failure.task_id.short(),
            file = %failure.file_name,
            status = failure.status,
            "Remote rejected credentials"
        );
        self.publish(TaskEvent::AuthorizationFailed(failure.clone()));

        if let Some(observer) = &self.auth_observer {
            let observer = Arc::clone(observer);
            tokio::spawn(async move { observer.authorization_failed(failure).await });
        }
    }

    fn cancel(&mut self, id: TaskId) -> Result<TaskStatus, QueueError> {
        let entry = self.entry_mut(id).ok_or(QueueError::NotFound(id))?;
        if entry.status.is_terminal() {
            return Ok(entry.status);
        }

        let was_queued = entry.status == TaskStatus::Queued;
        entry.cancel.cancel();
        let event = entry.finish(TaskOutcome::Cancelled);
        info!(task_id = %id.short(), queued = was_queued, "Task cancelled");

        if was_queued {
            self.queued.retain(|queued| *queued != id);
        }
        self.publish(event);
        self.admit();
        Ok(TaskStatus::Cancelled)
    }

    fn cancel_all(&mut self) -> usize {
        let pending: Vec<TaskId> = self
            .arena
            .iter()
            .flatten()
            .filter(|entry| !entry.status.is_terminal())
            .map(|entry| entry.id)
            .collect();

        // Queued tasks first so none of them gets admitted in between.
        let (queued, active): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|id| self.queued.contains(id));
        let count = queued.len() + active.len();
        for id in queued.into_iter().chain(active) {
            let _ = self.cancel(id);
        }
        count
    }

    fn evict(&mut self, id: TaskId) {
        if let Some(slot) = self.index.remove(&id) {
            self.arena[slot] = None;
            debug!(task_id = %id.short(), "Task evicted");
            self.publish(TaskEvent::Evicted { id });
        }
    }

    fn clear_terminal(&mut self) -> usize {
        let completed: Vec<TaskId> = self
            .arena
            .iter()
            .flatten()
            .filter(|entry| entry.status == TaskStatus::Completed)
            .map(|entry| entry.id)
            .collect();

        for id in &completed {
            self.evict(*id);
        }
        self.compact();
        completed.len()
    }

    /// Evict terminal tasks whose retention window has passed.
    fn sweep(&mut self) {
        let retention = self.config.retention;
        let expired: Vec<TaskId> = self
            .arena
            .iter()
            .flatten()
            .filter(|entry| {
                entry
                    .terminal_at
                    .is_some_and(|at| at.elapsed() >= retention)
            })
            .map(|entry| entry.id)
            .collect();

        if expired.is_empty() {
            return;
        }
        for id in &expired {
            self.evict(*id);
        }
        debug!(evicted = expired.len(), "Retention sweep");
        self.compact();
    }

    /// Drop vacant slots once they dominate the arena.
    fn compact(&mut self) {
        if self.arena.len() < 64 || self.index.len() * 2 >= self.arena.len() {
            return;
        }
        self.arena.retain(Option::is_some);
        self.index = self
            .arena
            .iter()
            .flatten()
            .enumerate()
            .map(|(slot, entry)| (entry.id, slot))
            .collect();
    }
}
