//! Registry of in-flight and recently finished upload tasks.
//!
//! The store is an explicitly constructed object shared as `Arc<TaskStore>`.
//! Every committed mutation is delivered synchronously to subscribers, after
//! the internal lock has been released, so a listener may read from or write
//! to the store it is observing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::StoreConfig;
use crate::model::{
    ItemId, ItemRecord, Task, TaskDescriptor, TaskId, TaskPatch, TaskStatus, UnixTimeMs,
    ValidationError,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Result of [`TaskStore::update_task`]. Updates never fail loudly: late or
/// stale writers are expected and are told what happened instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The patch matched the current state; nothing was committed.
    Unchanged,
    /// The task was already removed.
    Missing,
    Ignored(IgnoreReason),
    /// The patch carried an expected version that no longer matches.
    Conflict { expected: u64, current: u64 },
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// The task already reached `Success` or `Error`.
    Terminal(TaskStatus),
    /// The patch would move the status backwards or skip a step.
    IllegalTransition { from: TaskStatus, to: TaskStatus },
}

#[derive(Clone, Debug, PartialEq)]
pub enum TaskChange {
    Created(Task),
    Updated { before: Task, after: Task },
    Removed(Task),
}

impl TaskChange {
    pub fn task_id(&self) -> &TaskId {
        match self {
            TaskChange::Created(task) | TaskChange::Removed(task) => &task.id,
            TaskChange::Updated { after, .. } => &after.id,
        }
    }

    /// The status the task entered with this change, if it changed.
    pub fn entered_status(&self) -> Option<TaskStatus> {
        match self {
            TaskChange::Created(task) => Some(task.status),
            TaskChange::Updated { before, after } if before.status != after.status => {
                Some(after.status)
            }
            _ => None,
        }
    }
}

/// Delivered to subscribers after every committed mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct StoreEvent {
    pub change: TaskChange,
    /// The active task as of right after the change.
    pub active: Option<Task>,
}

type Listener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;
type ListenerList = Mutex<Vec<(u64, Listener)>>;

/// Keeps a listener registered; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerList>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[derive(Default)]
struct StoreState {
    /// Insertion order.
    tasks: Vec<Task>,
    /// Order in which tasks became terminal.
    finish_order: HashMap<TaskId, u64>,
    next_finish: u64,
}

impl StoreState {
    fn position(&self, id: &TaskId) -> Option<usize> {
        self.tasks.iter().position(|t| &t.id == id)
    }

    /// Oldest non-terminal task, else the most recently finished one.
    fn active(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| !t.is_terminal()).or_else(|| {
            self.tasks
                .iter()
                .filter(|t| t.is_terminal())
                .max_by_key(|t| self.finish_order.get(&t.id).copied().unwrap_or(0))
        })
    }

    /// Index of the task that finished first.
    fn oldest_finished(&self) -> Option<usize> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_terminal())
            .min_by_key(|(_, t)| self.finish_order.get(&t.id).copied().unwrap_or(0))
            .map(|(idx, _)| idx)
    }

    fn remove_at(&mut self, idx: usize) -> Task {
        let task = self.tasks.remove(idx);
        self.finish_order.remove(&task.id);
        task
    }
}

pub struct TaskStore {
    config: StoreConfig,
    state: RwLock<StoreState>,
    listeners: Arc<ListenerList>,
    next_listener: AtomicU64,
}

impl Default for TaskStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("tasks", &self.len())
            .field("max_tasks", &self.config.max_tasks)
            .finish()
    }
}

impl TaskStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            state: RwLock::new(StoreState::default()),
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_listener: AtomicU64::new(0),
        }
    }

    pub fn shared(config: StoreConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    /// Registers a new task in `Queued`. Invalid descriptors are rejected
    /// before anything is inserted.
    ///
    /// At capacity, finished tasks are evicted oldest first to make room.
    /// Pending tasks are never evicted and never block a new one, so the
    /// store may briefly exceed `max_tasks` while all of them are in flight.
    #[instrument(skip(self, descriptor), fields(file_name = %descriptor.file_name))]
    pub fn create_task(&self, descriptor: TaskDescriptor) -> Result<TaskId, StoreError> {
        descriptor.validate()?;

        let (id, events) = {
            let mut state = self.write();
            let mut events = Vec::new();
            while state.tasks.len() >= self.config.max_tasks {
                let Some(idx) = state.oldest_finished() else {
                    warn!(
                        max = self.config.max_tasks,
                        tasks = state.tasks.len(),
                        "store over capacity with nothing finished to evict"
                    );
                    break;
                };
                let evicted = state.remove_at(idx);
                debug!(task_id = %evicted.id, "finished task evicted");
                events.push(StoreEvent {
                    change: TaskChange::Removed(evicted),
                    active: state.active().cloned(),
                });
            }

            let task = Task::new(descriptor, UnixTimeMs::now());
            let id = task.id.clone();
            state.tasks.push(task.clone());
            events.push(StoreEvent {
                change: TaskChange::Created(task),
                active: state.active().cloned(),
            });
            (id, events)
        };

        info!(task_id = %id, "task created");
        for event in &events {
            self.emit(event);
        }
        Ok(id)
    }

    /// Merges `patch` into the task. Terminal tasks, illegal status
    /// transitions, version conflicts and missing tasks leave the store
    /// untouched.
    pub fn update_task(&self, id: &TaskId, patch: TaskPatch) -> UpdateOutcome {
        let event = {
            let mut state = self.write();
            let Some(idx) = state.position(id) else {
                debug!(task_id = %id, "update for removed task dropped");
                return UpdateOutcome::Missing;
            };

            let task = &state.tasks[idx];
            if task.is_terminal() {
                debug!(task_id = %id, status = %task.status, "update for finished task ignored");
                return UpdateOutcome::Ignored(IgnoreReason::Terminal(task.status));
            }
            if let Some(expected) = patch.expected_version {
                if expected != task.version {
                    debug!(task_id = %id, expected, current = task.version, "version conflict");
                    return UpdateOutcome::Conflict {
                        expected,
                        current: task.version,
                    };
                }
            }
            if let Some(next) = patch.status {
                if !task.status.can_transition_to(next) {
                    warn!(task_id = %id, from = %task.status, to = %next, "illegal status transition ignored");
                    return UpdateOutcome::Ignored(IgnoreReason::IllegalTransition {
                        from: task.status,
                        to: next,
                    });
                }
            }

            let before = task.clone();
            let mut after = before.clone();
            apply_patch(&mut after, patch);
            if after == before {
                return UpdateOutcome::Unchanged;
            }

            after.version += 1;
            if after.is_terminal() {
                after.finished_at = Some(UnixTimeMs::now());
                let order = state.next_finish;
                state.next_finish += 1;
                state.finish_order.insert(after.id.clone(), order);
            }
            state.tasks[idx] = after.clone();

            StoreEvent {
                change: TaskChange::Updated { before, after },
                active: state.active().cloned(),
            }
        };

        if let Some(status) = event.change.entered_status() {
            info!(task_id = %id, %status, "task status changed");
        }
        self.emit(&event);
        UpdateOutcome::Applied
    }

    /// Deletes the task. Removing an unknown id is a no-op and emits nothing.
    pub fn remove_task(&self, id: &TaskId) -> Option<Task> {
        let event = {
            let mut state = self.write();
            let idx = state.position(id)?;
            let task = state.remove_at(idx);
            StoreEvent {
                change: TaskChange::Removed(task),
                active: state.active().cloned(),
            }
        };

        debug!(task_id = %id, "task removed");
        self.emit(&event);
        match event.change {
            TaskChange::Removed(task) => Some(task),
            _ => None,
        }
    }

    /// Removes every terminal task, e.g. when the user navigates away.
    pub fn clear_finished(&self) -> Vec<TaskId> {
        let finished: Vec<TaskId> = self
            .read()
            .tasks
            .iter()
            .filter(|t| t.is_terminal())
            .map(|t| t.id.clone())
            .collect();

        finished
            .into_iter()
            .filter(|id| self.remove_task(id).is_some())
            .collect()
    }

    pub fn get_active_task(&self) -> Option<Task> {
        self.read().active().cloned()
    }

    pub fn get_task(&self, id: &TaskId) -> Option<Task> {
        let state = self.read();
        state.position(id).map(|idx| state.tasks[idx].clone())
    }

    /// Snapshot of all tasks in insertion order.
    pub fn tasks(&self) -> Vec<Task> {
        self.read().tasks.clone()
    }

    pub fn len(&self) -> usize {
        self.read().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The snapshot of a created item, if a task in the store produced it.
    pub fn find_created_item(&self, item_id: &ItemId) -> Option<ItemRecord> {
        self.read()
            .tasks
            .iter()
            .filter(|t| t.created_item_id.as_ref() == Some(item_id))
            .find_map(|t| t.created_item_data.clone())
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn emit(&self, event: &StoreEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for listener in listeners {
            listener(event);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply_patch(task: &mut Task, patch: TaskPatch) {
    let status_changes = patch.status.is_some_and(|s| s != task.status);
    if let Some(status) = patch.status {
        task.status = status;
    }

    if let Some(progress) = patch.progress {
        let progress = progress.min(100);
        if status_changes || progress >= task.progress {
            task.progress = progress;
        } else {
            debug!(task_id = %task.id, current = task.progress, stale = progress, "stale progress dropped");
        }
    }

    if let Some(is_retrying) = patch.is_retrying {
        task.is_retrying = is_retrying;
    }
    if let Some(retry_count) = patch.retry_count {
        task.retry_count = retry_count;
    }

    if let Some(record) = patch.created_item {
        if task.status == TaskStatus::Success {
            task.created_item_id = Some(record.id.clone());
            task.created_item_data = Some(record);
        } else {
            warn!(task_id = %task.id, "created item outside success transition ignored");
        }
    }

    if let Some(message) = patch.error_message {
        if task.status == TaskStatus::Error {
            task.error_message = Some(message);
        } else {
            warn!(task_id = %task.id, "error message outside error transition ignored");
        }
    }
}
