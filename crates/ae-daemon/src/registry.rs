use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use ae_core::types::{Task, TaskEvent, TaskId, TaskStateError, TaskStatus, UserId};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RegistryError {
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error(transparent)]
    State(#[from] TaskStateError),
    #[error("task {id} is {status}, only finished tasks can be evicted")]
    NotTerminal { id: TaskId, status: TaskStatus },
}

/// Progress reported by the active stage of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub fraction: f64,
    pub note: Option<String>,
}

impl ProgressUpdate {
    pub fn new(fraction: f64) -> Self {
        Self {
            fraction,
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// Lifetime counters; they survive eviction of the tasks they count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegistryTotals {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub completed_last_24h: u64,
}

/// Number of tasks currently held, by status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub running: usize,
    pub paused: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

// ---------------------------------------------------------------------------
// TaskRegistry
// ---------------------------------------------------------------------------

struct Entry {
    task: Task,
    events: watch::Sender<TaskEvent>,
}

impl Entry {
    fn publish(&self) {
        self.events.send_replace(TaskEvent::from_task(&self.task));
    }
}

#[derive(Default)]
struct Inner {
    tasks: HashMap<TaskId, Entry>,
    /// Insertion order, oldest first.
    order: VecDeque<TaskId>,
    totals: RegistryTotals,
    completions: VecDeque<DateTime<Utc>>,
}

impl Inner {
    fn record_terminal(&mut self, status: TaskStatus, at: DateTime<Utc>) {
        self.totals.processed += 1;
        match status {
            TaskStatus::Succeeded => self.totals.succeeded += 1,
            TaskStatus::Failed => self.totals.failed += 1,
            TaskStatus::Cancelled => self.totals.cancelled += 1,
            _ => {}
        }
        self.completions.push_back(at);
        self.prune_completions(Utc::now());
    }

    fn prune_completions(&mut self, now: DateTime<Utc>) {
        let horizon = now - ChronoDuration::hours(24);
        while self.completions.front().is_some_and(|at| *at < horizon) {
            self.completions.pop_front();
        }
    }

    /// Drop the oldest finished tasks until at most `max` remain.
    fn evict_overflow(&mut self, max: usize) {
        let mut excess = self.tasks.len().saturating_sub(max);
        if excess == 0 {
            return;
        }
        let tasks = &mut self.tasks;
        self.order.retain(|id| {
            if excess == 0 {
                return true;
            }
            match tasks.get(id) {
                Some(entry) if entry.task.is_terminal() => {
                    tasks.remove(id);
                    excess -= 1;
                    debug!(task_id = %id, "evicted finished task from history");
                    false
                }
                Some(_) => true,
                None => false,
            }
        });
    }
}

/// The single table of task records.
///
/// One lock guards the table; readers always get cloned snapshots. Each
/// task has a `watch` channel carrying its latest [`TaskEvent`].
pub struct TaskRegistry {
    inner: Mutex<Inner>,
    max_history: usize,
}

impl TaskRegistry {
    pub fn new(max_history: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_history: max_history.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!("task registry lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Add a new task. A task already present under the same id is replaced.
    pub fn put(&self, task: Task) {
        let id = task.id;
        let (events, _) = watch::channel(TaskEvent::from_task(&task));
        let mut inner = self.lock();
        if inner.tasks.insert(id, Entry { task, events }).is_none() {
            inner.order.push_back(id);
        }
        inner.evict_overflow(self.max_history);
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.lock().tasks.get(&id).map(|entry| entry.task.clone())
    }

    /// Tasks owned by `user`, newest first.
    pub fn list_by_user(&self, user: &UserId) -> Vec<Task> {
        let inner = self.lock();
        inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.tasks.get(id))
            .filter(|entry| &entry.task.owner == user)
            .map(|entry| entry.task.clone())
            .collect()
    }

    pub fn update_progress(&self, id: TaskId, update: ProgressUpdate) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let entry = inner.tasks.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        entry.task.record_progress(update.fraction, update.note);
        entry.publish();
        Ok(())
    }

    /// Move a task to `status`. Returns the updated snapshot.
    pub fn transition(
        &self,
        id: TaskId,
        status: TaskStatus,
        note: impl Into<String>,
    ) -> Result<Task, RegistryError> {
        let note = note.into();
        self.modify(id, |task| task.transition(status, note))
    }

    /// Apply `f` to a task atomically and publish the result.
    ///
    /// Nothing changes when `f` fails. Exactly one call per task can move
    /// it into a terminal state; that call is the one that sees `Ok` with a
    /// terminal snapshot.
    pub fn modify<F>(&self, id: TaskId, f: F) -> Result<Task, RegistryError>
    where
        F: FnOnce(&mut Task) -> Result<(), TaskStateError>,
    {
        let mut inner = self.lock();
        let entry = inner.tasks.get_mut(&id).ok_or(RegistryError::NotFound(id))?;
        let was_terminal = entry.task.is_terminal();
        let mut next = entry.task.clone();
        f(&mut next)?;
        entry.task = next;
        entry.publish();
        let snapshot = entry.task.clone();

        if !was_terminal && snapshot.is_terminal() {
            let at = snapshot.finished_at.unwrap_or_else(Utc::now);
            inner.record_terminal(snapshot.status(), at);
            inner.evict_overflow(self.max_history);
        }
        Ok(snapshot)
    }

    /// Remove a finished task. Running or waiting tasks are never evicted.
    pub fn evict(&self, id: TaskId) -> Result<Task, RegistryError> {
        let mut inner = self.lock();
        let status = inner
            .tasks
            .get(&id)
            .map(|entry| entry.task.status())
            .ok_or(RegistryError::NotFound(id))?;
        if !status.is_terminal() {
            return Err(RegistryError::NotTerminal { id, status });
        }
        inner.order.retain(|other| *other != id);
        let entry = inner.tasks.remove(&id).ok_or(RegistryError::NotFound(id))?;
        Ok(entry.task)
    }

    /// Follow a task's progress. `None` for unknown (or evicted) tasks.
    pub fn subscribe(&self, id: TaskId) -> Option<TaskSubscription> {
        self.lock()
            .tasks
            .get(&id)
            .map(|entry| TaskSubscription::new(entry.events.subscribe()))
    }

    pub fn totals(&self) -> RegistryTotals {
        let mut inner = self.lock();
        inner.prune_completions(Utc::now());
        RegistryTotals {
            completed_last_24h: inner.completions.len() as u64,
            ..inner.totals
        }
    }

    pub fn status_counts(&self) -> StatusCounts {
        let inner = self.lock();
        let mut counts = StatusCounts::default();
        for entry in inner.tasks.values() {
            match entry.task.status() {
                TaskStatus::Queued => counts.queued += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Paused => counts.paused += 1,
                TaskStatus::Succeeded => counts.succeeded += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// TaskSubscription
// ---------------------------------------------------------------------------

/// A subscriber's view of one task.
///
/// Starts with the current snapshot, then yields each newer snapshot
/// (intermediate ones may be skipped when the subscriber is slow) and ends
/// with exactly one terminal event, after which `next` returns `None`.
#[derive(Debug)]
pub struct TaskSubscription {
    rx: watch::Receiver<TaskEvent>,
    started: bool,
    done: bool,
}

impl TaskSubscription {
    fn new(rx: watch::Receiver<TaskEvent>) -> Self {
        Self {
            rx,
            started: false,
            done: false,
        }
    }

    pub async fn next(&mut self) -> Option<TaskEvent> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            let event = self.rx.borrow_and_update().clone();
            return Some(self.observe(event));
        }
        match self.rx.changed().await {
            Ok(()) => {
                let event = self.rx.borrow_and_update().clone();
                Some(self.observe(event))
            }
            Err(_) => {
                // The record was evicted; its last value is terminal unless
                // the task vanished mid-flight.
                self.done = true;
                let event = self.rx.borrow().clone();
                event.is_terminal().then_some(event)
            }
        }
    }

    /// Drain the subscription and return the terminal event, if any.
    pub async fn terminal(mut self) -> Option<TaskEvent> {
        let mut last = None;
        while let Some(event) = self.next().await {
            last = Some(event);
        }
        last.filter(TaskEvent::is_terminal)
    }

    fn observe(&mut self, event: TaskEvent) -> TaskEvent {
        if event.is_terminal() {
            self.done = true;
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ae_core::types::{ArtifactKind, StageSpec, ToolKind};

    fn task(owner: &str) -> Task {
        Task::new(
            UserId::from(owner),
            "clip.mp4",
            vec![StageSpec::new(
                "denoise",
                ToolKind::Ffmpeg,
                ArtifactKind::Video,
                ArtifactKind::Video,
            )],
        )
        .unwrap()
    }

    #[test]
    fn terminal_transition_succeeds_once() {
        let registry = TaskRegistry::new(10);
        let t = task("u1");
        let id = t.id;
        registry.put(t);
        registry.transition(id, TaskStatus::Running, "start").unwrap();
        let done = registry.transition(id, TaskStatus::Cancelled, "stop").unwrap();
        assert!(done.is_terminal());
        assert!(matches!(
            registry.transition(id, TaskStatus::Cancelled, "again"),
            Err(RegistryError::State(TaskStateError::InvalidTransition { .. }))
        ));
        assert_eq!(registry.totals().cancelled, 1);
        assert_eq!(registry.totals().processed, 1);
    }

    #[test]
    fn failed_modify_leaves_task_untouched() {
        let registry = TaskRegistry::new(10);
        let t = task("u1");
        let id = t.id;
        registry.put(t);
        let err = registry
            .modify(id, |task| {
                task.record_progress(0.5, None);
                task.succeed("out.mp4")
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::State(_)));
        let snapshot = registry.get(id).unwrap();
        assert_eq!(snapshot.status(), TaskStatus::Queued);
        assert!(snapshot.result_ref.is_none());
    }

    #[test]
    fn unknown_task_is_not_found() {
        let registry = TaskRegistry::new(10);
        let id = uuid::Uuid::new_v4();
        assert_eq!(
            registry.update_progress(id, ProgressUpdate::new(0.5)),
            Err(RegistryError::NotFound(id))
        );
        assert!(registry.subscribe(id).is_none());
    }

    #[test]
    fn list_by_user_is_newest_first() {
        let registry = TaskRegistry::new(10);
        let first = task("u1");
        let second = task("u1");
        let other = task("u2");
        let (a, b) = (first.id, second.id);
        registry.put(first);
        registry.put(other);
        registry.put(second);
        let ids: Vec<_> = registry
            .list_by_user(&UserId::from("u1"))
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![b, a]);
    }
}
