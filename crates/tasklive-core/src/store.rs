use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tasklive_shared::{TaskId, TaskStatus};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::task::{ProvisionalId, Task, TaskKey};

const TOMBSTONE_CAPACITY: usize = 256;
const ADOPTION_CAPACITY: usize = 64;

/// Shared, copy-on-write task sequence. Snapshots clone the `Arc`.
pub type TaskSeq = Arc<Vec<Task>>;

/// What the view layer renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreView {
    pub tasks: TaskSeq,
    pub filter: Option<TaskStatus>,
    pub loading: bool,
    pub error: Option<String>,
}

/// Pre-mutation copy of the sequence used for rollback.
#[derive(Debug, Clone)]
pub struct Snapshot {
    tasks: TaskSeq,
    epoch: u64,
    applied_revision: u64,
}

impl Snapshot {
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rollback {
    /// The snapshot is live again. `discarded_interleaved` is set when
    /// writes from other producers landed between snapshot and rollback
    /// and were thrown away with it.
    Restored { discarded_interleaved: bool },
    /// The filter changed after the snapshot was taken; restoring it
    /// would bring back tasks the new filter excludes.
    Superseded,
}

/// Ordered, filter-scoped collection of visible tasks.
///
/// Mutation primitives are total: patching or removing an absent key is
/// a no-op. Every key appears at most once.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: TaskSeq,
    filter: Option<TaskStatus>,
    loading: bool,
    error: Option<String>,
    revision: u64,
    epoch: u64,
    fetch_generation: u64,
    /// Provisional ids whose entry a push already swapped for the confirmed
    /// task. An abandoned create leaves its entry until the next committed
    /// fetch or until it is the oldest past `ADOPTION_CAPACITY`.
    adopted: BTreeMap<ProvisionalId, TaskId>,
    tombstones: VecDeque<TaskId>,
    tombstone_set: HashSet<TaskId>,
}

impl TaskStore {
    pub fn new(filter: Option<TaskStatus>) -> Self {
        Self {
            filter,
            ..Self::default()
        }
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn filter(&self) -> Option<TaskStatus> {
        self.filter
    }

    pub fn loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn view(&self) -> StoreView {
        StoreView {
            tasks: Arc::clone(&self.tasks),
            filter: self.filter,
            loading: self.loading,
            error: self.error.clone(),
        }
    }

    pub fn get(&self, key: &TaskKey) -> Option<&Task> {
        self.tasks.iter().find(|task| &task.key == key)
    }

    pub fn contains(&self, key: &TaskKey) -> bool {
        self.position(key).is_some()
    }

    pub fn admits(&self, task: &Task) -> bool {
        task.matches(self.filter)
    }

    /// Replaces the whole sequence, dropping repeated keys (first wins).
    pub fn replace_all(&mut self, tasks: Vec<Task>) {
        let mut seen = HashSet::with_capacity(tasks.len());
        let deduped: Vec<Task> = tasks
            .into_iter()
            .filter(|task| seen.insert(task.key.clone()))
            .collect();
        self.tasks = Arc::new(deduped);
        self.touch();
    }

    /// Puts `task` at the head; an existing entry with the same key is
    /// replaced in place instead.
    pub fn insert_head(&mut self, task: Task) {
        if let Some(pos) = self.position(&task.key) {
            Arc::make_mut(&mut self.tasks)[pos] = task;
        } else {
            Arc::make_mut(&mut self.tasks).insert(0, task);
        }
        self.touch();
    }

    /// Swaps the entry at `key` for `task`, keeping its position. Any
    /// other entry already carrying `task`'s key is dropped.
    pub fn replace(&mut self, key: &TaskKey, task: Task) -> bool {
        let Some(pos) = self.position(key) else {
            return false;
        };
        let new_key = task.key.clone();
        let tasks = Arc::make_mut(&mut self.tasks);
        tasks[pos] = task;
        if &new_key != key {
            let mut idx = 0;
            tasks.retain(|other| {
                let keep = idx == pos || other.key != new_key;
                idx += 1;
                keep
            });
        }
        self.touch();
        true
    }

    pub fn patch(&mut self, key: &TaskKey, apply: impl FnOnce(&mut Task)) -> bool {
        let Some(pos) = self.position(key) else {
            return false;
        };
        apply(&mut Arc::make_mut(&mut self.tasks)[pos]);
        self.touch();
        true
    }

    pub fn remove(&mut self, key: &TaskKey) -> Option<Task> {
        let pos = self.position(key)?;
        let removed = Arc::make_mut(&mut self.tasks).remove(pos);
        self.touch();
        Some(removed)
    }

    /// Writes an authoritative copy of a confirmed task: in place when
    /// present, at the head when absent and admitted, removed when the
    /// filter no longer admits it.
    pub fn upsert_authoritative(&mut self, task: Task) {
        let key = task.key.clone();
        let admitted = self.admits(&task);
        if self.contains(&key) {
            if admitted {
                self.replace(&key, task);
            } else {
                self.remove(&key);
            }
        } else if admitted && !self.is_tombstoned(&key) {
            self.insert_head(task);
        }
    }

    /// Settles a provisional entry once the service has answered.
    pub fn confirm_provisional(&mut self, provisional: ProvisionalId, task: Task) {
        let temp_key = TaskKey::Provisional(provisional);
        let confirmed_key = task.key.clone();
        let adopted_as = self.adopted.remove(&provisional);
        let admitted = self.admits(&task);

        if self.contains(&confirmed_key) {
            self.remove(&temp_key);
            if admitted {
                self.replace(&confirmed_key, task);
            } else {
                self.remove(&confirmed_key);
            }
        } else if self.contains(&temp_key) {
            if admitted {
                self.replace(&temp_key, task);
            } else {
                self.remove(&temp_key);
            }
        } else if adopted_as.as_ref() == confirmed_key.server_id() {
            trace!(key = %confirmed_key, "adopted task no longer visible; not reinserting");
        } else if admitted && !self.is_tombstoned(&confirmed_key) {
            self.insert_head(task);
        }
    }

    /// Drops a provisional entry after its create failed.
    pub fn discard_provisional(&mut self, provisional: ProvisionalId) -> Option<Task> {
        self.adopted.remove(&provisional);
        self.remove(&TaskKey::Provisional(provisional))
    }

    /// Swaps a still-pending provisional entry for the pushed copy of the
    /// task it became. Returns the provisional id that was replaced.
    pub fn adopt_provisional(
        &mut self,
        matches: impl Fn(&Task) -> bool,
        task: Task,
    ) -> Option<ProvisionalId> {
        let server_id = task.server_id()?.clone();
        let provisional = self.tasks.iter().find_map(|candidate| match candidate.key {
            TaskKey::Provisional(id) if matches(candidate) => Some(id),
            _ => None,
        })?;
        self.replace(&TaskKey::Provisional(provisional), task);
        self.adopted.insert(provisional, server_id);
        while self.adopted.len() > ADOPTION_CAPACITY {
            self.adopted.pop_first();
        }
        Some(provisional)
    }

    pub fn tombstone(&mut self, id: TaskId) {
        if !self.tombstone_set.insert(id.clone()) {
            return;
        }
        self.tombstones.push_back(id);
        while self.tombstones.len() > TOMBSTONE_CAPACITY {
            if let Some(oldest) = self.tombstones.pop_front() {
                self.tombstone_set.remove(&oldest);
            }
        }
    }

    pub fn is_tombstoned(&self, key: &TaskKey) -> bool {
        key.server_id()
            .is_some_and(|id| self.tombstone_set.contains(id))
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            tasks: Arc::clone(&self.tasks),
            epoch: self.epoch,
            applied_revision: self.revision,
        }
    }

    /// Records that the caller's own optimistic change has been applied on
    /// top of `snapshot`, so later writes count as interleaved.
    pub fn mark_applied(&self, snapshot: &mut Snapshot) {
        snapshot.applied_revision = self.revision;
    }

    pub fn rollback(&mut self, snapshot: Snapshot) -> Rollback {
        if snapshot.epoch != self.epoch {
            return Rollback::Superseded;
        }
        let discarded_interleaved = self.revision != snapshot.applied_revision;
        self.tasks = snapshot.tasks;
        self.touch();
        Rollback::Restored {
            discarded_interleaved,
        }
    }

    /// Sets the filter and drops entries it no longer admits. The caller
    /// is expected to follow up with a fetch.
    pub fn set_filter(&mut self, filter: Option<TaskStatus>) {
        self.filter = filter;
        if self.tasks.iter().any(|task| !task.matches(filter)) {
            Arc::make_mut(&mut self.tasks).retain(|task| task.matches(filter));
        }
        self.epoch += 1;
        self.touch();
    }

    /// Starts a fetch and returns its generation plus the filter to use.
    pub fn begin_fetch(&mut self) -> (u64, Option<TaskStatus>) {
        self.fetch_generation += 1;
        self.loading = true;
        self.touch();
        (self.fetch_generation, self.filter)
    }

    pub fn is_current_fetch(&self, generation: u64) -> bool {
        generation == self.fetch_generation
    }

    /// Commits a fetch result unless a newer fetch has started since.
    pub fn commit_fetch(&mut self, generation: u64, tasks: Vec<Task>) -> bool {
        if !self.is_current_fetch(generation) {
            debug!(generation, current = self.fetch_generation, "discarding superseded fetch");
            return false;
        }
        let filter = self.filter;
        self.replace_all(tasks.into_iter().filter(|task| task.matches(filter)).collect());
        self.adopted.clear();
        self.loading = false;
        self.error = None;
        true
    }

    pub fn fail_fetch(&mut self, generation: u64, reason: String) -> bool {
        if !self.is_current_fetch(generation) {
            return false;
        }
        self.loading = false;
        self.error = Some(reason);
        self.touch();
        true
    }

    pub fn set_error(&mut self, reason: impl Into<String>) {
        self.error = Some(reason.into());
        self.touch();
    }

    pub fn clear_error(&mut self) {
        if self.error.take().is_some() {
            self.touch();
        }
    }

    fn position(&self, key: &TaskKey) -> Option<usize> {
        self.tasks.iter().position(|task| &task.key == key)
    }

    fn touch(&mut self) {
        self.revision += 1;
    }
}

/// Single-writer handle around a [`TaskStore`].
///
/// Every write runs to completion under the lock and publishes the
/// resulting view; the lock is never held across an `.await`.
#[derive(Debug, Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<TaskStore>>,
    views: Arc<watch::Sender<StoreView>>,
}

impl SharedStore {
    pub fn new(filter: Option<TaskStatus>) -> Self {
        let store = TaskStore::new(filter);
        let (views, _) = watch::channel(store.view());
        Self {
            inner: Arc::new(Mutex::new(store)),
            views: Arc::new(views),
        }
    }

    pub fn read<R>(&self, f: impl FnOnce(&TaskStore) -> R) -> R {
        let store = self.inner.lock();
        f(&store)
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut TaskStore) -> R) -> R {
        let mut store = self.inner.lock();
        let before = store.revision();
        let out = f(&mut store);
        if store.revision() != before {
            self.views.send_replace(store.view());
        }
        out
    }

    pub fn view(&self) -> StoreView {
        self.read(TaskStore::view)
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreView> {
        self.views.subscribe()
    }
}
