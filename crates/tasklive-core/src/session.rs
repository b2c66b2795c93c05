use std::sync::Arc;

use parking_lot::Mutex;
use tasklive_shared::{PeerIdentity, TaskCreate, TaskId, TaskPatch, TaskStatus, TasksListArgs};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::client::TaskApi;
use crate::error::RequestFailure;
use crate::optimistic;
use crate::presence::{DisplayIdentity, PresenceTracker, PresenceView};
use crate::store::{SharedStore, StoreView};
use crate::task::{Creator, Task};

/// Everything the view layer talks to: the visible tasks, the four
/// mutation entry points, and the peer roster.
pub struct Session<A> {
    store: SharedStore,
    api: Arc<A>,
    presence: Arc<Mutex<PresenceTracker>>,
    presence_views: Arc<watch::Sender<PresenceView>>,
}

impl<A> Clone for Session<A> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            api: Arc::clone(&self.api),
            presence: Arc::clone(&self.presence),
            presence_views: Arc::clone(&self.presence_views),
        }
    }
}

impl<A: TaskApi> Session<A> {
    pub fn new(api: A, identity: DisplayIdentity, filter: Option<TaskStatus>) -> Self {
        let presence = PresenceTracker::new(identity);
        let (presence_views, _) = watch::channel(presence.view());
        Self {
            store: SharedStore::new(filter),
            api: Arc::new(api),
            presence: Arc::new(Mutex::new(presence)),
            presence_views: Arc::new(presence_views),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub fn view(&self) -> StoreView {
        self.store.view()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.store.read(|s| s.tasks().to_vec())
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreView> {
        self.store.subscribe()
    }

    pub fn subscribe_presence(&self) -> watch::Receiver<PresenceView> {
        self.presence_views.subscribe()
    }

    pub fn identity(&self) -> DisplayIdentity {
        self.presence.lock().identity().clone()
    }

    pub fn me(&self) -> Option<PeerIdentity> {
        self.presence.lock().me().cloned()
    }

    pub fn roster(&self) -> Vec<PeerIdentity> {
        self.presence.lock().peers().to_vec()
    }

    pub async fn create(&self, draft: TaskCreate) -> Result<Task, RequestFailure> {
        optimistic::create(&self.store, self.api.as_ref(), Some(self.creator()), draft).await
    }

    pub async fn update(&self, id: TaskId, patch: TaskPatch) -> Result<Task, RequestFailure> {
        optimistic::update(&self.store, self.api.as_ref(), id, patch).await
    }

    pub async fn delete(&self, id: TaskId) -> Result<(), RequestFailure> {
        optimistic::delete(&self.store, self.api.as_ref(), id).await
    }

    /// Fetches the list for the active filter and replaces the store with
    /// it, unless a newer fetch started in the meantime. Returns the number
    /// of tasks fetched.
    #[instrument(skip(self), fields(generation = tracing::field::Empty))]
    pub async fn refetch(&self) -> Result<usize, RequestFailure> {
        let (generation, filter) = self.store.write(|s| s.begin_fetch());
        tracing::Span::current().record("generation", generation);

        match self.api.fetch(TasksListArgs { status: filter }).await {
            Ok(dtos) => {
                let count = dtos.len();
                let tasks = dtos.into_iter().map(Task::from).collect();
                if self.store.write(|s| s.commit_fetch(generation, tasks)) {
                    info!(count, filter = ?filter, "store refreshed");
                }
                Ok(count)
            }
            Err(failure) => {
                let reason = failure.to_string();
                if !self.store.write(|s| s.fail_fetch(generation, reason)) {
                    debug!("superseded fetch failed");
                }
                warn!(kind = failure.kind(), error = %failure, "fetch failed");
                Err(failure)
            }
        }
    }

    /// Switches the active filter and refetches. Outstanding mutations are
    /// left running.
    #[instrument(skip(self))]
    pub async fn set_filter(&self, filter: Option<TaskStatus>) -> Result<usize, RequestFailure> {
        self.store.write(|s| s.set_filter(filter));
        self.refetch().await
    }

    pub fn clear_error(&self) {
        self.store.write(|s| s.clear_error());
    }

    pub(crate) fn update_presence<R>(&self, f: impl FnOnce(&mut PresenceTracker) -> R) -> R {
        let mut presence = self.presence.lock();
        let out = f(&mut presence);
        self.presence_views.send_if_modified(|view| {
            let next = presence.view();
            if *view == next {
                false
            } else {
                *view = next;
                true
            }
        });
        out
    }

    fn creator(&self) -> Creator {
        let presence = self.presence.lock();
        let identity = presence.identity();
        Creator {
            name: identity.name.clone(),
            color: identity.color.clone(),
        }
    }
}
