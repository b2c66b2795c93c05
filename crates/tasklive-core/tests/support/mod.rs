#![allow(dead_code)]

use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tasklive_core::presence::DisplayIdentity;
use tasklive_core::{RequestFailure, Session, TaskApi};
use tasklive_shared::{TaskCreate, TaskDto, TaskId, TaskPatch, TaskStatus, TasksListArgs};
use tokio::sync::oneshot;

/// Handle on a held request: wait for `entered`, then `release` it.
pub struct Gate {
    pub entered: oneshot::Receiver<()>,
    pub release: oneshot::Sender<()>,
}

#[derive(Default)]
struct FakeState {
    next_id: u64,
    tasks: Vec<TaskDto>,
    hold: Option<(oneshot::Sender<()>, oneshot::Receiver<()>)>,
    fail: Option<RequestFailure>,
    socket_id: Option<String>,
    calls: Vec<&'static str>,
}

/// In-memory stand-in for the task service.
pub struct FakeApi {
    state: Mutex<FakeState>,
}

impl FakeApi {
    pub fn new(next_id: u64) -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_id,
                ..FakeState::default()
            }),
        }
    }

    pub fn seed(&self, tasks: Vec<TaskDto>) {
        self.state.lock().tasks = tasks;
    }

    pub fn server_insert(&self, task: TaskDto) {
        self.state.lock().tasks.insert(0, task);
    }

    /// The next call blocks until the returned gate is released.
    pub fn hold_next(&self) -> Gate {
        let (entered_tx, entered) = oneshot::channel();
        let (release, release_rx) = oneshot::channel();
        self.state.lock().hold = Some((entered_tx, release_rx));
        Gate { entered, release }
    }

    /// The next call fails with `failure` (after any hold is released).
    pub fn fail_next(&self, failure: RequestFailure) {
        self.state.lock().fail = Some(failure);
    }

    pub fn socket_id(&self) -> Option<String> {
        self.state.lock().socket_id.clone()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.state.lock().calls.clone()
    }

    async fn checkpoint(&self, call: &'static str) -> Result<(), RequestFailure> {
        let hold = {
            let mut state = self.state.lock();
            state.calls.push(call);
            state.hold.take()
        };
        if let Some((entered, release)) = hold {
            let _ = entered.send(());
            let _ = release.await;
        }
        match self.state.lock().fail.take() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

impl TaskApi for FakeApi {
    async fn fetch(&self, args: TasksListArgs) -> Result<Vec<TaskDto>, RequestFailure> {
        self.checkpoint("fetch").await?;
        let state = self.state.lock();
        Ok(state
            .tasks
            .iter()
            .filter(|task| args.status.is_none_or(|status| task.status == status))
            .cloned()
            .collect())
    }

    async fn create(&self, create: TaskCreate) -> Result<TaskDto, RequestFailure> {
        self.checkpoint("create").await?;
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let now = Utc::now();
        let task = TaskDto {
            id: TaskId::from(id),
            title: create.title,
            description: create.description,
            status: create.status,
            created_at: now,
            updated_at: now,
            created_by: None,
            created_by_color: None,
        };
        state.tasks.insert(0, task.clone());
        Ok(task)
    }

    async fn update(&self, id: TaskId, patch: TaskPatch) -> Result<TaskDto, RequestFailure> {
        self.checkpoint("update").await?;
        let mut state = self.state.lock();
        let task = state
            .tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or_else(|| RequestFailure::NotFound(format!("task {id} not found")))?;
        if let Some(title) = patch.title {
            task.title = title;
        }
        if let Some(description) = patch.description {
            task.description = description;
        }
        if let Some(status) = patch.status {
            task.status = status;
        }
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    async fn remove(&self, id: TaskId) -> Result<(), RequestFailure> {
        self.checkpoint("delete").await?;
        let mut state = self.state.lock();
        let before = state.tasks.len();
        state.tasks.retain(|task| task.id != id);
        if state.tasks.len() == before {
            return Err(RequestFailure::NotFound(format!("task {id} not found")));
        }
        Ok(())
    }

    fn set_socket_id(&self, socket_id: Option<String>) {
        self.state.lock().socket_id = socket_id;
    }
}

pub fn dto(id: u64, title: &str, status: TaskStatus) -> TaskDto {
    let at = Utc::now();
    TaskDto {
        id: TaskId::from(id),
        title: title.to_string(),
        description: None,
        status,
        created_at: at,
        updated_at: at,
        created_by: None,
        created_by_color: None,
    }
}

pub fn identity() -> DisplayIdentity {
    DisplayIdentity::derive(Some("ana"), Some("#10b981"))
}

/// Session over a fake service already holding `seed`, fetched once.
pub async fn seeded_session(
    seed: Vec<TaskDto>,
    filter: Option<TaskStatus>,
) -> Session<FakeApi> {
    let api = FakeApi::new(42);
    api.seed(seed);
    let session = Session::new(api, identity(), filter);
    session.refetch().await.expect("initial fetch");
    session
}

pub fn titles<A: TaskApi>(session: &Session<A>) -> Vec<String> {
    session.tasks().iter().map(|t| t.title.clone()).collect()
}

/// Polls `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
