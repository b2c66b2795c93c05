use tasklive_shared::{ClientFrame, PushFrame, TaskDto, TaskId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, trace, warn};

use crate::client::TaskApi;
use crate::session::Session;
use crate::store::TaskStore;
use crate::task::{Task, TaskKey};

/// What the push transport reports to the listener.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Frame(PushFrame),
    Disconnected { reason: String },
}

/// Applies a `task:created` broadcast.
///
/// An entry with the same id is replaced in place. Otherwise, a pending
/// provisional entry of ours carrying the same content is swapped for it
/// (the creator receives its own broadcast). Failing both, the task goes
/// to the head if the filter admits it.
pub fn apply_created(store: &mut TaskStore, dto: TaskDto, own_name: Option<&str>) {
    let task = Task::from(dto.clone());
    let key = task.key.clone();

    if store.contains(&key) {
        trace!(key = %key, "created event for a known task; replacing in place");
        store.upsert_authoritative(task);
        return;
    }
    if !store.admits(&task) {
        trace!(key = %key, "created event outside the active filter");
        return;
    }

    let ours = dto.created_by.is_none()
        || dto.created_by.as_deref() == own_name;
    if ours
        && let Some(provisional) =
            store.adopt_provisional(|candidate| candidate.same_content(&dto), task.clone())
    {
        debug!(key = %key, provisional = provisional.value(), "created event adopted a provisional task");
        return;
    }

    store.upsert_authoritative(task);
}

/// Applies a `task:updated` broadcast: drop it if the filter no longer
/// admits it, otherwise replace in place or insert when absent.
pub fn apply_updated(store: &mut TaskStore, dto: TaskDto) {
    store.upsert_authoritative(Task::from(dto));
}

/// Applies a `task:deleted` broadcast. Absent ids are a no-op.
pub fn apply_deleted(store: &mut TaskStore, id: TaskId) {
    store.remove(&TaskKey::Confirmed(id.clone()));
    store.tombstone(id);
}

/// Keeps a listener task alive for as long as the handle is held.
#[derive(Debug)]
pub struct Subscription {
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the listener to stop on its own (the event stream ended).
    pub async fn join(mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(err) = handle.await
            && !err.is_cancelled()
        {
            warn!(error = %err, "push listener task failed");
        }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("push listener unsubscribed");
        }
    }
}

/// Starts consuming `events` into `session`. Identity announcements go
/// out through `outbound`.
pub fn listen<A: TaskApi>(
    session: Session<A>,
    events: mpsc::Receiver<ChannelEvent>,
    outbound: mpsc::Sender<ClientFrame>,
) -> Subscription {
    let handle = tokio::spawn(run_listener(session, events, outbound));
    Subscription {
        handle: Some(handle),
    }
}

#[instrument(skip_all)]
async fn run_listener<A: TaskApi>(
    session: Session<A>,
    mut events: mpsc::Receiver<ChannelEvent>,
    outbound: mpsc::Sender<ClientFrame>,
) {
    let mut connections = 0_u64;

    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Connected => {
                connections += 1;
                info!(connections, "push channel connected");
                let identify = ClientFrame::Identify(session.identity().identify_args());
                if outbound.send(identify).await.is_err() {
                    warn!("push channel closed before identity could be announced");
                }
                if connections > 1 {
                    resync(&session);
                }
            }
            ChannelEvent::Frame(frame) => handle_frame(&session, frame),
            ChannelEvent::Disconnected { reason } => {
                warn!(%reason, "push channel disconnected; keeping last known tasks");
                session.update_presence(|presence| presence.clear());
                session.api().set_socket_id(None);
            }
        }
    }

    debug!("push event stream ended");
}

/// Routes one frame to the store or the presence tracker.
pub fn handle_frame<A: TaskApi>(session: &Session<A>, frame: PushFrame) {
    trace!(event = frame.event_name(), "push frame received");
    match frame {
        PushFrame::TaskCreated(dto) => {
            let own_name = session.identity().name;
            session
                .store()
                .write(|s| apply_created(s, dto, Some(own_name.as_str())));
        }
        PushFrame::TaskUpdated(dto) => session.store().write(|s| apply_updated(s, dto)),
        PushFrame::TaskDeleted(arg) => session.store().write(|s| apply_deleted(s, arg.id)),
        PushFrame::UserIdentify(peer) => {
            session.api().set_socket_id(Some(peer.socket_id.clone()));
            session.update_presence(|presence| presence.identified(peer));
        }
        other => {
            session.update_presence(|presence| presence.apply(&other));
        }
    }
}

fn resync<A: TaskApi>(session: &Session<A>) {
    let session = session.clone();
    tokio::spawn(async move {
        match session.refetch().await {
            Ok(count) => info!(count, "resynchronized after reconnect"),
            Err(err) => warn!(error = %err, "resync after reconnect failed"),
        }
    });
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tasklive_shared::{TaskCreate, TaskStatus};

    use super::*;
    use crate::task::ProvisionalId;

    fn dto(id: u64, title: &str, status: TaskStatus) -> TaskDto {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).single().expect("valid timestamp");
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

    fn seeded(filter: Option<TaskStatus>, tasks: Vec<TaskDto>) -> TaskStore {
        let mut store = TaskStore::new(filter);
        store.replace_all(tasks.into_iter().map(Task::from).collect());
        store
    }

    fn ids(store: &TaskStore) -> Vec<String> {
        store.tasks().iter().map(|t| t.key.to_string()).collect()
    }

    #[test]
    fn created_events_never_duplicate_entries() {
        let mut store = seeded(None, vec![dto(1, "a", TaskStatus::Pending)]);
        apply_created(&mut store, dto(2, "b", TaskStatus::Pending), None);
        apply_created(&mut store, dto(2, "b", TaskStatus::Pending), None);
        apply_created(&mut store, dto(1, "a2", TaskStatus::Pending), None);

        assert_eq!(ids(&store), vec!["2", "1"]);
        assert_eq!(store.tasks()[1].title, "a2");
    }

    #[test]
    fn created_event_respects_the_filter() {
        let mut store = seeded(Some(TaskStatus::Completed), vec![]);
        apply_created(&mut store, dto(3, "c", TaskStatus::Pending), None);
        assert!(store.is_empty());
    }

    #[test]
    fn created_event_adopts_our_provisional_in_place() {
        let mut store = seeded(None, vec![dto(1, "a", TaskStatus::Pending)]);
        let provisional = ProvisionalId::next();
        let draft = TaskCreate {
            title: "Buy milk".to_string(),
            description: None,
            status: TaskStatus::Pending,
        };
        store.insert_head(Task::provisional(provisional, &draft, None, Utc::now()));

        let mut echoed = dto(42, "Buy milk", TaskStatus::Pending);
        echoed.created_by = Some("ana".to_string());
        apply_created(&mut store, echoed.clone(), Some("ana"));

        assert_eq!(ids(&store), vec!["42", "1"]);

        store.confirm_provisional(provisional, Task::from(echoed));
        assert_eq!(ids(&store), vec!["42", "1"]);
    }

    #[test]
    fn created_event_from_someone_else_does_not_adopt() {
        let mut store = seeded(None, vec![]);
        let provisional = ProvisionalId::next();
        let draft = TaskCreate {
            title: "Buy milk".to_string(),
            description: None,
            status: TaskStatus::Pending,
        };
        store.insert_head(Task::provisional(provisional, &draft, None, Utc::now()));

        let mut theirs = dto(9, "Buy milk", TaskStatus::Pending);
        theirs.created_by = Some("bo".to_string());
        apply_created(&mut store, theirs, Some("ana"));

        assert_eq!(store.len(), 2);
        assert_eq!(store.tasks()[0].key.to_string(), "9");
        assert!(store.tasks()[1].is_provisional());
    }

    #[test]
    fn updated_event_is_idempotent_and_keeps_position() {
        let mut store = seeded(
            None,
            vec![
                dto(1, "a", TaskStatus::Pending),
                dto(2, "b", TaskStatus::Pending),
                dto(3, "c", TaskStatus::Pending),
            ],
        );
        let event = dto(2, "b2", TaskStatus::InProgress);

        apply_updated(&mut store, event.clone());
        let once: Vec<Task> = store.tasks().to_vec();
        apply_updated(&mut store, event);

        assert_eq!(store.tasks(), once.as_slice());
        assert_eq!(ids(&store), vec!["1", "2", "3"]);
        assert_eq!(store.tasks()[1].title, "b2");
    }

    #[test]
    fn updated_event_leaving_the_filter_removes_the_task() {
        let mut store = seeded(
            Some(TaskStatus::Completed),
            vec![dto(1, "a", TaskStatus::Completed), dto(2, "b", TaskStatus::Completed)],
        );
        apply_updated(&mut store, dto(1, "a", TaskStatus::Pending));

        assert_eq!(ids(&store), vec!["2"]);
        assert!(store.tasks().iter().all(|t| t.status == TaskStatus::Completed));
    }

    #[test]
    fn updated_event_for_absent_matching_task_inserts_it() {
        let mut store = seeded(Some(TaskStatus::Completed), vec![dto(1, "a", TaskStatus::Completed)]);
        apply_updated(&mut store, dto(5, "e", TaskStatus::Completed));
        assert_eq!(ids(&store), vec!["5", "1"]);
    }

    #[test]
    fn deleted_event_is_unconditional_and_idempotent() {
        let mut store = seeded(None, vec![dto(1, "a", TaskStatus::Pending), dto(2, "b", TaskStatus::Pending)]);
        apply_deleted(&mut store, TaskId::from(1));
        apply_deleted(&mut store, TaskId::from(1));
        apply_deleted(&mut store, TaskId::from(77));
        assert_eq!(ids(&store), vec!["2"]);
    }
}
