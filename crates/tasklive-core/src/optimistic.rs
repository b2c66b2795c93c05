//! Optimistic create/update/delete.
//!
//! Each mutation changes the store synchronously, suspends on the service
//! call, then reconciles synchronously: commit the authoritative answer or
//! roll back. Rollback for update/delete restores the whole pre-mutation
//! sequence, which also discards any push-applied changes that landed
//! while the request was in flight (last-write-wins from the service's
//! point of view; the discard is logged, not repaired).

use chrono::Utc;
use tasklive_shared::{TaskCreate, TaskId, TaskPatch};
use tracing::{Span, debug, info, instrument, warn};
use uuid::Uuid;

use crate::client::TaskApi;
use crate::error::RequestFailure;
use crate::store::{Rollback, SharedStore, Snapshot};
use crate::task::{Creator, ProvisionalId, Task, TaskKey};

#[instrument(
    skip(store, api, creator, draft),
    fields(request_id = %Uuid::new_v4(), provisional = tracing::field::Empty)
)]
pub async fn create<A: TaskApi>(
    store: &SharedStore,
    api: &A,
    creator: Option<Creator>,
    draft: TaskCreate,
) -> Result<Task, RequestFailure> {
    if let Err(reason) = draft.validate() {
        return Err(reject(store, RequestFailure::Validation(reason)));
    }

    let provisional_id = ProvisionalId::next();
    Span::current().record("provisional", provisional_id.value());

    let provisional = Task::provisional(provisional_id, &draft, creator, Utc::now());
    let visible = store.write(|s| {
        if s.admits(&provisional) {
            s.insert_head(provisional);
            true
        } else {
            false
        }
    });
    debug!(visible, "provisional task inserted");

    match api.create(draft).await {
        Ok(dto) => {
            let task = Task::from(dto);
            store.write(|s| s.confirm_provisional(provisional_id, task.clone()));
            info!(key = %task.key, "create confirmed");
            Ok(task)
        }
        Err(failure) => {
            store.write(|s| {
                s.discard_provisional(provisional_id);
                s.set_error(failure.to_string());
            });
            warn!(kind = failure.kind(), error = %failure, "create failed; provisional task removed");
            Err(failure)
        }
    }
}

#[instrument(skip(store, api, patch), fields(request_id = %Uuid::new_v4(), id = %id))]
pub async fn update<A: TaskApi>(
    store: &SharedStore,
    api: &A,
    id: TaskId,
    patch: TaskPatch,
) -> Result<Task, RequestFailure> {
    if let Err(reason) = patch.validate() {
        return Err(reject(store, RequestFailure::Validation(reason)));
    }

    let key = TaskKey::Confirmed(id.clone());
    let now = Utc::now();
    let snapshot = store.write(|s| {
        let mut snapshot = s.snapshot();
        if s.patch(&key, |task| task.apply_patch(&patch, now))
            && s.get(&key).is_some_and(|task| !s.admits(task))
        {
            s.remove(&key);
        }
        s.mark_applied(&mut snapshot);
        snapshot
    });

    match api.update(id, patch).await {
        Ok(dto) => {
            let task = Task::from(dto);
            store.write(|s| s.upsert_authoritative(task.clone()));
            info!("update confirmed");
            Ok(task)
        }
        Err(failure) => Err(roll_back(store, snapshot, failure, "update")),
    }
}

#[instrument(skip(store, api), fields(request_id = %Uuid::new_v4(), id = %id))]
pub async fn delete<A: TaskApi>(
    store: &SharedStore,
    api: &A,
    id: TaskId,
) -> Result<(), RequestFailure> {
    let key = TaskKey::Confirmed(id.clone());
    let snapshot = store.write(|s| {
        let mut snapshot = s.snapshot();
        s.remove(&key);
        s.mark_applied(&mut snapshot);
        snapshot
    });

    match api.remove(id.clone()).await {
        Ok(()) => {
            store.write(|s| s.tombstone(id));
            info!("delete confirmed");
            Ok(())
        }
        Err(failure) => Err(roll_back(store, snapshot, failure, "delete")),
    }
}

fn roll_back(
    store: &SharedStore,
    snapshot: Snapshot,
    failure: RequestFailure,
    op: &'static str,
) -> RequestFailure {
    let outcome = store.write(|s| {
        let outcome = s.rollback(snapshot);
        s.set_error(failure.to_string());
        outcome
    });

    match outcome {
        Rollback::Restored {
            discarded_interleaved: true,
        } => warn!(
            op,
            kind = failure.kind(),
            error = %failure,
            "rolled back to snapshot; changes applied during the request were discarded"
        ),
        Rollback::Restored {
            discarded_interleaved: false,
        } => warn!(op, kind = failure.kind(), error = %failure, "rolled back to snapshot"),
        Rollback::Superseded => warn!(
            op,
            kind = failure.kind(),
            error = %failure,
            "filter changed during the request; snapshot not restored"
        ),
    }
    failure
}

fn reject(store: &SharedStore, failure: RequestFailure) -> RequestFailure {
    store.write(|s| s.set_error(failure.to_string()));
    warn!(kind = failure.kind(), error = %failure, "mutation rejected before sending");
    failure
}
