use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use tasklive_shared::{TaskCreate, TaskDto, TaskId, TaskPatch, TaskStatus};

pub const DEFAULT_CREATOR_COLOR: &str = "#6366f1";

static LAST_PROVISIONAL: AtomicU64 = AtomicU64::new(0);

/// Locally generated id for a task the service has not confirmed yet.
///
/// Values come from a monotonic clock in microseconds and live in their
/// own variant of [`TaskKey`], so they can never compare equal to a
/// server id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProvisionalId(u64);

impl ProvisionalId {
    pub fn next() -> Self {
        let now = u64::try_from(Utc::now().timestamp_micros()).unwrap_or_default();
        let prev = LAST_PROVISIONAL
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        Self(now.max(prev + 1))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    Provisional(ProvisionalId),
    Confirmed(TaskId),
}

impl TaskKey {
    pub fn server_id(&self) -> Option<&TaskId> {
        match self {
            TaskKey::Provisional(_) => None,
            TaskKey::Confirmed(id) => Some(id),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Provisional(id) => write!(f, "tmp-{}", id.value()),
            TaskKey::Confirmed(id) => write!(f, "{id}"),
        }
    }
}

impl From<TaskId> for TaskKey {
    fn from(id: TaskId) -> Self {
        TaskKey::Confirmed(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Creator {
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub key: TaskKey,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Option<Creator>,
}

impl Task {
    pub fn provisional(
        id: ProvisionalId,
        fields: &TaskCreate,
        created_by: Option<Creator>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: TaskKey::Provisional(id),
            title: fields.title.clone(),
            description: fields.description.clone(),
            status: fields.status,
            created_at: now,
            updated_at: now,
            created_by,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self.key, TaskKey::Provisional(_))
    }

    pub fn server_id(&self) -> Option<&TaskId> {
        self.key.server_id()
    }

    pub fn matches(&self, filter: Option<TaskStatus>) -> bool {
        filter.is_none_or(|status| self.status == status)
    }

    pub fn apply_patch(&mut self, patch: &TaskPatch, now: DateTime<Utc>) {
        if let Some(title) = patch.title.as_ref() {
            self.title = title.clone();
        }
        if let Some(description) = patch.description.as_ref() {
            self.description = description.clone();
        }
        if let Some(status) = patch.status {
            self.status = status;
        }
        self.updated_at = now;
    }

    /// Whether `dto` carries the same user-supplied fields as this task.
    pub fn same_content(&self, dto: &TaskDto) -> bool {
        self.title == dto.title
            && normalized(self.description.as_deref()) == normalized(dto.description.as_deref())
            && self.status == dto.status
    }
}

impl From<TaskDto> for Task {
    fn from(dto: TaskDto) -> Self {
        let created_by = dto.created_by.map(|name| Creator {
            name,
            color: dto
                .created_by_color
                .unwrap_or_else(|| DEFAULT_CREATOR_COLOR.to_string()),
        });

        Self {
            key: TaskKey::Confirmed(dto.id),
            title: dto.title,
            description: dto.description,
            status: dto.status,
            created_at: dto.created_at,
            updated_at: dto.updated_at,
            created_by,
        }
    }
}

fn normalized(text: Option<&str>) -> Option<&str> {
    text.map(str::trim).filter(|t| !t.is_empty())
}
