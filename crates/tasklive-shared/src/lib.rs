use std::fmt;
use std::str::FromStr;

use chrono::{
  DateTime,
  Utc
};
use serde::{
  Deserialize,
  Deserializer,
  Serialize
};

pub const TITLE_MAX_LEN: usize = 100;
pub const DESCRIPTION_MAX_LEN: usize =
  500;

#[derive(
  Debug,
  Clone,
  Copy,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
  Hash,
)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
  Pending,
  InProgress,
  Completed
}

impl TaskStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      | TaskStatus::Pending => "pending",
      | TaskStatus::InProgress => {
        "in-progress"
      }
      | TaskStatus::Completed => {
        "completed"
      }
    }
  }
}

impl fmt::Display for TaskStatus {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>
  ) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for TaskStatus {
  type Err = String;

  fn from_str(
    s: &str
  ) -> Result<Self, Self::Err> {
    match s
      .trim()
      .to_ascii_lowercase()
      .as_str()
    {
      | "pending" => Ok(Self::Pending),
      | "in-progress"
      | "in_progress"
      | "inprogress" => {
        Ok(Self::InProgress)
      }
      | "completed" | "done" => {
        Ok(Self::Completed)
      }
      | other => Err(format!(
        "unknown task status: {other}"
      ))
    }
  }
}

/// Server-assigned task identifier.
///
/// The service may hand out numeric or
/// textual ids; both are kept as text.
#[derive(
  Debug,
  Clone,
  Serialize,
  PartialEq,
  Eq,
  Hash,
  PartialOrd,
  Ord,
)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
  pub fn new(
    raw: impl Into<String>
  ) -> Self {
    Self(raw.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for TaskId {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>
  ) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<u64> for TaskId {
  fn from(raw: u64) -> Self {
    Self(raw.to_string())
  }
}

impl From<&str> for TaskId {
  fn from(raw: &str) -> Self {
    Self(raw.to_string())
  }
}

impl<'de> Deserialize<'de> for TaskId {
  fn deserialize<D>(
    deserializer: D
  ) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>
  {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
      Text(String),
      Unsigned(u64),
      Signed(i64)
    }

    Ok(
      match RawId::deserialize(
        deserializer
      )? {
        | RawId::Text(text) => {
          Self(text)
        }
        | RawId::Unsigned(n) => {
          Self(n.to_string())
        }
        | RawId::Signed(n) => {
          Self(n.to_string())
        }
      }
    )
  }
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
)]
pub struct TaskDto {
  pub id:               TaskId,
  #[serde(default)]
  pub title:            String,
  #[serde(default)]
  pub description:      Option<String>,
  pub status:           TaskStatus,
  pub created_at:       DateTime<Utc>,
  pub updated_at:       DateTime<Utc>,
  #[serde(default)]
  pub created_by:       Option<String>,
  #[serde(default)]
  pub created_by_color: Option<String>
}

#[derive(
  Debug,
  Clone,
  Default,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
pub struct TasksListArgs {
  #[serde(
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub status: Option<TaskStatus>
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
pub struct TaskCreate {
  pub title:       String,
  #[serde(
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub description: Option<String>,
  pub status:      TaskStatus
}

impl TaskCreate {
  pub fn validate(
    &self
  ) -> Result<(), String> {
    validate_title(&self.title)?;
    if let Some(description) =
      self.description.as_deref()
    {
      validate_description(
        description
      )?;
    }
    Ok(())
  }
}

#[derive(
  Debug,
  Clone,
  Default,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
pub struct TaskPatch {
  #[serde(
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub title:       Option<String>,
  #[serde(
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub description:
    Option<Option<String>>,
  #[serde(
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub status:      Option<TaskStatus>
}

impl TaskPatch {
  pub fn is_empty(&self) -> bool {
    self.title.is_none()
      && self.description.is_none()
      && self.status.is_none()
  }

  pub fn validate(
    &self
  ) -> Result<(), String> {
    if let Some(title) =
      self.title.as_deref()
    {
      validate_title(title)?;
    }
    if let Some(Some(description)) =
      self.description.as_ref()
    {
      validate_description(
        description
      )?;
    }
    Ok(())
  }
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
pub struct TaskIdArg {
  pub id: TaskId
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
#[serde(rename_all = "camelCase")]
pub struct PeerIdentity {
  pub socket_id: String,
  pub username:  String,
  pub color:     String
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
#[serde(rename_all = "camelCase")]
pub struct SocketIdArg {
  pub socket_id: String
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
pub struct IdentifyArgs {
  pub username: String,
  pub color:    String
}

/// Successful REST response body.
#[derive(
  Debug, Clone, Serialize, Deserialize,
)]
pub struct ApiEnvelope<T> {
  #[serde(default)]
  pub success: Option<bool>,
  pub data:    T
}

#[derive(
  Debug,
  Clone,
  Default,
  Serialize,
  Deserialize,
)]
pub struct ApiErrorBody {
  #[serde(default)]
  pub message: Option<String>,
  #[serde(default)]
  pub error:   Option<String>
}

impl ApiErrorBody {
  pub fn reason(&self) -> Option<&str> {
    self
      .message
      .as_deref()
      .or(self.error.as_deref())
      .filter(|text| !text.is_empty())
  }
}

/// Frames pushed by the service over the
/// long-lived channel.
#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
)]
#[serde(tag = "event", content = "data")]
pub enum PushFrame {
  #[serde(rename = "task:created")]
  TaskCreated(TaskDto),
  #[serde(rename = "task:updated")]
  TaskUpdated(TaskDto),
  #[serde(rename = "task:deleted")]
  TaskDeleted(TaskIdArg),
  #[serde(rename = "user:identify")]
  UserIdentify(PeerIdentity),
  #[serde(rename = "users:list")]
  UsersList(Vec<PeerIdentity>),
  #[serde(rename = "user:connected")]
  UserConnected(PeerIdentity),
  #[serde(rename = "user:disconnected")]
  UserDisconnected(SocketIdArg)
}

impl PushFrame {
  pub fn event_name(
    &self
  ) -> &'static str {
    match self {
      | PushFrame::TaskCreated(_) => {
        "task:created"
      }
      | PushFrame::TaskUpdated(_) => {
        "task:updated"
      }
      | PushFrame::TaskDeleted(_) => {
        "task:deleted"
      }
      | PushFrame::UserIdentify(_) => {
        "user:identify"
      }
      | PushFrame::UsersList(_) => {
        "users:list"
      }
      | PushFrame::UserConnected(_) => {
        "user:connected"
      }
      | PushFrame::UserDisconnected(
        _
      ) => "user:disconnected"
    }
  }
}

#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
#[serde(tag = "event", content = "data")]
pub enum ClientFrame {
  #[serde(rename = "user:identify")]
  Identify(IdentifyArgs)
}

fn validate_title(
  title: &str
) -> Result<(), String> {
  if title.trim().is_empty() {
    return Err(
      "title cannot be empty"
        .to_string()
    );
  }
  let len = title.chars().count();
  if len > TITLE_MAX_LEN {
    return Err(format!(
      "title is {len} characters; \
       limit is {TITLE_MAX_LEN}"
    ));
  }
  Ok(())
}

fn validate_description(
  description: &str
) -> Result<(), String> {
  let len = description.chars().count();
  if len > DESCRIPTION_MAX_LEN {
    return Err(format!(
      "description is {len} \
       characters; limit is \
       {DESCRIPTION_MAX_LEN}"
    ));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_uses_kebab_case_on_the_wire()
  {
    let raw = serde_json::to_string(
      &TaskStatus::InProgress
    )
    .expect("serialize status");
    assert_eq!(raw, "\"in-progress\"");
    assert_eq!(
      "in-progress"
        .parse::<TaskStatus>()
        .expect("parse status"),
      TaskStatus::InProgress
    );
  }

  #[test]
  fn task_id_accepts_numbers_and_strings()
  {
    let numeric: TaskId =
      serde_json::from_str("42")
        .expect("numeric id");
    let textual: TaskId =
      serde_json::from_str("\"42\"")
        .expect("textual id");
    assert_eq!(numeric, textual);
    assert_eq!(numeric.as_str(), "42");
  }

  #[test]
  fn push_frames_decode_from_event_envelopes()
   {
    let created = r#"{
      "event": "task:created",
      "data": {
        "id": 7,
        "title": "Buy milk",
        "description": null,
        "status": "pending",
        "created_at": "2024-05-01T10:00:00Z",
        "updated_at": "2024-05-01T10:00:00Z",
        "created_by": "ana"
      }
    }"#;
    let frame: PushFrame =
      serde_json::from_str(created)
        .expect("decode created frame");
    let PushFrame::TaskCreated(task) =
      frame
    else {
      panic!("expected task:created");
    };
    assert_eq!(task.id, TaskId::from(7));
    assert_eq!(
      task.created_by.as_deref(),
      Some("ana")
    );

    let deleted: PushFrame =
      serde_json::from_str(
        r#"{"event":"task:deleted","data":{"id":"7"}}"#
      )
      .expect("decode deleted frame");
    assert_eq!(
      deleted,
      PushFrame::TaskDeleted(TaskIdArg {
        id: TaskId::from(7)
      })
    );

    let left: PushFrame =
      serde_json::from_str(
        r#"{"event":"user:disconnected","data":{"socketId":"s-1"}}"#
      )
      .expect("decode presence frame");
    assert_eq!(
      left.event_name(),
      "user:disconnected"
    );
  }

  #[test]
  fn unknown_push_events_are_rejected() {
    let result = serde_json::from_str::<
      PushFrame
    >(
      r#"{"event":"chat:message","data":{}}"#
    );
    assert!(result.is_err());
  }

  #[test]
  fn patch_skips_untouched_fields() {
    let patch = TaskPatch {
      status: Some(
        TaskStatus::Completed
      ),
      ..TaskPatch::default()
    };
    let raw = serde_json::to_string(
      &patch
    )
    .expect("serialize patch");
    assert_eq!(
      raw,
      r#"{"status":"completed"}"#
    );

    let cleared = TaskPatch {
      description: Some(None),
      ..TaskPatch::default()
    };
    assert_eq!(
      serde_json::to_string(&cleared)
        .expect("serialize patch"),
      r#"{"description":null}"#
    );
  }

  #[test]
  fn create_validation_enforces_bounds() {
    let mut create = TaskCreate {
      title:       "   ".to_string(),
      description: None,
      status:      TaskStatus::Pending
    };
    assert!(create.validate().is_err());

    create.title =
      "x".repeat(TITLE_MAX_LEN);
    assert!(create.validate().is_ok());

    create.description = Some(
      "y".repeat(
        DESCRIPTION_MAX_LEN + 1
      )
    );
    assert!(create.validate().is_err());
  }
}
