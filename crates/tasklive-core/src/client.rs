use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tasklive_shared::{
    ApiEnvelope, ApiErrorBody, TaskCreate, TaskDto, TaskId, TaskPatch, TasksListArgs,
};
use tracing::{debug, instrument};

use crate::error::RequestFailure;

const SOCKET_ID_HEADER: &str = "x-socket-id";

/// Request/response access to the authoritative task service.
///
/// Each call is a single exchange with no internal retries. Failures come
/// back as values; nothing here panics or throws past the boundary.
pub trait TaskApi: Send + Sync + 'static {
    fn fetch(
        &self,
        args: TasksListArgs,
    ) -> impl Future<Output = Result<Vec<TaskDto>, RequestFailure>> + Send;

    fn create(
        &self,
        create: TaskCreate,
    ) -> impl Future<Output = Result<TaskDto, RequestFailure>> + Send;

    fn update(
        &self,
        id: TaskId,
        patch: TaskPatch,
    ) -> impl Future<Output = Result<TaskDto, RequestFailure>> + Send;

    fn remove(&self, id: TaskId) -> impl Future<Output = Result<(), RequestFailure>> + Send;

    /// Connection id of this client on the push channel, once known.
    fn set_socket_id(&self, _socket_id: Option<String>) {}
}

#[derive(Debug)]
pub struct HttpTaskApi {
    http: reqwest::Client,
    base_url: String,
    socket_id: RwLock<Option<String>>,
}

impl HttpTaskApi {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            socket_id: RwLock::new(None),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn tasks_url(&self) -> String {
        format!("{}/tasks", self.base_url)
    }

    fn task_url(&self, id: &TaskId) -> String {
        format!("{}/tasks/{}", self.base_url, id)
    }

    fn with_socket_id(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.socket_id.read().as_deref() {
            Some(id) => builder.header(SOCKET_ID_HEADER, id),
            None => builder,
        }
    }

    async fn execute(&self, op: &'static str, builder: RequestBuilder) -> Result<String, RequestFailure> {
        let response = self
            .with_socket_id(builder)
            .send()
            .await
            .map_err(|err| RequestFailure::Transport(format!("{op} request failed: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| RequestFailure::Transport(format!("{op} response unreadable: {err}")))?;

        debug!(op, status = status.as_u16(), body_len = body.len(), "task service responded");

        if status.is_success() {
            Ok(body)
        } else {
            Err(failure_for_status(status, &body))
        }
    }

    async fn execute_json<T: DeserializeOwned>(
        &self,
        op: &'static str,
        builder: RequestBuilder,
    ) -> Result<T, RequestFailure> {
        let body = self.execute(op, builder).await?;
        decode_envelope(op, &body)
    }
}

impl TaskApi for HttpTaskApi {
    #[instrument(skip(self), fields(status = ?args.status))]
    async fn fetch(&self, args: TasksListArgs) -> Result<Vec<TaskDto>, RequestFailure> {
        let url = match args.status {
            Some(status) => format!("{}?status={}", self.tasks_url(), status.as_str()),
            None => self.tasks_url(),
        };
        self.execute_json("list", self.http.get(url)).await
    }

    #[instrument(skip(self, create), fields(title_len = create.title.len()))]
    async fn create(&self, create: TaskCreate) -> Result<TaskDto, RequestFailure> {
        self.execute_json("create", self.http.post(self.tasks_url()).json(&create))
            .await
    }

    #[instrument(skip(self, patch), fields(id = %id))]
    async fn update(&self, id: TaskId, patch: TaskPatch) -> Result<TaskDto, RequestFailure> {
        self.execute_json("update", self.http.patch(self.task_url(&id)).json(&patch))
            .await
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn remove(&self, id: TaskId) -> Result<(), RequestFailure> {
        self.execute("delete", self.http.delete(self.task_url(&id)))
            .await
            .map(|_| ())
    }

    fn set_socket_id(&self, socket_id: Option<String>) {
        debug!(socket_id = ?socket_id, "attaching socket id to requests");
        *self.socket_id.write() = socket_id;
    }
}

pub(crate) fn failure_for_status(status: StatusCode, body: &str) -> RequestFailure {
    let reason = serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|parsed| parsed.reason().map(str::to_string))
        .unwrap_or_else(|| status.to_string());

    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            RequestFailure::Validation(reason)
        }
        StatusCode::NOT_FOUND => RequestFailure::NotFound(reason),
        _ => RequestFailure::Transport(format!("server returned {status}: {reason}")),
    }
}

pub(crate) fn decode_envelope<T: DeserializeOwned>(
    op: &'static str,
    body: &str,
) -> Result<T, RequestFailure> {
    serde_json::from_str::<ApiEnvelope<T>>(body)
        .map(|envelope| envelope.data)
        .map_err(|err| RequestFailure::Transport(format!("{op} response undecodable: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_map_onto_the_failure_taxonomy() {
        let validation = failure_for_status(
            StatusCode::BAD_REQUEST,
            r#"{"success":false,"message":"Title is required"}"#,
        );
        assert_eq!(validation, RequestFailure::Validation("Title is required".to_string()));

        let missing = failure_for_status(StatusCode::NOT_FOUND, r#"{"error":"Task not found"}"#);
        assert_eq!(missing, RequestFailure::NotFound("Task not found".to_string()));

        let server = failure_for_status(StatusCode::INTERNAL_SERVER_ERROR, "<html>oops</html>");
        assert_eq!(server.kind(), "transport");
        assert!(server.reason().contains("500"));
    }

    #[test]
    fn envelopes_unwrap_their_data() {
        let body = r#"{
            "success": true,
            "data": {
                "id": 42,
                "title": "Buy milk",
                "description": null,
                "status": "pending",
                "created_at": "2024-05-01T10:00:00Z",
                "updated_at": "2024-05-01T10:00:00Z"
            }
        }"#;
        let task: TaskDto = decode_envelope("create", body).expect("decode envelope");
        assert_eq!(task.id, TaskId::from(42));

        let broken = decode_envelope::<TaskDto>("create", "{}");
        assert!(matches!(broken, Err(RequestFailure::Transport(_))));
    }
}
