use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;
use transport::{ClientError, TransportClient};

use super::{ItemStatus, StatusCheck};
use crate::context::StepContext;

const DEFAULT_PATH: &str = "tasks/list";
const SUCCESS: &str = "SUCCEEDED";
const FAILURE: [&str; 3] = ["FAILED", "ABORTED", "CANCELED"];

/// Status check against a task list endpoint that accepts a
/// `uuid==a,uuid==b` filter and answers with `{"entities": [...]}`.
#[derive(Debug, Clone)]
pub struct TaskListCheck {
    client: TransportClient,
    path: String,
}

impl TaskListCheck {
    pub fn new(client: TransportClient) -> Self {
        Self {
            client,
            path: DEFAULT_PATH.to_string(),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    fn filter(ids: &[String]) -> String {
        ids.iter()
            .map(|id| format!("uuid=={}", id))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn status_of(entity: &Value) -> ItemStatus {
        let status = entity
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or_default();

        if status == SUCCESS {
            ItemStatus::Succeeded
        } else if FAILURE.contains(&status) {
            let detail = entity
                .get("error_detail")
                .and_then(Value::as_str)
                .filter(|d| !d.is_empty())
                .unwrap_or(status);
            ItemStatus::Failed(detail.to_string())
        } else if status.is_empty() || status == "QUEUED" {
            ItemStatus::Pending
        } else {
            ItemStatus::Running
        }
    }
}

#[async_trait]
impl StatusCheck for TaskListCheck {
    fn label(&self) -> String {
        format!("tasks@{}", self.client.base_url())
    }

    async fn check(
        &self,
        ids: &[String],
        ctx: &StepContext,
    ) -> Result<Vec<(String, ItemStatus)>, ClientError> {
        let body = json!({
            "kind": "task",
            "length": ids.len(),
            "filter": Self::filter(ids),
        });
        let options = ctx.call_options();
        let response = self.client.post_with(&self.path, &body, &options).await?;

        let entities = response
            .get("entities")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        debug!(queried = ids.len(), returned = entities.len(), "Task list polled");

        Ok(entities
            .iter()
            .filter_map(|entity| {
                let uuid = entity.get("uuid").and_then(Value::as_str)?;
                Some((uuid.to_string(), Self::status_of(entity)))
            })
            .collect())
    }
}
