use async_trait::async_trait;
use serde_json::Value;
use transport::{ClientError, TransportClient, TransportError};

use super::{ItemStatus, StatusCheck};
use crate::context::StepContext;

/// Per-resource status check: `GET {collection}/{id}` and read a state
/// value at a JSON pointer.
///
/// A 404 is treated as "not there yet" since freshly created resources
/// often appear with a delay.
#[derive(Debug, Clone)]
pub struct ResourceStateCheck {
    client: TransportClient,
    collection: String,
    state_pointer: String,
    message_pointer: String,
    success: Vec<String>,
    failure: Vec<String>,
}

impl ResourceStateCheck {
    pub fn new(client: TransportClient, collection: impl Into<String>) -> Self {
        Self {
            client,
            collection: collection.into(),
            state_pointer: "/status/state".to_string(),
            message_pointer: "/status/message_list/0/message".to_string(),
            success: vec!["COMPLETE".to_string()],
            failure: vec!["ERROR".to_string()],
        }
    }

    pub fn with_state_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.state_pointer = pointer.into();
        self
    }

    pub fn with_success(mut self, values: &[&str]) -> Self {
        self.success = values.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn with_failure(mut self, values: &[&str]) -> Self {
        self.failure = values.iter().map(|v| v.to_string()).collect();
        self
    }

    fn classify(&self, body: &Value) -> ItemStatus {
        let Some(state) = body.pointer(&self.state_pointer).and_then(Value::as_str) else {
            return ItemStatus::Pending;
        };

        if self.success.iter().any(|s| s == state) {
            ItemStatus::Succeeded
        } else if self.failure.iter().any(|s| s == state) {
            let detail = body
                .pointer(&self.message_pointer)
                .and_then(Value::as_str)
                .unwrap_or(state);
            ItemStatus::Failed(detail.to_string())
        } else {
            ItemStatus::Running
        }
    }
}

#[async_trait]
impl StatusCheck for ResourceStateCheck {
    fn label(&self) -> String {
        format!("{}@{}", self.collection, self.client.base_url())
    }

    async fn check(
        &self,
        ids: &[String],
        ctx: &StepContext,
    ) -> Result<Vec<(String, ItemStatus)>, ClientError> {
        let options = ctx.call_options().uncached();
        let collection = self.collection.trim_end_matches('/');

        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            let path = format!("{}/{}", collection, id);
            let status = match self.client.get_with(&path, &options).await {
                Ok(body) => self.classify(&body),
                Err(ClientError::Transport(TransportError::Http { status: 404, .. })) => {
                    ItemStatus::Pending
                }
                Err(e) => return Err(e),
            };
            statuses.push((id.clone(), status));
        }
        Ok(statuses)
    }
}
