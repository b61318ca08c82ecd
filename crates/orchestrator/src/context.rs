//! Shared run context handed to every step.

use conductor_core::CancelToken;
use events::{Event, EventBus};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use transport::CallOptions;

use crate::pool::PoolConfig;

/// Everything a step may read or write besides its own configuration.
///
/// The key/value store is how an earlier sequential stage hands values
/// (created UUIDs, session tokens) to later stages. Children of a parallel
/// batch must not depend on each other's writes.
#[derive(Clone, Default)]
pub struct StepContext {
    store: Arc<RwLock<Map<String, Value>>>,
    cancel: CancelToken,
    deadline: Option<Instant>,
    events: Option<EventBus>,
    pool: PoolConfig,
}

impl StepContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Treat the run as cancelled once `timeout` has elapsed from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.store.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.store.write().await.insert(key.into(), value.into());
    }

    pub async fn remove(&self, key: &str) -> Option<Value> {
        self.store.write().await.remove(key)
    }

    /// Copy of the whole store, for template rendering.
    pub async fn snapshot(&self) -> Map<String, Value> {
        self.store.read().await.clone()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves on cancellation or when the deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    pub fn pool(&self) -> PoolConfig {
        self.pool
    }

    /// Call options carrying this context's cancel token.
    pub fn call_options(&self) -> CallOptions {
        CallOptions::new().with_cancel(self.cancel.clone())
    }

    pub fn emit(&self, event: Event) {
        if let Some(bus) = &self.events {
            bus.emit(event);
        }
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_store_is_shared_between_clones() {
        let ctx = StepContext::new();
        let clone = ctx.clone();
        ctx.set("x", 1).await;
        assert_eq!(clone.get("x").await, Some(json!(1)));
        assert_eq!(clone.remove("x").await, Some(json!(1)));
        assert_eq!(ctx.get("x").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_counts_as_cancelled() {
        let ctx = StepContext::new().with_timeout(Duration::from_secs(2));
        assert!(!ctx.is_cancelled());
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
        assert!(!ctx.cancel_token().is_cancelled());
    }

    #[test]
    fn test_call_options_share_token() {
        let ctx = StepContext::new();
        let options = ctx.call_options();
        ctx.cancel_token().cancel();
        assert!(options.cancel.unwrap().is_cancelled());
    }
}
