//! Completion monitor: poll a status endpoint until a set of asynchronous
//! operations has resolved, failed, or run out of time.
//!
//! The loop itself knows nothing about the server. A [`StatusCheck`]
//! strategy turns a chunk of pending identifiers into per-identifier
//! statuses; identifiers it omits simply stay pending.

mod resource_state;
mod task_list;

pub use resource_state::ResourceStateCheck;
pub use task_list::TaskListCheck;

use async_trait::async_trait;
use events::Event;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use transport::{duration_secs, ClientError};

use crate::context::StepContext;
use crate::error::StepError;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1800);
const DEFAULT_CHUNK_SIZE: usize = 100;

/// Polling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(with = "duration_secs")]
    pub interval: Duration,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Upper bound on identifiers sent in one status query.
    pub chunk_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl MonitorConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            ..Self::default()
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

/// Server-side status of one tracked operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Pending,
    Running,
    Succeeded,
    Failed(String),
}

#[async_trait]
pub trait StatusCheck: Send + Sync {
    /// Short label used in logs and events.
    fn label(&self) -> String;

    /// Query the status of `ids` (at most one chunk).
    async fn check(
        &self,
        ids: &[String],
        ctx: &StepContext,
    ) -> Result<Vec<(String, ItemStatus)>, ClientError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl MonitorState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::TimedOut => "TIMED_OUT",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// How a monitor resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorOutcome {
    pub state: MonitorState,
    pub detail: Option<String>,
    pub succeeded: Vec<String>,
    pub failed: BTreeMap<String, String>,
    pub elapsed: Duration,
}

impl MonitorOutcome {
    pub fn is_success(&self) -> bool {
        self.state == MonitorState::Succeeded
    }

    /// `(failure detail, succeeded)`.
    pub fn into_parts(self) -> (Option<String>, bool) {
        let succeeded = self.is_success();
        (self.detail, succeeded)
    }

    /// Map to a [`StepError`] unless the monitor succeeded.
    pub fn into_result(self) -> Result<Vec<String>, StepError> {
        let detail = self.detail.unwrap_or_default();
        match self.state {
            MonitorState::Succeeded => Ok(self.succeeded),
            MonitorState::TimedOut => Err(StepError::MonitorTimedOut { detail }),
            MonitorState::Cancelled => Err(StepError::Cancelled(detail)),
            _ => Err(StepError::MonitorFailed { detail }),
        }
    }
}

enum Wake {
    Polled,
    Cancelled,
    Deadline,
}

/// Tracks one set of operation identifiers through to a terminal state.
pub struct CompletionMonitor<C> {
    check: C,
    config: MonitorConfig,
    state: MonitorState,
    pending: BTreeSet<String>,
    succeeded: BTreeSet<String>,
    failed: BTreeMap<String, String>,
    last_error: Option<String>,
}

impl<C: StatusCheck> CompletionMonitor<C> {
    pub fn new<I, S>(check: C, ids: I, config: MonitorConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            check,
            config,
            state: MonitorState::Pending,
            pending: ids.into_iter().map(Into::into).collect(),
            succeeded: BTreeSet::new(),
            failed: BTreeMap::new(),
            last_error: None,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn pending(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    /// Poll until every identifier resolves, the timeout passes, or the
    /// context is cancelled. The timeout and cancellation also interrupt a
    /// status check that is still in flight.
    pub async fn monitor(mut self, ctx: &StepContext) -> MonitorOutcome {
        let label = self.check.label();
        let started = Instant::now();
        let deadline = started + self.config.timeout;
        info!(
            monitor = %label,
            ids = self.pending.len(),
            interval = ?self.config.interval,
            timeout = ?self.config.timeout,
            "Waiting for operations"
        );

        loop {
            if ctx.is_cancelled() {
                return self.finish(&label, MonitorState::Cancelled, started, ctx);
            }

            let wake = tokio::select! {
                biased;
                _ = self.poll(&label, ctx) => Wake::Polled,
                _ = ctx.cancelled() => Wake::Cancelled,
                _ = tokio::time::sleep_until(deadline) => Wake::Deadline,
            };
            match wake {
                Wake::Polled => {}
                Wake::Cancelled => {
                    return self.finish(&label, MonitorState::Cancelled, started, ctx);
                }
                Wake::Deadline => {
                    warn!(monitor = %label, "Status check still running at the deadline");
                    return self.finish(&label, MonitorState::TimedOut, started, ctx);
                }
            }

            if self.pending.is_empty() {
                let state = if self.failed.is_empty() {
                    MonitorState::Succeeded
                } else {
                    MonitorState::Failed
                };
                return self.finish(&label, state, started, ctx);
            }

            let elapsed = started.elapsed();
            if elapsed >= self.config.timeout {
                return self.finish(&label, MonitorState::TimedOut, started, ctx);
            }

            let nap = self.config.interval.min(self.config.timeout - elapsed);
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = ctx.cancelled() => {
                    return self.finish(&label, MonitorState::Cancelled, started, ctx);
                }
            }
        }
    }

    async fn poll(&mut self, label: &str, ctx: &StepContext) {
        self.state = MonitorState::Running;
        let ids: Vec<String> = self.pending.iter().cloned().collect();
        let mut chunk_failed = false;

        for chunk in ids.chunks(self.config.chunk_size.max(1)) {
            match self.check.check(chunk, ctx).await {
                Ok(statuses) => {
                    for (id, status) in statuses {
                        self.fold(id, status);
                    }
                }
                Err(e) => {
                    warn!(monitor = %label, error = %e, "Status check failed, will retry");
                    self.last_error = Some(e.to_string());
                    chunk_failed = true;
                }
            }
        }
        if !chunk_failed {
            self.last_error = None;
        }

        debug!(
            monitor = %label,
            pending = self.pending.len(),
            succeeded = self.succeeded.len(),
            failed = self.failed.len(),
            "Polled"
        );
        ctx.emit(Event::MonitorPolled {
            monitor: label.to_string(),
            pending: self.pending.len(),
            succeeded: self.succeeded.len(),
            failed: self.failed.len(),
        });
    }

    fn fold(&mut self, id: String, status: ItemStatus) {
        if !self.pending.contains(&id) {
            return;
        }
        match status {
            ItemStatus::Pending | ItemStatus::Running => {}
            ItemStatus::Succeeded => {
                self.pending.remove(&id);
                self.succeeded.insert(id);
            }
            ItemStatus::Failed(detail) => {
                self.pending.remove(&id);
                self.failed.insert(id, detail);
            }
        }
    }

    fn finish(
        self,
        label: &str,
        state: MonitorState,
        started: Instant,
        ctx: &StepContext,
    ) -> MonitorOutcome {
        let elapsed = started.elapsed();
        let detail = match state {
            MonitorState::Succeeded => None,
            MonitorState::Failed => Some(self.failure_detail()),
            MonitorState::TimedOut => {
                let mut detail = format!(
                    "Operation timed out after {:?}: {} didn't happen in the prescribed timeframe",
                    self.config.timeout,
                    self.pending_list()
                );
                if let Some(error) = &self.last_error {
                    detail.push_str(&format!(" (last status check error: {})", error));
                }
                if !self.failed.is_empty() {
                    detail.push_str(&format!("; also failed: {}", self.failure_detail()));
                }
                Some(detail)
            }
            MonitorState::Cancelled => Some(format!(
                "Cancelled while waiting for {}",
                self.pending_list()
            )),
            MonitorState::Pending | MonitorState::Running => None,
        };

        match state {
            MonitorState::Succeeded => info!(monitor = %label, ?elapsed, "Operations succeeded"),
            _ => warn!(monitor = %label, state = %state, ?elapsed, "Operations did not succeed"),
        }
        ctx.emit(Event::MonitorResolved {
            monitor: label.to_string(),
            state: state.to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
        });

        MonitorOutcome {
            state,
            detail,
            succeeded: self.succeeded.into_iter().collect(),
            failed: self.failed,
            elapsed,
        }
    }

    fn failure_detail(&self) -> String {
        self.failed
            .iter()
            .map(|(id, detail)| format!("{}: {}", id, detail))
            .collect::<Vec<_>>()
            .join("; ")
    }

    fn pending_list(&self) -> String {
        self.pending.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::CancelToken;
    use std::sync::Mutex;
    use transport::TransportError;

    /// Scripted check: every id resolves to a fixed status after a number
    /// of polls.
    struct Scripted {
        plan: BTreeMap<String, (usize, ItemStatus)>,
        polls: Mutex<BTreeMap<String, usize>>,
        queries: Mutex<Vec<(Instant, Vec<String>)>>,
        flaky_first: bool,
        broken_id: Option<&'static str>,
    }

    impl Scripted {
        fn new(plan: &[(&str, usize, ItemStatus)]) -> Self {
            Self {
                plan: plan
                    .iter()
                    .map(|(id, after, status)| (id.to_string(), (*after, status.clone())))
                    .collect(),
                polls: Mutex::new(BTreeMap::new()),
                queries: Mutex::new(Vec::new()),
                flaky_first: false,
                broken_id: None,
            }
        }

        fn queries(&self) -> Vec<(Instant, Vec<String>)> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl<'a> StatusCheck for &'a Scripted {
        fn label(&self) -> String {
            "scripted".to_string()
        }

        async fn check(
            &self,
            ids: &[String],
            _ctx: &StepContext,
        ) -> Result<Vec<(String, ItemStatus)>, ClientError> {
            let first = {
                let mut queries = self.queries.lock().unwrap();
                queries.push((Instant::now(), ids.to_vec()));
                queries.len() == 1
            };
            if self.broken_id.is_some_and(|broken| ids.iter().any(|id| id == broken)) {
                return Err(TransportError::Http {
                    status: 500,
                    body: serde_json::Value::Null,
                }
                .into());
            }
            if self.flaky_first && first {
                return Err(TransportError::Connection {
                    message: "connection reset".to_string(),
                }
                .into());
            }

            let mut polls = self.polls.lock().unwrap();
            Ok(ids
                .iter()
                .map(|id| {
                    let seen = polls.entry(id.clone()).or_default();
                    *seen += 1;
                    let status = match self.plan.get(id) {
                        Some((after, status)) if *seen >= *after => status.clone(),
                        _ => ItemStatus::Running,
                    };
                    (id.clone(), status)
                })
                .collect())
        }
    }

    fn config(interval: u64, timeout: u64) -> MonitorConfig {
        MonitorConfig::new(Duration::from_secs(interval), Duration::from_secs(timeout))
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_outcome_reports_failure_detail() {
        let check = Scripted::new(&[
            ("t1", 1, ItemStatus::Succeeded),
            ("t2", 2, ItemStatus::Succeeded),
            ("t3", 2, ItemStatus::Failed("disk full".to_string())),
        ]);

        let outcome = CompletionMonitor::new(&check, ["t1", "t2", "t3"], config(1, 60))
            .monitor(&StepContext::new())
            .await;

        assert_eq!(outcome.state, MonitorState::Failed);
        assert_eq!(outcome.succeeded, vec!["t1", "t2"]);
        let (detail, ok) = outcome.into_parts();
        assert!(!ok);
        assert_eq!(detail.as_deref(), Some("t3: disk full"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_succeed() {
        let check = Scripted::new(&[
            ("a", 1, ItemStatus::Succeeded),
            ("b", 1, ItemStatus::Succeeded),
            ("c", 3, ItemStatus::Succeeded),
        ]);

        let outcome = CompletionMonitor::new(&check, ["a", "b", "c"], config(1, 60))
            .monitor(&StepContext::new())
            .await;

        assert_eq!(outcome.clone().into_parts(), (None, true));
        assert_eq!(outcome.elapsed, Duration::from_secs(2));
        assert_eq!(outcome.into_result().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_resolving_item_times_out() {
        let check = Scripted::new(&[]);
        let started = Instant::now();

        let outcome = CompletionMonitor::new(&check, ["stuck"], config(1, 3))
            .monitor(&StepContext::new())
            .await;

        assert_eq!(outcome.state, MonitorState::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert!(outcome
            .detail
            .as_deref()
            .unwrap()
            .contains("didn't happen in the prescribed timeframe"));

        let offsets: Vec<u64> = check
            .queries()
            .iter()
            .map(|(at, _)| (*at - started).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 1, 2, 3]);
        assert!(outcome.into_result().unwrap_err().is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_ids_are_not_queried_again() {
        let check = Scripted::new(&[
            ("done", 1, ItemStatus::Succeeded),
            ("bad", 1, ItemStatus::Failed("boom".to_string())),
            ("slow", 3, ItemStatus::Succeeded),
        ]);

        CompletionMonitor::new(&check, ["done", "bad", "slow"], config(1, 60))
            .monitor(&StepContext::new())
            .await;

        let queried: Vec<Vec<String>> = check.queries().into_iter().map(|(_, ids)| ids).collect();
        assert_eq!(queried[0], vec!["bad", "done", "slow"]);
        assert_eq!(queried[1], vec!["slow"]);
        assert_eq!(queried[2], vec!["slow"]);
        assert_eq!(queried.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ids_are_chunked() {
        let ids: Vec<String> = (0..250).map(|i| format!("task-{:03}", i)).collect();
        let plan: Vec<(&str, usize, ItemStatus)> = ids
            .iter()
            .map(|id| (id.as_str(), 1, ItemStatus::Succeeded))
            .collect();
        let check = Scripted::new(&plan);

        let outcome = CompletionMonitor::new(&check, ids.clone(), config(1, 60))
            .monitor(&StepContext::new())
            .await;

        assert!(outcome.is_success());
        let sizes: Vec<usize> = check.queries().iter().map(|(_, ids)| ids.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_check_error_is_retried() {
        let mut check = Scripted::new(&[("a", 1, ItemStatus::Succeeded)]);
        check.flaky_first = true;

        let outcome = CompletionMonitor::new(&check, ["a"], config(1, 60))
            .monitor(&StepContext::new())
            .await;

        assert!(outcome.is_success());
        assert_eq!(check.queries().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_sleep() {
        let check = Scripted::new(&[]);
        let cancel = CancelToken::new();
        let ctx = StepContext::new().with_cancel(cancel.clone());

        let trigger = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let outcome = CompletionMonitor::new(&check, ["x"], config(5, 60))
            .monitor(&ctx)
            .await;
        trigger.await.unwrap();

        assert_eq!(outcome.state, MonitorState::Cancelled);
        assert_eq!(started.elapsed(), Duration::from_millis(1500));
        assert!(matches!(outcome.into_result(), Err(StepError::Cancelled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_in_one_chunk_survives_a_later_good_chunk() {
        let mut check = Scripted::new(&[]);
        check.broken_id = Some("a");

        let outcome = CompletionMonitor::new(&check, ["a", "b"], config(1, 2).with_chunk_size(1))
            .monitor(&StepContext::new())
            .await;

        assert_eq!(outcome.state, MonitorState::TimedOut);
        let detail = outcome.detail.unwrap();
        assert!(detail.contains("last status check error"), "{detail}");
        assert!(detail.contains("500"), "{detail}");
    }

    struct Hanging;

    #[async_trait]
    impl StatusCheck for Hanging {
        fn label(&self) -> String {
            "hanging".to_string()
        }

        async fn check(
            &self,
            _ids: &[String],
            _ctx: &StepContext,
        ) -> Result<Vec<(String, ItemStatus)>, ClientError> {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_holds_while_a_check_hangs() {
        let started = Instant::now();

        let outcome = CompletionMonitor::new(Hanging, ["t1"], config(1, 3))
            .monitor(&StepContext::new())
            .await;

        assert_eq!(outcome.state, MonitorState::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert!(outcome
            .detail
            .unwrap()
            .contains("t1 didn't happen in the prescribed timeframe"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_a_hanging_check() {
        let cancel = CancelToken::new();
        let ctx = StepContext::new().with_cancel(cancel.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            cancel.cancel();
        });

        let outcome = CompletionMonitor::new(Hanging, ["t1"], config(1, 60))
            .monitor(&ctx)
            .await;

        assert_eq!(outcome.state, MonitorState::Cancelled);
        assert_eq!(outcome.elapsed, Duration::from_secs(2));
    }
}
