//! Fan-out executor: one action applied to many independent targets.
//!
//! Every target is processed in isolation. An error from one target is
//! recorded against that target only; the other targets still run.

use async_trait::async_trait;
use conductor_core::{ResultNode, ResultTree, Status, StepReport};
use events::{Event, Stage};
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use transport::TransportClient;

use crate::batch::ExecutionMode;
use crate::context::StepContext;
use crate::error::{OrchestratorError, Result, StepError};
use crate::pool::{panic_message, WorkerPool};
use crate::step::{short_type_name, Step};

/// One remote endpoint: its identifier (usually the address), an
/// authenticated client, and whatever per-target configuration the action
/// needs.
#[derive(Debug, Clone)]
pub struct Target<C> {
    pub id: String,
    pub client: TransportClient,
    pub config: C,
}

impl<C> Target<C> {
    pub fn new(id: impl Into<String>, client: TransportClient, config: C) -> Self {
        Self {
            id: id.into(),
            client,
            config,
        }
    }
}

/// Per-target logic run by a [`FanOut`].
#[async_trait]
pub trait TargetAction: Send + Sync + 'static {
    type Config: Send + Sync + 'static;

    fn name(&self) -> String {
        short_type_name::<Self>()
    }

    async fn execute(
        &self,
        target: &mut Target<Self::Config>,
        ctx: &StepContext,
    ) -> std::result::Result<(), StepError>;

    /// Check the end state on one target. `Ok(None)` means there is nothing
    /// to report for it.
    async fn verify(
        &self,
        _target: &mut Target<Self::Config>,
        _ctx: &StepContext,
    ) -> std::result::Result<Option<ResultNode>, StepError> {
        Ok(None)
    }
}

/// What happened on one target.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetOutcome {
    pub exceptions: Vec<String>,
    pub result: Option<ResultNode>,
}

impl TargetOutcome {
    pub fn is_ok(&self) -> bool {
        self.exceptions.is_empty()
    }
}

/// The target stays in its slot while a worker holds the lock on it, so a
/// panicking or aborted worker never loses it.
struct Slot<C> {
    id: String,
    target: Arc<Mutex<Target<C>>>,
    outcome: TargetOutcome,
}

pub struct FanOut<A: TargetAction> {
    action: Arc<A>,
    mode: ExecutionMode,
    key: Option<String>,
    slots: Vec<Slot<A::Config>>,
    pool_failures: Vec<String>,
    report: StepReport,
}

impl<A: TargetAction> FanOut<A> {
    /// Targets keep their insertion order. Identifiers must be unique.
    pub fn new<I>(action: A, targets: I) -> Result<Self>
    where
        I: IntoIterator<Item = Target<A::Config>>,
    {
        let mut seen = HashSet::new();
        let mut slots = Vec::new();
        for target in targets {
            if !seen.insert(target.id.clone()) {
                return Err(OrchestratorError::DuplicateTarget(target.id));
            }
            slots.push(Slot {
                id: target.id.clone(),
                target: Arc::new(Mutex::new(target)),
                outcome: TargetOutcome::default(),
            });
        }

        Ok(Self {
            action: Arc::new(action),
            mode: ExecutionMode::Parallel,
            key: None,
            slots,
            pool_failures: Vec::new(),
            report: StepReport::new(),
        })
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn sequential(self) -> Self {
        self.with_mode(ExecutionMode::Sequential)
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn action(&self) -> &A {
        &self.action
    }

    pub fn target_ids(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.id.as_str())
    }

    pub fn outcome(&self, id: &str) -> Option<&TargetOutcome> {
        self.slots.iter().find(|s| s.id == id).map(|s| &s.outcome)
    }

    /// Outcomes in target insertion order.
    pub fn outcomes(&self) -> impl Iterator<Item = (&str, &TargetOutcome)> {
        self.slots.iter().map(|s| (s.id.as_str(), &s.outcome))
    }

    pub async fn execute_all(&mut self, ctx: &StepContext) -> &StepReport {
        self.dispatch(Stage::Execute, ctx).await;
        &self.report
    }

    /// Every target is seeded with `CAN'T VERIFY` before its check runs.
    pub async fn verify_all(&mut self, ctx: &StepContext) -> &StepReport {
        for slot in &mut self.slots {
            slot.outcome.result = Some(Status::CantVerify.into());
        }
        self.dispatch(Stage::Verify, ctx).await;
        &self.report
    }

    async fn dispatch(&mut self, stage: Stage, ctx: &StepContext) {
        let action = self.action.name();
        info!(
            action = %action,
            stage = stage.as_str(),
            targets = self.slots.len(),
            mode = ?self.mode,
            "Fanning out"
        );

        match self.mode {
            ExecutionMode::Sequential => self.dispatch_sequential(&action, stage, ctx).await,
            ExecutionMode::Parallel => self.dispatch_parallel(&action, stage, ctx).await,
        }
        self.rebuild_report();
    }

    async fn dispatch_sequential(&mut self, action: &str, stage: Stage, ctx: &StepContext) {
        for slot in &mut self.slots {
            if ctx.is_cancelled() {
                skip_target(action, slot, ctx);
                continue;
            }

            let result = {
                let mut target = slot.target.lock().await;
                let call = AssertUnwindSafe(call(self.action.as_ref(), stage, &mut *target, ctx));
                match call.catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => Err(panicked(&panic_message(&*panic))),
                }
            };
            settle(action, stage, slot, result, ctx);
        }
    }

    async fn dispatch_parallel(&mut self, action: &str, stage: Stage, ctx: &StepContext) {
        let mut pool = WorkerPool::new(ctx.pool());

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if ctx.is_cancelled() {
                skip_target(action, slot, ctx);
                continue;
            }

            let worker = self.action.clone();
            let target = slot.target.clone();
            let ctx = ctx.clone();
            pool.spawn(index, format!("{}-{}", action, slot.id), async move {
                let mut target = target.lock_owned().await;
                call(worker.as_ref(), stage, &mut *target, &ctx).await
            });
        }

        let joined = pool.join().await;
        for failure in joined.failures {
            error!(action = %action, error = %failure, "Worker lost");
            self.pool_failures
                .push(format!("{}: worker lost: {}", action, failure));
        }
        for (index, result) in joined.completed {
            let result = result.unwrap_or_else(|panic| Err(panicked(&panic)));
            settle(action, stage, &mut self.slots[index], result, ctx);
        }
    }

    fn rebuild_report(&mut self) {
        let mut report = StepReport::new();
        for failure in &self.pool_failures {
            report.record_exception(failure.clone());
        }

        let mut results = ResultTree::new();
        for slot in &self.slots {
            for exception in &slot.outcome.exceptions {
                report.record_exception(exception.clone());
            }
            if let Some(node) = &slot.outcome.result {
                results.insert(slot.id.clone(), node.clone());
            }
        }

        report.results = match &self.key {
            Some(key) if !results.is_empty() => results.nest_under(key.clone()),
            _ => results,
        };
        self.report = report;
    }
}

async fn call<A: TargetAction>(
    action: &A,
    stage: Stage,
    target: &mut Target<A::Config>,
    ctx: &StepContext,
) -> std::result::Result<Option<ResultNode>, StepError> {
    match stage {
        Stage::Execute => action.execute(target, ctx).await.map(|_| None),
        Stage::Verify => action.verify(target, ctx).await,
    }
}

fn settle<C>(
    action: &str,
    stage: Stage,
    slot: &mut Slot<C>,
    result: std::result::Result<Option<ResultNode>, StepError>,
    ctx: &StepContext,
) {
    let error = match result {
        Ok(node) => {
            if stage == Stage::Verify {
                slot.outcome.result = node;
            }
            debug!(action = %action, target = %slot.id, stage = stage.as_str(), "Target done");
            None
        }
        Err(e) => {
            let message = format!("{}: {}: {}", slot.id, action, e);
            warn!(action = %action, target = %slot.id, stage = stage.as_str(), error = %e, "Target failed");
            slot.outcome.exceptions.push(message);
            Some(e.to_string())
        }
    };

    ctx.emit(Event::TargetFinished {
        action: action.to_string(),
        target: slot.id.clone(),
        stage,
        success: error.is_none(),
        error,
    });
}

fn skip_target<C>(action: &str, slot: &mut Slot<C>, ctx: &StepContext) {
    warn!(action = %action, target = %slot.id, "Run cancelled, skipping target");
    slot.outcome
        .exceptions
        .push(format!("{}: {}: skipped, run cancelled", slot.id, action));
    ctx.emit(Event::StepSkipped {
        parent: action.to_string(),
        step: slot.id.clone(),
        reason: "cancelled".to_string(),
    });
}

fn panicked(message: &str) -> StepError {
    StepError::failed(format!("panicked: {}", message))
}

#[async_trait]
impl<A: TargetAction> Step for FanOut<A> {
    fn name(&self) -> String {
        self.action.name()
    }

    async fn execute(&mut self, ctx: &StepContext) {
        self.execute_all(ctx).await;
    }

    async fn verify(&mut self, ctx: &StepContext) {
        self.verify_all(ctx).await;
    }

    fn report(&self) -> &StepReport {
        &self.report
    }

    fn report_mut(&mut self) -> &mut StepReport {
        &mut self.report
    }
}
