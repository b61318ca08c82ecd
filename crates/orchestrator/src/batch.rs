//! Batch scheduler: an ordered list of child steps run one after another or
//! all at once, with their reports merged into one.

use async_trait::async_trait;
use conductor_core::StepReport;
use events::Event;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::context::StepContext;
use crate::pool::{panic_message, WorkerPool};
use crate::step::{run_step, Step};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// A child stays owned by its batch while a worker runs it, so an aborted
/// run never takes children with it.
type Child = Arc<Mutex<Box<dyn Step>>>;

/// Children of a parallel batch must not read each other's writes to the
/// context store. Put a producer in an earlier sequential stage instead.
pub struct Batch {
    name: String,
    mode: ExecutionMode,
    key: Option<String>,
    children: Vec<Child>,
    report: StepReport,
}

impl Batch {
    pub fn new(name: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            name: name.into(),
            mode,
            key: None,
            children: Vec::new(),
            report: StepReport::new(),
        }
    }

    pub fn sequential(name: impl Into<String>) -> Self {
        Self::new(name, ExecutionMode::Sequential)
    }

    pub fn parallel(name: impl Into<String>) -> Self {
        Self::new(name, ExecutionMode::Parallel)
    }

    /// Nest this batch's merged results under `key`.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_step(mut self, step: impl Step + 'static) -> Self {
        self.add(step);
        self
    }

    pub fn add(&mut self, step: impl Step + 'static) -> &mut Self {
        self.add_boxed(Box::new(step))
    }

    pub fn add_boxed(&mut self, step: Box<dyn Step>) -> &mut Self {
        self.children.push(Arc::new(Mutex::new(step)));
        self
    }

    /// Append `steps` after the existing children, keeping their order.
    pub fn add_all<I>(&mut self, steps: I) -> &mut Self
    where
        I: IntoIterator<Item = Box<dyn Step>>,
    {
        self.children
            .extend(steps.into_iter().map(|step| Arc::new(Mutex::new(step))));
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Child names in insertion order. Waits for any child still held by a
    /// worker.
    pub async fn child_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.children.len());
        for child in &self.children {
            names.push(child.lock().await.name());
        }
        names
    }

    /// Run every child (execute, then verify) and return the merged report.
    ///
    /// A child's own failures never stop its siblings. Failures of the
    /// dispatch itself (a panicking child, a skipped child) land in this
    /// batch's exception list next to the children's. Dropping the returned
    /// future aborts any child still running in parallel mode.
    pub async fn run(&mut self, ctx: &StepContext) -> &StepReport {
        info!(
            batch = %self.name,
            mode = ?self.mode,
            children = self.children.len(),
            "Running batch"
        );

        let mut report = StepReport::new();
        match self.mode {
            ExecutionMode::Sequential => self.run_sequential(ctx, &mut report).await,
            ExecutionMode::Parallel => self.run_parallel(ctx, &mut report).await,
        }

        if let Some(key) = &self.key {
            if !report.results.is_empty() {
                report.results = std::mem::take(&mut report.results).nest_under(key.clone());
            }
        }

        if report.has_exceptions() {
            warn!(
                batch = %self.name,
                exceptions = report.exceptions.len(),
                "Batch finished with exceptions"
            );
        }
        self.report = report;
        &self.report
    }

    async fn run_sequential(&self, ctx: &StepContext, report: &mut StepReport) {
        for child in &self.children {
            let mut child = child.lock().await;
            if ctx.is_cancelled() {
                skip(&self.name, child.name(), ctx, report);
                continue;
            }

            let outcome = AssertUnwindSafe(run_step(&mut **child, ctx))
                .catch_unwind()
                .await;
            match outcome {
                Ok(()) => report.absorb(child.report().clone()),
                Err(panic) => {
                    let message = format!("{}: panicked: {}", child.name(), panic_message(&*panic));
                    error!(batch = %self.name, "{}", message);
                    dispatch_failed(&self.name, message, ctx, report);
                }
            }
        }
    }

    async fn run_parallel(&self, ctx: &StepContext, report: &mut StepReport) {
        let mut pool = WorkerPool::new(ctx.pool());
        let mut names = Vec::with_capacity(self.children.len());

        for (index, child) in self.children.iter().enumerate() {
            let name = child.lock().await.name();
            names.push(name.clone());
            if ctx.is_cancelled() {
                skip(&self.name, name, ctx, report);
                continue;
            }

            let child = child.clone();
            let ctx = ctx.clone();
            pool.spawn(index, format!("{}-{}", self.name, name), async move {
                let mut child = child.lock_owned().await;
                run_step(&mut **child, &ctx).await;
            });
        }

        let joined = pool.join().await;
        for failure in joined.failures {
            let message = format!("worker lost: {}", failure);
            error!(batch = %self.name, "{}", message);
            dispatch_failed(&self.name, message, ctx, report);
        }
        for (index, result) in joined.completed {
            match result {
                Ok(()) => report.absorb(self.children[index].lock().await.report().clone()),
                Err(panic) => {
                    let message = format!("{}: panicked: {}", names[index], panic);
                    error!(batch = %self.name, "{}", message);
                    dispatch_failed(&self.name, message, ctx, report);
                }
            }
        }
    }
}

fn skip(parent: &str, step: String, ctx: &StepContext, report: &mut StepReport) {
    warn!(batch = %parent, step = %step, "Run cancelled, skipping");
    report.record_exception(format!("{}: skipped, run cancelled", step));
    ctx.emit(Event::StepSkipped {
        parent: parent.to_string(),
        step,
        reason: "cancelled".to_string(),
    });
}

fn dispatch_failed(parent: &str, message: String, ctx: &StepContext, report: &mut StepReport) {
    ctx.emit(Event::Error {
        message: message.clone(),
        context: Some(parent.to_string()),
    });
    report.record_exception(message);
}

#[async_trait]
impl Step for Batch {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn execute(&mut self, ctx: &StepContext) {
        self.run(ctx).await;
    }

    fn report(&self) -> &StepReport {
        &self.report
    }

    fn report_mut(&mut self) -> &mut StepReport {
        &mut self.report
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("key", &self.key)
            .field("children", &self.children.len())
            .finish()
    }
}
