//! Declarative single-request step.
//!
//! Sends one templated request, optionally waits for the task it started,
//! stores selected response fields in the context, and verifies by reading
//! a resource back and comparing fields.

use async_trait::async_trait;
use conductor_core::{ResultNode, ResultTree, Status, StepReport};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};
use transport::{Method, TransportClient};

use crate::context::StepContext;
use crate::error::{OrchestratorError, StepError};
use crate::fan_out::{Target, TargetAction};
use crate::monitor::{CompletionMonitor, MonitorConfig, TaskListCheck};
use crate::step::Step;

use super::template::{render, render_text};

fn default_method() -> String {
    "POST".to_string()
}

/// Read-back check run by `verify`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifySpec {
    pub path: String,
    /// JSON pointer into the GET response mapped to the expected value.
    /// Empty means the GET succeeding is enough.
    #[serde(default)]
    pub expect: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestCallSpec {
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub body: Option<Value>,
    /// Pointer to a task UUID (or an array of them) in the response.
    #[serde(default)]
    pub task_pointer: Option<String>,
    /// Task list endpoint used to poll that task. Defaults to `tasks/list`.
    #[serde(default)]
    pub task_list_path: Option<String>,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub verify: Option<VerifySpec>,
    /// Context key mapped to a pointer into the response.
    #[serde(default)]
    pub capture: BTreeMap<String, String>,
}

impl RestCallSpec {
    pub fn new(name: impl Into<String>, method: &str, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method: method.to_string(),
            path: path.into(),
            body: None,
            task_pointer: None,
            task_list_path: None,
            monitor: MonitorConfig::default(),
            verify: None,
            capture: BTreeMap::new(),
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_task(mut self, pointer: impl Into<String>, monitor: MonitorConfig) -> Self {
        self.task_pointer = Some(pointer.into());
        self.monitor = monitor;
        self
    }

    pub fn with_capture(mut self, key: impl Into<String>, pointer: impl Into<String>) -> Self {
        self.capture.insert(key.into(), pointer.into());
        self
    }

    pub fn with_verify(mut self, verify: VerifySpec) -> Self {
        self.verify = Some(verify);
        self
    }

    pub fn http_method(&self) -> Result<Method, StepError> {
        Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| StepError::failed(format!("unknown HTTP method {:?}", self.method)))
    }

    /// Reject a call that could never be sent or whose pointers could never
    /// match a response.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::MissingConfig("name".to_string()));
        }
        if self.path.trim().is_empty() {
            return Err(OrchestratorError::MissingConfig(format!("{}: path", self.name)));
        }
        if let Err(e) = self.http_method() {
            return Err(OrchestratorError::InvalidConfig(format!("{}: {}", self.name, e)));
        }

        let pointers = self
            .task_pointer
            .iter()
            .map(|p| ("task_pointer", p))
            .chain(self.capture.values().map(|p| ("capture", p)))
            .chain(
                self.verify
                    .iter()
                    .flat_map(|v| v.expect.keys())
                    .map(|p| ("verify.expect", p)),
            );
        for (field, pointer) in pointers {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                return Err(OrchestratorError::InvalidConfig(format!(
                    "{}: {} {:?} is not a JSON pointer",
                    self.name, field, pointer
                )));
            }
        }

        if self.monitor.interval.is_zero() {
            return Err(OrchestratorError::InvalidConfig(format!(
                "{}: monitor interval must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// Context store overlaid with target variables.
async fn variables(ctx: &StepContext, target_vars: &Map<String, Value>) -> Map<String, Value> {
    let mut vars = ctx.snapshot().await;
    for (key, value) in target_vars {
        vars.insert(key.clone(), value.clone());
    }
    vars
}

fn pointer<'a>(body: &'a Value, pointer: &str) -> Result<&'a Value, StepError> {
    body.pointer(pointer).ok_or_else(|| StepError::MissingField {
        pointer: pointer.to_string(),
    })
}

async fn perform(
    spec: &RestCallSpec,
    client: &TransportClient,
    target_vars: &Map<String, Value>,
    capture_prefix: Option<&str>,
    ctx: &StepContext,
) -> Result<(), StepError> {
    let vars = variables(ctx, target_vars).await;
    let method = spec.http_method()?;
    let path = render_text(&spec.path, &vars)?;
    let body = spec.body.as_ref().map(|b| render(b, &vars)).transpose()?;

    info!(step = %spec.name, method = %method, path = %path, "Calling");
    let response = client
        .request(method, &path, body, &ctx.call_options())
        .await?;

    for (key, at) in &spec.capture {
        let value = pointer(&response, at)?.clone();
        let key = match capture_prefix {
            Some(prefix) => format!("{}.{}", prefix, key),
            None => key.clone(),
        };
        debug!(step = %spec.name, key = %key, "Captured response field");
        ctx.set(key, value).await;
    }

    if let Some(at) = &spec.task_pointer {
        let tasks = match pointer(&response, at)? {
            Value::String(id) => vec![id.clone()],
            Value::Array(ids) => ids
                .iter()
                .filter_map(|id| id.as_str().map(str::to_string))
                .collect(),
            _ => {
                return Err(StepError::MissingField {
                    pointer: at.clone(),
                })
            }
        };

        let mut check = TaskListCheck::new(client.clone());
        if let Some(path) = &spec.task_list_path {
            check = check.with_path(path.clone());
        }
        CompletionMonitor::new(check, tasks, spec.monitor)
            .monitor(ctx)
            .await
            .into_result()?;
    }

    Ok(())
}

async fn check(
    spec: &RestCallSpec,
    client: &TransportClient,
    target_vars: &Map<String, Value>,
    ctx: &StepContext,
) -> Result<Option<ResultNode>, StepError> {
    let Some(verify) = &spec.verify else {
        return Ok(None);
    };

    let vars = variables(ctx, target_vars).await;
    let path = render_text(&verify.path, &vars)?;
    let options = ctx.call_options().uncached();
    let body = client.get_with(&path, &options).await?;

    if verify.expect.is_empty() {
        return Ok(Some(Status::Pass.into()));
    }

    let mut results = ResultTree::new();
    for (at, expected) in &verify.expect {
        let expected = render(expected, &vars)?;
        let passed = body.pointer(at) == Some(&expected);
        if !passed {
            debug!(step = %spec.name, pointer = %at, "Value differs from expected");
        }
        results.insert(at.clone(), Status::from_bool(passed));
    }
    Ok(Some(results.into()))
}

/// One request against one client.
pub struct RestCallStep {
    spec: RestCallSpec,
    client: TransportClient,
    vars: Map<String, Value>,
    report: StepReport,
}

impl RestCallStep {
    pub fn new(spec: RestCallSpec, client: TransportClient) -> Self {
        Self {
            spec,
            client,
            vars: Map::new(),
            report: StepReport::new(),
        }
    }

    pub fn with_vars(mut self, vars: Map<String, Value>) -> Self {
        self.vars = vars;
        self
    }

    pub fn spec(&self) -> &RestCallSpec {
        &self.spec
    }
}

#[async_trait]
impl Step for RestCallStep {
    fn name(&self) -> String {
        self.spec.name.clone()
    }

    async fn execute(&mut self, ctx: &StepContext) {
        if let Err(e) = perform(&self.spec, &self.client, &self.vars, None, ctx).await {
            self.report
                .record_exception(format!("{}: {}", self.spec.name, e));
        }
    }

    async fn verify(&mut self, ctx: &StepContext) {
        if self.spec.verify.is_none() {
            return;
        }
        let key = self.spec.name.clone();
        self.report.seed_unverified(&key);

        match check(&self.spec, &self.client, &self.vars, ctx).await {
            Ok(Some(node)) => self.report.set_result(key, node),
            Ok(None) => {}
            Err(e) => self
                .report
                .record_exception(format!("{}: verify: {}", key, e)),
        }
    }

    fn report(&self) -> &StepReport {
        &self.report
    }

    fn report_mut(&mut self) -> &mut StepReport {
        &mut self.report
    }
}

/// The same request sent to every target of a fan-out. Target
/// configuration is a variable map; captured values are stored under
/// `{target}.{key}`.
#[derive(Debug, Clone)]
pub struct RestCallAction {
    spec: RestCallSpec,
}

impl RestCallAction {
    pub fn new(spec: RestCallSpec) -> Self {
        Self { spec }
    }
}

#[async_trait]
impl TargetAction for RestCallAction {
    type Config = Map<String, Value>;

    fn name(&self) -> String {
        self.spec.name.clone()
    }

    async fn execute(
        &self,
        target: &mut Target<Self::Config>,
        ctx: &StepContext,
    ) -> Result<(), StepError> {
        let mut vars = target.config.clone();
        vars.insert("target".to_string(), Value::String(target.id.clone()));
        perform(&self.spec, &target.client, &vars, Some(target.id.as_str()), ctx).await
    }

    async fn verify(
        &self,
        target: &mut Target<Self::Config>,
        ctx: &StepContext,
    ) -> Result<Option<ResultNode>, StepError> {
        let mut vars = target.config.clone();
        vars.insert("target".to_string(), Value::String(target.id.clone()));
        check(&self.spec, &target.client, &vars, ctx).await
    }
}
