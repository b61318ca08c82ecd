//! Turn a plan into a tree of batches.

use anyhow::{Context, Result};
use orchestrator::{Batch, FanOut, RestCallAction, RestCallStep, Step, Target};
use serde_json::{Map, Value};
use transport::TransportClient;

use crate::plan::{Plan, StageSpec, StageTarget, TargetSpec};

struct Endpoint {
    id: String,
    client: TransportClient,
    vars: Map<String, Value>,
}

fn connect(spec: &TargetSpec) -> Result<Endpoint> {
    let config = spec.resolve()?;
    let client = TransportClient::new(config)
        .with_context(|| format!("Failed to build client for {}", spec.id()))?;
    Ok(Endpoint {
        id: spec.id().to_string(),
        client,
        vars: spec.vars.clone(),
    })
}

/// A sequential root batch with one keyed child batch per stage. Clients are
/// built once per target and shared by every call to that target.
pub fn build(plan: &Plan) -> Result<Batch> {
    let manager = plan.manager.as_ref().map(connect).transpose()?;
    let clusters = plan
        .clusters
        .iter()
        .map(connect)
        .collect::<Result<Vec<_>>>()?;

    let stages = plan
        .stages
        .iter()
        .map(|stage| {
            build_stage(stage, manager.as_ref(), &clusters).map(|b| Box::new(b) as Box<dyn Step>)
        })
        .collect::<Result<Vec<_>>>()?;

    let mut root = Batch::sequential("plan");
    root.add_all(stages);
    Ok(root)
}

fn build_stage(
    stage: &StageSpec,
    manager: Option<&Endpoint>,
    clusters: &[Endpoint],
) -> Result<Batch> {
    let mut batch = Batch::new(stage.name.clone(), stage.mode).with_key(stage.name.clone());

    match stage.target {
        StageTarget::Manager => {
            let manager = manager
                .with_context(|| format!("stage {} targets the manager but none is defined", stage.name))?;
            for call in &stage.calls {
                let step = RestCallStep::new(call.clone(), manager.client.clone())
                    .with_vars(manager.vars.clone());
                batch.add(step);
            }
        }
        StageTarget::Clusters => {
            for call in &stage.calls {
                let targets = clusters
                    .iter()
                    .map(|c| Target::new(c.id.clone(), c.client.clone(), c.vars.clone()));
                let fan_out = FanOut::new(RestCallAction::new(call.clone()), targets)?
                    .with_mode(stage.fan_out)
                    .with_key(call.name.clone());
                batch.add(fan_out);
            }
        }
    }
    Ok(batch)
}
