//! Plan file: targets, stages and the calls each stage makes.

use anyhow::{bail, Context, Result};
use orchestrator::{ExecutionMode, MonitorConfig, PoolConfig, RestCallSpec};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use transport::{ClientConfig, Credentials};

/// One remote endpoint as written in the plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Identifier used in results. Defaults to the address.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// Environment variable holding the password.
    #[serde(default)]
    pub password_env: Option<String>,
    /// Values available to `{{name}}` placeholders in calls to this target.
    #[serde(default)]
    pub vars: Map<String, Value>,
    #[serde(flatten)]
    pub client: ClientConfig,
}

impl TargetSpec {
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.client.address)
    }

    /// Client configuration with the password pulled from the environment.
    pub fn resolve(&self) -> Result<ClientConfig> {
        let mut config = self.client.clone();
        if let Some(username) = &self.username {
            let password = match &self.password_env {
                Some(var) => std::env::var(var)
                    .with_context(|| format!("{}: environment variable {} is not set", self.id(), var))?,
                None => String::new(),
            };
            config.credentials = Some(Credentials::new(username.clone(), password));
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageTarget {
    #[default]
    Manager,
    Clusters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    /// How the calls of this stage run relative to each other.
    #[serde(default)]
    pub mode: ExecutionMode,
    #[serde(default)]
    pub target: StageTarget,
    /// How each cluster call is spread across clusters.
    #[serde(default = "parallel")]
    pub fan_out: ExecutionMode,
    #[serde(default)]
    pub calls: Vec<RestCallSpec>,
}

fn parallel() -> ExecutionMode {
    ExecutionMode::Parallel
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub manager: Option<TargetSpec>,
    #[serde(default)]
    pub clusters: Vec<TargetSpec>,
    #[serde(default)]
    pub stages: Vec<StageSpec>,
    /// Applied to every call that does not set its own `[monitor]`.
    #[serde(default)]
    pub monitor: Option<MonitorConfig>,
    #[serde(default)]
    pub pool_size: Option<usize>,
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid plan {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut plan: Plan = toml::from_str(content)?;
        if let Some(monitor) = plan.monitor {
            for call in plan.stages.iter_mut().flat_map(|s| s.calls.iter_mut()) {
                if call.monitor == MonitorConfig::default() {
                    call.monitor = monitor;
                }
            }
        }
        Ok(plan)
    }

    pub fn pool(&self) -> PoolConfig {
        self.pool_size
            .map(PoolConfig::with_size)
            .unwrap_or_default()
    }

    /// Structural checks that need no network access.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            bail!("plan has no stages");
        }

        let mut ids = HashSet::new();
        for cluster in &self.clusters {
            if !ids.insert(cluster.id()) {
                bail!("duplicate cluster id {}", cluster.id());
            }
        }

        let mut stage_names = HashSet::new();
        for stage in &self.stages {
            if !stage_names.insert(stage.name.as_str()) {
                bail!("duplicate stage name {}", stage.name);
            }
            match stage.target {
                StageTarget::Manager if self.manager.is_none() => {
                    bail!("stage {} targets the manager but no [manager] is defined", stage.name)
                }
                StageTarget::Clusters if self.clusters.is_empty() => {
                    bail!("stage {} targets clusters but no [[clusters]] are defined", stage.name)
                }
                _ => {}
            }
            for call in &stage.calls {
                call.validate()
                    .with_context(|| format!("stage {}", stage.name))?;
            }
        }
        Ok(())
    }

    /// Password variables named in the plan that are unset right now.
    pub fn missing_secrets(&self) -> Vec<String> {
        self.manager
            .iter()
            .chain(self.clusters.iter())
            .filter_map(|t| t.password_env.clone())
            .filter(|var| std::env::var(var).is_err())
            .collect()
    }
}
