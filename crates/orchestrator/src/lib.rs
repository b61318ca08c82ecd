//! Orchestration engine: steps, batches, fan-out across targets and
//! completion monitoring of asynchronous server-side operations.

pub mod batch;
pub mod context;
pub mod error;
pub mod fan_out;
pub mod monitor;
pub mod pool;
pub mod step;
pub mod steps;

pub use batch::{Batch, ExecutionMode};
pub use context::StepContext;
pub use error::{OrchestratorError, Result, StepError};
pub use fan_out::{FanOut, Target, TargetAction, TargetOutcome};
pub use monitor::{
    CompletionMonitor, ItemStatus, MonitorConfig, MonitorOutcome, MonitorState,
    ResourceStateCheck, StatusCheck, TaskListCheck,
};
pub use pool::{PoolConfig, WorkerPool};
pub use step::{run_step, Step};
pub use steps::{RestCallAction, RestCallSpec, RestCallStep, VerifySpec};
