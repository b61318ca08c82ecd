mod report;
mod status;

pub use report::{RunReport, StepReport};
pub use status::{ResultNode, ResultTree, Status, StatusSummary};
