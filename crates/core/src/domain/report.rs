use serde::{Deserialize, Serialize};

use super::status::{ResultNode, ResultTree, Status, StatusSummary};

/// What one orchestrated unit leaves behind once it has run.
///
/// Only the owner writes to a report; its parent reads it after the owner's
/// `execute`/`verify` calls have returned.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepReport {
    pub exceptions: Vec<String>,
    pub results: ResultTree,
}

impl StepReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exception(&mut self, message: impl Into<String>) {
        self.exceptions.push(message.into());
    }

    pub fn set_result(&mut self, key: impl Into<String>, node: impl Into<ResultNode>) {
        self.results.insert(key, node);
    }

    /// Seed `key` with the pre-check sentinel unless it already holds a value.
    pub fn seed_unverified(&mut self, key: &str) {
        if !self.results.contains_key(key) {
            self.results.insert(key, Status::CantVerify);
        }
    }

    /// Fold a child's report into this one.
    pub fn absorb(&mut self, child: StepReport) {
        self.exceptions.extend(child.exceptions);
        self.results.merge(child.results);
    }

    pub fn has_exceptions(&self) -> bool {
        !self.exceptions.is_empty()
    }
}

/// Final output of a run, as handed back to the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunReport {
    pub results: ResultTree,
    pub exceptions: Vec<String>,
    pub summary: StatusSummary,
}

impl RunReport {
    /// A clean run recorded no exceptions and every leaf passed.
    pub fn is_clean(&self) -> bool {
        self.exceptions.is_empty() && self.results.all_passed()
    }
}

impl From<StepReport> for RunReport {
    fn from(report: StepReport) -> Self {
        let summary = report.results.summary();
        Self {
            results: report.results,
            exceptions: report.exceptions,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seed_does_not_overwrite() {
        let mut report = StepReport::new();
        report.set_result("subnet", Status::Pass);
        report.seed_unverified("subnet");
        report.seed_unverified("bucket");
        assert_eq!(report.results.status("subnet"), Some(Status::Pass));
        assert_eq!(report.results.status("bucket"), Some(Status::CantVerify));
    }

    #[test]
    fn test_absorb_concatenates_exceptions() {
        let mut parent = StepReport::new();
        parent.record_exception("first");

        let mut child = StepReport::new();
        child.record_exception("second");
        child.set_result("x", Status::Fail);

        parent.absorb(child);
        assert_eq!(parent.exceptions, vec!["first", "second"]);
        assert_eq!(parent.results.status("x"), Some(Status::Fail));
    }

    #[test]
    fn test_run_report_clean() {
        let mut report = StepReport::new();
        report.set_result("x", Status::Pass);
        let run: RunReport = report.clone().into();
        assert!(run.is_clean());
        assert_eq!(run.summary.pass, 1);

        report.record_exception("boom");
        let run: RunReport = report.into();
        assert!(!run.is_clean());
    }
}
