use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, BTreeMap};
use std::fmt;

use crate::error::CoreError;

/// Outcome of verifying one item.
///
/// `CantVerify` is the pre-check sentinel: it is what a result holds before
/// the real check ran, and it stays there when the check itself failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
    #[default]
    #[serde(rename = "CAN'T VERIFY")]
    CantVerify,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::CantVerify => "CAN'T VERIFY",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "PASS" => Ok(Self::Pass),
            "FAIL" => Ok(Self::Fail),
            "CAN'T VERIFY" => Ok(Self::CantVerify),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }

    pub fn from_bool(passed: bool) -> Self {
        if passed {
            Self::Pass
        } else {
            Self::Fail
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node of the result tree: a status leaf or a nested map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ResultNode {
    Status(Status),
    Tree(ResultTree),
}

impl ResultNode {
    pub fn as_status(&self) -> Option<Status> {
        match self {
            Self::Status(s) => Some(*s),
            Self::Tree(_) => None,
        }
    }

    pub fn as_tree(&self) -> Option<&ResultTree> {
        match self {
            Self::Tree(t) => Some(t),
            Self::Status(_) => None,
        }
    }
}

impl From<Status> for ResultNode {
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}

impl From<ResultTree> for ResultNode {
    fn from(tree: ResultTree) -> Self {
        Self::Tree(tree)
    }
}

/// Leaf counts of a result tree.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSummary {
    pub pass: usize,
    pub fail: usize,
    pub cant_verify: usize,
}

impl StatusSummary {
    pub fn total(&self) -> usize {
        self.pass + self.fail + self.cant_verify
    }

    fn count(&mut self, status: Status) {
        match status {
            Status::Pass => self.pass += 1,
            Status::Fail => self.fail += 1,
            Status::CantVerify => self.cant_verify += 1,
        }
    }
}

/// Nested verification results keyed by item name.
///
/// Keys are kept sorted so two runs over the same inputs serialize
/// identically regardless of the order in which parallel children finished.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ResultTree(BTreeMap<String, ResultNode>);

impl ResultTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, key: &str) -> Option<&ResultNode> {
        self.0.get(key)
    }

    pub fn status(&self, key: &str) -> Option<Status> {
        self.0.get(key).and_then(ResultNode::as_status)
    }

    pub fn subtree(&self, key: &str) -> Option<&ResultTree> {
        self.0.get(key).and_then(ResultNode::as_tree)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, node: impl Into<ResultNode>) {
        self.0.insert(key.into(), node.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<ResultNode> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, ResultNode> {
        self.0.iter()
    }

    /// Set a status at a nested path, creating intermediate maps.
    pub fn set_path(&mut self, path: &[&str], status: Status) -> Result<(), CoreError> {
        let Some((last, parents)) = path.split_last() else {
            return Ok(());
        };

        let mut node = self;
        for (depth, segment) in parents.iter().enumerate() {
            let entry = node
                .0
                .entry((*segment).to_string())
                .or_insert_with(|| ResultNode::Tree(ResultTree::new()));
            node = match entry {
                ResultNode::Tree(tree) => tree,
                ResultNode::Status(_) => {
                    return Err(CoreError::PathConflict(path[..=depth].join("/")));
                }
            };
        }
        node.insert(*last, status);
        Ok(())
    }

    /// Deep merge. Nested maps are merged key by key; anywhere a leaf is
    /// involved the incoming node replaces the existing one.
    pub fn merge(&mut self, other: ResultTree) {
        for (key, incoming) in other.0 {
            match (self.0.get_mut(&key), incoming) {
                (Some(ResultNode::Tree(existing)), ResultNode::Tree(incoming)) => {
                    existing.merge(incoming);
                }
                (_, incoming) => {
                    self.0.insert(key, incoming);
                }
            }
        }
    }

    /// Wrap this tree as the single child of `key`.
    pub fn nest_under(self, key: impl Into<String>) -> ResultTree {
        let mut outer = ResultTree::new();
        outer.insert(key, self);
        outer
    }

    pub fn summary(&self) -> StatusSummary {
        let mut summary = StatusSummary::default();
        self.collect_summary(&mut summary);
        summary
    }

    fn collect_summary(&self, summary: &mut StatusSummary) {
        for node in self.0.values() {
            match node {
                ResultNode::Status(s) => summary.count(*s),
                ResultNode::Tree(t) => t.collect_summary(summary),
            }
        }
    }

    /// True when every leaf is `PASS`. An empty tree passes vacuously.
    pub fn all_passed(&self) -> bool {
        let summary = self.summary();
        summary.fail == 0 && summary.cant_verify == 0
    }
}

impl FromIterator<(String, ResultNode)> for ResultTree {
    fn from_iter<I: IntoIterator<Item = (String, ResultNode)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for ResultTree {
    type Item = (String, ResultNode);
    type IntoIter = btree_map::IntoIter<String, ResultNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_wire_names() {
        assert_eq!(serde_json::to_value(Status::Pass).unwrap(), json!("PASS"));
        assert_eq!(
            serde_json::to_value(Status::CantVerify).unwrap(),
            json!("CAN'T VERIFY")
        );
        assert_eq!(Status::parse("FAIL").unwrap(), Status::Fail);
        assert!(Status::parse("passed").is_err());
        assert_eq!(Status::default(), Status::CantVerify);
    }

    #[test]
    fn test_tree_serializes_nested() {
        let mut tree = ResultTree::new();
        tree.set_path(&["10.0.0.1", "subnet"], Status::Pass).unwrap();
        tree.insert("pc", Status::Fail);

        let value = serde_json::to_value(&tree).unwrap();
        assert_eq!(
            value,
            json!({"10.0.0.1": {"subnet": "PASS"}, "pc": "FAIL"})
        );

        let back: ResultTree = serde_json::from_value(value).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn test_set_path_conflict() {
        let mut tree = ResultTree::new();
        tree.insert("a", Status::Pass);
        let err = tree.set_path(&["a", "b"], Status::Fail).unwrap_err();
        assert_eq!(err, CoreError::PathConflict("a".to_string()));
    }

    #[test]
    fn test_merge_is_deep() {
        let mut left = ResultTree::new();
        left.set_path(&["cluster", "x"], Status::Pass).unwrap();
        left.insert("leaf", Status::CantVerify);

        let mut right = ResultTree::new();
        right.set_path(&["cluster", "y"], Status::Fail).unwrap();
        right.insert("leaf", Status::Pass);

        left.merge(right);

        let cluster = left.subtree("cluster").unwrap();
        assert_eq!(cluster.status("x"), Some(Status::Pass));
        assert_eq!(cluster.status("y"), Some(Status::Fail));
        assert_eq!(left.status("leaf"), Some(Status::Pass));
    }

    #[test]
    fn test_summary_and_all_passed() {
        let mut tree = ResultTree::new();
        tree.set_path(&["a", "b"], Status::Pass).unwrap();
        tree.set_path(&["a", "c"], Status::CantVerify).unwrap();
        tree.insert("d", Status::Pass);

        let summary = tree.summary();
        assert_eq!(summary.pass, 2);
        assert_eq!(summary.cant_verify, 1);
        assert_eq!(summary.total(), 3);
        assert!(!tree.all_passed());
        assert!(ResultTree::new().all_passed());
    }

    #[test]
    fn test_nest_under() {
        let mut inner = ResultTree::new();
        inner.insert("vm", Status::Pass);
        let outer = inner.nest_under("stage");
        assert_eq!(outer.subtree("stage").unwrap().status("vm"), Some(Status::Pass));
    }
}
