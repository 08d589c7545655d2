use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

/// Index into the tree's node arena. The root is always index 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(u32);

impl GroupId {
    pub const ROOT: GroupId = GroupId(0);

    /// Raw arena index, for embedders that stash ids outside Rust (e.g. a
    /// script runtime's registry). Only round-trip values from [`Self::to_raw`]
    /// of the same tree.
    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn from_raw(raw: u32) -> Self {
        GroupId(raw)
    }
}

/// A named boolean assertion with monotone pass/fail counters.
///
/// Runners bump the counters with relaxed atomic adds from inside
/// iterations; the engine and the control API only read.
#[derive(Debug)]
pub struct Check {
    pub name: String,
    passes: AtomicU64,
    fails: AtomicU64,
}

impl Check {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passes: AtomicU64::new(0),
            fails: AtomicU64::new(0),
        }
    }

    pub fn record(&self, pass: bool) {
        if pass {
            self.passes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fails.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn fails(&self) -> u64 {
        self.fails.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct GroupNode {
    name: String,
    parent: Option<GroupId>,
    children: Vec<GroupId>,
    checks: Vec<Arc<Check>>,
}

/// Hierarchical aggregation of check results.
///
/// Nodes live in an arena and refer to their parent by index, so the
/// parent relation is acyclic by construction: a child is always appended
/// after its parent and only ever points backwards.
///
/// Groups are created lazily the first time a runner enters a named scope
/// and live for the lifetime of the runner.
#[derive(Debug)]
pub struct GroupTree {
    nodes: RwLock<Vec<GroupNode>>,
}

impl Default for GroupTree {
    fn default() -> Self {
        Self {
            nodes: RwLock::new(vec![GroupNode {
                name: String::new(),
                parent: None,
                children: Vec::new(),
                checks: Vec::new(),
            }]),
        }
    }
}

impl GroupTree {
    pub fn root(&self) -> GroupId {
        GroupId::ROOT
    }

    /// Get or lazily create the named child of `parent`.
    pub fn child(&self, parent: GroupId, name: &str) -> GroupId {
        {
            let nodes = self.nodes.read();
            let node = &nodes[parent.0 as usize];
            if let Some(id) = node
                .children
                .iter()
                .find(|id| nodes[id.0 as usize].name == name)
            {
                return *id;
            }
        }

        let mut nodes = self.nodes.write();
        // Re-check under the write lock; another VU may have raced us here.
        if let Some(id) = nodes[parent.0 as usize]
            .children
            .iter()
            .find(|id| nodes[id.0 as usize].name == name)
        {
            return *id;
        }

        let id = GroupId(nodes.len() as u32);
        nodes.push(GroupNode {
            name: name.to_string(),
            parent: Some(parent),
            children: Vec::new(),
            checks: Vec::new(),
        });
        nodes[parent.0 as usize].children.push(id);
        id
    }

    /// Get or lazily create a check in `group`. Check names are unique
    /// within their group.
    pub fn check(&self, group: GroupId, name: &str) -> Arc<Check> {
        {
            let nodes = self.nodes.read();
            if let Some(check) = nodes[group.0 as usize]
                .checks
                .iter()
                .find(|c| c.name == name)
            {
                return check.clone();
            }
        }

        let mut nodes = self.nodes.write();
        if let Some(check) = nodes[group.0 as usize]
            .checks
            .iter()
            .find(|c| c.name == name)
        {
            return check.clone();
        }

        let check = Arc::new(Check::new(name));
        nodes[group.0 as usize].checks.push(check.clone());
        check
    }

    /// Record a check result in one call (lookup + bump).
    pub fn record_check(&self, group: GroupId, name: &str, pass: bool) {
        self.check(group, name).record(pass);
    }

    /// `::`-joined path from the root, root itself rendering as `""`.
    pub fn path(&self, id: GroupId) -> String {
        let nodes = self.nodes.read();
        let mut parts = Vec::new();
        let mut cursor = Some(id);
        while let Some(cur) = cursor {
            let node = &nodes[cur.0 as usize];
            if node.parent.is_some() {
                parts.push(node.name.clone());
            }
            cursor = node.parent;
        }
        parts.reverse();
        parts.join("::")
    }

    /// Owned, serializable copy of the tree for display and the control API.
    pub fn snapshot(&self) -> GroupSnapshot {
        let nodes = self.nodes.read();
        snapshot_node(&nodes, GroupId::ROOT)
    }
}

fn snapshot_node(nodes: &[GroupNode], id: GroupId) -> GroupSnapshot {
    let node = &nodes[id.0 as usize];
    GroupSnapshot {
        name: node.name.clone(),
        checks: node
            .checks
            .iter()
            .map(|c| {
                let passes = c.passes();
                let fails = c.fails();
                let total = passes + fails;
                CheckSnapshot {
                    name: c.name.clone(),
                    passes,
                    fails,
                    rate: (total > 0).then(|| passes as f64 / total as f64),
                }
            })
            .collect(),
        groups: node
            .children
            .iter()
            .map(|child| snapshot_node(nodes, *child))
            .collect(),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSnapshot {
    pub name: String,
    pub checks: Vec<CheckSnapshot>,
    pub groups: Vec<GroupSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckSnapshot {
    pub name: String,
    pub passes: u64,
    pub fails: u64,
    /// `passes / (passes + fails)`; absent when nothing ran yet.
    pub rate: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_are_created_lazily_and_deduped() {
        let tree = GroupTree::default();
        let login = tree.child(tree.root(), "login");
        let again = tree.child(tree.root(), "login");
        assert_eq!(login, again);

        let submit = tree.child(login, "submit");
        assert_eq!(tree.path(submit), "login::submit");
    }

    #[test]
    fn checks_are_unique_per_group_and_count() {
        let tree = GroupTree::default();
        tree.record_check(tree.root(), "ok", true);
        tree.record_check(tree.root(), "ok", true);
        tree.record_check(tree.root(), "ok", false);

        let snap = tree.snapshot();
        assert_eq!(snap.checks.len(), 1);
        assert_eq!(snap.checks[0].passes, 2);
        assert_eq!(snap.checks[0].fails, 1);
        let rate = snap.checks[0].rate.expect("rate defined");
        assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn rate_is_undefined_with_no_runs() {
        let tree = GroupTree::default();
        tree.check(tree.root(), "never-ran");
        let snap = tree.snapshot();
        assert!(snap.checks[0].rate.is_none());
    }

    #[test]
    fn parent_relation_stays_a_tree() {
        let tree = GroupTree::default();
        let a = tree.child(tree.root(), "a");
        let b = tree.child(a, "b");
        let c = tree.child(b, "c");
        assert_eq!(tree.path(c), "a::b::c");

        // The snapshot walk terminates and reproduces the nesting, which it
        // could not if a parent link looped.
        let snap = tree.snapshot();
        assert_eq!(snap.name, "");
        assert_eq!(snap.groups.len(), 1);
        assert_eq!(snap.groups[0].name, "a");
        assert_eq!(snap.groups[0].groups[0].name, "b");
        assert_eq!(snap.groups[0].groups[0].groups[0].name, "c");
    }

    #[test]
    fn same_name_under_different_parents_is_distinct() {
        let tree = GroupTree::default();
        let a = tree.child(tree.root(), "a");
        let b = tree.child(tree.root(), "b");
        let under_a = tree.child(a, "shared");
        let under_b = tree.child(b, "shared");
        assert_ne!(under_a, under_b);
    }
}
