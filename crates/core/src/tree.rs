//! In-memory mirror of a coordination-store subtree.

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// One node of a mirrored subtree.
///
/// A child's `path` is always `parent.path + "/" + name`. Children are kept
/// in a `BTreeMap` so every traversal visits them in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeNode {
    pub path: String,
    pub name: String,
    pub value: Vec<u8>,
    pub children: BTreeMap<String, TreeNode>,
}

impl TreeNode {
    /// Create an empty node for `path`, naming it after the last segment.
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let name = path
            .rsplit('/')
            .next()
            .map(str::to_string)
            .unwrap_or_default();
        Self {
            path,
            name,
            value: Vec::new(),
            children: BTreeMap::new(),
        }
    }

    /// Path a child called `name` would have under this node.
    pub fn child_path(&self, name: &str) -> String {
        join_path(&self.path, name)
    }

    /// Look up a direct child by name.
    pub fn child(&self, name: &str) -> Option<&TreeNode> {
        self.children.get(name)
    }

    /// Insert a child node, keyed by its name.
    pub fn insert_child(&mut self, child: TreeNode) {
        self.children.insert(child.name.clone(), child);
    }

    /// Value decoded lossily as UTF-8.
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        let mut count = 0usize;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count = count.saturating_add(1);
            stack.extend(node.children.values());
        }
        count
    }

    /// Indented `name: value` outline of the subtree, one node per line.
    pub fn outline(&self) -> String {
        let mut out = String::new();
        let mut stack = vec![(self, 0usize)];
        while let Some((node, depth)) = stack.pop() {
            let _ = writeln!(
                out,
                "{}-{}: {}",
                "\t".repeat(depth),
                node.name,
                node.value_str()
            );
            // reversed so the pop order is ascending by name
            for child in node.children.values().rev() {
                stack.push((child, depth.saturating_add(1)));
            }
        }
        out
    }
}

/// Join a parent path and a child name with exactly one `/`.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}
