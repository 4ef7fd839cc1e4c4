//! Pre-order flattening of a VM's snapshot tree into owned records.

use snapmgr_common::{Result, SnapError, SnapshotNode, SnapshotRef};

/// Upstream trees are tree-shaped by construction; the cap only guards
/// against malformed input reaching the traversal.
pub const MAX_TREE_DEPTH: usize = 1000;

/// One node lifted out of the tree, carrying the two chain flags the
/// classifier needs.
#[derive(Debug, Clone)]
pub struct FlatSnapshot {
    pub snapshot: SnapshotRef,
    pub name: String,
    pub created: String,
    pub has_children: bool,
    pub is_child: bool,
}

/// Flattens the root list into a pre-order sequence: every node appears
/// before all of its descendants. No side effects.
pub fn flatten_tree(roots: &[SnapshotNode]) -> Result<Vec<FlatSnapshot>> {
    let mut flattened = Vec::new();
    let mut stack: Vec<(&SnapshotNode, usize)> = Vec::new();

    // Reversed pushes keep sibling order under the explicit stack.
    for root in roots.iter().rev() {
        stack.push((root, 0));
    }

    while let Some((node, depth)) = stack.pop() {
        if depth >= MAX_TREE_DEPTH {
            return Err(SnapError::MalformedTree(format!(
                "snapshot tree deeper than {} levels at '{}'",
                MAX_TREE_DEPTH, node.name
            )));
        }

        flattened.push(FlatSnapshot {
            snapshot: node.snapshot.clone(),
            name: node.name.clone(),
            created: node.created.clone(),
            has_children: !node.children.is_empty(),
            is_child: depth > 0,
        });

        for child in node.children.iter().rev() {
            stack.push((child, depth + 1));
        }
    }

    Ok(flattened)
}
