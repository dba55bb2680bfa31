use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::ImportResult;
use crate::storage::TargetStorage;
use crate::value::{Row, RowExt, Value};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct NestedSetPosition {
    pub lft: i64,
    pub rgt: i64,
    pub depth: i64,
}

/// Computes nested-set bounds for `(node_id, parent_node_id, display_order)` triples.
///
/// Siblings are ordered by display order then id. Nodes whose parent does not exist, or that
/// sit on a parent cycle, are placed at the root.
#[must_use]
pub fn compute_nested_set(nodes: &[(i64, i64, i64)]) -> BTreeMap<i64, NestedSetPosition> {
    let known: BTreeSet<i64> = nodes.iter().map(|(id, _, _)| *id).collect();
    let mut children: BTreeMap<i64, Vec<(i64, i64)>> = BTreeMap::new();
    for (id, parent, order) in nodes {
        let parent = if known.contains(parent) && parent != id { *parent } else { 0 };
        children.entry(parent).or_default().push((*order, *id));
    }
    for siblings in children.values_mut() {
        siblings.sort_unstable();
    }

    let mut positions = BTreeMap::new();
    let mut counter = 1;
    walk(0, -1, &children, &mut positions, &mut counter);

    let unreached: Vec<i64> =
        nodes.iter().map(|(id, _, _)| *id).filter(|id| !positions.contains_key(id)).collect();
    for id in unreached {
        if positions.contains_key(&id) {
            continue;
        }
        let lft = counter;
        counter += 1;
        positions.insert(id, NestedSetPosition { lft, rgt: 0, depth: 0 });
        walk(id, 0, &children, &mut positions, &mut counter);
        if let Some(position) = positions.get_mut(&id) {
            position.rgt = counter;
        }
        counter += 1;
    }

    positions
}

fn walk(
    parent: i64,
    parent_depth: i64,
    children: &BTreeMap<i64, Vec<(i64, i64)>>,
    positions: &mut BTreeMap<i64, NestedSetPosition>,
    counter: &mut i64,
) {
    let Some(siblings) = children.get(&parent) else {
        return;
    };
    for (_, id) in siblings {
        if positions.contains_key(id) {
            continue;
        }
        let lft = *counter;
        *counter += 1;
        positions.insert(*id, NestedSetPosition { lft, rgt: 0, depth: parent_depth + 1 });
        walk(*id, parent_depth + 1, children, positions, counter);
        if let Some(position) = positions.get_mut(id) {
            position.rgt = *counter;
        }
        *counter += 1;
    }
}

/// Recomputes `lft`, `rgt` and `depth` for every node and writes the ones that changed.
///
/// # Errors
/// Returns `ImportError::Storage` when nodes cannot be read or updated.
pub fn rebuild_node_tree<S: TargetStorage + ?Sized>(store: &mut S) -> ImportResult<usize> {
    let rows = store.select_all("node", &["node_id", "parent_node_id", "display_order", "lft", "rgt", "depth"])?;
    let nodes: Vec<(i64, i64, i64)> = rows
        .iter()
        .map(|row| (row.int("node_id"), row.int("parent_node_id"), row.int("display_order")))
        .collect();
    let current: BTreeMap<i64, &Row> = rows.iter().map(|row| (row.int("node_id"), row)).collect();

    let mut updated = 0;
    for (node_id, position) in compute_nested_set(&nodes) {
        let unchanged = current.get(&node_id).is_some_and(|row| {
            row.int("lft") == position.lft
                && row.int("rgt") == position.rgt
                && row.int("depth") == position.depth
        });
        if unchanged {
            continue;
        }
        let mut write = Row::new();
        write.insert("lft".to_string(), Value::Int(position.lft));
        write.insert("rgt".to_string(), Value::Int(position.rgt));
        write.insert("depth".to_string(), Value::Int(position.depth));
        updated += store.update("node", &write, "node_id", node_id)?;
    }

    debug!(nodes = nodes.len(), updated, "rebuilt node tree");
    Ok(updated)
}
