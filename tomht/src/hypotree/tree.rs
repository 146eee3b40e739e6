/*
* Licensed to Elasticsearch B.V. under one or more contributor
* license agreements. See the NOTICE file distributed with
* this work for additional information regarding copyright
* ownership. Elasticsearch B.V. licenses this file to you under
* the Apache License, Version 2.0 (the "License"); you may
* not use this file except in compliance with the License.
* You may obtain a copy of the License at
*
*  http://www.apache.org/licenses/LICENSE-2.0
*
* Unless required by applicable law or agreed to in writing,
* software distributed under the License is distributed on an
* "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
* KIND, either express or implied.  See the License for the
* specific language governing permissions and limitations
* under the License.
*/

//! # The Target Tree
//! One target's hypotheses, stored as an arena of nodes addressed by `u32`.
//! Parent and child links are arena indices, so there are no reference
//! cycles, the N-scan prune is a bulk rebuild, and a root-to-leaf walk is a
//! few array hops.
//!
//! After every grown scan all leaves sit at the same scan number; the window
//! prune promotes an ancestor of the selected leaf to be the new root and
//! drops every branch that does not descend from it.

use super::node::{HypothesisNode, MeasurementKey, NodeId};
use fxhash::FxBuildHasher;
use hashbrown::{HashMap, HashSet};
use scanspace::Point;

/// The set of measurement keys a target has absorbed anywhere in its tree.
pub type MeasurementSet = HashSet<MeasurementKey, FxBuildHasher>;

/// A target: a stable identity plus the arena of its hypothesis nodes.
#[derive(Debug, Clone)]
pub struct TargetTree {
    track_id: u64,
    nodes: Vec<HypothesisNode>,
    root: NodeId,
    leaves: Vec<NodeId>,
}

impl TargetTree {
    /// Creates a single-node tree around the initial posterior.
    pub(crate) fn new(track_id: u64, mut root: HypothesisNode) -> TargetTree {
        root.parent = None;
        TargetTree {
            track_id,
            nodes: vec![root],
            root: 0,
            leaves: vec![0],
        }
    }

    /// Stable identity of this target.
    pub fn track_id(&self) -> u64 {
        self.track_id
    }

    /// The earliest retained node.
    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Read access to a node of the arena.
    pub fn node(&self, id: NodeId) -> &HypothesisNode {
        &self.nodes[id as usize]
    }

    /// The current leaf set, all at the latest processed scan.
    pub fn leaves(&self) -> &[NodeId] {
        &self.leaves
    }

    /// Detection probability of this target.
    pub fn p_d(&self) -> f64 {
        self.nodes[self.root as usize].p_d()
    }

    /// Number of nodes reachable from the root.
    pub fn node_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            count += 1;
            stack.extend(self.nodes[id as usize].children.iter().copied());
        }
        count
    }

    /// Tree depth in edges: the scan distance from the root to the leaves.
    pub fn depth(&self) -> usize {
        match self.leaves.first() {
            Some(&leaf) => {
                self.nodes[leaf as usize].scan_number - self.nodes[self.root as usize].scan_number
            }
            None => 0,
        }
    }

    /// Appends `node` as a child of `parent` and returns its id.
    pub(crate) fn attach_child(&mut self, parent: NodeId, mut node: HypothesisNode) -> NodeId {
        let id = self.nodes.len() as NodeId;
        node.parent = Some(parent);
        self.nodes.push(node);
        self.nodes[parent as usize].children.push(id);
        id
    }

    /// Replaces the leaf cache after a growth pass.
    pub(crate) fn set_leaves(&mut self, leaves: Vec<NodeId>) {
        self.leaves = leaves;
    }

    /// The leaf with the lowest cumulative score.
    pub fn select_best_leaf(&self) -> NodeId {
        self.leaves
            .iter()
            .copied()
            .min_by(|&a, &b| {
                self.nodes[a as usize]
                    .cumulative_nllr
                    .total_cmp(&self.nodes[b as usize].cumulative_nllr)
            })
            .unwrap_or(self.root)
    }

    /// Walks `steps` parent links up from `from`, stopping at the root.
    pub fn backtrack(&self, from: NodeId, steps: usize) -> NodeId {
        let mut id = from;
        for _ in 0..steps {
            match self.nodes[id as usize].parent {
                Some(parent) => id = parent,
                None => break,
            }
        }
        id
    }

    /// Node ids from the root down to `to`, inclusive.
    pub fn path_from_root(&self, to: NodeId) -> Vec<NodeId> {
        let mut path = vec![to];
        let mut id = to;
        while let Some(parent) = self.nodes[id as usize].parent {
            path.push(parent);
            id = parent;
        }
        path.reverse();
        path
    }

    /// Estimated positions from the root down to `to`, inclusive.
    pub fn position_history(&self, to: NodeId) -> Vec<Point> {
        self.path_from_root(to)
            .into_iter()
            .map(|id| self.nodes[id as usize].position())
            .collect()
    }

    /// Prunes the tree to the sliding window: the ancestor `window` steps
    /// above `selected` becomes the new root and every branch not below it is
    /// dropped. Returns the new id of `selected` and whether anything changed.
    pub(crate) fn prune_to_window(&mut self, selected: NodeId, window: usize) -> (NodeId, bool) {
        let new_root = self.backtrack(selected, window);
        if new_root == self.root {
            return (selected, false);
        }
        let map = self.rebuild_from(new_root);
        (map[&selected], true)
    }

    /// Drops everything except the root-to-`selected` spine. Used when a
    /// target is terminated and only its history is kept.
    pub(crate) fn retain_spine(&mut self, selected: NodeId) {
        let path = self.path_from_root(selected);
        let mut nodes = Vec::with_capacity(path.len());
        for (i, &old) in path.iter().enumerate() {
            let mut node = self.nodes[old as usize].clone();
            node.parent = if i == 0 { None } else { Some((i - 1) as NodeId) };
            node.children.clear();
            if i + 1 < path.len() {
                node.children.push((i + 1) as NodeId);
            }
            nodes.push(node);
        }
        self.nodes = nodes;
        self.root = 0;
        self.leaves = vec![(path.len() - 1) as NodeId];
    }

    /// Rebuilds the arena to contain exactly the subtree under `new_root`,
    /// in preorder. Returns the old-id → new-id map of the survivors.
    fn rebuild_from(&mut self, new_root: NodeId) -> HashMap<NodeId, NodeId, FxBuildHasher> {
        let mut order = Vec::new();
        let mut stack = vec![new_root];
        while let Some(id) = stack.pop() {
            order.push(id);
            for &child in self.nodes[id as usize].children.iter().rev() {
                stack.push(child);
            }
        }
        let mut map = HashMap::with_capacity_and_hasher(order.len(), FxBuildHasher::default());
        for (new_id, &old) in order.iter().enumerate() {
            map.insert(old, new_id as NodeId);
        }
        let mut nodes = Vec::with_capacity(order.len());
        for &old in &order {
            let mut node = self.nodes[old as usize].clone();
            node.parent = if old == new_root {
                None
            } else {
                node.parent.map(|p| map[&p])
            };
            node.children = node.children.iter().map(|c| map[c]).collect();
            nodes.push(node);
        }
        self.nodes = nodes;
        self.root = 0;
        self.leaves = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.is_leaf())
            .map(|(i, _)| i as NodeId)
            .collect();
        map
    }

    /// Every measurement key absorbed below the root. The root's own
    /// measurement belongs to an already-committed scan and is excluded.
    pub fn measurement_set(&self) -> MeasurementSet {
        let mut set = MeasurementSet::default();
        let mut stack: Vec<NodeId> = self.nodes[self.root as usize].children.to_vec();
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id as usize];
            for key in node.origin.keys(node.scan_number) {
                set.insert(key);
            }
            stack.extend(node.children.iter().copied());
        }
        set
    }

    /// Collapses near-duplicate sibling leaves: when two measurement leaves
    /// under the same parent differ by less than `threshold` in state norm,
    /// the costlier one is dropped. The zero hypothesis is never dropped.
    pub(crate) fn prune_similar_leaves(&mut self, threshold: f64) {
        let mut parents: Vec<NodeId> = Vec::new();
        for &leaf in &self.leaves {
            if let Some(parent) = self.nodes[leaf as usize].parent {
                if !parents.contains(&parent) {
                    parents.push(parent);
                }
            }
        }
        let mut removed: HashSet<NodeId, FxBuildHasher> = HashSet::default();
        for parent in parents {
            let children = self.nodes[parent as usize].children.clone();
            for i in 0..children.len() {
                for j in (i + 1)..children.len() {
                    let (a, b) = (children[i], children[j]);
                    if removed.contains(&a) || removed.contains(&b) {
                        continue;
                    }
                    let node_a = &self.nodes[a as usize];
                    let node_b = &self.nodes[b as usize];
                    if node_a.origin.is_missed() || node_b.origin.is_missed() {
                        continue;
                    }
                    if (node_a.x_hat - node_b.x_hat).norm() < threshold {
                        let drop = if node_a.cumulative_nllr <= node_b.cumulative_nllr {
                            b
                        } else {
                            a
                        };
                        removed.insert(drop);
                    }
                }
            }
            if !removed.is_empty() {
                self.nodes[parent as usize]
                    .children
                    .retain(|c| !removed.contains(c));
            }
        }
        if !removed.is_empty() {
            self.leaves.retain(|l| !removed.contains(l));
        }
    }

    /// Checks the structural invariants of this tree: uniform leaf scan
    /// numbers, single-step parent links and the depth bound.
    pub fn check_consistency(&self, expected_scan: usize, window: usize) -> Result<(), String> {
        for &leaf in &self.leaves {
            let node = &self.nodes[leaf as usize];
            if !node.is_leaf() {
                return Err(format!("cached leaf {} of track {} has children", leaf, self.track_id));
            }
            if node.scan_number != expected_scan {
                return Err(format!(
                    "leaf {} of track {} sits at scan {} instead of {}",
                    leaf, self.track_id, node.scan_number, expected_scan
                ));
            }
        }
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id as usize];
            for &child in node.children.iter() {
                let child_node = &self.nodes[child as usize];
                if child_node.parent != Some(id) {
                    return Err(format!(
                        "node {} of track {} has a stale parent link",
                        child, self.track_id
                    ));
                }
                if child_node.scan_number != node.scan_number + 1 {
                    return Err(format!(
                        "node {} of track {} skips from scan {} to {}",
                        child, self.track_id, node.scan_number, child_node.scan_number
                    ));
                }
                stack.push(child);
            }
        }
        if self.depth() > window + 1 {
            return Err(format!(
                "track {} has depth {} with window {}",
                self.track_id,
                self.depth(),
                window
            ));
        }
        Ok(())
    }
}
