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

//! # Global association
//! For a cluster of targets that compete for measurements, the best joint
//! explanation is a 0/1 program: pick exactly one leaf hypothesis per target,
//! never letting two picked branches explain the same measurement, minimising
//! the summed cumulative NLLR.
//!
//! The program is assembled by a single depth-first walk per target that
//! threads an "active measurements" bit vector down each branch. Bits are
//! set on the way in and never cleared, so a leaf's bit vector is exactly the
//! measurement usage of its whole branch.

mod solver;

pub use solver::{AssociationSolver, BranchBoundSolver};

use crate::errors::{TomhtError, TomhtResult};
use crate::hypotree::{MeasurementKey, NodeId, TargetTree};
use fxhash::FxBuildHasher;
use hashbrown::HashMap;
use std::ops::Range;

/// One cluster's 0/1 association program.
///
/// Columns are leaf hypotheses in per-target depth-first order, targets
/// concatenated; rows are the measurement keys touched by the cluster, in
/// first-touch order.
#[derive(Debug, Clone)]
pub struct AssociationProblem {
    /// Cumulative NLLR of each hypothesis column.
    pub costs: Vec<f64>,
    /// The contiguous column range of each target ("pick exactly one").
    pub target_ranges: Vec<Range<usize>>,
    /// Per-column measurement usage as a row bit vector ("use at most once").
    pub masks: Vec<Vec<u64>>,
    /// Number of measurement rows.
    pub n_measurements: usize,
}

/// Sets bit `row`, growing the word vector as needed.
fn set_bit(bits: &mut Vec<u64>, row: usize) {
    let word = row / 64;
    if bits.len() <= word {
        bits.resize(word + 1, 0);
    }
    bits[word] |= 1u64 << (row % 64);
}

/// True when the two bit vectors share a set bit.
fn intersects(a: &[u64], b: &[u64]) -> bool {
    a.iter().zip(b.iter()).any(|(x, y)| x & y != 0)
}

/// Merges `b` into `a`, growing `a` as needed.
fn merge_into(a: &mut Vec<u64>, b: &[u64]) {
    if a.len() < b.len() {
        a.resize(b.len(), 0);
    }
    for (x, y) in a.iter_mut().zip(b.iter()) {
        *x |= y;
    }
}

struct ProblemBuilder<'a> {
    targets: &'a [TargetTree],
    rows: HashMap<MeasurementKey, usize, FxBuildHasher>,
    costs: Vec<f64>,
    masks: Vec<Vec<u64>>,
    columns: Vec<(usize, NodeId)>,
}

impl<'a> ProblemBuilder<'a> {
    fn new(targets: &'a [TargetTree]) -> ProblemBuilder<'a> {
        ProblemBuilder {
            targets,
            rows: HashMap::default(),
            costs: Vec::new(),
            masks: Vec::new(),
            columns: Vec::new(),
        }
    }

    fn visit(&mut self, target: usize, id: NodeId, active: &[u64], is_root: bool) {
        let node = self.targets[target].node(id);
        let origin = node.origin();
        let scan = node.scan_number();
        let cost = node.cumulative_nllr();
        let children: Vec<NodeId> = node.children().to_vec();
        let mut active = active.to_vec();
        if !is_root {
            for key in origin.keys(scan) {
                let next = self.rows.len();
                let row = *self.rows.entry(key).or_insert(next);
                set_bit(&mut active, row);
            }
        }
        if children.is_empty() {
            self.costs.push(cost);
            self.masks.push(active);
            self.columns.push((target, id));
        } else {
            for child in children {
                self.visit(target, child, &active, false);
            }
        }
    }
}

/// Assembles the program for `cluster` and the column → leaf mapping.
pub(crate) fn build_problem(
    targets: &[TargetTree],
    cluster: &[usize],
) -> (AssociationProblem, Vec<(usize, NodeId)>) {
    let mut builder = ProblemBuilder::new(targets);
    let mut target_ranges = Vec::with_capacity(cluster.len());
    for &target in cluster {
        let start = builder.costs.len();
        builder.visit(target, targets[target].root(), &[], true);
        target_ranges.push(start..builder.costs.len());
    }
    let problem = AssociationProblem {
        costs: builder.costs,
        target_ranges,
        masks: builder.masks,
        n_measurements: builder.rows.len(),
    };
    (problem, builder.columns)
}

/// Solves the cluster's program and maps the winning columns back to leaves.
///
/// Returns one `(target index, leaf id)` per cluster member, in cluster
/// order. Exactly one leaf per target and pairwise-distinct leaves are
/// checked here; a violation means the solver is broken and the scan aborts.
pub(crate) fn solve_cluster(
    targets: &[TargetTree],
    cluster: &[usize],
    solver: &dyn AssociationSolver,
) -> TomhtResult<Vec<(usize, NodeId)>> {
    let (problem, columns) = build_problem(targets, cluster);
    let selected = solver.select(&problem)?;
    if selected.len() != cluster.len() {
        return Err(TomhtError::Solver {
            reason: "selection does not cover every target in the cluster",
        });
    }
    for (slot, &column) in selected.iter().enumerate() {
        if !problem.target_ranges[slot].contains(&column) {
            return Err(TomhtError::Solver {
                reason: "selected hypothesis belongs to the wrong target",
            });
        }
    }
    let mut picks: Vec<usize> = selected.clone();
    picks.sort_unstable();
    picks.dedup();
    if picks.len() != selected.len() {
        return Err(TomhtError::Solver {
            reason: "the same hypothesis was selected twice",
        });
    }
    Ok(selected.into_iter().map(|column| columns[column]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypotree::{HypothesisNode, MeasurementOrigin};
    use scanspace::{StateCovariance, StateVector};

    fn node(scan: usize, origin: MeasurementOrigin, nllr: f64) -> HypothesisNode {
        HypothesisNode::new(
            scan,
            scan as f64,
            origin,
            StateVector::zeros(),
            StateCovariance::identity(),
            nllr,
            0.9,
        )
    }

    /// A one-scan target whose leaves are {missed, measurement `index`}.
    fn grown_target(track_id: u64, index: usize, real_cost: f64) -> TargetTree {
        let mut tree = TargetTree::new(track_id, node(0, MeasurementOrigin::Missed, 0.0));
        let missed = tree.attach_child(0, node(1, MeasurementOrigin::Missed, 2.3));
        let real = tree.attach_child(0, node(1, MeasurementOrigin::Radar { index }, real_cost));
        tree.set_leaves(vec![missed, real]);
        tree
    }

    #[test]
    fn problem_shape_matches_cluster() {
        let targets = vec![grown_target(0, 0, 0.5), grown_target(1, 0, 0.7)];
        let (problem, columns) = build_problem(&targets, &[0, 1]);
        assert_eq!(problem.costs.len(), 4);
        assert_eq!(problem.target_ranges, vec![0..2, 2..4]);
        // Both targets gate the same single measurement: one shared row.
        assert_eq!(problem.n_measurements, 1);
        assert_eq!(columns.len(), 4);
        // Missed columns carry no usage, real columns carry the shared row.
        assert!(problem.masks[0].iter().all(|&w| w == 0));
        assert_eq!(problem.masks[1], vec![1]);
        assert_eq!(problem.masks[3], vec![1]);
    }

    #[test]
    fn contested_measurement_goes_to_the_cheaper_target() {
        let targets = vec![grown_target(0, 0, 0.5), grown_target(1, 0, 0.7)];
        let picked = solve_cluster(&targets, &[0, 1], &BranchBoundSolver).unwrap();
        assert_eq!(picked.len(), 2);
        // Totals: target 0 takes it at 0.5 + 2.3 = 2.8, target 1 at 2.3 + 0.7 = 3.0.
        let origin_0 = targets[0].node(picked[0].1).origin();
        let origin_1 = targets[1].node(picked[1].1).origin();
        assert_eq!(origin_0, MeasurementOrigin::Radar { index: 0 });
        assert!(origin_1.is_missed());
    }

    #[test]
    fn fused_branches_conflict_on_the_ais_identity() {
        // Two targets whose real hypotheses fuse the same AIS identity but
        // different radar detections: still mutually exclusive.
        let mk = |track_id: u64, index: usize, cost: f64| {
            let mut tree = TargetTree::new(track_id, node(0, MeasurementOrigin::Missed, 0.0));
            let missed = tree.attach_child(0, node(1, MeasurementOrigin::Missed, 2.3));
            let fused = tree.attach_child(
                0,
                node(
                    1,
                    MeasurementOrigin::Fused {
                        index,
                        mmsi: 257_000_001,
                    },
                    cost,
                ),
            );
            tree.set_leaves(vec![missed, fused]);
            tree
        };
        let targets = vec![mk(0, 0, 0.1), mk(1, 1, 0.2)];
        let (problem, _) = build_problem(&targets, &[0, 1]);
        // Rows: radar 1, ais id, radar 2.
        assert_eq!(problem.n_measurements, 3);
        let picked = solve_cluster(&targets, &[0, 1], &BranchBoundSolver).unwrap();
        let real_picks = picked
            .iter()
            .filter(|&&(t, id)| !targets[t].node(id).origin().is_missed())
            .count();
        assert_eq!(real_picks, 1);
    }

    #[test]
    fn bit_vector_helpers() {
        let mut a = Vec::new();
        set_bit(&mut a, 3);
        set_bit(&mut a, 70);
        assert_eq!(a.len(), 2);
        let mut b = Vec::new();
        set_bit(&mut b, 70);
        assert!(intersects(&a, &b));
        let mut c = Vec::new();
        set_bit(&mut c, 4);
        assert!(!intersects(&a, &c));
        merge_into(&mut c, &a);
        assert!(intersects(&c, &b));
    }
}
