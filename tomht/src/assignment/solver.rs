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

//! The solver boundary of the association stage. The driver hands over a
//! fully assembled 0/1 program; anything that can return the optimal
//! selection may sit behind the trait. The default is an exact depth-first
//! branch-and-bound: clusters are small once the window prune has done its
//! job, and an exact in-process search avoids shipping measurement data to an
//! external solver binary.

use super::AssociationProblem;
use crate::errors::{TomhtError, TomhtResult};

/// Solves one cluster's association program to optimality.
///
/// The returned vector holds one column index per target, in target order.
pub trait AssociationSolver: Send + Sync {
    /// Picks the cost-minimal feasible selection. A program with no feasible
    /// selection is an error; the caller aborts the scan.
    fn select(&self, problem: &AssociationProblem) -> TomhtResult<Vec<usize>>;
}

/// Exact depth-first branch and bound.
///
/// Targets are processed in order; each target's hypotheses are tried
/// cheapest first, with a running conflict bit vector and an admissible
/// bound from the per-target minimum costs of the remaining targets.
#[derive(Debug, Default, Clone, Copy)]
pub struct BranchBoundSolver;

struct Search<'a> {
    problem: &'a AssociationProblem,
    order: &'a [Vec<usize>],
    suffix_min: &'a [f64],
    width: usize,
    best_cost: f64,
    best: Option<Vec<usize>>,
    current: Vec<usize>,
}

impl<'a> Search<'a> {
    fn dive(&mut self, depth: usize, used: &[u64], cost: f64) {
        if depth == self.order.len() {
            if self.best.is_none() || cost < self.best_cost {
                self.best_cost = cost;
                self.best = Some(self.current.clone());
            }
            return;
        }
        for &column in &self.order[depth] {
            let bound = cost + self.problem.costs[column] + self.suffix_min[depth + 1];
            if self.best.is_some() && bound > self.best_cost {
                // Columns are sorted by cost; nothing later can do better.
                break;
            }
            if super::intersects(&self.problem.masks[column], used) {
                continue;
            }
            let mut used_next = used.to_vec();
            used_next.resize(self.width, 0);
            super::merge_into(&mut used_next, &self.problem.masks[column]);
            self.current.push(column);
            self.dive(depth + 1, &used_next, cost + self.problem.costs[column]);
            self.current.pop();
        }
    }
}

impl AssociationSolver for BranchBoundSolver {
    fn select(&self, problem: &AssociationProblem) -> TomhtResult<Vec<usize>> {
        let n_targets = problem.target_ranges.len();
        if n_targets == 0 {
            return Ok(Vec::new());
        }
        let mut order: Vec<Vec<usize>> = Vec::with_capacity(n_targets);
        for range in &problem.target_ranges {
            let mut columns: Vec<usize> = range.clone().collect();
            if columns.is_empty() {
                return Err(TomhtError::Solver {
                    reason: "a target entered association with no hypotheses",
                });
            }
            columns.sort_by(|&a, &b| problem.costs[a].total_cmp(&problem.costs[b]));
            order.push(columns);
        }
        let mut suffix_min = vec![0.0; n_targets + 1];
        for depth in (0..n_targets).rev() {
            suffix_min[depth] = suffix_min[depth + 1] + problem.costs[order[depth][0]];
        }
        let width = problem.masks.iter().map(Vec::len).max().unwrap_or(0);
        let mut search = Search {
            problem,
            order: &order,
            suffix_min: &suffix_min,
            width,
            best_cost: f64::INFINITY,
            best: None,
            current: Vec::with_capacity(n_targets),
        };
        search.dive(0, &vec![0u64; width], 0.0);
        search.best.ok_or(TomhtError::Solver {
            reason: "no feasible joint hypothesis exists",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    /// Brute force over the full cartesian product, for cross-checking.
    struct ExhaustiveSolver;

    impl AssociationSolver for ExhaustiveSolver {
        fn select(&self, problem: &AssociationProblem) -> TomhtResult<Vec<usize>> {
            let n_targets = problem.target_ranges.len();
            let width = problem.masks.iter().map(Vec::len).max().unwrap_or(0);
            let mut best: Option<(f64, Vec<usize>)> = None;
            let mut counters: Vec<usize> = problem.target_ranges.iter().map(|r| r.start).collect();
            'outer: loop {
                let mut used = vec![0u64; width];
                let mut cost = 0.0;
                let mut feasible = true;
                for &column in &counters {
                    if super::super::intersects(&problem.masks[column], &used) {
                        feasible = false;
                        break;
                    }
                    super::super::merge_into(&mut used, &problem.masks[column]);
                    cost += problem.costs[column];
                }
                if feasible {
                    let better = match &best {
                        Some((best_cost, _)) => cost < *best_cost,
                        None => true,
                    };
                    if better {
                        best = Some((cost, counters.clone()));
                    }
                }
                for slot in (0..n_targets).rev() {
                    counters[slot] += 1;
                    if counters[slot] < problem.target_ranges[slot].end {
                        continue 'outer;
                    }
                    counters[slot] = problem.target_ranges[slot].start;
                }
                break;
            }
            best.map(|(_, columns)| columns).ok_or(TomhtError::Solver {
                reason: "no feasible joint hypothesis exists",
            })
        }
    }

    fn mask_of(rows: &[usize]) -> Vec<u64> {
        let mut bits = Vec::new();
        for &row in rows {
            super::super::set_bit(&mut bits, row);
        }
        bits
    }

    #[test]
    fn single_target_picks_cheapest() {
        let problem = AssociationProblem {
            costs: vec![3.0, 1.0, 2.0],
            target_ranges: vec![0..3],
            masks: vec![mask_of(&[0]), mask_of(&[1]), mask_of(&[2])],
            n_measurements: 3,
        };
        assert_eq!(BranchBoundSolver.select(&problem).unwrap(), vec![1]);
    }

    #[test]
    fn conflict_forces_second_best() {
        // Both targets prefer the shared measurement; one must yield.
        let problem = AssociationProblem {
            costs: vec![1.0, 5.0, 1.5, 10.0],
            target_ranges: vec![0..2, 2..4],
            masks: vec![mask_of(&[0]), mask_of(&[]), mask_of(&[0]), mask_of(&[])],
            n_measurements: 1,
        };
        let picked = BranchBoundSolver.select(&problem).unwrap();
        // 1.0 + 10.0 = 11.0 beats 5.0 + 1.5 = 6.5, so the second wins the row.
        assert_eq!(picked, vec![1, 2]);
    }

    #[test]
    fn infeasible_program_is_an_error() {
        let problem = AssociationProblem {
            costs: vec![1.0, 2.0],
            target_ranges: vec![0..1, 1..2],
            masks: vec![mask_of(&[0]), mask_of(&[0])],
            n_measurements: 1,
        };
        assert!(BranchBoundSolver.select(&problem).is_err());
    }

    #[test]
    fn infinite_costs_still_yield_a_selection() {
        // With P_d = 1 the missed hypothesis is infinitely costly but must
        // remain selectable.
        let problem = AssociationProblem {
            costs: vec![f64::INFINITY, f64::INFINITY],
            target_ranges: vec![0..2],
            masks: vec![mask_of(&[]), mask_of(&[0])],
            n_measurements: 1,
        };
        let picked = BranchBoundSolver.select(&problem).unwrap();
        assert_eq!(picked.len(), 1);
    }

    #[test]
    fn agrees_with_exhaustive_search_on_random_programs() {
        let mut rng = SmallRng::seed_from_u64(0x70_68_74);
        for _ in 0..200 {
            let n_targets = rng.gen_range(1..4);
            let n_measurements = rng.gen_range(1..5);
            let mut costs = Vec::new();
            let mut masks = Vec::new();
            let mut target_ranges = Vec::new();
            for _ in 0..n_targets {
                let start = costs.len();
                // One conflict-free hypothesis per target keeps it feasible.
                costs.push(rng.gen_range(0.0..10.0));
                masks.push(Vec::new());
                for _ in 0..rng.gen_range(1..4) {
                    costs.push(rng.gen_range(-2.0..10.0));
                    let rows: Vec<usize> = (0..n_measurements)
                        .filter(|_| rng.gen_bool(0.4))
                        .collect();
                    masks.push(mask_of(&rows));
                }
                target_ranges.push(start..costs.len());
            }
            let problem = AssociationProblem {
                costs,
                target_ranges,
                masks,
                n_measurements,
            };
            let fast = BranchBoundSolver.select(&problem).unwrap();
            let slow = ExhaustiveSolver.select(&problem).unwrap();
            let cost_of = |columns: &[usize]| -> f64 {
                columns.iter().map(|&c| problem.costs[c]).sum()
            };
            assert_approx_eq::assert_approx_eq!(cost_of(&fast), cost_of(&slow));
        }
    }
}
