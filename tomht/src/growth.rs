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

//! # Leaf growth
//! Expands every leaf of every target against the new scan: one mandatory
//! zero-hypothesis child, one child per gated radar measurement, and fused
//! children when AIS reports accompany the scan.
//!
//! A target's expansion is a pure function of its leaf snapshots and the scan
//! data, so independent targets can run on the worker pool; jobs report
//! finished spawn records over a channel and the coordinator merges them into
//! the trees in target index order, which keeps association-set construction
//! deterministic regardless of worker scheduling.

use crate::fusion;
use crate::hypotree::{MeasurementOrigin, NodeId, TargetTree};
use crate::kalman;
use crate::tracker::TrackerParameters;
use crossbeam_channel::unbounded;
use ndarray::Array2;
use scanspace::{AisList, ScanList, StateCovariance, StateVector};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Read-only copy of one leaf, all a worker needs to expand it.
#[derive(Debug, Clone)]
pub(crate) struct LeafSnapshot {
    pub node: NodeId,
    pub x: StateVector,
    pub p: StateCovariance,
    pub cumulative_nllr: f64,
    pub p_d: f64,
    pub time: f64,
}

/// One child to be attached under `parent` by the coordinator.
#[derive(Debug, Clone)]
pub(crate) struct SpawnRecord {
    pub parent: NodeId,
    pub origin: MeasurementOrigin,
    pub x_hat: StateVector,
    pub p_hat: StateCovariance,
    pub cumulative_nllr: f64,
}

/// Everything a finished growth job reports back.
#[derive(Debug)]
pub(crate) struct GrowthResult {
    pub target_index: usize,
    pub spawned: Vec<SpawnRecord>,
    /// Radar measurement indices gated by at least one leaf of this target.
    pub gated_radar: Vec<usize>,
    pub leaf_count: usize,
    pub elapsed: Duration,
}

/// A pure expansion job for one target.
#[derive(Debug)]
pub(crate) struct GrowthJob {
    target_index: usize,
    leaves: Vec<LeafSnapshot>,
    scan: Arc<ScanList>,
    ais: Option<Arc<AisList>>,
    params: Arc<TrackerParameters>,
}

impl GrowthJob {
    /// Snapshots a target's leaves into a job.
    pub(crate) fn snapshot(
        target_index: usize,
        tree: &TargetTree,
        scan: &Arc<ScanList>,
        ais: &Option<Arc<AisList>>,
        params: &Arc<TrackerParameters>,
    ) -> GrowthJob {
        let leaves = tree
            .leaves()
            .iter()
            .map(|&id| {
                let node = tree.node(id);
                LeafSnapshot {
                    node: id,
                    x: *node.state(),
                    p: *node.covariance(),
                    cumulative_nllr: node.cumulative_nllr(),
                    p_d: node.p_d(),
                    time: node.time(),
                }
            })
            .collect();
        GrowthJob {
            target_index,
            leaves,
            scan: Arc::clone(scan),
            ais: ais.as_ref().map(Arc::clone),
            params: Arc::clone(params),
        }
    }

    /// Expands every leaf. The per-leaf work is one predict, one precalc and
    /// a single sweep over the leaves × measurements NIS grid.
    pub(crate) fn run(self) -> GrowthResult {
        let tic = Instant::now();
        let params = &self.params;
        let model = &params.model;
        let h = model.h();
        let n_leaves = self.leaves.len();
        let n_meas = self.scan.len();

        let dt = self
            .leaves
            .first()
            .map(|leaf| self.scan.time - leaf.time)
            .unwrap_or(params.period);
        let priors: Vec<(StateVector, StateCovariance)> =
            self.leaves.iter().map(|leaf| (leaf.x, leaf.p)).collect();
        let predictions = kalman::predict(model, dt, &priors);
        let caches = kalman::precalc(&h, &params.r_radar, &predictions);
        for (leaf, cache) in self.leaves.iter().zip(caches.iter()) {
            if cache.is_none() {
                log::debug!(
                    "skipping expansion of node {}: innovation covariance is not positive-definite",
                    leaf.node
                );
            }
        }
        let nis = Array2::from_shape_fn((n_leaves, n_meas), |(i, j)| match &caches[i] {
            Some(cache) => kalman::nis(&(self.scan.measurements[j] - cache.z_hat), &cache.s_inv),
            None => f64::INFINITY,
        });

        let ais_caches = self.ais.as_ref().map(|ais| {
            let r_ais_pos = kalman::symmetrized(h * params.r_ais * h.transpose());
            (ais, kalman::precalc(&h, &r_ais_pos, &predictions))
        });

        let mut spawned = Vec::new();
        let mut used = vec![false; n_meas];
        for (i, leaf) in self.leaves.iter().enumerate() {
            spawned.push(SpawnRecord {
                parent: leaf.node,
                origin: MeasurementOrigin::Missed,
                x_hat: predictions[i].x_bar,
                p_hat: predictions[i].p_bar,
                cumulative_nllr: leaf.cumulative_nllr + kalman::nllr_missed(leaf.p_d),
            });
            let cache = match &caches[i] {
                Some(cache) => cache,
                None => continue,
            };
            let mut gated = Vec::new();
            for j in 0..n_meas {
                if nis[(i, j)] <= params.eta2 {
                    gated.push(j);
                    used[j] = true;
                    let z_tilde = self.scan.measurements[j] - cache.z_hat;
                    spawned.push(SpawnRecord {
                        parent: leaf.node,
                        origin: MeasurementOrigin::Radar { index: j },
                        x_hat: kalman::filter(&predictions[i].x_bar, &cache.k, &z_tilde),
                        p_hat: cache.p_hat,
                        cumulative_nllr: leaf.cumulative_nllr
                            + kalman::nllr(params.lambda_ex, leaf.p_d, cache, nis[(i, j)]),
                    });
                }
            }
            if let Some((ais, ais_caches)) = &ais_caches {
                if let Some(ais_cache) = &ais_caches[i] {
                    let gated_ais: Vec<usize> = ais
                        .messages
                        .iter()
                        .enumerate()
                        .filter(|(_, msg)| {
                            kalman::nis(&(msg.position() - ais_cache.z_hat), &ais_cache.s_inv)
                                <= params.eta2
                        })
                        .map(|(k, _)| k)
                        .collect();
                    spawned.extend(fusion::fused_children(
                        leaf, &gated, &gated_ais, &self.scan, ais, params,
                    ));
                }
            }
        }
        GrowthResult {
            target_index: self.target_index,
            spawned,
            gated_radar: (0..n_meas).filter(|&j| used[j]).collect(),
            leaf_count: n_leaves,
            elapsed: tic.elapsed(),
        }
    }
}

/// Runs the jobs, on the worker pool when more than one worker is configured,
/// and returns the results in target index order.
pub(crate) fn grow_targets(jobs: Vec<GrowthJob>, workers: usize) -> Vec<GrowthResult> {
    let mut results: Vec<GrowthResult> = if workers > 1 && jobs.len() > 1 {
        let n_jobs = jobs.len();
        let (sender, receiver) = unbounded();
        for job in jobs {
            let sender = sender.clone();
            rayon::spawn(move || {
                // The receiver outlives every job; a send cannot fail.
                let _ = sender.send(job.run());
            });
        }
        drop(sender);
        receiver.iter().take(n_jobs).collect()
    } else {
        jobs.into_iter().map(GrowthJob::run).collect()
    };
    results.sort_by_key(|result| result.target_index);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypotree::HypothesisNode;
    use crate::tracker::TrackerBuilder;
    use scanspace::Point;

    fn target_at(x: f64, y: f64) -> TargetTree {
        TargetTree::new(
            0,
            HypothesisNode::new(
                0,
                0.0,
                MeasurementOrigin::Missed,
                StateVector::new(x, y, 0.0, 0.0),
                StateCovariance::identity(),
                0.0,
                0.9,
            ),
        )
    }

    fn job_for(tree: &TargetTree, scan: ScanList) -> GrowthJob {
        let params = Arc::new(TrackerBuilder::new().build_parameters());
        GrowthJob::snapshot(0, tree, &Arc::new(scan), &None, &params)
    }

    #[test]
    fn every_leaf_spawns_a_zero_hypothesis() {
        let tree = target_at(0.0, 0.0);
        let scan = ScanList::new(1.0, vec![]).unwrap();
        let result = job_for(&tree, scan).run();
        assert_eq!(result.spawned.len(), 1);
        assert!(result.spawned[0].origin.is_missed());
        assert!(result.gated_radar.is_empty());
    }

    #[test]
    fn nearby_measurement_is_gated_far_one_is_not() {
        let tree = target_at(0.0, 0.0);
        let scan = ScanList::new(
            1.0,
            vec![Point::new(0.5, 0.0), Point::new(500.0, 500.0)],
        )
        .unwrap();
        let result = job_for(&tree, scan).run();
        // Zero hypothesis plus the near measurement.
        assert_eq!(result.spawned.len(), 2);
        assert_eq!(result.gated_radar, vec![0]);
        let real = &result.spawned[1];
        assert_eq!(real.origin, MeasurementOrigin::Radar { index: 0 });
        // The posterior lands between prediction and measurement.
        assert!(real.x_hat[0] > 0.0 && real.x_hat[0] < 0.5);
    }

    #[test]
    fn gate_boundary_is_inclusive() {
        // Recompute the job's own innovation covariance and place a
        // measurement exactly on the gate boundary.
        let tree = target_at(0.0, 0.0);
        let params = Arc::new(TrackerBuilder::new().build_parameters());
        let pred = kalman::predict_single(
            &params.model,
            1.0,
            &StateVector::new(0.0, 0.0, 0.0, 0.0),
            &StateCovariance::identity(),
        );
        let cache = kalman::precalc_single(&params.model.h(), &params.r_radar, &pred).unwrap();
        // Place z so that nis == eta2 exactly along the x axis.
        let offset = (params.eta2 / cache.s_inv[(0, 0)]).sqrt();
        let scan = ScanList::new(1.0, vec![Point::new(cache.z_hat[0] + offset, 0.0)]).unwrap();
        let result = GrowthJob::snapshot(0, &tree, &Arc::new(scan), &None, &params).run();
        assert_eq!(result.gated_radar, vec![0]);
    }

    #[test]
    fn parallel_and_serial_growth_agree() {
        let trees: Vec<TargetTree> = (0..4).map(|i| target_at(100.0 * i as f64, 0.0)).collect();
        let scan = Arc::new(
            ScanList::new(
                1.0,
                (0..4).map(|i| Point::new(100.0 * i as f64, 0.5)).collect(),
            )
            .unwrap(),
        );
        let params = Arc::new(TrackerBuilder::new().build_parameters());
        let make_jobs = || {
            trees
                .iter()
                .enumerate()
                .map(|(i, tree)| GrowthJob::snapshot(i, tree, &scan, &None, &params))
                .collect::<Vec<_>>()
        };
        let serial = grow_targets(make_jobs(), 1);
        let parallel = grow_targets(make_jobs(), 4);
        assert_eq!(serial.len(), parallel.len());
        for (a, b) in serial.iter().zip(parallel.iter()) {
            assert_eq!(a.target_index, b.target_index);
            assert_eq!(a.gated_radar, b.gated_radar);
            assert_eq!(a.spawned.len(), b.spawned.len());
            for (sa, sb) in a.spawned.iter().zip(b.spawned.iter()) {
                assert_eq!(sa.origin, sb.origin);
                assert_approx_eq::assert_approx_eq!(sa.cumulative_nllr, sb.cumulative_nllr);
            }
        }
    }
}
