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

//! # The M-of-N initiator
//! Measurements no active target gated flow in here. A measurement first
//! waits as a *free* measurement; on the next scan a minimum-cost assignment
//! pairs free measurements with new ones under a hard distance gate and a
//! max-speed feasibility gate. A valid pair seeds a *preliminary* track with
//! a two-point least-squares state, which is then tested scan by scan with a
//! PDAF update: M gated scans out of N confirm it into a fresh target,
//! N − M + 1 misses discard it.

use crate::kalman::{self, InnovationCache, Prediction};
use nalgebra::{Cholesky, Matrix2, Matrix4, Vector2, Vector4};
use scanspace::{MeasurementCovariance, MotionModel, Point, StateCovariance, StateVector};
use serde::{Deserialize, Serialize};

/// Gate on the PDAF normalised innovation, χ²₂ at 95%.
const PDAF_GATE: f64 = 5.99;
/// Probability mass of the PDAF gate.
const GATE_PROBABILITY: f64 = 0.99;
/// Cost placed on gated-out cells of the assignment matrix.
const BIG_COST: f64 = 1e12;

/// A confirmed candidate handed to the tracker for initiation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialTarget {
    /// Timestamp of the confirming scan.
    pub time: f64,
    /// Posterior state at that time.
    pub state: StateVector,
    /// Posterior covariance at that time.
    pub covariance: StateCovariance,
}

impl InitialTarget {
    /// Position part of the candidate state.
    pub fn position(&self) -> Point {
        Point::new(self.state[0], self.state[1])
    }
}

/// A measurement waiting for a partner.
#[derive(Debug, Clone, Copy)]
struct FreeMeasurement {
    value: Point,
    time: f64,
}

/// A paired candidate being tested by the M-of-N rule.
#[derive(Debug, Clone)]
struct PreliminaryTrack {
    x: StateVector,
    p: StateCovariance,
    time: f64,
    hits: usize,
    checks: usize,
}

/// Turns unused measurements into confirmed initial targets.
#[derive(Debug)]
pub(crate) struct Initiator {
    m_required: usize,
    n_checks: usize,
    max_speed: f64,
    pairing_gate: f64,
    p_d: f64,
    model: MotionModel,
    r: MeasurementCovariance,
    free: Vec<FreeMeasurement>,
    preliminary: Vec<PreliminaryTrack>,
}

impl Initiator {
    pub(crate) fn new(
        m_required: usize,
        n_checks: usize,
        max_speed: f64,
        pairing_gate: f64,
        p_d: f64,
        model: MotionModel,
        r: MeasurementCovariance,
    ) -> Initiator {
        Initiator {
            m_required,
            n_checks,
            max_speed,
            pairing_gate,
            p_d,
            model,
            r,
            free: Vec::new(),
            preliminary: Vec::new(),
        }
    }

    /// Feeds one scan's unused measurements through the initiation pipeline
    /// and returns the candidates confirmed this scan.
    pub(crate) fn process(&mut self, measurements: &[Point], time: f64) -> Vec<InitialTarget> {
        let mut consumed = vec![false; measurements.len()];
        let confirmed = self.update_preliminary(measurements, &mut consumed, time);
        self.pair_free(measurements, &mut consumed, time);
        self.free = measurements
            .iter()
            .enumerate()
            .filter(|(j, _)| !consumed[*j])
            .map(|(_, &value)| FreeMeasurement { value, time })
            .collect();
        confirmed
    }

    /// Number of candidates currently under test.
    pub(crate) fn preliminary_count(&self) -> usize {
        self.preliminary.len()
    }

    /// Number of measurements waiting for a partner.
    pub(crate) fn free_count(&self) -> usize {
        self.free.len()
    }

    fn update_preliminary(
        &mut self,
        measurements: &[Point],
        consumed: &mut [bool],
        time: f64,
    ) -> Vec<InitialTarget> {
        let mut confirmed = Vec::new();
        let mut keep = Vec::new();
        for mut track in std::mem::take(&mut self.preliminary) {
            let dt = time - track.time;
            let prior = kalman::predict_single(&self.model, dt, &track.x, &track.p);
            let cache = match kalman::precalc_single(&self.model.h(), &self.r, &prior) {
                Some(cache) => cache,
                None => {
                    log::debug!("dropping a preliminary track with a degenerate covariance");
                    continue;
                }
            };
            let mut gated = Vec::new();
            for (j, z) in measurements.iter().enumerate() {
                if consumed[j] {
                    continue;
                }
                if kalman::nis(&(z - cache.z_hat), &cache.s_inv) < PDAF_GATE {
                    gated.push(*z);
                    consumed[j] = true;
                }
            }
            track.checks += 1;
            if !gated.is_empty() {
                track.hits += 1;
            }
            let (x, p) = if gated.is_empty() {
                (prior.x_bar, prior.p_bar)
            } else {
                pdaf_update(&prior, &cache, &gated, self.p_d)
            };
            track.x = x;
            track.p = p;
            track.time = time;
            if track.hits >= self.m_required {
                confirmed.push(InitialTarget {
                    time,
                    state: track.x,
                    covariance: track.p,
                });
            } else if track.checks - track.hits > self.n_checks - self.m_required {
                log::debug!(
                    "discarding a preliminary track after {} misses in {} checks",
                    track.checks - track.hits,
                    track.checks
                );
            } else {
                keep.push(track);
            }
        }
        self.preliminary = keep;
        confirmed
    }

    fn pair_free(&mut self, measurements: &[Point], consumed: &mut [bool], time: f64) {
        if self.free.is_empty() {
            return;
        }
        let available: Vec<usize> = (0..measurements.len()).filter(|&j| !consumed[j]).collect();
        if available.is_empty() {
            return;
        }
        let n_free = self.free.len();
        let n_avail = available.len();
        let n = n_free.max(n_avail);
        let mut cost = vec![vec![BIG_COST; n]; n];
        let mut valid = vec![vec![false; n]; n];
        for (i, free) in self.free.iter().enumerate() {
            let dt = time - free.time;
            for (col, &j) in available.iter().enumerate() {
                let distance = (measurements[j] - free.value).norm();
                if distance <= self.pairing_gate && distance <= self.max_speed * dt {
                    cost[i][col] = distance;
                    valid[i][col] = true;
                }
            }
        }
        let assignment = min_cost_assignment(&cost);
        for (i, &col) in assignment.iter().enumerate() {
            if i < n_free && col < n_avail && valid[i][col] {
                let j = available[col];
                if let Some(track) = self.spawn_preliminary(self.free[i], measurements[j], time) {
                    self.preliminary.push(track);
                    consumed[j] = true;
                }
            }
        }
    }

    /// Two-point least-squares initialisation: the stacked observation
    /// [H; H·Φ(Δt)] of the state at the first timestamp, with block-diagonal
    /// measurement noise, solved in closed form and propagated to the second
    /// timestamp.
    fn spawn_preliminary(
        &self,
        first: FreeMeasurement,
        second: Point,
        time: f64,
    ) -> Option<PreliminaryTrack> {
        let dt = time - first.time;
        if dt <= 0.0 {
            return None;
        }
        let h = self.model.h();
        let phi = self.model.phi(dt);
        let mut h_stack = Matrix4::zeros();
        h_stack.fixed_view_mut::<2, 4>(0, 0).copy_from(&h);
        h_stack.fixed_view_mut::<2, 4>(2, 0).copy_from(&(h * phi));
        let mut r_stack = Matrix4::zeros();
        r_stack.fixed_view_mut::<2, 2>(0, 0).copy_from(&self.r);
        r_stack.fixed_view_mut::<2, 2>(2, 2).copy_from(&self.r);
        let r_inv = Cholesky::new(r_stack)?.inverse();
        let info = h_stack.transpose() * r_inv * h_stack;
        let p_first = Cholesky::new(kalman::symmetrized(info))?.inverse();
        let z_stack = Vector4::new(first.value[0], first.value[1], second[0], second[1]);
        let x_first = p_first * h_stack.transpose() * r_inv * z_stack;
        Some(PreliminaryTrack {
            x: phi * x_first,
            p: kalman::symmetrized(phi * p_first * phi.transpose()),
            time,
            hits: 1,
            checks: 1,
        })
    }
}

/// One PDAF step over the gated measurements: association weights from the
/// measurement likelihoods plus the clutter weight, a weighted innovation
/// update and the matching covariance with its spread-of-innovations term.
fn pdaf_update(
    prior: &Prediction,
    cache: &InnovationCache,
    gated: &[Point],
    p_d: f64,
) -> (StateVector, StateCovariance) {
    let count = gated.len() as f64;
    let clutter = 2.0 * count * (1.0 - p_d * GATE_PROBABILITY) / (PDAF_GATE * p_d);
    let mut likelihoods = Vec::with_capacity(gated.len());
    let mut total = clutter;
    for z in gated {
        let nu = z - cache.z_hat;
        let likelihood = (-0.5 * kalman::nis(&nu, &cache.s_inv)).exp();
        likelihoods.push(likelihood);
        total += likelihood;
    }
    let beta_none = clutter / total;
    let mut nu_total = Vector2::zeros();
    let mut spread = Matrix2::zeros();
    for (z, likelihood) in gated.iter().zip(&likelihoods) {
        let beta = likelihood / total;
        let nu = z - cache.z_hat;
        nu_total += beta * nu;
        spread += beta * (nu * nu.transpose());
    }
    spread -= nu_total * nu_total.transpose();
    let gain = cache.k;
    let x = prior.x_bar + gain * nu_total;
    let p_correct = prior.p_bar - gain * cache.s * gain.transpose();
    let p = kalman::symmetrized(
        beta_none * prior.p_bar + (1.0 - beta_none) * p_correct
            + gain * spread * gain.transpose(),
    );
    (x, p)
}

/// Minimum-cost assignment on a square matrix by shortest augmenting paths
/// with row/column potentials. Returns the column assigned to each row.
fn min_cost_assignment(cost: &[Vec<f64>]) -> Vec<usize> {
    let n = cost.len();
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; n + 1];
    let mut assigned = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];
    for row in 1..=n {
        assigned[0] = row;
        let mut col_0 = 0usize;
        let mut min_slack = vec![f64::INFINITY; n + 1];
        let mut visited = vec![false; n + 1];
        loop {
            visited[col_0] = true;
            let row_0 = assigned[col_0];
            let mut delta = f64::INFINITY;
            let mut col_next = 0usize;
            for col in 1..=n {
                if visited[col] {
                    continue;
                }
                let slack = cost[row_0 - 1][col - 1] - u[row_0] - v[col];
                if slack < min_slack[col] {
                    min_slack[col] = slack;
                    way[col] = col_0;
                }
                if min_slack[col] < delta {
                    delta = min_slack[col];
                    col_next = col;
                }
            }
            for col in 0..=n {
                if visited[col] {
                    u[assigned[col]] += delta;
                    v[col] -= delta;
                } else {
                    min_slack[col] -= delta;
                }
            }
            col_0 = col_next;
            if assigned[col_0] == 0 {
                break;
            }
        }
        loop {
            let col_prev = way[col_0];
            assigned[col_0] = assigned[col_prev];
            col_0 = col_prev;
            if col_0 == 0 {
                break;
            }
        }
    }
    let mut result = vec![0usize; n];
    for col in 1..=n {
        if assigned[col] > 0 {
            result[assigned[col] - 1] = col - 1;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use scanspace::motion::measurement_covariance;

    fn initiator(m: usize, n: usize) -> Initiator {
        Initiator::new(
            m,
            n,
            15.0,
            30.0,
            0.9,
            MotionModel::new(0.1),
            measurement_covariance(1.0),
        )
    }

    fn brute_force_assignment(cost: &[Vec<f64>]) -> f64 {
        fn recurse(cost: &[Vec<f64>], row: usize, taken: &mut [bool]) -> f64 {
            if row == cost.len() {
                return 0.0;
            }
            let mut best = f64::INFINITY;
            for col in 0..cost.len() {
                if !taken[col] {
                    taken[col] = true;
                    let total = cost[row][col] + recurse(cost, row + 1, taken);
                    if total < best {
                        best = total;
                    }
                    taken[col] = false;
                }
            }
            best
        }
        recurse(cost, 0, &mut vec![false; cost.len()])
    }

    #[test]
    fn assignment_matches_brute_force() {
        let mut rng = SmallRng::seed_from_u64(42);
        for _ in 0..100 {
            let n = rng.gen_range(1..5);
            let cost: Vec<Vec<f64>> = (0..n)
                .map(|_| (0..n).map(|_| rng.gen_range(0.0..100.0)).collect())
                .collect();
            let assignment = min_cost_assignment(&cost);
            let total: f64 = assignment
                .iter()
                .enumerate()
                .map(|(row, &col)| cost[row][col])
                .sum();
            assert_approx_eq!(total, brute_force_assignment(&cost), 1e-9);
            let mut cols: Vec<usize> = assignment.clone();
            cols.sort_unstable();
            cols.dedup();
            assert_eq!(cols.len(), n);
        }
    }

    #[test]
    fn two_point_seed_recovers_velocity() {
        let init = initiator(2, 3);
        let first = FreeMeasurement {
            value: Point::new(0.0, 0.0),
            time: 0.0,
        };
        let track = init
            .spawn_preliminary(first, Point::new(10.0, -5.0), 1.0)
            .unwrap();
        assert_approx_eq!(track.x[0], 10.0, 1e-6);
        assert_approx_eq!(track.x[1], -5.0, 1e-6);
        assert_approx_eq!(track.x[2], 10.0, 1e-6);
        assert_approx_eq!(track.x[3], -5.0, 1e-6);
        assert_eq!((track.hits, track.checks), (1, 1));
    }

    #[test]
    fn two_of_three_confirms_on_the_third_scan() {
        let mut init = initiator(2, 3);
        assert!(init.process(&[Point::new(0.0, 0.0)], 0.0).is_empty());
        assert_eq!(init.free_count(), 1);
        assert!(init.process(&[Point::new(10.0, 0.0)], 1.0).is_empty());
        assert_eq!(init.preliminary_count(), 1);
        let confirmed = init.process(&[Point::new(20.0, 0.0)], 2.0);
        assert_eq!(confirmed.len(), 1);
        let target = &confirmed[0];
        assert!((target.state[0] - 20.0).abs() < 1.0);
        assert!((target.state[2] - 10.0).abs() < 1.0);
        assert_eq!(init.preliminary_count(), 0);
    }

    #[test]
    fn too_many_misses_discard_the_candidate() {
        let mut init = initiator(2, 3);
        init.process(&[Point::new(0.0, 0.0)], 0.0);
        init.process(&[Point::new(10.0, 0.0)], 1.0);
        assert_eq!(init.preliminary_count(), 1);
        // One miss is allowed with M = 2, N = 3.
        assert!(init.process(&[], 2.0).is_empty());
        assert_eq!(init.preliminary_count(), 1);
        // The second miss exceeds N − M and discards.
        assert!(init.process(&[], 3.0).is_empty());
        assert_eq!(init.preliminary_count(), 0);
    }

    #[test]
    fn pairing_respects_the_speed_gate() {
        let mut init = initiator(2, 3);
        init.process(&[Point::new(0.0, 0.0)], 0.0);
        // 25 m in one second beats max_speed = 15 m/s; inside the 30 m hard
        // gate but not physically reachable.
        init.process(&[Point::new(25.0, 0.0)], 1.0);
        assert_eq!(init.preliminary_count(), 0);
        // The rejected measurement becomes the new free measurement.
        assert_eq!(init.free_count(), 1);
    }

    #[test]
    fn crossing_free_measurements_pair_by_cost() {
        let mut init = initiator(2, 3);
        init.process(&[Point::new(0.0, 0.0), Point::new(100.0, 0.0)], 0.0);
        assert_eq!(init.free_count(), 2);
        init.process(&[Point::new(2.0, 0.0), Point::new(98.0, 0.0)], 1.0);
        assert_eq!(init.preliminary_count(), 2);
        assert_eq!(init.free_count(), 0);
    }
}
