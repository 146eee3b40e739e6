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

//! # The Kalman kernel
//! Bulk predict / precalc / filter / score operations the growth stage runs
//! over every leaf of a target. The measurement-independent pieces (ẑ, S,
//! S⁻¹, K, P̂) are computed once per leaf and reused for every gated
//! measurement, so scoring one target is a single pass over its
//! leaves × measurements grid.
//!
//! Innovation covariances must stay symmetric positive-definite. Every S and
//! P produced here is re-symmetrised, and the inverse goes through a Cholesky
//! factorisation with one symmetrise-and-retry; a leaf whose S still fails is
//! reported as unusable and the caller skips spawning from it.

use nalgebra::{Cholesky, Matrix2, Matrix2x4, Matrix4, Matrix4x2, SMatrix, Vector2};
use scanspace::{MeasurementCovariance, MotionModel, StateCovariance, StateVector};
use std::f64::consts::PI;

/// A predicted (x̄, P̄) pair, the prior a leaf carries into the new scan.
#[derive(Debug, Clone, Copy)]
pub struct Prediction {
    /// Predicted state Φx.
    pub x_bar: StateVector,
    /// Predicted covariance ΦPΦᵀ + ΓQΓᵀ.
    pub p_bar: StateCovariance,
}

/// The measurement-independent quantities of one leaf's update, shared by all
/// measurements gated against that leaf.
#[derive(Debug, Clone, Copy)]
pub struct InnovationCache {
    /// Predicted measurement Cx̄.
    pub z_hat: Vector2<f64>,
    /// Innovation covariance S = CP̄Cᵀ + R.
    pub s: Matrix2<f64>,
    /// Cholesky-based inverse of S.
    pub s_inv: Matrix2<f64>,
    /// Kalman gain K = P̄CᵀS⁻¹.
    pub k: Matrix4x2<f64>,
    /// Posterior covariance (I − KC)P̄; independent of the measurement value.
    pub p_hat: StateCovariance,
    /// ln √|2πS|, the normalisation term of the measurement likelihood.
    pub ln_sqrt_det_two_pi_s: f64,
}

/// Averages a square matrix with its transpose.
pub fn symmetrized<const D: usize>(m: SMatrix<f64, D, D>) -> SMatrix<f64, D, D> {
    (m + m.transpose()) * 0.5
}

/// Cholesky inverse of a supposedly-SPD 2×2 matrix, with one
/// symmetrise-and-retry. Returns the inverse and the determinant.
pub fn spd_inverse(s: Matrix2<f64>) -> Option<(Matrix2<f64>, f64)> {
    let chol = Cholesky::new(s).or_else(|| Cholesky::new(symmetrized(s)))?;
    let l = chol.l();
    let det = (l[(0, 0)] * l[(1, 1)]).powi(2);
    Some((chol.inverse(), det))
}

/// Predicts a single (x, P) pair over a step of length `dt`.
pub fn predict_single(
    model: &MotionModel,
    dt: f64,
    x: &StateVector,
    p: &StateCovariance,
) -> Prediction {
    let phi = model.phi(dt);
    Prediction {
        x_bar: phi * x,
        p_bar: symmetrized(phi * p * phi.transpose() + model.process_covariance(dt)),
    }
}

/// Predicts every leaf of a target in one sweep. `priors` are the leaves'
/// posterior (x, P) pairs; all share the same step length.
pub fn predict(
    model: &MotionModel,
    dt: f64,
    priors: &[(StateVector, StateCovariance)],
) -> Vec<Prediction> {
    let phi = model.phi(dt);
    let process = model.process_covariance(dt);
    priors
        .iter()
        .map(|(x, p)| Prediction {
            x_bar: phi * x,
            p_bar: symmetrized(phi * p * phi.transpose() + process),
        })
        .collect()
}

/// Precomputes the measurement-independent update quantities for one
/// prediction. `None` means S was not positive-definite even after the
/// retry and no children should be spawned from this leaf.
pub fn precalc_single(
    c: &Matrix2x4<f64>,
    r: &MeasurementCovariance,
    prediction: &Prediction,
) -> Option<InnovationCache> {
    let p_bar = prediction.p_bar;
    let s = symmetrized(c * p_bar * c.transpose() + r);
    let (s_inv, det) = spd_inverse(s)?;
    let k = p_bar * c.transpose() * s_inv;
    let p_hat = symmetrized((Matrix4::identity() - k * c) * p_bar);
    Some(InnovationCache {
        z_hat: c * prediction.x_bar,
        s,
        s_inv,
        k,
        p_hat,
        ln_sqrt_det_two_pi_s: (2.0 * PI).ln() + 0.5 * det.ln(),
    })
}

/// Bulk [`precalc_single`] over all leaves of a target.
pub fn precalc(
    c: &Matrix2x4<f64>,
    r: &MeasurementCovariance,
    predictions: &[Prediction],
) -> Vec<Option<InnovationCache>> {
    predictions
        .iter()
        .map(|prediction| precalc_single(c, r, prediction))
        .collect()
}

/// The measurement update x̂ = x̄ + K·z̃.
pub fn filter(x_bar: &StateVector, k: &Matrix4x2<f64>, z_tilde: &Vector2<f64>) -> StateVector {
    x_bar + k * z_tilde
}

/// Normalised innovation squared z̃ᵀS⁻¹z̃.
pub fn nis(z_tilde: &Vector2<f64>, s_inv: &Matrix2<f64>) -> f64 {
    z_tilde.dot(&(s_inv * z_tilde))
}

/// Negative log-likelihood ratio of associating a gated measurement:
/// `0.5·nis + ln(λ_ex·√|2πS| / P_d)`.
pub fn nllr(lambda_ex: f64, p_d: f64, cache: &InnovationCache, nis: f64) -> f64 {
    0.5 * nis + (lambda_ex / p_d).ln() + cache.ln_sqrt_det_two_pi_s
}

/// Negative log-likelihood ratio of the missed-detection hypothesis,
/// `−ln(1 − P_d)`.
pub fn nllr_missed(p_d: f64) -> f64 {
    -(1.0 - p_d).ln()
}

/// One complete single-measurement update, used by the fusion and initiation
/// paths where measurements arrive one at a time with their own timestamps.
#[derive(Debug, Clone, Copy)]
pub struct FilterOutcome {
    /// Posterior state.
    pub x_hat: StateVector,
    /// Posterior covariance.
    pub p_hat: StateCovariance,
    /// Innovation z − ẑ.
    pub z_tilde: Vector2<f64>,
    /// Normalised innovation squared.
    pub nis: f64,
    /// The shared cache the update was computed from.
    pub cache: InnovationCache,
}

/// Filters `z` into `prediction` under observation `c` and noise `r`.
pub fn filter_single(
    z: &Vector2<f64>,
    prediction: &Prediction,
    c: &Matrix2x4<f64>,
    r: &MeasurementCovariance,
) -> Option<FilterOutcome> {
    let cache = precalc_single(c, r, prediction)?;
    let z_tilde = z - cache.z_hat;
    let nis = nis(&z_tilde, &cache.s_inv);
    Some(FilterOutcome {
        x_hat: filter(&prediction.x_bar, &cache.k, &z_tilde),
        p_hat: cache.p_hat,
        z_tilde,
        nis,
        cache,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::Vector4;
    use scanspace::motion::measurement_covariance;

    fn model() -> MotionModel {
        MotionModel::new(0.1)
    }

    #[test]
    fn prediction_inflates_covariance() {
        let m = model();
        let p0 = Matrix4::identity();
        let x0 = Vector4::new(0.0, 0.0, 10.0, 0.0);
        let pred = predict_single(&m, 1.0, &x0, &p0);
        assert_approx_eq!(pred.x_bar[0], 10.0);
        // Position variance picks up the velocity variance plus process noise.
        assert!(pred.p_bar[(0, 0)] > p0[(0, 0)]);
        for i in 0..4 {
            for j in 0..4 {
                assert_approx_eq!(pred.p_bar[(i, j)], pred.p_bar[(j, i)]);
            }
        }
    }

    #[test]
    fn exact_measurement_has_zero_nis() {
        let m = model();
        let r = measurement_covariance(1.0);
        let pred = predict_single(
            &m,
            1.0,
            &Vector4::new(5.0, 5.0, 1.0, 0.0),
            &Matrix4::identity(),
        );
        let cache = precalc_single(&m.h(), &r, &pred).unwrap();
        let z = cache.z_hat;
        let outcome = filter_single(&z, &pred, &m.h(), &r).unwrap();
        assert_approx_eq!(outcome.nis, 0.0);
        // A zero innovation leaves the state at the prediction.
        for i in 0..4 {
            assert_approx_eq!(outcome.x_hat[i], pred.x_bar[i]);
        }
    }

    #[test]
    fn filtering_pulls_state_toward_measurement() {
        let m = model();
        let r = measurement_covariance(1.0);
        let pred = predict_single(
            &m,
            1.0,
            &Vector4::new(0.0, 0.0, 0.0, 0.0),
            &(Matrix4::identity() * 10.0),
        );
        let z = Vector2::new(4.0, -4.0);
        let outcome = filter_single(&z, &pred, &m.h(), &r).unwrap();
        assert!(outcome.x_hat[0] > 3.0 && outcome.x_hat[0] < 4.0);
        assert!(outcome.x_hat[1] < -3.0 && outcome.x_hat[1] > -4.0);
        // The posterior is tighter than the prior.
        assert!(outcome.p_hat[(0, 0)] < pred.p_bar[(0, 0)]);
    }

    #[test]
    fn nllr_orders_near_before_far() {
        let m = model();
        let r = measurement_covariance(1.0);
        let pred = predict_single(
            &m,
            1.0,
            &Vector4::new(0.0, 0.0, 0.0, 0.0),
            &Matrix4::identity(),
        );
        let cache = precalc_single(&m.h(), &r, &pred).unwrap();
        let near = nis(&Vector2::new(0.1, 0.0), &cache.s_inv);
        let far = nis(&Vector2::new(2.0, 0.0), &cache.s_inv);
        assert!(nllr(1e-4, 0.9, &cache, near) < nllr(1e-4, 0.9, &cache, far));
    }

    #[test]
    fn missed_detection_cost_grows_with_p_d() {
        assert_approx_eq!(nllr_missed(0.9), -(0.1f64).ln());
        assert!(nllr_missed(0.99) > nllr_missed(0.5));
        assert_approx_eq!(nllr_missed(0.0), 0.0);
    }

    #[test]
    fn non_positive_definite_s_is_skipped() {
        let pred = Prediction {
            x_bar: Vector4::zeros(),
            // A negative-definite "covariance" cannot be rescued by symmetrising.
            p_bar: Matrix4::identity() * -1.0,
        };
        let r = Matrix2::identity() * -1.0;
        assert!(precalc_single(&model().h(), &r, &pred).is_none());
    }

    #[test]
    fn spd_inverse_recovers_identity() {
        let s = Matrix2::new(4.0, 1.0, 1.0, 3.0);
        let (s_inv, det) = spd_inverse(s).unwrap();
        let eye = s * s_inv;
        assert_approx_eq!(eye[(0, 0)], 1.0);
        assert_approx_eq!(eye[(1, 1)], 1.0);
        assert_approx_eq!(eye[(0, 1)], 0.0, 1e-12);
        assert_approx_eq!(det, 11.0);
    }
}
