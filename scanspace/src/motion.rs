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

//! The white-noise-acceleration position-velocity model. The filter kernel
//! consuming this never hard-codes any of the matrices; everything is a
//! function of the step length and the configured noise intensities.

use nalgebra::{Matrix2, Matrix2x4, Matrix4, Matrix4x2};

use crate::MeasurementCovariance;

/// The linear-Gaussian state-space model shared by every track.
///
/// The state is (px, py, vx, vy); process noise enters as a white
/// acceleration with standard deviation `sigma_q` on each axis, loaded into
/// the state through [`MotionModel::gamma`].
#[derive(Debug, Clone, Copy)]
pub struct MotionModel {
    /// Standard deviation of the acceleration noise, m/s².
    pub sigma_q: f64,
}

impl MotionModel {
    /// Creates a model with the given acceleration noise intensity.
    pub fn new(sigma_q: f64) -> MotionModel {
        MotionModel { sigma_q }
    }

    /// State transition Φ(Δt) of the constant-velocity model.
    #[rustfmt::skip]
    pub fn phi(&self, dt: f64) -> Matrix4<f64> {
        Matrix4::new(
            1.0, 0.0, dt,  0.0,
            0.0, 1.0, 0.0, dt,
            0.0, 0.0, 1.0, 0.0,
            0.0, 0.0, 0.0, 1.0,
        )
    }

    /// Noise loading Γ(Δt), mapping the 2-dim acceleration noise into the state.
    #[rustfmt::skip]
    pub fn gamma(&self, dt: f64) -> Matrix4x2<f64> {
        let half_dt2 = 0.5 * dt * dt;
        Matrix4x2::new(
            half_dt2, 0.0,
            0.0,      half_dt2,
            dt,       0.0,
            0.0,      dt,
        )
    }

    /// The 2×2 acceleration-noise covariance Q.
    pub fn q(&self) -> Matrix2<f64> {
        Matrix2::identity() * (self.sigma_q * self.sigma_q)
    }

    /// The full process covariance Γ·Q·Γᵀ for one step of length `dt`.
    pub fn process_covariance(&self, dt: f64) -> Matrix4<f64> {
        let gamma = self.gamma(dt);
        gamma * self.q() * gamma.transpose()
    }

    /// Position observation matrix H.
    #[rustfmt::skip]
    pub fn h(&self) -> Matrix2x4<f64> {
        Matrix2x4::new(
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
        )
    }
}

/// Diagonal measurement covariance σ²·I₂ for a position sensor.
pub fn measurement_covariance(sigma: f64) -> MeasurementCovariance {
    Matrix2::identity() * (sigma * sigma)
}

/// Diagonal state covariance σ²·I₄, used for the reported AIS state.
pub fn state_covariance(sigma: f64) -> Matrix4<f64> {
    Matrix4::identity() * (sigma * sigma)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use nalgebra::Vector4;

    #[test]
    fn phi_advances_position_by_velocity() {
        let model = MotionModel::new(0.1);
        let x = Vector4::new(1.0, 2.0, 10.0, -5.0);
        let x_next = model.phi(2.0) * x;
        assert_approx_eq!(x_next[0], 21.0);
        assert_approx_eq!(x_next[1], -8.0);
        assert_approx_eq!(x_next[2], 10.0);
        assert_approx_eq!(x_next[3], -5.0);
    }

    #[test]
    fn process_covariance_is_symmetric_and_scales_with_sigma() {
        let small = MotionModel::new(0.1).process_covariance(1.0);
        let large = MotionModel::new(0.2).process_covariance(1.0);
        for i in 0..4 {
            for j in 0..4 {
                assert_approx_eq!(small[(i, j)], small[(j, i)]);
                assert_approx_eq!(large[(i, j)], 4.0 * small[(i, j)]);
            }
        }
        // The velocity block grows linearly in dt², the loading is dt on velocity.
        assert_approx_eq!(small[(2, 2)], 0.01);
        assert_approx_eq!(small[(0, 0)], 0.0025);
    }

    #[test]
    fn observation_picks_out_position() {
        let model = MotionModel::new(1.0);
        let x = Vector4::new(3.0, 4.0, 9.0, 9.0);
        let z = model.h() * x;
        assert_approx_eq!(z[0], 3.0);
        assert_approx_eq!(z[1], 4.0);
    }
}
