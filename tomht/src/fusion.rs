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

//! # Radar + AIS fusion
//! When AIS reports accompany a scan, every (gated radar, gated AIS) pair
//! spawns a fused child: the leaf is predicted to the AIS report time,
//! updated with the reported position, predicted forward to the scan time and
//! updated with the radar detection. The fused child carries the transmitter
//! identity and is charged for both updates, the AIS one against the
//! new-target density with unit detection probability.

use crate::growth::{LeafSnapshot, SpawnRecord};
use crate::hypotree::MeasurementOrigin;
use crate::kalman;
use crate::tracker::TrackerParameters;
use scanspace::{AisList, ScanList};

/// Spawns the fused children of one leaf.
///
/// `gated_radar` and `gated_ais` are indices into the scan and the AIS list;
/// pairs whose intermediate covariances cannot be factorised, or whose AIS
/// report does not fall between the leaf and the scan, are skipped.
pub(crate) fn fused_children(
    leaf: &LeafSnapshot,
    gated_radar: &[usize],
    gated_ais: &[usize],
    scan: &ScanList,
    ais: &AisList,
    params: &TrackerParameters,
) -> Vec<SpawnRecord> {
    let model = &params.model;
    let h = model.h();
    let r_ais_pos = kalman::symmetrized(h * params.r_ais * h.transpose());
    let mut spawned = Vec::new();
    for &k in gated_ais {
        let msg = &ais.messages[k];
        let dt_to_report = msg.time - leaf.time;
        let dt_to_scan = ais.time - msg.time;
        if dt_to_report < 0.0 || dt_to_scan < 0.0 {
            log::debug!(
                "dropping AIS report of {} at {}: outside the scan interval",
                msg.mmsi,
                msg.time
            );
            continue;
        }
        let report_prior = kalman::predict_single(model, dt_to_report, &leaf.x, &leaf.p);
        let report_step =
            match kalman::filter_single(&msg.position(), &report_prior, &h, &r_ais_pos) {
                Some(step) => step,
                None => {
                    log::debug!("skipping AIS update of {}: covariance not factorisable", msg.mmsi);
                    continue;
                }
            };
        let ais_nllr = kalman::nllr(params.lambda_nu, 1.0, &report_step.cache, report_step.nis);
        let scan_prior =
            kalman::predict_single(model, dt_to_scan, &report_step.x_hat, &report_step.p_hat);
        for &j in gated_radar {
            let radar_step = match kalman::filter_single(
                &scan.measurements[j],
                &scan_prior,
                &h,
                &params.r_radar,
            ) {
                Some(step) => step,
                None => continue,
            };
            let radar_nllr =
                kalman::nllr(params.lambda_ex, leaf.p_d, &radar_step.cache, radar_step.nis);
            spawned.push(SpawnRecord {
                parent: leaf.node,
                origin: MeasurementOrigin::Fused {
                    index: j,
                    mmsi: msg.mmsi,
                },
                x_hat: radar_step.x_hat,
                p_hat: radar_step.p_hat,
                cumulative_nllr: leaf.cumulative_nllr + ais_nllr + radar_nllr,
            });
        }
    }
    spawned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackerBuilder;
    use scanspace::{AisMessage, Point, StateCovariance, StateVector};

    fn leaf() -> LeafSnapshot {
        LeafSnapshot {
            node: 0,
            x: StateVector::new(0.0, 0.0, 10.0, 0.0),
            p: StateCovariance::identity(),
            cumulative_nllr: 0.0,
            p_d: 0.9,
            time: 0.0,
        }
    }

    fn ais_at(time: f64, x: f64, mmsi: u32) -> AisList {
        AisList::new(
            1.0,
            vec![AisMessage {
                state: StateVector::new(x, 0.0, 10.0, 0.0),
                time,
                mmsi,
            }],
        )
        .unwrap()
    }

    #[test]
    fn fused_child_per_pair_with_identity() {
        let params = TrackerBuilder::new().build_parameters();
        let scan = ScanList::new(1.0, vec![Point::new(10.0, 0.0)]).unwrap();
        let ais = ais_at(0.5, 5.0, 257_000_001);
        let spawned = fused_children(&leaf(), &[0], &[0], &scan, &ais, &params);
        assert_eq!(spawned.len(), 1);
        let child = &spawned[0];
        assert_eq!(
            child.origin,
            MeasurementOrigin::Fused {
                index: 0,
                mmsi: 257_000_001
            }
        );
        assert!(child.cumulative_nllr.is_finite());
        // Both updates agree with the motion, the posterior stays on track.
        assert!((child.x_hat[0] - 10.0).abs() < 1.0);
        assert!(child.x_hat[1].abs() < 1.0);
    }

    #[test]
    fn report_outside_the_interval_is_dropped() {
        let params = TrackerBuilder::new().build_parameters();
        let scan = ScanList::new(1.0, vec![Point::new(10.0, 0.0)]).unwrap();
        let stale = ais_at(-0.5, 5.0, 257_000_001);
        assert!(fused_children(&leaf(), &[0], &[0], &scan, &stale, &params).is_empty());
    }

    #[test]
    fn no_radar_gate_means_no_fused_children() {
        let params = TrackerBuilder::new().build_parameters();
        let scan = ScanList::new(1.0, vec![Point::new(10.0, 0.0)]).unwrap();
        let ais = ais_at(0.5, 5.0, 257_000_001);
        assert!(fused_children(&leaf(), &[], &[0], &scan, &ais, &params).is_empty());
    }

    #[test]
    fn consistent_ais_scores_better_than_inconsistent() {
        let params = TrackerBuilder::new().build_parameters();
        let scan = ScanList::new(1.0, vec![Point::new(10.0, 0.0)]).unwrap();
        let good = ais_at(0.5, 5.0, 1);
        let bad = ais_at(0.5, 9.0, 2);
        let good_child = &fused_children(&leaf(), &[0], &[0], &scan, &good, &params)[0];
        let bad_child = &fused_children(&leaf(), &[0], &[0], &scan, &bad, &params)[0];
        assert!(good_child.cumulative_nllr < bad_child.cumulative_nllr);
    }
}
