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
//! # Scanspace
//! The ingest layer for the tracker: radar scans, AIS update lists and the
//! linear-Gaussian motion model they are measured against. Everything here is
//! plain data; all the hypothesis machinery lives in `tomht`.

#![allow(dead_code)]
//#![deny(warnings)]
#![warn(missing_docs)]

use nalgebra::{Matrix2, Matrix4, Vector2, Vector4};
use serde::{Deserialize, Serialize};

pub mod errors;
pub mod io;
pub mod motion;

pub use errors::{ScanError, ScanResult};
pub use motion::MotionModel;

/// A planar position measurement, the raw output of one radar detection.
pub type Point = Vector2<f64>;
/// The (px, py, vx, vy) state every track estimate lives in.
pub type StateVector = Vector4<f64>;
/// Covariance of a [`StateVector`].
pub type StateCovariance = Matrix4<f64>;
/// Covariance of a [`Point`] measurement.
pub type MeasurementCovariance = Matrix2<f64>;

/// One radar scan: a timestamp and the point detections received in it.
///
/// Construction validates the detections, a scan that fails validation never
/// enters the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanList {
    /// Timestamp of the scan in seconds. Scans must arrive in increasing time order.
    pub time: f64,
    /// The point detections of this scan, in received order.
    pub measurements: Vec<Point>,
}

impl ScanList {
    /// Builds a scan list, rejecting non-finite coordinates.
    pub fn new(time: f64, measurements: Vec<Point>) -> ScanResult<ScanList> {
        if !time.is_finite() {
            return Err(ScanError::NonFiniteValue { index: None });
        }
        for (index, z) in measurements.iter().enumerate() {
            if !(z[0].is_finite() && z[1].is_finite()) {
                return Err(ScanError::NonFiniteValue { index: Some(index) });
            }
        }
        Ok(ScanList { time, measurements })
    }

    /// Number of detections in the scan.
    pub fn len(&self) -> usize {
        self.measurements.len()
    }

    /// True when the scan carried no detections at all.
    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }

    /// The detections selected by `keep`, with their original indices.
    pub fn filter_unused(&self, keep: &[bool]) -> Vec<(usize, Point)> {
        self.measurements
            .iter()
            .enumerate()
            .filter(|(i, _)| keep[*i])
            .map(|(i, z)| (i, *z))
            .collect()
    }
}

/// A single AIS position report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AisMessage {
    /// Reported (px, py, vx, vy) state.
    pub state: StateVector,
    /// Timestamp the report was valid at. May precede the accompanying scan.
    pub time: f64,
    /// Maritime Mobile Service Identity of the transmitting vessel.
    pub mmsi: u32,
}

impl AisMessage {
    /// The reported position.
    pub fn position(&self) -> Point {
        Point::new(self.state[0], self.state[1])
    }
}

/// The AIS reports accompanying one radar scan.
///
/// The list timestamp must equal the scan timestamp; the individual messages
/// carry their own (earlier or equal) report times.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AisList {
    /// Timestamp of the delivery, in seconds.
    pub time: f64,
    /// The messages delivered with the scan.
    pub messages: Vec<AisMessage>,
}

impl AisList {
    /// Builds an AIS list, rejecting non-finite states and report times.
    pub fn new(time: f64, messages: Vec<AisMessage>) -> ScanResult<AisList> {
        if !time.is_finite() {
            return Err(ScanError::NonFiniteValue { index: None });
        }
        for (index, msg) in messages.iter().enumerate() {
            if !(msg.time.is_finite() && msg.state.iter().all(|v| v.is_finite())) {
                return Err(ScanError::NonFiniteValue { index: Some(index) });
            }
        }
        Ok(AisList { time, messages })
    }

    /// Number of messages in the list.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// True when no messages were delivered.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// The per-target output of one tracker scan: the currently selected
/// hypothesis and the position history behind it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackReport {
    /// Stable identity of the track, assigned at initiation.
    pub track_id: u64,
    /// Timestamp of the scan this report was emitted for.
    pub time: f64,
    /// Posterior state of the selected hypothesis.
    pub state: StateVector,
    /// Posterior covariance of the selected hypothesis.
    pub covariance: StateCovariance,
    /// Cumulative negative log-likelihood ratio of the selected hypothesis.
    pub cumulative_nllr: f64,
    /// Estimated positions from the retained root to the selected leaf.
    pub history: Vec<Point>,
}

impl TrackReport {
    /// The current position estimate.
    pub fn position(&self) -> Point {
        Point::new(self.state[0], self.state[1])
    }

    /// The current velocity estimate.
    pub fn velocity(&self) -> Point {
        Point::new(self.state[2], self.state[3])
    }

    /// Current speed over ground in m/s.
    pub fn speed(&self) -> f64 {
        self.velocity().norm()
    }
}
