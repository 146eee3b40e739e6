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

//! # The Node
//! One vertex of a target's hypothesis tree: the posterior after committing
//! to one association decision at one scan, plus the cumulative score of the
//! whole branch behind it.

use scanspace::{Point, StateCovariance, StateVector};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Index of a node within its target's arena.
pub type NodeId = u32;

/// Which measurement a node committed to at its scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeasurementOrigin {
    /// The mandatory zero hypothesis: the target existed, nothing was received.
    Missed,
    /// A plain radar detection, by index into that scan's measurement list.
    Radar {
        /// Index into the scan's measurement list.
        index: usize,
    },
    /// A radar detection combined with an AIS report in a double update.
    Fused {
        /// Index of the radar detection into the scan's measurement list.
        index: usize,
        /// Identity of the AIS transmitter.
        mmsi: u32,
    },
}

impl MeasurementOrigin {
    /// The classic 1-based measurement number; 0 is the missed detection.
    pub fn measurement_number(&self) -> usize {
        match *self {
            MeasurementOrigin::Missed => 0,
            MeasurementOrigin::Radar { index } | MeasurementOrigin::Fused { index, .. } => {
                index + 1
            }
        }
    }

    /// The AIS identity, if this origin came out of a fused update.
    pub fn mmsi(&self) -> Option<u32> {
        match *self {
            MeasurementOrigin::Fused { mmsi, .. } => Some(mmsi),
            _ => None,
        }
    }

    /// True for the zero hypothesis.
    pub fn is_missed(&self) -> bool {
        matches!(*self, MeasurementOrigin::Missed)
    }

    /// Every measurement key this origin consumes at scan `scan`. A fused
    /// origin consumes both its radar detection and its AIS identity.
    pub fn keys(&self, scan: usize) -> SmallVec<[MeasurementKey; 2]> {
        let mut keys = SmallVec::new();
        match *self {
            MeasurementOrigin::Missed => {}
            MeasurementOrigin::Radar { index } => {
                keys.push(MeasurementKey::Radar {
                    scan,
                    number: index + 1,
                });
            }
            MeasurementOrigin::Fused { index, mmsi } => {
                keys.push(MeasurementKey::Radar {
                    scan,
                    number: index + 1,
                });
                keys.push(MeasurementKey::Ais { scan, mmsi });
            }
        }
        keys
    }
}

/// A measurement usage record: one namespace for radar detections and AIS
/// identities, with the two kinds guaranteed distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MeasurementKey {
    /// Radar detection `number` (1-based) of scan `scan`.
    Radar {
        /// Scan the detection was received in.
        scan: usize,
        /// 1-based measurement number within the scan.
        number: usize,
    },
    /// AIS report of vessel `mmsi` delivered with scan `scan`.
    Ais {
        /// Scan the report was delivered with.
        scan: usize,
        /// Identity of the transmitter.
        mmsi: u32,
    },
}

/// One node of a target's hypothesis tree.
#[derive(Debug, Clone)]
pub struct HypothesisNode {
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: SmallVec<[NodeId; 8]>,
    pub(crate) scan_number: usize,
    pub(crate) time: f64,
    pub(crate) origin: MeasurementOrigin,
    pub(crate) x_hat: StateVector,
    pub(crate) p_hat: StateCovariance,
    pub(crate) cumulative_nllr: f64,
    pub(crate) p_d: f64,
}

impl HypothesisNode {
    /// Creates a node with no links; the tree wires parent and children.
    pub(crate) fn new(
        scan_number: usize,
        time: f64,
        origin: MeasurementOrigin,
        x_hat: StateVector,
        p_hat: StateCovariance,
        cumulative_nllr: f64,
        p_d: f64,
    ) -> HypothesisNode {
        HypothesisNode {
            parent: None,
            children: SmallVec::new(),
            scan_number,
            time,
            origin,
            x_hat,
            p_hat,
            cumulative_nllr,
            p_d,
        }
    }

    /// Verifies that this is a leaf by checking it has no children.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// The parent node, `None` for the root.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// The children, empty for a leaf.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// The scan this node committed its decision at.
    pub fn scan_number(&self) -> usize {
        self.scan_number
    }

    /// Timestamp of that scan.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Which measurement the node committed to.
    pub fn origin(&self) -> MeasurementOrigin {
        self.origin
    }

    /// Posterior state after the node's update.
    pub fn state(&self) -> &StateVector {
        &self.x_hat
    }

    /// Posterior covariance after the node's update.
    pub fn covariance(&self) -> &StateCovariance {
        &self.p_hat
    }

    /// Sum of the per-step scores from the root to this node.
    pub fn cumulative_nllr(&self) -> f64 {
        self.cumulative_nllr
    }

    /// Detection probability of the target this node belongs to.
    pub fn p_d(&self) -> f64 {
        self.p_d
    }

    /// Position part of the posterior state.
    pub fn position(&self) -> Point {
        Point::new(self.x_hat[0], self.x_hat[1])
    }

    /// Velocity part of the posterior state.
    pub fn velocity(&self) -> Point {
        Point::new(self.x_hat[2], self.x_hat[3])
    }

    /// True when the estimated position has left the sensor disk.
    pub fn is_outside_range(&self, center: &Point, range: f64) -> bool {
        (self.position() - center).norm() > range
    }
}
