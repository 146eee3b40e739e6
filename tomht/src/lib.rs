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

#![allow(dead_code)]
//#![deny(warnings)]
#![warn(missing_docs)]

//! # Tomht
//! A track-oriented multi-hypothesis tracker for point measurements from one
//! radar, optionally fused with one AIS channel. Every target keeps a tree of
//! data-association hypotheses scored by cumulative negative
//! log-likelihood-ratio; each scan grows the trees against the gated
//! measurements, resolves measurement contention cluster-by-cluster with an
//! exact 0/1 program, prunes the trees back to a sliding window and feeds the
//! leftover measurements to an M-of-N initiator.
//!
//! ## Parameter Guide
//! The behaviour is governed by a handful of parameters, the most influential
//! of which is the window ceiling `N`: a deeper window keeps more alternative
//! histories alive and resolves harder crossings, at an exponential cost in
//! tree size. The gate `eta2` trades missed associations against tree width,
//! and the densities `lambda_phi`/`lambda_nu` set how expensive it is to
//! claim a measurement rather than declare it clutter. The dynamic-window
//! machinery shrinks windows when growth falls behind the scan period, so a
//! generous `N` degrades gracefully instead of missing the deadline.
//!
//! Measurement ingest and the motion model live in the `scanspace` crate;
//! this crate owns everything from gating to track lifecycle.

pub mod assignment;
mod clustering;
pub mod errors;
mod fusion;
mod growth;
mod hypotree;
mod initiator;
pub mod kalman;
mod tracker;

pub use errors::{TomhtError, TomhtResult};
pub use hypotree::{
    HypothesisNode, MeasurementKey, MeasurementOrigin, MeasurementSet, NodeId, TargetTree,
};
pub use initiator::InitialTarget;
pub use tracker::{RuntimeLog, Stage, Tracker, TrackerBuilder, TrackerParameters};
