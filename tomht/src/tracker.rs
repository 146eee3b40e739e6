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

//! # The tracker coordinator
//! Owns all mutable tracking state and runs the per-scan pipeline:
//! grow → cluster → associate → adapt windows → prune → terminate →
//! initiate. Growth may fan out to the worker pool; everything after it is
//! strictly serial, each stage consuming the previous stage's full output.
//!
//! The four per-target arrays (trees, window sizes, selected leaves,
//! associated measurement sets) are coupled by index; every length-changing
//! mutation goes through [`TrackerState`] so they move together.

use crate::assignment::{self, AssociationSolver, BranchBoundSolver};
use crate::clustering;
use crate::errors::{TomhtError, TomhtResult};
use crate::growth::{self, GrowthJob};
use crate::hypotree::{HypothesisNode, MeasurementOrigin, MeasurementSet, NodeId, TargetTree};
use crate::initiator::{InitialTarget, Initiator};
use scanspace::motion::{measurement_covariance, state_covariance};
use scanspace::{
    AisList, MeasurementCovariance, MotionModel, Point, ScanError, ScanList, StateCovariance,
    TrackReport,
};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use std::fs::read_to_string;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use yaml_rust::YamlLoader;

/// Container for the parameters governing a tracker run.
#[derive(Debug)]
pub struct TrackerParameters {
    /// Detection probability assigned to every initiated target.
    pub p_d: f64,
    /// Initial state covariance of seeded targets.
    pub p0: StateCovariance,
    /// Radar measurement covariance.
    pub r_radar: MeasurementCovariance,
    /// Covariance of the reported AIS state.
    pub r_ais: StateCovariance,
    /// The shared motion model.
    pub model: MotionModel,
    /// Clutter density, per area per scan.
    pub lambda_phi: f64,
    /// New-target density, per area per scan.
    pub lambda_nu: f64,
    /// Extraneous-measurement density λ_φ + λ_ν.
    pub lambda_ex: f64,
    /// Gate threshold on the normalised innovation squared.
    pub eta2: f64,
    /// Ceiling on the per-target sliding windows.
    pub n_max: usize,
    /// Position of the radar.
    pub radar_position: Point,
    /// Radius of the radar disk; tracks leaving it are terminated.
    pub radar_range: f64,
    /// Scan interval in seconds, the per-scan deadline.
    pub period: f64,
    /// When false, the period follows the observed scan spacing.
    pub fixed_period: bool,
    /// Fastest target the initiator will consider, m/s.
    pub max_speed: f64,
    /// Detections required by the initiator within its test window.
    pub m_required: usize,
    /// Length of the initiator's test window, in scans.
    pub n_checks: usize,
    /// Hard distance gate for pairing free measurements, metres.
    pub pairing_gate: f64,
    /// Squared-distance de-duplication radius around active tracks.
    pub merge_threshold: f64,
    /// Collapse radius for near-duplicate sibling hypotheses, disabled when `None`.
    pub prune_threshold: Option<f64>,
    /// Tracks whose selected score exceeds this are terminated.
    pub nllr_upper_limit: f64,
    /// Node-count bound that triggers a window reduction for a target.
    pub target_size_limit: usize,
    /// Growth runs on the worker pool when this is above one.
    pub workers: usize,
    /// Run the full integrity check before and after every scan.
    pub check_integrity: bool,
}

/// A construction object for a tracker. See [`TrackerParameters`] for docs.
#[derive(Debug, Clone)]
pub struct TrackerBuilder {
    p_d: f64,
    sigma_q: f64,
    sigma_r_radar: f64,
    sigma_r_ais: f64,
    p0_diag: [f64; 4],
    lambda_phi: f64,
    lambda_nu: f64,
    eta2: f64,
    window: usize,
    radar_position: Point,
    radar_range: f64,
    period: Option<f64>,
    max_speed: f64,
    m_required: usize,
    n_checks: usize,
    pairing_gate: f64,
    merge_threshold: Option<f64>,
    prune_threshold: Option<f64>,
    target_size_limit: usize,
    workers: usize,
    check_integrity: bool,
    solver: String,
}

impl Default for TrackerBuilder {
    fn default() -> TrackerBuilder {
        TrackerBuilder {
            p_d: 0.8,
            sigma_q: 0.5,
            sigma_r_radar: 1.0,
            sigma_r_ais: 2.0,
            p0_diag: [1.0, 1.0, 1.0, 1.0],
            lambda_phi: 1e-6,
            lambda_nu: 1e-4,
            eta2: 5.99,
            window: 5,
            radar_position: Point::new(0.0, 0.0),
            radar_range: 1000.0,
            period: None,
            max_speed: 20.0,
            m_required: 2,
            n_checks: 3,
            pairing_gate: 30.0,
            merge_threshold: None,
            prune_threshold: None,
            target_size_limit: 3000,
            workers: 1,
            check_integrity: false,
            solver: String::from("branch-bound"),
        }
    }
}

impl TrackerBuilder {
    /// Creates a builder with sensible defaults.
    pub fn new() -> TrackerBuilder {
        TrackerBuilder::default()
    }

    /// Creates a builder from a yaml config file.
    ///
    /// ```yaml
    /// ---
    /// p_d: 0.9
    /// sigma_q: 0.5
    /// sigma_r_radar: 2.0
    /// lambda_phi: 1.0e-6
    /// gate_probability: 0.95
    /// window: 6
    /// radar_position: [0.0, 0.0]
    /// range: 5500.0
    /// period: 2.5
    /// workers: 4
    /// solver: branch-bound
    /// ```
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Self {
        let config = read_to_string(&path).expect("Unable to read config file");
        let params_files = YamlLoader::load_from_str(&config).unwrap();
        let params = &params_files[0];
        let defaults = TrackerBuilder::default();
        let mut builder = TrackerBuilder {
            p_d: params["p_d"].as_f64().unwrap_or(defaults.p_d),
            sigma_q: params["sigma_q"].as_f64().unwrap_or(defaults.sigma_q),
            sigma_r_radar: params["sigma_r_radar"]
                .as_f64()
                .unwrap_or(defaults.sigma_r_radar),
            sigma_r_ais: params["sigma_r_ais"].as_f64().unwrap_or(defaults.sigma_r_ais),
            p0_diag: defaults.p0_diag,
            lambda_phi: params["lambda_phi"].as_f64().unwrap_or(defaults.lambda_phi),
            lambda_nu: params["lambda_nu"].as_f64().unwrap_or(defaults.lambda_nu),
            eta2: params["eta2"].as_f64().unwrap_or(defaults.eta2),
            window: params["window"].as_i64().unwrap_or(defaults.window as i64) as usize,
            radar_position: defaults.radar_position,
            radar_range: params["range"].as_f64().unwrap_or(defaults.radar_range),
            period: params["period"].as_f64(),
            max_speed: params["max_speed"].as_f64().unwrap_or(defaults.max_speed),
            m_required: params["m_required"]
                .as_i64()
                .unwrap_or(defaults.m_required as i64) as usize,
            n_checks: params["n_checks"].as_i64().unwrap_or(defaults.n_checks as i64)
                as usize,
            pairing_gate: params["pairing_gate"]
                .as_f64()
                .unwrap_or(defaults.pairing_gate),
            merge_threshold: params["merge_threshold"].as_f64(),
            prune_threshold: params["prune_threshold"].as_f64(),
            target_size_limit: params["target_size_limit"]
                .as_i64()
                .unwrap_or(defaults.target_size_limit as i64)
                as usize,
            workers: params["workers"].as_i64().unwrap_or(defaults.workers as i64) as usize,
            check_integrity: params["check_integrity"]
                .as_bool()
                .unwrap_or(defaults.check_integrity),
            solver: params["solver"]
                .as_str()
                .unwrap_or(&defaults.solver)
                .to_string(),
        };
        if let Some(position) = params["radar_position"].as_vec() {
            if position.len() == 2 {
                builder.radar_position = Point::new(
                    position[0].as_f64().unwrap_or(0.0),
                    position[1].as_f64().unwrap_or(0.0),
                );
            }
        }
        if let Some(p0) = params["p0"].as_vec() {
            for (slot, value) in builder.p0_diag.iter_mut().zip(p0.iter()) {
                *slot = value.as_f64().unwrap_or(1.0);
            }
        }
        if let Some(probability) = params["gate_probability"].as_f64() {
            builder.set_gate_probability(probability);
        }
        builder
    }

    /// See [`TrackerParameters`] for docs.
    pub fn set_p_d(&mut self, x: f64) -> &mut Self {
        self.p_d = x;
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_sigma_q(&mut self, x: f64) -> &mut Self {
        self.sigma_q = x;
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_sigma_r_radar(&mut self, x: f64) -> &mut Self {
        self.sigma_r_radar = x;
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_sigma_r_ais(&mut self, x: f64) -> &mut Self {
        self.sigma_r_ais = x;
        self
    }
    /// Diagonal of the initial covariance of seeded targets.
    pub fn set_p0_diag(&mut self, x: [f64; 4]) -> &mut Self {
        self.p0_diag = x;
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_lambda_phi(&mut self, x: f64) -> &mut Self {
        self.lambda_phi = x;
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_lambda_nu(&mut self, x: f64) -> &mut Self {
        self.lambda_nu = x;
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_eta2(&mut self, x: f64) -> &mut Self {
        self.eta2 = x;
        self
    }
    /// Derives η² from a gate probability through the χ²₂ quantile.
    pub fn set_gate_probability(&mut self, probability: f64) -> &mut Self {
        match ChiSquared::new(2.0) {
            Ok(distribution) => self.eta2 = distribution.inverse_cdf(probability),
            Err(_) => log::warn!("could not build the gating distribution, keeping eta2"),
        }
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_window(&mut self, x: usize) -> &mut Self {
        self.window = x;
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_radar_position(&mut self, x: Point) -> &mut Self {
        self.radar_position = x;
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_radar_range(&mut self, x: f64) -> &mut Self {
        self.radar_range = x;
        self
    }
    /// Fixes the scan period instead of following the observed spacing.
    pub fn set_period(&mut self, x: f64) -> &mut Self {
        self.period = Some(x);
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_max_speed(&mut self, x: f64) -> &mut Self {
        self.max_speed = x;
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_m_of_n(&mut self, m_required: usize, n_checks: usize) -> &mut Self {
        self.m_required = m_required;
        self.n_checks = n_checks;
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_pairing_gate(&mut self, x: f64) -> &mut Self {
        self.pairing_gate = x;
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_merge_threshold(&mut self, x: f64) -> &mut Self {
        self.merge_threshold = Some(x);
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_prune_threshold(&mut self, x: f64) -> &mut Self {
        self.prune_threshold = Some(x);
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_target_size_limit(&mut self, x: usize) -> &mut Self {
        self.target_size_limit = x;
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_workers(&mut self, x: usize) -> &mut Self {
        self.workers = x;
        self
    }
    /// See [`TrackerParameters`] for docs.
    pub fn set_check_integrity(&mut self, x: bool) -> &mut Self {
        self.check_integrity = x;
        self
    }
    /// Selects the association solver by name.
    pub fn set_solver(&mut self, name: &str) -> &mut Self {
        self.solver = name.to_string();
        self
    }

    /// Resolves the builder into a parameter container.
    pub fn build_parameters(&self) -> TrackerParameters {
        let mut p0 = StateCovariance::zeros();
        for (i, &variance) in self.p0_diag.iter().enumerate() {
            p0[(i, i)] = variance;
        }
        TrackerParameters {
            p_d: self.p_d,
            p0,
            r_radar: measurement_covariance(self.sigma_r_radar),
            r_ais: state_covariance(self.sigma_r_ais),
            model: MotionModel::new(self.sigma_q),
            lambda_phi: self.lambda_phi,
            lambda_nu: self.lambda_nu,
            lambda_ex: self.lambda_phi + self.lambda_nu,
            eta2: self.eta2,
            n_max: self.window,
            radar_position: self.radar_position,
            radar_range: self.radar_range,
            period: self.period.unwrap_or(2.5),
            fixed_period: self.period.is_some(),
            max_speed: self.max_speed,
            m_required: self.m_required,
            n_checks: self.n_checks,
            pairing_gate: self.pairing_gate,
            merge_threshold: self
                .merge_threshold
                .unwrap_or(3.0 * self.sigma_r_radar * self.sigma_r_radar),
            prune_threshold: self.prune_threshold,
            nllr_upper_limit: -(1.0f64 - 0.7).ln() * 7.0,
            target_size_limit: self.target_size_limit,
            workers: self.workers,
            check_integrity: self.check_integrity,
        }
    }

    /// Builds the tracker with the solver selected by name.
    pub fn build(&self) -> Tracker {
        let solver: Box<dyn AssociationSolver> = match self.solver.as_str() {
            "branch-bound" | "exact" => Box::new(BranchBoundSolver),
            other => {
                log::warn!("Did not find solver {}, using the default solver", other);
                Box::new(BranchBoundSolver)
            }
        };
        self.build_with_solver(solver)
    }

    /// Builds the tracker around a caller-provided solver.
    pub fn build_with_solver(&self, solver: Box<dyn AssociationSolver>) -> Tracker {
        let params = Arc::new(self.build_parameters());
        let initiator = Initiator::new(
            params.m_required,
            params.n_checks,
            params.max_speed,
            params.pairing_gate,
            params.p_d,
            params.model,
            params.r_radar,
        );
        Tracker {
            period: params.period,
            n_ceiling: params.n_max,
            params,
            solver,
            initiator,
            state: TrackerState::new(),
            terminated: Vec::new(),
            runtime: RuntimeLog::default(),
            scan_count: 0,
            last_scan_time: None,
            next_track_id: 0,
        }
    }
}

/// The pipeline stages whose wall time is accumulated per scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Leaf growth across all targets.
    Process,
    /// Cluster discovery.
    Cluster,
    /// Per-cluster association.
    Optimize,
    /// Dynamic window adaptation.
    DynamicWindow,
    /// N-scan pruning.
    Prune,
    /// Track termination.
    Terminate,
    /// Track initiation.
    Initiate,
    /// The whole scan.
    Total,
}

impl Stage {
    const ALL: [Stage; 8] = [
        Stage::Process,
        Stage::Cluster,
        Stage::Optimize,
        Stage::DynamicWindow,
        Stage::Prune,
        Stage::Terminate,
        Stage::Initiate,
        Stage::Total,
    ];

    fn index(self) -> usize {
        Stage::ALL.iter().position(|&s| s == self).unwrap_or(0)
    }
}

/// Running totals of stage wall times across a run.
#[derive(Debug, Default)]
pub struct RuntimeLog {
    totals: [f64; 8],
    counts: [u64; 8],
}

impl RuntimeLog {
    fn record(&mut self, stage: Stage, seconds: f64) {
        let i = stage.index();
        self.totals[i] += seconds;
        self.counts[i] += 1;
    }

    /// Total seconds spent in a stage so far.
    pub fn total(&self, stage: Stage) -> f64 {
        self.totals[stage.index()]
    }

    /// Average seconds per scan for a stage, if it has run.
    pub fn average(&self, stage: Stage) -> Option<f64> {
        let i = stage.index();
        if self.counts[i] == 0 {
            None
        } else {
            Some(self.totals[i] / self.counts[i] as f64)
        }
    }
}

/// The four coupled per-target arrays. Only methods that keep the lengths in
/// lock-step may change them.
#[derive(Debug, Default)]
struct TrackerState {
    targets: Vec<TargetTree>,
    windows: Vec<usize>,
    selected: Vec<NodeId>,
    associated: Vec<MeasurementSet>,
}

impl TrackerState {
    fn new() -> TrackerState {
        TrackerState::default()
    }

    fn len(&self) -> usize {
        self.targets.len()
    }

    fn push(&mut self, target: TargetTree, window: usize) {
        self.selected.push(target.root());
        self.associated.push(MeasurementSet::default());
        self.windows.push(window);
        self.targets.push(target);
    }

    fn remove(&mut self, index: usize) -> (TargetTree, NodeId) {
        let target = self.targets.remove(index);
        self.windows.remove(index);
        self.associated.remove(index);
        let selected = self.selected.remove(index);
        (target, selected)
    }

    fn check_lengths(&self) -> Result<(), String> {
        let n = self.targets.len();
        if self.windows.len() != n || self.selected.len() != n || self.associated.len() != n {
            return Err(format!(
                "coupled array lengths diverged: {} targets, {} windows, {} selected, {} associated",
                n,
                self.windows.len(),
                self.selected.len(),
                self.associated.len()
            ));
        }
        Ok(())
    }
}

/// The track-oriented multi-hypothesis tracker.
pub struct Tracker {
    params: Arc<TrackerParameters>,
    solver: Box<dyn AssociationSolver>,
    initiator: Initiator,
    state: TrackerState,
    terminated: Vec<TargetTree>,
    runtime: RuntimeLog,
    scan_count: usize,
    last_scan_time: Option<f64>,
    period: f64,
    n_ceiling: usize,
    next_track_id: u64,
}

impl Tracker {
    /// Entry point for configuration.
    pub fn builder() -> TrackerBuilder {
        TrackerBuilder::new()
    }

    /// The parameters this tracker runs with.
    pub fn parameters(&self) -> &TrackerParameters {
        &self.params
    }

    /// Number of active targets.
    pub fn active_track_count(&self) -> usize {
        self.state.len()
    }

    /// Read access to an active target.
    pub fn target(&self, index: usize) -> &TargetTree {
        &self.state.targets[index]
    }

    /// The per-target sliding windows, index-aligned with the targets.
    pub fn window_sizes(&self) -> &[usize] {
        &self.state.windows
    }

    /// Targets whose history was preserved at termination.
    pub fn terminated_tracks(&self) -> &[TargetTree] {
        &self.terminated
    }

    /// Stage timing accumulated over the run.
    pub fn runtime_log(&self) -> &RuntimeLog {
        &self.runtime
    }

    /// Number of scans processed so far.
    pub fn scan_count(&self) -> usize {
        self.scan_count
    }

    /// Seeds a target from an initial posterior. Candidates within the merge
    /// threshold of an active track are dropped.
    pub fn initiate_target(&mut self, candidate: InitialTarget) {
        let position = candidate.position();
        for (target, &selected) in self.state.targets.iter().zip(self.state.selected.iter()) {
            let active = target.node(selected).position();
            if (active - position).norm_squared() < self.params.merge_threshold {
                log::debug!(
                    "discarding an initial target at ({:.1}, {:.1}): too close to track {}",
                    position[0],
                    position[1],
                    target.track_id()
                );
                return;
            }
        }
        let root = HypothesisNode::new(
            self.scan_count,
            candidate.time,
            MeasurementOrigin::Missed,
            candidate.state,
            candidate.covariance,
            0.0,
            self.params.p_d,
        );
        let track_id = self.next_track_id;
        self.next_track_id += 1;
        log::info!(
            "new target {} at ({:.1}, {:.1})",
            track_id,
            position[0],
            position[1]
        );
        self.state.push(TargetTree::new(track_id, root), self.n_ceiling);
    }

    /// Processes one scan, with optional AIS reports at the same timestamp,
    /// and returns the selected hypothesis of every active target.
    pub fn add_scan(
        &mut self,
        scan: ScanList,
        ais: Option<AisList>,
    ) -> TomhtResult<Vec<TrackReport>> {
        if let Some(last) = self.last_scan_time {
            if scan.time <= last {
                return Err(ScanError::NonMonotonicTime {
                    last,
                    next: scan.time,
                }
                .into());
            }
        }
        if let Some(ais) = &ais {
            if ais.time != scan.time {
                return Err(ScanError::AisTimeMismatch {
                    radar: scan.time,
                    ais: ais.time,
                }
                .into());
            }
        }
        if self.params.check_integrity {
            self.check_integrity()?;
        }
        let tic_total = Instant::now();
        let scan_number = self.scan_count + 1;
        let n_meas = scan.len();
        if !self.params.fixed_period {
            if let Some(last) = self.last_scan_time {
                self.period = scan.time - last;
            }
        }
        log::info!(
            "scan {} with {} measurements and {} AIS reports",
            scan_number,
            n_meas,
            ais.as_ref().map(AisList::len).unwrap_or(0)
        );
        let scan = Arc::new(scan);
        let ais = ais.map(Arc::new);

        // 1 -- grow each track tree
        let tic = Instant::now();
        let jobs: Vec<GrowthJob> = self
            .state
            .targets
            .iter()
            .enumerate()
            .map(|(index, tree)| GrowthJob::snapshot(index, tree, &scan, &ais, &self.params))
            .collect();
        let results = growth::grow_targets(jobs, self.params.workers);
        let mut used = vec![false; n_meas];
        let mut grow_seconds = vec![0.0f64; self.state.len()];
        for result in results {
            let index = result.target_index;
            let tree = &mut self.state.targets[index];
            let p_d = tree.p_d();
            let mut new_leaves = Vec::with_capacity(result.spawned.len());
            for record in result.spawned {
                let node = HypothesisNode::new(
                    scan_number,
                    scan.time,
                    record.origin,
                    record.x_hat,
                    record.p_hat,
                    record.cumulative_nllr,
                    p_d,
                );
                new_leaves.push(tree.attach_child(record.parent, node));
                for key in record.origin.keys(scan_number) {
                    self.state.associated[index].insert(key);
                }
            }
            tree.set_leaves(new_leaves);
            for &j in &result.gated_radar {
                used[j] = true;
            }
            grow_seconds[index] = result.elapsed.as_secs_f64();
        }
        self.runtime.record(Stage::Process, tic.elapsed().as_secs_f64());

        // 2 -- cluster targets
        let tic = Instant::now();
        let clusters = clustering::find_clusters(&self.state.associated);
        self.runtime.record(Stage::Cluster, tic.elapsed().as_secs_f64());

        // 3 -- maximise the cluster-wise likelihood
        let tic = Instant::now();
        let mut solved = 0usize;
        for cluster in &clusters {
            if cluster.len() == 1 {
                let index = cluster[0];
                if let Some(threshold) = self.params.prune_threshold {
                    self.state.targets[index].prune_similar_leaves(threshold);
                }
                self.state.selected[index] = self.state.targets[index].select_best_leaf();
            } else {
                let picks =
                    assignment::solve_cluster(&self.state.targets, cluster, self.solver.as_ref())?;
                for (index, leaf) in picks {
                    self.state.selected[index] = leaf;
                }
                solved += 1;
            }
        }
        self.runtime.record(Stage::Optimize, tic.elapsed().as_secs_f64());

        // 4 -- dynamic window adaptation
        let tic = Instant::now();
        self.adapt_windows(&grow_seconds, tic_total);
        self.runtime
            .record(Stage::DynamicWindow, tic.elapsed().as_secs_f64());

        // 5 -- N-scan pruning
        let tic = Instant::now();
        for index in 0..self.state.len() {
            let (selected, changed) = self.state.targets[index]
                .prune_to_window(self.state.selected[index], self.state.windows[index]);
            self.state.selected[index] = selected;
            if changed {
                self.state.associated[index] = self.state.targets[index].measurement_set();
            }
        }
        self.runtime.record(Stage::Prune, tic.elapsed().as_secs_f64());

        // 6 -- terminate dead tracks
        let tic = Instant::now();
        self.terminate_dead_tracks();
        self.runtime
            .record(Stage::Terminate, tic.elapsed().as_secs_f64());

        // 7 -- initiate new tracks from the unused measurements. The scan is
        // committed first so fresh targets sit at the scan that confirmed them.
        self.scan_count = scan_number;
        self.last_scan_time = Some(scan.time);
        let tic = Instant::now();
        let unused: Vec<Point> = scan
            .measurements
            .iter()
            .enumerate()
            .filter(|(j, _)| !used[*j])
            .map(|(_, &z)| z)
            .collect();
        let candidates = self.initiator.process(&unused, scan.time);
        for candidate in candidates {
            self.initiate_target(candidate);
        }
        self.runtime
            .record(Stage::Initiate, tic.elapsed().as_secs_f64());

        let total = tic_total.elapsed().as_secs_f64();
        self.runtime.record(Stage::Total, total);
        if total > self.period {
            log::error!(
                "did not meet the real-time demand: used {:.0} ms of {:.0} ms",
                total * 1e3,
                self.period * 1e3
            );
        } else if total > self.period * 0.6 {
            log::warn!(
                "close to the real-time demand: used {:.0} ms of {:.0} ms",
                total * 1e3,
                self.period * 1e3
            );
        }
        log::debug!(
            "scan {} tracks {} clusters {} solved {} total {:.1} ms",
            scan_number,
            self.state.len(),
            clusters.len(),
            solved,
            total * 1e3
        );
        if self.params.check_integrity {
            self.check_integrity()?;
        }
        Ok(self.reports(scan.time))
    }

    /// Shrinks the window of targets that grew too slowly or too large, and
    /// the global ceiling when the whole scan blew its budget.
    fn adapt_windows(&mut self, grow_seconds: &[f64], tic_total: Instant) {
        if self.state.len() == 0 {
            return;
        }
        let total_grow: f64 = grow_seconds.iter().sum();
        let grow_limit = self.period * 0.5;
        let per_target_limit = if total_grow > grow_limit {
            grow_limit / self.state.len() as f64
        } else {
            0.2
        };
        for index in 0..self.state.len() {
            let too_slow = grow_seconds[index] > per_target_limit;
            let too_large = self.state.targets[index].node_count() > self.params.target_size_limit;
            if (too_slow || too_large) && self.state.windows[index] > 1 {
                self.state.windows[index] -= 1;
                log::debug!(
                    "target {}: {}{}reducing window to {}",
                    self.state.targets[index].track_id(),
                    if too_slow { "too slow, " } else { "" },
                    if too_large { "too large, " } else { "" },
                    self.state.windows[index]
                );
            }
        }
        if tic_total.elapsed().as_secs_f64() > self.period * 0.8 && self.n_ceiling > 1 {
            self.n_ceiling -= 1;
            log::warn!(
                "scan over 80% of the period, reducing the window ceiling to {}",
                self.n_ceiling
            );
            for window in &mut self.state.windows {
                *window = (*window).min(self.n_ceiling);
            }
        }
    }

    /// Removes targets that left the radar disk or whose selected score shows
    /// the track is no longer credible. Histories are preserved.
    fn terminate_dead_tracks(&mut self) {
        let mut dead = Vec::new();
        for index in 0..self.state.len() {
            let target = &self.state.targets[index];
            let node = target.node(self.state.selected[index]);
            if node.is_outside_range(&self.params.radar_position, self.params.radar_range) {
                log::info!(
                    "terminating track {} at ({:.1}, {:.1}): out of range",
                    target.track_id(),
                    node.position()[0],
                    node.position()[1]
                );
                dead.push(index);
            } else if node.cumulative_nllr() > self.params.nllr_upper_limit {
                log::info!(
                    "terminating track {}: score {:.1} above the threshold {:.1}",
                    target.track_id(),
                    node.cumulative_nllr(),
                    self.params.nllr_upper_limit
                );
                dead.push(index);
            }
        }
        for &index in dead.iter().rev() {
            let (mut target, selected) = self.state.remove(index);
            target.retain_spine(selected);
            self.terminated.push(target);
        }
    }

    /// The selected hypothesis of every active target at `time`.
    fn reports(&self, time: f64) -> Vec<TrackReport> {
        self.state
            .targets
            .iter()
            .zip(self.state.selected.iter())
            .map(|(target, &selected)| {
                let node = target.node(selected);
                TrackReport {
                    track_id: target.track_id(),
                    time,
                    state: *node.state(),
                    covariance: *node.covariance(),
                    cumulative_nllr: node.cumulative_nllr(),
                    history: target.position_history(selected),
                }
            })
            .collect()
    }

    /// Verifies the coupled-array and per-tree invariants. Failure means a
    /// bug in the tracker, not bad input, and aborts the scan.
    pub fn check_integrity(&self) -> TomhtResult<()> {
        self.state
            .check_lengths()
            .map_err(|message| TomhtError::Invariant { message })?;
        let mut seen_ids = Vec::with_capacity(self.state.len());
        for index in 0..self.state.len() {
            let target = &self.state.targets[index];
            if seen_ids.contains(&target.track_id()) {
                return Err(TomhtError::Invariant {
                    message: format!("track id {} appears twice", target.track_id()),
                });
            }
            seen_ids.push(target.track_id());
            target
                .check_consistency(self.scan_count, self.state.windows[index])
                .map_err(|message| TomhtError::Invariant { message })?;
            if !target.node(self.state.selected[index]).is_leaf() {
                return Err(TomhtError::Invariant {
                    message: format!("selected node of track {} is not a leaf", target.track_id()),
                });
            }
        }
        Ok(())
    }
}
