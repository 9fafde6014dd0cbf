//! Model controller: outer loop, sync scheduling, telemetry, outputs
//!
//! The model owns one domain and its scheme and drives the whole run:
//!
//! ```text
//! prepare (done by the builder) → save initial checkpoint
//! while current_time < simulation_length:
//!     target ← propose_sync_point(current), clamped to the next output
//!             instant and the simulation length
//!     repeat: run_simulation(target, wall) / wait until idle
//!         on failure → rollback(last_sync, revised target); twice for the
//!                      same target → model-stop
//!         on sync-ready → break
//!     record the sync, snapshot the state, emit outputs on instants
//! cleanup
//! ```
//!
//! A target never exceeds the next scheduled output instant
//! (`(⌊last_sync/frequency⌋ + 1) · frequency`) nor the simulation length, so
//! the run lands on every output time exactly.
//!
//! Progress telemetry is throttled to one block per 0.85 s of wall time and
//! summarises simulation time, processing time, ETA, cell rate, queue size
//! and the batch counters.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{CartesianDomain, DomainError};
use crate::scheme::{Scheme, SchemeError};
use crate::{Severity, TIME_EPSILON};

/// Seconds between progress blocks.
const PROGRESS_INTERVAL: f64 = 0.85;

/// Top-level run parameters.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct ModelSettings {
    /// Total simulated seconds.
    pub simulation_length: f64,
    /// Spacing of output instants; `0` disables intermediate outputs.
    pub output_frequency: f64,
}

impl ModelSettings {
    pub fn new(simulation_length: f64, output_frequency: f64) -> ModelSettings {
        ModelSettings {
            simulation_length,
            output_frequency,
        }
    }
}

/// What went wrong, and when in simulated time.
#[derive(Debug, Error)]
#[error("simulation failed at t = {time}s")]
pub struct SimulationError {
    pub time: f64,
    pub severity: Severity,
    #[source]
    pub kind: SimulationErrorKind,
}

#[derive(Debug, Error)]
pub enum SimulationErrorKind {
    #[error(transparent)]
    Scheme(#[from] SchemeError),
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("aborted by request")]
    Aborted,
    #[error("repeated rollback for target {target}s")]
    RepeatedRollback { target: f64 },
    #[error("scheme worker failed: {0}")]
    Worker(String),
}

impl SimulationError {
    fn stop(time: f64, kind: impl Into<SimulationErrorKind>) -> SimulationError {
        SimulationError {
            time,
            severity: Severity::ModelStop,
            kind: kind.into(),
        }
    }
}

/// Receiver for the per-instant output arrays.
pub trait OutputSink {
    fn write_output(
        &mut self,
        time: f64,
        domain: &mut CartesianDomain,
        scheme: &Scheme,
    ) -> Result<(), DomainError>;
}

/// Default sink: logs depth statistics and total volume per instant.
pub struct LogSink;

impl OutputSink for LogSink {
    fn write_output(
        &mut self,
        time: f64,
        domain: &mut CartesianDomain,
        scheme: &Scheme,
    ) -> Result<(), DomainError> {
        let depths = domain.read_depths(scheme)?;
        let wet = depths.iter().filter(|h| **h > 1e-6).count();
        let peak = depths.iter().cloned().fold(0.0f64, f64::max);
        info!(
            time,
            volume = domain.volume(),
            wet_cells = wet,
            peak_depth = peak,
            "output instant"
        );
        Ok(())
    }
}

/// Wall-clock stopwatch for processing-time accounting.
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Stopwatch {
        Stopwatch {
            started: Instant::now(),
        }
    }

    pub fn seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

struct ProgressMonitor {
    last_report: f64,
}

impl ProgressMonitor {
    fn new() -> ProgressMonitor {
        ProgressMonitor { last_report: 0.0 }
    }

    fn maybe_report(&mut self, wall: f64, scheme: &Scheme, simulation_length: f64) {
        if wall - self.last_report <= PROGRESS_INTERVAL {
            return;
        }
        self.last_report = wall;
        let current = scheme.current_time().min(simulation_length);
        let fraction = if simulation_length > 0.0 {
            current / simulation_length
        } else {
            1.0
        };
        let cells = scheme.cells_calculated();
        let rate = if wall > 0.0 {
            (cells as f64 / wall) as u64
        } else {
            0
        };
        let eta = if fraction > 0.0 {
            ((1.0 - fraction) * (wall / fraction)).min(31_536_000.0)
        } else {
            0.0
        };
        let batch = scheme.batch_statistics();
        info!(
            simulation_time = current,
            progress = format!("{:.1}%", fraction * 100.0),
            processing_time = wall,
            eta_seconds = eta,
            cells_per_second = rate,
            queue_size = scheme.queue_size(),
            batch_timesteps = batch.timesteps_total,
            batch_successful = batch.successful,
            batch_skipped = batch.skipped,
            "simulation progress"
        );
    }
}

/// Outcome of a completed run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub final_time: f64,
    pub final_volume: f64,
    /// Every synchronisation instant in order, including the final one.
    pub sync_times: Vec<f64>,
    pub rollbacks: u32,
    pub processing_seconds: f64,
    pub cells_calculated: u64,
}

/// The top-level lifecycle owner: one domain, one scheme, one run loop.
pub struct Model {
    domain: CartesianDomain,
    scheme: Scheme,
    settings: ModelSettings,
    sink: Option<Box<dyn OutputSink>>,
    forced_abort: Arc<AtomicBool>,
    last_sync_time: f64,
    last_output_time: f64,
}

impl Model {
    pub fn new(domain: CartesianDomain, scheme: Scheme, settings: ModelSettings) -> Model {
        Model {
            domain,
            scheme,
            settings,
            sink: None,
            forced_abort: Arc::new(AtomicBool::new(false)),
            last_sync_time: 0.0,
            last_output_time: 0.0,
        }
    }

    pub fn set_output_sink(&mut self, sink: Box<dyn OutputSink>) {
        self.sink = Some(sink);
    }

    /// Cooperative abort flag: set it from any thread to stop after the
    /// in-flight batch completes. In-flight kernels are never pre-empted.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.forced_abort)
    }

    pub fn domain(&self) -> &CartesianDomain {
        &self.domain
    }

    pub fn domain_mut(&mut self) -> &mut CartesianDomain {
        &mut self.domain
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    // -- output read-back -------------------------------------------------

    pub fn read_depths(&mut self) -> Result<Vec<f64>, DomainError> {
        self.domain.read_depths(&self.scheme)
    }

    pub fn read_dsdt(&mut self) -> Result<Vec<f64>, DomainError> {
        self.domain.read_dsdt(&self.scheme)
    }

    pub fn read_velocity_x(&mut self) -> Result<Vec<f64>, DomainError> {
        let threshold = self.scheme.settings().dry_threshold;
        self.domain.read_velocity_x(&self.scheme, threshold)
    }

    pub fn read_velocity_y(&mut self) -> Result<Vec<f64>, DomainError> {
        let threshold = self.scheme.settings().dry_threshold;
        self.domain.read_velocity_y(&self.scheme, threshold)
    }

    // -- target scheduling -------------------------------------------------

    /// Propose the next sync target from `base`, clamped to the simulation
    /// length and the next scheduled output instant.
    fn propose_target(&self, base: f64) -> f64 {
        let mut proposal = self
            .scheme
            .propose_sync_point(base)
            .min(self.settings.simulation_length);
        let frequency = self.settings.output_frequency;
        if frequency > 0.0
            && (proposal / frequency).floor() > (self.last_sync_time / frequency).floor()
        {
            proposal = ((self.last_sync_time / frequency).floor() + 1.0) * frequency;
        }
        proposal
    }

    fn emit_outputs(&mut self, now: f64) -> Result<(), SimulationError> {
        let frequency = self.settings.output_frequency;
        if frequency <= 0.0 {
            return Ok(());
        }
        let crossed = ((now + TIME_EPSILON) / frequency).floor()
            > ((self.last_output_time + TIME_EPSILON) / frequency).floor();
        let at_end = now >= self.settings.simulation_length - TIME_EPSILON;
        if crossed || at_end {
            self.last_output_time = now;
            if let Some(mut sink) = self.sink.take() {
                let result = sink.write_output(now, &mut self.domain, &self.scheme);
                self.sink = Some(sink);
                result.map_err(|e| SimulationError::stop(now, e))?;
            }
        }
        Ok(())
    }

    // -- the run loop ------------------------------------------------------

    /// Run the simulation to completion (or failure) and summarise it.
    pub fn run(&mut self) -> Result<RunSummary, SimulationError> {
        let stopwatch = Stopwatch::start();
        let mut progress = ProgressMonitor::new();
        let length = self.settings.simulation_length;

        info!(volume = self.domain.volume(), "initial domain volume");
        self.last_sync_time = 0.0;
        self.last_output_time = 0.0;

        // Checkpoint the initial state so the very first batch can roll back.
        self.scheme
            .save_current_state()
            .map_err(|e| SimulationError::stop(0.0, e))?;

        let mut sync_times = Vec::new();
        let mut rollbacks = 0u32;
        let mut last_failed_target: Option<f64> = None;

        while self.scheme.current_time() < length - TIME_EPSILON {
            let current = self.scheme.current_time();
            if self.forced_abort.load(Ordering::Relaxed) {
                return Err(SimulationError::stop(current, SimulationErrorKind::Aborted));
            }

            let mut target = self.propose_target(current);
            self.scheme
                .set_target_time(target)
                .map_err(|e| SimulationError::stop(current, e))?;

            loop {
                let wall = stopwatch.seconds();
                self.scheme
                    .run_simulation(target, wall)
                    .map_err(|e| SimulationError::stop(self.scheme.current_time(), e))?;
                self.scheme.wait_until_idle();
                progress.maybe_report(stopwatch.seconds(), &self.scheme, length);

                let now = self.scheme.current_time();
                if let Some(message) = self.scheme.worker_error() {
                    return Err(SimulationError::stop(
                        now,
                        SimulationErrorKind::Worker(message),
                    ));
                }
                if self.forced_abort.load(Ordering::Relaxed) {
                    return Err(SimulationError::stop(now, SimulationErrorKind::Aborted));
                }

                if self.scheme.is_simulation_failure(target) {
                    if last_failed_target == Some(target) {
                        return Err(SimulationError::stop(
                            now,
                            SimulationErrorKind::RepeatedRollback { target },
                        ));
                    }
                    last_failed_target = Some(target);
                    rollbacks += 1;
                    let revised = self.propose_target(self.last_sync_time).min(target);
                    warn!(
                        failed_at = now,
                        revised_target = revised,
                        "rollback invoked; revising the sync point"
                    );
                    self.scheme
                        .rollback(self.last_sync_time, revised)
                        .map_err(|e| SimulationError::stop(now, e))?;
                    target = revised;
                    continue;
                }
                if self.scheme.is_sync_ready(target) {
                    break;
                }
            }

            // The sync point is reached and downloaded.
            let now = self.scheme.current_time();
            self.last_sync_time = now;
            last_failed_target = None;
            sync_times.push(now);
            self.scheme
                .save_current_state()
                .map_err(|e| SimulationError::stop(now, e))?;
            self.emit_outputs(now)?;
        }

        let final_time = self.scheme.current_time();
        let depths = self
            .read_depths()
            .map_err(|e| SimulationError::stop(final_time, e))?;
        let final_volume = self.domain.volume();
        let wet = depths.iter().filter(|h| **h > 1e-6).count();
        info!(
            final_time,
            final_volume,
            wet_cells = wet,
            processing_seconds = stopwatch.seconds(),
            "simulation finished"
        );

        Ok(RunSummary {
            final_time,
            final_volume,
            sync_times,
            rollbacks,
            processing_seconds: stopwatch.seconds(),
            cells_calculated: self.scheme.cells_calculated(),
        })
    }

    /// Release device resources; the model stays inspectable afterwards.
    pub fn cleanup(&mut self) {
        self.scheme.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::{
        BoundaryDefinition, BoundaryKind, BoundarySet, DepthValue, DischargeValue, GridSlice,
        UniformValue,
    };
    use crate::device::{DeviceFilter, Executor};
    use crate::domain::{DomainDefinition, InputKind};
    use crate::scheme::{SchemeSettings, SyncMethod};
    use crate::Precision;

    fn flat_domain(cols: u32, rows: u32, resolution: f64) -> CartesianDomain {
        let mut d = CartesianDomain::new(DomainDefinition {
            cols,
            rows,
            resolution,
            offset_x: 0.0,
            offset_y: 0.0,
            precision: Precision::Double,
        })
        .unwrap();
        for id in 0..d.cell_count() {
            d.handle_input_data(id, 0.0, InputKind::BedElevation, 4).unwrap();
        }
        d
    }

    fn build_model(
        domain: CartesianDomain,
        definitions: &[BoundaryDefinition],
        settings: SchemeSettings,
        model: ModelSettings,
    ) -> Model {
        let mut exec = Executor::new();
        let device = exec.select_device(&DeviceFilter::default()).unwrap();
        let boundaries = BoundarySet::from_definitions(definitions, &domain);
        let scheme = Scheme::prepare(
            &device,
            &domain,
            boundaries,
            SyncMethod::Forecast,
            settings,
            model.simulation_length,
            model.output_frequency,
        )
        .unwrap();
        Model::new(domain, scheme, model)
    }

    #[test]
    fn flat_dry_plain_stays_dry() {
        // 100×100 grid, Δx = 10 m, no sources, 60 s.
        let domain = flat_domain(100, 100, 10.0);
        let mut model = build_model(
            domain,
            &[],
            SchemeSettings::default(),
            ModelSettings::new(60.0, 60.0),
        );
        let summary = model.run().unwrap();
        assert!((summary.final_time - 60.0).abs() <= TIME_EPSILON);
        assert!(summary.final_volume <= 1e-9);
        let stats = model.scheme().batch_statistics();
        assert!(stats.successful >= 1);
        assert_eq!(stats.skipped, 0);
        let depths = model.read_depths().unwrap();
        assert!(depths.iter().all(|h| *h <= 1e-10));
    }

    #[test]
    fn uniform_rainfall_conserves_injected_volume() {
        // 10 mm/h over 100×100 cells of 100 m² for one hour: 10⁴ m³.
        let domain = flat_domain(100, 100, 10.0);
        let rain = BoundaryDefinition {
            name: "rain".to_string(),
            kind: BoundaryKind::Uniform {
                value: UniformValue::RainIntensity,
                rows: vec![vec![0.0, 10.0], vec![7200.0, 10.0]],
            },
        };
        let mut model = build_model(
            domain,
            &[rain],
            SchemeSettings::default(),
            ModelSettings::new(3600.0, 3600.0),
        );
        let summary = model.run().unwrap();
        assert!((summary.final_time - 3600.0).abs() <= TIME_EPSILON);
        let expected = 1.0e4;
        assert!(
            (summary.final_volume - expected).abs() <= expected * 0.01,
            "volume {} differs from {} by more than 1%",
            summary.final_volume,
            expected
        );
    }

    #[test]
    fn point_source_injects_ten_cubic_metres() {
        // 1 m³/s across the boundary for 10 s, then 0; 30 s simulated.
        let domain = flat_domain(50, 50, 10.0);
        let inflow = BoundaryDefinition {
            name: "inflow".to_string(),
            kind: BoundaryKind::Cell {
                depth: DepthValue::Ignore,
                discharge: DischargeValue::Total,
                rows: vec![
                    vec![0.0, 0.0, 1.0, 0.0],
                    vec![10.0, 0.0, 0.0, 0.0],
                    vec![20.0, 0.0, 0.0, 0.0],
                ],
                relations: vec![(25, 25)],
            },
        };
        let settings = SchemeSettings {
            // Keep Δt fine enough that the freshly wetted cell stays stable.
            maximum_timestep: 2.0,
            ..Default::default()
        };
        let mut model = build_model(
            domain,
            &[inflow],
            settings,
            ModelSettings::new(30.0, 30.0),
        );
        let summary = model.run().unwrap();
        let expected = 10.0;
        assert!(
            (summary.final_volume - expected).abs() <= expected * 0.01,
            "volume {} differs from {} by more than 1%",
            summary.final_volume,
            expected
        );
        let depths = model.read_depths().unwrap();
        let wet = depths.iter().filter(|h| **h > 1e-6).count();
        assert!(wet >= 1);
    }

    #[test]
    fn gridded_rainfall_wets_only_the_covered_half() {
        let domain = flat_domain(10, 10, 10.0);
        // Rain over the left half only.
        let mut slab = vec![0.0; 100];
        for j in 0..10 {
            for i in 0..5 {
                slab[j * 10 + i] = 36.0; // mm/h → 1e-5 m/s
            }
        }
        let radar = BoundaryDefinition {
            name: "radar".to_string(),
            kind: BoundaryKind::Gridded {
                slices: vec![
                    GridSlice {
                        time: 0.0,
                        values: slab.clone(),
                    },
                    GridSlice {
                        time: 600.0,
                        values: slab,
                    },
                ],
            },
        };
        let mut model = build_model(
            domain,
            &[radar],
            SchemeSettings::default(),
            ModelSettings::new(100.0, 100.0),
        );
        let summary = model.run().unwrap();
        // 50 cells × 100 m² × 1e-5 m/s × 100 s = 5 m³.
        assert!((summary.final_volume - 5.0).abs() <= 0.25);
    }

    #[test]
    fn rollback_limited_run_completes_with_conserved_volume() {
        // Intense rain keeps shrinking the CFL step, so a forecast with no
        // spare iterations oversteps its budget and must roll back; the
        // re-run covers the same window and the injected volume is unchanged.
        let domain = flat_domain(10, 10, 10.0);
        let rain = BoundaryDefinition {
            name: "deluge".to_string(),
            kind: BoundaryKind::Uniform {
                value: UniformValue::RainIntensity,
                rows: vec![vec![0.0, 36_000.0], vec![400.0, 36_000.0]],
            },
        };
        let settings = SchemeSettings {
            rollback_limit: 5,
            sync_batch_spares: 0,
            ..Default::default()
        };
        let mut model = build_model(
            domain,
            &[rain],
            settings,
            ModelSettings::new(200.0, 200.0),
        );
        let summary = model.run().unwrap();
        assert!((summary.final_time - 200.0).abs() <= TIME_EPSILON);
        assert!(summary.rollbacks >= 1, "expected at least one rollback");
        // 0.01 m/s over 10⁴ m² for 200 s.
        let expected = 2.0e4;
        assert!(
            (summary.final_volume - expected).abs() <= expected * 0.005,
            "volume {} drifted from {}",
            summary.final_volume,
            expected
        );
    }

    #[test]
    fn sync_times_include_every_output_instant() {
        let domain = flat_domain(10, 10, 10.0);
        let mut model = build_model(
            domain,
            &[],
            SchemeSettings::default(),
            ModelSettings::new(250.0, 100.0),
        );
        let summary = model.run().unwrap();
        for instant in [100.0, 200.0] {
            assert!(
                summary
                    .sync_times
                    .iter()
                    .any(|t| (t - instant).abs() <= TIME_EPSILON),
                "sync times {:?} miss {}",
                summary.sync_times,
                instant
            );
        }
        // And none skipped past an instant.
        let mut previous: f64 = 0.0;
        for t in &summary.sync_times {
            assert!(
                (previous / 100.0).floor() >= (t / 100.0).floor() - 1.0,
                "sync sequence jumped over an output instant: {:?}",
                summary.sync_times
            );
            previous = *t;
        }
        assert!((summary.final_time - 250.0).abs() <= TIME_EPSILON);
    }

    #[test]
    fn disabled_cells_take_no_water_and_no_discharge() {
        let mut domain = flat_domain(10, 10, 10.0);
        // Disable the top-right quadrant.
        for j in 5..10u32 {
            for i in 5..10u32 {
                let id = domain.cell_id(i, j);
                domain.handle_input_data(id, 2.0, InputKind::DisabledCells, 4).unwrap();
            }
        }
        let rain = BoundaryDefinition {
            name: "rain".to_string(),
            kind: BoundaryKind::Uniform {
                value: UniformValue::RainIntensity,
                rows: vec![vec![0.0, 360.0], vec![600.0, 360.0]],
            },
        };
        let mut model = build_model(
            domain,
            &[rain],
            SchemeSettings::default(),
            ModelSettings::new(100.0, 100.0),
        );
        let summary = model.run().unwrap();
        // 75 enabled cells × 100 m² × 1e-4 m/s × 100 s.
        let expected = 75.0 * 100.0 * 1.0e-4 * 100.0;
        assert!((summary.final_volume - expected).abs() <= expected * 0.01);

        let depths = model.read_depths().unwrap();
        let vx = model.read_velocity_x().unwrap();
        let vy = model.read_velocity_y().unwrap();
        for j in 5..10u32 {
            for i in 5..10u32 {
                let id = model.domain().cell_id(i, j);
                assert!(model.domain().is_cell_disabled(id));
                assert_eq!(depths[id], 0.0);
                assert_eq!(vx[id], 0.0);
                assert_eq!(vy[id], 0.0);
            }
        }
    }

    #[test]
    fn abort_flag_stops_the_run() {
        let domain = flat_domain(10, 10, 10.0);
        let mut model = build_model(
            domain,
            &[],
            SchemeSettings::default(),
            ModelSettings::new(60.0, 60.0),
        );
        model.abort_flag().store(true, Ordering::Relaxed);
        let err = model.run().unwrap_err();
        assert!(matches!(err.kind, SimulationErrorKind::Aborted));
        assert_eq!(err.severity, Severity::ModelStop);
    }

    #[test]
    fn output_sink_sees_every_instant() {
        struct Recorder(Arc<std::sync::Mutex<Vec<f64>>>);
        impl OutputSink for Recorder {
            fn write_output(
                &mut self,
                time: f64,
                _domain: &mut CartesianDomain,
                _scheme: &Scheme,
            ) -> Result<(), DomainError> {
                self.0.lock().unwrap().push(time);
                Ok(())
            }
        }

        let recorded = Arc::new(std::sync::Mutex::new(Vec::new()));
        let domain = flat_domain(8, 8, 10.0);
        let mut model = build_model(
            domain,
            &[],
            SchemeSettings::default(),
            ModelSettings::new(200.0, 100.0),
        );
        model.set_output_sink(Box::new(Recorder(Arc::clone(&recorded))));
        model.run().unwrap();
        let times = recorded.lock().unwrap().clone();
        assert!(times.iter().any(|t| (t - 100.0).abs() <= TIME_EPSILON));
        assert!(times.iter().any(|t| (t - 200.0).abs() <= TIME_EPSILON));
    }
}
