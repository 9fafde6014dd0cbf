//! The scheme orchestrator: device resources, batch worker, rollback
//!
//! This is the engine's core state machine. A [`Scheme`] owns everything a
//! numerical scheme needs on the device — the compiled program, fifteen
//! persistent buffers, the kernel objects — and a dedicated worker thread
//! that submits *batches* of iterations between host synchronisations.
//!
//! ## Double-buffered state
//!
//! Two cell-state buffers `A`/`B` alternate: a flag selects the *read* side,
//! the flux kernel writes the opposite side, and the flag toggles after every
//! iteration. Boundary kernels and the timestep reduction are rebound to the
//! current side each iteration rather than duplicating kernel objects.
//! After any barrier the current side holds the freshest state.
//!
//! ## One iteration
//!
//! ```text
//! boundaries(current) ─ barrier ─ flux(current → other) ─ barrier ─
//! [friction(other)] ─ barrier ─ [reduction(other)] ─ barrier ─
//! advance ─ barrier ─ toggle
//! ```
//!
//! The 1-work-item advance kernel commits the iteration's Δt to the clock and
//! counters, then proposes the next Δt clamped so the target time is never
//! overshot.
//!
//! ## The batch worker
//!
//! The worker drains a command channel: `SetTargetTime`, `ForceTimestep`,
//! `StartBatch`, `SaveState`, `ReadBack*`, `ImportState`, `Rollback`, `Stop`.
//! All device submissions originate here; the public API methods only send
//! messages and read the shared status slot, so they never suspend on the
//! queue. After each batch the worker downloads `(Δt, time, batch counters)`,
//! mirrors them into the status slot and signals the condition variable the
//! controller waits on.
//!
//! Failure and sync-readiness predicates, the forecast target proposal and
//! rollback follow the policies described in the module functions below.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::boundary::{BoundaryContext, BoundaryError, BoundarySet};
use crate::device::{Buffer, Device, DeviceError, DeviceInfo, Kernel};
use crate::domain::{CartesianDomain, DomainDescriptor, DomainError, StateImage, StateSync};
use crate::kernels;
use crate::program::{CompileError, Program};
use crate::{Precision, TIME_EPSILON};

/// Failures raised while preparing or driving a scheme (model-stop).
#[derive(Debug, Error)]
pub enum SchemeError {
    #[error("scheme variant {0:?} is not implemented")]
    UnsupportedScheme(SchemeVariant),
    #[error("scheme worker is not available")]
    WorkerUnavailable,
    #[error("rollback requested without a saved state snapshot")]
    NoSnapshot,
    #[error("worker failed: {0}")]
    Worker(String),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Boundary(#[from] BoundaryError),
}

// ============================================================================
// Options
// ============================================================================

/// The numerical scheme driving the flux kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemeVariant {
    /// First-order Godunov-type scheme with the HLLC-family solver.
    Godunov,
    /// Second-order MUSCL–Hancock; accepted by the enum, rejected at prepare.
    MusclHancock,
    /// Simplified inertial formulation.
    Inertial,
    /// Diffusive-wave variant with the monolithic boundary aggregator.
    Promaides,
}

impl SchemeVariant {
    /// Default work-splitting factor for the timestep reduction.
    pub fn default_reduction_wavefronts(self) -> u32 {
        match self {
            SchemeVariant::Promaides => 1000,
            _ => 200,
        }
    }
}

/// Dynamic (CFL-limited) or fixed timestep.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimestepMode {
    Cfl,
    Fixed,
}

/// Local-memory tiling of the main kernel (Godunov and inertial only).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMode {
    None,
    Enabled,
}

/// LDS sizing strategy for the cached kernels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheConstraints {
    Actual,
    AllowOversize,
    AllowUndersize,
}

/// Riemann solver selection (one presently implemented).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiemannSolver {
    Hllc,
}

/// How multiple domains keep their clocks together.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMethod {
    /// Host forecasts a safe target; the device runs freely up to it.
    Forecast,
    /// One iteration per external tick so domains can exchange Δt.
    Timestep,
}

/// Everything configurable about a scheme.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchemeSettings {
    pub variant: SchemeVariant,
    pub timestep_mode: TimestepMode,
    /// Initial Δt under CFL mode; the Δt under fixed mode.
    pub initial_timestep: f64,
    /// Ceiling on any proposed Δt; bounds the first jump on a mostly dry
    /// domain where the CFL reduction has nothing to bite on.
    pub maximum_timestep: f64,
    pub courant_number: f64,
    pub dry_threshold: f64,
    /// `None` selects the per-variant default (200 or 1000).
    pub reduction_wavefronts: Option<u32>,
    pub cache_mode: CacheMode,
    pub cache_constraints: CacheConstraints,
    pub riemann_solver: RiemannSolver,
    pub friction_effects: bool,
    /// Fuse friction into the flux kernel instead of a separate pass.
    pub friction_in_flux: bool,
    pub cached_workgroup: (u32, u32),
    pub non_cached_workgroup: (u32, u32),
    /// Device iterations permitted without a host sync before rollback.
    pub rollback_limit: u32,
    /// Spare iterations the forecast proposal leaves in hand.
    pub sync_batch_spares: u32,
}

impl Default for SchemeSettings {
    fn default() -> Self {
        SchemeSettings {
            variant: SchemeVariant::Godunov,
            timestep_mode: TimestepMode::Cfl,
            initial_timestep: 0.1,
            maximum_timestep: 10.0,
            courant_number: 0.5,
            dry_threshold: 1e-10,
            reduction_wavefronts: None,
            cache_mode: CacheMode::None,
            cache_constraints: CacheConstraints::Actual,
            riemann_solver: RiemannSolver::Hllc,
            friction_effects: false,
            friction_in_flux: true,
            cached_workgroup: (8, 8),
            non_cached_workgroup: (8, 8),
            rollback_limit: 999_999_999,
            sync_batch_spares: 3,
        }
    }
}

// ============================================================================
// Execution geometry
// ============================================================================

#[derive(Clone, Debug)]
struct ExecutionGeometry {
    non_cached_group: [usize; 2],
    non_cached_global: [usize; 2],
    cached_group: [usize; 2],
    cached_global: [usize; 2],
    reduction_group: usize,
    reduction_global: usize,
}

fn build_geometry(
    info: &DeviceInfo,
    desc: &DomainDescriptor,
    settings: &SchemeSettings,
) -> ExecutionGeometry {
    // Maximum permissible square work group for this device.
    let constraint_total = (info.max_work_group_size as f64).sqrt().floor() as usize;
    let constraint_dim = info.max_work_item_sizes[0].min(info.max_work_item_sizes[1]);
    let constraint = constraint_total.min(constraint_dim).max(1);

    let pick = |v: u32, fallback: usize| if v == 0 { fallback } else { v as usize };
    let undersize = matches!(settings.cache_constraints, CacheConstraints::AllowUndersize);
    let cached_fallback = if undersize {
        constraint.saturating_sub(1).max(1)
    } else {
        constraint
    };

    let non_cached_group = [
        pick(settings.non_cached_workgroup.0, constraint),
        pick(settings.non_cached_workgroup.1, constraint),
    ];
    let cached_group = [
        pick(settings.cached_workgroup.0, cached_fallback),
        pick(settings.cached_workgroup.1, constraint),
    ];

    // A cached kernel re-reads a two-cell halo, so its global size grows.
    let halo = |cells: usize, group: usize| -> usize {
        if matches!(settings.cache_mode, CacheMode::Enabled) && group > 2 {
            (cells as f64 * group as f64 / (group as f64 - 2.0)).ceil() as usize
        } else {
            cells
        }
    };

    let reduction_group = info.max_work_group_size.min(512);
    let wavefronts = settings
        .reduction_wavefronts
        .unwrap_or_else(|| settings.variant.default_reduction_wavefronts())
        .max(1) as f64;
    let items = (desc.cell_count as f64 / wavefronts).max(1.0);
    let reduction_global =
        (items / reduction_group as f64).ceil() as usize * reduction_group;

    ExecutionGeometry {
        non_cached_group,
        non_cached_global: [desc.cols, desc.rows],
        cached_group,
        cached_global: [
            halo(desc.cols, cached_group[0]),
            halo(desc.rows, cached_group[1]),
        ],
        reduction_group,
        reduction_global,
    }
}

// ============================================================================
// Shared status
// ============================================================================

/// Device-resident batch counters, host-mirrored after every batch.
#[derive(Clone, Debug, Default)]
pub struct BatchStatistics {
    /// Cumulative ΣΔt committed since the counters were last reset.
    pub timesteps_total: f64,
    pub successful: u32,
    pub skipped: u32,
    /// Successful iterations gained by the most recent batch (≥ 1).
    pub rate: u32,
}

#[derive(Debug)]
struct SchemeStatus {
    running: bool,
    current_time: f64,
    current_timestep: f64,
    batch: BatchStatistics,
    iterations_since_sync: u32,
    cell_states_synced: bool,
    cells_calculated: u64,
    last_sync_time: f64,
    worker_error: Option<String>,
}

struct StatusCell {
    state: Mutex<SchemeStatus>,
    idle: Condvar,
}

fn lock<'a, T>(m: &'a Mutex<T>) -> MutexGuard<'a, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Worker commands
// ============================================================================

enum WorkerCommand {
    SetTargetTime(f64),
    ForceTimestep(f64),
    StartBatch { queue_size: u32, download: bool },
    SaveState,
    ReadBackStates { reply: Sender<Result<StateImage, String>> },
    ReadBackDerivatives { reply: Sender<Result<StateImage, String>> },
    ImportState { image: StateImage },
    Rollback { time: f64, target: f64 },
    Stop,
}

// ============================================================================
// Device resources
// ============================================================================

struct SchemeBuffers {
    state_a: Buffer,
    state_b: Buffer,
    bed: Buffer,
    manning: Buffer,
    flow_flags: Buffer,
    bound_coup: Buffer,
    dsdt: Buffer,
    timestep: Buffer,
    time: Buffer,
    target_time: Buffer,
    hydro_time: Buffer,
    scratch: Buffer,
    batch_timesteps: Buffer,
    batch_successful: Buffer,
    batch_skipped: Buffer,
}

struct SchemeKernels {
    full_timestep: Kernel,
    friction: Kernel,
    reduce: Kernel,
    update: Kernel,
    advance: Kernel,
    reset: Kernel,
    /// Monolithic boundary aggregator, Promaides variant only.
    boundary: Option<Kernel>,
}

// ============================================================================
// Public handle
// ============================================================================

/// Host-side handle to a prepared scheme and its batch worker.
pub struct Scheme {
    settings: SchemeSettings,
    sync_method: SyncMethod,
    desc: DomainDescriptor,
    tx: Sender<WorkerCommand>,
    status: Arc<StatusCell>,
    worker: Option<JoinHandle<()>>,
    /// Host cache making repeated `set_target_time(T)` free of device work.
    target_time: f64,
    queue_size: u32,
    batch_started: f64,
    simulation_length: f64,
    output_frequency: f64,
}

impl Scheme {
    /// Run every preparation step: geometry, constants, compilation, buffer
    /// allocation and initial upload, kernel wiring, boundary prepare, and
    /// finally spawn the batch worker.
    pub fn prepare(
        device: &Device,
        domain: &CartesianDomain,
        mut boundaries: BoundarySet,
        sync_method: SyncMethod,
        settings: SchemeSettings,
        simulation_length: f64,
        output_frequency: f64,
    ) -> Result<Scheme, SchemeError> {
        if settings.variant == SchemeVariant::MusclHancock {
            return Err(SchemeError::UnsupportedScheme(settings.variant));
        }
        let desc = domain.descriptor();
        let geometry = build_geometry(device.info(), &desc, &settings);
        debug!(?geometry, "execution geometry");

        let mut program = Program::new(device);
        program.set_forced_single_precision(desc.precision == Precision::Single);
        register_constants(
            &mut program,
            &settings,
            &desc,
            &geometry,
            simulation_length,
            output_frequency,
        );

        // Headers first, bodies after: friction, timestep machinery, the
        // flux scheme, then the boundary kernels.
        program.append_code(kernels::friction_terms());
        program.append_code(kernels::dynamic_timestep());
        match settings.variant {
            SchemeVariant::Godunov => {
                program.append_code(kernels::godunov_scheme());
            }
            SchemeVariant::Inertial => {
                program.append_code(kernels::inertial_scheme());
            }
            SchemeVariant::Promaides => {
                program.append_code(kernels::promaides_scheme());
                program.append_code(kernels::promaides_boundary());
            }
            SchemeVariant::MusclHancock => unreachable!(),
        }
        program.append_code(kernels::boundary_conditions());
        program.compile()?;

        let buffers = allocate_buffers(device, &program, domain, &geometry, &settings)?;
        let kernels = wire_kernels(&program, &buffers, &geometry, &settings)?;

        let ctx = BoundaryContext {
            bed: &buffers.bed,
            manning: &buffers.manning,
            time: &buffers.time,
            hydro_time: &buffers.hydro_time,
            timestep: &buffers.timestep,
        };
        boundaries.prepare_all(&program, &ctx, desc.cols, desc.rows)?;

        device.block_until_finished()?;
        log_details(&settings, &boundaries, &desc);

        let status = Arc::new(StatusCell {
            state: Mutex::new(SchemeStatus {
                running: false,
                current_time: 0.0,
                current_timestep: settings.initial_timestep,
                batch: BatchStatistics::default(),
                iterations_since_sync: 0,
                cell_states_synced: true,
                cells_calculated: 0,
                last_sync_time: 0.0,
                worker_error: None,
            }),
            idle: Condvar::new(),
        });

        let (tx, rx) = unbounded::<WorkerCommand>();
        let worker = Worker {
            device: device.clone(),
            buffers,
            kernels,
            boundaries,
            settings: settings.clone(),
            sync_method,
            precision: desc.precision,
            desc,
            use_alternate: false,
            target_time: 0.0,
            current_time: 0.0,
            current_timestep: settings.initial_timestep,
            override_timestep: false,
            cell_states_synced: true,
            iterations_since_sync: 0,
            cells_calculated: 0,
            last_sync_time: 0.0,
            previous_successful: 0,
            snapshot: None,
            status: Arc::clone(&status),
        };
        let handle = thread::Builder::new()
            .name("scheme-batch-worker".to_string())
            .spawn(move || worker.run(rx))
            .map_err(|_| SchemeError::WorkerUnavailable)?;

        Ok(Scheme {
            settings,
            sync_method,
            desc,
            tx,
            status,
            worker: Some(handle),
            target_time: 0.0,
            queue_size: 1,
            batch_started: 0.0,
            simulation_length,
            output_frequency,
        })
    }

    pub fn settings(&self) -> &SchemeSettings {
        &self.settings
    }

    pub fn sync_method(&self) -> SyncMethod {
        self.sync_method
    }

    pub fn simulation_length(&self) -> f64 {
        self.simulation_length
    }

    pub fn output_frequency(&self) -> f64 {
        self.output_frequency
    }

    pub fn domain_descriptor(&self) -> &DomainDescriptor {
        &self.desc
    }

    fn send(&self, cmd: WorkerCommand) -> Result<(), SchemeError> {
        self.tx.send(cmd).map_err(|_| SchemeError::WorkerUnavailable)
    }

    // -- mirrored scalars -------------------------------------------------

    pub fn is_running(&self) -> bool {
        lock(&self.status.state).running
    }

    pub fn current_time(&self) -> f64 {
        lock(&self.status.state).current_time
    }

    pub fn current_timestep(&self) -> f64 {
        lock(&self.status.state).current_timestep
    }

    pub fn batch_statistics(&self) -> BatchStatistics {
        lock(&self.status.state).batch.clone()
    }

    pub fn cells_calculated(&self) -> u64 {
        lock(&self.status.state).cells_calculated
    }

    pub fn iterations_since_sync(&self) -> u32 {
        lock(&self.status.state).iterations_since_sync
    }

    pub fn last_sync_time(&self) -> f64 {
        lock(&self.status.state).last_sync_time
    }

    /// Most recent worker failure, if any (model-stop severity).
    pub fn worker_error(&self) -> Option<String> {
        lock(&self.status.state).worker_error.clone()
    }

    /// ΣΔt / successful iterations since the counters were reset.
    pub fn average_timestep(&self) -> f64 {
        let st = lock(&self.status.state);
        if st.batch.successful < 1 {
            0.0
        } else {
            st.batch.timesteps_total / f64::from(st.batch.successful)
        }
    }

    /// Batch queue size chosen by the adaptive tuner.
    pub fn queue_size(&self) -> u32 {
        self.queue_size
    }

    // -- control ----------------------------------------------------------

    /// Set the sync target. Idempotent: a repeated `T` enqueues nothing.
    pub fn set_target_time(&mut self, target: f64) -> Result<(), SchemeError> {
        if target == self.target_time {
            return Ok(());
        }
        self.target_time = target;
        self.send(WorkerCommand::SetTargetTime(target))
    }

    /// Force a specific Δt (timestep-sync exchange). No-op when unchanged.
    pub fn force_timestep(&mut self, timestep: f64) -> Result<(), SchemeError> {
        self.send(WorkerCommand::ForceTimestep(timestep))
    }

    /// Kick one batch toward `target`. `wall_seconds` is the caller's
    /// monotonic processing time, used by the adaptive batch sizing: the
    /// tuner aims for roughly one second of device work per batch.
    pub fn run_simulation(&mut self, target: f64, wall_seconds: f64) -> Result<(), SchemeError> {
        if self.is_running() {
            return Ok(());
        }
        if target != self.target_time {
            self.set_target_time(target)?;
        }
        let download = target - self.current_time() <= 0.0;

        if wall_seconds > TIME_EPSILON {
            let duration = wall_seconds - self.batch_started;
            let old = self.queue_size.max(1);
            let rate = self.batch_statistics().rate.max(1);
            let cap = rate.saturating_mul(3).max(1);
            let grown = if duration > 1e-9 {
                let ideal = (f64::from(old) / duration).ceil();
                if ideal >= f64::from(u32::MAX) {
                    u32::MAX
                } else {
                    ideal as u32
                }
            } else {
                u32::MAX
            };
            let mut next = grown.min(cap).max(1);
            // Damp silly jumps once the queue is already substantial.
            if next > old.saturating_mul(2) && next > 40 {
                next = cap.min(old.saturating_mul(2));
            }
            self.queue_size = next.max(1);
        }
        self.batch_started = wall_seconds;

        {
            let mut st = lock(&self.status.state);
            st.running = true;
        }
        let queue_size = self.queue_size;
        let sent = self.send(WorkerCommand::StartBatch {
            queue_size,
            download,
        });
        if sent.is_err() {
            lock(&self.status.state).running = false;
        }
        sent
    }

    /// Block until the worker finishes the in-flight batch (if any).
    pub fn wait_until_idle(&self) {
        let mut st = lock(&self.status.state);
        while st.running {
            st = match self.status.idle.wait(st) {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Snapshot the freshest cell state for a later rollback.
    pub fn save_current_state(&self) -> Result<(), SchemeError> {
        self.send(WorkerCommand::SaveState)
    }

    /// Import replacement state/coupling data (domain links).
    pub fn import_state(&self, image: StateImage) -> Result<(), SchemeError> {
        self.send(WorkerCommand::ImportState { image })
    }

    /// Roll the simulation back to `(time, target)` using the snapshot taken
    /// by [`Scheme::save_current_state`]. Valid only while the worker is idle.
    pub fn rollback(&mut self, time: f64, target: f64) -> Result<(), SchemeError> {
        self.target_time = target;
        self.send(WorkerCommand::Rollback { time, target })
    }

    // -- policy predicates ------------------------------------------------

    /// Has the scheme failed in a way that requires a rollback?
    ///
    /// Judged against the cumulative successful-iteration counter, which is
    /// reset only by rollback and import — so with a finite rollback limit
    /// the predicate can trip from accumulation across several sync targets,
    /// and the rollback path (which clears the counters) is the recovery.
    pub fn is_simulation_failure(&self, expected_target: f64) -> bool {
        let st = lock(&self.status.state);
        if st.running {
            return false;
        }
        match self.sync_method {
            SyncMethod::Forecast => {
                if st.batch.successful >= self.settings.rollback_limit
                    && expected_target - st.current_time > TIME_EPSILON
                {
                    return true;
                }
            }
            SyncMethod::Timestep => {
                if st.batch.successful > self.settings.rollback_limit {
                    return true;
                }
            }
        }
        if st.current_time > expected_target + TIME_EPSILON {
            warn!(
                current = st.current_time,
                target = expected_target,
                "scheme exceeded its target sync time; rolling back"
            );
            return true;
        }
        false
    }

    /// Is the scheme at the sync point with everything downloaded?
    pub fn is_sync_ready(&self, expected_target: f64) -> bool {
        let st = lock(&self.status.state);
        if st.running {
            return false;
        }
        if matches!(self.sync_method, SyncMethod::Forecast)
            && expected_target - st.current_time > TIME_EPSILON
        {
            return false;
        }
        if !st.cell_states_synced {
            return false;
        }
        if matches!(self.sync_method, SyncMethod::Timestep)
            && st.iterations_since_sync < self.settings.rollback_limit.saturating_sub(1)
            && expected_target - st.current_time > TIME_EPSILON
            && st.current_time > 0.0
        {
            return false;
        }
        true
    }

    /// Forecast a safe sync point from current batch performance.
    pub fn propose_sync_point(&self, current_time: f64) -> f64 {
        let st = lock(&self.status.state);
        let base_step = self.settings.initial_timestep.abs();
        let mut proposal = current_time + base_step;
        if current_time > TIME_EPSILON && st.batch.successful > 0 {
            let limit = f64::from(self.settings.rollback_limit);
            let spares = f64::from(self.settings.sync_batch_spares);
            let average = st.batch.timesteps_total / f64::from(st.batch.successful);
            // Leave a few spare iterations in hand below the rollback limit.
            proposal =
                current_time + base_step.max(limit * average * ((limit - spares) / limit));
            if st.iterations_since_sync >= self.settings.rollback_limit {
                // Stalled at the iteration budget: a conservative estimate
                // from the distance actually covered this round.
                let advanced = (st.current_time - current_time).max(0.0);
                if advanced > TIME_EPSILON {
                    proposal = current_time + advanced * 0.95;
                }
            }
        } else if proposal - current_time < TIME_EPSILON {
            proposal = current_time + base_step;
        }
        proposal
    }

    /// Stop the worker and drop the device resources.
    pub fn cleanup(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = self.tx.send(WorkerCommand::Stop);
            let _ = handle.join();
        }
    }

    fn read_back(
        &self,
        build: impl FnOnce(Sender<Result<StateImage, String>>) -> WorkerCommand,
    ) -> Result<StateImage, DomainError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(build(reply_tx))
            .map_err(|_| DomainError::Sync("scheme worker is gone".to_string()))?;
        match reply_rx.recv() {
            Ok(Ok(image)) => Ok(image),
            Ok(Err(message)) => Err(DomainError::Sync(message)),
            Err(_) => Err(DomainError::Sync("scheme worker dropped the reply".to_string())),
        }
    }
}

impl StateSync for Scheme {
    fn synchronise_states(&self) -> Result<StateImage, DomainError> {
        self.read_back(|reply| WorkerCommand::ReadBackStates { reply })
    }

    fn synchronise_derivatives(&self) -> Result<StateImage, DomainError> {
        self.read_back(|reply| WorkerCommand::ReadBackDerivatives { reply })
    }
}

impl Drop for Scheme {
    fn drop(&mut self) {
        self.cleanup();
    }
}

// ============================================================================
// Prepare helpers
// ============================================================================

fn register_constants(
    program: &mut Program,
    settings: &SchemeSettings,
    desc: &DomainDescriptor,
    geometry: &ExecutionGeometry,
    simulation_length: f64,
    output_frequency: f64,
) {
    program.register_constant("VERY_SMALL", format!("{:e}", settings.dry_threshold));
    program.register_constant("QUITE_SMALL", format!("{:e}", settings.dry_threshold * 10.0));
    program.register_constant("COURANT_NUMBER", format!("{}", settings.courant_number));

    program.register_constant("TIMESTEP_MAX", format!("{}", settings.maximum_timestep));
    match settings.timestep_mode {
        TimestepMode::Cfl => {
            program.register_constant("TIMESTEP_DYNAMIC", "1");
            program.remove_constant("TIMESTEP_FIXED");
        }
        TimestepMode::Fixed => {
            program.register_constant("TIMESTEP_FIXED", format!("{}", settings.initial_timestep));
            program.remove_constant("TIMESTEP_DYNAMIC");
        }
    }
    if settings.friction_effects {
        program.register_constant("FRICTION_ENABLED", "1");
    } else {
        program.remove_constant("FRICTION_ENABLED");
    }
    if settings.friction_in_flux {
        program.register_constant("FRICTION_IN_FLUX_KERNEL", "1");
    }

    program.register_constant("TIMESTEP_WORKERS", format!("{}", geometry.reduction_global));
    program.register_constant("TIMESTEP_GROUPSIZE", format!("{}", geometry.reduction_group));
    program.register_constant("SCHEME_ENDTIME", format!("{}", simulation_length));
    program.register_constant("SCHEME_OUTPUTTIME", format!("{}", output_frequency));

    program.register_constant("DOMAIN_CELLCOUNT", format!("{}", desc.cell_count));
    program.register_constant("DOMAIN_COLS", format!("{}", desc.cols));
    program.register_constant("DOMAIN_ROWS", format!("{}", desc.rows));
    program.register_constant("DOMAIN_DELTAX", format!("{}", desc.resolution));
    program.register_constant("DOMAIN_DELTAY", format!("{}", desc.resolution));

    // Required-work-group-size attributes for devices that honour them.
    program.register_constant(
        "REQD_WG_SIZE_FULL_TS",
        format!(
            "__attribute__((reqd_work_group_size({}, {}, 1)))",
            geometry.non_cached_group[0], geometry.non_cached_group[1]
        ),
    );
    program.register_constant(
        "REQD_WG_SIZE_LINE",
        format!(
            "__attribute__((reqd_work_group_size({}, 1, 1)))",
            geometry.reduction_group
        ),
    );

    let dims = match settings.variant {
        SchemeVariant::Inertial => ("INE_DIM1", "INE_DIM2"),
        _ => ("GTS_DIM1", "GTS_DIM2"),
    };
    let dim2 = match settings.cache_constraints {
        CacheConstraints::AllowOversize if geometry.cached_group[1] == 16 => 17,
        _ => geometry.cached_group[1],
    };
    program.register_constant(dims.0, format!("{}", geometry.cached_group[0]));
    program.register_constant(dims.1, format!("{dim2}"));
}

fn allocate_buffers(
    device: &Device,
    program: &Program,
    domain: &CartesianDomain,
    geometry: &ExecutionGeometry,
    settings: &SchemeSettings,
) -> Result<SchemeBuffers, SchemeError> {
    let images = domain.images();
    let precision = program.precision();
    let scalar = program.scalar_size();

    let state_a = Buffer::from_image(device, "Cell states", false, true, images.state.clone())?;
    let state_b =
        Buffer::from_image(device, "Cell states (alternate)", false, true, images.state)?;
    let bed = Buffer::from_image(device, "Bed elevations", true, true, images.bed)?;
    let manning = Buffer::from_image(device, "Manning coefficients", true, true, images.manning)?;
    let flow_flags = Buffer::from_image(device, "Flow states", true, true, images.flow_flags)?;
    let bound_coup =
        Buffer::from_image(device, "Boundary & coupling", true, true, images.bound_coup)?;
    let dsdt = Buffer::from_image(device, "Surface derivative", false, true, images.dsdt)?;

    let timestep = Buffer::with_size(device, "Timestep", false, true, scalar)?;
    let time = Buffer::with_size(device, "Time", false, true, scalar)?;
    let target_time = Buffer::with_size(device, "Target time (sync)", false, true, scalar)?;
    let hydro_time = Buffer::with_size(device, "Time (hydrological)", false, true, scalar)?;
    let scratch = Buffer::with_size(
        device,
        "Timestep reduction scratch",
        false,
        true,
        geometry.reduction_global * scalar,
    )?;
    let batch_timesteps =
        Buffer::with_size(device, "Batch timesteps cumulative", false, true, scalar)?;
    let batch_successful =
        Buffer::with_size(device, "Batch successful iterations", false, true, 4)?;
    let batch_skipped = Buffer::with_size(device, "Batch skipped iterations", false, true, 4)?;

    // Initial scalar values, written in the program's precision.
    time.set_host_scalar(precision, 0.0);
    timestep.set_host_scalar(precision, settings.initial_timestep);
    target_time.set_host_scalar(precision, 0.0);
    hydro_time.set_host_scalar(precision, 0.0);

    for buffer in [
        &state_a,
        &state_b,
        &bed,
        &manning,
        &flow_flags,
        &bound_coup,
        &dsdt,
        &timestep,
        &time,
        &target_time,
        &hydro_time,
        &scratch,
        &batch_timesteps,
        &batch_successful,
        &batch_skipped,
    ] {
        buffer.queue_write_all()?;
    }

    Ok(SchemeBuffers {
        state_a,
        state_b,
        bed,
        manning,
        flow_flags,
        bound_coup,
        dsdt,
        timestep,
        time,
        target_time,
        hydro_time,
        scratch,
        batch_timesteps,
        batch_successful,
        batch_skipped,
    })
}

fn wire_kernels(
    program: &Program,
    buffers: &SchemeBuffers,
    geometry: &ExecutionGeometry,
    settings: &SchemeSettings,
) -> Result<SchemeKernels, SchemeError> {
    let b = buffers;

    // General kernels shared by every scheme variant.
    let mut advance = program.get_kernel("tst_Advance_Normal")?;
    advance.assign_arguments(&[
        Some(&b.time),
        Some(&b.timestep),
        Some(&b.hydro_time),
        Some(&b.scratch),
        Some(&b.target_time),
        Some(&b.batch_timesteps),
        Some(&b.batch_successful),
        Some(&b.batch_skipped),
    ])?;

    let mut update = program.get_kernel("tst_UpdateTimestep")?;
    update.assign_arguments(&[
        Some(&b.time),
        Some(&b.timestep),
        Some(&b.scratch),
        Some(&b.target_time),
        Some(&b.batch_timesteps),
    ])?;

    let mut reset = program.get_kernel("tst_ResetCounters")?;
    reset.assign_arguments(&[
        Some(&b.batch_timesteps),
        Some(&b.batch_successful),
        Some(&b.batch_skipped),
    ])?;

    let mut reduce = program.get_kernel("tst_Reduce")?;
    reduce.assign_arguments(&[Some(&b.state_a), Some(&b.bed), Some(&b.scratch)])?;
    reduce.set_group_size(geometry.reduction_group, 1, 1);
    reduce.set_global_size(geometry.reduction_global, 1, 1);

    let mut friction = program.get_kernel("per_Friction")?;
    friction.assign_arguments(&[
        Some(&b.timestep),
        Some(&b.state_a),
        Some(&b.bed),
        Some(&b.manning),
        Some(&b.time),
    ])?;
    friction.set_group_size(geometry.non_cached_group[0], geometry.non_cached_group[1], 1);
    friction.set_global_size(geometry.non_cached_global[0], geometry.non_cached_global[1], 1);

    // The flux kernel per variant and cache mode.
    let cached = matches!(settings.cache_mode, CacheMode::Enabled)
        && matches!(
            settings.variant,
            SchemeVariant::Godunov | SchemeVariant::Inertial
        );
    let name = match (settings.variant, cached) {
        (SchemeVariant::Inertial, false) => "ine_cacheDisabled",
        (SchemeVariant::Inertial, true) => "ine_cacheEnabled",
        (_, true) => "gts_cacheEnabled",
        (_, false) => "gts_cacheDisabled",
    };
    let mut full_timestep = program.get_kernel(name)?;
    if settings.variant == SchemeVariant::Promaides {
        full_timestep.assign_arguments(&[
            Some(&b.timestep),
            Some(&b.bed),
            Some(&b.state_a),
            Some(&b.state_b),
            Some(&b.manning),
            Some(&b.flow_flags),
            Some(&b.bound_coup),
            Some(&b.dsdt),
        ])?;
    } else {
        full_timestep.assign_arguments(&[
            Some(&b.timestep),
            Some(&b.bed),
            Some(&b.state_a),
            Some(&b.state_b),
            Some(&b.manning),
        ])?;
    }
    if cached {
        full_timestep.set_group_size(geometry.cached_group[0], geometry.cached_group[1], 1);
        full_timestep.set_global_size(geometry.cached_global[0], geometry.cached_global[1], 1);
    } else {
        full_timestep.set_group_size(geometry.non_cached_group[0], geometry.non_cached_group[1], 1);
        full_timestep.set_global_size(
            geometry.non_cached_global[0],
            geometry.non_cached_global[1],
            1,
        );
    }

    let boundary = if settings.variant == SchemeVariant::Promaides {
        let mut k = program.get_kernel("bdy_Promaides")?;
        k.assign_arguments(&[
            Some(&b.bound_coup),
            Some(&b.timestep),
            Some(&b.state_a),
            Some(&b.bed),
        ])?;
        k.set_group_size(8, 8, 1);
        k.set_global_size(geometry.non_cached_global[0], geometry.non_cached_global[1], 1);
        Some(k)
    } else {
        None
    };

    Ok(SchemeKernels {
        full_timestep,
        friction,
        reduce,
        update,
        advance,
        reset,
        boundary,
    })
}

fn log_details(settings: &SchemeSettings, boundaries: &BoundarySet, desc: &DomainDescriptor) {
    info!(
        variant = ?settings.variant,
        timestep_mode = ?settings.timestep_mode,
        courant = settings.courant_number,
        dry_threshold = settings.dry_threshold,
        friction = settings.friction_effects,
        cache = ?settings.cache_mode,
        boundaries = boundaries.len(),
        cells = desc.cell_count,
        "scheme prepared"
    );
}

// ============================================================================
// The batch worker
// ============================================================================

struct Worker {
    device: Device,
    buffers: SchemeBuffers,
    kernels: SchemeKernels,
    boundaries: BoundarySet,
    settings: SchemeSettings,
    sync_method: SyncMethod,
    precision: Precision,
    desc: DomainDescriptor,
    use_alternate: bool,
    target_time: f64,
    current_time: f64,
    current_timestep: f64,
    override_timestep: bool,
    cell_states_synced: bool,
    iterations_since_sync: u32,
    cells_calculated: u64,
    last_sync_time: f64,
    previous_successful: u32,
    snapshot: Option<StateImage>,
    status: Arc<StatusCell>,
}

impl Worker {
    fn run(mut self, rx: Receiver<WorkerCommand>) {
        while let Ok(cmd) = rx.recv() {
            let stop = matches!(cmd, WorkerCommand::Stop);
            if stop {
                break;
            }
            if let Err(e) = self.handle(cmd) {
                warn!(error = %e, "scheme worker command failed");
                let mut st = lock(&self.status.state);
                st.worker_error = Some(e.to_string());
                st.running = false;
                drop(st);
                self.status.idle.notify_all();
            }
        }
        debug!("scheme batch worker exiting");
    }

    /// The read side of the next iteration, i.e. the freshest state.
    fn read_side(&self) -> &Buffer {
        if self.use_alternate {
            &self.buffers.state_b
        } else {
            &self.buffers.state_a
        }
    }

    fn dynamic_timestep(&self) -> bool {
        matches!(self.settings.timestep_mode, TimestepMode::Cfl)
    }

    fn publish(&self) {
        let mut st = lock(&self.status.state);
        st.running = false;
        st.current_time = self.current_time;
        st.current_timestep = self.current_timestep;
        st.iterations_since_sync = self.iterations_since_sync;
        st.cell_states_synced = self.cell_states_synced;
        st.cells_calculated = self.cells_calculated;
        st.last_sync_time = self.last_sync_time;
        drop(st);
        self.status.idle.notify_all();
    }

    fn handle(&mut self, cmd: WorkerCommand) -> Result<(), SchemeError> {
        match cmd {
            WorkerCommand::Stop => Ok(()),
            WorkerCommand::SetTargetTime(target) => self.update_target_time(target),
            WorkerCommand::ForceTimestep(timestep) => {
                if timestep != self.current_timestep {
                    self.current_timestep = timestep;
                    self.override_timestep = true;
                }
                Ok(())
            }
            WorkerCommand::StartBatch {
                queue_size,
                download,
            } => self.run_batch(queue_size, download),
            WorkerCommand::SaveState => self.save_state(),
            WorkerCommand::ReadBackStates { reply } => {
                let result = self.download_image(self.read_side(), 4);
                let _ = reply.send(result.map_err(|e| e.to_string()));
                Ok(())
            }
            WorkerCommand::ReadBackDerivatives { reply } => {
                let result = self.download_image(&self.buffers.dsdt, 1);
                let _ = reply.send(result.map_err(|e| e.to_string()));
                Ok(())
            }
            WorkerCommand::ImportState { image } => self.import_state(image),
            WorkerCommand::Rollback { time, target } => self.rollback(time, target),
        }
    }

    /// Write a new target time and refresh Δt so the first advance toward it
    /// cannot overshoot.
    fn update_target_time(&mut self, target: f64) -> Result<(), SchemeError> {
        if target == self.target_time {
            return Ok(());
        }
        self.target_time = target;
        self.buffers.target_time.set_host_scalar(self.precision, target);
        self.buffers.target_time.queue_write_all()?;
        self.device.queue_barrier()?;

        self.cell_states_synced = false;
        self.iterations_since_sync = 0;

        // A zero Δt right after a sync needs a fresh reduction before the
        // first advance; skipped in timestep-sync mode where the exchanged
        // Δt arrives via force_timestep.
        if self.current_timestep <= 0.0 && matches!(self.sync_method, SyncMethod::Forecast) {
            if self.dynamic_timestep() {
                self.rebind_reduction()?;
                self.kernels.reduce.schedule_execution()?;
                self.device.queue_barrier()?;
            }
            self.kernels.update.schedule_execution()?;
        }

        if self.current_time + self.current_timestep > target {
            self.current_timestep = (target - self.current_time).max(0.0);
            self.override_timestep = true;
        }
        self.device.queue_barrier()?;
        Ok(())
    }

    fn rebind_reduction(&mut self) -> Result<(), DeviceError> {
        let side = if self.use_alternate {
            self.buffers.state_b.clone()
        } else {
            self.buffers.state_a.clone()
        };
        self.kernels.reduce.assign_argument(0, Some(&side))
    }

    /// Enqueue one full iteration (§ iteration schedule in the module docs).
    fn schedule_iteration(&mut self) -> Result<(), SchemeError> {
        let (read, write) = if self.use_alternate {
            (self.buffers.state_b.clone(), self.buffers.state_a.clone())
        } else {
            (self.buffers.state_a.clone(), self.buffers.state_b.clone())
        };

        // Rebind the double-buffer sides.
        self.kernels.full_timestep.assign_argument(2, Some(&read))?;
        self.kernels.full_timestep.assign_argument(3, Some(&write))?;
        self.kernels.friction.assign_argument(1, Some(&write))?;
        self.kernels.reduce.assign_argument(0, Some(&write))?;
        if let Some(boundary) = self.kernels.boundary.as_mut() {
            boundary.assign_argument(2, Some(&read))?;
        }

        // Boundary kernels run against the current (read) side first.
        if let Some(boundary) = self.kernels.boundary.as_ref() {
            boundary.schedule_execution()?;
        }
        self.boundaries.apply_all(&read)?;
        self.device.queue_barrier()?;

        self.kernels.full_timestep.schedule_execution()?;
        self.device.queue_barrier()?;

        if self.settings.friction_effects && !self.settings.friction_in_flux {
            self.kernels.friction.schedule_execution()?;
            self.device.queue_barrier()?;
        }

        if self.dynamic_timestep() {
            self.kernels.reduce.schedule_execution()?;
            self.device.queue_barrier()?;
        }

        self.kernels.advance.schedule_execution()?;
        self.device.queue_barrier()?;
        Ok(())
    }

    fn run_batch(&mut self, queue_size: u32, download: bool) -> Result<(), SchemeError> {
        // Apply a pending Δt override before the first iteration.
        if self.override_timestep {
            if self.current_time < self.target_time {
                self.buffers
                    .timestep
                    .set_host_scalar(self.precision, self.current_timestep);
                self.buffers.timestep.queue_write_all()?;
                self.device.queue_barrier()?;
            }
            self.override_timestep = false;
        }

        // Timestep-sync mode exchanges Δt after every iteration.
        let queue_amount = match self.sync_method {
            SyncMethod::Timestep => 1,
            SyncMethod::Forecast => queue_size.max(1),
        };

        if self.iterations_since_sync < self.settings.rollback_limit
            && self.current_time < self.target_time
        {
            for _ in 0..queue_amount {
                self.schedule_iteration()?;
                self.iterations_since_sync += 1;
                self.cells_calculated += self.desc.cell_count as u64;
                self.use_alternate = !self.use_alternate;
            }
            self.cell_states_synced = false;
        }

        // Always read the clock and counters back.
        self.buffers.timestep.queue_read_all()?;
        self.buffers.time.queue_read_all()?;
        self.buffers.batch_skipped.queue_read_all()?;
        self.buffers.batch_successful.queue_read_all()?;
        self.buffers.batch_timesteps.queue_read_all()?;

        if download {
            self.read_side().queue_read_all()?;
        }

        self.device.flush()?;
        self.device.block_until_finished()?;

        if download {
            self.cell_states_synced = true;
        }
        self.mirror_statistics();
        self.publish();
        Ok(())
    }

    /// Pull the clock and batch counters from the host mirrors.
    fn mirror_statistics(&mut self) {
        let p = self.precision;
        self.current_timestep = self.buffers.timestep.host_scalar(p);
        self.current_time = self.buffers.time.host_scalar(p);
        let successful = self.buffers.batch_successful.host_word();
        let skipped = self.buffers.batch_skipped.host_word();
        let timesteps_total = self.buffers.batch_timesteps.host_scalar(p);
        let rate = if successful > self.previous_successful {
            successful - self.previous_successful
        } else {
            1
        };
        self.previous_successful = successful;

        let mut st = lock(&self.status.state);
        st.batch = BatchStatistics {
            timesteps_total,
            successful,
            skipped,
            rate,
        };
    }

    fn download_image(&self, buffer: &Buffer, components: usize) -> Result<StateImage, SchemeError> {
        self.device.block_until_finished()?;
        buffer.queue_read_all()?;
        self.device.block_until_finished()?;
        let bytes = buffer.host_block();
        debug_assert_eq!(
            bytes.len(),
            self.desc.cell_count * components * self.precision.scalar_size()
        );
        Ok(StateImage {
            precision: self.precision,
            bytes,
        })
    }

    fn save_state(&mut self) -> Result<(), SchemeError> {
        let image = self.download_image(self.read_side(), 4)?;
        self.snapshot = Some(image);
        self.iterations_since_sync = 0;
        self.last_sync_time = self.current_time;
        self.publish();
        Ok(())
    }

    fn import_state(&mut self, image: StateImage) -> Result<(), SchemeError> {
        self.device.block_until_finished()?;
        self.buffers.state_a.set_host_block(image.bytes.clone());
        self.buffers.state_b.set_host_block(image.bytes);
        self.buffers.state_a.queue_write_all()?;
        self.buffers.state_b.queue_write_all()?;

        self.last_sync_time = self.current_time;
        self.iterations_since_sync = 0;

        self.kernels.reset.schedule_execution()?;
        self.device.queue_barrier()?;
        if matches!(self.sync_method, SyncMethod::Forecast) && self.dynamic_timestep() {
            self.rebind_reduction()?;
            self.kernels.reduce.schedule_execution()?;
            self.device.queue_barrier()?;
            self.kernels.update.schedule_execution()?;
            self.device.queue_barrier()?;
        }
        self.buffers.timestep.queue_read_all()?;
        self.buffers.time.queue_read_all()?;
        self.buffers.batch_successful.queue_read_all()?;
        self.buffers.batch_skipped.queue_read_all()?;
        self.buffers.batch_timesteps.queue_read_all()?;
        self.device.block_until_finished()?;
        self.previous_successful = 0;
        self.mirror_statistics();
        self.cell_states_synced = true;
        self.publish();
        Ok(())
    }

    /// Rewind to a checkpoint: overwrite clocks, rewrite both state sides
    /// from the snapshot, recompute Δt, clear the failure counters.
    fn rollback(&mut self, time: f64, target: f64) -> Result<(), SchemeError> {
        self.device.block_until_finished()?;

        let snapshot = self.snapshot.clone().ok_or(SchemeError::NoSnapshot)?;
        self.iterations_since_sync = 0;
        self.current_time = time;
        self.target_time = target;
        self.last_sync_time = time;

        self.buffers.time.set_host_scalar(self.precision, time);
        self.buffers.target_time.set_host_scalar(self.precision, target);
        self.buffers.time.queue_write_all()?;
        self.buffers.target_time.queue_write_all()?;

        // Both sides: the next iteration may read either.
        self.buffers.state_a.set_host_block(snapshot.bytes.clone());
        self.buffers.state_b.set_host_block(snapshot.bytes);
        self.buffers.state_a.queue_write_all()?;
        self.buffers.state_b.queue_write_all()?;

        if self.dynamic_timestep() {
            self.rebind_reduction()?;
            self.kernels.reduce.schedule_execution()?;
            self.device.queue_barrier()?;
        }
        if !matches!(self.sync_method, SyncMethod::Timestep) {
            self.kernels.update.schedule_execution()?;
        }
        self.kernels.reset.schedule_execution()?;
        self.device.queue_barrier()?;
        self.device.flush()?;
        self.device.block_until_finished()?;

        // Refresh the Δt mirror the next batch will trust.
        self.buffers.timestep.queue_read_all()?;
        self.buffers.time.queue_read_all()?;
        self.buffers.batch_successful.queue_read_all()?;
        self.buffers.batch_skipped.queue_read_all()?;
        self.buffers.batch_timesteps.queue_read_all()?;
        self.device.block_until_finished()?;
        self.previous_successful = 0;
        self.mirror_statistics();
        self.cell_states_synced = true;
        self.publish();
        info!(time, target, "simulation rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceFilter, Executor};
    use crate::domain::DomainDefinition;

    fn device() -> Device {
        Executor::new().select_device(&DeviceFilter::default()).unwrap()
    }

    fn flat_domain(cols: u32, rows: u32) -> CartesianDomain {
        let mut d = CartesianDomain::new(DomainDefinition {
            cols,
            rows,
            resolution: 10.0,
            offset_x: 0.0,
            offset_y: 0.0,
            precision: Precision::Double,
        })
        .unwrap();
        for id in 0..d.cell_count() {
            d.handle_input_data(id, 0.0, crate::domain::InputKind::BedElevation, 4)
                .unwrap();
        }
        d
    }

    fn prepared(cols: u32, rows: u32, length: f64) -> (Scheme, CartesianDomain) {
        let dev = device();
        let domain = flat_domain(cols, rows);
        let scheme = Scheme::prepare(
            &dev,
            &domain,
            BoundarySet::empty(),
            SyncMethod::Forecast,
            SchemeSettings::default(),
            length,
            length,
        )
        .unwrap();
        (scheme, domain)
    }

    fn drive_to(scheme: &mut Scheme, target: f64) {
        scheme.set_target_time(target).unwrap();
        for _ in 0..200 {
            scheme.run_simulation(target, 0.0).unwrap();
            scheme.wait_until_idle();
            assert!(scheme.worker_error().is_none(), "{:?}", scheme.worker_error());
            if scheme.is_sync_ready(target) {
                return;
            }
        }
        panic!("scheme never became sync-ready for target {target}");
    }

    #[test]
    fn single_precision_storage_runs_end_to_end() {
        let dev = device();
        let mut domain = CartesianDomain::new(DomainDefinition {
            cols: 8,
            rows: 8,
            resolution: 10.0,
            offset_x: 0.0,
            offset_y: 0.0,
            precision: Precision::Single,
        })
        .unwrap();
        for id in 0..domain.cell_count() {
            domain
                .handle_input_data(id, 0.0, crate::domain::InputKind::BedElevation, 4)
                .unwrap();
        }
        let mut scheme = Scheme::prepare(
            &dev,
            &domain,
            BoundarySet::empty(),
            SyncMethod::Forecast,
            SchemeSettings::default(),
            10.0,
            10.0,
        )
        .unwrap();
        drive_to(&mut scheme, 10.0);
        assert!((scheme.current_time() - 10.0).abs() <= TIME_EPSILON);
        // Read-back arrives tagged with the storage precision.
        let image = scheme.synchronise_states().unwrap();
        assert_eq!(image.precision, Precision::Single);
        assert_eq!(image.bytes.len(), 8 * 8 * 4 * 4);
        domain.absorb_state_image(&image).unwrap();
        assert!(domain.volume() <= 1e-6);
    }

    #[test]
    fn muscl_hancock_is_rejected_at_prepare() {
        let dev = device();
        let domain = flat_domain(4, 4);
        let settings = SchemeSettings {
            variant: SchemeVariant::MusclHancock,
            ..Default::default()
        };
        assert!(matches!(
            Scheme::prepare(
                &dev,
                &domain,
                BoundarySet::empty(),
                SyncMethod::Forecast,
                settings,
                10.0,
                10.0
            ),
            Err(SchemeError::UnsupportedScheme(SchemeVariant::MusclHancock))
        ));
    }

    #[test]
    fn dry_domain_reaches_target_without_skips() {
        let (mut scheme, _domain) = prepared(16, 16, 60.0);
        drive_to(&mut scheme, 60.0);
        let stats = scheme.batch_statistics();
        assert!((scheme.current_time() - 60.0).abs() <= TIME_EPSILON);
        assert!(stats.successful >= 1);
        assert_eq!(stats.skipped, 0);
    }

    #[test]
    fn state_stays_dry_and_discharge_free() {
        let (mut scheme, mut domain) = prepared(16, 16, 60.0);
        drive_to(&mut scheme, 60.0);
        let depths = domain.read_depths(&scheme).unwrap();
        assert!(depths.iter().all(|h| *h <= 1e-10));
        let vx = domain.read_velocity_x(&scheme, 1e-10).unwrap();
        assert!(vx.iter().all(|v| *v == 0.0));
        assert!(domain.volume() <= 1e-9);
    }

    #[test]
    fn double_buffer_parity_follows_iteration_count() {
        let (mut scheme, _domain) = prepared(8, 8, 10.0);
        drive_to(&mut scheme, 10.0);
        // Parity is internal to the worker, but its observable consequence
        // holds: repeated syncs keep producing consistent read-backs.
        let a = scheme.synchronise_states().unwrap();
        let b = scheme.synchronise_states().unwrap();
        assert_eq!(a.bytes, b.bytes);
    }

    #[test]
    fn set_target_time_is_idempotent() {
        let (mut scheme, _domain) = prepared(8, 8, 10.0);
        scheme.set_target_time(5.0).unwrap();
        scheme.set_target_time(5.0).unwrap();
        drive_to(&mut scheme, 5.0);
        assert!((scheme.current_time() - 5.0).abs() <= TIME_EPSILON);
    }

    #[test]
    fn adaptive_queue_clamps_to_batch_rate() {
        let (mut scheme, _domain) = prepared(8, 8, 100.0);
        // First tick: no wall time yet, queue stays at 1.
        scheme.run_simulation(1.0, 0.0).unwrap();
        scheme.wait_until_idle();
        assert_eq!(scheme.queue_size(), 1);
        // An instant batch wants a huge queue; the 3×rate cap bounds it.
        scheme.run_simulation(2.0, 0.5).unwrap();
        scheme.wait_until_idle();
        let rate = scheme.batch_statistics().rate.max(1);
        assert!(scheme.queue_size() <= rate * 3);
        assert!(scheme.queue_size() >= 1);
    }

    #[test]
    fn adaptive_queue_converges_toward_one_second_batches() {
        // Feed the tuner a synthetic clock where every iteration costs 0.1 s
        // of wall time; the fixed point is a queue of ten iterations, i.e. a
        // batch duration inside the 0.5–2 s window.
        let dev = device();
        let mut domain = flat_domain(8, 8);
        for id in 0..domain.cell_count() {
            domain
                .handle_input_data(id, 0.5, crate::domain::InputKind::Depth, 4)
                .unwrap();
        }
        let mut scheme = Scheme::prepare(
            &dev,
            &domain,
            BoundarySet::empty(),
            SyncMethod::Forecast,
            SchemeSettings::default(),
            1.0e5,
            1.0e5,
        )
        .unwrap();

        let per_iteration = 0.1;
        let mut wall = 0.0;
        scheme.set_target_time(1.0e5).unwrap();
        let mut durations = Vec::new();
        for _ in 0..12 {
            scheme.run_simulation(1.0e5, wall).unwrap();
            scheme.wait_until_idle();
            assert!(scheme.worker_error().is_none());
            let duration = f64::from(scheme.queue_size()) * per_iteration;
            durations.push(duration);
            wall += duration;
        }
        let settled = durations.last().copied().unwrap();
        assert!(
            (0.5..=2.0).contains(&settled),
            "batch duration {settled} did not converge: {durations:?}"
        );
    }

    #[test]
    fn save_and_rollback_restore_time_and_state() {
        let (mut scheme, _domain) = prepared(8, 8, 100.0);
        drive_to(&mut scheme, 10.0);
        scheme.save_current_state().unwrap();

        drive_to(&mut scheme, 20.0);
        assert!((scheme.current_time() - 20.0).abs() <= TIME_EPSILON);

        scheme.rollback(10.0, 15.0).unwrap();
        scheme.wait_until_idle();
        // The rollback runs on the worker; give it a synchronous checkpoint.
        let _ = scheme.synchronise_states().unwrap();
        assert!((scheme.current_time() - 10.0).abs() <= TIME_EPSILON);
        assert_eq!(scheme.batch_statistics().successful, 0);

        drive_to(&mut scheme, 15.0);
        assert!((scheme.current_time() - 15.0).abs() <= TIME_EPSILON);
    }

    #[test]
    fn rollback_without_snapshot_reports_a_worker_error() {
        let (mut scheme, _domain) = prepared(8, 8, 100.0);
        drive_to(&mut scheme, 5.0);
        scheme.rollback(0.0, 2.0).unwrap();
        // Synchronise to make sure the command was processed.
        let _ = scheme.synchronise_states();
        assert!(scheme.worker_error().is_some());
    }

    #[test]
    fn failure_predicate_trips_on_rollback_limit() {
        let dev = device();
        let mut domain = flat_domain(16, 16);
        // Wet the domain so CFL limits produce many small steps.
        for id in 0..domain.cell_count() {
            domain
                .handle_input_data(id, 0.5, crate::domain::InputKind::Depth, 4)
                .unwrap();
        }
        let settings = SchemeSettings {
            rollback_limit: 5,
            ..Default::default()
        };
        let mut scheme = Scheme::prepare(
            &dev,
            &domain,
            BoundarySet::empty(),
            SyncMethod::Forecast,
            settings,
            1.0e4,
            1.0e4,
        )
        .unwrap();
        // A target needing far more than five CFL steps.
        let target = 1.0e4;
        scheme.set_target_time(target).unwrap();
        for _ in 0..10 {
            scheme.run_simulation(target, 0.0).unwrap();
            scheme.wait_until_idle();
            if scheme.is_simulation_failure(target) {
                return;
            }
        }
        panic!("expected the rollback limit to trip");
    }

    #[test]
    fn failure_accumulates_successful_iterations_across_targets() {
        // Successful iterations are banked in the device counter across
        // ordinary sync-target changes; only rollback or import clears them.
        let dev = device();
        let mut domain = flat_domain(16, 16);
        for id in 0..domain.cell_count() {
            domain
                .handle_input_data(id, 0.5, crate::domain::InputKind::Depth, 4)
                .unwrap();
        }
        let settings = SchemeSettings {
            rollback_limit: 5,
            ..Default::default()
        };
        let mut scheme = Scheme::prepare(
            &dev,
            &domain,
            BoundarySet::empty(),
            SyncMethod::Forecast,
            settings,
            1.0e4,
            1.0e4,
        )
        .unwrap();

        // Two short targets, two CFL steps each: four iterations banked
        // without any single round straining the budget.
        drive_to(&mut scheme, 3.0);
        drive_to(&mut scheme, 6.0);
        let banked = scheme.batch_statistics().successful;
        assert!(banked >= 4, "expected banked iterations, got {banked}");

        // One more far target: the very next batches push the cumulative
        // count over the limit even though this round alone stays well
        // under it.
        scheme.set_target_time(20.0).unwrap();
        for _ in 0..10 {
            scheme.run_simulation(20.0, 0.0).unwrap();
            scheme.wait_until_idle();
            if scheme.is_simulation_failure(20.0) {
                assert!(
                    scheme.iterations_since_sync() < 5,
                    "the trip must come from cross-target accumulation"
                );
                return;
            }
        }
        panic!("cumulative successful iterations never tripped the rollback limit");
    }

    #[test]
    fn forecast_proposal_respects_spares_and_limit() {
        let (mut scheme, _domain) = prepared(8, 8, 100.0);
        // Before any progress the proposal is one configured step ahead.
        let p0 = scheme.propose_sync_point(0.0);
        assert!((p0 - scheme.settings().initial_timestep).abs() < 1e-12);
        drive_to(&mut scheme, 1.0);
        let p1 = scheme.propose_sync_point(scheme.current_time());
        assert!(p1 > scheme.current_time());
    }
}
