//! Crate root: public surface, shared scalar conventions, and solver-wide invariants
//!
//! `inundate` is a host-side orchestrator for 2D free-surface shallow-water
//! simulation on a regular Cartesian grid. The numerical kernels execute on a
//! *virtual compute device* — an in-order command queue with named buffers and
//! named kernels — so the whole engine keeps the shape of a GPU code path
//! (compile → allocate → batch-submit → reduce → read back) while remaining an
//! ordinary, dependency-light Rust library.
//!
//! ## Invariants carried across the crate
//!
//! - **Cell state vector.** Every cell carries four scalars
//!   `(η, η_max, q_x, q_y)`: free-surface level, its historical maximum, and
//!   the depth-integrated discharge per axis. A cell is *disabled* iff
//!   `η_max == −9999`; disabled cells keep `q ≡ 0` but still occupy storage.
//! - **Indexing.** All flat per-cell arrays are row-major:
//!   `cell_id(i, j) = j · cols + i`.
//! - **Precision.** The device stores scalars in the precision selected at
//!   program-build time; every host-facing accessor speaks `f64`. Buffer
//!   sizing derives from the single-precision flag and nothing else.
//! - **Double buffer.** Two equally sized cell-state buffers alternate as the
//!   read and write side of each iteration; after a barrier the "current"
//!   side always holds the freshest state.
//! - **Clock.** `current_time` is monotone within `[0, simulation_length]`;
//!   each batch runs toward a `target_time` and the device-side advance kernel
//!   never steps past it (tolerance [`TIME_EPSILON`]).

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

/// Virtual compute device: platforms, queues, buffers, kernels.
pub mod device;
/// Program builder: kernel bundles + constant table, compiled into a registry.
pub mod program;
/// Cartesian domain: host-side cell arrays, input normalisation, read-back.
pub mod domain;
/// Boundary conditions: point-cell, domain-uniform and gridded sources.
pub mod boundary;
/// Opaque kernel bundles (flux schemes, friction, timestep, boundaries).
pub mod kernels;
/// The scheme orchestrator: buffers, batch worker, rollback.
pub mod scheme;
/// Model controller: outer loop, sync scheduling, progress telemetry.
pub mod model;
/// Domain manager: domain set and synchronisation strategy.
pub mod manager;
/// Ergonomic builder surface over the full stack.
pub mod api;

// ============================================================================
// Scalar conventions
// ============================================================================

/// Floating-point storage width used on the device side.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    /// 32-bit device storage; time and timestep scalars are coerced too.
    Single,
    /// 64-bit device storage (the default).
    Double,
}

impl Precision {
    /// Bytes occupied by one scalar in this precision.
    #[inline]
    pub fn scalar_size(self) -> usize {
        match self {
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }
}

impl Default for Precision {
    fn default() -> Self {
        Precision::Double
    }
}

/// Severity attached to engine failures.
///
/// `Fatal` aborts the process, `ModelStop` aborts the current simulation but
/// keeps the engine usable, `ModelContinue` is logged and execution carries
/// on. `Warning`/`Info` are purely diagnostic.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Fatal,
    ModelStop,
    ModelContinue,
    Warning,
    Info,
}

/// Sentinel marking a cell as permanently outside the computational domain.
pub const DISABLED_CELL: f64 = -9999.0;

/// Standard gravity used by every flux and friction formulation.
pub const GRAVITY: f64 = 9.80665;

/// Tolerance for simulation-time comparisons (target hits, overshoot checks).
pub const TIME_EPSILON: f64 = 1e-5;

// ============================================================================
// Root re-exports
// ============================================================================

pub use crate::api::{Simulation, SimulationBuilder};
pub use crate::boundary::{Boundary, BoundaryDefinition, BoundarySet};
pub use crate::device::{Device, DeviceError, Executor};
pub use crate::domain::{CartesianDomain, DomainDefinition, StateImage, StateSync};
pub use crate::manager::DomainManager;
pub use crate::model::{Model, ModelSettings, RunSummary, SimulationError};
pub use crate::program::Program;
pub use crate::scheme::{Scheme, SchemeSettings, SchemeVariant, SyncMethod, TimestepMode};
