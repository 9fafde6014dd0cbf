//! Boundary conditions: point-cell, domain-uniform and gridded sources
//!
//! Three boundary kinds share one lifecycle:
//!
//! 1. **Setup** — a [`BoundaryDefinition`] arrives with its time series
//!    already parsed into numeric rows (file parsing lives outside the core).
//!    Rows with the wrong arity or a non-increasing timestamp are counted,
//!    warned about, and skipped; a series with fewer than two valid entries
//!    rejects the whole boundary. The uniform spacing `Δt_ts = t₁ − t₀` is
//!    recomputed on load and the series is frozen.
//! 2. **Prepare** — each boundary allocates a configuration buffer and a
//!    series buffer on the device, writes both, resolves its kernel by name
//!    (`bdy_Cell`, `bdy_Uniform`, `bdy_Gridded`) and binds every argument
//!    except the cell state, which alternates.
//! 3. **Apply** — once per iteration, before the main flux kernel, the cell
//!    state slot is rebound to whichever double-buffer side is current and
//!    the kernel is enqueued.
//!
//! A `total` discharge interpretation divides series values by the relation
//! cell count at prepare time; the coupling is frozen thereafter.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::device::{
    set_qword_at, set_scalar_at, Buffer, DeviceError,
};
use crate::domain::CartesianDomain;
use crate::program::{CompileError, Program};
use crate::Precision;

/// Failures raised while building or driving a boundary.
#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error("boundary `{name}`: series has only {valid} valid entries (need at least 2)")]
    SeriesTooShort { name: String, valid: usize },
    #[error("boundary `{name}`: no cell relations given")]
    NoRelations { name: String },
    #[error("boundary `{name}`: relation ({i}, {j}) lies outside the domain")]
    RelationOutOfDomain { name: String, i: u32, j: u32 },
    #[error("boundary `{name}`: gridded slice {index} has {got} values, expected {expected}")]
    SliceSizeMismatch {
        name: String,
        index: usize,
        got: usize,
        expected: usize,
    },
    #[error("boundary `{name}` used before prepare")]
    NotPrepared { name: String },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Compile(#[from] CompileError),
}

// ============================================================================
// Interpretations (typed, illegal combinations unrepresentable)
// ============================================================================

/// How the depth column of a cell-boundary series is interpreted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepthValue {
    FreeSurfaceLevel,
    Depth,
    Ignore,
}

/// How the discharge columns of a cell-boundary series are interpreted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DischargeValue {
    /// Volumetric rate across the whole boundary; divided per cell at prepare.
    Total,
    /// Volumetric rate already per cell.
    PerCell,
    /// Velocity to impose; discharge becomes `v·h`.
    Velocity,
    /// Volume surge, treated as a volumetric rate (see DESIGN notes).
    Surging,
    Ignore,
}

/// What a uniform-boundary series value means (mm·h⁻¹ either way).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UniformValue {
    RainIntensity,
    LossRate,
}

/// One time slab of a gridded boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GridSlice {
    pub time: f64,
    /// `cols × rows` rates, row-major, mm·h⁻¹.
    pub values: Vec<f64>,
}

/// External description of one boundary, series pre-parsed into rows.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BoundaryDefinition {
    pub name: String,
    pub kind: BoundaryKind,
}

/// The three boundary kinds and their raw payloads.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum BoundaryKind {
    Cell {
        depth: DepthValue,
        discharge: DischargeValue,
        /// `(t, depth, q_x, q_y)` rows.
        rows: Vec<Vec<f64>>,
        /// Ordered `(i, j)` cell indices the boundary acts on.
        relations: Vec<(u32, u32)>,
    },
    Uniform {
        value: UniformValue,
        /// `(t, value)` rows.
        rows: Vec<Vec<f64>>,
    },
    Gridded { slices: Vec<GridSlice> },
}

// ============================================================================
// Device-image layout shared with the boundary kernels
// ============================================================================

/// Scalar slots of the per-boundary configuration buffer.
pub(crate) const CFG_ENTRIES: usize = 0;
pub(crate) const CFG_INTERVAL: usize = 1;
pub(crate) const CFG_LENGTH: usize = 2;
/// Depth kind for cell boundaries; value kind for uniform boundaries.
pub(crate) const CFG_KIND_A: usize = 3;
pub(crate) const CFG_KIND_B: usize = 4;
pub(crate) const CFG_RELATIONS: usize = 5;
pub(crate) const CFG_SLOTS: usize = 6;

pub(crate) const DEPTH_CODE_IGNORE: f64 = 0.0;
pub(crate) const DEPTH_CODE_FSL: f64 = 1.0;
pub(crate) const DEPTH_CODE_DEPTH: f64 = 2.0;

pub(crate) const DISCHARGE_CODE_IGNORE: f64 = 0.0;
pub(crate) const DISCHARGE_CODE_TOTAL: f64 = 1.0;
pub(crate) const DISCHARGE_CODE_PER_CELL: f64 = 2.0;
pub(crate) const DISCHARGE_CODE_VELOCITY: f64 = 3.0;
pub(crate) const DISCHARGE_CODE_SURGING: f64 = 4.0;

pub(crate) const UNIFORM_CODE_RAIN: f64 = 0.0;
pub(crate) const UNIFORM_CODE_LOSS: f64 = 1.0;

/// Cell-state argument slot per kernel (rebound every iteration).
pub(crate) const CELL_STATE_ARG_CELL: usize = 6;
pub(crate) const CELL_STATE_ARG_UNIFORM: usize = 5;
pub(crate) const CELL_STATE_ARG_GRIDDED: usize = 5;

fn depth_code(v: DepthValue) -> f64 {
    match v {
        DepthValue::Ignore => DEPTH_CODE_IGNORE,
        DepthValue::FreeSurfaceLevel => DEPTH_CODE_FSL,
        DepthValue::Depth => DEPTH_CODE_DEPTH,
    }
}

fn discharge_code(v: DischargeValue) -> f64 {
    match v {
        DischargeValue::Ignore => DISCHARGE_CODE_IGNORE,
        DischargeValue::Total => DISCHARGE_CODE_TOTAL,
        DischargeValue::PerCell => DISCHARGE_CODE_PER_CELL,
        DischargeValue::Velocity => DISCHARGE_CODE_VELOCITY,
        DischargeValue::Surging => DISCHARGE_CODE_SURGING,
    }
}

// ============================================================================
// Series validation
// ============================================================================

struct Series {
    /// Validated rows, `arity` scalars each, strictly increasing in time.
    rows: Vec<Vec<f64>>,
    interval: f64,
    length: f64,
    rejected: usize,
}

/// Validate raw rows: arity check, strictly-increasing time, interval.
fn build_series(name: &str, raw: &[Vec<f64>], arity: usize) -> Result<Series, BoundaryError> {
    let mut rows: Vec<Vec<f64>> = Vec::with_capacity(raw.len());
    let mut rejected = 0usize;
    for row in raw {
        if row.len() != arity {
            rejected += 1;
            continue;
        }
        if let Some(prev) = rows.last() {
            if row[0] <= prev[0] {
                rejected += 1;
                continue;
            }
        }
        rows.push(row.clone());
    }
    if rejected > 0 {
        warn!(
            boundary = name,
            rejected, "rejected malformed time-series rows"
        );
    }
    if rows.len() < 2 {
        return Err(BoundaryError::SeriesTooShort {
            name: name.to_string(),
            valid: rows.len(),
        });
    }
    let interval = rows[1][0] - rows[0][0];
    for pair in rows.windows(2) {
        let step = pair[1][0] - pair[0][0];
        if (step - interval).abs() > interval.abs() * 1e-5 + 1e-9 {
            warn!(
                boundary = name,
                expected = interval,
                got = step,
                "time series spacing is not uniform; the first interval is used"
            );
            break;
        }
    }
    let length = rows[rows.len() - 1][0] - rows[0][0];
    Ok(Series {
        rows,
        interval,
        length,
        rejected,
    })
}

// ============================================================================
// Runtime boundary variants
// ============================================================================

/// Buffers every boundary kernel binds against at prepare time.
pub struct BoundaryContext<'a> {
    pub bed: &'a Buffer,
    pub manning: &'a Buffer,
    pub time: &'a Buffer,
    pub hydro_time: &'a Buffer,
    pub timestep: &'a Buffer,
}

struct DeviceBinding {
    kernel: crate::device::Kernel,
    cell_state_arg: usize,
    // Buffers are parked here so they outlive the kernel bindings.
    _config: Buffer,
    _series: Buffer,
    _relations: Option<Buffer>,
}

/// A point-cell boundary: a `(t, depth, q_x, q_y)` series applied to an
/// ordered list of cells.
pub struct CellBoundary {
    name: String,
    depth: DepthValue,
    discharge: DischargeValue,
    series: Vec<Vec<f64>>,
    interval: f64,
    length: f64,
    relations: Vec<u64>,
    binding: Option<DeviceBinding>,
}

/// A domain-uniform boundary: one `(t, value)` rate series for every cell.
pub struct UniformBoundary {
    name: String,
    value: UniformValue,
    series: Vec<Vec<f64>>,
    interval: f64,
    length: f64,
    binding: Option<DeviceBinding>,
}

/// A gridded boundary: one `cols × rows` rate slab per series entry.
pub struct GriddedBoundary {
    name: String,
    slices: Vec<GridSlice>,
    interval: f64,
    length: f64,
    binding: Option<DeviceBinding>,
}

/// Any prepared boundary.
pub enum Boundary {
    Cell(CellBoundary),
    Uniform(UniformBoundary),
    Gridded(GriddedBoundary),
}

impl Boundary {
    /// Validate a definition into a runtime boundary (device-free).
    pub fn from_definition(
        def: &BoundaryDefinition,
        domain: &CartesianDomain,
    ) -> Result<Boundary, BoundaryError> {
        match &def.kind {
            BoundaryKind::Cell {
                depth,
                discharge,
                rows,
                relations,
            } => {
                if relations.is_empty() {
                    return Err(BoundaryError::NoRelations {
                        name: def.name.clone(),
                    });
                }
                let mut cells = Vec::with_capacity(relations.len());
                for &(i, j) in relations {
                    if i as usize >= domain.cols() || j as usize >= domain.rows() {
                        return Err(BoundaryError::RelationOutOfDomain {
                            name: def.name.clone(),
                            i,
                            j,
                        });
                    }
                    cells.push(domain.cell_id(i, j) as u64);
                }
                let series = build_series(&def.name, rows, 4)?;
                info!(
                    boundary = %def.name,
                    entries = series.rows.len(),
                    interval = series.interval,
                    cells = cells.len(),
                    "cell boundary loaded"
                );
                Ok(Boundary::Cell(CellBoundary {
                    name: def.name.clone(),
                    depth: *depth,
                    discharge: *discharge,
                    series: series.rows,
                    interval: series.interval,
                    length: series.length,
                    relations: cells,
                    binding: None,
                }))
            }
            BoundaryKind::Uniform { value, rows } => {
                let series = build_series(&def.name, rows, 2)?;
                info!(
                    boundary = %def.name,
                    entries = series.rows.len(),
                    interval = series.interval,
                    "uniform boundary loaded"
                );
                Ok(Boundary::Uniform(UniformBoundary {
                    name: def.name.clone(),
                    value: *value,
                    series: series.rows,
                    interval: series.interval,
                    length: series.length,
                    binding: None,
                }))
            }
            BoundaryKind::Gridded { slices } => {
                for (index, slice) in slices.iter().enumerate() {
                    if slice.values.len() != domain.cell_count() {
                        return Err(BoundaryError::SliceSizeMismatch {
                            name: def.name.clone(),
                            index,
                            got: slice.values.len(),
                            expected: domain.cell_count(),
                        });
                    }
                }
                let raw: Vec<Vec<f64>> = slices.iter().map(|s| vec![s.time, 0.0]).collect();
                let series = build_series(&def.name, &raw, 2)?;
                if series.rejected > 0 {
                    warn!(
                        boundary = %def.name,
                        rejected = series.rejected,
                        "gridded slices with malformed timestamps were dropped"
                    );
                }
                // Keep the slices whose timestamps survived validation.
                let mut kept = Vec::with_capacity(series.rows.len());
                let mut cursor = 0usize;
                for slice in slices {
                    if cursor < series.rows.len() && slice.time == series.rows[cursor][0] {
                        kept.push(slice.clone());
                        cursor += 1;
                    }
                }
                info!(
                    boundary = %def.name,
                    entries = kept.len(),
                    interval = series.interval,
                    "gridded boundary loaded"
                );
                Ok(Boundary::Gridded(GriddedBoundary {
                    name: def.name.clone(),
                    slices: kept,
                    interval: series.interval,
                    length: series.length,
                    binding: None,
                }))
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Boundary::Cell(b) => &b.name,
            Boundary::Uniform(b) => &b.name,
            Boundary::Gridded(b) => &b.name,
        }
    }

    /// Number of cells this boundary touches each iteration.
    pub fn relation_count(&self) -> usize {
        match self {
            Boundary::Cell(b) => b.relations.len(),
            Boundary::Uniform(_) | Boundary::Gridded(_) => 0,
        }
    }

    /// Allocate and write the device buffers, resolve and bind the kernel.
    pub fn prepare(
        &mut self,
        program: &Program,
        ctx: &BoundaryContext<'_>,
    ) -> Result<(), BoundaryError> {
        let precision = program.precision();
        let device = program.device().clone();
        match self {
            Boundary::Cell(b) => {
                let config = config_image(
                    precision,
                    b.series.len(),
                    b.interval,
                    b.length,
                    depth_code(b.depth),
                    discharge_code(b.discharge),
                    b.relations.len() as f64,
                );
                let config_buf = Buffer::from_image(
                    &device,
                    format!("Bdy_{}_Conf", b.name),
                    true,
                    true,
                    config,
                )?;
                config_buf.queue_write_all()?;

                // Total and surging rates are divided across the relation
                // cells now; the coupling is frozen from here on.
                let divide = matches!(
                    b.discharge,
                    DischargeValue::Total | DischargeValue::Surging
                );
                let scale = if divide {
                    1.0 / b.relations.len() as f64
                } else {
                    1.0
                };
                let s = precision.scalar_size();
                let mut series = vec![0u8; b.series.len() * 4 * s];
                for (e, row) in b.series.iter().enumerate() {
                    set_scalar_at(&mut series, precision, e * 4, row[0]);
                    set_scalar_at(&mut series, precision, e * 4 + 1, row[1]);
                    set_scalar_at(&mut series, precision, e * 4 + 2, row[2] * scale);
                    set_scalar_at(&mut series, precision, e * 4 + 3, row[3] * scale);
                }
                let series_buf = Buffer::from_image(
                    &device,
                    format!("Bdy_{}_Series", b.name),
                    true,
                    true,
                    series,
                )?;
                series_buf.queue_write_all()?;

                let mut relations = vec![0u8; b.relations.len() * 8];
                for (r, &cell) in b.relations.iter().enumerate() {
                    set_qword_at(&mut relations, r, cell);
                }
                let relations_buf = Buffer::from_image(
                    &device,
                    format!("Bdy_{}_Rels", b.name),
                    true,
                    true,
                    relations,
                )?;
                relations_buf.queue_write_all()?;

                let mut kernel = program.get_kernel("bdy_Cell")?;
                kernel.assign_arguments(&[
                    Some(&config_buf),
                    Some(&relations_buf),
                    Some(&series_buf),
                    Some(ctx.time),
                    Some(ctx.timestep),
                    Some(ctx.hydro_time),
                    None, // cell states, rebound each iteration
                    Some(ctx.bed),
                    Some(ctx.manning),
                ])?;
                kernel.set_group_size(8, 1, 1);
                kernel.set_global_size(b.relations.len().div_ceil(8) * 8, 1, 1);
                b.binding = Some(DeviceBinding {
                    kernel,
                    cell_state_arg: CELL_STATE_ARG_CELL,
                    _config: config_buf,
                    _series: series_buf,
                    _relations: Some(relations_buf),
                });
                Ok(())
            }
            Boundary::Uniform(b) => {
                let kind = match b.value {
                    UniformValue::RainIntensity => UNIFORM_CODE_RAIN,
                    UniformValue::LossRate => UNIFORM_CODE_LOSS,
                };
                let config = config_image(
                    precision,
                    b.series.len(),
                    b.interval,
                    b.length,
                    kind,
                    0.0,
                    0.0,
                );
                let config_buf = Buffer::from_image(
                    &device,
                    format!("Bdy_{}_Conf", b.name),
                    true,
                    true,
                    config,
                )?;
                config_buf.queue_write_all()?;

                let s = precision.scalar_size();
                let mut series = vec![0u8; b.series.len() * 2 * s];
                for (e, row) in b.series.iter().enumerate() {
                    set_scalar_at(&mut series, precision, e * 2, row[0]);
                    set_scalar_at(&mut series, precision, e * 2 + 1, row[1]);
                }
                let series_buf = Buffer::from_image(
                    &device,
                    format!("Bdy_{}_Series", b.name),
                    true,
                    true,
                    series,
                )?;
                series_buf.queue_write_all()?;

                let mut kernel = program.get_kernel("bdy_Uniform")?;
                kernel.assign_arguments(&[
                    Some(&config_buf),
                    Some(&series_buf),
                    Some(ctx.time),
                    Some(ctx.timestep),
                    Some(ctx.hydro_time),
                    None, // cell states
                    Some(ctx.bed),
                    Some(ctx.manning),
                ])?;
                kernel.set_group_size(8, 8, 1);
                b.binding = Some(DeviceBinding {
                    kernel,
                    cell_state_arg: CELL_STATE_ARG_UNIFORM,
                    _config: config_buf,
                    _series: series_buf,
                    _relations: None,
                });
                Ok(())
            }
            Boundary::Gridded(b) => {
                let config = config_image(
                    precision,
                    b.slices.len(),
                    b.interval,
                    b.length,
                    0.0,
                    0.0,
                    0.0,
                );
                let config_buf = Buffer::from_image(
                    &device,
                    format!("Bdy_{}_Conf", b.name),
                    true,
                    true,
                    config,
                )?;
                config_buf.queue_write_all()?;

                let s = precision.scalar_size();
                let per_slice = b.slices.first().map(|sl| sl.values.len()).unwrap_or(0);
                let mut values = vec![0u8; b.slices.len() * per_slice * s];
                for (e, slice) in b.slices.iter().enumerate() {
                    for (c, v) in slice.values.iter().enumerate() {
                        set_scalar_at(&mut values, precision, e * per_slice + c, *v);
                    }
                }
                let values_buf = Buffer::from_image(
                    &device,
                    format!("Bdy_{}_Series", b.name),
                    true,
                    true,
                    values,
                )?;
                values_buf.queue_write_all()?;

                let mut kernel = program.get_kernel("bdy_Gridded")?;
                kernel.assign_arguments(&[
                    Some(&config_buf),
                    Some(&values_buf),
                    Some(ctx.time),
                    Some(ctx.timestep),
                    Some(ctx.hydro_time),
                    None, // cell states
                    Some(ctx.bed),
                    Some(ctx.manning),
                ])?;
                kernel.set_group_size(8, 8, 1);
                b.binding = Some(DeviceBinding {
                    kernel,
                    cell_state_arg: CELL_STATE_ARG_GRIDDED,
                    _config: config_buf,
                    _series: values_buf,
                    _relations: None,
                });
                Ok(())
            }
        }
    }

    /// Set the launch geometry that depends on the domain (2D kernels only).
    pub fn size_for_domain(&mut self, cols: usize, rows: usize) {
        let binding = match self {
            Boundary::Cell(_) => return,
            Boundary::Uniform(b) => b.binding.as_mut(),
            Boundary::Gridded(b) => b.binding.as_mut(),
        };
        if let Some(binding) = binding {
            binding
                .kernel
                .set_global_size(cols.div_ceil(8) * 8, rows.div_ceil(8) * 8, 1);
        }
    }

    /// Rebind the cell-state argument to the current side and enqueue.
    pub fn apply(&mut self, cell_states: &Buffer) -> Result<(), BoundaryError> {
        let (name, binding) = match self {
            Boundary::Cell(b) => (&b.name, b.binding.as_mut()),
            Boundary::Uniform(b) => (&b.name, b.binding.as_mut()),
            Boundary::Gridded(b) => (&b.name, b.binding.as_mut()),
        };
        let binding = binding.ok_or_else(|| BoundaryError::NotPrepared {
            name: name.clone(),
        })?;
        binding
            .kernel
            .assign_argument(binding.cell_state_arg, Some(cell_states))?;
        binding.kernel.schedule_execution()?;
        Ok(())
    }

    /// Hook for time-sliced series streaming. Currently a no-op: every series
    /// is resident on the device from prepare time.
    pub fn stream(&mut self, _time: f64) {}

    /// Teardown hook; buffers are released when the boundary drops.
    pub fn clean(&mut self) {}
}

fn config_image(
    precision: Precision,
    entries: usize,
    interval: f64,
    length: f64,
    kind_a: f64,
    kind_b: f64,
    relations: f64,
) -> Vec<u8> {
    let mut image = vec![0u8; CFG_SLOTS * precision.scalar_size()];
    set_scalar_at(&mut image, precision, CFG_ENTRIES, entries as f64);
    set_scalar_at(&mut image, precision, CFG_INTERVAL, interval);
    set_scalar_at(&mut image, precision, CFG_LENGTH, length);
    set_scalar_at(&mut image, precision, CFG_KIND_A, kind_a);
    set_scalar_at(&mut image, precision, CFG_KIND_B, kind_b);
    set_scalar_at(&mut image, precision, CFG_RELATIONS, relations);
    image
}

// ============================================================================
// The boundary set
// ============================================================================

/// All boundaries of one domain, in application order.
pub struct BoundarySet {
    boundaries: Vec<Boundary>,
    rejected: usize,
}

impl BoundarySet {
    /// Build every valid boundary; invalid definitions are warned about and
    /// skipped (the simulation proceeds without them).
    pub fn from_definitions(
        definitions: &[BoundaryDefinition],
        domain: &CartesianDomain,
    ) -> BoundarySet {
        let mut boundaries = Vec::with_capacity(definitions.len());
        let mut rejected = 0usize;
        for def in definitions {
            match Boundary::from_definition(def, domain) {
                Ok(b) => boundaries.push(b),
                Err(e) => {
                    warn!(boundary = %def.name, error = %e, "boundary disabled");
                    rejected += 1;
                }
            }
        }
        BoundarySet {
            boundaries,
            rejected,
        }
    }

    pub fn empty() -> BoundarySet {
        BoundarySet {
            boundaries: Vec::new(),
            rejected: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.boundaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boundaries.is_empty()
    }

    /// Definitions that failed validation and were dropped.
    pub fn rejected_count(&self) -> usize {
        self.rejected
    }

    pub fn boundaries(&self) -> &[Boundary] {
        &self.boundaries
    }

    /// Adjust domain data for boundary requirements before upload. No
    /// adjustments are currently required; the hook mirrors the prepare
    /// order of the original pipeline.
    pub fn apply_domain_modifications(&self, _domain: &mut CartesianDomain) {}

    /// Prepare every boundary and size the 2D kernels for the domain.
    pub fn prepare_all(
        &mut self,
        program: &Program,
        ctx: &BoundaryContext<'_>,
        cols: usize,
        rows: usize,
    ) -> Result<(), BoundaryError> {
        for boundary in &mut self.boundaries {
            boundary.prepare(program, ctx)?;
            boundary.size_for_domain(cols, rows);
        }
        Ok(())
    }

    /// Enqueue every boundary kernel against the current cell-state side.
    pub fn apply_all(&mut self, cell_states: &Buffer) -> Result<(), BoundaryError> {
        for boundary in &mut self.boundaries {
            boundary.apply(cell_states)?;
        }
        Ok(())
    }

    pub fn stream_all(&mut self, time: f64) {
        for boundary in &mut self.boundaries {
            boundary.stream(time);
        }
    }

    pub fn clean_all(&mut self) {
        for boundary in &mut self.boundaries {
            boundary.clean();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainDefinition;

    fn domain() -> CartesianDomain {
        CartesianDomain::new(DomainDefinition {
            cols: 10,
            rows: 10,
            resolution: 10.0,
            offset_x: 0.0,
            offset_y: 0.0,
            precision: Precision::Double,
        })
        .unwrap()
    }

    fn uniform_def(rows: Vec<Vec<f64>>) -> BoundaryDefinition {
        BoundaryDefinition {
            name: "rain".to_string(),
            kind: BoundaryKind::Uniform {
                value: UniformValue::RainIntensity,
                rows,
            },
        }
    }

    #[test]
    fn series_interval_is_recomputed_on_load() {
        let d = domain();
        let def = uniform_def(vec![vec![0.0, 10.0], vec![900.0, 10.0], vec![1800.0, 0.0]]);
        let b = Boundary::from_definition(&def, &d).unwrap();
        match b {
            Boundary::Uniform(u) => {
                assert_eq!(u.interval, 900.0);
                assert_eq!(u.length, 1800.0);
                assert_eq!(u.series.len(), 3);
            }
            _ => panic!("expected uniform boundary"),
        }
    }

    #[test]
    fn malformed_rows_are_skipped_not_fatal() {
        let d = domain();
        let def = uniform_def(vec![
            vec![0.0, 10.0],
            vec![900.0], // wrong arity
            vec![450.0, 5.0], // non-increasing
            vec![1800.0, 0.0],
        ]);
        let b = Boundary::from_definition(&def, &d).unwrap();
        match b {
            Boundary::Uniform(u) => assert_eq!(u.series.len(), 2),
            _ => panic!("expected uniform boundary"),
        }
    }

    #[test]
    fn short_series_rejects_the_boundary() {
        let d = domain();
        let def = uniform_def(vec![vec![0.0, 10.0]]);
        assert!(matches!(
            Boundary::from_definition(&def, &d),
            Err(BoundaryError::SeriesTooShort { valid: 1, .. })
        ));
    }

    #[test]
    fn cell_boundary_validates_relations() {
        let d = domain();
        let rows = vec![vec![0.0, 0.0, 1.0, 0.0], vec![10.0, 0.0, 0.0, 0.0]];
        let def = BoundaryDefinition {
            name: "inflow".to_string(),
            kind: BoundaryKind::Cell {
                depth: DepthValue::Ignore,
                discharge: DischargeValue::Total,
                rows: rows.clone(),
                relations: vec![(5, 5), (10, 5)],
            },
        };
        assert!(matches!(
            Boundary::from_definition(&def, &d),
            Err(BoundaryError::RelationOutOfDomain { i: 10, j: 5, .. })
        ));

        let def = BoundaryDefinition {
            name: "inflow".to_string(),
            kind: BoundaryKind::Cell {
                depth: DepthValue::Ignore,
                discharge: DischargeValue::Total,
                rows,
                relations: vec![],
            },
        };
        assert!(matches!(
            Boundary::from_definition(&def, &d),
            Err(BoundaryError::NoRelations { .. })
        ));
    }

    #[test]
    fn gridded_slices_must_match_the_domain() {
        let d = domain();
        let def = BoundaryDefinition {
            name: "radar".to_string(),
            kind: BoundaryKind::Gridded {
                slices: vec![
                    GridSlice {
                        time: 0.0,
                        values: vec![0.0; 100],
                    },
                    GridSlice {
                        time: 600.0,
                        values: vec![0.0; 99],
                    },
                ],
            },
        };
        assert!(matches!(
            Boundary::from_definition(&def, &d),
            Err(BoundaryError::SliceSizeMismatch { index: 1, .. })
        ));
    }

    #[test]
    fn set_construction_counts_rejected_definitions() {
        let d = domain();
        let defs = vec![
            uniform_def(vec![vec![0.0, 10.0], vec![900.0, 10.0]]),
            uniform_def(vec![vec![0.0, 10.0]]),
        ];
        let set = BoundarySet::from_definitions(&defs, &d);
        assert_eq!(set.len(), 1);
        assert_eq!(set.rejected_count(), 1);
    }

    #[test]
    fn apply_before_prepare_is_an_error() {
        let d = domain();
        let def = uniform_def(vec![vec![0.0, 10.0], vec![900.0, 10.0]]);
        let mut b = Boundary::from_definition(&def, &d).unwrap();
        let mut exec = crate::device::Executor::new();
        let dev = exec
            .select_device(&crate::device::DeviceFilter::default())
            .unwrap();
        let state = Buffer::with_size(&dev, "states", true, true, 64).unwrap();
        assert!(matches!(
            b.apply(&state),
            Err(BoundaryError::NotPrepared { .. })
        ));
    }
}
