//! Cartesian domain: host-side cell arrays, input normalisation, read-back
//!
//! The domain owns every per-cell host array: the four-component state vector
//! `(η, η_max, q_x, q_y)`, bed elevation, Manning roughness, the flow-state
//! flag word, the two-component boundary/coupling scalars `(bc, cc)` and the
//! `ds/dt` accumulator used by the simplified schemes. Storage is tagged with
//! the precision selected for the run; every accessor speaks `f64` and
//! branches once on the tag.
//!
//! Dimensions, resolution and precision are fixed at construction — there is
//! deliberately no way to resize a domain once any device buffer has been
//! sized from it.
//!
//! `handle_input_data` normalises raster-style external inputs: it rounds to
//! the requested number of decimals, dispatches on the input kind, and
//! maintains the min/max trackers for bed, free-surface level and depth,
//! treating the `−9999` sentinel as missing data throughout.
//!
//! Read-back of the derived output arrays (`h`, `ds/dt`, `v_x`, `v_y`) runs
//! through the [`StateSync`] seam: the scheme drains its queue, downloads the
//! freshest state side, and hands the raw image back for conversion here.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::device::{scalar_at, set_scalar_at, set_word_at, word_at};
use crate::{Precision, DISABLED_CELL};

/// Per-axis flow-control bits stored in the flow-state flag word.
pub const FLAG_NO_FLOW_X: u32 = 0b0001;
pub const FLAG_NO_FLOW_Y: u32 = 0b0010;
/// Poleni weir-overflow bits: the face flux switches to a weir formulation.
pub const FLAG_POLENI_X: u32 = 0b0100;
pub const FLAG_POLENI_Y: u32 = 0b1000;

/// Failures raised by domain construction, input handling or read-back.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("domain dimensions must be non-zero (got {cols}×{rows})")]
    EmptyDomain { cols: u32, rows: u32 },
    #[error("cell resolution must be positive (got {0})")]
    BadResolution(f64),
    #[error("cell index {index} out of range for {count} cells")]
    CellOutOfRange { index: usize, count: usize },
    #[error("state image has {got} bytes, expected {expected}")]
    ImageSizeMismatch { got: usize, expected: usize },
    #[error("state image precision mismatch")]
    ImagePrecisionMismatch,
    #[error("state synchronisation failed: {0}")]
    Sync(String),
}

/// Static description of a domain, as supplied by external configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DomainDefinition {
    pub cols: u32,
    pub rows: u32,
    /// Uniform cell size in both axes (metres).
    pub resolution: f64,
    /// Real-world offset of the grid origin.
    pub offset_x: f64,
    pub offset_y: f64,
    #[serde(default)]
    pub precision: Precision,
}

/// Raster input kinds accepted by [`CartesianDomain::handle_input_data`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputKind {
    BedElevation,
    FreeSurfaceLevel,
    Depth,
    DisabledCells,
    DischargeX,
    DischargeY,
    VelocityX,
    VelocityY,
    Manning,
    MaxDepth,
    MaxFsl,
    FroudeNumber,
}

/// Components of the per-cell state vector, in storage order.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StateComponent {
    FreeSurfaceLevel = 0,
    MaxFreeSurfaceLevel = 1,
    DischargeX = 2,
    DischargeY = 3,
}

/// Raw device image of the full cell-state array, tagged with its precision.
#[derive(Clone, Debug)]
pub struct StateImage {
    pub precision: Precision,
    pub bytes: Vec<u8>,
}

/// Narrow seam through which the domain asks the owning scheme for a fresh
/// device download. Implementations must drain the queue before and after.
pub trait StateSync {
    /// Block, download the freshest cell-state side, block again, return it.
    fn synchronise_states(&self) -> Result<StateImage, DomainError>;

    /// Same for the `ds/dt` accumulator array.
    fn synchronise_derivatives(&self) -> Result<StateImage, DomainError>;
}

// ============================================================================
// Precision-tagged storage
// ============================================================================

struct CellArrays<T> {
    state: Vec<[T; 4]>,
    bed: Vec<T>,
    manning: Vec<T>,
    flow_flags: Vec<u32>,
    bound_coup: Vec<[T; 2]>,
    dsdt: Vec<T>,
}

impl<T: Copy + Default> CellArrays<T> {
    fn new(count: usize) -> Self {
        CellArrays {
            state: vec![[T::default(); 4]; count],
            bed: vec![T::default(); count],
            manning: vec![T::default(); count],
            flow_flags: vec![0; count],
            bound_coup: vec![[T::default(); 2]; count],
            dsdt: vec![T::default(); count],
        }
    }
}

enum CellStore {
    Single(CellArrays<f32>),
    Double(CellArrays<f64>),
}

/// Round `value` to `decimals` decimal places.
pub fn round_to(value: f64, decimals: u8) -> f64 {
    let scale = 10f64.powi(i32::from(decimals));
    (value * scale).round() / scale
}

/// Compact image bundle handed to the scheme at prepare time.
pub struct DomainImages {
    pub state: Vec<u8>,
    pub bed: Vec<u8>,
    pub manning: Vec<u8>,
    pub flow_flags: Vec<u8>,
    pub bound_coup: Vec<u8>,
    pub dsdt: Vec<u8>,
}

/// Read-only descriptor the scheme captures at prepare time.
#[derive(Copy, Clone, Debug)]
pub struct DomainDescriptor {
    pub cols: usize,
    pub rows: usize,
    pub cell_count: usize,
    pub resolution: f64,
    pub precision: Precision,
}

// ============================================================================
// The domain proper
// ============================================================================

/// A regular Cartesian grid of cells and all their host-side arrays.
pub struct CartesianDomain {
    def: DomainDefinition,
    store: CellStore,
    min_topo: f64,
    max_topo: f64,
    min_fsl: f64,
    max_fsl: f64,
    min_depth: f64,
    max_depth: f64,
}

impl CartesianDomain {
    pub fn new(def: DomainDefinition) -> Result<CartesianDomain, DomainError> {
        if def.cols == 0 || def.rows == 0 {
            return Err(DomainError::EmptyDomain {
                cols: def.cols,
                rows: def.rows,
            });
        }
        if !(def.resolution > 0.0) {
            return Err(DomainError::BadResolution(def.resolution));
        }
        let count = def.cols as usize * def.rows as usize;
        let store = match def.precision {
            Precision::Single => CellStore::Single(CellArrays::new(count)),
            Precision::Double => CellStore::Double(CellArrays::new(count)),
        };
        info!(
            cols = def.cols,
            rows = def.rows,
            resolution = def.resolution,
            precision = ?def.precision,
            "domain allocated"
        );
        Ok(CartesianDomain {
            def,
            store,
            min_topo: 9999.0,
            max_topo: -9999.0,
            min_fsl: 9999.0,
            max_fsl: -9999.0,
            min_depth: 9999.0,
            max_depth: -9999.0,
        })
    }

    // -- geometry --------------------------------------------------------

    pub fn cols(&self) -> usize {
        self.def.cols as usize
    }

    pub fn rows(&self) -> usize {
        self.def.rows as usize
    }

    pub fn cell_count(&self) -> usize {
        self.cols() * self.rows()
    }

    pub fn resolution(&self) -> f64 {
        self.def.resolution
    }

    pub fn precision(&self) -> Precision {
        self.def.precision
    }

    pub fn definition(&self) -> &DomainDefinition {
        &self.def
    }

    /// Row-major flat index: `j · cols + i`.
    pub fn cell_id(&self, i: u32, j: u32) -> usize {
        j as usize * self.cols() + i as usize
    }

    /// Inverse of [`CartesianDomain::cell_id`].
    pub fn cell_coords(&self, id: usize) -> (u32, u32) {
        ((id % self.cols()) as u32, (id / self.cols()) as u32)
    }

    pub fn descriptor(&self) -> DomainDescriptor {
        DomainDescriptor {
            cols: self.cols(),
            rows: self.rows(),
            cell_count: self.cell_count(),
            resolution: self.def.resolution,
            precision: self.def.precision,
        }
    }

    fn check(&self, id: usize) -> Result<(), DomainError> {
        if id >= self.cell_count() {
            return Err(DomainError::CellOutOfRange {
                index: id,
                count: self.cell_count(),
            });
        }
        Ok(())
    }

    // -- typed accessors (branch once on precision) ----------------------

    pub fn set_state_value(
        &mut self,
        id: usize,
        component: StateComponent,
        value: f64,
    ) -> Result<(), DomainError> {
        self.check(id)?;
        let c = component as usize;
        match &mut self.store {
            CellStore::Single(a) => a.state[id][c] = value as f32,
            CellStore::Double(a) => a.state[id][c] = value,
        }
        Ok(())
    }

    pub fn get_state_value(&self, id: usize, component: StateComponent) -> f64 {
        let c = component as usize;
        match &self.store {
            CellStore::Single(a) => f64::from(a.state[id][c]),
            CellStore::Double(a) => a.state[id][c],
        }
    }

    pub fn set_bed_elevation(&mut self, id: usize, value: f64) -> Result<(), DomainError> {
        self.check(id)?;
        match &mut self.store {
            CellStore::Single(a) => a.bed[id] = value as f32,
            CellStore::Double(a) => a.bed[id] = value,
        }
        Ok(())
    }

    pub fn get_bed_elevation(&self, id: usize) -> f64 {
        match &self.store {
            CellStore::Single(a) => f64::from(a.bed[id]),
            CellStore::Double(a) => a.bed[id],
        }
    }

    pub fn set_manning_coefficient(&mut self, id: usize, value: f64) -> Result<(), DomainError> {
        self.check(id)?;
        match &mut self.store {
            CellStore::Single(a) => a.manning[id] = value as f32,
            CellStore::Double(a) => a.manning[id] = value,
        }
        Ok(())
    }

    pub fn get_manning_coefficient(&self, id: usize) -> f64 {
        match &self.store {
            CellStore::Single(a) => f64::from(a.manning[id]),
            CellStore::Double(a) => a.manning[id],
        }
    }

    pub fn set_flow_flags(&mut self, id: usize, flags: u32) -> Result<(), DomainError> {
        self.check(id)?;
        match &mut self.store {
            CellStore::Single(a) => a.flow_flags[id] = flags,
            CellStore::Double(a) => a.flow_flags[id] = flags,
        }
        Ok(())
    }

    pub fn get_flow_flags(&self, id: usize) -> u32 {
        match &self.store {
            CellStore::Single(a) => a.flow_flags[id],
            CellStore::Double(a) => a.flow_flags[id],
        }
    }

    /// Set the boundary/coupling pair: injected source rate and two-way sink.
    pub fn set_boundary_coupling(
        &mut self,
        id: usize,
        source: f64,
        sink: f64,
    ) -> Result<(), DomainError> {
        self.check(id)?;
        match &mut self.store {
            CellStore::Single(a) => a.bound_coup[id] = [source as f32, sink as f32],
            CellStore::Double(a) => a.bound_coup[id] = [source, sink],
        }
        Ok(())
    }

    pub fn get_boundary_coupling(&self, id: usize) -> (f64, f64) {
        match &self.store {
            CellStore::Single(a) => {
                (f64::from(a.bound_coup[id][0]), f64::from(a.bound_coup[id][1]))
            }
            CellStore::Double(a) => (a.bound_coup[id][0], a.bound_coup[id][1]),
        }
    }

    pub fn get_dsdt(&self, id: usize) -> f64 {
        match &self.store {
            CellStore::Single(a) => f64::from(a.dsdt[id]),
            CellStore::Double(a) => a.dsdt[id],
        }
    }

    /// Is the cell permanently excluded from computation?
    pub fn is_cell_disabled(&self, id: usize) -> bool {
        self.get_state_value(id, StateComponent::MaxFreeSurfaceLevel) == DISABLED_CELL
    }

    // -- min/max trackers -------------------------------------------------

    pub fn min_topography(&self) -> f64 {
        self.min_topo
    }
    pub fn max_topography(&self) -> f64 {
        self.max_topo
    }
    pub fn min_fsl(&self) -> f64 {
        self.min_fsl
    }
    pub fn max_fsl(&self) -> f64 {
        self.max_fsl
    }
    pub fn min_depth(&self) -> f64 {
        self.min_depth
    }
    pub fn max_depth(&self) -> f64 {
        self.max_depth
    }

    // -- external input normalisation ------------------------------------

    /// Normalise one raster value: round to `decimals`, dispatch on `kind`,
    /// update the min/max trackers. `−9999` is missing data; the disabled
    /// channel encodes a disabled cell as `1 < value < 9999`.
    pub fn handle_input_data(
        &mut self,
        id: usize,
        value: f64,
        kind: InputKind,
        decimals: u8,
    ) -> Result<(), DomainError> {
        self.check(id)?;
        let rounded = round_to(value, decimals);
        match kind {
            InputKind::BedElevation => {
                self.set_bed_elevation(id, rounded)?;
                // A fresh bed starts the water column dry at the bed level.
                self.set_state_value(id, StateComponent::FreeSurfaceLevel, rounded)?;
                if value != DISABLED_CELL {
                    if value < self.min_topo {
                        self.min_topo = value;
                    }
                    if value > self.max_topo {
                        self.max_topo = value;
                    }
                }
            }
            InputKind::FreeSurfaceLevel => {
                self.set_state_value(id, StateComponent::FreeSurfaceLevel, rounded)?;
                self.set_state_value(id, StateComponent::MaxFreeSurfaceLevel, rounded)?;
                let bed = self.get_bed_elevation(id);
                if bed > DISABLED_CELL && value > DISABLED_CELL {
                    let depth = value - bed;
                    if depth < self.min_depth {
                        self.min_depth = depth;
                    }
                    if depth > self.max_depth {
                        self.max_depth = depth;
                    }
                    if value < self.min_fsl {
                        self.min_fsl = value;
                    }
                    if value > self.max_fsl {
                        self.max_fsl = value;
                    }
                }
            }
            InputKind::Depth => {
                let bed = self.get_bed_elevation(id);
                let fsl = round_to(bed + value, decimals);
                self.set_state_value(id, StateComponent::FreeSurfaceLevel, fsl)?;
                self.set_state_value(id, StateComponent::MaxFreeSurfaceLevel, fsl)?;
                if bed > DISABLED_CELL && value > DISABLED_CELL {
                    if value < self.min_depth {
                        self.min_depth = value;
                    }
                    if value > self.max_depth {
                        self.max_depth = value;
                    }
                    if bed + value < self.min_fsl {
                        self.min_fsl = bed + value;
                    }
                    if bed + value > self.max_fsl {
                        self.max_fsl = bed + value;
                    }
                }
            }
            InputKind::DisabledCells => {
                if value > 1.0 && value < 9999.0 {
                    self.set_state_value(id, StateComponent::MaxFreeSurfaceLevel, DISABLED_CELL)?;
                }
            }
            InputKind::DischargeX => {
                self.set_state_value(id, StateComponent::DischargeX, rounded)?;
            }
            InputKind::DischargeY => {
                self.set_state_value(id, StateComponent::DischargeY, rounded)?;
            }
            InputKind::VelocityX => {
                // Raw column height (η − b), not the zero-clamped depth.
                let h = self.get_state_value(id, StateComponent::FreeSurfaceLevel)
                    - self.get_bed_elevation(id);
                self.set_state_value(
                    id,
                    StateComponent::DischargeX,
                    round_to(value * h, decimals),
                )?;
            }
            InputKind::VelocityY => {
                let h = self.get_state_value(id, StateComponent::FreeSurfaceLevel)
                    - self.get_bed_elevation(id);
                self.set_state_value(
                    id,
                    StateComponent::DischargeY,
                    round_to(value * h, decimals),
                )?;
            }
            InputKind::Manning => {
                self.set_manning_coefficient(id, rounded)?;
            }
            InputKind::MaxDepth => {
                let bed = self.get_bed_elevation(id);
                self.set_state_value(
                    id,
                    StateComponent::MaxFreeSurfaceLevel,
                    round_to(bed + value, decimals),
                )?;
            }
            InputKind::MaxFsl => {
                self.set_state_value(id, StateComponent::MaxFreeSurfaceLevel, rounded)?;
            }
            InputKind::FroudeNumber => {
                // Fr = u / √(g·h): recover a discharge magnitude along x.
                let h = self.depth_at(id);
                let q = value * h * (crate::GRAVITY * h).sqrt();
                self.set_state_value(id, StateComponent::DischargeX, round_to(q, decimals))?;
            }
        }
        Ok(())
    }

    /// Water depth at a cell, clamped at zero.
    pub fn depth_at(&self, id: usize) -> f64 {
        (self.get_state_value(id, StateComponent::FreeSurfaceLevel) - self.get_bed_elevation(id))
            .max(0.0)
    }

    /// Total water volume over enabled cells.
    pub fn volume(&self) -> f64 {
        let area = self.def.resolution * self.def.resolution;
        let mut total = 0.0;
        for id in 0..self.cell_count() {
            if self.is_cell_disabled(id) {
                continue;
            }
            total += self.depth_at(id) * area;
        }
        total
    }

    // -- images for the scheme -------------------------------------------

    /// Serialise every host array into little-endian device images.
    pub fn images(&self) -> DomainImages {
        let p = self.def.precision;
        let n = self.cell_count();
        let s = p.scalar_size();

        let mut state = vec![0u8; n * 4 * s];
        let mut bed = vec![0u8; n * s];
        let mut manning = vec![0u8; n * s];
        let mut flow_flags = vec![0u8; n * 4];
        let mut bound_coup = vec![0u8; n * 2 * s];
        let mut dsdt = vec![0u8; n * s];

        for id in 0..n {
            for c in 0..4 {
                let v = match c {
                    0 => self.get_state_value(id, StateComponent::FreeSurfaceLevel),
                    1 => self.get_state_value(id, StateComponent::MaxFreeSurfaceLevel),
                    2 => self.get_state_value(id, StateComponent::DischargeX),
                    _ => self.get_state_value(id, StateComponent::DischargeY),
                };
                set_scalar_at(&mut state, p, id * 4 + c, v);
            }
            set_scalar_at(&mut bed, p, id, self.get_bed_elevation(id));
            set_scalar_at(&mut manning, p, id, self.get_manning_coefficient(id));
            set_word_at(&mut flow_flags, id, self.get_flow_flags(id));
            let (bc, cc) = self.get_boundary_coupling(id);
            set_scalar_at(&mut bound_coup, p, id * 2, bc);
            set_scalar_at(&mut bound_coup, p, id * 2 + 1, cc);
            set_scalar_at(&mut dsdt, p, id, self.get_dsdt(id));
        }

        DomainImages {
            state,
            bed,
            manning,
            flow_flags,
            bound_coup,
            dsdt,
        }
    }

    /// Copy a freshly downloaded state image back into the host arrays.
    pub fn absorb_state_image(&mut self, image: &StateImage) -> Result<(), DomainError> {
        if image.precision != self.def.precision {
            return Err(DomainError::ImagePrecisionMismatch);
        }
        let expected = self.cell_count() * 4 * self.def.precision.scalar_size();
        if image.bytes.len() != expected {
            return Err(DomainError::ImageSizeMismatch {
                got: image.bytes.len(),
                expected,
            });
        }
        let p = self.def.precision;
        for id in 0..self.cell_count() {
            for (c, component) in [
                StateComponent::FreeSurfaceLevel,
                StateComponent::MaxFreeSurfaceLevel,
                StateComponent::DischargeX,
                StateComponent::DischargeY,
            ]
            .into_iter()
            .enumerate()
            {
                self.set_state_value(id, component, scalar_at(&image.bytes, p, id * 4 + c))?;
            }
            // Kernels must hold disabled cells at zero discharge.
            debug_assert!(
                !self.is_cell_disabled(id)
                    || (self.get_state_value(id, StateComponent::DischargeX) == 0.0
                        && self.get_state_value(id, StateComponent::DischargeY) == 0.0),
                "disabled cell {id} carries discharge"
            );
        }
        Ok(())
    }

    // -- output read-back -------------------------------------------------

    /// Water depth per cell, freshly synchronised from the device.
    pub fn read_depths(&mut self, sync: &dyn StateSync) -> Result<Vec<f64>, DomainError> {
        let image = sync.synchronise_states()?;
        self.absorb_state_image(&image)?;
        Ok((0..self.cell_count()).map(|id| self.depth_at(id)).collect())
    }

    /// `ds/dt` accumulator per cell, freshly synchronised from the device.
    pub fn read_dsdt(&mut self, sync: &dyn StateSync) -> Result<Vec<f64>, DomainError> {
        let image = sync.synchronise_derivatives()?;
        let expected = self.cell_count() * self.def.precision.scalar_size();
        if image.bytes.len() != expected {
            return Err(DomainError::ImageSizeMismatch {
                got: image.bytes.len(),
                expected,
            });
        }
        let p = self.def.precision;
        let values: Vec<f64> = (0..self.cell_count())
            .map(|id| scalar_at(&image.bytes, p, id))
            .collect();
        match &mut self.store {
            CellStore::Single(a) => {
                for (slot, v) in a.dsdt.iter_mut().zip(values.iter()) {
                    *slot = *v as f32;
                }
            }
            CellStore::Double(a) => a.dsdt.copy_from_slice(&values),
        }
        Ok(values)
    }

    /// X velocity per cell (`q_x / h`, zero where dry), freshly synchronised.
    pub fn read_velocity_x(
        &mut self,
        sync: &dyn StateSync,
        dry_threshold: f64,
    ) -> Result<Vec<f64>, DomainError> {
        let image = sync.synchronise_states()?;
        self.absorb_state_image(&image)?;
        Ok(self.velocities(StateComponent::DischargeX, dry_threshold))
    }

    /// Y velocity per cell (`q_y / h`, zero where dry), freshly synchronised.
    pub fn read_velocity_y(
        &mut self,
        sync: &dyn StateSync,
        dry_threshold: f64,
    ) -> Result<Vec<f64>, DomainError> {
        let image = sync.synchronise_states()?;
        self.absorb_state_image(&image)?;
        Ok(self.velocities(StateComponent::DischargeY, dry_threshold))
    }

    fn velocities(&self, component: StateComponent, dry_threshold: f64) -> Vec<f64> {
        (0..self.cell_count())
            .map(|id| {
                let h = self.depth_at(id);
                if h > dry_threshold {
                    self.get_state_value(id, component) / h
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Decode one flow-flag word from a raw flags image.
    pub fn flow_flags_from_image(bytes: &[u8], id: usize) -> u32 {
        word_at(bytes, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain(cols: u32, rows: u32, precision: Precision) -> CartesianDomain {
        CartesianDomain::new(DomainDefinition {
            cols,
            rows,
            resolution: 10.0,
            offset_x: 0.0,
            offset_y: 0.0,
            precision,
        })
        .unwrap()
    }

    #[test]
    fn construction_validates_dimensions() {
        assert!(matches!(
            CartesianDomain::new(DomainDefinition {
                cols: 0,
                rows: 5,
                resolution: 10.0,
                offset_x: 0.0,
                offset_y: 0.0,
                precision: Precision::Double,
            }),
            Err(DomainError::EmptyDomain { .. })
        ));
        assert!(matches!(
            CartesianDomain::new(DomainDefinition {
                cols: 5,
                rows: 5,
                resolution: 0.0,
                offset_x: 0.0,
                offset_y: 0.0,
                precision: Precision::Double,
            }),
            Err(DomainError::BadResolution(_))
        ));
    }

    #[test]
    fn cell_indexing_is_row_major() {
        let d = domain(7, 3, Precision::Double);
        assert_eq!(d.cell_id(0, 0), 0);
        assert_eq!(d.cell_id(6, 0), 6);
        assert_eq!(d.cell_id(0, 1), 7);
        assert_eq!(d.cell_id(3, 2), 17);
        assert_eq!(d.cell_coords(17), (3, 2));
    }

    #[test]
    fn bed_input_round_trips_with_rounding() {
        let mut d = domain(4, 4, Precision::Double);
        d.handle_input_data(5, 1.23456, InputKind::BedElevation, 2)
            .unwrap();
        assert_eq!(d.get_bed_elevation(5), 1.23);
        // A fresh bed leaves the cell dry: FSL equals the bed.
        assert_eq!(d.get_state_value(5, StateComponent::FreeSurfaceLevel), 1.23);
        assert_eq!(d.min_topography(), 1.23456);
        assert_eq!(d.max_topography(), 1.23456);
    }

    #[test]
    fn sentinel_values_do_not_move_the_trackers() {
        let mut d = domain(4, 4, Precision::Double);
        d.handle_input_data(0, -9999.0, InputKind::BedElevation, 2)
            .unwrap();
        assert_eq!(d.min_topography(), 9999.0);
        assert_eq!(d.max_topography(), -9999.0);
    }

    #[test]
    fn depth_input_builds_on_the_bed() {
        let mut d = domain(4, 4, Precision::Double);
        d.handle_input_data(3, 2.0, InputKind::BedElevation, 3).unwrap();
        d.handle_input_data(3, 0.5, InputKind::Depth, 3).unwrap();
        assert_eq!(d.get_state_value(3, StateComponent::FreeSurfaceLevel), 2.5);
        assert_eq!(d.depth_at(3), 0.5);
        assert_eq!(d.max_depth(), 0.5);
    }

    #[test]
    fn disabled_channel_uses_the_documented_encoding() {
        let mut d = domain(4, 4, Precision::Double);
        d.handle_input_data(1, 2.0, InputKind::DisabledCells, 2).unwrap();
        assert!(d.is_cell_disabled(1));
        // Values outside (1, 9999) leave the cell enabled.
        d.handle_input_data(2, 0.5, InputKind::DisabledCells, 2).unwrap();
        assert!(!d.is_cell_disabled(2));
        d.handle_input_data(3, 9999.5, InputKind::DisabledCells, 2).unwrap();
        assert!(!d.is_cell_disabled(3));
    }

    #[test]
    fn velocity_inputs_scale_by_depth() {
        let mut d = domain(4, 4, Precision::Double);
        d.handle_input_data(0, 0.0, InputKind::BedElevation, 3).unwrap();
        d.handle_input_data(0, 2.0, InputKind::Depth, 3).unwrap();
        d.handle_input_data(0, 1.5, InputKind::VelocityX, 3).unwrap();
        assert_eq!(d.get_state_value(0, StateComponent::DischargeX), 3.0);
    }

    #[test]
    fn volume_sums_enabled_wet_cells() {
        let mut d = domain(2, 2, Precision::Double);
        for id in 0..4 {
            d.handle_input_data(id, 0.0, InputKind::BedElevation, 3).unwrap();
        }
        d.handle_input_data(0, 0.1, InputKind::Depth, 3).unwrap();
        d.handle_input_data(1, 0.2, InputKind::Depth, 3).unwrap();
        d.handle_input_data(3, 5.0, InputKind::DisabledCells, 3).unwrap();
        // 10 m resolution: (0.1 + 0.2) * 100 m².
        assert!((d.volume() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn images_and_absorb_round_trip() {
        let mut d = domain(3, 2, Precision::Single);
        for id in 0..6 {
            d.handle_input_data(id, 1.0, InputKind::BedElevation, 2).unwrap();
        }
        d.handle_input_data(4, 0.25, InputKind::Depth, 2).unwrap();
        let images = d.images();
        assert_eq!(images.state.len(), 6 * 4 * 4);
        assert_eq!(images.bed.len(), 6 * 4);
        assert_eq!(images.flow_flags.len(), 6 * 4);

        let mut absorbed = domain(3, 2, Precision::Single);
        absorbed
            .absorb_state_image(&StateImage {
                precision: Precision::Single,
                bytes: images.state.clone(),
            })
            .unwrap();
        assert_eq!(
            absorbed.get_state_value(4, StateComponent::FreeSurfaceLevel),
            1.25
        );
        assert!(matches!(
            absorbed.absorb_state_image(&StateImage {
                precision: Precision::Double,
                bytes: images.state,
            }),
            Err(DomainError::ImagePrecisionMismatch)
        ));
    }

    #[test]
    fn flow_flags_round_trip_through_images() {
        let mut d = domain(2, 1, Precision::Double);
        d.set_flow_flags(1, FLAG_NO_FLOW_X | FLAG_POLENI_Y).unwrap();
        let images = d.images();
        assert_eq!(
            CartesianDomain::flow_flags_from_image(&images.flow_flags, 1),
            FLAG_NO_FLOW_X | FLAG_POLENI_Y
        );
    }
}
