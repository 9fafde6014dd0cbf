//! "Happy-path" crate API
//!
//! This module wraps the engine with a small, ergonomic surface:
//! - [`SimulationBuilder`] hides device selection and scheme wiring behind
//!   safe defaults (first available device, Godunov scheme, forecast sync)
//! - one-shot [`Simulation::run`] drives the model to completion
//! - read-back helpers return the derived output arrays in `f64`
//!
//! Everything delegates to the real components (`Executor`, `CartesianDomain`,
//! `BoundarySet`, `Scheme`, `Model`); nothing here adds behaviour.

use crate::boundary::{BoundaryDefinition, BoundarySet};
use crate::device::{DeviceFilter, Executor};
use crate::domain::{CartesianDomain, DomainDefinition, DomainError};
use crate::manager::DomainManager;
use crate::model::{
    Model, ModelSettings, OutputSink, RunSummary, SimulationError, SimulationErrorKind,
};
use crate::scheme::{Scheme, SchemeSettings, SyncMethod};
use crate::Severity;

type SetupFn = Box<dyn FnOnce(&mut CartesianDomain) -> Result<(), DomainError>>;

/// Ergonomic constructor for a ready-to-run [`Simulation`].
///
/// Defaults:
/// - first enumerated compute device
/// - Godunov scheme, CFL timestep, forecast sync
/// - one hour simulated, outputs at the end only
pub struct SimulationBuilder {
    definition: DomainDefinition,
    setup: Option<SetupFn>,
    boundaries: Vec<BoundaryDefinition>,
    scheme: SchemeSettings,
    model: ModelSettings,
    sync_method: SyncMethod,
    device_filter: DeviceFilter,
    sink: Option<Box<dyn OutputSink>>,
}

impl SimulationBuilder {
    pub fn new(definition: DomainDefinition) -> SimulationBuilder {
        SimulationBuilder {
            definition,
            setup: None,
            boundaries: Vec::new(),
            scheme: SchemeSettings::default(),
            model: ModelSettings::new(3600.0, 3600.0),
            sync_method: SyncMethod::Forecast,
            device_filter: DeviceFilter::default(),
            sink: None,
        }
    }

    /// Populate the domain (bed, roughness, initial water) before prepare.
    pub fn initial_conditions(
        mut self,
        setup: impl FnOnce(&mut CartesianDomain) -> Result<(), DomainError> + 'static,
    ) -> Self {
        self.setup = Some(Box::new(setup));
        self
    }

    /// Add one boundary definition; invalid ones are warned about and
    /// skipped at build time, as the loaders do.
    pub fn boundary(mut self, definition: BoundaryDefinition) -> Self {
        self.boundaries.push(definition);
        self
    }

    pub fn scheme_settings(mut self, settings: SchemeSettings) -> Self {
        self.scheme = settings;
        self
    }

    pub fn simulation_length(mut self, seconds: f64) -> Self {
        self.model.simulation_length = seconds;
        self
    }

    pub fn output_frequency(mut self, seconds: f64) -> Self {
        self.model.output_frequency = seconds;
        self
    }

    pub fn sync_method(mut self, method: SyncMethod) -> Self {
        self.sync_method = method;
        self
    }

    pub fn device_filter(mut self, filter: DeviceFilter) -> Self {
        self.device_filter = filter;
        self
    }

    pub fn output_sink(mut self, sink: Box<dyn OutputSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the domain, select a device, prepare the scheme, wire the model.
    pub fn build(self) -> Result<Simulation, SimulationError> {
        let stop = |kind: SimulationErrorKind| SimulationError {
            time: 0.0,
            severity: Severity::ModelStop,
            kind,
        };

        let mut domain = CartesianDomain::new(self.definition)
            .map_err(|e| stop(SimulationErrorKind::Domain(e)))?;
        if let Some(setup) = self.setup {
            setup(&mut domain).map_err(|e| stop(SimulationErrorKind::Domain(e)))?;
        }

        // The manager owns the domain set and the cross-domain sync policy;
        // single-node runs take the one domain straight back out.
        let mut manager = DomainManager::new();
        manager.set_sync_method(self.sync_method);
        let slot = manager.add_domain(domain);
        manager.log_details();
        let domain = manager.take_domain(slot).expect("domain was just added");

        let mut executor = Executor::new();
        let device = executor
            .select_device(&self.device_filter)
            .map_err(|e| stop(SimulationErrorKind::Scheme(e.into())))?;

        let boundaries = BoundarySet::from_definitions(&self.boundaries, &domain);
        let scheme = Scheme::prepare(
            &device,
            &domain,
            boundaries,
            manager.sync_method(),
            self.scheme,
            self.model.simulation_length,
            self.model.output_frequency,
        )
        .map_err(|e| stop(SimulationErrorKind::Scheme(e)))?;

        let mut model = Model::new(domain, scheme, self.model);
        if let Some(sink) = self.sink {
            model.set_output_sink(sink);
        }
        Ok(Simulation { model })
    }
}

/// A prepared simulation, ready to run once.
pub struct Simulation {
    model: Model,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation").finish_non_exhaustive()
    }
}

impl Simulation {
    pub fn run(&mut self) -> Result<RunSummary, SimulationError> {
        self.model.run()
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut Model {
        &mut self.model
    }

    /// Water depth per cell (`η − b`), indexed `j·cols + i`.
    pub fn read_depths(&mut self) -> Result<Vec<f64>, DomainError> {
        self.model.read_depths()
    }

    /// Surface-rate accumulator per cell (simplified schemes).
    pub fn read_dsdt(&mut self) -> Result<Vec<f64>, DomainError> {
        self.model.read_dsdt()
    }

    /// X velocity per cell (`q_x / h`, zero where dry).
    pub fn read_velocity_x(&mut self) -> Result<Vec<f64>, DomainError> {
        self.model.read_velocity_x()
    }

    /// Y velocity per cell (`q_y / h`, zero where dry).
    pub fn read_velocity_y(&mut self) -> Result<Vec<f64>, DomainError> {
        self.model.read_velocity_y()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boundary::{BoundaryKind, UniformValue};
    use crate::domain::InputKind;
    use crate::Precision;

    fn definition(cols: u32, rows: u32) -> DomainDefinition {
        DomainDefinition {
            cols,
            rows,
            resolution: 10.0,
            offset_x: 0.0,
            offset_y: 0.0,
            precision: Precision::Double,
        }
    }

    #[test]
    fn builder_runs_a_small_rain_simulation() {
        let rain = BoundaryDefinition {
            name: "rain".to_string(),
            kind: BoundaryKind::Uniform {
                value: UniformValue::RainIntensity,
                rows: vec![vec![0.0, 36.0], vec![600.0, 36.0]],
            },
        };
        let mut simulation = SimulationBuilder::new(definition(8, 8))
            .initial_conditions(|domain| {
                for id in 0..domain.cell_count() {
                    domain.handle_input_data(id, 0.0, InputKind::BedElevation, 4)?;
                }
                Ok(())
            })
            .boundary(rain)
            .simulation_length(100.0)
            .output_frequency(100.0)
            .build()
            .unwrap();

        let summary = simulation.run().unwrap();
        assert!((summary.final_time - 100.0).abs() <= 1e-5);
        // 1e-5 m/s over 64 cells × 100 m² × 100 s.
        let expected = 64.0 * 100.0 * 1.0e-5 * 100.0;
        assert!((summary.final_volume - expected).abs() <= expected * 0.01);

        let depths = simulation.read_depths().unwrap();
        assert_eq!(depths.len(), 64);
        assert!(depths.iter().all(|h| (*h - 1.0e-3).abs() < 1.0e-4));
    }

    #[test]
    fn builder_reports_bad_domains_with_model_stop_severity() {
        let err = SimulationBuilder::new(definition(0, 8)).build().unwrap_err();
        assert_eq!(err.severity, Severity::ModelStop);
        assert_eq!(err.time, 0.0);
    }

    #[test]
    fn settings_round_trip_through_json() {
        let settings = SchemeSettings::default();
        let text = serde_json::to_string(&settings).unwrap();
        let back: SchemeSettings = serde_json::from_str(&text).unwrap();
        assert_eq!(back.courant_number, settings.courant_number);
        assert_eq!(back.rollback_limit, settings.rollback_limit);

        let def = definition(8, 4);
        let text = serde_json::to_string(&def).unwrap();
        let back: DomainDefinition = serde_json::from_str(&text).unwrap();
        assert_eq!(back.cols, 8);
        assert_eq!(back.rows, 4);
        assert_eq!(back.precision, Precision::Double);

        let boundary = BoundaryDefinition {
            name: "rain".to_string(),
            kind: BoundaryKind::Uniform {
                value: UniformValue::LossRate,
                rows: vec![vec![0.0, 1.0], vec![60.0, 0.5]],
            },
        };
        let text = serde_json::to_string(&boundary).unwrap();
        let back: BoundaryDefinition = serde_json::from_str(&text).unwrap();
        assert_eq!(back.name, "rain");
    }
}
