//! Domain manager: the domain set and its synchronisation strategy
//!
//! The engine is built against a multi-domain interface even though a single
//! node runs one domain per device today. The manager owns the domains,
//! chooses the synchronisation method all schemes must share, and carries the
//! spare-iteration target the forecast proposal leans on.

use tracing::info;

use crate::domain::CartesianDomain;
use crate::scheme::{Scheme, SyncMethod};

/// Aggregate progress over every domain, for telemetry.
#[derive(Clone, Debug, Default)]
pub struct SetProgress {
    pub total_cells_calculated: u64,
    pub earliest_time: f64,
    pub smallest_timestep: f64,
}

/// Owns the set of domains and the cross-domain synchronisation policy.
pub struct DomainManager {
    domains: Vec<CartesianDomain>,
    sync_method: SyncMethod,
    sync_batch_spares: u32,
}

impl DomainManager {
    pub fn new() -> DomainManager {
        DomainManager {
            domains: Vec::new(),
            sync_method: SyncMethod::Forecast,
            sync_batch_spares: 3,
        }
    }

    /// Add a domain, returning its index in the set.
    pub fn add_domain(&mut self, domain: CartesianDomain) -> usize {
        self.domains.push(domain);
        self.domains.len() - 1
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub fn domain(&self, index: usize) -> Option<&CartesianDomain> {
        self.domains.get(index)
    }

    pub fn domain_mut(&mut self, index: usize) -> Option<&mut CartesianDomain> {
        self.domains.get_mut(index)
    }

    /// Remove and return a domain (hand-off to a model).
    pub fn take_domain(&mut self, index: usize) -> Option<CartesianDomain> {
        if index < self.domains.len() {
            Some(self.domains.remove(index))
        } else {
            None
        }
    }

    pub fn sync_method(&self) -> SyncMethod {
        self.sync_method
    }

    /// Multiple domains must exchange Δt; force timestep sync for them.
    pub fn set_sync_method(&mut self, method: SyncMethod) {
        self.sync_method = method;
    }

    pub fn sync_batch_spares(&self) -> u32 {
        self.sync_batch_spares
    }

    pub fn set_sync_batch_spares(&mut self, spares: u32) {
        self.sync_batch_spares = spares;
    }

    /// Is every domain backed by a live, healthy scheme? For single-domain
    /// runs this collapses to "the one scheme is prepared".
    pub fn is_set_ready(&self, schemes: &[&Scheme]) -> bool {
        schemes.len() == self.domains.len()
            && schemes.iter().all(|s| s.worker_error().is_none())
    }

    /// Aggregate batch progress across the set.
    pub fn progress(&self, schemes: &[&Scheme]) -> SetProgress {
        let mut progress = SetProgress {
            total_cells_calculated: 0,
            earliest_time: f64::MAX,
            smallest_timestep: f64::MAX,
        };
        for scheme in schemes {
            progress.total_cells_calculated += scheme.cells_calculated();
            progress.earliest_time = progress.earliest_time.min(scheme.current_time());
            let dt = scheme.current_timestep();
            if dt > 0.0 {
                progress.smallest_timestep = progress.smallest_timestep.min(dt);
            }
        }
        if schemes.is_empty() {
            progress.earliest_time = 0.0;
            progress.smallest_timestep = 0.0;
        }
        progress
    }

    pub fn log_details(&self) {
        info!(
            domains = self.domains.len(),
            sync_method = ?self.sync_method,
            batch_spares = self.sync_batch_spares,
            "domain set"
        );
        for (index, domain) in self.domains.iter().enumerate() {
            info!(
                domain = index,
                cols = domain.cols(),
                rows = domain.rows(),
                resolution = domain.resolution(),
                "domain"
            );
        }
    }
}

impl Default for DomainManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DomainDefinition;
    use crate::Precision;

    fn domain() -> CartesianDomain {
        CartesianDomain::new(DomainDefinition {
            cols: 4,
            rows: 4,
            resolution: 10.0,
            offset_x: 0.0,
            offset_y: 0.0,
            precision: Precision::Double,
        })
        .unwrap()
    }

    #[test]
    fn defaults_choose_forecast_with_three_spares() {
        let manager = DomainManager::new();
        assert_eq!(manager.sync_method(), SyncMethod::Forecast);
        assert_eq!(manager.sync_batch_spares(), 3);
        assert_eq!(manager.domain_count(), 0);
    }

    #[test]
    fn domains_can_be_added_and_taken() {
        let mut manager = DomainManager::new();
        let index = manager.add_domain(domain());
        assert_eq!(index, 0);
        assert_eq!(manager.domain_count(), 1);
        assert!(manager.domain(0).is_some());
        let taken = manager.take_domain(0);
        assert!(taken.is_some());
        assert_eq!(manager.domain_count(), 0);
        assert!(manager.take_domain(0).is_none());
    }

    #[test]
    fn empty_set_without_schemes_is_ready() {
        let manager = DomainManager::new();
        assert!(manager.is_set_ready(&[]));
        let progress = manager.progress(&[]);
        assert_eq!(progress.total_cells_calculated, 0);
        assert_eq!(progress.earliest_time, 0.0);
    }
}
