//! Node fields with a solver-visible global copy and a ghost-complete local
//! snapshot.
//!
//! The global copy is what solvers read and write; only its owned entries are
//! authoritative. The local snapshot is refreshed by [`GhostedField::refresh`],
//! an explicit collective scatter, and is marked stale by every mutable access
//! to the global copy.

use crate::algs::communicator::Communicator;
use crate::algs::ghost::exchange_ghosts;
use crate::surface_error::SurfaceError;
use crate::topology::partition::MeshPartition;

#[derive(Clone, Debug)]
pub struct GhostedField {
    global: Vec<f64>,
    local: Vec<f64>,
    stale: bool,
}

impl GhostedField {
    pub fn zeros(npoints: usize) -> Self {
        Self::from_values(vec![0.0; npoints])
    }

    /// Field whose ghost entries are already consistent with their owners.
    pub fn from_values(values: Vec<f64>) -> Self {
        Self {
            local: values.clone(),
            global: values,
            stale: false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.global.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.global.is_empty()
    }

    #[inline]
    pub fn global(&self) -> &[f64] {
        &self.global
    }

    /// Mutable access to the global copy; the local snapshot becomes stale.
    #[inline]
    pub fn global_mut(&mut self) -> &mut [f64] {
        self.stale = true;
        &mut self.global
    }

    /// Ghost-complete snapshot as of the last refresh.
    #[inline]
    pub fn local(&self) -> &[f64] {
        debug_assert!(!self.stale, "local snapshot read before refresh");
        &self.local
    }

    #[inline]
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// `global[i] += alpha * x[i]` over owned entries.
    pub fn axpy(&mut self, part: &MeshPartition, alpha: f64, x: &[f64]) {
        let global = self.global_mut();
        for node in part.owned_nodes() {
            global[node] += alpha * x[node];
        }
    }

    /// Scatter owned values to ghosts and refresh the local snapshot.
    pub fn refresh<C>(&mut self, part: &MeshPartition, comm: &C) -> Result<(), SurfaceError>
    where
        C: Communicator + ?Sized,
    {
        exchange_ghosts(part, comm, &mut self.global)?;
        self.local.copy_from_slice(&self.global);
        self.stale = false;
        Ok(())
    }
}
