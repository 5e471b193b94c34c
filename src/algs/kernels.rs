//! Numerical kernels consumed by the surface-process core.
//!
//! Pit filling, MFD receiver selection and hillslope coefficients are pure
//! functions behind [`SurfaceKernels`]. Production runs plug in compiled
//! kernels; [`ReferenceKernels`] is a straightforward implementation over a
//! [`MeshPartition`] and its [`GlobalTopology`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::topology::partition::{GlobalTopology, MeshPartition};

/// Increment applied across filled flats so every filled node keeps a
/// strictly downslope path to its spill point.
pub const FILL_EPSILON: f64 = 1.0e-6;

/// Per-node MFD receivers, `npoints * flow_dir` row-major arrays.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MfdReceivers {
    pub receivers: Vec<usize>,
    pub slopes: Vec<f64>,
    pub distances: Vec<f64>,
    pub weights: Vec<f64>,
}

/// Implicit hillslope diffusion coefficients.
///
/// `diagonal[i]` is the diagonal entry of row `i`; `neighbours[i * max_neighbours + k]`
/// is the coefficient for neighbour slot `k` of the partition's neighbour table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HillslopeCoefficients {
    pub diagonal: Vec<f64>,
    pub neighbours: Vec<f64>,
    pub max_neighbours: usize,
}

/// Kernel seam between the solver core and the numerical routines.
pub trait SurfaceKernels {
    /// Fill depressions of the complete global elevation; entries at or
    /// below `floor` are never raised. Returns `global_elevation.len()` values.
    fn fill_depressions(&self, floor: f64, global_elevation: &[f64]) -> Vec<f64>;

    /// Up to `flow_dir` downslope receivers per local node. Nodes outside
    /// `interior` and nodes without a downslope neighbour route to themselves.
    fn mfd_receivers(&self, flow_dir: usize, interior: &[bool], elevation: &[f64])
    -> MfdReceivers;

    /// Coefficients of the implicit diffusion operator for `cd_dt = Cd * dt`.
    fn hillslope_coefficients(&self, npoints: usize, cd_dt: f64) -> HillslopeCoefficients;
}

/// Reference kernels: priority-flood filling with an epsilon gradient,
/// slope-proportional MFD and two-point finite-volume diffusion.
#[derive(Clone, Debug)]
pub struct ReferenceKernels {
    global: GlobalTopology,
    local: MeshPartition,
}

impl ReferenceKernels {
    pub fn new(global: GlobalTopology, local: &MeshPartition) -> Self {
        Self {
            global,
            local: local.clone(),
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct FloodCell {
    z: f64,
    node: usize,
}

impl PartialEq for FloodCell {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FloodCell {}

impl PartialOrd for FloodCell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FloodCell {
    // Min-heap on elevation, ties broken by node id for determinism.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .z
            .total_cmp(&self.z)
            .then_with(|| other.node.cmp(&self.node))
    }
}

impl SurfaceKernels for ReferenceKernels {
    fn fill_depressions(&self, floor: f64, global_elevation: &[f64]) -> Vec<f64> {
        let n = global_elevation.len().min(self.global.len());
        let mut filled = global_elevation.to_vec();
        let mut closed = vec![false; n];
        let mut heap = BinaryHeap::new();

        for node in 0..n {
            if self.global.is_outlet(node) || global_elevation[node] <= floor {
                closed[node] = true;
                heap.push(FloodCell {
                    z: filled[node],
                    node,
                });
            }
        }
        if heap.is_empty() {
            if let Some(node) = (0..n).min_by(|&a, &b| filled[a].total_cmp(&filled[b])) {
                closed[node] = true;
                heap.push(FloodCell {
                    z: filled[node],
                    node,
                });
            }
        }

        while let Some(FloodCell { z, node }) = heap.pop() {
            for &nb in self.global.neighbours(node) {
                if nb >= n || closed[nb] {
                    continue;
                }
                closed[nb] = true;
                if filled[nb] <= z {
                    filled[nb] = z + FILL_EPSILON;
                }
                heap.push(FloodCell { z: filled[nb], node: nb });
            }
        }
        filled
    }

    fn mfd_receivers(
        &self,
        flow_dir: usize,
        interior: &[bool],
        elevation: &[f64],
    ) -> MfdReceivers {
        let n = elevation.len();
        let mut out = MfdReceivers {
            receivers: Vec::with_capacity(n * flow_dir),
            slopes: Vec::with_capacity(n * flow_dir),
            distances: Vec::with_capacity(n * flow_dir),
            weights: Vec::with_capacity(n * flow_dir),
        };
        let mut candidates: Vec<(usize, f64, f64)> = Vec::with_capacity(self.local.max_degree());

        for node in 0..n {
            candidates.clear();
            if interior.get(node).copied().unwrap_or(false) && node < self.local.npoints() {
                candidates.extend(self.local.neighbours_of(node).filter_map(
                    |(_, nb, dist, _)| {
                        let dz = elevation[node] - elevation[nb];
                        (dz > 0.0 && dist > 0.0).then(|| (nb, dz / dist, dist))
                    },
                ));
                candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
                candidates.truncate(flow_dir);
            }
            let total: f64 = candidates.iter().map(|c| c.1).sum();
            for k in 0..flow_dir {
                match candidates.get(k) {
                    Some(&(nb, slope, dist)) => {
                        out.receivers.push(nb);
                        out.slopes.push(slope);
                        out.distances.push(dist);
                        out.weights.push(slope / total);
                    }
                    None => {
                        out.receivers.push(node);
                        out.slopes.push(0.0);
                        out.distances.push(0.0);
                        out.weights.push(0.0);
                    }
                }
            }
        }
        out
    }

    fn hillslope_coefficients(&self, npoints: usize, cd_dt: f64) -> HillslopeCoefficients {
        let max_nb = self.local.max_degree();
        let mut coeffs = HillslopeCoefficients {
            diagonal: vec![1.0; npoints],
            neighbours: vec![0.0; npoints * max_nb],
            max_neighbours: max_nb,
        };
        let areas = self.local.areas();
        for node in 0..npoints.min(self.local.npoints()) {
            for (k, _, dist, edge) in self.local.neighbours_of(node) {
                if dist > 0.0 && areas[node] > 0.0 {
                    let c = cd_dt * edge / (dist * areas[node]);
                    coeffs.diagonal[node] += c;
                    coeffs.neighbours[node * max_nb + k] = -c;
                }
            }
        }
        coeffs
    }
}
