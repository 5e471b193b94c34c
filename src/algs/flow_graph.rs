//! Multiple-flow-direction graph construction over the filled surface.
//!
//! [`FlowGraphBuilder::build`] produces a [`FlowGraph`]: an immutable value
//! valid for one timestep, threaded explicitly through the phases that need
//! it and dropped afterwards.

use crate::algs::collective::agree;
use crate::algs::communicator::Communicator;
use crate::algs::ghost::global_view;
use crate::algs::kernels::SurfaceKernels;
use crate::debug_invariants::{DebugInvariants, expect_len};
use crate::surface_error::SurfaceError;
use crate::topology::partition::MeshPartition;

/// Depth below sea level under which the filling kernel leaves nodes untouched.
pub const FILL_FLOOR_DEPTH: f64 = 500.0;

/// Per-node receivers with slope, distance and flow-partition weight.
///
/// Slots are `flow_dir` per node, row-major. A self-routing slot has
/// `receiver == node`, distance 0 and weight 0.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceiverGraph {
    flow_dir: usize,
    receivers: Vec<usize>,
    slopes: Vec<f64>,
    distances: Vec<f64>,
    weights: Vec<f64>,
}

impl ReceiverGraph {
    /// Wrap kernel output, checking array shapes.
    pub fn new(
        flow_dir: usize,
        npoints: usize,
        receivers: Vec<usize>,
        slopes: Vec<f64>,
        distances: Vec<f64>,
        weights: Vec<f64>,
    ) -> Result<Self, SurfaceError> {
        let expected = npoints * flow_dir;
        for got in [receivers.len(), slopes.len(), distances.len(), weights.len()] {
            if got != expected {
                return Err(SurfaceError::KernelShape {
                    kernel: "mfd_receivers",
                    expected,
                    got,
                });
            }
        }
        let graph = Self {
            flow_dir,
            receivers,
            slopes,
            distances,
            weights,
        };
        graph.validate_invariants()?;
        Ok(graph)
    }

    #[inline]
    pub fn flow_dir(&self) -> usize {
        self.flow_dir
    }

    #[inline]
    pub fn npoints(&self) -> usize {
        self.receivers.len().checked_div(self.flow_dir).unwrap_or(0)
    }

    #[inline]
    pub fn receiver(&self, node: usize, k: usize) -> usize {
        self.receivers[node * self.flow_dir + k]
    }

    #[inline]
    pub fn slope(&self, node: usize, k: usize) -> f64 {
        self.slopes[node * self.flow_dir + k]
    }

    #[inline]
    pub fn distance(&self, node: usize, k: usize) -> f64 {
        self.distances[node * self.flow_dir + k]
    }

    #[inline]
    pub fn weight(&self, node: usize, k: usize) -> f64 {
        self.weights[node * self.flow_dir + k]
    }

    /// All weights, `npoints * flow_dir` row-major.
    #[inline]
    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Sum of outflow weights of `node`.
    pub fn weight_sum(&self, node: usize) -> f64 {
        self.weights[node * self.flow_dir..(node + 1) * self.flow_dir]
            .iter()
            .sum()
    }

    /// True when every slot of `node` routes to itself.
    pub fn is_self_routed(&self, node: usize) -> bool {
        (0..self.flow_dir).all(|k| self.receiver(node, k) == node)
    }

    fn force_self_route(&mut self, node: usize) {
        for k in 0..self.flow_dir {
            let slot = node * self.flow_dir + k;
            self.receivers[slot] = node;
            self.distances[slot] = 0.0;
            self.weights[slot] = 0.0;
        }
    }
}

impl DebugInvariants for ReceiverGraph {
    fn validate_invariants(&self) -> Result<(), SurfaceError> {
        let n = self.npoints();
        for node in 0..n {
            for k in 0..self.flow_dir {
                let rcv = self.receiver(node, k);
                if rcv >= n {
                    return Err(SurfaceError::InvalidPartition(format!(
                        "node {node} slot {k} routes to local {rcv} >= npoints {n}"
                    )));
                }
                let w = self.weight(node, k);
                if !(0.0..=1.0 + 1e-12).contains(&w) {
                    return Err(SurfaceError::InvalidPartition(format!(
                        "node {node} slot {k} has weight {w} outside [0, 1]"
                    )));
                }
            }
            if self.weight_sum(node) > 1.0 + 1e-9 {
                return Err(SurfaceError::InvalidPartition(format!(
                    "node {node} weights sum to {} > 1",
                    self.weight_sum(node)
                )));
            }
        }
        Ok(())
    }
}

/// Flow topology of one timestep.
#[derive(Clone, Debug)]
pub struct FlowGraph {
    pub receivers: ReceiverGraph,
    /// Filled elevation at or below sea level.
    pub sea: Vec<bool>,
    /// Filled elevation above raw elevation (internally drained).
    pub pit: Vec<bool>,
    /// Filled elevation, with raw values restored wherever the filled value
    /// lies below sea level.
    pub filled: Vec<f64>,
}

impl FlowGraph {
    /// Sea or pit: nodes excluded from erosion.
    #[inline]
    pub fn is_sink(&self, node: usize) -> bool {
        self.sea[node] || self.pit[node]
    }
}

/// Builds the per-step [`FlowGraph`] from a ghost-complete elevation field.
pub struct FlowGraphBuilder<'k, K: ?Sized> {
    kernels: &'k K,
    flow_dir: usize,
}

impl<'k, K> FlowGraphBuilder<'k, K>
where
    K: SurfaceKernels + ?Sized,
{
    pub fn new(kernels: &'k K, flow_dir: usize) -> Self {
        Self { kernels, flow_dir }
    }

    /// Fill depressions of the complete global field.
    pub fn fill_depressions(
        &self,
        global_elevation: &[f64],
        floor: f64,
    ) -> Result<Vec<f64>, SurfaceError> {
        let filled = self.kernels.fill_depressions(floor, global_elevation);
        if filled.len() != global_elevation.len() {
            return Err(SurfaceError::KernelShape {
                kernel: "fill_depressions",
                expected: global_elevation.len(),
                got: filled.len(),
            });
        }
        Ok(filled)
    }

    /// MFD receivers over `elevation`; nodes at or below `sea_level` self-route.
    pub fn build_receivers(
        &self,
        part: &MeshPartition,
        elevation: &[f64],
        sea_level: f64,
    ) -> Result<ReceiverGraph, SurfaceError> {
        expect_len("receiver elevation", part.npoints(), elevation.len())?;
        let mfd = self
            .kernels
            .mfd_receivers(self.flow_dir, part.interior_mask(), elevation);
        let mut graph = ReceiverGraph::new(
            self.flow_dir,
            part.npoints(),
            mfd.receivers,
            mfd.slopes,
            mfd.distances,
            mfd.weights,
        )?;
        for (node, &z) in elevation.iter().enumerate() {
            if z <= sea_level {
                graph.force_self_route(node);
            }
        }
        Ok(graph)
    }

    /// Collective: global view → fill → receivers → sea/pit classification.
    ///
    /// A malformed input or kernel result on any rank fails the build on
    /// every rank.
    pub fn build<C>(
        &self,
        part: &MeshPartition,
        comm: &C,
        elevation: &[f64],
        sea_level: f64,
    ) -> Result<FlowGraph, SurfaceError>
    where
        C: Communicator + ?Sized,
    {
        agree(
            comm,
            expect_len("flow graph elevation", part.npoints(), elevation.len()),
        )?;
        let global = global_view(part, comm, elevation)?;
        agree(comm, self.classify(part, &global, elevation, sea_level))
    }

    fn classify(
        &self,
        part: &MeshPartition,
        global: &[f64],
        elevation: &[f64],
        sea_level: f64,
    ) -> Result<FlowGraph, SurfaceError> {
        let filled_global = self.fill_depressions(global, sea_level - FILL_FLOOR_DEPTH)?;

        let l2g = part.local_to_global();
        let mut filled: Vec<f64> = l2g.iter().map(|&g| filled_global[g]).collect();
        let receivers = self.build_receivers(part, &filled, sea_level)?;
        let sea: Vec<bool> = filled.iter().map(|&z| z <= sea_level).collect();

        for (node, z) in filled.iter_mut().enumerate() {
            if *z < sea_level {
                *z = global[l2g[node]];
            }
        }
        let pit = filled
            .iter()
            .zip(elevation)
            .map(|(&f, &h)| f > h)
            .collect();

        Ok(FlowGraph {
            receivers,
            sea,
            pit,
            filled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::algs::kernels::ReferenceKernels;
    use crate::topology::meshgen::StructuredMesh;

    #[test]
    fn pit_routes_over_filled_surface() {
        let mesh = StructuredMesh::line(5, 1.0).unwrap();
        let part = mesh.serial().unwrap();
        let kernels = ReferenceKernels::new(mesh.global_topology().unwrap(), &part);
        let builder = FlowGraphBuilder::new(&kernels, 2);
        let h = [5.0, 4.0, 1.0, 3.0, -1.0];
        let flow = builder.build(&part, &NoComm, &h, 0.0).unwrap();

        assert_eq!(flow.pit, vec![false, false, true, false, false]);
        assert_eq!(flow.sea, vec![false, false, false, false, true]);
        assert_eq!(flow.receivers.receiver(2, 0), 3, "pit drains over its spill");
        assert!(flow.receivers.is_self_routed(4));
        assert_eq!(flow.receivers.weight_sum(4), 0.0);
    }

    #[test]
    fn below_sea_fill_is_reverted() {
        let mesh = StructuredMesh::line(3, 1.0).unwrap();
        let part = mesh.serial().unwrap();
        let kernels = ReferenceKernels::new(mesh.global_topology().unwrap(), &part);
        let builder = FlowGraphBuilder::new(&kernels, 1);
        // node 1 is a submarine pit behind a submarine sill
        let h = [-50.0, -80.0, -60.0];
        let flow = builder.build(&part, &NoComm, &h, 0.0).unwrap();
        assert_eq!(flow.filled[1], -80.0);
        assert!(!flow.pit[1]);
        assert!(flow.sea.iter().all(|&s| s));
    }

    #[test]
    fn kernel_shape_mismatch_is_reported() {
        let err = ReceiverGraph::new(2, 3, vec![0; 5], vec![0.0; 6], vec![0.0; 6], vec![0.0; 6])
            .unwrap_err();
        assert!(matches!(err, SurfaceError::KernelShape { expected: 6, got: 5, .. }));
    }

    /// Receivers kernel that drops one slot on a chosen rank.
    struct ShortOnRank {
        inner: ReferenceKernels,
        rank: usize,
        me: usize,
    }

    impl SurfaceKernels for ShortOnRank {
        fn fill_depressions(&self, floor: f64, global_elevation: &[f64]) -> Vec<f64> {
            self.inner.fill_depressions(floor, global_elevation)
        }

        fn mfd_receivers(
            &self,
            flow_dir: usize,
            interior: &[bool],
            elevation: &[f64],
        ) -> crate::algs::kernels::MfdReceivers {
            let mut out = self.inner.mfd_receivers(flow_dir, interior, elevation);
            if self.me == self.rank {
                out.receivers.pop();
            }
            out
        }

        fn hillslope_coefficients(
            &self,
            npoints: usize,
            cd_dt: f64,
        ) -> crate::algs::kernels::HillslopeCoefficients {
            self.inner.hillslope_coefficients(npoints, cd_dt)
        }
    }

    #[test]
    fn kernel_failure_on_one_rank_fails_every_rank() {
        use crate::algs::communicator::RayonComm;

        let mesh = StructuredMesh::line(6, 1.0).unwrap();
        let parts = mesh.partition(2).unwrap();
        let comms = RayonComm::group(2);
        let outcomes: Vec<Result<(), SurfaceError>> = std::thread::scope(|s| {
            let handles: Vec<_> = parts
                .iter()
                .zip(&comms)
                .map(|(part, comm)| {
                    let mesh = &mesh;
                    s.spawn(move || {
                        let kernels = ShortOnRank {
                            inner: ReferenceKernels::new(mesh.global_topology().unwrap(), part),
                            rank: 1,
                            me: comm.rank(),
                        };
                        let h: Vec<f64> =
                            part.local_to_global().iter().map(|&g| 10.0 - g as f64).collect();
                        let out = FlowGraphBuilder::new(&kernels, 1)
                            .build(part, comm, &h, -1.0)
                            .map(|_| ());
                        comm.barrier();
                        out
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(outcomes[0], Err(SurfaceError::PeerFailed { rank: 1 }));
        assert!(matches!(outcomes[1], Err(SurfaceError::KernelShape { .. })));
    }
}
