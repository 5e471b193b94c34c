#![cfg_attr(docsrs, feature(doc_cfg))]
//! # landscape-sieve
//!
//! landscape-sieve advances the surface processes of a landscape-evolution
//! model by one timestep on a partitioned unstructured surface mesh: MFD flow
//! routing over a depression-filled surface, stream-power bedrock erosion,
//! sediment transport and deposition, and implicit hillslope diffusion. Each
//! process is a sparse linear system solved by a distributed preconditioned
//! Richardson iteration.
//!
//! ## Features
//! - Row-distributed CSR matrices with arena-backed assembly
//! - Pluggable communication backends (serial, in-process thread ranks, MPI)
//! - Numerical kernels behind the [`algs::kernels::SurfaceKernels`] trait, with
//!   a reference implementation
//! - Structured line and grid meshes with row-block partitions for tests and demos
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! landscape-sieve = "0.3"
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! Every rank builds a [`physics::surface::SurfaceProcessEngine`] from its
//! [`topology::partition::MeshPartition`] and calls `step()` in lockstep with
//! the others.

pub mod algs;
pub mod data;
pub mod debug_invariants;
pub mod physics;
pub mod surface_error;
pub mod topology;

pub use debug_invariants::DebugInvariants;
pub use surface_error::SurfaceError;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::assembly::SparseSystemAssembler;
    pub use crate::algs::communicator::{Communicator, NoComm, RayonComm, ReduceOp};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::algs::flow_graph::{FlowGraph, FlowGraphBuilder, ReceiverGraph};
    pub use crate::algs::ghost::{exchange_ghosts, global_view};
    pub use crate::algs::kernels::{ReferenceKernels, SurfaceKernels};
    pub use crate::algs::solver::{ConvergedReason, RichardsonSolver, SolveStats, SolverConfig};
    pub use crate::data::csr::DistributedMatrix;
    pub use crate::data::field::GhostedField;
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::physics::config::{SurfaceConfig, ValidatedConfig};
    pub use crate::physics::surface::{Phase, StepReport, SurfaceProcessEngine};
    pub use crate::surface_error::SurfaceError;
    pub use crate::topology::meshgen::StructuredMesh;
    pub use crate::topology::partition::{GlobalTopology, MeshPartition, NeighbourLink, PartitionData};
}
