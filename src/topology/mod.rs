//! Mesh partitions as handed over by the mesh provider, plus structured
//! generators for tests and demos.

pub mod meshgen;
pub mod partition;

pub use meshgen::StructuredMesh;
pub use partition::{GlobalTopology, MeshPartition, NeighbourLink, PartitionData};
