//! Communication, assembly and solver algorithms.

pub mod assembly;
pub mod collective;
pub mod communicator;
pub mod flow_graph;
pub mod ghost;
pub mod kernels;
pub mod preconditioner;
pub mod solver;
pub mod wire;

pub use communicator::Communicator;
pub use ghost::{exchange_ghosts, global_view};
