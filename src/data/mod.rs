//! Distributed node fields and sparse matrices.

pub mod csr;
pub mod field;

pub use csr::DistributedMatrix;
pub use field::GhostedField;
