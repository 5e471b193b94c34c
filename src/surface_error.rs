//! SurfaceError: unified error type for landscape-sieve public APIs
//!
//! Every fallible operation in the crate returns `Result<_, SurfaceError>`.
//! Configuration problems are reported before the first step; solver
//! divergence is fatal mid-run and carries the solver diagnostics.

use thiserror::Error;

use crate::algs::solver::ConvergedReason;

/// Unified error type for surface-process operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SurfaceError {
    /// A configuration key is missing or holds an inconsistent value.
    #[error("configuration error for `{key}`: {reason}")]
    Config { key: &'static str, reason: String },
    /// The mesh partition handed over by the topology provider is malformed.
    #[error("invalid mesh partition: {0}")]
    InvalidPartition(String),
    /// A sparse matrix violates the CSR structure.
    #[error("invalid matrix: {0}")]
    InvalidMatrix(String),
    /// An external kernel returned arrays of the wrong shape.
    #[error("kernel `{kernel}` returned {got} values, expected {expected}")]
    KernelShape {
        kernel: &'static str,
        expected: usize,
        got: usize,
    },
    /// Matrix and vector arguments of an operation disagree on their layout.
    #[error("layout mismatch in {context}: expected {expected} local entries, got {got}")]
    LayoutMismatch {
        context: &'static str,
        expected: usize,
        got: usize,
    },
    /// A global node id required locally is not present on this rank.
    #[error("global node {0} is not present on this rank")]
    MissingGlobalNode(usize),
    /// A collective exchange delivered malformed data.
    #[error("communication error with rank {neighbor}: {reason}")]
    CommError { neighbor: usize, reason: String },
    /// Another rank failed a step that every rank has to complete together.
    #[error("rank {rank} failed; the collective operation was abandoned")]
    PeerFailed { rank: usize },
    /// The iterative solver stopped with a negative convergence reason.
    #[error(
        "linear solver failed to converge after {iterations} iterations with reason {reason:?} ({code})"
    )]
    SolverDiverged {
        reason: ConvergedReason,
        code: i32,
        iterations: usize,
    },
}

impl SurfaceError {
    /// Shorthand for a configuration error on `key`.
    pub fn config(key: &'static str, reason: impl Into<String>) -> Self {
        SurfaceError::Config {
            key,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_names_key() {
        let err = SurfaceError::config("time.dt", "must be positive");
        let msg = err.to_string();
        assert!(msg.contains("time.dt"), "{msg}");
        assert!(msg.contains("must be positive"), "{msg}");
    }

    #[test]
    fn divergence_reports_code_and_iterations() {
        let err = SurfaceError::SolverDiverged {
            reason: ConvergedReason::DivergedIts,
            code: ConvergedReason::DivergedIts.code(),
            iterations: 10_000,
        };
        let msg = err.to_string();
        assert!(msg.contains("10000"), "{msg}");
        assert!(msg.contains("-3"), "{msg}");
    }
}
