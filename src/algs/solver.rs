//! Distributed preconditioned Richardson iteration.
//!
//! `x_{k+1} = x_k + M⁻¹ (b − A x_k)` with `M` a rank-local preconditioner.
//! Each iteration exchanges the ghosts of `x` and reduces one residual norm,
//! so every rank runs the same number of iterations and always agrees on
//! the outcome. A preconditioner breakdown on one rank fails the solve on
//! all of them.

use serde::{Deserialize, Serialize};

use crate::algs::collective::agree;
use crate::algs::communicator::Communicator;
use crate::algs::ghost::exchange_ghosts;
use crate::algs::preconditioner::{PreconditionerKind, build_preconditioner};
use crate::data::csr::DistributedMatrix;
use crate::debug_invariants::expect_len;
use crate::surface_error::SurfaceError;
use crate::topology::partition::MeshPartition;

/// Why the iteration stopped. Codes follow the usual KSP numbering.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ConvergedReason {
    ConvergedRtol,
    ConvergedAtol,
    DivergedIts,
    DivergedDtol,
    DivergedBreakdown,
    DivergedNanOrInf,
}

impl ConvergedReason {
    pub fn code(self) -> i32 {
        match self {
            ConvergedReason::ConvergedRtol => 2,
            ConvergedReason::ConvergedAtol => 3,
            ConvergedReason::DivergedIts => -3,
            ConvergedReason::DivergedDtol => -4,
            ConvergedReason::DivergedBreakdown => -5,
            ConvergedReason::DivergedNanOrInf => -9,
        }
    }

    #[inline]
    pub fn is_diverged(self) -> bool {
        self.code() < 0
    }
}

/// Tolerances of the iterative solver.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Relative tolerance on the residual norm.
    pub rtol: f64,
    /// Absolute tolerance on the residual norm.
    pub atol: f64,
    /// Residual growth, relative to the initial residual, treated as divergence.
    pub dtol: f64,
    pub max_iterations: usize,
    pub preconditioner: PreconditionerKind,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            rtol: 1.0e-8,
            atol: 1.0e-50,
            dtol: 1.0e5,
            max_iterations: 10_000,
            preconditioner: PreconditionerKind::default(),
        }
    }
}

/// Outcome of a converged solve.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SolveStats {
    pub iterations: usize,
    pub residual_norm: f64,
    pub reason: ConvergedReason,
}

/// Richardson solver over a [`DistributedMatrix`].
#[derive(Clone, Debug, Default)]
pub struct RichardsonSolver {
    config: SolverConfig,
}

impl RichardsonSolver {
    pub fn new(config: SolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Solve `A x = b` in place. Collective.
    ///
    /// With `nonzero_guess == false` the iteration starts from zero. On
    /// success `x` is ghost-complete. A diverged solve is logged and returned
    /// as [`SurfaceError::SolverDiverged`]; `x` then holds the last iterate.
    pub fn solve<C>(
        &self,
        part: &MeshPartition,
        comm: &C,
        a: &DistributedMatrix,
        b: &[f64],
        x: &mut [f64],
        nonzero_guess: bool,
    ) -> Result<SolveStats, SurfaceError>
    where
        C: Communicator + ?Sized,
    {
        let n = part.npoints();
        let cfg = &self.config;
        let setup = expect_len("solver matrix", n, a.n())
            .and_then(|_| expect_len("solver rhs", n, b.len()))
            .and_then(|_| expect_len("solver solution", n, x.len()))
            .and_then(|_| build_preconditioner(cfg.preconditioner, part, a));
        let pc = match agree(comm, setup) {
            Ok(pc) => pc,
            Err(SurfaceError::PeerFailed { rank }) => {
                log::warn!("solver setup failed on rank {rank}");
                return Err(diverged(ConvergedReason::DivergedBreakdown, 0, f64::NAN));
            }
            Err(e) => return Err(e),
        };

        let b_norm = owned_norm(part, comm, b);
        if !b_norm.is_finite() {
            return Err(diverged(ConvergedReason::DivergedNanOrInf, 0, b_norm));
        }
        if b_norm == 0.0 {
            x.fill(0.0);
            return Ok(SolveStats {
                iterations: 0,
                residual_norm: 0.0,
                reason: ConvergedReason::ConvergedAtol,
            });
        }
        if !nonzero_guess {
            x.fill(0.0);
        }

        let rtol_target = cfg.rtol * b_norm;
        let target = rtol_target.max(cfg.atol);
        let mut r = vec![0.0; n];
        let mut z = vec![0.0; n];
        let mut r0_norm = None;

        for it in 0..=cfg.max_iterations {
            exchange_ghosts(part, comm, x)?;
            a.mul_vec(x, &mut r)?;
            for i in 0..n {
                r[i] = if part.is_owned(i) { b[i] - r[i] } else { 0.0 };
            }
            let r_norm = owned_norm(part, comm, &r);
            let r0 = *r0_norm.get_or_insert(r_norm);

            if !r_norm.is_finite() {
                return Err(diverged(ConvergedReason::DivergedNanOrInf, it, r_norm));
            }
            if r_norm <= target {
                let reason = if r_norm <= rtol_target {
                    ConvergedReason::ConvergedRtol
                } else {
                    ConvergedReason::ConvergedAtol
                };
                log::debug!(
                    "{} richardson converged in {it} iterations, residual {r_norm:e} ({reason:?})",
                    pc.name()
                );
                return Ok(SolveStats {
                    iterations: it,
                    residual_norm: r_norm,
                    reason,
                });
            }
            if r_norm > cfg.dtol * r0.max(b_norm) {
                return Err(diverged(ConvergedReason::DivergedDtol, it, r_norm));
            }
            if it == cfg.max_iterations {
                break;
            }

            pc.apply(&r, &mut z);
            for i in part.owned_nodes() {
                x[i] += z[i];
            }
        }
        Err(diverged(
            ConvergedReason::DivergedIts,
            cfg.max_iterations,
            f64::NAN,
        ))
    }
}

fn owned_norm<C: Communicator + ?Sized>(part: &MeshPartition, comm: &C, v: &[f64]) -> f64 {
    let local: f64 = part.owned_nodes().map(|i| v[i] * v[i]).sum();
    comm.sum_f64(local).sqrt()
}

fn diverged(reason: ConvergedReason, iterations: usize, residual: f64) -> SurfaceError {
    log::error!(
        "linear solver diverged after {iterations} iterations: {reason:?} ({}), residual {residual:e}",
        reason.code()
    );
    SurfaceError::SolverDiverged {
        reason,
        code: reason.code(),
        iterations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::topology::meshgen::StructuredMesh;

    fn diffusion(n: usize) -> (MeshPartition, DistributedMatrix) {
        let part = StructuredMesh::line(n, 1.0).unwrap().serial().unwrap();
        let mut row_ptr = vec![0];
        let mut cols = Vec::new();
        let mut vals = Vec::new();
        for i in 0..n {
            if i > 0 {
                cols.push(i - 1);
                vals.push(-1.0);
            }
            cols.push(i);
            vals.push(3.0);
            if i + 1 < n {
                cols.push(i + 1);
                vals.push(-1.0);
            }
            row_ptr.push(cols.len());
        }
        (part, DistributedMatrix::from_raw(n, row_ptr, cols, vals).unwrap())
    }

    #[test]
    fn jacobi_richardson_converges_on_diagonally_dominant_system() {
        let (part, a) = diffusion(6);
        let solver = RichardsonSolver::new(SolverConfig {
            preconditioner: PreconditionerKind::Jacobi,
            ..SolverConfig::default()
        });
        let b = vec![1.0; 6];
        let mut x = vec![0.0; 6];
        let stats = solver.solve(&part, &NoComm, &a, &b, &mut x, false).unwrap();
        assert_eq!(stats.reason, ConvergedReason::ConvergedRtol);
        assert!(stats.iterations > 1);
        let mut ax = vec![0.0; 6];
        a.mul_vec(&x, &mut ax).unwrap();
        for v in ax {
            assert!((v - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn zero_rhs_returns_zero_solution() {
        let (part, a) = diffusion(3);
        let mut x = vec![5.0; 3];
        let stats = RichardsonSolver::default()
            .solve(&part, &NoComm, &a, &[0.0; 3], &mut x, true)
            .unwrap();
        assert_eq!(x, vec![0.0; 3]);
        assert_eq!(stats.reason.code(), 3);
    }

    #[test]
    fn iteration_cap_is_reported_as_divergence() {
        let (part, a) = diffusion(8);
        let solver = RichardsonSolver::new(SolverConfig {
            max_iterations: 1,
            preconditioner: PreconditionerKind::Jacobi,
            ..SolverConfig::default()
        });
        let mut x = vec![0.0; 8];
        let err = solver
            .solve(&part, &NoComm, &a, &[1.0; 8], &mut x, false)
            .unwrap_err();
        assert_eq!(
            err,
            SurfaceError::SolverDiverged {
                reason: ConvergedReason::DivergedIts,
                code: -3,
                iterations: 1,
            }
        );
    }

    #[test]
    fn nan_rhs_is_detected() {
        let (part, a) = diffusion(2);
        let mut x = vec![0.0; 2];
        let err = RichardsonSolver::default()
            .solve(&part, &NoComm, &a, &[f64::NAN, 1.0], &mut x, false)
            .unwrap_err();
        assert!(matches!(
            err,
            SurfaceError::SolverDiverged {
                reason: ConvergedReason::DivergedNanOrInf,
                code: -9,
                ..
            }
        ));
    }

    #[test]
    fn codes_follow_ksp_numbering() {
        assert_eq!(ConvergedReason::ConvergedRtol.code(), 2);
        assert_eq!(ConvergedReason::DivergedDtol.code(), -4);
        assert!(ConvergedReason::DivergedBreakdown.is_diverged());
        assert!(!ConvergedReason::ConvergedAtol.is_diverged());
    }
}
