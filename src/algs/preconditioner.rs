//! Rank-local preconditioners for the distributed Richardson iteration.
//!
//! Both variants only see the owned × owned block of the matrix: couplings
//! to ghost columns are left to the outer iteration.

use serde::{Deserialize, Serialize};

use crate::algs::solver::ConvergedReason;
use crate::data::csr::DistributedMatrix;
use crate::debug_invariants::expect_len;
use crate::surface_error::SurfaceError;
use crate::topology::partition::MeshPartition;

/// Approximate inverse `z ≈ A⁻¹ r`.
pub trait Preconditioner {
    /// Apply to an owned-row residual; ghost entries of `z` are set to zero.
    fn apply(&self, r: &[f64], z: &mut [f64]);

    fn name(&self) -> &'static str;
}

/// Preconditioner selection in the solver configuration.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreconditionerKind {
    /// Block Jacobi with ILU(0) on each rank's block.
    #[default]
    #[serde(alias = "bjacobi")]
    Ilu0,
    /// Point Jacobi.
    Jacobi,
}

fn breakdown(row: usize) -> SurfaceError {
    log::error!("zero pivot in preconditioner at local row {row}");
    SurfaceError::SolverDiverged {
        reason: ConvergedReason::DivergedBreakdown,
        code: ConvergedReason::DivergedBreakdown.code(),
        iterations: 0,
    }
}

/// Point Jacobi: `z = r / diag(A)` on owned rows.
#[derive(Clone, Debug)]
pub struct JacobiPreconditioner {
    inv_diag: Vec<f64>,
}

impl JacobiPreconditioner {
    pub fn new(part: &MeshPartition, a: &DistributedMatrix) -> Result<Self, SurfaceError> {
        expect_len("jacobi operand", part.npoints(), a.n())?;
        let mut inv_diag = vec![0.0; a.n()];
        for i in part.owned_nodes() {
            let d = a.get(i, i);
            if d == 0.0 || !d.is_finite() {
                return Err(breakdown(i));
            }
            inv_diag[i] = 1.0 / d;
        }
        Ok(Self { inv_diag })
    }
}

impl Preconditioner for JacobiPreconditioner {
    fn apply(&self, r: &[f64], z: &mut [f64]) {
        for ((zi, &ri), &d) in z.iter_mut().zip(r).zip(&self.inv_diag) {
            *zi = ri * d;
        }
    }

    fn name(&self) -> &'static str {
        "jacobi"
    }
}

/// Block Jacobi over ranks with an ILU(0) factorisation of the local block.
///
/// L (unit lower) and U share the storage of the owned block, column
/// pattern unchanged.
#[derive(Clone, Debug)]
pub struct BlockJacobiIlu0 {
    owned: Vec<usize>,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    lu: Vec<f64>,
    diag_ptr: Vec<usize>,
}

impl BlockJacobiIlu0 {
    pub fn new(part: &MeshPartition, a: &DistributedMatrix) -> Result<Self, SurfaceError> {
        let n = part.npoints();
        expect_len("ilu operand", n, a.n())?;
        let owned: Vec<usize> = part.owned_nodes().collect();

        let mut row_ptr = vec![0usize; n + 1];
        let mut col_idx = Vec::with_capacity(a.nnz());
        let mut lu = Vec::with_capacity(a.nnz());
        let mut diag_ptr = vec![usize::MAX; n];
        for i in 0..n {
            if part.is_owned(i) {
                let (cols, vals) = a.row(i);
                for (&j, &v) in cols.iter().zip(vals) {
                    if part.is_owned(j) {
                        if j == i {
                            diag_ptr[i] = col_idx.len();
                        }
                        col_idx.push(j);
                        lu.push(v);
                    }
                }
            }
            row_ptr[i + 1] = col_idx.len();
        }

        let mut pc = Self {
            owned,
            row_ptr,
            col_idx,
            lu,
            diag_ptr,
        };
        pc.factorize()?;
        Ok(pc)
    }

    fn factorize(&mut self) -> Result<(), SurfaceError> {
        for &i in &self.owned {
            let (start, end) = (self.row_ptr[i], self.row_ptr[i + 1]);
            for kk in start..end {
                let k = self.col_idx[kk];
                if k >= i {
                    break;
                }
                let pivot = self.pivot(k)?;
                self.lu[kk] /= pivot;
                let lik = self.lu[kk];
                // row k upper part against row i's remaining pattern
                let (kstart, kend) = (self.diag_ptr[k] + 1, self.row_ptr[k + 1]);
                let mut p = kk + 1;
                for q in kstart..kend {
                    let j = self.col_idx[q];
                    while p < end && self.col_idx[p] < j {
                        p += 1;
                    }
                    if p == end {
                        break;
                    }
                    if self.col_idx[p] == j {
                        self.lu[p] -= lik * self.lu[q];
                    }
                }
            }
            self.pivot(i)?;
        }
        Ok(())
    }

    fn pivot(&self, row: usize) -> Result<f64, SurfaceError> {
        let d = self.diag_ptr[row];
        if d == usize::MAX || self.lu[d] == 0.0 || !self.lu[d].is_finite() {
            return Err(breakdown(row));
        }
        Ok(self.lu[d])
    }
}

impl Preconditioner for BlockJacobiIlu0 {
    fn apply(&self, r: &[f64], z: &mut [f64]) {
        z.fill(0.0);
        // L y = r, y stored in z
        for &i in &self.owned {
            let mut s = r[i];
            for kk in self.row_ptr[i]..self.diag_ptr[i] {
                s -= self.lu[kk] * z[self.col_idx[kk]];
            }
            z[i] = s;
        }
        // U z = y
        for &i in self.owned.iter().rev() {
            let d = self.diag_ptr[i];
            let mut s = z[i];
            for kk in d + 1..self.row_ptr[i + 1] {
                s -= self.lu[kk] * z[self.col_idx[kk]];
            }
            z[i] = s / self.lu[d];
        }
    }

    fn name(&self) -> &'static str {
        "bjacobi-ilu0"
    }
}

/// Build the configured preconditioner for `a`.
pub fn build_preconditioner(
    kind: PreconditionerKind,
    part: &MeshPartition,
    a: &DistributedMatrix,
) -> Result<Box<dyn Preconditioner>, SurfaceError> {
    Ok(match kind {
        PreconditionerKind::Ilu0 => Box::new(BlockJacobiIlu0::new(part, a)?),
        PreconditionerKind::Jacobi => Box::new(JacobiPreconditioner::new(part, a)?),
    })
}
