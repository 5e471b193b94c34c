//! Row-distributed compressed sparse row matrix.
//!
//! A [`DistributedMatrix`] has one row per local node and local column
//! indices. Rows of nodes this rank does not own are empty: every matrix row
//! lives on exactly one rank. Columns may reference ghost nodes, so the
//! operand of [`DistributedMatrix::mul_vec`] must be ghost-complete.
//!
//! Columns within a row are sorted and unique.

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use crate::debug_invariants::{DebugInvariants, expect_len};
use crate::surface_error::SurfaceError;

#[derive(Clone, Debug, PartialEq)]
pub struct DistributedMatrix {
    n: usize,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
    values: Vec<f64>,
}

impl DistributedMatrix {
    /// Build from raw CSR arrays.
    pub fn from_raw(
        n: usize,
        row_ptr: Vec<usize>,
        col_idx: Vec<usize>,
        values: Vec<f64>,
    ) -> Result<Self, SurfaceError> {
        let m = Self {
            n,
            row_ptr,
            col_idx,
            values,
        };
        m.validate_invariants()?;
        Ok(m)
    }

    /// Build from raw CSR arrays already known to be well formed.
    pub(crate) fn from_parts_unchecked(
        n: usize,
        row_ptr: Vec<usize>,
        col_idx: Vec<usize>,
        values: Vec<f64>,
    ) -> Self {
        let m = Self {
            n,
            row_ptr,
            col_idx,
            values,
        };
        m.debug_assert_invariants();
        m
    }

    /// Give the buffers back, e.g. to an assembly arena.
    pub(crate) fn into_parts(self) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
        (self.row_ptr, self.col_idx, self.values)
    }

    /// Number of rows (= columns = local nodes).
    #[inline]
    pub fn n(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn nnz(&self) -> usize {
        self.col_idx.len()
    }

    #[inline]
    pub fn row_ptr(&self) -> &[usize] {
        &self.row_ptr
    }

    #[inline]
    pub fn col_idx(&self) -> &[usize] {
        &self.col_idx
    }

    #[inline]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Columns and values of `row`.
    #[inline]
    pub fn row(&self, row: usize) -> (&[usize], &[f64]) {
        let range = self.row_ptr[row]..self.row_ptr[row + 1];
        (&self.col_idx[range.clone()], &self.values[range])
    }

    /// Entry `(row, col)`, zero when outside the pattern.
    pub fn get(&self, row: usize, col: usize) -> f64 {
        let (cols, vals) = self.row(row);
        cols.binary_search(&col).map(|k| vals[k]).unwrap_or(0.0)
    }

    /// Diagonal entries (zero for empty rows).
    pub fn diagonal(&self) -> Vec<f64> {
        (0..self.n).map(|i| self.get(i, i)).collect()
    }

    /// `y = A x` over local rows; `x` must be ghost-complete.
    pub fn mul_vec(&self, x: &[f64], y: &mut [f64]) -> Result<(), SurfaceError> {
        expect_len("matrix-vector operand", self.n, x.len())?;
        expect_len("matrix-vector result", self.n, y.len())?;
        let row = |i: usize| -> f64 {
            let (cols, vals) = self.row(i);
            cols.iter().zip(vals).map(|(&j, &a)| a * x[j]).sum()
        };
        #[cfg(feature = "rayon")]
        y.par_iter_mut().enumerate().for_each(|(i, yi)| *yi = row(i));
        #[cfg(not(feature = "rayon"))]
        y.iter_mut().enumerate().for_each(|(i, yi)| *yi = row(i));
        Ok(())
    }
}

impl DebugInvariants for DistributedMatrix {
    fn validate_invariants(&self) -> Result<(), SurfaceError> {
        expect_len("csr row pointer", self.n + 1, self.row_ptr.len())?;
        expect_len("csr values", self.col_idx.len(), self.values.len())?;
        if self.row_ptr[0] != 0 || self.row_ptr[self.n] != self.col_idx.len() {
            return Err(SurfaceError::InvalidMatrix(
                "csr row pointer does not span the column array".into(),
            ));
        }
        if let Some(i) = self.row_ptr.windows(2).position(|w| w[0] > w[1]) {
            return Err(SurfaceError::InvalidMatrix(format!(
                "csr row pointer decreases at row {i}"
            )));
        }
        for i in 0..self.n {
            let (cols, _) = self.row(i);
            if cols.windows(2).any(|w| w[0] >= w[1]) {
                return Err(SurfaceError::InvalidMatrix(format!(
                    "csr row {i} has unsorted or duplicate columns"
                )));
            }
            if cols.last().is_some_and(|&c| c >= self.n) {
                return Err(SurfaceError::InvalidMatrix(format!(
                    "csr row {i} references a column outside 0..{}",
                    self.n
                )));
            }
        }
        Ok(())
    }
}
