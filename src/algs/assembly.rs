//! Assembly of distributed sparse systems.
//!
//! Every builder emits one CSR row per owned local node; rows of ghost nodes
//! stay empty. Entries are collected as `(row, col, value)` triplets, stably
//! sorted, merged by summation and compressed. Owned rows always carry their
//! diagonal, even when it is zero; zero off-diagonal entries are dropped.
//!
//! Buffers of released matrices are pooled in an [`AssemblyArena`] so the
//! per-step matrices reuse their storage across timesteps.

use itertools::Itertools;

use crate::algs::collective::swap_records;
use crate::algs::communicator::Communicator;
use crate::algs::flow_graph::ReceiverGraph;
use crate::algs::kernels::HillslopeCoefficients;
use crate::algs::wire::WireEntry;
use crate::data::csr::DistributedMatrix;
use crate::debug_invariants::expect_len;
use crate::surface_error::SurfaceError;
use crate::topology::partition::MeshPartition;

type Triplet = (usize, usize, f64);

const TRANSPOSE_TAG: u16 = 0x5452;

/// Pool of CSR buffers handed back by [`SparseSystemAssembler::release`].
#[derive(Debug, Default)]
pub struct AssemblyArena {
    indices: Vec<Vec<usize>>,
    values: Vec<Vec<f64>>,
    triplets: Vec<Triplet>,
}

impl AssemblyArena {
    fn take_indices(&mut self) -> Vec<usize> {
        let mut v = self.indices.pop().unwrap_or_default();
        v.clear();
        v
    }

    fn take_values(&mut self) -> Vec<f64> {
        let mut v = self.values.pop().unwrap_or_default();
        v.clear();
        v
    }

    fn take_triplets(&mut self) -> Vec<Triplet> {
        let mut v = std::mem::take(&mut self.triplets);
        v.clear();
        v
    }

    fn put_triplets(&mut self, triplets: Vec<Triplet>) {
        if triplets.capacity() > self.triplets.capacity() {
            self.triplets = triplets;
        }
    }

    fn recycle(&mut self, m: DistributedMatrix) {
        let (row_ptr, col_idx, values) = m.into_parts();
        self.indices.push(row_ptr);
        self.indices.push(col_idx);
        self.values.push(values);
    }

    /// Number of pooled buffers.
    pub fn pooled(&self) -> usize {
        self.indices.len() + self.values.len()
    }
}

/// Builds the per-step matrices of the surface processes.
#[derive(Debug, Default)]
pub struct SparseSystemAssembler {
    arena: AssemblyArena,
}

impl SparseSystemAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arena(&self) -> &AssemblyArena {
        &self.arena
    }

    /// Return a matrix's buffers to the arena.
    pub fn release(&mut self, m: DistributedMatrix) {
        self.arena.recycle(m);
    }

    /// Identity over owned rows.
    pub fn build_identity(&mut self, part: &MeshPartition) -> DistributedMatrix {
        let mut t = self.arena.take_triplets();
        t.extend(part.owned_nodes().map(|i| (i, i, 1.0)));
        self.compress(part, t)
    }

    /// Diagonal matrix from a length-`npoints` vector; ghost entries are ignored.
    pub fn build_diagonal(
        &mut self,
        part: &MeshPartition,
        diagonal: &[f64],
    ) -> Result<DistributedMatrix, SurfaceError> {
        expect_len("diagonal assembly", part.npoints(), diagonal.len())?;
        let mut t = self.arena.take_triplets();
        t.extend(part.owned_nodes().map(|i| (i, i, diagonal[i])));
        Ok(self.compress(part, t))
    }

    /// Identity plus `-coefficients[i * flow_dir + k]` at `(i, receiver(i, k))`.
    ///
    /// Self-routing slots contribute nothing. With `diagonal_correction` the
    /// diagonal of each row also gains the sum of its off-diagonal magnitudes.
    pub fn build_from_receivers(
        &mut self,
        part: &MeshPartition,
        graph: &ReceiverGraph,
        coefficients: &[f64],
        diagonal_correction: bool,
    ) -> Result<DistributedMatrix, SurfaceError> {
        let n = part.npoints();
        let fd = graph.flow_dir();
        expect_len("receiver graph", n, graph.npoints())?;
        expect_len("receiver coefficients", n * fd, coefficients.len())?;

        let mut t = self.arena.take_triplets();
        for i in part.owned_nodes() {
            let mut diag = 1.0;
            for k in 0..fd {
                let r = graph.receiver(i, k);
                if r == i {
                    continue;
                }
                let c = coefficients[i * fd + k];
                t.push((i, r, -c));
                if diagonal_correction {
                    diag += c;
                }
            }
            t.push((i, i, diag));
        }
        Ok(self.compress(part, t))
    }

    /// Matrix over the partition's neighbour table, e.g. implicit diffusion.
    pub fn build_from_neighbours(
        &mut self,
        part: &MeshPartition,
        coeffs: &HillslopeCoefficients,
    ) -> Result<DistributedMatrix, SurfaceError> {
        let n = part.npoints();
        expect_len("neighbour diagonal", n, coeffs.diagonal.len())?;
        expect_len("neighbour degree", part.max_degree(), coeffs.max_neighbours)?;
        expect_len(
            "neighbour coefficients",
            n * coeffs.max_neighbours,
            coeffs.neighbours.len(),
        )?;

        let mut t = self.arena.take_triplets();
        for i in part.owned_nodes() {
            t.push((i, i, coeffs.diagonal[i]));
            for (k, nb, _, _) in part.neighbours_of(i) {
                t.push((i, nb, coeffs.neighbours[i * coeffs.max_neighbours + k]));
            }
        }
        Ok(self.compress(part, t))
    }

    /// `a · m + b · I`.
    pub fn blend(
        &mut self,
        part: &MeshPartition,
        m: &DistributedMatrix,
        a: f64,
        b: f64,
    ) -> Result<DistributedMatrix, SurfaceError> {
        expect_len("blend operand", part.npoints(), m.n())?;
        let mut t = self.arena.take_triplets();
        for i in part.owned_nodes() {
            let (cols, vals) = m.row(i);
            t.extend(cols.iter().zip(vals).map(|(&j, &v)| (i, j, a * v)));
            t.push((i, i, b));
        }
        Ok(self.compress(part, t))
    }

    /// Collective transpose.
    ///
    /// Entry `(i, j)` of an owned row becomes `(j, i)`. When `j` is a ghost the
    /// entry is shipped in global ids to the neighbour rank owning `j` and
    /// mapped back to local ids there; a column the owner cannot map is
    /// [`SurfaceError::MissingGlobalNode`].
    pub fn transpose<C>(
        &mut self,
        part: &MeshPartition,
        comm: &C,
        m: &DistributedMatrix,
    ) -> Result<DistributedMatrix, SurfaceError>
    where
        C: Communicator + ?Sized,
    {
        expect_len("transpose operand", part.npoints(), m.n())?;
        let l2g = part.local_to_global();
        let mut t = self.arena.take_triplets();
        let mut outgoing: Vec<Vec<WireEntry>> = vec![Vec::new(); part.links().len()];
        for i in part.owned_nodes() {
            let (cols, vals) = m.row(i);
            for (&j, &v) in cols.iter().zip(vals) {
                if part.is_owned(j) {
                    t.push((j, i, v));
                } else {
                    let link = part
                        .ghost_link(j)
                        .ok_or(SurfaceError::MissingGlobalNode(l2g[j]))?;
                    outgoing[link].push(WireEntry::new(l2g[j], l2g[i], v));
                }
            }
        }

        for (link, entries) in part.links().iter().zip(&outgoing) {
            let incoming = swap_records(comm, link.rank, TRANSPOSE_TAG, entries)?;
            for e in incoming {
                let row = part
                    .global_to_local(e.row())
                    .filter(|&row| part.is_owned(row))
                    .ok_or(SurfaceError::MissingGlobalNode(e.row()))?;
                let col = part
                    .global_to_local(e.col())
                    .ok_or(SurfaceError::MissingGlobalNode(e.col()))?;
                t.push((row, col, e.value()));
            }
        }
        Ok(self.compress(part, t))
    }

    fn compress(&mut self, part: &MeshPartition, mut t: Vec<Triplet>) -> DistributedMatrix {
        let n = part.npoints();
        t.extend(part.owned_nodes().map(|i| (i, i, 0.0)));
        // stable: duplicates are summed in insertion order
        t.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut row_ptr = self.arena.take_indices();
        let mut col_idx = self.arena.take_indices();
        let mut values = self.arena.take_values();
        row_ptr.resize(n + 1, 0);

        for ((row, col), group) in &t.iter().chunk_by(|e| (e.0, e.1)) {
            debug_assert!(part.is_owned(row), "assembled entry on ghost row {row}");
            let v: f64 = group.map(|e| e.2).sum();
            if row != col && v == 0.0 {
                continue;
            }
            col_idx.push(col);
            values.push(v);
            row_ptr[row + 1] += 1;
        }
        for i in 0..n {
            row_ptr[i + 1] += row_ptr[i];
        }
        self.arena.put_triplets(t);
        DistributedMatrix::from_parts_unchecked(n, row_ptr, col_idx, values)
    }
}
