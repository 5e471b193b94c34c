//! Explicit cross-rank synchronisation of node fields.
//!
//! Owned entries are the only authoritative values; ghost entries are
//! overwritten from their owners over the partition's neighbour links.

use crate::algs::collective::swap;
use crate::algs::communicator::{Communicator, ReduceOp};
use crate::algs::wire::{cast_slice, decode_records};
use crate::debug_invariants::expect_len;
use crate::surface_error::SurfaceError;
use crate::topology::partition::MeshPartition;

const GHOST_TAG: u16 = 0x4748;

/// Assemble the complete global field from every rank's owned values.
///
/// Global positions not owned locally contribute `-inf` to a max-reduction,
/// so the result has `gpoints` entries identical on every rank. Only the
/// global pit filling needs this view.
pub fn global_view<C>(
    part: &MeshPartition,
    comm: &C,
    local: &[f64],
) -> Result<Vec<f64>, SurfaceError>
where
    C: Communicator + ?Sized,
{
    expect_len("global view input", part.npoints(), local.len())?;
    let mut global = vec![f64::NEG_INFINITY; part.gpoints()];
    let l2g = part.local_to_global();
    for node in part.owned_nodes() {
        global[l2g[node]] = local[node];
    }
    comm.allreduce_f64(&mut global, ReduceOp::Max);
    Ok(global)
}

/// Overwrite ghost entries of `values` with their owners' values.
///
/// Each rank swaps one message with every neighbour rank: the owned values
/// the neighbour ghosts, for the ghost values it owns.
pub fn exchange_ghosts<C>(
    part: &MeshPartition,
    comm: &C,
    values: &mut [f64],
) -> Result<(), SurfaceError>
where
    C: Communicator + ?Sized,
{
    expect_len("ghost exchange", part.npoints(), values.len())?;
    for link in part.links() {
        let outgoing: Vec<f64> = link.send.iter().map(|&l| values[l]).collect();
        let bytes = swap(
            comm,
            link.rank,
            GHOST_TAG,
            cast_slice(&outgoing),
            link.recv.len() * std::mem::size_of::<f64>(),
        )?;
        let incoming: Vec<f64> = decode_records(&bytes).map_err(|reason| {
            SurfaceError::CommError {
                neighbor: link.rank,
                reason,
            }
        })?;
        for (&l, v) in link.recv.iter().zip(incoming) {
            values[l] = v;
        }
    }
    Ok(())
}
