//! Neighbour exchanges and rank agreement built on [`Communicator`].
//!
//! A swap is one message each way between a pair of ranks. The lower rank of
//! the pair sends first and callers visit their peers in ascending rank
//! order, so blocking sends pair up without a cycle of waiting ranks.
//! Variable-length swaps run in two stages: record counts, then records.

use bytemuck::Pod;

use crate::algs::communicator::{Communicator, ReduceOp, Wait};
use crate::algs::wire::{WireCount, cast_slice, decode_records};
use crate::surface_error::SurfaceError;

/// Send `send` to `peer` and receive its `recv_len`-byte message on `tag`.
pub fn swap<C>(
    comm: &C,
    peer: usize,
    tag: u16,
    send: &[u8],
    recv_len: usize,
) -> Result<Vec<u8>, SurfaceError>
where
    C: Communicator + ?Sized,
{
    let received = if comm.rank() < peer {
        comm.isend(peer, tag, send);
        comm.irecv(peer, tag, recv_len).wait()
    } else {
        let handle = comm.irecv(peer, tag, recv_len);
        let bytes = handle.wait();
        comm.isend(peer, tag, send);
        bytes
    };
    received.ok_or_else(|| SurfaceError::CommError {
        neighbor: peer,
        reason: format!("expected a {recv_len}-byte message on tag {tag}"),
    })
}

/// Swap a variable number of records with `peer`.
pub fn swap_records<T, C>(
    comm: &C,
    peer: usize,
    tag: u16,
    records: &[T],
) -> Result<Vec<T>, SurfaceError>
where
    T: Pod,
    C: Communicator + ?Sized,
{
    let count = WireCount::new(records.len());
    let count_bytes = swap(
        comm,
        peer,
        tag,
        cast_slice(std::slice::from_ref(&count)),
        std::mem::size_of::<WireCount>(),
    )?;
    let incoming: Vec<WireCount> = decode_records(&count_bytes).map_err(|reason| {
        SurfaceError::CommError {
            neighbor: peer,
            reason,
        }
    })?;
    let n = incoming.first().map_or(0, WireCount::get);
    let bytes = swap(
        comm,
        peer,
        tag,
        cast_slice(records),
        n * std::mem::size_of::<T>(),
    )?;
    decode_records(&bytes).map_err(|reason| SurfaceError::CommError {
        neighbor: peer,
        reason,
    })
}

/// Turn a rank-local outcome into a collective one.
///
/// Every rank learns whether any rank failed. A failing rank keeps its own
/// error; the others return [`SurfaceError::PeerFailed`] naming the highest
/// failing rank.
pub fn agree<T, C>(comm: &C, local: Result<T, SurfaceError>) -> Result<T, SurfaceError>
where
    C: Communicator + ?Sized,
{
    if comm.size() <= 1 {
        return local;
    }
    let mut flag = [if local.is_err() {
        (comm.rank() + 1) as f64
    } else {
        0.0
    }];
    comm.allreduce_f64(&mut flag, ReduceOp::Max);
    match local {
        Ok(_) if flag[0] > 0.0 => Err(SurfaceError::PeerFailed {
            rank: flag[0] as usize - 1,
        }),
        other => other,
    }
}
