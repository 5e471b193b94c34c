//! Thin façade over intra-process (thread ranks) or inter-process (MPI)
//! message passing.
//!
//! Point-to-point messages go through [`Communicator::isend`] and
//! [`Communicator::irecv`]; receive handles are waitable and yield the bytes.
//! Messages between one pair of ranks with the same tag are delivered in
//! posting order. The collectives (`allgather`, `allreduce_f64`, `barrier`)
//! must be entered by every rank of the group in the same order.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;

use crate::algs::wire::{cast_slice, cast_slice_mut};

/// Element-wise reduction operator for [`Communicator::allreduce_f64`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
}

impl ReduceOp {
    #[inline]
    fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            ReduceOp::Sum => a + b,
            ReduceOp::Max => a.max(b),
        }
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data, `None` if the
    /// message did not have the expected length.
    fn wait(self) -> Option<Vec<u8>>;
}

/// Message-passing interface (minimal by design).
pub trait Communicator {
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// Rank of the calling process within the group.
    fn rank(&self) -> usize;
    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Post `buf` to `peer`. The buffer is copied before returning.
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]);

    /// Receive the next message of `len` bytes from `peer` with `tag`.
    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle;

    /// Gather equally sized blocks from every rank.
    ///
    /// `recv` must hold `size() * send.len()` bytes and is filled rank-major.
    fn allgather(&self, send: &[u8], recv: &mut [u8]);

    /// Element-wise reduction of `buf` across all ranks, in place.
    ///
    /// Ranks are folded in ascending order so every rank obtains bit-identical
    /// results.
    fn allreduce_f64(&self, buf: &mut [f64], op: ReduceOp) {
        let n_ranks = self.size();
        if n_ranks <= 1 || buf.is_empty() {
            return;
        }
        let n = buf.len();
        let mut recv = vec![0.0f64; n_ranks * n];
        self.allgather(cast_slice(buf), cast_slice_mut(&mut recv));
        buf.copy_from_slice(&recv[..n]);
        for other in recv[n..].chunks_exact(n) {
            for (a, &b) in buf.iter_mut().zip(other) {
                *a = op.apply(*a, b);
            }
        }
    }

    /// Global sum of a scalar.
    fn sum_f64(&self, value: f64) -> f64 {
        let mut v = [value];
        self.allreduce_f64(&mut v, ReduceOp::Sum);
        v[0]
    }

    /// Synchronise all ranks.
    fn barrier(&self) {
        let mut sink = vec![0u8; self.size()];
        self.allgather(&[0u8], &mut sink);
    }
}

impl<C: Communicator + ?Sized> Communicator for &C {
    type RecvHandle = C::RecvHandle;

    fn rank(&self) -> usize {
        (**self).rank()
    }
    fn size(&self) -> usize {
        (**self).size()
    }
    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        (**self).isend(peer, tag, buf)
    }
    fn irecv(&self, peer: usize, tag: u16, len: usize) -> Self::RecvHandle {
        (**self).irecv(peer, tag, len)
    }
    fn allgather(&self, send: &[u8], recv: &mut [u8]) {
        (**self).allgather(send, recv)
    }
    fn allreduce_f64(&self, buf: &mut [f64], op: ReduceOp) {
        (**self).allreduce_f64(buf, op)
    }
    fn barrier(&self) {
        (**self).barrier()
    }
}

/// Compile-time no-op comm for pure serial runs and unit tests.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

impl Communicator for NoComm {
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: u16, _len: usize) {}
    fn allgather(&self, send: &[u8], recv: &mut [u8]) {
        recv[..send.len()].copy_from_slice(send);
    }
}

// --- RayonComm: intra-process / multi-thread ---
type Key = (usize, usize, u16, u64); // (src, dst, tag, sequence)

/// Tag reserved for the collectives of [`RayonComm`].
const COLLECTIVE_TAG: u16 = u16::MAX;

/// In-process rank running on its own thread.
///
/// Ranks created by the same [`RayonComm::group`] call share one mailbox.
/// Every message is keyed by a per-(peer, tag) sequence number on both the
/// sending and the receiving side, so messages pair up by posting order.
#[derive(Clone, Debug)]
pub struct RayonComm {
    rank: usize,
    size: usize,
    mailbox: Arc<DashMap<Key, Bytes>>,
    sent: Arc<DashMap<(usize, u16), u64>>,
    received: Arc<DashMap<(usize, u16), u64>>,
}

/// Pending receive from the shared mailbox.
pub struct MailboxHandle {
    mailbox: Arc<DashMap<Key, Bytes>>,
    key: Key,
    len: usize,
}

impl Wait for MailboxHandle {
    fn wait(self) -> Option<Vec<u8>> {
        loop {
            if let Some((_, bytes)) = self.mailbox.remove(&self.key) {
                return (bytes.len() == self.len).then(|| bytes.to_vec());
            }
            std::thread::yield_now();
        }
    }
}

impl RayonComm {
    /// Create `size` ranks sharing a fresh mailbox.
    pub fn group(size: usize) -> Vec<RayonComm> {
        let mailbox = Arc::new(DashMap::new());
        (0..size)
            .map(|rank| RayonComm {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
                sent: Arc::new(DashMap::new()),
                received: Arc::new(DashMap::new()),
            })
            .collect()
    }

    fn next(counters: &DashMap<(usize, u16), u64>, peer: usize, tag: u16) -> u64 {
        let mut seq = counters.entry((peer, tag)).or_insert(0);
        let current = *seq;
        *seq += 1;
        current
    }
}

impl Communicator for RayonComm {
    type RecvHandle = MailboxHandle;

    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        let seq = Self::next(&self.sent, peer, tag);
        self.mailbox
            .insert((self.rank, peer, tag, seq), Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: u16, len: usize) -> MailboxHandle {
        let seq = Self::next(&self.received, peer, tag);
        MailboxHandle {
            mailbox: Arc::clone(&self.mailbox),
            key: (peer, self.rank, tag, seq),
            len,
        }
    }

    fn allgather(&self, send: &[u8], recv: &mut [u8]) {
        let block = send.len();
        let peers = (0..self.size).filter(|&p| p != self.rank);
        for peer in peers.clone() {
            self.isend(peer, COLLECTIVE_TAG, send);
        }
        recv[self.rank * block..(self.rank + 1) * block].copy_from_slice(send);
        let pending: Vec<_> = peers
            .map(|peer| (peer, self.irecv(peer, COLLECTIVE_TAG, block)))
            .collect();
        for (peer, handle) in pending {
            if let Some(bytes) = handle.wait() {
                recv[peer * block..(peer + 1) * block].copy_from_slice(&bytes);
            }
        }
    }
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{Communicator, ReduceOp, Wait};
    use mpi::collective::SystemOperation;
    use mpi::environment::Universe;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::{Communicator as _, CommunicatorCollectives as _, Destination as _, Source as _};

    /// World communicator; finalises MPI when dropped.
    pub struct MpiComm {
        pub world: SimpleCommunicator,
        pub rank: usize,
        size: usize,
        _universe: Universe,
    }

    impl MpiComm {
        /// Initialise MPI. Returns `None` if MPI was already initialised.
        pub fn new() -> Option<Self> {
            let universe = mpi::initialize()?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Some(Self {
                world,
                rank,
                size,
                _universe: universe,
            })
        }
    }

    /// Receive completed when `irecv` returned.
    pub struct MpiHandle(Option<Vec<u8>>);

    impl Wait for MpiHandle {
        fn wait(self) -> Option<Vec<u8>> {
            self.0
        }
    }

    impl Communicator for MpiComm {
        type RecvHandle = MpiHandle;

        fn rank(&self) -> usize {
            self.rank
        }
        fn size(&self) -> usize {
            self.size
        }
        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
            self.world
                .process_at_rank(peer as i32)
                .send_with_tag(buf, i32::from(tag));
        }
        fn irecv(&self, peer: usize, tag: u16, len: usize) -> MpiHandle {
            let (data, _status) = self
                .world
                .process_at_rank(peer as i32)
                .receive_vec_with_tag::<u8>(i32::from(tag));
            MpiHandle((data.len() == len).then_some(data))
        }
        fn allgather(&self, send: &[u8], recv: &mut [u8]) {
            self.world.all_gather_into(send, recv);
        }
        fn allreduce_f64(&self, buf: &mut [f64], op: ReduceOp) {
            let local = buf.to_vec();
            match op {
                ReduceOp::Sum => {
                    self.world
                        .all_reduce_into(&local[..], buf, SystemOperation::sum())
                }
                ReduceOp::Max => {
                    self.world
                        .all_reduce_into(&local[..], buf, SystemOperation::max())
                }
            }
        }
        fn barrier(&self) {
            self.world.barrier();
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nocomm_allgather_is_identity() {
        let comm = NoComm;
        let mut recv = [0u8; 3];
        comm.allgather(&[7, 8, 9], &mut recv);
        assert_eq!(recv, [7, 8, 9]);
        let mut v = [1.5, -2.0];
        comm.allreduce_f64(&mut v, ReduceOp::Max);
        assert_eq!(v, [1.5, -2.0]);
    }

    #[test]
    fn rayon_allgather_three_ranks() {
        let comms = RayonComm::group(3);
        let gathered: Vec<Vec<u8>> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let mut recv = vec![0u8; 2 * c.size()];
                        let r = c.rank() as u8;
                        c.allgather(&[r, r + 10], &mut recv);
                        recv
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for recv in gathered {
            assert_eq!(recv, vec![0, 10, 1, 11, 2, 12]);
        }
    }

    #[test]
    fn rayon_allreduce_sum_and_max() {
        let comms = RayonComm::group(2);
        let out: Vec<(Vec<f64>, Vec<f64>)> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let r = c.rank() as f64;
                        let mut sum = vec![r, 1.0];
                        c.allreduce_f64(&mut sum, ReduceOp::Sum);
                        let mut max = vec![r, -r];
                        c.allreduce_f64(&mut max, ReduceOp::Max);
                        (sum, max)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (sum, max) in out {
            assert_eq!(sum, vec![1.0, 2.0]);
            assert_eq!(max, vec![1.0, 0.0]);
        }
    }

    #[test]
    fn point_to_point_messages_keep_posting_order() {
        let comms = RayonComm::group(2);
        let got: Vec<Vec<Vec<u8>>> = std::thread::scope(|s| {
            let handles: Vec<_> = comms
                .iter()
                .map(|c| {
                    s.spawn(move || {
                        let peer = 1 - c.rank();
                        let r = c.rank() as u8;
                        c.isend(peer, 7, &[r, 1]);
                        c.isend(peer, 7, &[r, 2, 2]);
                        let first = c.irecv(peer, 7, 2);
                        let second = c.irecv(peer, 7, 3);
                        vec![first.wait().unwrap(), second.wait().unwrap()]
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(got[0], vec![vec![1, 1], vec![1, 2, 2]]);
        assert_eq!(got[1], vec![vec![0, 1], vec![0, 2, 2]]);
    }

    #[test]
    fn wrong_length_receive_yields_none() {
        let comms = RayonComm::group(2);
        comms[0].isend(1, 3, &[1, 2, 3]);
        assert_eq!(comms[1].irecv(0, 3, 2).wait(), None);
    }
}
