//! Structured surface meshes for tests, benches and demos.
//!
//! Nodes of an `nx × ny` grid are numbered `j * nx + i`. Each node is a
//! square Voronoi cell of side `spacing` with up to four neighbours in slot
//! order west, east, south, north. A line mesh is a grid with `ny == 1`.

use std::collections::BTreeMap;

use crate::surface_error::SurfaceError;
use crate::topology::partition::{GlobalTopology, MeshPartition, NeighbourLink, PartitionData};

const DEGREE: usize = 4;

/// Structured grid generator with a configurable outlet set.
#[derive(Clone, Debug)]
pub struct StructuredMesh {
    nx: usize,
    ny: usize,
    spacing: f64,
    outlets: Vec<bool>,
}

impl StructuredMesh {
    /// Grid whose outer ring of nodes are outlets.
    pub fn grid(nx: usize, ny: usize, spacing: f64) -> Result<Self, SurfaceError> {
        if nx == 0 || ny == 0 {
            return Err(SurfaceError::InvalidPartition(format!(
                "structured mesh needs at least one node per axis, got {nx}x{ny}"
            )));
        }
        if !(spacing > 0.0) {
            return Err(SurfaceError::InvalidPartition(format!(
                "spacing must be positive, got {spacing}"
            )));
        }
        let outlets = (0..nx * ny)
            .map(|g| {
                let (i, j) = (g % nx, g / nx);
                i == 0 || j == 0 || i + 1 == nx || j + 1 == ny
            })
            .collect();
        Ok(Self {
            nx,
            ny,
            spacing,
            outlets,
        })
    }

    /// Line of `n` nodes draining to the last node only.
    pub fn line(n: usize, spacing: f64) -> Result<Self, SurfaceError> {
        let mut mesh = Self::grid(n, 1, spacing)?;
        mesh.set_outlets(&[n - 1])?;
        Ok(mesh)
    }

    /// Replace the outlet set.
    pub fn set_outlets(&mut self, outlets: &[usize]) -> Result<(), SurfaceError> {
        let n = self.len();
        self.outlets = vec![false; n];
        for &g in outlets {
            if g >= n {
                return Err(SurfaceError::InvalidPartition(format!(
                    "outlet {g} outside mesh of {n} nodes"
                )));
            }
            self.outlets[g] = true;
        }
        Ok(())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nx * self.ny
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cell-centre coordinates of global node `g`.
    pub fn coordinates(&self, g: usize) -> (f64, f64) {
        (
            (g % self.nx) as f64 * self.spacing,
            (g / self.nx) as f64 * self.spacing,
        )
    }

    #[inline]
    pub fn is_outlet(&self, g: usize) -> bool {
        self.outlets[g]
    }

    fn global_neighbours(&self, g: usize) -> [Option<usize>; DEGREE] {
        let (i, j) = (g % self.nx, g / self.nx);
        [
            (i > 0).then(|| g - 1),
            (i + 1 < self.nx).then(|| g + 1),
            (j > 0).then(|| g - self.nx),
            (j + 1 < self.ny).then(|| g + self.nx),
        ]
    }

    /// Connectivity of the whole mesh for the pit-filling kernel.
    pub fn global_topology(&self) -> Result<GlobalTopology, SurfaceError> {
        let lists: Vec<Vec<usize>> = (0..self.len())
            .map(|g| self.global_neighbours(g).into_iter().flatten().collect())
            .collect();
        GlobalTopology::new(&lists, self.outlets.clone())
    }

    /// Single-rank partition owning every node.
    pub fn serial(&self) -> Result<MeshPartition, SurfaceError> {
        self.partition(1).map(|mut parts| parts.remove(0))
    }

    /// Split the global numbering into `n_ranks` contiguous blocks, each with a
    /// one-ring ghost layer. Local numbering lists owned nodes first, then
    /// ghosts by ascending global id.
    pub fn partition(&self, n_ranks: usize) -> Result<Vec<MeshPartition>, SurfaceError> {
        let n = self.len();
        if n_ranks == 0 || n_ranks > n {
            return Err(SurfaceError::InvalidPartition(format!(
                "cannot split {n} nodes over {n_ranks} ranks"
            )));
        }
        let starts: Vec<usize> = (0..=n_ranks).map(|rank| rank * n / n_ranks).collect();
        (0..n_ranks)
            .map(|rank| self.block(&starts, rank))
            .collect()
    }

    fn block(&self, starts: &[usize], rank: usize) -> Result<MeshPartition, SurfaceError> {
        let owned = starts[rank]..starts[rank + 1];
        let owner = |g: usize| starts.partition_point(|&s| s <= g) - 1;

        let mut ghosts: Vec<usize> = owned
            .clone()
            .flat_map(|g| self.global_neighbours(g).into_iter().flatten())
            .filter(|g| !owned.contains(g))
            .collect();
        ghosts.sort_unstable();
        ghosts.dedup();

        let local_to_global: Vec<usize> = owned.clone().chain(ghosts.iter().copied()).collect();
        let npoints = local_to_global.len();
        let local_of = |g: usize| local_to_global.iter().position(|&x| x == g);

        // owned nodes come first, so local ids follow global ids in both lists
        let mut links: BTreeMap<usize, NeighbourLink> = BTreeMap::new();
        let empty = |peer: usize| NeighbourLink {
            rank: peer,
            ..NeighbourLink::default()
        };
        for g in owned.clone() {
            let mut peers: Vec<usize> = self
                .global_neighbours(g)
                .into_iter()
                .flatten()
                .map(owner)
                .filter(|&p| p != rank)
                .collect();
            peers.sort_unstable();
            peers.dedup();
            for peer in peers {
                links
                    .entry(peer)
                    .or_insert_with(|| empty(peer))
                    .send
                    .push(g - owned.start);
            }
        }
        for (k, &g) in ghosts.iter().enumerate() {
            let peer = owner(g);
            links
                .entry(peer)
                .or_insert_with(|| empty(peer))
                .recv
                .push(owned.len() + k);
        }

        let mut neighbours = Vec::with_capacity(npoints * DEGREE);
        for &g in &local_to_global {
            for nb in self.global_neighbours(g) {
                neighbours.push(nb.and_then(local_of));
            }
        }
        let slot_value = |present: &Option<usize>| if present.is_some() { self.spacing } else { 0.0 };
        let distances = neighbours.iter().map(slot_value).collect();
        let edge_lengths = neighbours.iter().map(slot_value).collect();

        MeshPartition::new(PartitionData {
            gpoints: self.len(),
            owned: local_to_global.iter().map(|g| owned.contains(g)).collect(),
            interior: Vec::new(),
            max_degree: DEGREE,
            neighbours,
            distances,
            edge_lengths,
            areas: vec![self.spacing * self.spacing; npoints],
            local_to_global,
            links: links.into_values().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_has_single_outlet() {
        let mesh = StructuredMesh::line(5, 10.0).unwrap();
        let outlets: Vec<usize> = (0..5).filter(|&g| mesh.is_outlet(g)).collect();
        assert_eq!(outlets, vec![4]);
        let topo = mesh.global_topology().unwrap();
        assert_eq!(topo.neighbours(0), &[1]);
        assert_eq!(topo.neighbours(2), &[1, 3]);
    }

    #[test]
    fn partition_builds_one_ring_ghosts() {
        let mesh = StructuredMesh::grid(4, 4, 1.0).unwrap();
        let parts = mesh.partition(2).unwrap();
        assert_eq!(parts[0].owned_count() + parts[1].owned_count(), 16);
        // rank 0 owns rows 0-1 and sees row 2 as ghosts
        assert_eq!(parts[0].npoints(), 12);
        for local in parts[0].owned_nodes() {
            for (_, nb, dist, _) in parts[0].neighbours_of(local) {
                assert!(nb < parts[0].npoints());
                assert_eq!(dist, 1.0);
            }
        }
        assert!(!parts[0].is_owned(8));
        assert_eq!(parts[0].local_to_global()[8], 8);
    }

    #[test]
    fn links_pair_up_across_ranks() {
        let mesh = StructuredMesh::grid(4, 6, 1.0).unwrap();
        let parts = mesh.partition(3).unwrap();
        // middle block talks to both sides, the outer blocks only to it
        assert_eq!(parts[1].links().iter().map(|l| l.rank).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(parts[0].links().len(), 1);
        for (rank, part) in parts.iter().enumerate() {
            for link in part.links() {
                let peer = &parts[link.rank];
                let back = peer.links().iter().find(|l| l.rank == rank).unwrap();
                let sent: Vec<usize> = link.send.iter().map(|&i| part.local_to_global()[i]).collect();
                let received: Vec<usize> =
                    back.recv.iter().map(|&i| peer.local_to_global()[i]).collect();
                assert_eq!(sent, received, "{rank} -> {}", link.rank);
            }
        }
    }

    #[test]
    fn too_many_ranks_is_rejected() {
        let mesh = StructuredMesh::line(3, 1.0).unwrap();
        assert!(mesh.partition(4).is_err());
    }
}
