//! Partition-local view of the surface mesh.
//!
//! A [`MeshPartition`] is handed over by the mesh provider and stays
//! immutable for the whole run. Local nodes are numbered `0..npoints`; each
//! carries its global id, an ownership flag (this rank updates it) and an
//! interior flag (this rank computes its receivers). The neighbour table has a
//! fixed maximum degree with `None` in unused slots.
//!
//! Ghost values travel along [`NeighbourLink`]s: for each neighbouring rank
//! the owned nodes it ghosts and the ghosts it owns, both ordered by
//! ascending global id so the two sides of a link agree on the layout.

use hashbrown::HashMap;

use crate::debug_invariants::{DebugInvariants, expect_len};
use crate::surface_error::SurfaceError;

/// Nodes exchanged with one neighbouring rank.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NeighbourLink {
    pub rank: usize,
    /// Owned local nodes ghosted by `rank`.
    pub send: Vec<usize>,
    /// Ghost local nodes owned by `rank`.
    pub recv: Vec<usize>,
}

/// Raw arrays describing one rank's partition.
#[derive(Clone, Debug, Default)]
pub struct PartitionData {
    /// Number of nodes in the whole mesh.
    pub gpoints: usize,
    /// Global id of every local node (lgIDs).
    pub local_to_global: Vec<usize>,
    /// Nodes this rank authoritatively updates.
    pub owned: Vec<bool>,
    /// Nodes whose receivers are computed on this rank (inIDs).
    /// Defaults to `owned` when empty.
    pub interior: Vec<bool>,
    /// Maximum neighbour count per node.
    pub max_degree: usize,
    /// Local neighbour ids, `npoints * max_degree`, row-major.
    pub neighbours: Vec<Option<usize>>,
    /// Distance to each neighbour, same layout as `neighbours`.
    pub distances: Vec<f64>,
    /// Length of the Voronoi edge shared with each neighbour.
    pub edge_lengths: Vec<f64>,
    /// Voronoi cell area of every local node.
    pub areas: Vec<f64>,
    /// One link per neighbouring rank; every ghost appears in exactly one
    /// `recv` list.
    pub links: Vec<NeighbourLink>,
}

/// Immutable partition of the surface mesh seen from one rank.
#[derive(Clone, Debug)]
pub struct MeshPartition {
    gpoints: usize,
    local_to_global: Vec<usize>,
    global_to_local: HashMap<usize, usize>,
    owned: Vec<bool>,
    interior: Vec<bool>,
    max_degree: usize,
    neighbours: Vec<Option<usize>>,
    distances: Vec<f64>,
    edge_lengths: Vec<f64>,
    areas: Vec<f64>,
    links: Vec<NeighbourLink>,
    /// Index into `links` of the owner of each ghost.
    ghost_link: Vec<Option<usize>>,
}

impl MeshPartition {
    /// Validate raw partition arrays and build the global→local index.
    pub fn new(data: PartitionData) -> Result<Self, SurfaceError> {
        let PartitionData {
            gpoints,
            local_to_global,
            owned,
            mut interior,
            max_degree,
            neighbours,
            distances,
            edge_lengths,
            areas,
            mut links,
        } = data;
        let npoints = local_to_global.len();
        links.sort_by_key(|l| l.rank);
        if interior.is_empty() {
            interior = owned.clone();
        }

        let mut global_to_local = HashMap::with_capacity(npoints);
        for (local, &global) in local_to_global.iter().enumerate() {
            if global >= gpoints {
                return Err(SurfaceError::InvalidPartition(format!(
                    "local node {local} maps to global id {global} >= gpoints {gpoints}"
                )));
            }
            if global_to_local.insert(global, local).is_some() {
                return Err(SurfaceError::InvalidPartition(format!(
                    "global id {global} appears twice in the local-to-global map"
                )));
            }
        }

        let mut ghost_link = vec![None; npoints];
        for (idx, link) in links.iter().enumerate() {
            for &ghost in &link.recv {
                let Some(slot) = ghost_link.get_mut(ghost) else {
                    return Err(SurfaceError::InvalidPartition(format!(
                        "link to rank {} receives into local {ghost} >= npoints {npoints}",
                        link.rank
                    )));
                };
                if slot.replace(idx).is_some() {
                    return Err(SurfaceError::InvalidPartition(format!(
                        "ghost {ghost} is received over more than one link"
                    )));
                }
            }
        }

        let part = MeshPartition {
            gpoints,
            local_to_global,
            global_to_local,
            owned,
            interior,
            max_degree,
            neighbours,
            distances,
            edge_lengths,
            areas,
            links,
            ghost_link,
        };
        part.validate_invariants()?;
        Ok(part)
    }

    /// Number of local (owned + ghost) nodes.
    #[inline]
    pub fn npoints(&self) -> usize {
        self.local_to_global.len()
    }

    /// Number of nodes in the whole mesh.
    #[inline]
    pub fn gpoints(&self) -> usize {
        self.gpoints
    }

    #[inline]
    pub fn max_degree(&self) -> usize {
        self.max_degree
    }

    #[inline]
    pub fn local_to_global(&self) -> &[usize] {
        &self.local_to_global
    }

    /// Local index of a global node, if present on this rank.
    #[inline]
    pub fn global_to_local(&self, global: usize) -> Option<usize> {
        self.global_to_local.get(&global).copied()
    }

    #[inline]
    pub fn is_owned(&self, local: usize) -> bool {
        self.owned[local]
    }

    #[inline]
    pub fn interior_mask(&self) -> &[bool] {
        &self.interior
    }

    /// Local indices of owned nodes, ascending.
    pub fn owned_nodes(&self) -> impl Iterator<Item = usize> + '_ {
        self.owned
            .iter()
            .enumerate()
            .filter_map(|(i, &o)| o.then_some(i))
    }

    pub fn owned_count(&self) -> usize {
        self.owned.iter().filter(|&&o| o).count()
    }

    /// Neighbour slot `k` of `local`.
    #[inline]
    pub fn neighbour(&self, local: usize, k: usize) -> Option<usize> {
        self.neighbours[local * self.max_degree + k]
    }

    /// Present neighbours of `local` as `(slot, neighbour, distance, edge_length)`.
    pub fn neighbours_of(
        &self,
        local: usize,
    ) -> impl Iterator<Item = (usize, usize, f64, f64)> + '_ {
        let base = local * self.max_degree;
        (0..self.max_degree).filter_map(move |k| {
            self.neighbours[base + k]
                .map(|nb| (k, nb, self.distances[base + k], self.edge_lengths[base + k]))
        })
    }

    #[inline]
    pub fn areas(&self) -> &[f64] {
        &self.areas
    }

    /// Neighbour links, ascending by rank.
    #[inline]
    pub fn links(&self) -> &[NeighbourLink] {
        &self.links
    }

    /// Rank owning the ghost `local`; `None` for owned nodes.
    #[inline]
    pub fn ghost_owner(&self, local: usize) -> Option<usize> {
        self.ghost_link[local].map(|idx| self.links[idx].rank)
    }

    /// Position in [`MeshPartition::links`] of the link owning ghost `local`.
    #[inline]
    pub fn ghost_link(&self, local: usize) -> Option<usize> {
        self.ghost_link[local]
    }
}

impl DebugInvariants for MeshPartition {
    fn validate_invariants(&self) -> Result<(), SurfaceError> {
        let n = self.npoints();
        let slots = n * self.max_degree;
        expect_len("partition owned mask", n, self.owned.len())?;
        expect_len("partition interior mask", n, self.interior.len())?;
        expect_len("partition areas", n, self.areas.len())?;
        expect_len("partition neighbour table", slots, self.neighbours.len())?;
        expect_len("partition distances", slots, self.distances.len())?;
        expect_len("partition edge lengths", slots, self.edge_lengths.len())?;

        for (slot, nb) in self.neighbours.iter().enumerate() {
            if let Some(nb) = *nb {
                if nb >= n {
                    return Err(SurfaceError::InvalidPartition(format!(
                        "node {} neighbour slot {} points to local {nb} >= npoints {n}",
                        slot / self.max_degree,
                        slot % self.max_degree
                    )));
                }
            }
        }
        for (local, &area) in self.areas.iter().enumerate() {
            if self.owned[local] && !(area > 0.0) {
                return Err(SurfaceError::InvalidPartition(format!(
                    "owned node {local} has non-positive area {area}"
                )));
            }
        }
        for local in 0..n {
            if self.interior[local] && !self.owned[local] {
                return Err(SurfaceError::InvalidPartition(format!(
                    "interior node {local} is not owned by this rank"
                )));
            }
            if self.owned[local] == self.ghost_link[local].is_some() {
                return Err(SurfaceError::InvalidPartition(format!(
                    "node {local}: owned nodes take no link, ghosts exactly one"
                )));
            }
        }
        for pair in self.links.windows(2) {
            if pair[0].rank == pair[1].rank {
                return Err(SurfaceError::InvalidPartition(format!(
                    "two links to rank {}",
                    pair[0].rank
                )));
            }
        }
        for link in &self.links {
            if let Some(&bad) = link.send.iter().find(|&&i| i >= n || !self.owned[i]) {
                return Err(SurfaceError::InvalidPartition(format!(
                    "link to rank {} sends local {bad}, which is not owned",
                    link.rank
                )));
            }
        }
        Ok(())
    }
}

/// Connectivity of the whole mesh in global ids, consumed by the pit-filling kernel.
#[derive(Clone, Debug, Default)]
pub struct GlobalTopology {
    offsets: Vec<usize>,
    adjacency: Vec<usize>,
    outlets: Vec<bool>,
}

impl GlobalTopology {
    /// Build from per-node neighbour lists and an outlet mask (open boundary nodes).
    pub fn new(neighbours: &[Vec<usize>], outlets: Vec<bool>) -> Result<Self, SurfaceError> {
        let n = neighbours.len();
        expect_len("global outlet mask", n, outlets.len())?;
        let mut offsets = Vec::with_capacity(n + 1);
        let mut adjacency = Vec::new();
        offsets.push(0);
        for (node, list) in neighbours.iter().enumerate() {
            if let Some(&bad) = list.iter().find(|&&nb| nb >= n) {
                return Err(SurfaceError::InvalidPartition(format!(
                    "global node {node} lists neighbour {bad} >= {n}"
                )));
            }
            adjacency.extend_from_slice(list);
            offsets.push(adjacency.len());
        }
        Ok(Self {
            offsets,
            adjacency,
            outlets,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.outlets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.outlets.is_empty()
    }

    #[inline]
    pub fn neighbours(&self, node: usize) -> &[usize] {
        &self.adjacency[self.offsets[node]..self.offsets[node + 1]]
    }

    #[inline]
    pub fn is_outlet(&self, node: usize) -> bool {
        self.outlets[node]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_node_data() -> PartitionData {
        PartitionData {
            gpoints: 2,
            local_to_global: vec![0, 1],
            owned: vec![true, true],
            interior: Vec::new(),
            max_degree: 1,
            neighbours: vec![Some(1), Some(0)],
            distances: vec![1.0, 1.0],
            edge_lengths: vec![1.0, 1.0],
            areas: vec![1.0, 1.0],
            links: Vec::new(),
        }
    }

    /// Rank 0 of a two-rank split: owns global 0, ghosts global 1.
    fn split_data() -> PartitionData {
        PartitionData {
            owned: vec![true, false],
            links: vec![NeighbourLink {
                rank: 1,
                send: vec![0],
                recv: vec![1],
            }],
            ..two_node_data()
        }
    }

    #[test]
    fn interior_defaults_to_owned() {
        let part = MeshPartition::new(two_node_data()).unwrap();
        assert_eq!(part.interior_mask(), &[true, true]);
        assert_eq!(part.global_to_local(1), Some(1));
        assert_eq!(part.global_to_local(5), None);
    }

    #[test]
    fn duplicate_global_id_is_rejected() {
        let mut data = two_node_data();
        data.local_to_global = vec![1, 1];
        let err = MeshPartition::new(data).unwrap_err();
        assert!(matches!(err, SurfaceError::InvalidPartition(_)));
    }

    #[test]
    fn short_area_array_is_a_layout_error() {
        let mut data = two_node_data();
        data.areas.pop();
        let err = MeshPartition::new(data).unwrap_err();
        assert!(matches!(err, SurfaceError::LayoutMismatch { .. }));
    }

    #[test]
    fn ghosts_know_their_owner() {
        let part = MeshPartition::new(split_data()).unwrap();
        assert_eq!(part.ghost_owner(1), Some(1));
        assert_eq!(part.ghost_owner(0), None);
        assert_eq!(part.links().len(), 1);
    }

    #[test]
    fn ghost_without_link_is_rejected() {
        let mut data = split_data();
        data.links.clear();
        assert!(matches!(
            MeshPartition::new(data),
            Err(SurfaceError::InvalidPartition(_))
        ));
    }

    #[test]
    fn link_sending_a_ghost_is_rejected() {
        let mut data = split_data();
        data.links[0].send = vec![1];
        assert!(MeshPartition::new(data).is_err());
    }

    #[test]
    fn out_of_range_neighbour_is_rejected() {
        let mut data = two_node_data();
        data.neighbours[0] = Some(9);
        assert!(MeshPartition::new(data).is_err());
    }
}
