//! Definition of a linear octree with refinement markers.
//!
//! The local portion of the tree is two arrays of octants sorted by Morton
//! key: the internal octants owned by this rank and a read-only ghost
//! layer owned by neighbouring ranks. Octants carry a refinement marker
//! and a balance flag; [`Octree::adapt`] consumes the markers in one
//! bulk-synchronous step (marker expansion, refinement, sibling
//! coarsening, 2:1 balance to fixpoint) and can report a mapping table
//! that relates every post-adaption octant to the pre-adaption octants it
//! came from. The mapping is what the patch layer uses to reconcile cells
//! after an adaption.
//!
//! The tree is embedded in physical space by an origin and the root edge
//! length; all octant geometry is derived from the Morton decode.

use std::collections::HashMap;

use itertools::Itertools;
use tracing::trace;

use crate::constants::*;
use crate::error::{MeshError, Result};
use crate::geometry::{PhysicalBox, Point3};
use crate::morton::MortonKey;

#[cfg(feature = "mpi")]
pub mod parallel;

/// Default geometric tolerance of point queries.
const DEFAULT_TOL: f64 = 1.0e-12;

/// An octant of the local tree.
#[derive(Debug, Clone, Copy)]
pub struct Octant {
    key: MortonKey,
    marker: i8,
    balance: bool,
}

impl Octant {
    /// The Morton key of the octant.
    pub fn key(&self) -> MortonKey {
        self.key
    }

    /// The refinement level of the octant.
    pub fn level(&self) -> usize {
        self.key.level()
    }

    /// The pending refinement marker.
    pub fn marker(&self) -> i8 {
        self.marker
    }

    /// True if the octant imposes the 2:1 constraint.
    pub fn balance(&self) -> bool {
        self.balance
    }
}

/// A read-only copy of an octant owned by another rank.
#[derive(Debug, Clone, Copy)]
pub struct GhostOctant {
    key: MortonKey,
    rank: usize,
}

impl GhostOctant {
    /// The Morton key of the ghost.
    pub fn key(&self) -> MortonKey {
        self.key
    }

    /// The rank owning the octant.
    pub fn rank(&self) -> usize {
        self.rank
    }
}

/// The mapping table produced by [`Octree::adapt`].
///
/// For each post-adaption tree index the table lists the pre-adaption
/// tree indices it derives from: one entry for untouched or renumbered
/// octants, one for refinement products (the split octant), `2^dim` for a
/// coarsening product, and none for octants received from another rank.
#[derive(Debug, Default)]
struct AdaptMapping {
    octant_map: Vec<Vec<u32>>,
    ghost_flags: Vec<Vec<bool>>,
    octant_ranks: Vec<Vec<usize>>,
    new_refined: Vec<bool>,
    new_coarsened: Vec<bool>,
}

// Working octant used inside adapt: the octant data plus its provenance.
#[derive(Debug, Clone)]
struct WorkOctant {
    key: MortonKey,
    marker: i8,
    balance: bool,
    prev: Vec<u32>,
    prev_ghost: Vec<bool>,
    prev_rank: Vec<usize>,
    new_refined: bool,
    new_coarsened: bool,
}

/// A linear octree over a cubic domain.
#[derive(Debug)]
pub struct Octree {
    dim: usize,
    origin: Point3,
    length: f64,
    tol: f64,
    octants: Vec<Octant>,
    ghosts: Vec<GhostOctant>,
    rank: usize,
    n_ranks: usize,
    // Prefix sum of the octant counts on lower ranks; zero on one rank.
    global_offset: u64,
    // First internal key of every rank, the global Morton partition.
    partition_first_keys: Vec<MortonKey>,
    mapping: Option<AdaptMapping>,
    // Pre-move index ranges shipped to each destination rank by the last
    // load balance, as up to two [begin, end) pairs.
    sent_ranges: HashMap<usize, [u32; 4]>,
}

impl Octree {
    /// Create a tree holding the root octant of a cubic domain.
    pub fn new(dim: usize, origin: Point3, length: f64) -> Result<Self> {
        if dim != 2 && dim != 3 {
            return Err(MeshError::InvalidArgument(format!(
                "octree dimension must be 2 or 3, got {dim}"
            )));
        }
        if !(length > 0.0) {
            return Err(MeshError::InvalidArgument(format!(
                "octree edge length must be positive, got {length}"
            )));
        }

        Ok(Self {
            dim,
            origin,
            length,
            tol: DEFAULT_TOL,
            octants: vec![Octant {
                key: MortonKey::root(),
                marker: 0,
                balance: true,
            }],
            ghosts: Vec::new(),
            rank: 0,
            n_ranks: 1,
            global_offset: 0,
            partition_first_keys: vec![MortonKey::root()],
            mapping: None,
            sent_ranges: HashMap::new(),
        })
    }

    // --------------------------------------------------------------------
    // Basic accessors
    // --------------------------------------------------------------------

    /// The dimension of the tree, 2 or 3.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The origin of the root cube.
    pub fn origin(&self) -> Point3 {
        self.origin
    }

    /// The edge length of the root cube.
    pub fn length(&self) -> f64 {
        self.length
    }

    /// The deepest admissible refinement level.
    pub fn max_level(&self) -> usize {
        DEEPEST_LEVEL as usize
    }

    /// Number of faces of an octant.
    pub fn n_faces(&self) -> usize {
        2 * self.dim
    }

    /// Number of corner nodes of an octant.
    pub fn n_nodes(&self) -> usize {
        1 << self.dim
    }

    /// Number of children of an octant.
    pub fn n_children(&self) -> usize {
        1 << self.dim
    }

    /// Number of edges of an octant; zero in two dimensions where edges
    /// and nodes coincide.
    pub fn n_edges(&self) -> usize {
        if self.dim == 3 {
            12
        } else {
            0
        }
    }

    /// Number of internal octants of this rank.
    pub fn num_octants(&self) -> usize {
        self.octants.len()
    }

    /// Number of ghost octants of this rank.
    pub fn num_ghosts(&self) -> usize {
        self.ghosts.len()
    }

    /// The internal octant at the given tree index.
    pub fn octant(&self, idx: u32) -> &Octant {
        &self.octants[idx as usize]
    }

    /// The ghost octant at the given ghost index.
    pub fn ghost(&self, idx: u32) -> &GhostOctant {
        &self.ghosts[idx as usize]
    }

    /// The rank of this process in the tree communicator.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of ranks the tree is distributed over.
    pub fn n_ranks(&self) -> usize {
        self.n_ranks
    }

    /// Total number of octants across all ranks.
    pub fn global_num_octants(&self) -> u64 {
        // On a single rank the local tree is the global tree; the
        // distributed layer keeps the prefix sums up to date instead.
        self.octants.len() as u64
    }

    /// The global index of an internal octant: the per-rank prefix sum
    /// plus the local tree index. On a single rank this is the tree
    /// index itself; the distributed collectives refresh the prefix.
    pub fn global_index(&self, idx: u32) -> u64 {
        self.global_offset + idx as u64
    }

    /// The deepest level currently present in the local tree.
    pub fn max_current_level(&self) -> usize {
        self.octants
            .iter()
            .map(|octant| octant.level())
            .max()
            .unwrap_or(0)
    }

    /// The geometric tolerance of point queries.
    pub fn tol(&self) -> f64 {
        self.tol
    }

    /// Set the geometric tolerance of point queries.
    pub fn set_tol(&mut self, tol: f64) {
        self.tol = tol;
    }

    /// Restore the default geometric tolerance.
    pub fn reset_tol(&mut self) {
        self.tol = DEFAULT_TOL;
    }

    /// Move the origin of the domain.
    pub fn set_origin(&mut self, origin: Point3) {
        self.origin = origin;
    }

    /// Rescale the edge length of the domain.
    pub fn set_length(&mut self, length: f64) {
        self.length = length;
    }

    // --------------------------------------------------------------------
    // Markers
    // --------------------------------------------------------------------

    /// Request `marker` levels of refinement (positive) or coarsening
    /// (negative) for the octant at the given tree index.
    pub fn set_marker(&mut self, idx: u32, marker: i8) {
        self.octants[idx as usize].marker = marker;
    }

    /// The pending marker of the octant at the given tree index.
    pub fn marker(&self, idx: u32) -> i8 {
        self.octants[idx as usize].marker
    }

    /// Enable or disable the 2:1 constraint for the octant at the given
    /// tree index.
    pub fn set_balance(&mut self, idx: u32, enabled: bool) {
        self.octants[idx as usize].balance = enabled;
    }

    /// True if the octant at the given tree index imposes the 2:1
    /// constraint.
    pub fn balance(&self, idx: u32) -> bool {
        self.octants[idx as usize].balance
    }

    // --------------------------------------------------------------------
    // Octant geometry
    // --------------------------------------------------------------------

    /// Edge length of an octant on the given level.
    pub fn level_to_size(&self, level: usize) -> f64 {
        self.length / (1u64 << level) as f64
    }

    fn grid_spacing(&self) -> f64 {
        self.length / LEVEL_SIZE as f64
    }

    /// Edge length of an octant.
    pub fn get_size(&self, key: MortonKey) -> f64 {
        self.level_to_size(key.level())
    }

    /// Face area of an octant.
    pub fn get_area(&self, key: MortonKey) -> f64 {
        self.get_size(key).powi(self.dim as i32 - 1)
    }

    /// Volume of an octant (area in two dimensions).
    pub fn get_volume(&self, key: MortonKey) -> f64 {
        self.get_size(key).powi(self.dim as i32)
    }

    /// Center of an octant.
    pub fn get_center(&self, key: MortonKey) -> Point3 {
        let (anchor, side) = key.logical_box();
        let h = self.grid_spacing();
        let mut center = [
            self.origin[0] + (anchor[0] as f64 + side as f64 / 2.0) * h,
            self.origin[1] + (anchor[1] as f64 + side as f64 / 2.0) * h,
            self.origin[2] + (anchor[2] as f64 + side as f64 / 2.0) * h,
        ];
        if self.dim == 2 {
            center[2] = self.origin[2];
        }
        center
    }

    /// Center of a face of an octant.
    pub fn get_face_center(&self, key: MortonKey, face: usize) -> Point3 {
        let mut center = self.get_center(key);
        let half = self.get_size(key) / 2.0;
        let axis = face / 2;
        let sign = if face % 2 == 0 { -1.0 } else { 1.0 };
        center[axis] += sign * half;
        center
    }

    /// Coordinates of the k-th corner node of an octant.
    pub fn get_node(&self, key: MortonKey, node: usize) -> Point3 {
        let index = key.node_index(node);
        let h = self.grid_spacing();
        [
            self.origin[0] + index[0] as f64 * h,
            self.origin[1] + index[1] as f64 * h,
            self.origin[2] + index[2] as f64 * h,
        ]
    }

    /// Coordinates of all corner nodes of an octant.
    pub fn get_nodes(&self, key: MortonKey) -> Vec<Point3> {
        (0..self.n_nodes()).map(|k| self.get_node(key, k)).collect()
    }

    /// The Morton key of the k-th corner node of an octant in the uniform
    /// grid at the deepest level, the canonical vertex stitching key.
    pub fn get_node_morton(&self, key: MortonKey, node: usize) -> u64 {
        key.node_key(node)
    }

    /// Outward unit normal of a face.
    pub fn get_normal(&self, face: usize) -> Point3 {
        let n = FACE_NORMALS[face];
        [n[0] as f64, n[1] as f64, n[2] as f64]
    }

    /// The physical axis-aligned box of an octant.
    pub fn octant_box(&self, key: MortonKey) -> (Point3, Point3) {
        let low = self.get_node(key, 0);
        let high = self.get_node(key, self.n_nodes() - 1);
        (low, high)
    }

    /// The bounding box of the whole domain.
    pub fn bounding_box(&self) -> PhysicalBox {
        let [x, y, z] = self.origin;
        let l = self.length;
        let lz = if self.dim == 2 { 0.0 } else { l };
        PhysicalBox::new([x, y, z, x + l, y + l, z + lz])
    }

    // --------------------------------------------------------------------
    // Adaption
    // --------------------------------------------------------------------

    /// Perform one adaption step, consuming the refinement markers:
    /// markers larger than one are expanded into successive single-level
    /// refinements, marked octants are replaced by their children, fully
    /// marked sibling groups merge into their parent, and the 2:1 balance
    /// is restored by refining the coarser side until a fixpoint.
    ///
    /// Returns whether the tree changed. When `build_mapping` is set the
    /// mapping table relating post- to pre-adaption octants is kept and
    /// can be queried until the next adaption.
    pub fn adapt(&mut self, build_mapping: bool) -> bool {
        let dim = self.dim;
        let rank = self.rank;

        let mut work: Vec<WorkOctant> = self
            .octants
            .iter()
            .enumerate()
            .map(|(i, octant)| WorkOctant {
                key: octant.key,
                marker: octant.marker,
                balance: octant.balance,
                prev: vec![i as u32],
                prev_ghost: vec![false],
                prev_rank: vec![rank],
                new_refined: false,
                new_coarsened: false,
            })
            .collect();

        // Refinement. Each pass splits every positively marked octant
        // once; markers larger than one survive decremented on the
        // children, so the loop expands them into single-level steps.
        loop {
            let max_level = self.max_level();
            if !work
                .iter()
                .any(|w| w.marker > 0 && w.key.level() < max_level)
            {
                break;
            }

            let mut next = Vec::with_capacity(work.len());
            for w in work.drain(..) {
                if w.marker > 0 && w.key.level() < max_level {
                    for child in w.key.children(dim) {
                        next.push(WorkOctant {
                            key: child,
                            marker: w.marker - 1,
                            balance: w.balance,
                            prev: w.prev.clone(),
                            prev_ghost: w.prev_ghost.clone(),
                            prev_rank: w.prev_rank.clone(),
                            new_refined: true,
                            new_coarsened: false,
                        });
                    }
                } else {
                    next.push(w);
                }
            }
            work = next;
        }

        // Coarsening. A sibling group merges when every sibling is a
        // leaf of the same level, all are marked, and the merged parent
        // would not break the 2:1 constraint. Markers move one step
        // towards zero per pass so deeper coarsening requests expand the
        // same way refinements do.
        loop {
            let n_siblings = self.n_children();
            let keys = work.iter().map(|w| w.key).collect_vec();

            let mut merged_any = false;
            let mut next = Vec::with_capacity(work.len());
            let mut i = 0;
            while i < work.len() {
                if self.sibling_group_is_mergeable(&work, &keys, i) {
                    let parent = work[i].key.parent();
                    let group = &work[i..i + n_siblings];

                    let marker = group.iter().map(|w| w.marker).max().unwrap_or(0) + 1;
                    let balance = group.iter().any(|w| w.balance);
                    let mut prev = Vec::with_capacity(n_siblings);
                    let mut prev_ghost = Vec::with_capacity(n_siblings);
                    let mut prev_rank = Vec::with_capacity(n_siblings);
                    for w in group {
                        prev.extend_from_slice(&w.prev);
                        prev_ghost.extend_from_slice(&w.prev_ghost);
                        prev_rank.extend_from_slice(&w.prev_rank);
                    }

                    next.push(WorkOctant {
                        key: parent,
                        marker: marker.min(0),
                        balance,
                        prev,
                        prev_ghost,
                        prev_rank,
                        new_refined: false,
                        new_coarsened: true,
                    });
                    merged_any = true;
                    i += n_siblings;
                } else {
                    next.push(work[i].clone());
                    i += 1;
                }
            }
            work = next;

            if !merged_any {
                break;
            }
        }

        // 2:1 balance. While any balance-enabled octant has a
        // balance-enabled neighbour more than one level deeper across a
        // face, edge or vertex, the coarser side is refined.
        let mut iteration = 0;
        loop {
            let keys = work.iter().map(|w| w.key).collect_vec();
            let violating = self.find_balance_violations(&work, &keys);
            if violating.is_empty() {
                break;
            }
            iteration += 1;
            trace!(
                iteration,
                refinements = violating.len(),
                "balance pass refines coarse octants"
            );

            let mut next = Vec::with_capacity(work.len() + violating.len() * self.n_children());
            for (i, w) in work.drain(..).enumerate() {
                if violating.contains(&i) {
                    for child in w.key.children(dim) {
                        next.push(WorkOctant {
                            key: child,
                            marker: 0,
                            balance: w.balance,
                            prev: w.prev.clone(),
                            prev_ghost: w.prev_ghost.clone(),
                            prev_rank: w.prev_rank.clone(),
                            new_refined: true,
                            new_coarsened: false,
                        });
                    }
                } else {
                    next.push(w);
                }
            }
            work = next;
        }

        let changed = work.len() != self.octants.len()
            || work
                .iter()
                .zip(&self.octants)
                .any(|(w, octant)| w.key != octant.key);

        // Commit: markers are consumed by the adaption.
        self.octants = work
            .iter()
            .map(|w| Octant {
                key: w.key,
                marker: 0,
                balance: w.balance,
            })
            .collect();

        self.mapping = if build_mapping {
            let mut mapping = AdaptMapping::default();
            for w in work {
                mapping.octant_map.push(w.prev);
                mapping.ghost_flags.push(w.prev_ghost);
                mapping.octant_ranks.push(w.prev_rank);
                mapping.new_refined.push(w.new_refined);
                mapping.new_coarsened.push(w.new_coarsened);
            }
            Some(mapping)
        } else {
            None
        };
        self.sent_ranges.clear();

        changed
    }

    // True if the octants starting at `i` form a complete sibling group
    // that is marked for coarsening and may merge without violating the
    // 2:1 constraint.
    fn sibling_group_is_mergeable(
        &self,
        work: &[WorkOctant],
        keys: &[MortonKey],
        i: usize,
    ) -> bool {
        let n_siblings = self.n_children();
        let first = &work[i];
        if first.key.level() == 0
            || first.marker >= 0
            || first.key.sibling_index() != 0
            || i + n_siblings > work.len()
        {
            return false;
        }

        let parent = first.key.parent();
        let group_complete = work[i..i + n_siblings].iter().all(|w| {
            w.marker < 0 && w.key.level() == first.key.level() && w.key.parent() == parent
        });
        if !group_complete {
            return false;
        }

        // Balance compatibility: the parent must not end up adjacent to a
        // leaf more than one level deeper.
        let group_balance = work[i..i + n_siblings].iter().any(|w| w.balance);
        if !group_balance {
            return true;
        }

        let parent_level = parent.level();
        !self.any_adjacent_leaf(keys, parent, |j| {
            work[j].balance && keys[j].level() > parent_level + 1
        })
    }

    // Indices of work octants that violate the 2:1 constraint and must be
    // refined (the coarser side of each violating pair).
    fn find_balance_violations(&self, work: &[WorkOctant], keys: &[MortonKey]) -> Vec<usize> {
        let mut violating = Vec::new();
        for (i, w) in work.iter().enumerate() {
            if !w.balance {
                continue;
            }
            let level = w.key.level();
            if self.any_adjacent_leaf(keys, w.key, |j| {
                work[j].balance && keys[j].level() > level + 1
            }) {
                violating.push(i);
            }
        }
        violating
    }

    // True if any leaf adjacent to `key` across a face, edge or vertex
    // satisfies the predicate.
    fn any_adjacent_leaf<F: Fn(usize) -> bool>(
        &self,
        keys: &[MortonKey],
        key: MortonKey,
        predicate: F,
    ) -> bool {
        let mut codims = vec![1, self.dim];
        if self.dim == 3 {
            codims.push(2);
        }

        for codim in codims {
            for entity in 0..self.entity_count(codim) {
                let found = self
                    .adjacent_leaves(keys, key, entity, codim)
                    .into_iter()
                    .any(&predicate);
                if found {
                    return true;
                }
            }
        }
        false
    }

    // --------------------------------------------------------------------
    // Mapping queries
    // --------------------------------------------------------------------

    /// True if the last adaption kept its mapping table.
    pub fn has_mapping(&self) -> bool {
        self.mapping.is_some()
    }

    /// The mapping entry of a post-adaption tree index: the pre-adaption
    /// tree indices it derives from, whether each was a ghost, and the
    /// rank that owned it.
    pub fn get_mapping(&self, idx: u32) -> Option<(&[u32], &[bool], &[usize])> {
        let mapping = self.mapping.as_ref()?;
        let idx = idx as usize;
        Some((
            &mapping.octant_map[idx],
            &mapping.ghost_flags[idx],
            &mapping.octant_ranks[idx],
        ))
    }

    /// True if the octant was produced by refining a pre-existing octant
    /// in the last adaption.
    pub fn is_new_refined(&self, idx: u32) -> bool {
        self.mapping
            .as_ref()
            .map(|mapping| mapping.new_refined[idx as usize])
            .unwrap_or(false)
    }

    /// True if the octant was produced by a coarsening merge in the last
    /// adaption.
    pub fn is_new_coarsened(&self, idx: u32) -> bool {
        self.mapping
            .as_ref()
            .map(|mapping| mapping.new_coarsened[idx as usize])
            .unwrap_or(false)
    }

    /// The pre-move local index ranges shipped to each destination rank by
    /// the last load balance, as up to two `[begin, end)` pairs.
    pub fn sent_ranges(&self) -> &HashMap<usize, [u32; 4]> {
        &self.sent_ranges
    }

    // --------------------------------------------------------------------
    // Neighbour search
    // --------------------------------------------------------------------

    /// Number of codimension-`codim` entities of an octant.
    pub fn entity_count(&self, codim: usize) -> usize {
        if codim == 1 {
            self.n_faces()
        } else if codim == self.dim {
            self.n_nodes()
        } else if codim == 2 && self.dim == 3 {
            self.n_edges()
        } else {
            0
        }
    }

    // Search direction of the entity: the face normal, the edge
    // diagonal, or the node diagonal.
    fn entity_direction(&self, entity: usize, codim: usize) -> [i64; 3] {
        if codim == 1 {
            FACE_NORMALS[entity]
        } else if codim == self.dim {
            if self.dim == 2 {
                NODE_COEFFS_2D[entity]
            } else {
                NODE_COEFFS_3D[entity]
            }
        } else {
            EDGE_COEFFS_3D[entity]
        }
    }

    // The closed logical box of the entity on the deepest-level grid;
    // degenerate in the directions the entity is pinned.
    fn entity_box(&self, key: MortonKey, direction: [i64; 3]) -> ([u64; 3], [u64; 3]) {
        let (anchor, side) = key.logical_box();
        let mut low = anchor;
        let mut high = [anchor[0] + side, anchor[1] + side, anchor[2] + side];
        if self.dim == 2 {
            high[2] = anchor[2];
        }
        for d in 0..3 {
            match direction[d] {
                -1 => high[d] = anchor[d],
                1 => {
                    low[d] = high[d];
                }
                _ => {}
            }
        }
        (low, high)
    }

    // Leaves of a sorted key array adjacent to the given entity of `key`:
    // either the single leaf covering the same-level neighbour region, or
    // every descendant of that region whose box touches the entity.
    fn adjacent_leaves(
        &self,
        keys: &[MortonKey],
        key: MortonKey,
        entity: usize,
        codim: usize,
    ) -> Vec<usize> {
        let direction = self.entity_direction(entity, codim);
        let Some(neighbour) = key.neighbour(direction, self.dim) else {
            return Vec::new();
        };
        let (entity_low, entity_high) = self.entity_box(key, direction);

        let mut found = Vec::new();

        // Position of the first key greater than the neighbour region.
        let start = keys.partition_point(|k| k.value() <= neighbour.value());

        // The leaf just before is the unique covering leaf if it is an
        // ancestor (or the neighbour itself).
        if start > 0 && keys[start - 1].is_ancestor(neighbour) {
            found.push(start - 1);
            return found;
        }

        // Otherwise scan the Morton range of the region for descendants
        // that touch the entity.
        let upper = neighbour.descendant_upper_bound(self.dim);
        for (offset, leaf) in keys[start..].iter().enumerate() {
            if leaf.value() > upper {
                break;
            }
            let (anchor, side) = leaf.logical_box();
            let touches = (0..3).all(|d| {
                let leaf_high = if d == 2 && self.dim == 2 {
                    anchor[d]
                } else {
                    anchor[d] + side
                };
                anchor[d] <= entity_high[d] && leaf_high >= entity_low[d]
            });
            if touches {
                found.push(start + offset);
            }
        }

        found
    }

    /// Enumerate the neighbours of an internal octant across a face
    /// (`codim` 1), an edge (`codim` 2, three dimensions only) or a
    /// vertex (`codim` equal to the dimension). Returns the tree indices
    /// of the neighbours and, for each, whether it is a ghost.
    ///
    /// The union of the returned octants covers the full adjacency of the
    /// entity, including hanging coarse-fine neighbours.
    pub fn find_neighbours(
        &self,
        idx: u32,
        entity: usize,
        codim: usize,
    ) -> (Vec<u32>, Vec<bool>) {
        self.find_key_neighbours(self.octants[idx as usize].key, entity, codim)
    }

    /// Enumerate the neighbours of a ghost octant, as
    /// [`Octree::find_neighbours`] does for internal octants.
    pub fn find_ghost_neighbours(
        &self,
        idx: u32,
        entity: usize,
        codim: usize,
    ) -> (Vec<u32>, Vec<bool>) {
        self.find_key_neighbours(self.ghosts[idx as usize].key, entity, codim)
    }

    fn find_key_neighbours(
        &self,
        key: MortonKey,
        entity: usize,
        codim: usize,
    ) -> (Vec<u32>, Vec<bool>) {
        debug_assert!(codim >= 1 && codim <= self.dim);
        debug_assert!(entity < self.entity_count(codim));

        let mut ids = Vec::new();
        let mut ghost_flags = Vec::new();

        let internal_keys = self.octants.iter().map(|o| o.key).collect_vec();
        for idx in self.adjacent_leaves(&internal_keys, key, entity, codim) {
            // The octant itself can cover its own neighbour region only
            // through a search bug; guard in debug builds.
            debug_assert!(internal_keys[idx] != key);
            ids.push(idx as u32);
            ghost_flags.push(false);
        }

        if !self.ghosts.is_empty() {
            let ghost_keys = self.ghosts.iter().map(|g| g.key).collect_vec();
            for idx in self.adjacent_leaves(&ghost_keys, key, entity, codim) {
                ids.push(idx as u32);
                ghost_flags.push(true);
            }
        }

        (ids, ghost_flags)
    }

    // --------------------------------------------------------------------
    // Point location
    // --------------------------------------------------------------------

    /// The tree index of the internal octant containing the point, or
    /// `None` when the point lies outside the domain (or inside another
    /// rank's range). The containment test is inflated by the tree
    /// tolerance.
    pub fn get_point_owner(&self, point: &Point3) -> Option<u32> {
        let h = self.grid_spacing();
        let mut index = [0usize; 3];
        for d in 0..self.dim {
            let offset = point[d] - self.origin[d];
            if offset < -self.tol || offset > self.length + self.tol {
                return None;
            }
            let logical = (offset / h).floor();
            index[d] = (logical.max(0.0) as u64).min(LEVEL_SIZE - 1) as usize;
        }

        let key = MortonKey::from_index_and_level(index, self.max_level());
        let position = self
            .octants
            .partition_point(|octant| octant.key.value() <= key.value());
        if position == 0 {
            return None;
        }

        let candidate = position as u32 - 1;
        self.octants[candidate as usize]
            .key
            .is_ancestor(key)
            .then_some(candidate)
    }

    // --------------------------------------------------------------------
    // Partition
    // --------------------------------------------------------------------

    /// The first internal key of every rank, describing the global Morton
    /// partition.
    pub fn partition_first_keys(&self) -> &[MortonKey] {
        &self.partition_first_keys
    }

    /// The rank owning the given key.
    pub fn key_owner_rank(&self, key: MortonKey) -> usize {
        let position = self
            .partition_first_keys
            .partition_point(|first| first.value() <= key.value());
        position.saturating_sub(1)
    }

    /// Reshuffle octants so every rank holds a contiguous Morton range of
    /// approximately equal weight. On a single rank this is a no-op with
    /// an empty transfer map; the distributed implementation lives behind
    /// the `mpi` feature.
    #[cfg(not(feature = "mpi"))]
    pub fn load_balance(&mut self, _weights: Option<&[f64]>) -> Result<()> {
        self.sent_ranges.clear();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tree_2d() -> Octree {
        Octree::new(2, [0.0, 0.0, 0.0], 1.0).unwrap()
    }

    fn tree_3d() -> Octree {
        Octree::new(3, [0.0, 0.0, 0.0], 1.0).unwrap()
    }

    fn total_volume(tree: &Octree) -> f64 {
        (0..tree.num_octants() as u32)
            .map(|i| tree.get_volume(tree.octant(i).key()))
            .sum()
    }

    #[test]
    fn test_new_rejects_bad_arguments() {
        assert!(Octree::new(1, [0.0; 3], 1.0).is_err());
        assert!(Octree::new(4, [0.0; 3], 1.0).is_err());
        assert!(Octree::new(3, [0.0; 3], 0.0).is_err());
    }

    #[test]
    fn test_refine_root() {
        let mut tree = tree_3d();
        tree.set_marker(0, 1);
        assert!(tree.adapt(true));

        assert_eq!(tree.num_octants(), 8);
        for i in 0..8u32 {
            assert_eq!(tree.octant(i).level(), 1);
            assert_eq!(tree.marker(i), 0);
            assert!(tree.is_new_refined(i));
            let (map, ghosts, ranks) = tree.get_mapping(i).unwrap();
            assert_eq!(map, &[0]);
            assert_eq!(ghosts, &[false]);
            assert_eq!(ranks, &[0]);
        }

        // Octants stay Morton sorted and tile the domain.
        for i in 1..tree.num_octants() {
            assert!(tree.octant(i as u32 - 1).key() < tree.octant(i as u32).key());
        }
        assert!((total_volume(&tree) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_multi_level_marker_expands() {
        let mut tree = tree_2d();
        tree.set_marker(0, 2);
        assert!(tree.adapt(true));

        assert_eq!(tree.num_octants(), 16);
        for i in 0..16u32 {
            assert_eq!(tree.octant(i).level(), 2);
            // The whole cascade maps back to the original root octant.
            let (map, _, _) = tree.get_mapping(i).unwrap();
            assert_eq!(map, &[0]);
        }
        assert!((total_volume(&tree) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_adapt_without_changes() {
        let mut tree = tree_3d();
        assert!(!tree.adapt(true));
        assert_eq!(tree.num_octants(), 1);
    }

    #[test]
    fn test_refine_then_coarsen_roundtrip() {
        let mut tree = tree_2d();
        tree.set_marker(0, 1);
        tree.adapt(false);
        assert_eq!(tree.num_octants(), 4);

        for i in 0..4u32 {
            tree.set_marker(i, -1);
        }
        assert!(tree.adapt(true));

        assert_eq!(tree.num_octants(), 1);
        assert_eq!(tree.octant(0).level(), 0);
        assert!(tree.is_new_coarsened(0));
        let (map, _, _) = tree.get_mapping(0).unwrap();
        assert_eq!(map, &[0, 1, 2, 3]);
    }

    #[test]
    fn test_partial_coarsening_group_is_kept() {
        let mut tree = tree_2d();
        tree.set_marker(0, 1);
        tree.adapt(false);

        // Marking only three of four siblings must not coarsen anything.
        for i in 0..3u32 {
            tree.set_marker(i, -1);
        }
        assert!(!tree.adapt(true));
        assert_eq!(tree.num_octants(), 4);
    }

    #[test]
    fn test_renumbering_mapping() {
        let mut tree = tree_2d();
        tree.set_marker(0, 1);
        tree.adapt(false);

        // Refining the first quadrant shifts the remaining three.
        tree.set_marker(0, 1);
        tree.adapt(true);
        assert_eq!(tree.num_octants(), 7);

        for i in 0..4u32 {
            assert!(tree.is_new_refined(i));
        }
        for (post, pre) in [(4u32, 1u32), (5, 2), (6, 3)] {
            assert!(!tree.is_new_refined(post));
            let (map, _, _) = tree.get_mapping(post).unwrap();
            assert_eq!(map, &[pre]);
        }
    }

    #[test]
    fn test_balance_refines_coarse_side() {
        let mut tree = tree_2d();
        tree.set_marker(0, 1);
        tree.adapt(false);

        // Refine the first quadrant twice; the neighbours lag three levels
        // behind and must be split by the balance pass.
        tree.set_marker(0, 2);
        tree.adapt(false);

        for i in 0..tree.num_octants() {
            let i = i as u32;
            let level = tree.octant(i).level();
            for codim in [1, 2] {
                for entity in 0..tree.entity_count(codim) {
                    let (ids, ghosts) = tree.find_neighbours(i, entity, codim);
                    assert!(ghosts.iter().all(|&g| !g));
                    for id in ids {
                        let neighbour_level = tree.octant(id).level();
                        assert!(
                            neighbour_level.abs_diff(level) <= 1,
                            "octants {i} and {id} violate the 2:1 balance"
                        );
                    }
                }
            }
        }
        assert!((total_volume(&tree) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_balance_disabled_leaves_tree_alone() {
        let mut tree = tree_2d();
        tree.set_balance(0, false);
        tree.set_marker(0, 1);
        tree.adapt(false);

        for i in 0..4u32 {
            tree.set_balance(i, false);
        }
        tree.set_marker(0, 2);
        tree.adapt(false);

        // Without the constraint the lagging neighbours survive: the three
        // untouched quadrants plus the refined cluster.
        assert_eq!(tree.num_octants(), 3 + 16);
    }

    #[test]
    fn test_face_neighbours_cover_hanging_faces() {
        let mut tree = tree_2d();
        tree.set_marker(0, 1);
        tree.adapt(false);
        tree.set_marker(0, 1);
        tree.adapt(false);
        // Quadrant 0 is split into four level-2 octants (indices 0..4);
        // its +x face neighbour at level 1 sits at index 4.
        let coarse = 4u32;
        assert_eq!(tree.octant(coarse).level(), 1);

        // The -x face of the coarse octant sees both fine octants.
        let (ids, _) = tree.find_neighbours(coarse, 0, 1);
        assert_eq!(ids.len(), 2);
        for id in &ids {
            assert_eq!(tree.octant(*id).level(), 2);
        }

        // And each fine octant sees the coarse one across its +x face.
        for &id in &ids {
            let (back, _) = tree.find_neighbours(id, 1, 1);
            assert_eq!(back, vec![coarse]);
        }
    }

    #[test]
    fn test_vertex_neighbours_3d() {
        let mut tree = tree_3d();
        tree.set_marker(0, 1);
        tree.adapt(false);

        // Octant 0 at the origin touches octant 7 across its far vertex.
        let (ids, _) = tree.find_neighbours(0, 7, 3);
        assert_eq!(ids, vec![7]);

        // And octant 7 sees octant 0 across the opposite vertex.
        let (ids, _) = tree.find_neighbours(7, 0, 3);
        assert_eq!(ids, vec![0]);
    }

    #[test]
    fn test_edge_neighbours_3d() {
        let mut tree = tree_3d();
        tree.set_marker(0, 1);
        tree.adapt(false);

        // Octant 0 and octant 6 share the edge in the (-x from 6) (+y +z
        // from 0) diagonal: edge 11 of octant 0 points (0, 1, 1).
        let (ids, _) = tree.find_neighbours(0, 11, 2);
        assert_eq!(ids, vec![6]);
    }

    #[test]
    fn test_domain_boundary_has_no_neighbours() {
        let tree = tree_3d();
        for face in 0..6 {
            let (ids, _) = tree.find_neighbours(0, face, 1);
            assert!(ids.is_empty());
        }
    }

    #[test]
    fn test_point_owner() {
        let mut tree = tree_2d();
        tree.set_marker(0, 1);
        tree.adapt(false);

        // Quadrant centres in Morton order.
        let centres = [
            [0.25, 0.25, 0.0],
            [0.75, 0.25, 0.0],
            [0.25, 0.75, 0.0],
            [0.75, 0.75, 0.0],
        ];
        for (i, centre) in centres.iter().enumerate() {
            assert_eq!(tree.get_point_owner(centre), Some(i as u32));
        }

        assert!(tree.get_point_owner(&[1.5, 0.5, 0.0]).is_none());
        assert!(tree.get_point_owner(&[-0.1, 0.5, 0.0]).is_none());

        // The tolerance inflates the domain.
        tree.set_tol(0.2);
        assert_eq!(tree.get_point_owner(&[-0.1, 0.5, 0.0]), Some(2));
    }

    #[test]
    fn test_octant_geometry() {
        let mut tree = tree_3d();
        tree.set_marker(0, 1);
        tree.adapt(false);

        let key = tree.octant(0).key();
        assert!((tree.get_size(key) - 0.5).abs() < 1e-14);
        assert!((tree.get_area(key) - 0.25).abs() < 1e-14);
        assert!((tree.get_volume(key) - 0.125).abs() < 1e-14);

        let centre = tree.get_center(key);
        assert_eq!(centre, [0.25, 0.25, 0.25]);

        let face_centre = tree.get_face_center(key, 1);
        assert_eq!(face_centre, [0.5, 0.25, 0.25]);

        assert_eq!(tree.get_node(key, 0), [0.0, 0.0, 0.0]);
        assert_eq!(tree.get_node(key, 7), [0.5, 0.5, 0.5]);

        assert_eq!(tree.get_normal(3), [0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_node_morton_matches_between_octants() {
        let mut tree = tree_2d();
        tree.set_marker(0, 1);
        tree.adapt(false);

        // The shared corner of all four quadrants carries one key.
        let shared: Vec<u64> = [(0u32, 3usize), (1, 2), (2, 1), (3, 0)]
            .iter()
            .map(|&(idx, node)| tree.get_node_morton(tree.octant(idx).key(), node))
            .collect();
        assert!(shared.windows(2).all(|w| w[0] == w[1]));
    }
}
