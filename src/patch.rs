//! The octree patch: cells, vertices and interfaces mirroring the tree.
//!
//! The octree owns the topology; the patch mirrors it as addressable
//! entities. Cells are created one to one with octants and linked to
//! them through the cell/octant maps, vertices are uniquified by the
//! Morton key of the owning octant corner (the stitch map), and
//! interfaces make every face connection explicit. After each adaption
//! the patch diff-reconciles itself against the tree using the mapping
//! table and reports the changes as a stream of adaption events.
//!
//! All mutation follows a two-phase protocol: ids are collected first,
//! containers are mutated second, and the pierced containers are flushed
//! at the end of each sync.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, trace};

use crate::adaption::{AdaptionEntity, AdaptionEvent, AdaptionTracker, AdaptionType};
use crate::constants::{
    EDGE_FACES_3D, NODE_EDGES_3D, NODE_FACES_2D, NODE_FACES_3D, OPPOSITE_FACE,
};
use crate::element::ElementType;
use crate::error::{MeshError, Result};
use crate::flat_vec::FlatVec2D;
use crate::geometry::Point3;
use crate::morton::MortonKey;
use crate::octree::Octree;
use crate::pierced::PiercedVector;

/// A mesh vertex.
#[derive(Debug, Clone, Copy)]
pub struct Vertex {
    coords: Point3,
}

impl Vertex {
    /// The coordinates of the vertex.
    pub fn coords(&self) -> Point3 {
        self.coords
    }
}

/// A volumetric cell.
///
/// The per-face adjacency and interface lists live in flat ragged arrays
/// with one slot per face; an empty adjacency run marks a border face, a
/// run with more than one entry marks a hanging coarse-fine face.
#[derive(Debug, Clone)]
pub struct Cell {
    id: i64,
    element_type: ElementType,
    connect: Vec<i64>,
    interior: bool,
    adjacencies: FlatVec2D<i64>,
    interfaces: FlatVec2D<i64>,
}

impl Cell {
    fn new(id: i64, element_type: ElementType, connect: Vec<i64>, interior: bool) -> Self {
        let n_faces = element_type.info().n_faces;
        Self {
            id,
            element_type,
            connect,
            interior,
            adjacencies: FlatVec2D::new(n_faces),
            interfaces: FlatVec2D::new(n_faces),
        }
    }

    /// The id of the cell.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The shape of the cell.
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// The vertex ids of the cell, in reference order.
    pub fn connectivity(&self) -> &[i64] {
        &self.connect
    }

    /// The id of the k-th vertex of the cell.
    pub fn vertex(&self, k: usize) -> i64 {
        self.connect[k]
    }

    /// True if the cell is interior (owned by this rank).
    pub fn is_interior(&self) -> bool {
        self.interior
    }

    /// Number of faces of the cell.
    pub fn face_count(&self) -> usize {
        self.adjacencies.n_slots()
    }

    /// The neighbour cell ids across the given face.
    pub fn adjacencies(&self, face: usize) -> &[i64] {
        self.adjacencies.slot(face)
    }

    /// The interface ids of the given face.
    pub fn interfaces(&self, face: usize) -> &[i64] {
        self.interfaces.slot(face)
    }

    /// All interface ids of the cell.
    pub fn interface_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.interfaces.iter().copied()
    }

    /// True if the face has no neighbour.
    pub fn is_face_border(&self, face: usize) -> bool {
        self.adjacencies.count(face) == 0
    }

    /// Size in bytes of the binary representation.
    pub fn binary_size(&self) -> usize {
        std::mem::size_of::<u8>()
            + std::mem::size_of::<i64>()
            + std::mem::size_of::<u32>()
            + std::mem::size_of::<i64>() * self.connect.len()
            + self.interfaces.binary_size()
            + self.adjacencies.binary_size()
    }

    /// Append the cell stream representation to `buffer`: the element
    /// payload (shape tag, id, connectivity) followed by the interface
    /// and adjacency ragged blocks. No framing is added.
    pub fn write_binary(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.element_type.tag());
        buffer.extend_from_slice(&self.id.to_le_bytes());
        buffer.extend_from_slice(&(self.connect.len() as u32).to_le_bytes());
        for &vertex in &self.connect {
            buffer.extend_from_slice(&vertex.to_le_bytes());
        }
        self.interfaces.write_binary(buffer);
        self.adjacencies.write_binary(buffer);
    }

    /// Read a cell back from the front of `buffer`, advancing it. The
    /// interior flag is not part of the stream and is up to the caller.
    pub fn read_binary(buffer: &mut &[u8], interior: bool) -> Result<Cell> {
        fn truncated() -> MeshError {
            MeshError::InvalidArgument("truncated cell stream".to_string())
        }

        let (&tag, rest) = buffer.split_first().ok_or_else(truncated)?;
        *buffer = rest;
        let element_type = ElementType::from_tag(tag)
            .ok_or_else(|| MeshError::InvalidArgument(format!("unknown element tag {tag}")))?;

        let (head, rest) = buffer.split_first_chunk::<8>().ok_or_else(truncated)?;
        *buffer = rest;
        let id = i64::from_le_bytes(*head);

        let (head, rest) = buffer.split_first_chunk::<4>().ok_or_else(truncated)?;
        *buffer = rest;
        let n_connect = u32::from_le_bytes(*head) as usize;

        let mut connect = Vec::with_capacity(n_connect);
        for _ in 0..n_connect {
            let (head, rest) = buffer.split_first_chunk::<8>().ok_or_else(truncated)?;
            *buffer = rest;
            connect.push(i64::from_le_bytes(*head));
        }

        let interfaces = FlatVec2D::read_binary(buffer).ok_or_else(truncated)?;
        let adjacencies = FlatVec2D::read_binary(buffer).ok_or_else(truncated)?;

        Ok(Cell {
            id,
            element_type,
            connect,
            interior,
            adjacencies,
            interfaces,
        })
    }
}

/// An explicit codimension-one entity between two cells, or between a
/// cell and the domain boundary.
#[derive(Debug, Clone)]
pub struct Interface {
    id: i64,
    element_type: ElementType,
    connect: Vec<i64>,
    owner: i64,
    owner_face: usize,
    neigh: Option<(i64, usize)>,
}

impl Interface {
    /// The id of the interface.
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The shape of the interface.
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }

    /// The vertex ids of the interface, in the owner's face-local order.
    pub fn connectivity(&self) -> &[i64] {
        &self.connect
    }

    /// The owner cell: the finer cell on a hanging face, the lower id on
    /// a conforming face.
    pub fn owner(&self) -> i64 {
        self.owner
    }

    /// The local face index of the interface in the owner cell.
    pub fn owner_face(&self) -> usize {
        self.owner_face
    }

    /// The neighbour cell and its local face index, `None` on a border.
    pub fn neigh(&self) -> Option<(i64, usize)> {
        self.neigh
    }

    /// True if the interface sits on the domain boundary.
    pub fn is_border(&self) -> bool {
        self.neigh.is_none()
    }
}

// The last operation applied to the octree, deciding how a sync
// interprets the mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TreeOperation {
    Initialization,
    AdaptionMapped,
    AdaptionUnmapped,
    #[allow(dead_code)]
    LoadBalance,
}

// A reference to an octant: its tree index inside the internal or ghost
// array.
#[derive(Debug, Clone, Copy)]
struct OctantInfo {
    tree_idx: u32,
    internal: bool,
}

// A cell scheduled for deletion, with the adaption that caused it.
#[derive(Debug, Clone, Copy)]
struct DeleteInfo {
    cell_id: i64,
    trigger: AdaptionType,
    rank: usize,
}

/// An octree-backed volumetric patch over a cubic domain.
pub struct OctreePatch {
    id: i32,
    dim: usize,
    tree: Octree,
    cells: PiercedVector<Cell>,
    vertices: PiercedVector<Vertex>,
    interfaces: PiercedVector<Interface>,
    cell_to_octant: HashMap<i64, u32>,
    octant_to_cell: HashMap<u32, i64>,
    cell_to_ghost: HashMap<i64, u32>,
    ghost_to_cell: HashMap<u32, i64>,
    ghost_owners: HashMap<i64, usize>,
    next_cell_id: i64,
    // Per-level geometry, rebuilt on scaling.
    level_size: Vec<f64>,
    level_area: Vec<f64>,
    level_volume: Vec<f64>,
    // Outward normals indexed by local face.
    normals: Vec<Point3>,
    cell_type: ElementType,
    interface_type: ElementType,
    last_op: TreeOperation,
    // Ghost exchange tables: ordered cell id lists per neighbouring rank.
    exchange_sources: HashMap<usize, Vec<i64>>,
    exchange_targets: HashMap<usize, Vec<i64>>,
}

impl OctreePatch {
    /// Create a patch over the cubic domain `[origin, origin + length]`.
    ///
    /// The tree is uniformly refined until cells are no larger than
    /// `dh_initial_cell_size` and all octants are imported as cells.
    pub fn new(
        id: i32,
        dimension: usize,
        origin: Point3,
        length: f64,
        dh_initial_cell_size: f64,
    ) -> Result<Self> {
        let mut tree = Octree::new(dimension, origin, length)?;
        if !(dh_initial_cell_size > 0.0) {
            return Err(MeshError::InvalidArgument(format!(
                "initial cell size must be positive, got {dh_initial_cell_size}"
            )));
        }

        debug!(id, dimension, "initializing octree patch");

        let initial_level = (length / dh_initial_cell_size).max(1.0).log2().ceil() as i8;
        tree.set_marker(0, initial_level);
        tree.adapt(false);

        let (cell_type, interface_type) = if dimension == 3 {
            (ElementType::Voxel, ElementType::Pixel)
        } else {
            (ElementType::Pixel, ElementType::Line)
        };

        let mut normals = Vec::with_capacity(2 * dimension);
        for axis in 0..dimension {
            for sign in [-1.0, 1.0] {
                let mut normal = [0.0; 3];
                normal[axis] = sign;
                normals.push(normal);
            }
        }

        let mut patch = Self {
            id,
            dim: dimension,
            tree,
            cells: PiercedVector::new(),
            vertices: PiercedVector::new(),
            interfaces: PiercedVector::new(),
            cell_to_octant: HashMap::new(),
            octant_to_cell: HashMap::new(),
            cell_to_ghost: HashMap::new(),
            ghost_to_cell: HashMap::new(),
            ghost_owners: HashMap::new(),
            next_cell_id: 0,
            level_size: Vec::new(),
            level_area: Vec::new(),
            level_volume: Vec::new(),
            normals,
            cell_type,
            interface_type,
            last_op: TreeOperation::Initialization,
            exchange_sources: HashMap::new(),
            exchange_targets: HashMap::new(),
        };
        patch.initialize_tree_geometry();
        patch.sync(false)?;

        Ok(patch)
    }

    // Rebuild the per-level size, area and volume tables.
    fn initialize_tree_geometry(&mut self) {
        let n_levels = self.tree.max_level() + 1;

        self.level_size.clear();
        self.level_area.clear();
        self.level_volume.clear();
        self.level_size.reserve(n_levels);
        self.level_area.reserve(n_levels);
        self.level_volume.reserve(n_levels);

        for level in 0..n_levels {
            let size = self.tree.level_to_size(level);
            self.level_size.push(size);
            self.level_area.push(size.powi(self.dim as i32 - 1));
            self.level_volume.push(size.powi(self.dim as i32));
        }
    }

    // --------------------------------------------------------------------
    // Basic accessors
    // --------------------------------------------------------------------

    /// The id of the patch.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// The dimension of the patch, 2 or 3.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The underlying octree.
    pub fn tree(&self) -> &Octree {
        &self.tree
    }

    /// Number of cells, interior and ghost.
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Number of interior cells.
    pub fn internal_cell_count(&self) -> usize {
        self.cell_to_octant.len()
    }

    /// Number of ghost cells.
    pub fn ghost_cell_count(&self) -> usize {
        self.cell_to_ghost.len()
    }

    /// Number of vertices.
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of interfaces.
    pub fn interface_count(&self) -> usize {
        self.interfaces.len()
    }

    /// The cell with the given id.
    pub fn cell(&self, id: i64) -> Result<&Cell> {
        self.cells.get(id).ok_or(MeshError::NotFound(id))
    }

    /// The vertex with the given id.
    pub fn vertex(&self, id: i64) -> Result<&Vertex> {
        self.vertices.get(id).ok_or(MeshError::NotFound(id))
    }

    /// The interface with the given id.
    pub fn interface(&self, id: i64) -> Result<&Interface> {
        self.interfaces.get(id).ok_or(MeshError::NotFound(id))
    }

    /// Iterate over all cells as `(id, cell)` pairs.
    pub fn cells(&self) -> impl Iterator<Item = (i64, &Cell)> {
        self.cells.iter()
    }

    /// Iterate over all vertices as `(id, vertex)` pairs.
    pub fn vertices(&self) -> impl Iterator<Item = (i64, &Vertex)> {
        self.vertices.iter()
    }

    /// Iterate over all interfaces as `(id, interface)` pairs.
    pub fn interfaces(&self) -> impl Iterator<Item = (i64, &Interface)> {
        self.interfaces.iter()
    }

    /// The coordinates of a vertex.
    pub fn vertex_coords(&self, id: i64) -> Result<Point3> {
        Ok(self.vertex(id)?.coords())
    }

    /// The owning rank of a ghost cell.
    pub fn ghost_owner(&self, id: i64) -> Option<usize> {
        self.ghost_owners.get(&id).copied()
    }

    /// Ordered id lists of the interior cells whose data each
    /// neighbouring rank needs during field exchange.
    pub fn exchange_sources(&self) -> &HashMap<usize, Vec<i64>> {
        &self.exchange_sources
    }

    /// Ordered id lists of the ghost cells receiving data from each
    /// neighbouring rank during field exchange.
    pub fn exchange_targets(&self) -> &HashMap<usize, Vec<i64>> {
        &self.exchange_targets
    }

    // --------------------------------------------------------------------
    // Cell-octant association
    // --------------------------------------------------------------------

    fn cell_octant(&self, id: i64) -> Option<OctantInfo> {
        if let Some(&tree_idx) = self.cell_to_octant.get(&id) {
            return Some(OctantInfo {
                tree_idx,
                internal: true,
            });
        }
        self.cell_to_ghost.get(&id).map(|&tree_idx| OctantInfo {
            tree_idx,
            internal: false,
        })
    }

    fn octant_cell_id(&self, info: OctantInfo) -> Option<i64> {
        if info.internal {
            self.octant_to_cell.get(&info.tree_idx).copied()
        } else {
            self.ghost_to_cell.get(&info.tree_idx).copied()
        }
    }

    fn octant_key(&self, info: OctantInfo) -> MortonKey {
        if info.internal {
            self.tree.octant(info.tree_idx).key()
        } else {
            self.tree.ghost(info.tree_idx).key()
        }
    }

    fn cell_key(&self, id: i64) -> Result<MortonKey> {
        let info = self.cell_octant(id).ok_or(MeshError::NotFound(id))?;
        Ok(self.octant_key(info))
    }

    /// The refinement level of a cell.
    pub fn cell_level(&self, id: i64) -> Result<usize> {
        Ok(self.cell_key(id)?.level())
    }

    // --------------------------------------------------------------------
    // Markers
    // --------------------------------------------------------------------

    /// Mark a cell for refinement. Returns whether the marker was
    /// accepted; markers on ghost or unknown cells are rejected.
    pub fn mark_cell_for_refinement(&mut self, id: i64) -> bool {
        self.set_cell_marker(id, 1)
    }

    /// Mark a cell for coarsening. Returns whether the marker was
    /// accepted; markers on ghost or unknown cells are rejected.
    pub fn mark_cell_for_coarsening(&mut self, id: i64) -> bool {
        self.set_cell_marker(id, -1)
    }

    fn set_cell_marker(&mut self, id: i64, marker: i8) -> bool {
        let Some(info) = self.cell_octant(id) else {
            return false;
        };
        if !info.internal {
            return false;
        }
        self.tree.set_marker(info.tree_idx, marker);
        true
    }

    /// Enable or disable the 2:1 constraint for a cell. Returns whether
    /// the change was accepted.
    pub fn enable_cell_balancing(&mut self, id: i64, enabled: bool) -> bool {
        let Some(info) = self.cell_octant(id) else {
            return false;
        };
        if !info.internal {
            return false;
        }
        self.tree.set_balance(info.tree_idx, enabled);
        true
    }

    // --------------------------------------------------------------------
    // Adaption
    // --------------------------------------------------------------------

    /// Redistribute cells across ranks so every rank carries roughly the
    /// same weight, and synchronise the patch with the new partition.
    /// Weights default to one per cell, given in internal octant order.
    #[cfg(feature = "mpi")]
    pub fn update_partition<C: mpi::traits::CommunicatorCollectives>(
        &mut self,
        weights: Option<&[f64]>,
        track: bool,
        comm: &C,
    ) -> Result<Vec<AdaptionEvent>> {
        debug!(patch = self.id, "load balancing patch");

        self.tree.load_balance(weights, comm)?;
        self.last_op = TreeOperation::LoadBalance;
        self.sync(track)
    }

    /// Apply the pending markers: adapt the octree and synchronise the
    /// patch. Returns the adaption events when `track` is set, an empty
    /// list when nothing changed.
    pub fn update_adaption(&mut self, track: bool) -> Result<Vec<AdaptionEvent>> {
        debug!(patch = self.id, "adapting tree");

        let build_mapping = !self.cells.is_empty();
        let updated = self.tree.adapt(build_mapping);
        self.last_op = if build_mapping {
            TreeOperation::AdaptionMapped
        } else {
            TreeOperation::AdaptionUnmapped
        };

        if !updated {
            trace!(patch = self.id, "tree already up to date");
            return Ok(Vec::new());
        }

        self.sync(track)
    }

    // Synchronise the patch with the octree after an adaption or a
    // partition change, optionally tracking the changes.
    fn sync(&mut self, track: bool) -> Result<Vec<AdaptionEvent>> {
        debug!(patch = self.id, "syncing patch");

        // If the patch is empty every octant is imported from scratch.
        let import_all = self.cells.is_empty();

        if self.last_op == TreeOperation::AdaptionUnmapped && !import_all {
            return Err(MeshError::InconsistentState(
                "cannot sync the patch after an unmapped adaption".to_string(),
            ));
        }

        let n_octants = self.tree.num_octants() as u32;
        let n_previous = self.octant_to_cell.len();
        let n_ghosts = self.tree.num_ghosts() as u32;
        let n_previous_ghosts = self.ghost_to_cell.len();
        let current_rank = self.tree.rank();

        debug!(
            octants = n_octants,
            previous = n_previous,
            ghosts = n_ghosts,
            "extracting patch transformation"
        );

        let mut tracker = AdaptionTracker::new();

        let mut unmapped = vec![true; n_previous];
        let mut added: Vec<OctantInfo> = Vec::new();
        let mut renumbered: Vec<(i64, u32)> = Vec::new();
        let mut deleted: Vec<DeleteInfo> = Vec::new();
        added.reserve((n_octants + n_ghosts) as usize);

        // Classify every post-adaption octant against the mapping table.
        let mut tree_id: u32 = 0;
        while tree_id < n_octants {
            let adaption_type = if import_all {
                Some(AdaptionType::Creation)
            } else {
                let (map, _, ranks) = self.tree.get_mapping(tree_id).ok_or_else(|| {
                    MeshError::InconsistentState(
                        "adaption mapping is missing for a non-empty patch".to_string(),
                    )
                })?;

                if self.tree.is_new_refined(tree_id) {
                    Some(AdaptionType::Refinement)
                } else if self.tree.is_new_coarsened(tree_id) {
                    Some(AdaptionType::Coarsening)
                } else if ranks.iter().any(|&rank| rank != current_rank) {
                    Some(AdaptionType::PartitionRecv)
                } else if map.first() != Some(&tree_id) {
                    Some(AdaptionType::Renumbering)
                } else {
                    None
                }
            };

            // Untouched octants keep their cell.
            let Some(adaption_type) = adaption_type else {
                unmapped[tree_id as usize] = false;
                tree_id += 1;
                continue;
            };

            // Renumbered cells keep their id and only move to a new tree
            // index.
            if adaption_type == AdaptionType::Renumbering {
                let (map, ghost_flags, _) = self.tree.get_mapping(tree_id).expect("mapped");
                let previous_tree_id = map[0];
                debug_assert!(!ghost_flags[0]);
                let cell_id = self
                    .octant_cell_id(OctantInfo {
                        tree_idx: previous_tree_id,
                        internal: true,
                    })
                    .expect("renumbered octant had a cell");
                renumbered.push((cell_id, tree_id));
                unmapped[previous_tree_id as usize] = false;

                if track {
                    let event = tracker.entry(
                        AdaptionType::Renumbering,
                        AdaptionEntity::Cell,
                        current_rank,
                    );
                    event.previous.push(cell_id);
                    event.current.push(cell_id);
                }

                tree_id += 1;
                continue;
            }

            // Other kinds import new octants and delete the cells of the
            // previous ones.
            let n_current = if import_all {
                n_octants - tree_id
            } else if adaption_type == AdaptionType::Refinement {
                self.tree.n_children() as u32
            } else {
                1
            };

            for current in tree_id..tree_id + n_current {
                added.push(OctantInfo {
                    tree_idx: current,
                    internal: true,
                });
            }

            if !import_all {
                let (map, ghost_flags, ranks) = self.tree.get_mapping(tree_id).expect("mapped");
                for k in 0..map.len() {
                    // Only local cells can be deleted.
                    if ranks[k] != current_rank {
                        continue;
                    }
                    let previous = OctantInfo {
                        tree_idx: map[k],
                        internal: !ghost_flags[k],
                    };
                    let cell_id = self
                        .octant_cell_id(previous)
                        .expect("previous octant had a cell");
                    deleted.push(DeleteInfo {
                        cell_id,
                        trigger: adaption_type,
                        rank: current_rank,
                    });
                    if previous.internal {
                        unmapped[previous.tree_idx as usize] = false;
                    }
                }
            }

            // Adaption tracking. The current entries are tree indices for
            // now (the cells do not exist yet) and are translated to cell
            // ids at the end of the sync. Since octants are walked in
            // Morton order, receive events line up with the matching send
            // events without extra bookkeeping.
            if track {
                let event_rank = if adaption_type == AdaptionType::PartitionRecv {
                    let (_, _, ranks) = self.tree.get_mapping(tree_id).expect("mapped");
                    ranks[0]
                } else {
                    current_rank
                };

                let event = tracker.entry(adaption_type, AdaptionEntity::Cell, event_rank);
                for current in tree_id..tree_id + n_current {
                    event.current.push(current as i64);
                }
                if !import_all {
                    let (map, ghost_flags, ranks) =
                        self.tree.get_mapping(tree_id).expect("mapped");
                    for k in 0..map.len() {
                        if ranks[k] != current_rank {
                            continue;
                        }
                        let previous = OctantInfo {
                            tree_idx: map[k],
                            internal: !ghost_flags[k],
                        };
                        event
                            .previous
                            .push(self.octant_cell_id(previous).expect("previous cell"));
                    }
                }
            }

            tree_id += n_current;
        }

        // Cells shipped away by a load balance are deleted; walking the
        // sent ranges in pre-move index order keeps the send events in
        // the order the receiving rank reconstructs.
        let sent_ranges = self.tree.sent_ranges().clone();
        for (&rank, ranges) in sent_ranges.iter() {
            let trigger = if rank == current_rank {
                AdaptionType::Deletion
            } else {
                AdaptionType::PartitionSend
            };
            for half in 0..2 {
                for previous_tree_id in ranges[2 * half]..ranges[2 * half + 1] {
                    let cell_id = self
                        .octant_cell_id(OctantInfo {
                            tree_idx: previous_tree_id,
                            internal: true,
                        })
                        .expect("sent octant had a cell");
                    deleted.push(DeleteInfo {
                        cell_id,
                        trigger,
                        rank,
                    });
                    unmapped[previous_tree_id as usize] = false;
                }
            }
        }

        // The previous ghost layer is dropped wholesale and the new one
        // imported from scratch.
        if n_previous_ghosts > 0 {
            for ghost_tree_id in 0..n_previous_ghosts as u32 {
                let cell_id = self
                    .octant_cell_id(OctantInfo {
                        tree_idx: ghost_tree_id,
                        internal: false,
                    })
                    .expect("ghost octant had a cell");
                deleted.push(DeleteInfo {
                    cell_id,
                    trigger: AdaptionType::Deletion,
                    rank: current_rank,
                });
            }
        }
        for ghost_tree_id in 0..n_ghosts {
            added.push(OctantInfo {
                tree_idx: ghost_tree_id,
                internal: false,
            });
        }

        // A coarsening that merges octants across ranks can leave local
        // octants unmapped; their cells are plain deletions.
        for previous_tree_id in 0..n_previous as u32 {
            if unmapped[previous_tree_id as usize] {
                let cell_id = self
                    .octant_cell_id(OctantInfo {
                        tree_idx: previous_tree_id,
                        internal: true,
                    })
                    .expect("unmapped octant had a cell");
                deleted.push(DeleteInfo {
                    cell_id,
                    trigger: AdaptionType::Deletion,
                    rank: current_rank,
                });
            }
        }

        // Rewrite the cell-octant maps.
        self.reset_cell_octant_maps(&deleted, &renumbered, &added);

        // Remove the dead cells.
        let mut stitch = HashMap::new();
        let mut dangling = Vec::new();
        if !deleted.is_empty() {
            debug!(cells = deleted.len(), "removing non-existing cells");

            if track {
                let mut removed_interfaces = BTreeSet::new();
                for info in &deleted {
                    // Deletions and partition sends are tracked here; the
                    // other triggers were tracked with their adaption.
                    if matches!(
                        info.trigger,
                        AdaptionType::Deletion | AdaptionType::PartitionSend
                    ) {
                        tracker
                            .entry(info.trigger, AdaptionEntity::Cell, info.rank)
                            .previous
                            .push(info.cell_id);
                    }

                    let cell = self.cells.get(info.cell_id).expect("cell to delete");
                    removed_interfaces.extend(cell.interface_ids());
                }

                let event =
                    tracker.entry(AdaptionType::Deletion, AdaptionEntity::Interface, current_rank);
                event.previous.extend(removed_interfaces);
            }

            let (stitch_map, dangling_cells) = self.delete_cells(&deleted);
            stitch = stitch_map;
            dangling = dangling_cells;
        }

        // Import the new octants.
        let mut created_cells = Vec::new();
        if !added.is_empty() {
            debug!(octants = added.len(), "importing new octants");
            created_cells = self.import_cells(&added, &mut stitch, &dangling);
        }

        self.build_ghost_exchange_data();

        if track {
            // Translate the tree indices stored in the cell events into
            // the ids of the imported cells.
            for event in tracker.events_mut() {
                if event.entity != AdaptionEntity::Cell {
                    continue;
                }
                if matches!(
                    event.kind,
                    AdaptionType::Creation
                        | AdaptionType::Refinement
                        | AdaptionType::Coarsening
                        | AdaptionType::PartitionRecv
                ) {
                    for id in event.current.iter_mut() {
                        *id = *self
                            .octant_to_cell
                            .get(&(*id as u32))
                            .expect("imported octant has a cell");
                    }
                }
            }

            // Ghost cells are tracked as one creation event.
            if n_ghosts > 0 {
                let event =
                    tracker.entry(AdaptionType::Creation, AdaptionEntity::Cell, current_rank);
                for ghost_tree_id in 0..n_ghosts {
                    let cell_id = self
                        .octant_cell_id(OctantInfo {
                            tree_idx: ghost_tree_id,
                            internal: false,
                        })
                        .expect("ghost cell imported");
                    event.current.push(cell_id);
                }
            }

            // Interfaces created by the import are tracked as one event.
            if !created_cells.is_empty() {
                let mut created_interfaces = BTreeSet::new();
                for &cell_id in &created_cells {
                    let cell = self.cells.get(cell_id).expect("created cell");
                    created_interfaces.extend(cell.interface_ids());
                }
                let event =
                    tracker.entry(AdaptionType::Creation, AdaptionEntity::Interface, current_rank);
                event.current.extend(created_interfaces);
            }
        }

        Ok(tracker.into_events())
    }

    // Rewrite the cell-octant maps for the deleted, renumbered and added
    // octants. Added octants receive fresh cell ids here; the cells
    // themselves are imported later.
    fn reset_cell_octant_maps(
        &mut self,
        deleted: &[DeleteInfo],
        renumbered: &[(i64, u32)],
        added: &[OctantInfo],
    ) {
        trace!(patch = self.id, "resetting cell-octant maps");

        self.cell_to_ghost.clear();
        self.ghost_to_cell.clear();
        self.ghost_owners.clear();

        for info in deleted {
            if let Some(tree_idx) = self.cell_to_octant.remove(&info.cell_id) {
                self.octant_to_cell.remove(&tree_idx);
            }
        }

        // Renumbered entries: drop every old association first, then
        // insert the new ones, so swapped indices cannot collide.
        for &(cell_id, _) in renumbered {
            if let Some(&old_tree_idx) = self.cell_to_octant.get(&cell_id) {
                self.octant_to_cell.remove(&old_tree_idx);
            }
        }
        for &(cell_id, new_tree_idx) in renumbered {
            self.cell_to_octant.insert(cell_id, new_tree_idx);
            self.octant_to_cell.insert(new_tree_idx, cell_id);
        }

        for info in added {
            let cell_id = self.next_cell_id;
            self.next_cell_id += 1;

            if info.internal {
                self.cell_to_octant.insert(cell_id, info.tree_idx);
                self.octant_to_cell.insert(info.tree_idx, cell_id);
            } else {
                self.cell_to_ghost.insert(cell_id, info.tree_idx);
                self.ghost_to_cell.insert(info.tree_idx, cell_id);
            }
        }
    }

    // Remove the cells of deleted octants together with their interfaces
    // and unreferenced vertices. Cells that survive with a face formerly
    // connected to a deleted neighbour are the dangling cells: their
    // interface and adjacency runs are pruned here and their vertices
    // seed the stitch map used when importing the replacement octants.
    fn delete_cells(&mut self, deleted: &[DeleteInfo]) -> (HashMap<u64, i64>, Vec<i64>) {
        let n_cell_vertices = self.cell_type.info().n_vertices;
        let face_connect = self.cell_type.info().face_connect;
        let n_interface_vertices = self.interface_type.info().n_vertices;

        let dead_cells: HashSet<i64> = deleted.iter().map(|info| info.cell_id).collect();

        let mut dead_vertices: HashSet<i64> = HashSet::new();
        let mut dead_interfaces: HashSet<i64> = HashSet::new();
        let mut dangling_cells: BTreeSet<i64> = BTreeSet::new();

        for &cell_id in &dead_cells {
            // All vertices of the cell are provisionally dead; the ones
            // the dangling cells still reference are reclaimed below.
            let cell = self.cells.get(cell_id).expect("dead cell is live");
            dead_vertices.extend(cell.connectivity().iter().copied());
            let interface_ids: Vec<i64> = cell.interface_ids().collect();

            for interface_id in interface_ids {
                if dead_interfaces.contains(&interface_id) {
                    continue;
                }

                // If one side of the interface survives, that side becomes
                // a dangling cell and loses this interface and adjacency.
                let (owner, owner_face, neigh) = {
                    let interface = self.interfaces.get(interface_id).expect("live interface");
                    (interface.owner, interface.owner_face, interface.neigh)
                };

                let dangling = if let Some((neigh_id, neigh_face)) = neigh {
                    if !dead_cells.contains(&owner) {
                        Some((owner, owner_face, neigh_id))
                    } else if !dead_cells.contains(&neigh_id) {
                        Some((neigh_id, neigh_face, owner))
                    } else {
                        None
                    }
                } else {
                    None
                };

                if let Some((dangling_id, dangling_face, dead_neigh)) = dangling {
                    dangling_cells.insert(dangling_id);

                    let cell = self.cells.get_mut(dangling_id).expect("dangling cell");
                    if let Some(position) = cell.interfaces.find(dangling_face, &interface_id) {
                        cell.interfaces.erase(dangling_face, position);
                    }
                    if let Some(position) = cell.adjacencies.find(dangling_face, &dead_neigh) {
                        cell.adjacencies.erase(dangling_face, position);
                    }
                }

                dead_interfaces.insert(interface_id);
            }
        }

        for &cell_id in &dead_cells {
            self.cells.erase(cell_id);
        }
        self.cells.flush();

        for &interface_id in &dead_interfaces {
            self.interfaces.erase(interface_id);
        }
        self.interfaces.flush();

        // Reclaim the vertices of the dangling cells. The whole cell
        // connectivity is kept, not just the open faces, because corner
        // and edge vertices may be shared with octants that are being
        // replaced. The reclaimed node keys seed the stitch map.
        let mut stitch: HashMap<u64, i64> = HashMap::new();
        for &cell_id in &dangling_cells {
            let info = self.cell_octant(cell_id).expect("dangling cell is mapped");
            let key = self.octant_key(info);

            let cell = self.cells.get(cell_id).expect("dangling cell is live");
            for k in 0..n_cell_vertices {
                let vertex_id = cell.connectivity()[k];
                stitch.insert(key.node_key(k), vertex_id);
                dead_vertices.remove(&vertex_id);
            }

            // Vertices on the surviving interfaces of the cell also stay:
            // hanging-face interfaces reference vertices of finer
            // neighbours that the cell connectivity does not list.
            let interface_ids: Vec<i64> = cell.interface_ids().collect();
            for interface_id in interface_ids {
                let (owner, owner_face, is_border) = {
                    let interface = self.interfaces.get(interface_id).expect("live interface");
                    (interface.owner, interface.owner_face, interface.is_border())
                };
                if is_border {
                    continue;
                }

                let owner_info = self.cell_octant(owner).expect("owner is mapped");
                let owner_key = self.octant_key(owner_info);
                let owner_cell = self.cells.get(owner).expect("owner is live");
                for k in 0..n_interface_vertices {
                    let local = face_connect[owner_face][k];
                    let vertex_id = owner_cell.connectivity()[local];
                    stitch.insert(owner_key.node_key(local), vertex_id);
                    dead_vertices.remove(&vertex_id);
                }
            }
        }

        for &vertex_id in &dead_vertices {
            self.vertices.erase(vertex_id);
        }
        self.vertices.flush();

        (stitch, dangling_cells.into_iter().collect())
    }

    // Import the cells of the added octants: stitch or create their
    // vertices, build the cells, and rebuild adjacencies and interfaces
    // over the union of the imported and the dangling cells.
    fn import_cells(
        &mut self,
        added: &[OctantInfo],
        stitch: &mut HashMap<u64, i64>,
        dangling: &[i64],
    ) -> Vec<i64> {
        let n_cell_vertices = self.cell_type.info().n_vertices;

        // Create the missing vertices.
        for info in added {
            let key = self.octant_key(*info);
            for k in 0..n_cell_vertices {
                let node_morton = key.node_key(k);
                if !stitch.contains_key(&node_morton) {
                    let coords = self.tree.get_node(key, k);
                    let vertex_id = self.vertices.insert(Vertex { coords });
                    stitch.insert(node_morton, vertex_id);
                }
            }
        }

        // Create the cells.
        let mut created = Vec::with_capacity(added.len());
        for info in added {
            let cell_id = self
                .octant_cell_id(*info)
                .expect("added octant has a map entry");
            let key = self.octant_key(*info);

            let connect: Vec<i64> = (0..n_cell_vertices)
                .map(|k| stitch[&key.node_key(k)])
                .collect();

            self.cells.insert_with_id(
                cell_id,
                Cell::new(cell_id, self.cell_type, connect, info.internal),
            );

            if !info.internal {
                let rank = self.tree.ghost(info.tree_idx).rank();
                self.ghost_owners.insert(cell_id, rank);
            }

            created.push(cell_id);
        }

        // The dangling cells expose open faces the new cells must connect
        // to, so both groups are rebuilt together.
        let mut rebuild = created.clone();
        rebuild.extend_from_slice(dangling);
        self.update_adjacencies(&rebuild);
        self.update_interfaces(&rebuild);

        created
    }

    // Rebuild the face adjacencies of the given cells by querying the
    // octree. Cells are processed level by level and every pair is
    // linked symmetrically; pushes deduplicate, so faces shared by two
    // listed cells are handled once.
    fn update_adjacencies(&mut self, cell_ids: &[i64]) {
        let n_faces = 2 * self.dim;

        let max_level = self.tree.max_current_level();
        let mut by_level: Vec<Vec<i64>> = vec![Vec::new(); max_level + 1];
        for &cell_id in cell_ids {
            let level = self.cell_key(cell_id).expect("cell is mapped").level();
            by_level[level].push(cell_id);
        }

        let mut processed: HashSet<(i64, usize)> = HashSet::new();

        for level_cells in by_level {
            for cell_id in level_cells {
                let info = self.cell_octant(cell_id).expect("cell is mapped");
                for face in 0..n_faces {
                    if processed.contains(&(cell_id, face)) {
                        continue;
                    }

                    let (neigh_ids, neigh_ghost_flags) = if info.internal {
                        self.tree.find_neighbours(info.tree_idx, face, 1)
                    } else {
                        self.tree.find_ghost_neighbours(info.tree_idx, face, 1)
                    };

                    for (neigh_tree_idx, neigh_is_ghost) in
                        neigh_ids.into_iter().zip(neigh_ghost_flags)
                    {
                        let neigh_info = OctantInfo {
                            tree_idx: neigh_tree_idx,
                            internal: !neigh_is_ghost,
                        };
                        let Some(neigh_id) = self.octant_cell_id(neigh_info) else {
                            continue;
                        };

                        let cell = self.cells.get_mut(cell_id).expect("cell is live");
                        if !cell.adjacencies.contains(face, &neigh_id) {
                            cell.adjacencies.push_back(face, neigh_id);
                        }

                        let neigh_face = OPPOSITE_FACE[face];
                        let neigh = self.cells.get_mut(neigh_id).expect("neighbour is live");
                        if !neigh.adjacencies.contains(neigh_face, &cell_id) {
                            neigh.adjacencies.push_back(neigh_face, cell_id);
                        }
                        processed.insert((neigh_id, neigh_face));
                    }
                }
            }
        }
    }

    // Rebuild the interfaces of the given cells from their adjacency
    // runs. Each distinct face pair gets one interface owned by the
    // finer cell (lower id on conforming faces); faces with an empty run
    // get a border interface.
    fn update_interfaces(&mut self, cell_ids: &[i64]) {
        let n_faces = 2 * self.dim;

        for &cell_id in cell_ids {
            for face in 0..n_faces {
                let adjacency: Vec<i64> = {
                    let cell = self.cells.get(cell_id).expect("cell is live");
                    cell.adjacencies.slot(face).to_vec()
                };

                if adjacency.is_empty() {
                    let has_interface = {
                        let cell = self.cells.get(cell_id).expect("cell is live");
                        cell.interfaces.count(face) > 0
                    };
                    if !has_interface {
                        self.build_interface(cell_id, face, None);
                    }
                    continue;
                }

                for neigh_id in adjacency {
                    if self.face_has_interface_with(cell_id, face, neigh_id) {
                        continue;
                    }

                    if self.is_interface_owner(cell_id, neigh_id) {
                        self.build_interface(cell_id, face, Some(neigh_id));
                    } else {
                        self.build_interface(neigh_id, OPPOSITE_FACE[face], Some(cell_id));
                    }
                }
            }
        }
    }

    // The owner of an interface is the finer cell; conforming faces tie
    // on the lower id.
    fn is_interface_owner(&self, cell_id: i64, neigh_id: i64) -> bool {
        let level = self.cell_key(cell_id).expect("cell is mapped").level();
        let neigh_level = self.cell_key(neigh_id).expect("neighbour is mapped").level();
        if level != neigh_level {
            level > neigh_level
        } else {
            cell_id < neigh_id
        }
    }

    fn face_has_interface_with(&self, cell_id: i64, face: usize, neigh_id: i64) -> bool {
        let cell = self.cells.get(cell_id).expect("cell is live");
        cell.interfaces.slot(face).iter().any(|&interface_id| {
            let interface = self.interfaces.get(interface_id).expect("live interface");
            interface.owner == neigh_id
                || interface
                    .neigh
                    .map(|(id, _)| id == neigh_id)
                    .unwrap_or(false)
        })
    }

    // Create one interface owned by `(owner_id, owner_face)` and link it
    // into the interface runs of both sides.
    fn build_interface(&mut self, owner_id: i64, owner_face: usize, neigh_id: Option<i64>) -> i64 {
        let face_connect = self.cell_type.info().face_connect;

        let connect: Vec<i64> = {
            let owner = self.cells.get(owner_id).expect("owner is live");
            face_connect[owner_face]
                .iter()
                .map(|&local| owner.connectivity()[local])
                .collect()
        };

        let interface_id = self.interfaces.next_id();
        self.interfaces.insert_with_id(
            interface_id,
            Interface {
                id: interface_id,
                element_type: self.interface_type,
                connect,
                owner: owner_id,
                owner_face,
                neigh: neigh_id.map(|id| (id, OPPOSITE_FACE[owner_face])),
            },
        );

        self.cells
            .get_mut(owner_id)
            .expect("owner is live")
            .interfaces
            .push_back(owner_face, interface_id);
        if let Some(neigh_id) = neigh_id {
            self.cells
                .get_mut(neigh_id)
                .expect("neighbour is live")
                .interfaces
                .push_back(OPPOSITE_FACE[owner_face], interface_id);
        }

        interface_id
    }

    // Rebuild the ghost exchange tables: for every neighbouring rank the
    // ordered list of interior cells it needs (sources) and of ghost
    // cells it feeds (targets). On a single rank both maps stay empty.
    fn build_ghost_exchange_data(&mut self) {
        self.exchange_sources.clear();
        self.exchange_targets.clear();

        if self.tree.num_ghosts() == 0 {
            return;
        }

        // Ghost targets, ordered by ghost tree index (Morton order).
        for ghost_tree_id in 0..self.tree.num_ghosts() as u32 {
            let rank = self.tree.ghost(ghost_tree_id).rank();
            let cell_id = self
                .octant_cell_id(OctantInfo {
                    tree_idx: ghost_tree_id,
                    internal: false,
                })
                .expect("ghost cell imported");
            self.exchange_targets.entry(rank).or_default().push(cell_id);
        }

        // Source cells: interior cells adjacent to a ghost, ordered by
        // internal tree index so both ranks agree on the sequence.
        let mut seen: HashMap<usize, HashSet<i64>> = HashMap::new();
        for tree_idx in 0..self.tree.num_octants() as u32 {
            let cell_id = self
                .octant_cell_id(OctantInfo {
                    tree_idx,
                    internal: true,
                })
                .expect("internal octant has a cell");
            let cell = self.cells.get(cell_id).expect("cell is live");
            for face in 0..cell.face_count() {
                for &neigh_id in cell.adjacencies(face) {
                    if let Some(&rank) = self.ghost_owners.get(&neigh_id) {
                        if seen.entry(rank).or_default().insert(cell_id) {
                            self.exchange_sources.entry(rank).or_default().push(cell_id);
                        }
                    }
                }
            }
        }
    }

    // --------------------------------------------------------------------
    // Queries
    // --------------------------------------------------------------------

    /// The volume of a cell.
    pub fn eval_cell_volume(&self, id: i64) -> Result<f64> {
        Ok(self.level_volume[self.cell_level(id)?])
    }

    /// The centroid of a cell.
    pub fn eval_cell_centroid(&self, id: i64) -> Result<Point3> {
        Ok(self.tree.get_center(self.cell_key(id)?))
    }

    /// The characteristic size (edge length) of a cell.
    pub fn eval_cell_size(&self, id: i64) -> Result<f64> {
        Ok(self.level_size[self.cell_level(id)?])
    }

    /// The area of an interface.
    pub fn eval_interface_area(&self, id: i64) -> Result<f64> {
        let owner = self.interface(id)?.owner();
        Ok(self.level_area[self.cell_level(owner)?])
    }

    /// The outward normal of an interface with respect to its owner.
    pub fn eval_interface_normal(&self, id: i64) -> Result<Point3> {
        let owner_face = self.interface(id)?.owner_face();
        Ok(self.normals[owner_face])
    }

    /// True if the point lies inside the patch domain.
    pub fn is_point_inside(&self, point: &Point3) -> bool {
        self.tree.get_point_owner(point).is_some()
    }

    /// True if the point lies inside the given cell, within the patch
    /// tolerance.
    pub fn is_point_inside_cell(&self, id: i64, point: &Point3) -> Result<bool> {
        let cell = self.cell(id)?;

        let lower_left = self.vertex_coords(cell.vertex(0))?;
        let upper_right = self.vertex_coords(cell.vertex((1 << self.dim) - 1))?;

        let tol = self.tree.tol();
        for d in 0..self.dim {
            if point[d] < lower_left[d] - tol || point[d] > upper_right[d] + tol {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// The id of the interior cell containing the point, `None` when the
    /// point lies outside the patch.
    pub fn locate_point(&self, point: &Point3) -> Option<i64> {
        let tree_idx = self.tree.get_point_owner(point)?;
        self.octant_cell_id(OctantInfo {
            tree_idx,
            internal: true,
        })
    }

    /// The geometric tolerance used by point queries.
    pub fn tol(&self) -> f64 {
        self.tree.tol()
    }

    /// Set the geometric tolerance used by point queries.
    pub fn set_tol(&mut self, tol: f64) {
        self.tree.set_tol(tol);
    }

    /// Restore the default geometric tolerance.
    pub fn reset_tol(&mut self) {
        self.tree.reset_tol();
    }

    // --------------------------------------------------------------------
    // Transformations
    // --------------------------------------------------------------------

    /// Translate the patch.
    pub fn translate(&mut self, translation: Point3) {
        let origin = self.tree.origin();
        self.tree.set_origin([
            origin[0] + translation[0],
            origin[1] + translation[1],
            origin[2] + translation[2],
        ]);

        for slot in self.vertex_ids() {
            let vertex = self.vertices.get_mut(slot).expect("vertex is live");
            for d in 0..3 {
                vertex.coords[d] += translation[d];
            }
        }
    }

    /// Scale the patch about its origin. Only uniform scaling is
    /// supported: all three components must match within `1e-14`.
    pub fn scale(&mut self, scaling: Point3) -> Result<()> {
        let uniform = (scaling[0] - scaling[1]).abs() <= 1e-14
            && (scaling[0] - scaling[2]).abs() <= 1e-14;
        if !uniform {
            return Err(MeshError::InvalidArgument(format!(
                "octree patch only allows uniform scaling, got {scaling:?}"
            )));
        }

        let factor = scaling[0];
        let origin = self.tree.origin();
        self.tree.set_length(self.tree.length() * factor);
        self.initialize_tree_geometry();

        for slot in self.vertex_ids() {
            let vertex = self.vertices.get_mut(slot).expect("vertex is live");
            for d in 0..3 {
                vertex.coords[d] = origin[d] + (vertex.coords[d] - origin[d]) * factor;
            }
        }

        Ok(())
    }

    fn vertex_ids(&self) -> Vec<i64> {
        self.vertices.ids().collect()
    }

    // --------------------------------------------------------------------
    // Neighbour queries
    // --------------------------------------------------------------------

    /// The neighbours of a cell across all of its faces, in ascending id
    /// order.
    pub fn find_cell_face_neighs(&self, id: i64) -> Result<Vec<i64>> {
        let cell = self.cell(id)?;
        let mut neighs = Vec::new();
        for face in 0..cell.face_count() {
            for &neigh_id in cell.adjacencies(face) {
                insert_ordered(&mut neighs, neigh_id);
            }
        }
        Ok(neighs)
    }

    /// The neighbours of a cell across one face, excluding the black
    /// list, in ascending id order.
    pub fn find_cell_face_neighs_on(
        &self,
        id: i64,
        face: usize,
        black_list: &[i64],
    ) -> Result<Vec<i64>> {
        let cell = self.cell(id)?;
        let mut neighs = Vec::new();
        for &neigh_id in cell.adjacencies(face) {
            if !black_list.contains(&neigh_id) {
                insert_ordered(&mut neighs, neigh_id);
            }
        }
        Ok(neighs)
    }

    /// The neighbours of a cell across one of its edges, excluding the
    /// black list. Edge adjacency exists only in three dimensions. The
    /// result includes the neighbours of the two faces incident to the
    /// edge, in ascending id order.
    pub fn find_cell_edge_neighs(
        &self,
        id: i64,
        edge: usize,
        black_list: &[i64],
    ) -> Result<Vec<i64>> {
        if self.dim != 3 {
            return Err(MeshError::InvalidArgument(
                "edge neighbours are only defined for three-dimensional patches".to_string(),
            ));
        }

        let mut neighs = self.find_cell_codimension_neighs(id, edge, 2, black_list)?;
        for &face in &EDGE_FACES_3D[edge] {
            for neigh_id in self.find_cell_face_neighs_on(id, face, black_list)? {
                insert_ordered(&mut neighs, neigh_id);
            }
        }
        Ok(neighs)
    }

    /// The neighbours of a cell across one of its vertices, excluding
    /// the black list: the vertex-diagonal neighbours plus the
    /// neighbours of every incident edge (three dimensions) or face (two
    /// dimensions), in ascending id order.
    pub fn find_cell_vertex_neighs(
        &self,
        id: i64,
        vertex: usize,
        black_list: &[i64],
    ) -> Result<Vec<i64>> {
        let mut neighs = self.find_cell_codimension_neighs(id, vertex, self.dim, black_list)?;

        if self.dim == 3 {
            for &edge in &NODE_EDGES_3D[vertex] {
                for neigh_id in self.find_cell_edge_neighs(id, edge, black_list)? {
                    insert_ordered(&mut neighs, neigh_id);
                }
            }
        } else {
            for &face in &NODE_FACES_2D[vertex] {
                for neigh_id in self.find_cell_face_neighs_on(id, face, black_list)? {
                    insert_ordered(&mut neighs, neigh_id);
                }
            }
        }
        Ok(neighs)
    }

    // Neighbours for exactly the given codimension, straight from the
    // octree.
    fn find_cell_codimension_neighs(
        &self,
        id: i64,
        index: usize,
        codim: usize,
        black_list: &[i64],
    ) -> Result<Vec<i64>> {
        if codim == 0 || codim > self.dim {
            return Err(MeshError::InvalidArgument(format!(
                "codimension {codim} is not valid for a {}-dimensional patch",
                self.dim
            )));
        }

        let info = self.cell_octant(id).ok_or(MeshError::NotFound(id))?;
        let (neigh_ids, neigh_ghost_flags) = if info.internal {
            self.tree.find_neighbours(info.tree_idx, index, codim)
        } else {
            self.tree.find_ghost_neighbours(info.tree_idx, index, codim)
        };

        let mut neighs = Vec::new();
        for (tree_idx, is_ghost) in neigh_ids.into_iter().zip(neigh_ghost_flags) {
            let neigh_info = OctantInfo {
                tree_idx,
                internal: !is_ghost,
            };
            if let Some(neigh_id) = self.octant_cell_id(neigh_info) {
                if !black_list.contains(&neigh_id) {
                    insert_ordered(&mut neighs, neigh_id);
                }
            }
        }
        Ok(neighs)
    }

    /// The local faces of a cell incident to one of its vertices.
    pub fn vertex_local_faces(&self, vertex: usize) -> &'static [usize] {
        if self.dim == 3 {
            &NODE_FACES_3D[vertex]
        } else {
            &NODE_FACES_2D[vertex]
        }
    }
}

// Insert a value into an ascending vector, keeping it sorted and unique.
fn insert_ordered(values: &mut Vec<i64>, value: i64) {
    if let Err(position) = values.binary_search(&value) {
        values.insert(position, value);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn patch_2d() -> OctreePatch {
        OctreePatch::new(0, 2, [0.0, 0.0, 0.0], 1.0, 1.0).unwrap()
    }

    fn assert_close(a: &Point3, b: &Point3) {
        for d in 0..3 {
            assert!((a[d] - b[d]).abs() < 1e-12, "{a:?} != {b:?}");
        }
    }

    // A unit 2-D patch starts as one cell; refining it produces four
    // cells in Morton order with the expected centroids, four interior
    // interfaces and eight borders.
    #[test]
    fn test_refine_single_cell_2d() {
        let mut patch = patch_2d();
        assert_eq!(patch.cell_count(), 1);
        assert_eq!(patch.vertex_count(), 4);
        assert_eq!(patch.interface_count(), 4);

        assert!(patch.mark_cell_for_refinement(0));
        let events = patch.update_adaption(true).unwrap();

        let refinements: Vec<&AdaptionEvent> = events
            .iter()
            .filter(|event| {
                event.kind == AdaptionType::Refinement && event.entity == AdaptionEntity::Cell
            })
            .collect();
        assert_eq!(refinements.len(), 1);
        let refinement = refinements[0];
        assert_eq!(refinement.previous, vec![0]);
        assert_eq!(refinement.current.len(), 4);

        // Centroids in Morton order.
        let expected = [
            [0.25, 0.25, 0.0],
            [0.75, 0.25, 0.0],
            [0.25, 0.75, 0.0],
            [0.75, 0.75, 0.0],
        ];
        for (cell_id, centroid) in refinement.current.iter().zip(expected) {
            assert_close(&patch.eval_cell_centroid(*cell_id).unwrap(), &centroid);
        }

        assert_eq!(patch.cell_count(), 4);
        assert_eq!(patch.vertex_count(), 9);

        // Every face carries exactly one interface; four interior, eight
        // border.
        let mut interior = 0;
        let mut border = 0;
        for (_, cell) in patch.cells() {
            for face in 0..cell.face_count() {
                assert_eq!(cell.interfaces(face).len(), 1);
            }
        }
        for (_, interface) in patch.interfaces() {
            if interface.is_border() {
                border += 1;
            } else {
                interior += 1;
            }
        }
        assert_eq!(interior, 4);
        assert_eq!(border, 8);
    }

    // Point location in the refined patch.
    #[test]
    fn test_locate_point() {
        let mut patch = patch_2d();
        patch.mark_cell_for_refinement(0);
        patch.update_adaption(false).unwrap();

        let cell_id = patch.locate_point(&[0.8, 0.3, 0.0]).unwrap();
        assert_close(
            &patch.eval_cell_centroid(cell_id).unwrap(),
            &[0.75, 0.25, 0.0],
        );

        assert!(patch.locate_point(&[1.5, 0.5, 0.0]).is_none());
        assert!(patch.is_point_inside(&[0.5, 0.5, 0.0]));
        assert!(!patch.is_point_inside(&[-0.5, 0.5, 0.0]));

        assert!(patch
            .is_point_inside_cell(cell_id, &[0.8, 0.3, 0.0])
            .unwrap());
        assert!(!patch
            .is_point_inside_cell(cell_id, &[0.2, 0.3, 0.0])
            .unwrap());
    }

    // Interface normals are the axis-aligned unit vectors and match
    // the outward normal of the owner's face.
    #[test]
    fn test_interface_normals() {
        let mut patch = patch_2d();
        patch.mark_cell_for_refinement(0);
        patch.update_adaption(false).unwrap();

        for (id, interface) in patch.interfaces() {
            let normal = patch.eval_interface_normal(id).unwrap();
            let axis = interface.owner_face() / 2;
            let sign = if interface.owner_face() % 2 == 0 {
                -1.0
            } else {
                1.0
            };
            let mut expected = [0.0; 3];
            expected[axis] = sign;
            assert_close(&normal, &expected);
        }
    }

    // Refining neighbours in separate adaptions keeps one id for the
    // shared vertex.
    #[test]
    fn test_vertex_stitching_across_adaptions() {
        let mut patch = patch_2d();
        patch.mark_cell_for_refinement(0);
        patch.update_adaption(false).unwrap();

        let first = patch.locate_point(&[0.25, 0.25, 0.0]).unwrap();
        patch.mark_cell_for_refinement(first);
        patch.update_adaption(false).unwrap();

        let second = patch.locate_point(&[0.75, 0.25, 0.0]).unwrap();
        patch.mark_cell_for_refinement(second);
        patch.update_adaption(false).unwrap();

        // Tiling is preserved.
        let volume: f64 = patch
            .cells()
            .map(|(id, _)| patch.eval_cell_volume(id).unwrap())
            .sum();
        assert!((volume - 1.0).abs() < 1e-12);

        // Two cells share a vertex id exactly when the corner node keys
        // coincide.
        let mut by_node_key: HashMap<u64, i64> = HashMap::new();
        for (id, cell) in patch.cells() {
            let key = patch.cell_key(id).unwrap();
            for k in 0..cell.connectivity().len() {
                let node_key = key.node_key(k);
                let vertex_id = cell.vertex(k);
                let entry = by_node_key.entry(node_key).or_insert(vertex_id);
                assert_eq!(
                    *entry, vertex_id,
                    "corner node carries two vertex ids after stitching"
                );
            }
        }

        // Every vertex is referenced by some cell.
        let referenced: HashSet<i64> = by_node_key.values().copied().collect();
        assert_eq!(referenced.len(), patch.vertex_count());
    }

    // Adjacency symmetry and interface consistency invariants.
    #[test]
    fn test_topology_invariants_after_mixed_adaption() {
        let mut patch = patch_2d();
        patch.mark_cell_for_refinement(0);
        patch.update_adaption(false).unwrap();
        let fine = patch.locate_point(&[0.25, 0.25, 0.0]).unwrap();
        patch.mark_cell_for_refinement(fine);
        patch.update_adaption(false).unwrap();

        check_topology(&patch);
    }

    fn check_topology(patch: &OctreePatch) {
        // Adjacency symmetry.
        for (id, cell) in patch.cells() {
            for face in 0..cell.face_count() {
                for &neigh_id in cell.adjacencies(face) {
                    let neigh = patch.cell(neigh_id).unwrap();
                    let neigh_face = OPPOSITE_FACE[face];
                    assert!(
                        neigh.adjacencies(neigh_face).contains(&id),
                        "adjacency {id}->{neigh_id} is not symmetric"
                    );
                }
            }
        }

        // Interface consistency: both sides list the interface on the
        // right face, and the owner is the finer side or the lower id.
        for (id, interface) in patch.interfaces() {
            let owner = patch.cell(interface.owner()).unwrap();
            assert!(owner.interfaces(interface.owner_face()).contains(&id));

            if let Some((neigh_id, neigh_face)) = interface.neigh() {
                let neigh = patch.cell(neigh_id).unwrap();
                assert!(neigh.interfaces(neigh_face).contains(&id));

                let owner_level = patch.cell_level(interface.owner()).unwrap();
                let neigh_level = patch.cell_level(neigh_id).unwrap();
                if owner_level == neigh_level {
                    assert!(interface.owner() < neigh_id);
                } else {
                    assert!(owner_level > neigh_level);
                }
            }
        }

        // Every non-border face of every cell is fully covered by
        // interfaces: one per adjacent neighbour.
        for (_, cell) in patch.cells() {
            for face in 0..cell.face_count() {
                let n_adjacencies = cell.adjacencies(face).len();
                let n_interfaces = cell.interfaces(face).len();
                if n_adjacencies == 0 {
                    assert_eq!(n_interfaces, 1, "border face without border interface");
                } else {
                    assert_eq!(n_interfaces, n_adjacencies);
                }
            }
        }
    }

    // Balancing keeps every pair of neighbours within one level: the
    // refined cluster next to the coarse quadrants drags them along.
    #[test]
    fn test_balancing_keeps_two_to_one() {
        let mut patch = OctreePatch::new(0, 2, [0.0, 0.0, 0.0], 1.0, 0.5).unwrap();
        assert_eq!(patch.cell_count(), 4);

        // Refine the cell at the centre of the grid three times,
        // balancing enabled everywhere (the default). From the second
        // round on the lagging neighbours violate the constraint and
        // must be split by the balance pass.
        for _ in 0..3 {
            let target = patch.locate_point(&[0.45, 0.45, 0.0]).unwrap();
            patch.mark_cell_for_refinement(target);
            patch.update_adaption(false).unwrap();
        }

        // The balance pass had to act: a tree that only ever split the
        // marked cell would hold 4 + 3 * 3 = 13 cells.
        assert!(patch.cell_count() > 13);

        let ids: Vec<i64> = patch.cells().map(|(id, _)| id).collect();
        for id in ids {
            let level = patch.cell_level(id).unwrap();
            for vertex in 0..4 {
                for neigh_id in patch.find_cell_vertex_neighs(id, vertex, &[]).unwrap() {
                    let neigh_level = patch.cell_level(neigh_id).unwrap();
                    assert!(
                        level.abs_diff(neigh_level) <= 1,
                        "cells {id} and {neigh_id} violate the 2:1 balance"
                    );
                }
            }
        }

        check_topology(&patch);
    }

    // Refining everything and coarsening everything back restores the
    // original cell set.
    #[test]
    fn test_refine_coarsen_roundtrip() {
        let mut patch = patch_2d();

        let events = {
            patch.mark_cell_for_refinement(0);
            patch.update_adaption(true).unwrap()
        };
        assert!(!events.is_empty());

        let ids: Vec<i64> = patch.cells().map(|(id, _)| id).collect();
        for id in &ids {
            assert!(patch.mark_cell_for_coarsening(*id));
        }
        let events = patch.update_adaption(true).unwrap();

        assert_eq!(patch.cell_count(), 1);
        let coarsening = events
            .iter()
            .find(|event| {
                event.kind == AdaptionType::Coarsening && event.entity == AdaptionEntity::Cell
            })
            .unwrap();
        assert_eq!(coarsening.previous.len(), 4);
        assert_eq!(coarsening.current.len(), 1);

        // The merged cell covers the whole domain again.
        let merged = coarsening.current[0];
        assert!((patch.eval_cell_volume(merged).unwrap() - 1.0).abs() < 1e-12);
        check_topology(&patch);
    }

    // Event previous/current ids cover exactly the changed cells.
    #[test]
    fn test_event_coverage() {
        let mut patch = OctreePatch::new(0, 2, [0.0, 0.0, 0.0], 1.0, 0.5).unwrap();
        let pre_ids: HashSet<i64> = patch.cells().map(|(id, _)| id).collect();

        let target = patch.locate_point(&[0.1, 0.1, 0.0]).unwrap();
        patch.mark_cell_for_refinement(target);
        let events = patch.update_adaption(true).unwrap();
        let post_ids: HashSet<i64> = patch.cells().map(|(id, _)| id).collect();

        let mut current_union: HashSet<i64> = HashSet::new();
        let mut previous_union: HashSet<i64> = HashSet::new();
        for event in &events {
            if event.entity != AdaptionEntity::Cell {
                continue;
            }
            match event.kind {
                AdaptionType::Creation
                | AdaptionType::Refinement
                | AdaptionType::Coarsening
                | AdaptionType::Renumbering
                | AdaptionType::PartitionRecv => {
                    current_union.extend(event.current.iter().copied());
                }
                _ => {}
            }
            match event.kind {
                AdaptionType::Deletion
                | AdaptionType::Refinement
                | AdaptionType::Coarsening
                | AdaptionType::Renumbering
                | AdaptionType::PartitionSend => {
                    previous_union.extend(event.previous.iter().copied());
                }
                _ => {}
            }
        }

        // Current ids of the events are exactly the post-adaption ids
        // that did not exist before, plus the renumbered ones.
        assert!(current_union.is_subset(&post_ids));
        for id in post_ids.difference(&pre_ids) {
            assert!(current_union.contains(id), "new cell {id} not covered");
        }
        // Previous ids cover exactly the pre-adaption cells that are gone.
        assert!(previous_union.is_subset(&pre_ids));
        for id in pre_ids.difference(&post_ids) {
            assert!(previous_union.contains(id), "dead cell {id} not covered");
        }
    }

    #[test]
    fn test_untracked_adaption_returns_no_events() {
        let mut patch = patch_2d();
        patch.mark_cell_for_refinement(0);
        let events = patch.update_adaption(false).unwrap();
        assert!(events.is_empty());
        assert_eq!(patch.cell_count(), 4);

        // Nothing marked: nothing changes, no events.
        let events = patch.update_adaption(true).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_markers_on_unknown_cells_are_rejected() {
        let mut patch = patch_2d();
        assert!(!patch.mark_cell_for_refinement(17));
        assert!(!patch.mark_cell_for_coarsening(17));
        assert!(!patch.enable_cell_balancing(17, false));
    }

    #[test]
    fn test_eval_queries() {
        let mut patch = patch_2d();
        patch.mark_cell_for_refinement(0);
        patch.update_adaption(false).unwrap();

        let id = patch.locate_point(&[0.25, 0.25, 0.0]).unwrap();
        assert!((patch.eval_cell_volume(id).unwrap() - 0.25).abs() < 1e-14);
        assert!((patch.eval_cell_size(id).unwrap() - 0.5).abs() < 1e-14);

        let interface_id = patch.cell(id).unwrap().interfaces(1)[0];
        assert!((patch.eval_interface_area(interface_id).unwrap() - 0.5).abs() < 1e-14);

        assert!(matches!(
            patch.eval_cell_volume(1234),
            Err(MeshError::NotFound(1234))
        ));
    }

    #[test]
    fn test_translate_and_scale() {
        let mut patch = patch_2d();
        patch.mark_cell_for_refinement(0);
        patch.update_adaption(false).unwrap();

        patch.translate([1.0, 2.0, 0.0]);
        let id = patch.locate_point(&[1.25, 2.25, 0.0]).unwrap();
        assert_close(
            &patch.eval_cell_centroid(id).unwrap(),
            &[1.25, 2.25, 0.0],
        );

        assert!(patch.scale([2.0, 2.0, 2.0]).is_ok());
        assert!((patch.eval_cell_size(id).unwrap() - 1.0).abs() < 1e-12);

        // Non-uniform scaling is rejected.
        assert!(patch.scale([2.0, 1.0, 2.0]).is_err());
    }

    #[test]
    fn test_neighbour_queries() {
        let mut patch = OctreePatch::new(0, 2, [0.0, 0.0, 0.0], 1.0, 0.5).unwrap();

        let lower_left = patch.locate_point(&[0.1, 0.1, 0.0]).unwrap();
        let lower_right = patch.locate_point(&[0.9, 0.1, 0.0]).unwrap();
        let upper_left = patch.locate_point(&[0.1, 0.9, 0.0]).unwrap();
        let upper_right = patch.locate_point(&[0.9, 0.9, 0.0]).unwrap();

        let face_neighs = patch.find_cell_face_neighs(lower_left).unwrap();
        assert_eq!(face_neighs, {
            let mut expected = vec![lower_right, upper_left];
            expected.sort_unstable();
            expected
        });

        // The far vertex of the lower-left cell reaches all other cells.
        let vertex_neighs = patch.find_cell_vertex_neighs(lower_left, 3, &[]).unwrap();
        assert_eq!(vertex_neighs, {
            let mut expected = vec![lower_right, upper_left, upper_right];
            expected.sort_unstable();
            expected
        });

        // The black list filters results.
        let filtered = patch
            .find_cell_vertex_neighs(lower_left, 3, &[upper_right])
            .unwrap();
        assert!(!filtered.contains(&upper_right));

        // Edge queries are three-dimensional only.
        assert!(patch.find_cell_edge_neighs(lower_left, 0, &[]).is_err());
    }

    #[test]
    fn test_neighbour_queries_3d() {
        let mut patch = OctreePatch::new(0, 3, [0.0, 0.0, 0.0], 1.0, 0.5).unwrap();
        assert_eq!(patch.cell_count(), 8);

        let origin_cell = patch.locate_point(&[0.1, 0.1, 0.1]).unwrap();
        let far_cell = patch.locate_point(&[0.9, 0.9, 0.9]).unwrap();

        // The vertex diagonal reaches all seven other cells.
        let vertex_neighs = patch.find_cell_vertex_neighs(origin_cell, 7, &[]).unwrap();
        assert_eq!(vertex_neighs.len(), 7);
        assert!(vertex_neighs.contains(&far_cell));

        // Edge 11 of the origin cell points towards (0, +y, +z).
        let edge_neighs = patch.find_cell_edge_neighs(origin_cell, 11, &[]).unwrap();
        let expected = patch.locate_point(&[0.1, 0.9, 0.9]).unwrap();
        assert!(edge_neighs.contains(&expected));

        let _ = patch.mark_cell_for_refinement(origin_cell);
        patch.update_adaption(false).unwrap();
        check_topology(&patch);
    }

    #[test]
    fn test_hanging_face_topology() {
        let mut patch = patch_2d();
        patch.mark_cell_for_refinement(0);
        patch.update_adaption(false).unwrap();
        let fine = patch.locate_point(&[0.25, 0.25, 0.0]).unwrap();
        patch.mark_cell_for_refinement(fine);
        patch.update_adaption(false).unwrap();

        // The cell right of the refined quadrant has a hanging -x face
        // with two neighbours and two interfaces owned by the finer side.
        let coarse = patch.locate_point(&[0.75, 0.25, 0.0]).unwrap();
        let cell = patch.cell(coarse).unwrap();
        assert_eq!(cell.adjacencies(0).len(), 2);
        assert_eq!(cell.interfaces(0).len(), 2);
        for &interface_id in cell.interfaces(0) {
            let interface = patch.interface(interface_id).unwrap();
            assert_ne!(interface.owner(), coarse);
            let owner_level = patch.cell_level(interface.owner()).unwrap();
            assert_eq!(owner_level, 2);
        }
    }

    #[test]
    fn test_cell_binary_roundtrip() {
        let mut patch = patch_2d();
        patch.mark_cell_for_refinement(0);
        patch.update_adaption(false).unwrap();

        let id = patch.cells().next().unwrap().0;
        let cell = patch.cell(id).unwrap();

        let mut buffer = Vec::new();
        cell.write_binary(&mut buffer);
        assert_eq!(buffer.len(), cell.binary_size());

        let mut cursor = buffer.as_slice();
        let restored = Cell::read_binary(&mut cursor, cell.is_interior()).unwrap();
        assert!(cursor.is_empty());

        assert_eq!(restored.id(), cell.id());
        assert_eq!(restored.element_type(), cell.element_type());
        assert_eq!(restored.connectivity(), cell.connectivity());
        for face in 0..cell.face_count() {
            assert_eq!(restored.adjacencies(face), cell.adjacencies(face));
            assert_eq!(restored.interfaces(face), cell.interfaces(face));
        }
    }

    #[test]
    fn test_initial_refinement_level() {
        // dh = 0.25 on a unit domain gives a uniform 4x4 grid.
        let patch = OctreePatch::new(0, 2, [0.0, 0.0, 0.0], 1.0, 0.25).unwrap();
        assert_eq!(patch.cell_count(), 16);
        for (id, _) in patch.cells() {
            assert_eq!(patch.cell_level(id).unwrap(), 2);
        }

        // An oversized dh keeps the root cell.
        let patch = OctreePatch::new(0, 2, [0.0, 0.0, 0.0], 1.0, 10.0).unwrap();
        assert_eq!(patch.cell_count(), 1);
    }
}
