//! An octree-backed adaptive volumetric mesh core.
//!
//! This library maintains a conforming cell complex over a cubic domain on
//! top of a linear octree: octants are kept in Morton order, refinement
//! and coarsening are driven by per-octant markers with an optional 2:1
//! balance constraint, and a patch layer mirrors the tree as indexed
//! cells, vertices and explicit interfaces. After every adaption the
//! patch reconciles itself against the tree and reports the changes as a
//! stream of [adaption events](crate::adaption::AdaptionEvent) precise
//! enough for application-level field transfer.
//!
//! The patch is the entry point for embedding applications:
//!
//! ```
//! use octomesh::OctreePatch;
//!
//! // A two-dimensional unit patch starting from a single cell.
//! let mut patch = OctreePatch::new(0, 2, [0.0, 0.0, 0.0], 1.0, 1.0).unwrap();
//!
//! patch.mark_cell_for_refinement(0);
//! let events = patch.update_adaption(true).unwrap();
//!
//! assert_eq!(patch.cell_count(), 4);
//! assert!(!events.is_empty());
//! ```
//!
//! A patch lives on one rank. With the `mpi` feature the octree can in
//! addition be distributed across ranks by contiguous Morton ranges:
//! cells are load-balanced by weight, a read-only ghost layer mirrors
//! the partition boundary, and the matching partition send/receive
//! events list cell ids in identical order on both sides, so field data
//! can be packed and unpacked without extra metadata.
//!
//! The supporting modules are usable on their own: a [Morton
//! key](crate::morton::MortonKey) type with neighbour and corner-node
//! arithmetic, an id-stable [pierced container](crate::pierced),
//! a [flat ragged array](crate::flat_vec), a closed [element
//! registry](crate::element), and a pure [geometry
//! kernel](crate::geometry) with projection, distance, intersection and
//! bounding-box routines.
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod adaption;
pub mod constants;
pub mod element;
pub mod error;
pub mod flat_vec;
pub mod geometry;
pub mod morton;
pub mod octree;
pub mod patch;
pub mod pierced;

pub use crate::adaption::{AdaptionEntity, AdaptionEvent, AdaptionType};
pub use crate::element::ElementType;
pub use crate::error::{MeshError, Result};
pub use crate::morton::MortonKey;
pub use crate::octree::Octree;
pub use crate::patch::OctreePatch;
