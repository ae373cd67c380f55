//! Reference element registry.
//!
//! A closed enumeration of cell shapes together with a process-wide
//! constant table of their reference connectivity: vertex, edge and face
//! counts, the face-local and edge-local vertex lists, and the shape of
//! each face. Lookup is a match on the discriminant. Polygons and
//! polyhedra carry their connectivity inline per cell and have no entry
//! in the reference table.
//!
//! Pixel and voxel corners follow the octree sibling order (corner k has
//! offsets `k & 1, k >> 1 & 1, k >> 2 & 1`), so octant corners map onto
//! cell connectivity without reordering; faces are numbered -x, +x, -y,
//! +y, -z, +z to match the octant face tables.

use crate::constants::{FACE_NODES_2D, FACE_NODES_3D};

/// The closed set of element shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ElementType {
    /// No shape assigned.
    #[default]
    Undefined = 0,
    /// A single point.
    Vertex,
    /// A two-point segment.
    Line,
    /// A three-vertex simplex.
    Triangle,
    /// A four-vertex polygon in cyclic order.
    Quad,
    /// A four-vertex axis-aligned square in z-order.
    Pixel,
    /// A four-vertex solid simplex.
    Tetra,
    /// An eight-vertex solid in cyclic order.
    Hexahedron,
    /// An eight-vertex axis-aligned cube in z-order.
    Voxel,
    /// A six-vertex triangular prism.
    Wedge,
    /// A five-vertex quadrilateral pyramid.
    Pyramid,
    /// An arbitrary polygon with inline connectivity.
    Polygon,
    /// An arbitrary polyhedron with inline connectivity.
    Polyhedron,
}

/// Reference connectivity of a concrete element shape.
#[derive(Debug)]
pub struct ElementInfo {
    /// The shape this entry describes.
    pub element_type: ElementType,
    /// Topological dimension of the shape.
    pub dimension: usize,
    /// Number of vertices.
    pub n_vertices: usize,
    /// Number of edges. For two-dimensional shapes the edges are the
    /// vertices (the codimension-two entities).
    pub n_edges: usize,
    /// Number of faces (codimension-one entities).
    pub n_faces: usize,
    /// The shape of each face.
    pub face_type: &'static [ElementType],
    /// Face-local vertex connectivity.
    pub face_connect: &'static [&'static [usize]],
    /// Edge-local vertex connectivity.
    pub edge_connect: &'static [&'static [usize]],
}

const UNDEFINED_INFO: ElementInfo = ElementInfo {
    element_type: ElementType::Undefined,
    dimension: 0,
    n_vertices: 0,
    n_edges: 0,
    n_faces: 0,
    face_type: &[],
    face_connect: &[],
    edge_connect: &[],
};

const VERTEX_INFO: ElementInfo = ElementInfo {
    element_type: ElementType::Vertex,
    dimension: 0,
    n_vertices: 1,
    n_edges: 0,
    n_faces: 0,
    face_type: &[],
    face_connect: &[],
    edge_connect: &[],
};

const LINE_INFO: ElementInfo = ElementInfo {
    element_type: ElementType::Line,
    dimension: 1,
    n_vertices: 2,
    n_edges: 2,
    n_faces: 2,
    face_type: &[ElementType::Vertex; 2],
    face_connect: &[&[0], &[1]],
    edge_connect: &[&[0], &[1]],
};

const TRIANGLE_INFO: ElementInfo = ElementInfo {
    element_type: ElementType::Triangle,
    dimension: 2,
    n_vertices: 3,
    n_edges: 3,
    n_faces: 3,
    face_type: &[ElementType::Line; 3],
    face_connect: &[&[0, 1], &[1, 2], &[2, 0]],
    edge_connect: &[&[0], &[1], &[2]],
};

const QUAD_INFO: ElementInfo = ElementInfo {
    element_type: ElementType::Quad,
    dimension: 2,
    n_vertices: 4,
    n_edges: 4,
    n_faces: 4,
    face_type: &[ElementType::Line; 4],
    face_connect: &[&[0, 1], &[1, 2], &[2, 3], &[3, 0]],
    edge_connect: &[&[0], &[1], &[2], &[3]],
};

const PIXEL_INFO: ElementInfo = ElementInfo {
    element_type: ElementType::Pixel,
    dimension: 2,
    n_vertices: 4,
    n_edges: 4,
    n_faces: 4,
    face_type: &[ElementType::Line; 4],
    face_connect: &[
        &FACE_NODES_2D[0],
        &FACE_NODES_2D[1],
        &FACE_NODES_2D[2],
        &FACE_NODES_2D[3],
    ],
    edge_connect: &[&[0], &[1], &[2], &[3]],
};

const TETRA_INFO: ElementInfo = ElementInfo {
    element_type: ElementType::Tetra,
    dimension: 3,
    n_vertices: 4,
    n_edges: 6,
    n_faces: 4,
    face_type: &[ElementType::Triangle; 4],
    face_connect: &[&[1, 2, 3], &[0, 3, 2], &[0, 1, 3], &[0, 2, 1]],
    edge_connect: &[&[0, 1], &[1, 2], &[2, 0], &[0, 3], &[1, 3], &[2, 3]],
};

const HEXAHEDRON_INFO: ElementInfo = ElementInfo {
    element_type: ElementType::Hexahedron,
    dimension: 3,
    n_vertices: 8,
    n_edges: 12,
    n_faces: 6,
    face_type: &[ElementType::Quad; 6],
    face_connect: &[
        &[0, 3, 2, 1],
        &[0, 1, 5, 4],
        &[1, 2, 6, 5],
        &[2, 3, 7, 6],
        &[3, 0, 4, 7],
        &[4, 5, 6, 7],
    ],
    edge_connect: &[
        &[0, 1],
        &[1, 2],
        &[2, 3],
        &[3, 0],
        &[4, 5],
        &[5, 6],
        &[6, 7],
        &[7, 4],
        &[0, 4],
        &[1, 5],
        &[2, 6],
        &[3, 7],
    ],
};

const VOXEL_INFO: ElementInfo = ElementInfo {
    element_type: ElementType::Voxel,
    dimension: 3,
    n_vertices: 8,
    n_edges: 12,
    n_faces: 6,
    face_type: &[ElementType::Pixel; 6],
    face_connect: &[
        &FACE_NODES_3D[0],
        &FACE_NODES_3D[1],
        &FACE_NODES_3D[2],
        &FACE_NODES_3D[3],
        &FACE_NODES_3D[4],
        &FACE_NODES_3D[5],
    ],
    edge_connect: &[
        &[0, 2],
        &[1, 3],
        &[0, 1],
        &[2, 3],
        &[0, 4],
        &[1, 5],
        &[2, 6],
        &[3, 7],
        &[4, 6],
        &[5, 7],
        &[4, 5],
        &[6, 7],
    ],
};

const WEDGE_INFO: ElementInfo = ElementInfo {
    element_type: ElementType::Wedge,
    dimension: 3,
    n_vertices: 6,
    n_edges: 9,
    n_faces: 5,
    face_type: &[
        ElementType::Triangle,
        ElementType::Triangle,
        ElementType::Quad,
        ElementType::Quad,
        ElementType::Quad,
    ],
    face_connect: &[
        &[0, 2, 1],
        &[3, 4, 5],
        &[0, 1, 4, 3],
        &[1, 2, 5, 4],
        &[2, 0, 3, 5],
    ],
    edge_connect: &[
        &[0, 1],
        &[1, 2],
        &[2, 0],
        &[3, 4],
        &[4, 5],
        &[5, 3],
        &[0, 3],
        &[1, 4],
        &[2, 5],
    ],
};

const PYRAMID_INFO: ElementInfo = ElementInfo {
    element_type: ElementType::Pyramid,
    dimension: 3,
    n_vertices: 5,
    n_edges: 8,
    n_faces: 5,
    face_type: &[
        ElementType::Quad,
        ElementType::Triangle,
        ElementType::Triangle,
        ElementType::Triangle,
        ElementType::Triangle,
    ],
    face_connect: &[
        &[0, 3, 2, 1],
        &[0, 1, 4],
        &[1, 2, 4],
        &[2, 3, 4],
        &[3, 0, 4],
    ],
    edge_connect: &[
        &[0, 1],
        &[1, 2],
        &[2, 3],
        &[3, 0],
        &[0, 4],
        &[1, 4],
        &[2, 4],
        &[3, 4],
    ],
};

impl ElementType {
    /// True if the shape has an entry in the reference table. Polygons and
    /// polyhedra describe their connectivity inline per cell.
    pub fn has_reference_info(&self) -> bool {
        !matches!(
            self,
            ElementType::Undefined | ElementType::Polygon | ElementType::Polyhedron
        )
    }

    /// The reference connectivity of the shape.
    pub fn info(&self) -> &'static ElementInfo {
        match self {
            ElementType::Undefined | ElementType::Polygon | ElementType::Polyhedron => {
                &UNDEFINED_INFO
            }
            ElementType::Vertex => &VERTEX_INFO,
            ElementType::Line => &LINE_INFO,
            ElementType::Triangle => &TRIANGLE_INFO,
            ElementType::Quad => &QUAD_INFO,
            ElementType::Pixel => &PIXEL_INFO,
            ElementType::Tetra => &TETRA_INFO,
            ElementType::Hexahedron => &HEXAHEDRON_INFO,
            ElementType::Voxel => &VOXEL_INFO,
            ElementType::Wedge => &WEDGE_INFO,
            ElementType::Pyramid => &PYRAMID_INFO,
        }
    }

    /// The numeric tag used in the cell binary stream.
    pub fn tag(&self) -> u8 {
        *self as u8
    }

    /// Recover a shape from its binary tag.
    pub fn from_tag(tag: u8) -> Option<ElementType> {
        Some(match tag {
            0 => ElementType::Undefined,
            1 => ElementType::Vertex,
            2 => ElementType::Line,
            3 => ElementType::Triangle,
            4 => ElementType::Quad,
            5 => ElementType::Pixel,
            6 => ElementType::Tetra,
            7 => ElementType::Hexahedron,
            8 => ElementType::Voxel,
            9 => ElementType::Wedge,
            10 => ElementType::Pyramid,
            11 => ElementType::Polygon,
            12 => ElementType::Polyhedron,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_counts_match_connectivity() {
        for element_type in [
            ElementType::Vertex,
            ElementType::Line,
            ElementType::Triangle,
            ElementType::Quad,
            ElementType::Pixel,
            ElementType::Tetra,
            ElementType::Hexahedron,
            ElementType::Voxel,
            ElementType::Wedge,
            ElementType::Pyramid,
        ] {
            let info = element_type.info();
            assert_eq!(info.element_type, element_type);
            assert_eq!(info.face_connect.len(), info.n_faces);
            assert_eq!(info.face_type.len(), info.n_faces);
            assert_eq!(info.edge_connect.len(), info.n_edges);

            for (face, connect) in info.face_connect.iter().enumerate() {
                assert_eq!(connect.len(), info.face_type[face].info().n_vertices);
                for &vertex in connect.iter() {
                    assert!(vertex < info.n_vertices);
                }
            }
        }
    }

    #[test]
    fn test_voxel_faces_span_the_cube() {
        let info = ElementType::Voxel.info();

        // Every corner appears in exactly three of the six faces.
        let mut uses = [0usize; 8];
        for connect in info.face_connect {
            for &vertex in connect.iter() {
                uses[vertex] += 1;
            }
        }
        assert_eq!(uses, [3; 8]);
    }

    #[test]
    fn test_polygon_has_no_reference_info() {
        assert!(!ElementType::Polygon.has_reference_info());
        assert!(!ElementType::Polyhedron.has_reference_info());
        assert!(ElementType::Voxel.has_reference_info());
        assert_eq!(ElementType::Polygon.info().n_vertices, 0);
    }

    #[test]
    fn test_tag_roundtrip() {
        for tag in 0..13u8 {
            let element_type = ElementType::from_tag(tag).unwrap();
            assert_eq!(element_type.tag(), tag);
        }
        assert!(ElementType::from_tag(13).is_none());
    }
}
