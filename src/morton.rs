//! Routines for working with Morton keys.
//!
//! A Morton key packs the interleaved coordinate bits of an octant anchor
//! (48 bits, x in the lowest position of each triplet) together with the
//! refinement level (16 bits). Ordering keys by their raw value yields the
//! Morton pre-order of the tree, which is the order octant arrays are kept
//! in throughout the crate.
//!
//! Two-dimensional domains reuse the same key type: the z index is pinned to
//! zero on every level, and the resulting key order coincides with the
//! two-dimensional Morton order.

use crate::constants::*;

/// A Morton key of an octant: interleaved anchor coordinates plus level.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct MortonKey {
    value: u64,
}

impl MortonKey {
    /// Create a key from its raw value.
    pub fn new(value: u64) -> Self {
        Self { value }
    }

    /// The raw value of the key.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// The root octant covering the whole domain.
    pub fn root() -> Self {
        Self { value: 0 }
    }

    /// Create a key from an anchor index on a given level.
    pub fn from_index_and_level(index: [usize; 3], level: usize) -> MortonKey {
        let level = level as u64;
        debug_assert!(level <= DEEPEST_LEVEL);

        // Boxes on coarser levels are anchored on the deepest-level grid;
        // the box with x-index one on DEEPEST_LEVEL - 1 has x-index two on
        // DEEPEST_LEVEL.
        let level_diff = DEEPEST_LEVEL - level;

        let x = (index[0] as u64) << level_diff;
        let y = (index[1] as u64) << level_diff;
        let z = (index[2] as u64) << level_diff;

        let key: u64 = X_LOOKUP_ENCODE[((x >> BYTE_DISPLACEMENT) & BYTE_MASK) as usize]
            | Y_LOOKUP_ENCODE[((y >> BYTE_DISPLACEMENT) & BYTE_MASK) as usize]
            | Z_LOOKUP_ENCODE[((z >> BYTE_DISPLACEMENT) & BYTE_MASK) as usize];

        let key = (key << 24)
            | X_LOOKUP_ENCODE[(x & BYTE_MASK) as usize]
            | Y_LOOKUP_ENCODE[(y & BYTE_MASK) as usize]
            | Z_LOOKUP_ENCODE[(z & BYTE_MASK) as usize];

        let key = key << LEVEL_DISPLACEMENT;
        Self { value: key | level }
    }

    /// The refinement level of the key.
    pub fn level(&self) -> usize {
        (self.value & LEVEL_MASK) as usize
    }

    /// Decode the key into its level and anchor index on that level.
    pub fn decode(&self) -> (usize, [usize; 3]) {
        fn decode_key_helper(key: u64, lookup_table: &[u64; 512]) -> u64 {
            // 48 bits for the coordinates, processed in groups of 9.
            const N_LOOPS: u64 = 6;
            let mut coord: u64 = 0;

            for index in 0..N_LOOPS {
                coord |=
                    lookup_table[((key >> (index * 9)) & NINE_BIT_MASK) as usize] << (3 * index);
            }

            coord
        }

        let level = self.level();
        let level_diff = DEEPEST_LEVEL - level as u64;

        let key = self.value >> LEVEL_DISPLACEMENT;

        let x = decode_key_helper(key, &X_LOOKUP_DECODE);
        let y = decode_key_helper(key, &Y_LOOKUP_DECODE);
        let z = decode_key_helper(key, &Z_LOOKUP_DECODE);

        let x = x >> level_diff;
        let y = y >> level_diff;
        let z = z >> level_diff;

        (level, [x as usize, y as usize, z as usize])
    }

    /// Anchor index and edge length of the key on the deepest-level grid.
    pub fn logical_box(&self) -> ([u64; 3], u64) {
        let (level, index) = self.decode();
        let side = 1u64 << (DEEPEST_LEVEL - level as u64);
        (
            [
                index[0] as u64 * side,
                index[1] as u64 * side,
                index[2] as u64 * side,
            ],
            side,
        )
    }

    /// The parent of the key.
    pub fn parent(&self) -> Self {
        let level = self.level();
        debug_assert!(level > 0);
        let parent_level = level - 1;
        let key = self.value >> LEVEL_DISPLACEMENT;

        let bit_displacement = 3 * (DEEPEST_LEVEL - parent_level as u64);
        // Sets the last bits to zero and shifts back.
        let key = (key >> bit_displacement) << (bit_displacement + LEVEL_DISPLACEMENT);

        Self {
            value: key | parent_level as u64,
        }
    }

    /// The children of the key in Morton order. A two-dimensional domain
    /// has four children, the z bit of the sibling index staying zero.
    pub fn children(&self, dim: usize) -> Vec<MortonKey> {
        let level = self.level() as u64;
        debug_assert!(level < DEEPEST_LEVEL);

        let child_level = level + 1;
        let shift = LEVEL_DISPLACEMENT + 3 * (DEEPEST_LEVEL - child_level);
        let base = (self.value >> LEVEL_DISPLACEMENT) << LEVEL_DISPLACEMENT;

        (0..1usize << dim)
            .map(|i| Self {
                value: base | ((i as u64) << shift) | child_level,
            })
            .collect()
    }

    /// All siblings of the key (including the key itself) in Morton order.
    pub fn siblings(&self, dim: usize) -> Vec<MortonKey> {
        debug_assert!(self.level() > 0);
        self.parent().children(dim)
    }

    /// The position of the key among its siblings.
    pub fn sibling_index(&self) -> usize {
        let level = self.level() as u64;
        debug_assert!(level > 0);
        let shift = LEVEL_DISPLACEMENT + 3 * (DEEPEST_LEVEL - level);
        ((self.value >> shift) & 0b111) as usize
    }

    /// True if `self` is an ancestor of `other` or identical to `other`.
    pub fn is_ancestor(&self, other: MortonKey) -> bool {
        let level = self.level();
        let other_level = other.level();
        if level > other_level {
            return false;
        }

        let shift = LEVEL_DISPLACEMENT + 3 * (DEEPEST_LEVEL - level as u64);
        if shift >= 64 {
            // The root is an ancestor of everything.
            return true;
        }
        (self.value >> shift) == (other.value >> shift)
    }

    /// The finest common ancestor of two keys.
    pub fn finest_common_ancestor(&self, other: MortonKey) -> MortonKey {
        let common_level = self.level().min(other.level()) as u64;

        let coords1 = self.value >> LEVEL_DISPLACEMENT;
        let coords2 = other.value >> LEVEL_DISPLACEMENT;
        let differing = coords1 ^ coords2;

        let level = if differing == 0 {
            common_level
        } else {
            // The number of agreeing top triplets bounds the ancestor level.
            let msb = 63 - differing.leading_zeros() as u64;
            common_level.min(DEEPEST_LEVEL - 1 - msb / 3)
        };

        let bit_displacement = 3 * (DEEPEST_LEVEL - level);
        let coords = (coords1 >> bit_displacement) << bit_displacement;

        Self {
            value: (coords << LEVEL_DISPLACEMENT) | level,
        }
    }

    /// The first key of the domain on the deepest level.
    pub fn deepest_first() -> Self {
        MortonKey::from_index_and_level([0, 0, 0], DEEPEST_LEVEL as usize)
    }

    /// The last key of the domain on the deepest level.
    pub fn deepest_last(dim: usize) -> Self {
        let max = (LEVEL_SIZE - 1) as usize;
        let index = if dim == 2 {
            [max, max, 0]
        } else {
            [max, max, max]
        };
        MortonKey::from_index_and_level(index, DEEPEST_LEVEL as usize)
    }

    /// The largest raw value taken by any descendant of this key. Together
    /// with `self.value()` this bounds the Morton range of the subtree,
    /// which is what the neighbour search scans.
    pub fn descendant_upper_bound(&self, dim: usize) -> u64 {
        let level = self.level() as u64;
        let triplet = if dim == 2 { 0b011u64 } else { 0b111u64 };

        let mut fill = 0u64;
        let mut t = level;
        while t < DEEPEST_LEVEL {
            fill |= triplet << (3 * (DEEPEST_LEVEL - 1 - t));
            t += 1;
        }

        let coords = (self.value >> LEVEL_DISPLACEMENT) | fill;
        (coords << LEVEL_DISPLACEMENT) | DEEPEST_LEVEL
    }

    /// The same-level neighbour of the key in the given direction, or
    /// `None` when the neighbour falls outside the domain.
    pub fn neighbour(&self, direction: [i64; 3], dim: usize) -> Option<MortonKey> {
        let (level, index) = self.decode();
        let bound = 1i64 << level;

        let mut shifted = [0usize; 3];
        for d in 0..3 {
            let coordinate = index[d] as i64 + direction[d];
            let axis_bound = if d == 2 && dim == 2 { 1 } else { bound };
            if coordinate < 0 || coordinate >= axis_bound {
                return None;
            }
            shifted[d] = coordinate as usize;
        }

        Some(MortonKey::from_index_and_level(shifted, level))
    }

    /// Integer coordinates of the k-th corner node of the octant on the
    /// uniform grid at the deepest level. Far-boundary corners sit at
    /// `2^DEEPEST_LEVEL`, one past the anchor grid.
    pub fn node_index(&self, node: usize) -> [u64; 3] {
        let (anchor, side) = self.logical_box();
        [
            anchor[0] + side * (node & 1) as u64,
            anchor[1] + side * ((node >> 1) & 1) as u64,
            anchor[2] + side * ((node >> 2) & 1) as u64,
        ]
    }

    /// The Morton key of the k-th corner node of the octant in the uniform
    /// grid at the deepest level. This is the canonical vertex stitching
    /// key: two octants share a corner exactly when the node keys coincide.
    pub fn node_key(&self, node: usize) -> u64 {
        fn interleave(value: u64, table: &[u64; 256]) -> u64 {
            (table[((value >> BYTE_DISPLACEMENT) & BYTE_MASK) as usize] << 24)
                | table[(value & BYTE_MASK) as usize]
        }

        let [x, y, z] = self.node_index(node);

        // Corner coordinates have 17 significant bits; the seventeenth bit
        // of each axis lands past the 48 coordinate bits.
        interleave(x & 0xFFFF, &X_LOOKUP_ENCODE)
            | interleave(y & 0xFFFF, &Y_LOOKUP_ENCODE)
            | interleave(z & 0xFFFF, &Z_LOOKUP_ENCODE)
            | ((x >> 16) << 48)
            | ((y >> 16) << 49)
            | ((z >> 16) << 50)
    }
}

impl std::fmt::Debug for MortonKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (level, index) = self.decode();
        f.debug_struct("MortonKey")
            .field("level", &level)
            .field("x", &index[0])
            .field("y", &index[1])
            .field("z", &index[2])
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encoding_decoding() {
        let index: [usize; 3] = [
            LEVEL_SIZE as usize - 1,
            LEVEL_SIZE as usize - 1,
            LEVEL_SIZE as usize - 1,
        ];

        let key = MortonKey::from_index_and_level(index, DEEPEST_LEVEL as usize);

        let (level, actual) = key.decode();

        assert_eq!(level, DEEPEST_LEVEL as usize);
        assert_eq!(index, actual);
    }

    #[test]
    fn test_parent() {
        let index = [15, 39, 45];
        let key = MortonKey::from_index_and_level(index, 9);
        let parent = key.parent();

        let expected_index = [7, 19, 22];
        let (actual_level, actual_index) = parent.decode();
        assert_eq!(actual_level, 8);
        assert_eq!(actual_index, expected_index);
    }

    #[test]
    fn test_children_enumerate_x_fastest() {
        let children = MortonKey::root().children(3);
        assert_eq!(children.len(), 8);

        let expected = [
            [0, 0, 0],
            [1, 0, 0],
            [0, 1, 0],
            [1, 1, 0],
            [0, 0, 1],
            [1, 0, 1],
            [0, 1, 1],
            [1, 1, 1],
        ];
        for (child, index) in children.iter().zip(expected) {
            let (level, actual) = child.decode();
            assert_eq!(level, 1);
            assert_eq!(actual, index);
        }

        // Children are strictly Morton increasing and come after the parent.
        for pair in children.windows(2) {
            assert!(pair[0] < pair[1]);
        }
        assert!(MortonKey::root() < children[0]);
    }

    #[test]
    fn test_children_2d_stay_in_plane() {
        let children = MortonKey::from_index_and_level([1, 2, 0], 2).children(2);
        assert_eq!(children.len(), 4);
        for child in &children {
            let (_, index) = child.decode();
            assert_eq!(index[2], 0);
        }
    }

    #[test]
    fn test_sibling_index() {
        for (i, child) in MortonKey::root().children(3).iter().enumerate() {
            assert_eq!(child.sibling_index(), i);
        }
    }

    #[test]
    fn test_is_ancestor() {
        let key = MortonKey::from_index_and_level([13, 7, 4], 5);
        assert!(MortonKey::root().is_ancestor(key));
        assert!(key.is_ancestor(key));
        assert!(key.parent().is_ancestor(key));
        assert!(!key.is_ancestor(key.parent()));

        let other = MortonKey::from_index_and_level([12, 7, 4], 5);
        assert!(!key.is_ancestor(other));
        assert!(!other.is_ancestor(key));
    }

    #[test]
    fn test_finest_common_ancestor() {
        let key = MortonKey::from_index_and_level([15, 39, 45], 9);
        assert_eq!(key.finest_common_ancestor(key), key);
        assert_eq!(key.finest_common_ancestor(key.parent()), key.parent());

        let a = MortonKey::from_index_and_level([0, 0, 0], 4);
        let b = MortonKey::from_index_and_level([15, 15, 15], 4);
        assert_eq!(a.finest_common_ancestor(b), MortonKey::root());
    }

    #[test]
    fn test_descendant_range() {
        let key = MortonKey::from_index_and_level([1, 0, 0], 1);
        let upper = key.descendant_upper_bound(3);

        let deepest = MortonKey::from_index_and_level(
            [LEVEL_SIZE as usize / 2, 0, 0],
            DEEPEST_LEVEL as usize,
        );
        assert!(key.value() < deepest.value());
        assert!(deepest.value() <= upper);

        for child in key.children(3) {
            assert!(child.value() <= upper);
            assert!(key.is_ancestor(child));
        }

        // The next same-level octant in Morton order lies past the bound.
        let outside = MortonKey::from_index_and_level([0, 1, 0], 1);
        assert!(outside.value() > upper);
    }

    #[test]
    fn test_neighbour() {
        let key = MortonKey::from_index_and_level([3, 4, 5], 4);

        let neighbour = key.neighbour([1, 0, 0], 3).unwrap();
        let (level, index) = neighbour.decode();
        assert_eq!(level, 4);
        assert_eq!(index, [4, 4, 5]);

        // Domain boundary.
        let edge = MortonKey::from_index_and_level([0, 4, 5], 4);
        assert!(edge.neighbour([-1, 0, 0], 3).is_none());
        let last = MortonKey::from_index_and_level([15, 4, 5], 4);
        assert!(last.neighbour([1, 0, 0], 3).is_none());

        // In 2-D the z direction has no neighbours.
        let flat = MortonKey::from_index_and_level([3, 4, 0], 4);
        assert!(flat.neighbour([0, 0, 1], 2).is_none());
        assert!(flat.neighbour([0, 0, -1], 2).is_none());
    }

    #[test]
    fn test_node_keys_stitch_neighbours() {
        // Two face-adjacent octants share the four nodes of the common
        // face: the +x face nodes of the left octant are 1, 3, 5, 7, the
        // -x face nodes of the right octant are 0, 2, 4, 6.
        let left = MortonKey::from_index_and_level([0, 0, 0], 1);
        let right = MortonKey::from_index_and_level([1, 0, 0], 1);
        for (a, b) in [(1, 0), (3, 2), (5, 4), (7, 6)] {
            assert_eq!(left.node_key(a), right.node_key(b));
        }

        // A fine octant touching a coarse octant at a corner produces the
        // same key for the shared node: node 7 of the fine octant anchored
        // at (3, 3, 3) on level 4 is the grid point (4, 4, 4), which is
        // also node 7 of the coarse octant anchored at (0, 0, 0) on level 2.
        let fine = MortonKey::from_index_and_level([3, 3, 3], 4);
        let coarse = MortonKey::from_index_and_level([0, 0, 0], 2);
        assert_eq!(fine.node_key(7), coarse.node_key(7));
    }

    #[test]
    fn test_far_boundary_node_keys_are_distinct() {
        let max = LEVEL_SIZE as usize - 1;
        let corner = MortonKey::from_index_and_level([max, max, max], DEEPEST_LEVEL as usize);

        // All eight node keys of the farthest octant must be distinct even
        // though corner coordinates overflow the 16 bit range.
        let mut keys: Vec<u64> = (0..8).map(|k| corner.node_key(k)).collect();
        keys.sort_unstable();
        keys.dedup();
        assert_eq!(keys.len(), 8);
    }

    #[test]
    fn test_debug_print() {
        let key = MortonKey::from_index_and_level([1, 3, 5], 3);
        let parent = key.parent();

        println!("{:#?}", parent);
    }
}
