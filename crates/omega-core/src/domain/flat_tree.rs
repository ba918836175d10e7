//! # Flat-Tree Addressing
//!
//! Maps a binary tree onto a flat index space. Leaf `i` is `2i`, parents are
//! odd, and the depth of a node is the number of trailing one bits.
//!
//! ```text
//!  depth 2:          3
//!  depth 1:     1         5
//!  depth 0:   0   2     4   6
//! ```

/// Depth of a node (0 for leaves).
pub fn depth(index: u64) -> u64 {
    u64::from(index.trailing_ones())
}

/// Position of a node among the nodes of the same depth.
pub fn offset(index: u64) -> u64 {
    index >> (depth(index) + 1)
}

/// Flat index of the node at `depth` and `offset`.
pub fn index(depth: u64, offset: u64) -> u64 {
    ((1 + 2 * offset) << depth) - 1
}

/// Parent of a node.
pub fn parent(index: u64) -> u64 {
    let d = depth(index);
    self::index(d + 1, offset(index) >> 1)
}

/// Sibling of a node.
pub fn sibling(index: u64) -> u64 {
    let d = depth(index);
    self::index(d, offset(index) ^ 1)
}

/// Left and right children of a parent, `None` for leaves.
pub fn children(index: u64) -> Option<(u64, u64)> {
    if index & 1 == 0 {
        return None;
    }
    let half = 1u64 << (depth(index) - 1);
    Some((index - half, index + half))
}

/// Whether a node is the left child of its parent.
pub fn is_left(index: u64) -> bool {
    offset(index) & 1 == 0
}

/// Leftmost leaf (flat index) under a node.
pub fn left_span(index: u64) -> u64 {
    let d = depth(index);
    if d == 0 {
        index
    } else {
        offset(index) * (2 << d)
    }
}

/// Rightmost leaf (flat index) under a node.
pub fn right_span(index: u64) -> u64 {
    let d = depth(index);
    if d == 0 {
        index
    } else {
        (offset(index) + 1) * (2 << d) - 2
    }
}

/// Number of leaves under a node.
pub fn leaves(index: u64) -> u64 {
    1 << depth(index)
}

/// Half-open block range `[start, end)` covered by a node.
pub fn block_range(index: u64) -> (u64, u64) {
    (left_span(index) / 2, right_span(index) / 2 + 1)
}

/// Whether a node covers only leaves below the flat index `head`.
pub fn is_within(index: u64, head: u64) -> bool {
    right_span(index) < head
}

/// Roots of a tree whose leaves span the flat range `[0, index)`.
///
/// `index` is `2 * length`; returns the minimal set of full subtrees, left
/// to right.
pub fn full_roots(index: u64) -> Vec<u64> {
    let mut result = Vec::new();
    let mut remaining = index / 2;
    let mut offset = 0u64;

    while remaining > 0 {
        let mut factor = 1u64;
        while factor * 2 <= remaining {
            factor *= 2;
        }
        result.push(offset + factor - 1);
        offset += 2 * factor;
        remaining -= factor;
    }

    result
}
