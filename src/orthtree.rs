//! A flat-array orthtree: the generalization of a quadtree/octree to `D`
//! dimensions, storing point leaves with bounded per-node capacity and
//! bounded depth.
//!
//! Both the leaves and the nodes live in plain vectors. Nodes are kept in
//! pre-order (depth-first), so walking the whole tree is a linear scan, and
//! every node's subtree occupies a contiguous run of `nodes[]` while its
//! leaves occupy a contiguous run of `leaves[]`. Tree links are stored as
//! offsets *relative* to the node's own index: when a split or merge shifts a
//! block of nodes, links that stay inside the block remain valid and only the
//! links crossing the edit point need fixing.
//!
//! Downstream passes rely on these layouts directly: the simulation uploads
//! `leaves[]` and `nodes[]` to the executor as-is.

use core::ops::Range;

use crate::error::Error;
use crate::vector::{Scalar, Vector};

pub(crate) const MAX_DIM: usize = 3;
pub(crate) const MAX_CHILDREN: usize = 1 << MAX_DIM;

/// Index of a node in the tree's node array. Stable only until the next
/// mutation of the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

/// Index of a leaf in the tree's leaf array. Stable only until the next
/// mutation of the tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LeafId(pub u32);

/// Tuning knobs for a tree. `node_capacity` of 0 is treated as 1.
#[derive(Clone, Copy, Debug)]
pub struct TreeConfig {
    /// How many leaves a node may hold before it splits.
    pub node_capacity: u32,
    /// Hard bound on subdivision, so leaves at identical (or nearly
    /// identical) positions cannot recurse forever. The depth bound wins
    /// over the capacity bound.
    pub max_depth: u32,
    /// Whether mutations rebalance the structure on their own. When false,
    /// call [`Orthtree::adjust`] to rebalance.
    pub adjust: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            node_capacity: 8,
            max_depth: 32,
            adjust: true,
        }
    }
}

/// A position plus whatever payload the caller stores per point.
#[derive(Clone, Debug)]
pub struct LeafEntry<S: Scalar, L, const D: usize> {
    position: Vector<S, D>,
    pub value: L,
}

impl<S: Scalar, L, const D: usize> LeafEntry<S, L, D> {
    pub fn position(&self) -> Vector<S, D> {
        self.position
    }
}

// The per-node record. The child offset array is sized for the largest
// supported dimension; entries past 2^D are unused. The final in-use entry
// (index 2^D) is the size of this node's whole subtree, which is also the
// offset to its next sibling.
#[derive(Clone, Debug)]
pub(crate) struct NodeEntry<S: Scalar, N, const D: usize> {
    pub(crate) depth: u32,
    pub(crate) has_children: bool,
    pub(crate) child_offsets: [u32; MAX_CHILDREN + 1],
    pub(crate) has_parent: bool,
    pub(crate) parent_offset: i32,
    pub(crate) sibling_index: u32,
    pub(crate) leaf_count: u32,
    pub(crate) leaf_start: u32,
    pub(crate) position: Vector<S, D>,
    pub(crate) dimensions: Vector<S, D>,
    pub(crate) value: N,
}

/// What [`Orthtree::validate`] found wrong, if anything. Mirrors the ways
/// the structural invariants can break; indices refer to the node array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TreeDefect {
    RootHasParent,
    DepthMismatch { node: u32 },
    ChildParentMismatch { node: u32 },
    OffsetMismatch { node: u32 },
    GeometryMismatch { node: u32 },
    LeafRangeMismatch { node: u32 },
    LeafOutOfNode { node: u32, leaf: u32 },
    NodeOverCapacity { node: u32 },
    NodeUnderCapacity { node: u32 },
    CountMismatch,
}

/// The tree itself. `L` is the leaf payload, `N` the per-node aggregate
/// (recomputed by the caller; the tree only defaults it on structural
/// changes), and `D` the embedding dimension (1 to 3).
#[derive(Clone, Debug)]
pub struct Orthtree<S: Scalar, L, N, const D: usize> {
    leaves: Vec<LeafEntry<S, L, D>>,
    nodes: Vec<NodeEntry<S, N, D>>,
    node_capacity: u32,
    max_depth: u32,
    auto_adjust: bool,
    // Follows a single leaf through splice/partition shuffles so insert and
    // move can report where the leaf ended up.
    track: Option<u32>,
}

impl<S, L, N, const D: usize> Orthtree<S, L, N, D>
where
    S: Scalar,
    L: Clone,
    N: Clone + Default,
{
    pub const BRANCH: usize = 1 << D;

    const DIM_OK: () = assert!(D >= 1 && D <= MAX_DIM, "dimension must be 1, 2, or 3");

    /// Creates an empty tree covering the half-open box
    /// `[position, position + dimensions)`.
    pub fn new(
        position: Vector<S, D>,
        dimensions: Vector<S, D>,
        config: TreeConfig,
    ) -> Result<Self, Error> {
        let () = Self::DIM_OK;
        if !(dimensions.min_element() > S::zero()) {
            return Err(Error::InvalidConfig(
                "tree dimensions must be positive in every axis".into(),
            ));
        }
        let mut root = NodeEntry {
            depth: 0,
            has_children: false,
            child_offsets: [0; MAX_CHILDREN + 1],
            has_parent: false,
            parent_offset: 0,
            sibling_index: 0,
            leaf_count: 0,
            leaf_start: 0,
            position,
            dimensions,
            value: N::default(),
        };
        root.child_offsets[Self::BRANCH] = 1;
        Ok(Self {
            leaves: Vec::new(),
            nodes: vec![root],
            node_capacity: config.node_capacity.max(1),
            max_depth: config.max_depth,
            auto_adjust: config.adjust,
            track: None,
        })
    }

    /// Builds a tree from a batch of leaves in one pass. Much cheaper than
    /// repeated `insert` because the structure is settled once at the end.
    /// The input order is preserved within each final node.
    pub fn bulk_load<I>(
        position: Vector<S, D>,
        dimensions: Vector<S, D>,
        config: TreeConfig,
        items: I,
    ) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (L, Vector<S, D>)>,
    {
        let mut tree = Self::new(position, dimensions, config)?;
        for (value, point) in items {
            if !tree.contains_point(0, point) {
                return Err(Error::OutOfBounds);
            }
            tree.leaves.push(LeafEntry {
                position: point,
                value,
            });
        }
        tree.nodes[0].leaf_count = tree.leaves.len() as u32;
        tree.adjust_subtree(0);
        Ok(tree)
    }

    pub fn node_capacity(&self) -> u32 {
        self.node_capacity
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn auto_adjust(&self) -> bool {
        self.auto_adjust
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// All leaves, in depth-first tree order.
    pub fn leaves(&self) -> &[LeafEntry<S, L, D>] {
        &self.leaves
    }

    pub fn leaf(&self, leaf: LeafId) -> &LeafEntry<S, L, D> {
        &self.leaves[leaf.0 as usize]
    }

    pub fn leaf_handle(&self, leaf: LeafId) -> LeafHandle<'_, S, L, N, D> {
        assert!((leaf.0 as usize) < self.leaves.len(), "leaf index out of range");
        LeafHandle {
            tree: self,
            index: leaf.0,
        }
    }

    /// Handles over all leaves, in depth-first tree order.
    pub fn leaf_handles(&self) -> impl Iterator<Item = LeafHandle<'_, S, L, N, D>> {
        (0..self.leaves.len() as u32).map(move |index| LeafHandle { tree: self, index })
    }

    /// Mutable access to the leaf payloads, in leaf order. Positions stay
    /// under the tree's control; use [`Orthtree::move_leaf`] to change them.
    pub fn leaf_values_mut(&mut self) -> impl Iterator<Item = &mut L> {
        self.leaves.iter_mut().map(|leaf| &mut leaf.value)
    }

    pub fn root(&self) -> NodeHandle<'_, S, L, N, D> {
        NodeHandle {
            tree: self,
            index: 0,
        }
    }

    pub fn node(&self, node: NodeId) -> NodeHandle<'_, S, L, N, D> {
        assert!((node.0 as usize) < self.nodes.len(), "node index out of range");
        NodeHandle {
            tree: self,
            index: node.0,
        }
    }

    /// All nodes in depth-first (pre-order) order, which is also array order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeHandle<'_, S, L, N, D>> {
        (0..self.nodes.len() as u32).map(move |index| NodeHandle { tree: self, index })
    }

    /// Finds the leaf-node whose box contains `point`, or `None` when the
    /// point is outside the root.
    pub fn find(&self, point: Vector<S, D>) -> Option<NodeId> {
        self.find_from_index(0, point).map(NodeId)
    }

    /// Like [`Orthtree::find`], but starts searching at `hint`, climbing to
    /// the first ancestor that contains the point before descending. Cheap
    /// when the answer is near the hint.
    pub fn find_from(&self, hint: NodeId, point: Vector<S, D>) -> Option<NodeId> {
        self.find_from_index(hint.0, point).map(NodeId)
    }

    /// The leaf-node whose leaf range covers `leaf`.
    pub fn find_leaf_node(&self, leaf: LeafId) -> NodeId {
        NodeId(self.find_leaf_node_index(leaf.0))
    }

    /// Adds a leaf, splitting the destination node if it goes over capacity
    /// (and the tree auto-adjusts). Returns the leaf-node that ended up
    /// holding the leaf, and the leaf's index.
    pub fn insert(&mut self, value: L, position: Vector<S, D>) -> Result<(NodeId, LeafId), Error> {
        self.insert_with_hint(NodeId(0), value, position)
    }

    pub fn insert_with_hint(
        &mut self,
        hint: NodeId,
        value: L,
        position: Vector<S, D>,
    ) -> Result<(NodeId, LeafId), Error> {
        let node = self
            .find_from_index(hint.0.min(self.nodes.len() as u32 - 1), position)
            .ok_or(Error::OutOfBounds)?;

        let leaf_index = self.nodes[node as usize].leaf_start + self.nodes[node as usize].leaf_count;
        self.leaves.insert(
            leaf_index as usize,
            LeafEntry {
                position,
                value,
            },
        );
        for entry in &mut self.nodes[node as usize + 1..] {
            entry.leaf_start += 1;
        }
        let mut cursor = node;
        loop {
            self.nodes[cursor as usize].leaf_count += 1;
            match self.parent_index(cursor) {
                Some(parent) => cursor = parent,
                None => break,
            }
        }

        let mut final_leaf = leaf_index;
        if self.auto_adjust {
            self.track = Some(leaf_index);
            self.split_if_needed(node);
            if let Some(tracked) = self.track.take() {
                final_leaf = tracked;
            }
        }
        let final_node = self.find_leaf_node_index(final_leaf);
        Ok((NodeId(final_node), LeafId(final_leaf)))
    }

    /// Removes a leaf and returns its payload plus the node it was removed
    /// from (after any merge collapsed the lineage).
    pub fn erase(&mut self, leaf: LeafId) -> (L, NodeId) {
        assert!((leaf.0 as usize) < self.leaves.len(), "leaf index out of range");
        let node = self.find_leaf_node_index(leaf.0);
        let entry = self.leaves.remove(leaf.0 as usize);

        for record in &mut self.nodes[node as usize + 1..] {
            record.leaf_start -= 1;
        }
        let mut cursor = node;
        loop {
            self.nodes[cursor as usize].leaf_count -= 1;
            match self.parent_index(cursor) {
                Some(parent) => cursor = parent,
                None => break,
            }
        }

        let mut result = node;
        if self.auto_adjust {
            if let Some(merged) = self.merge_candidate(node) {
                self.merge(merged);
                result = merged;
            }
        }
        (entry.value, NodeId(result))
    }

    /// Repositions a leaf. When the new position stays inside the leaf's
    /// current node the update is in place; otherwise the leaf is spliced
    /// between the two contiguous ranges and both lineages are rebalanced.
    /// Returns `(source node, destination node, leaf)`.
    pub fn move_leaf(
        &mut self,
        leaf: LeafId,
        position: Vector<S, D>,
    ) -> Result<(NodeId, NodeId, LeafId), Error> {
        assert!((leaf.0 as usize) < self.leaves.len(), "leaf index out of range");
        let source = self.find_leaf_node_index(leaf.0);
        if self.contains_point(source, position) {
            self.leaves[leaf.0 as usize].position = position;
            return Ok((NodeId(source), NodeId(source), leaf));
        }
        let dest = self.find_from_index(source, position).ok_or(Error::OutOfBounds)?;

        // Detach from the source range.
        for record in &mut self.nodes[source as usize + 1..] {
            record.leaf_start -= 1;
        }
        let mut cursor = source;
        loop {
            self.nodes[cursor as usize].leaf_count -= 1;
            match self.parent_index(cursor) {
                Some(parent) => cursor = parent,
                None => break,
            }
        }

        // Splice into the end of the destination range.
        let dest_index = self.nodes[dest as usize].leaf_start + self.nodes[dest as usize].leaf_count;
        let mut entry = self.leaves.remove(leaf.0 as usize);
        entry.position = position;
        self.leaves.insert(dest_index as usize, entry);
        for record in &mut self.nodes[dest as usize + 1..] {
            record.leaf_start += 1;
        }
        cursor = dest;
        loop {
            self.nodes[cursor as usize].leaf_count += 1;
            match self.parent_index(cursor) {
                Some(parent) => cursor = parent,
                None => break,
            }
        }

        let mut source_result = source;
        let mut final_leaf = dest_index;
        if self.auto_adjust {
            if let Some(merged) = self.merge_candidate(source) {
                self.merge(merged);
                source_result = merged;
            }
            // Node indices may have shifted; locate the destination again.
            let dest_node = self.find_leaf_node_index(final_leaf);
            self.track = Some(final_leaf);
            self.split_if_needed(dest_node);
            if let Some(tracked) = self.track.take() {
                final_leaf = tracked;
            }
        }
        let dest_result = self.find_leaf_node_index(final_leaf);
        Ok((NodeId(source_result), NodeId(dest_result), LeafId(final_leaf)))
    }

    /// Rebalances the whole tree: splits over-capacity leaf-nodes and merges
    /// internal nodes whose subtree fits in one node. Post-order, so a merge
    /// sees its children already settled. Returns whether anything changed.
    /// Idempotent: a second call right after is always a no-op.
    pub fn adjust(&mut self) -> bool {
        self.adjust_subtree(0)
    }

    /// Rebalances a single subtree.
    pub fn adjust_node(&mut self, node: NodeId) -> bool {
        assert!((node.0 as usize) < self.nodes.len(), "node index out of range");
        self.adjust_subtree(node.0)
    }

    /// Replaces every leaf position at once and rebuilds the node structure.
    /// Fails with `OutOfBounds` (leaving the tree untouched) if any position
    /// falls outside the root box. Leaf order is preserved up to the
    /// partition into nodes, which keeps rebuilds deterministic.
    pub fn rebuild_positions(&mut self, positions: &[Vector<S, D>]) -> Result<(), Error> {
        assert_eq!(positions.len(), self.leaves.len(), "one position per leaf");
        for &point in positions {
            if !self.contains_point(0, point) {
                return Err(Error::OutOfBounds);
            }
        }
        for (leaf, &point) in self.leaves.iter_mut().zip(positions) {
            leaf.position = point;
        }
        self.nodes.truncate(1);
        let root = &mut self.nodes[0];
        root.has_children = false;
        root.child_offsets = [0; MAX_CHILDREN + 1];
        root.child_offsets[Self::BRANCH] = 1;
        root.leaf_start = 0;
        root.leaf_count = self.leaves.len() as u32;
        root.value = N::default();
        self.adjust_subtree(0);
        Ok(())
    }

    /// Leaf-nodes currently holding more than the capacity. Non-empty only
    /// when the depth bound stopped subdivision (or the tree does not
    /// auto-adjust).
    pub fn over_capacity_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.iter().enumerate().filter_map(|(index, node)| {
            (!node.has_children && node.leaf_count > self.node_capacity)
                .then_some(NodeId(index as u32))
        })
    }

    /// Reports the first over-capacity leaf-node as a `CapacityExceeded`
    /// condition, for callers that want to surface it.
    pub fn check_capacity(&self) -> Result<(), Error> {
        match self.over_capacity_nodes().next() {
            Some(node) => Err(Error::CapacityExceeded {
                node: node.0,
                leaf_count: self.nodes[node.0 as usize].leaf_count,
            }),
            None => Ok(()),
        }
    }

    /// Full structural self-check: pre-order layout, contiguous leaf ranges,
    /// relative-offset consistency, box nesting, and the capacity bounds.
    /// Used heavily by the tests and available for debugging.
    pub fn validate(&self) -> Result<(), TreeDefect> {
        if self.nodes.is_empty() {
            return Err(TreeDefect::CountMismatch);
        }
        if self.nodes[0].has_parent {
            return Err(TreeDefect::RootHasParent);
        }
        if self.nodes[0].leaf_start != 0
            || self.nodes[0].leaf_count as usize != self.leaves.len()
        {
            return Err(TreeDefect::CountMismatch);
        }
        self.validate_subtree(0)?;
        if self.subtree_len(0) as usize != self.nodes.len() {
            return Err(TreeDefect::CountMismatch);
        }
        Ok(())
    }

    // --- internal helpers -------------------------------------------------

    fn node_ref(&self, index: u32) -> &NodeEntry<S, N, D> {
        &self.nodes[index as usize]
    }

    pub(crate) fn node_entries(&self) -> &[NodeEntry<S, N, D>] {
        &self.nodes
    }

    pub(crate) fn node_values_mut(&mut self) -> impl Iterator<Item = &mut N> {
        self.nodes.iter_mut().map(|node| &mut node.value)
    }

    fn subtree_len(&self, index: u32) -> u32 {
        self.node_ref(index).child_offsets[Self::BRANCH]
    }

    fn parent_index(&self, index: u32) -> Option<u32> {
        let node = self.node_ref(index);
        node.has_parent
            .then(|| (index as i64 + node.parent_offset as i64) as u32)
    }

    fn contains_point(&self, index: u32, point: Vector<S, D>) -> bool {
        let node = self.node_ref(index);
        for d in 0..D {
            if !(point[d] >= node.position[d] && point[d] < node.position[d] + node.dimensions[d]) {
                return false;
            }
        }
        true
    }

    // Which child sub-box a point falls in, splitting each axis at the
    // center. Points exactly on the mid-plane land in the upper half, which
    // matches the half-open child boxes.
    fn child_slot(&self, index: u32, point: Vector<S, D>) -> usize {
        let node = self.node_ref(index);
        let mut slot = 0;
        for d in 0..D {
            let mid = node.position[d] + node.dimensions[d] * S::from_f64(0.5);
            if point[d] >= mid {
                slot |= 1 << d;
            }
        }
        slot
    }

    fn find_from_index(&self, hint: u32, point: Vector<S, D>) -> Option<u32> {
        let mut index = hint;
        while !self.contains_point(index, point) {
            index = self.parent_index(index)?;
        }
        while self.node_ref(index).has_children {
            let slot = self.child_slot(index, point);
            index += self.node_ref(index).child_offsets[slot];
        }
        Some(index)
    }

    fn find_leaf_node_index(&self, leaf: u32) -> u32 {
        debug_assert!((leaf as usize) < self.leaves.len());
        let mut index = 0;
        'descend: while self.node_ref(index).has_children {
            for child in 0..Self::BRANCH {
                let child_index = index + self.node_ref(index).child_offsets[child];
                let entry = self.node_ref(child_index);
                if leaf >= entry.leaf_start && leaf < entry.leaf_start + entry.leaf_count {
                    index = child_index;
                    continue 'descend;
                }
            }
            unreachable!("leaf ranges of the children must partition the parent's");
        }
        index
    }

    fn over_capacity(&self, index: u32) -> bool {
        self.node_ref(index).leaf_count > self.node_capacity
    }

    fn split_if_needed(&mut self, index: u32) {
        if self.node_ref(index).has_children
            || !self.over_capacity(index)
            || self.node_ref(index).depth >= self.max_depth
        {
            return;
        }
        self.split(index);
        for child in 0..Self::BRANCH {
            // Re-read the offset each round: a nested split of an earlier
            // child shifts the later ones.
            let child_index = index + self.node_ref(index).child_offsets[child];
            self.split_if_needed(child_index);
        }
    }

    // Divides a leaf-node into 2^D children and partitions its leaves among
    // them, stably, so rebuilds from an already-ordered leaf array are
    // identity permutations.
    fn split(&mut self, index: u32) {
        debug_assert!(!self.node_ref(index).has_children);
        let branch = Self::BRANCH;
        let half = self.node_ref(index).dimensions * S::from_f64(0.5);
        let origin = self.node_ref(index).position;
        let depth = self.node_ref(index).depth;
        let leaf_start = self.node_ref(index).leaf_start;
        let leaf_count = self.node_ref(index).leaf_count;

        let start = leaf_start as usize;
        let count = leaf_count as usize;
        let mut slots = vec![0usize; count];
        let mut counts = [0u32; MAX_CHILDREN];
        for (offset, slot) in slots.iter_mut().enumerate() {
            *slot = self.child_slot(index, self.leaves[start + offset].position);
            counts[*slot] += 1;
        }
        let mut starts = [0u32; MAX_CHILDREN];
        let mut running = 0;
        for child in 0..branch {
            starts[child] = running;
            running += counts[child];
        }

        // Stable scatter into child order.
        let mut cursors = starts;
        let mut scattered: Vec<Option<LeafEntry<S, L, D>>> = vec![None; count];
        for (offset, &slot) in slots.iter().enumerate() {
            let dest = cursors[slot] as usize;
            cursors[slot] += 1;
            scattered[dest] = Some(self.leaves[start + offset].clone());
            if self.track == Some((start + offset) as u32) {
                self.track = Some((start + dest) as u32);
            }
        }
        for (offset, entry) in scattered.into_iter().enumerate() {
            self.leaves[start + offset] = entry.expect("scatter fills every slot");
        }

        let children: Vec<NodeEntry<S, N, D>> = (0..branch)
            .map(|child| {
                let mut position = origin;
                for d in 0..D {
                    if child & (1 << d) != 0 {
                        position[d] += half[d];
                    }
                }
                let mut child_offsets = [0; MAX_CHILDREN + 1];
                child_offsets[branch] = 1;
                NodeEntry {
                    depth: depth + 1,
                    has_children: false,
                    child_offsets,
                    has_parent: true,
                    parent_offset: -(1 + child as i32),
                    sibling_index: child as u32,
                    leaf_count: counts[child],
                    leaf_start: leaf_start + starts[child],
                    position,
                    dimensions: half,
                    value: N::default(),
                }
            })
            .collect();
        let at = index as usize + 1;
        self.nodes.splice(at..at, children);

        let node = &mut self.nodes[index as usize];
        node.has_children = true;
        for child in 0..branch {
            node.child_offsets[child] = 1 + child as u32;
        }
        node.child_offsets[branch] = 1 + branch as u32;

        self.shift_crossing_links(index, branch as i64);
    }

    // Collapses the subtree under `index` back into a single leaf-node. The
    // leaves do not move: the subtree's leaf range was already contiguous.
    fn merge(&mut self, index: u32) {
        let span = self.subtree_len(index);
        let removed = span as i64 - 1;
        if removed == 0 {
            return;
        }
        let at = index as usize;
        self.nodes.drain(at + 1..at + span as usize);
        let node = &mut self.nodes[at];
        node.has_children = false;
        node.child_offsets = [0; MAX_CHILDREN + 1];
        node.child_offsets[Self::BRANCH] = 1;
        self.shift_crossing_links(index, -removed);
    }

    // After the node array grew or shrank by `delta` entries just past
    // `index`, fix the links that cross the edit point: for every ancestor,
    // the offsets to the branches after ours, the subtree span, and the
    // parent offsets of the shifted siblings. Links wholly on either side
    // are relative and stay valid untouched.
    fn shift_crossing_links(&mut self, index: u32, delta: i64) {
        let branch = Self::BRANCH;
        let mut cursor = index;
        while let Some(parent) = self.parent_index(cursor) {
            let after = self.node_ref(cursor).sibling_index as usize + 1;
            for child in after..branch {
                let offset =
                    (self.nodes[parent as usize].child_offsets[child] as i64 + delta) as u32;
                self.nodes[parent as usize].child_offsets[child] = offset;
                let sibling = (parent as i64 + offset as i64) as usize;
                self.nodes[sibling].parent_offset =
                    (self.nodes[sibling].parent_offset as i64 - delta) as i32;
            }
            self.nodes[parent as usize].child_offsets[branch] =
                (self.nodes[parent as usize].child_offsets[branch] as i64 + delta) as u32;
            cursor = parent;
        }
    }

    // The highest ancestor of `index` (inclusive of internal ancestors only)
    // whose whole subtree now fits within the node capacity.
    fn merge_candidate(&self, index: u32) -> Option<u32> {
        let mut candidate = None;
        let mut cursor = index;
        while let Some(parent) = self.parent_index(cursor) {
            if self.node_ref(parent).leaf_count <= self.node_capacity {
                candidate = Some(parent);
            }
            cursor = parent;
        }
        candidate
    }

    fn adjust_subtree(&mut self, index: u32) -> bool {
        let mut changed = false;
        if self.node_ref(index).has_children {
            for child in 0..Self::BRANCH {
                let child_index = index + self.node_ref(index).child_offsets[child];
                changed |= self.adjust_subtree(child_index);
            }
            if self.node_ref(index).leaf_count <= self.node_capacity {
                self.merge(index);
                changed = true;
            }
        } else if self.over_capacity(index) && self.node_ref(index).depth < self.max_depth {
            self.split_if_needed(index);
            changed = true;
        }
        changed
    }

    fn validate_subtree(&self, index: u32) -> Result<(), TreeDefect> {
        let branch = Self::BRANCH;
        let node = self.node_ref(index);
        if !node.has_children {
            if self.subtree_len(index) != 1 {
                return Err(TreeDefect::OffsetMismatch { node: index });
            }
            if self.auto_adjust
                && node.leaf_count > self.node_capacity
                && node.depth < self.max_depth
            {
                return Err(TreeDefect::NodeOverCapacity { node: index });
            }
            for leaf in node.leaf_start..node.leaf_start + node.leaf_count {
                if !self.contains_point(index, self.leaves[leaf as usize].position) {
                    return Err(TreeDefect::LeafOutOfNode { node: index, leaf });
                }
            }
            return Ok(());
        }

        if self.auto_adjust && node.leaf_count <= self.node_capacity {
            return Err(TreeDefect::NodeUnderCapacity { node: index });
        }
        let half = node.dimensions * S::from_f64(0.5);
        let mut expected_offset = 1u32;
        let mut expected_leaf = node.leaf_start;
        for child in 0..branch {
            if node.child_offsets[child] != expected_offset {
                return Err(TreeDefect::OffsetMismatch { node: index });
            }
            let child_index = index + expected_offset;
            let entry = self.node_ref(child_index);
            if entry.depth != node.depth + 1 {
                return Err(TreeDefect::DepthMismatch { node: child_index });
            }
            if !entry.has_parent
                || entry.parent_offset != -(expected_offset as i32)
                || entry.sibling_index != child as u32
            {
                return Err(TreeDefect::ChildParentMismatch { node: child_index });
            }
            if entry.leaf_start != expected_leaf {
                return Err(TreeDefect::LeafRangeMismatch { node: child_index });
            }
            let mut position = node.position;
            for d in 0..D {
                if child & (1 << d) != 0 {
                    position[d] += half[d];
                }
            }
            if entry.position != position || entry.dimensions != half {
                return Err(TreeDefect::GeometryMismatch { node: child_index });
            }
            self.validate_subtree(child_index)?;
            expected_offset += self.subtree_len(child_index);
            expected_leaf += entry.leaf_count;
        }
        if node.child_offsets[branch] != expected_offset {
            return Err(TreeDefect::OffsetMismatch { node: index });
        }
        if expected_leaf - node.leaf_start != node.leaf_count {
            return Err(TreeDefect::LeafRangeMismatch { node: index });
        }
        Ok(())
    }
}

/// Read-only view of one node, with navigation. Handles borrow the tree, so
/// any mutation invalidates them (the borrow checker enforces this).
pub struct NodeHandle<'t, S: Scalar, L, N, const D: usize> {
    tree: &'t Orthtree<S, L, N, D>,
    index: u32,
}

impl<S: Scalar, L, N, const D: usize> Clone for NodeHandle<'_, S, L, N, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: Scalar, L, N, const D: usize> Copy for NodeHandle<'_, S, L, N, D> {}

impl<'t, S, L, N, const D: usize> NodeHandle<'t, S, L, N, D>
where
    S: Scalar,
    L: Clone,
    N: Clone + Default,
{
    pub fn id(&self) -> NodeId {
        NodeId(self.index)
    }

    fn entry(&self) -> &'t NodeEntry<S, N, D> {
        &self.tree.nodes[self.index as usize]
    }

    pub fn depth(&self) -> u32 {
        self.entry().depth
    }

    pub fn has_children(&self) -> bool {
        self.entry().has_children
    }

    pub fn is_leaf_node(&self) -> bool {
        !self.entry().has_children
    }

    pub fn has_parent(&self) -> bool {
        self.entry().has_parent
    }

    pub fn sibling_index(&self) -> u32 {
        self.entry().sibling_index
    }

    pub fn parent(&self) -> Option<Self> {
        self.tree.parent_index(self.index).map(|index| NodeHandle {
            tree: self.tree,
            index,
        })
    }

    pub fn child(&self, slot: usize) -> Option<Self> {
        (self.has_children() && slot < Orthtree::<S, L, N, D>::BRANCH).then(|| NodeHandle {
            tree: self.tree,
            index: self.index + self.entry().child_offsets[slot],
        })
    }

    pub fn children(self) -> impl Iterator<Item = NodeHandle<'t, S, L, N, D>> {
        let count = if self.has_children() {
            Orthtree::<S, L, N, D>::BRANCH
        } else {
            0
        };
        (0..count).map(move |slot| NodeHandle {
            tree: self.tree,
            index: self.index + self.entry().child_offsets[slot],
        })
    }

    /// Size of this node's subtree, itself included. Adding it to the node's
    /// own index gives the next sibling (or past-the-end).
    pub fn subtree_size(&self) -> usize {
        self.tree.subtree_len(self.index) as usize
    }

    /// Every node below this one, in depth-first order.
    pub fn descendants(self) -> impl Iterator<Item = NodeHandle<'t, S, L, N, D>> {
        let span = self.tree.subtree_len(self.index);
        (self.index + 1..self.index + span).map(move |index| NodeHandle {
            tree: self.tree,
            index,
        })
    }

    pub fn leaf_range(&self) -> Range<usize> {
        let entry = self.entry();
        entry.leaf_start as usize..(entry.leaf_start + entry.leaf_count) as usize
    }

    pub fn leaves(&self) -> &'t [LeafEntry<S, L, D>] {
        &self.tree.leaves[self.leaf_range()]
    }

    pub fn leaf_count(&self) -> usize {
        self.entry().leaf_count as usize
    }

    pub fn position(&self) -> Vector<S, D> {
        self.entry().position
    }

    pub fn dimensions(&self) -> Vector<S, D> {
        self.entry().dimensions
    }

    pub fn center(&self) -> Vector<S, D> {
        self.entry().position + self.entry().dimensions * S::from_f64(0.5)
    }

    pub fn value(&self) -> &'t N {
        &self.entry().value
    }

    pub fn contains(&self, point: Vector<S, D>) -> bool {
        self.tree.contains_point(self.index, point)
    }

    pub fn contains_leaf(&self, leaf: LeafId) -> bool {
        let entry = self.entry();
        leaf.0 >= entry.leaf_start && leaf.0 < entry.leaf_start + entry.leaf_count
    }
}

/// Read-only view of one leaf. The leaf analogue of [`NodeHandle`].
pub struct LeafHandle<'t, S: Scalar, L, N, const D: usize> {
    tree: &'t Orthtree<S, L, N, D>,
    index: u32,
}

impl<S: Scalar, L, N, const D: usize> Clone for LeafHandle<'_, S, L, N, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S: Scalar, L, N, const D: usize> Copy for LeafHandle<'_, S, L, N, D> {}

impl<'t, S, L, N, const D: usize> LeafHandle<'t, S, L, N, D>
where
    S: Scalar,
    L: Clone,
    N: Clone + Default,
{
    pub fn id(&self) -> LeafId {
        LeafId(self.index)
    }

    pub fn position(&self) -> Vector<S, D> {
        self.tree.leaves[self.index as usize].position
    }

    pub fn value(&self) -> &'t L {
        &self.tree.leaves[self.index as usize].value
    }

    /// The leaf-node this leaf currently lives in.
    pub fn node(&self) -> NodeHandle<'t, S, L, N, D> {
        NodeHandle {
            tree: self.tree,
            index: self.tree.find_leaf_node_index(self.index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::Vec3;

    type TestTree = Orthtree<f64, usize, (), 3>;

    fn config(node_capacity: u32, max_depth: u32) -> TreeConfig {
        TreeConfig {
            node_capacity,
            max_depth,
            adjust: true,
        }
    }

    fn cube16() -> (Vec3<f64>, Vec3<f64>) {
        (Vec3::zero(), Vec3::splat(16.0))
    }

    fn tree(node_capacity: u32, max_depth: u32) -> TestTree {
        let (position, dimensions) = cube16();
        Orthtree::new(position, dimensions, config(node_capacity, max_depth)).unwrap()
    }

    // One point per octant of a 16-cube, as in the classic shallow case.
    fn octant_points() -> Vec<Vec3<f64>> {
        let mut points = Vec::new();
        for slot in 0..8u32 {
            let at = |bit: u32| if slot & (1 << bit) != 0 { 12.0 } else { 4.0 };
            points.push(Vec3::new(at(0), at(1), at(2)));
        }
        points
    }

    fn check(tree: &TestTree) {
        if let Err(defect) = tree.validate() {
            panic!("structural defect {defect:?} in tree {tree:?}");
        }
    }

    #[test]
    fn empty_tree_is_a_single_root() {
        let tree = tree(3, 4);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.leaf_count(), 0);
        assert!(tree.root().is_leaf_node());
        check(&tree);
    }

    #[test]
    fn rejects_flat_bounds() {
        let result = TestTree::new(
            Vec3::zero(),
            Vec3::new(1.0, 0.0, 1.0),
            TreeConfig::default(),
        );
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn insert_splits_into_octants() {
        let mut tree = tree(3, 4);
        for (index, point) in octant_points().into_iter().enumerate() {
            tree.insert(index, point).unwrap();
            check(&tree);
        }
        // 8 points with capacity 3: exactly one split.
        assert_eq!(tree.node_count(), 9);
        assert!(tree.root().has_children());
        for child in tree.root().children() {
            assert_eq!(child.leaf_count(), 1);
            assert_eq!(child.depth(), 1);
        }
    }

    #[test]
    fn insert_returns_the_leaf_location() {
        let mut tree = tree(1, 8);
        for (index, point) in octant_points().into_iter().enumerate() {
            let (node, leaf) = tree.insert(index, point).unwrap();
            assert_eq!(tree.leaf(leaf).value, index);
            assert_eq!(tree.leaf(leaf).position(), point);
            assert!(tree.node(node).contains_leaf(leaf));
            assert!(tree.node(node).is_leaf_node());
        }
        check(&tree);
    }

    #[test]
    fn coincident_leaves_stop_at_max_depth() {
        let mut tree = tree(1, 4);
        let point = Vec3::new(13.0, 13.0, 13.0);
        for index in 0..4 {
            tree.insert(index, point).unwrap();
            check(&tree);
        }
        let node = tree.find(point).unwrap();
        let handle = tree.node(node);
        assert_eq!(handle.depth(), 4);
        assert_eq!(handle.leaf_count(), 4);
        assert_eq!(tree.over_capacity_nodes().count(), 1);
        assert!(matches!(
            tree.check_capacity(),
            Err(Error::CapacityExceeded { leaf_count: 4, .. })
        ));
    }

    #[test]
    fn max_depth_zero_keeps_everything_in_the_root() {
        let mut tree = tree(1, 0);
        for (index, point) in octant_points().into_iter().enumerate() {
            tree.insert(index, point).unwrap();
        }
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.root().leaf_count(), 8);
        check(&tree);
    }

    #[test]
    fn capacity_zero_behaves_as_one() {
        let tree = tree(0, 4);
        assert_eq!(tree.node_capacity(), 1);
    }

    #[test]
    fn the_box_is_half_open() {
        let mut tree = tree(3, 4);
        assert!(matches!(
            tree.insert(0, Vec3::new(16.0, 8.0, 8.0)),
            Err(Error::OutOfBounds)
        ));
        assert!(matches!(
            tree.insert(0, Vec3::new(8.0, 8.0, -0.001)),
            Err(Error::OutOfBounds)
        ));
        assert_eq!(tree.leaf_count(), 0);
        // The lower faces are inside.
        tree.insert(0, Vec3::zero()).unwrap();
        assert_eq!(tree.leaf_count(), 1);
        check(&tree);
    }

    #[test]
    fn erase_merges_the_lineage_back() {
        let mut tree = tree(3, 8);
        let points = octant_points();
        for (index, point) in points.iter().enumerate() {
            tree.insert(index, *point).unwrap();
        }
        assert!(tree.root().has_children());
        // Dropping below capacity must collapse to a bare root again.
        for _ in 0..6 {
            tree.erase(LeafId(0));
            check(&tree);
        }
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.leaf_count(), 2);
    }

    #[test]
    fn erase_returns_the_payload() {
        let mut tree = tree(8, 4);
        tree.insert(41, Vec3::new(1.0, 2.0, 3.0)).unwrap();
        let (_, leaf) = tree.insert(42, Vec3::new(9.0, 2.0, 3.0)).unwrap();
        let (value, _) = tree.erase(leaf);
        assert_eq!(value, 42);
        assert_eq!(tree.leaf_count(), 1);
        check(&tree);
    }

    #[test]
    fn move_in_place_keeps_the_structure() {
        let mut tree = tree(3, 4);
        for (index, point) in octant_points().into_iter().enumerate() {
            tree.insert(index, point).unwrap();
        }
        let before = tree.node_count();
        let leaf = LeafId(0);
        let from = tree.find_leaf_node(leaf);
        let position = tree.leaf(leaf).position();
        let nudged = position + Vec3::splat(0.25);
        let (source, dest, moved) = tree.move_leaf(leaf, nudged).unwrap();
        assert_eq!(source, from);
        assert_eq!(dest, from);
        assert_eq!(moved, leaf);
        assert_eq!(tree.node_count(), before);
        assert_eq!(tree.leaf(moved).position(), nudged);
        check(&tree);
    }

    #[test]
    fn move_across_nodes_splices_the_leaf() {
        let mut tree = tree(2, 6);
        let mut leaves = Vec::new();
        for (index, point) in octant_points().into_iter().enumerate() {
            leaves.push(tree.insert(index, point).unwrap().1);
        }
        // Walk one body across the whole box; every step must stay sound.
        let mut leaf = LeafId(0);
        for step in 0..10 {
            let t = step as f64 / 10.0;
            let target = Vec3::new(1.0 + 14.0 * t, 14.0 - 12.0 * t, 2.0 + t);
            let (_, dest, moved) = tree.move_leaf(leaf, target).unwrap();
            assert!(tree.node(dest).contains(target));
            assert_eq!(tree.leaf(moved).position(), target);
            leaf = moved;
            check(&tree);
        }
        assert!(matches!(
            tree.move_leaf(leaf, Vec3::splat(99.0)),
            Err(Error::OutOfBounds)
        ));
        check(&tree);
    }

    #[test]
    fn adjust_is_idempotent() {
        let (position, dimensions) = cube16();
        let mut tree: TestTree = Orthtree::new(
            position,
            dimensions,
            TreeConfig {
                node_capacity: 2,
                max_depth: 6,
                adjust: false,
            },
        )
        .unwrap();
        for (index, point) in octant_points().into_iter().enumerate() {
            tree.insert(index, point).unwrap();
            tree.insert(index + 8, point + Vec3::splat(0.5)).unwrap();
        }
        // Non-adjusting tree: everything still sits in the root.
        assert_eq!(tree.node_count(), 1);

        assert!(tree.adjust());
        let shape: Vec<_> = tree
            .nodes()
            .map(|node| (node.depth(), node.leaf_range(), node.has_children()))
            .collect();
        assert!(!tree.adjust());
        let shape_after: Vec<_> = tree
            .nodes()
            .map(|node| (node.depth(), node.leaf_range(), node.has_children()))
            .collect();
        assert_eq!(shape, shape_after);
    }

    #[test]
    fn leaf_handles_navigate_back_to_their_node() {
        let mut tree = tree(2, 6);
        for (index, point) in octant_points().into_iter().enumerate() {
            tree.insert(index, point).unwrap();
        }
        for handle in tree.leaf_handles() {
            let node = handle.node();
            assert!(node.is_leaf_node());
            assert!(node.contains(handle.position()));
            assert!(node.contains_leaf(handle.id()));
            assert_eq!(tree.leaf(handle.id()).value, *handle.value());
        }
    }

    #[test]
    fn find_with_a_deep_hint_climbs_first() {
        let mut tree = tree(1, 6);
        for (index, point) in octant_points().into_iter().enumerate() {
            tree.insert(index, point).unwrap();
        }
        let deep = tree.find(Vec3::new(4.0, 4.0, 4.0)).unwrap();
        let opposite = Vec3::new(12.0, 12.0, 12.0);
        let found = tree.find_from(deep, opposite).unwrap();
        assert!(tree.node(found).contains(opposite));
        assert!(tree.node(found).is_leaf_node());
    }

    #[test]
    fn descendants_cover_the_subtree_contiguously() {
        let mut tree = tree(1, 6);
        for (index, point) in octant_points().into_iter().enumerate() {
            tree.insert(index, point).unwrap();
            tree.insert(index + 8, point + Vec3::splat(1.0)).unwrap();
        }
        check(&tree);
        let root = tree.root();
        assert_eq!(root.descendants().count(), tree.node_count() - 1);
        for node in tree.nodes() {
            let span = node.subtree_size();
            let mut leaf_total = 0;
            for descendant in node.descendants() {
                assert!(descendant.id().0 > node.id().0);
                assert!((descendant.id().0 as usize) < node.id().0 as usize + span);
                if descendant.is_leaf_node() {
                    leaf_total += descendant.leaf_count();
                }
            }
            if node.has_children() {
                assert_eq!(leaf_total, node.leaf_count());
            }
        }
    }

    #[test]
    fn bulk_load_matches_incremental_structure() {
        let points = octant_points();
        let (position, dimensions) = cube16();
        let loaded: TestTree = Orthtree::bulk_load(
            position,
            dimensions,
            config(3, 4),
            points.iter().enumerate().map(|(index, point)| (index, *point)),
        )
        .unwrap();
        check(&loaded);
        assert_eq!(loaded.leaf_count(), 8);
        assert_eq!(loaded.node_count(), 9);

        let out = Orthtree::<f64, usize, (), 3>::bulk_load(
            position,
            dimensions,
            config(3, 4),
            [(0usize, Vec3::splat(20.0))],
        );
        assert!(matches!(out, Err(Error::OutOfBounds)));
    }

    #[test]
    fn rebuild_positions_reorganizes_in_one_pass() {
        let mut tree = tree(2, 6);
        for (index, point) in octant_points().into_iter().enumerate() {
            tree.insert(index, point).unwrap();
        }
        // Collapse everything into one octant.
        let packed: Vec<_> = (0..8)
            .map(|index| Vec3::new(1.0 + index as f64 * 0.5, 1.0, 1.0))
            .collect();
        tree.rebuild_positions(&packed).unwrap();
        check(&tree);
        for (leaf, expected) in tree.leaves().iter().zip(&packed) {
            assert_eq!(leaf.position(), *expected);
        }

        let out = tree.rebuild_positions(&vec![Vec3::splat(-1.0); 8]);
        assert!(matches!(out, Err(Error::OutOfBounds)));
        // Failed rebuild leaves the tree untouched.
        check(&tree);
        assert_eq!(tree.leaves()[0].position(), packed[0]);
    }

    #[test]
    fn quadtrees_work_too() {
        let mut tree: Orthtree<f32, u8, (), 2> = Orthtree::new(
            Vector([0.0, 0.0]),
            Vector([8.0, 8.0]),
            config(1, 8),
        )
        .unwrap();
        for (index, point) in [[1.0, 1.0], [7.0, 1.0], [1.0, 7.0], [7.0, 7.0], [6.5, 6.5]]
            .into_iter()
            .enumerate()
        {
            tree.insert(index as u8, Vector(point)).unwrap();
        }
        tree.validate().unwrap();
        assert_eq!(tree.root().children().count(), 4);
        assert_eq!(tree.leaf_count(), 5);
    }
}
