//! Cell-pair interactions and the bookkeeping that turns them into kernel
//! work: admissibility classification, memory-bounded batching, and the
//! slot layout that gives every field write a private destination.

use std::mem;

use crate::kernel::{DeviceNode, NODE_CHILDREN};
use crate::vector::Scalar;

/// A pair of tree cells whose mutual interaction still has to be computed
/// somehow: refined into child pairs, evaluated through the peer's multipole
/// expansion (admissible), or summed leaf against leaf (neither).
///
/// The all-zero value is the placeholder refinement kernels emit for unused
/// lanes; a real pair never references the root on one side only, so the
/// encoding is unambiguous.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Interaction {
    pub a_index: u32,
    pub b_index: u32,
    /// Slot of this pair among `a`'s pairs of the same kind, assigned while
    /// a batch is planned. Dense per node.
    pub a_slot: u32,
    pub b_slot: u32,
    /// Far enough apart for the multipole expansion.
    pub admissible: bool,
    /// Needs another round of refinement into child pairs.
    pub refinable: bool,
}

impl Interaction {
    pub fn is_placeholder(&self) -> bool {
        self.a_index == 0 && self.b_index == 0 && !self.refinable
    }
}

/// Classifies the pair `(a, b)`, normalizing order so `a <= b`. Returns
/// `None` for pairs that cannot contribute (an empty side), which the
/// refinement kernel encodes as a placeholder lane.
///
/// Distinct cells are admissible when `s/r <= theta`, with `s` the larger
/// cell extent and `r` the center distance (compared squared, so `theta = 0`
/// admits nothing). A pair refines while at least one side has children;
/// only a leaf-node against a leaf-node becomes a near pair, which is what
/// keeps the near-field slot layout per leaf-node exact.
pub(crate) fn classify<S: Scalar>(
    nodes: &[DeviceNode<S>],
    a: u32,
    b: u32,
    theta: S,
) -> Option<Interaction> {
    let (a, b) = if a <= b { (a, b) } else { (b, a) };
    let node_a = &nodes[a as usize];
    let node_b = &nodes[b as usize];
    if node_a.leaf_count == 0 || node_b.leaf_count == 0 {
        return None;
    }
    if a == b {
        if !node_a.has_children && node_a.leaf_count < 2 {
            return None;
        }
        return Some(Interaction {
            a_index: a,
            b_index: b,
            a_slot: 0,
            b_slot: 0,
            admissible: false,
            refinable: node_a.has_children,
        });
    }
    let size = node_a
        .dimensions
        .max_element()
        .max(node_b.dimensions.max_element());
    let r2 = (node_a.center() - node_b.center()).magnitude_squared();
    let admissible = size * size <= theta * theta * r2;
    let refinable = !admissible && (node_a.has_children || node_b.has_children);
    Some(Interaction {
        a_index: a,
        b_index: b,
        a_slot: 0,
        b_slot: 0,
        admissible,
        refinable,
    })
}

/// How many refinable pairs fit in one refinement launch: each input pair
/// fans out into up to `2^D * 2^D` candidate lanes.
pub(crate) fn refine_batch_limit(budget_bytes: u64) -> usize {
    let lane_bytes = (NODE_CHILDREN * NODE_CHILDREN * mem::size_of::<Interaction>()) as u64;
    (budget_bytes / lane_bytes).max(1) as usize
}

/// One near-field launch: pairs with slots assigned, plus the slot layout.
pub(crate) struct NearBatch {
    pub pairs: Vec<Interaction>,
    /// Exclusive prefix over leaves: leaf `l` owns slots
    /// `slot_bases[l]..slot_bases[l + 1]`.
    pub slot_bases: Vec<u32>,
    /// Per node: the largest peer leaf count among its pairs in this batch;
    /// the stride between a leaf's slot blocks.
    pub peer_extents: Vec<u32>,
    pub slot_count: usize,
}

/// Pops pairs off the tail of `pending` until the estimated field storage
/// would blow the budget, then lays out their slots. Always takes at least
/// one pair so the driver makes progress; the estimate doubles each side's
/// leaf count because leaf-nodes at maximum depth can exceed the capacity.
pub(crate) fn plan_near_batch<S: Scalar>(
    nodes: &[DeviceNode<S>],
    leaf_total: usize,
    pending: &mut Vec<Interaction>,
    budget_bytes: u64,
) -> NearBatch {
    let field_bytes = mem::size_of::<crate::vector::Vec3<S>>() as u64;
    let mut pairs = Vec::new();
    let mut usage = 0u64;
    while let Some(pair) = pending.last() {
        let count_a = nodes[pair.a_index as usize].leaf_count as u64;
        let count_b = nodes[pair.b_index as usize].leaf_count as u64;
        let next = 2 * (2 * count_a) * (2 * count_b) * field_bytes;
        if !pairs.is_empty() && usage + next > budget_bytes {
            break;
        }
        usage += next;
        pairs.push(pending.pop().expect("checked by last()"));
    }

    let mut pair_counts = vec![0u32; nodes.len()];
    let mut peer_extents = vec![0u32; nodes.len()];
    for pair in &mut pairs {
        let a = pair.a_index as usize;
        let b = pair.b_index as usize;
        pair.a_slot = pair_counts[a];
        pair_counts[a] += 1;
        peer_extents[a] = peer_extents[a].max(nodes[b].leaf_count);
        if a == b {
            pair.b_slot = pair.a_slot;
        } else {
            pair.b_slot = pair_counts[b];
            pair_counts[b] += 1;
            peer_extents[b] = peer_extents[b].max(nodes[a].leaf_count);
        }
    }

    let slot_bases = leaf_slot_bases(nodes, leaf_total, |node| {
        pair_counts[node] * peer_extents[node]
    });
    let slot_count = slot_bases[leaf_total] as usize;
    NearBatch {
        pairs,
        slot_bases,
        peer_extents,
        slot_count,
    }
}

/// One far-field launch: pairs, slot layout, and the inherited pair counts
/// that place ancestor interactions in every descendant leaf's block.
pub(crate) struct FarBatch {
    pub pairs: Vec<Interaction>,
    pub slot_bases: Vec<u32>,
    /// Per node: how many far pairs its strict ancestors contribute in this
    /// batch. A pair of node `n` lands at offset `inherited[n] + slot`.
    pub inherited: Vec<u32>,
    pub slot_count: usize,
}

pub(crate) fn plan_far_batch<S: Scalar>(
    nodes: &[DeviceNode<S>],
    leaf_total: usize,
    pending: &mut Vec<Interaction>,
    budget_bytes: u64,
) -> FarBatch {
    let field_bytes = mem::size_of::<crate::vector::Vec3<S>>() as u64;
    let mut pairs = Vec::new();
    let mut usage = 0u64;
    while let Some(pair) = pending.last() {
        let count_a = nodes[pair.a_index as usize].leaf_count as u64;
        let count_b = nodes[pair.b_index as usize].leaf_count as u64;
        let next = (2 * count_a + 2 * count_b) * field_bytes;
        if !pairs.is_empty() && usage + next > budget_bytes {
            break;
        }
        usage += next;
        pairs.push(pending.pop().expect("checked by last()"));
    }

    let mut pair_counts = vec![0u32; nodes.len()];
    for pair in &mut pairs {
        let a = pair.a_index as usize;
        let b = pair.b_index as usize;
        pair.a_slot = pair_counts[a];
        pair_counts[a] += 1;
        pair.b_slot = pair_counts[b];
        pair_counts[b] += 1;
    }

    // A node's leaves see its own far pairs and every ancestor's. Pre-order
    // makes the root-down propagation a single forward scan.
    let mut inherited = vec![0u32; nodes.len()];
    for index in 0..nodes.len() {
        if !nodes[index].has_children {
            continue;
        }
        for child in 0..NODE_CHILDREN {
            let child_index = index + nodes[index].child_offsets[child] as usize;
            inherited[child_index] = inherited[index] + pair_counts[index];
        }
    }

    let slot_bases = leaf_slot_bases(nodes, leaf_total, |node| {
        pair_counts[node] + inherited[node]
    });
    let slot_count = slot_bases[leaf_total] as usize;
    FarBatch {
        pairs,
        slot_bases,
        inherited,
        slot_count,
    }
}

// Exclusive prefix sum of per-leaf block widths, walking leaf-nodes in node
// order (which is leaf order).
fn leaf_slot_bases<S: Scalar>(
    nodes: &[DeviceNode<S>],
    leaf_total: usize,
    width_of: impl Fn(usize) -> u32,
) -> Vec<u32> {
    let mut bases = vec![0u32; leaf_total + 1];
    for (index, node) in nodes.iter().enumerate() {
        if node.has_children {
            continue;
        }
        let width = width_of(index);
        for leaf in node.leaf_start..node.leaf_start + node.leaf_count {
            bases[leaf as usize + 1] = bases[leaf as usize] + width;
        }
    }
    bases
}
