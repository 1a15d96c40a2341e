//! The kernel catalogue and its CPU implementations.
//!
//! Each variant of [`Kernel`] is one data-parallel pass of the pipeline,
//! described by the buffers it touches and the explicit element counts it
//! runs over (buffers are usually over-allocated scratch). The CPU executor
//! runs them with rayon; the variants are the contract a device backend
//! would compile real kernels against.
//!
//! Work items never share an output address: moment passes write their own
//! node, and the field passes write into slots laid out ahead of time by the
//! interaction planner. That disjointness is what the scatter writes below
//! rely on.

use itertools::iproduct;
use rayon::prelude::*;
use tracing::trace;

use crate::device::{Buffer, CpuExecutor, Launch, SyncSlice};
use crate::error::Error;
use crate::interaction::{classify, Interaction};
use crate::moment::NodeMoment;
use crate::vector::{Scalar, Vec3};

/// Children per node in the simulation tree (the pipeline runs in 3-D).
pub const NODE_CHILDREN: usize = 8;

/// Leaf record as uploaded to the executor.
#[derive(Clone, Copy, Debug)]
pub struct DeviceLeaf<S: Scalar> {
    pub position: Vec3<S>,
    pub velocity: Vec3<S>,
    pub mass: S,
    pub charge: S,
}

impl<S: Scalar> Default for DeviceLeaf<S> {
    fn default() -> Self {
        Self {
            position: Vec3::zero(),
            velocity: Vec3::zero(),
            mass: S::one(),
            charge: S::zero(),
        }
    }
}

/// Node record as uploaded to the executor: geometry, the links the
/// refinement kernel navigates, the leaf range, and the aggregate moment.
#[derive(Clone, Copy, Debug)]
pub struct DeviceNode<S: Scalar> {
    pub position: Vec3<S>,
    pub dimensions: Vec3<S>,
    pub depth: u32,
    pub has_children: bool,
    pub child_offsets: [u32; NODE_CHILDREN],
    pub leaf_start: u32,
    pub leaf_count: u32,
    pub moment: NodeMoment<S>,
}

impl<S: Scalar> Default for DeviceNode<S> {
    fn default() -> Self {
        Self {
            position: Vec3::zero(),
            dimensions: Vec3::zero(),
            depth: 0,
            has_children: false,
            child_offsets: [0; NODE_CHILDREN],
            leaf_start: 0,
            leaf_count: 0,
            moment: NodeMoment::zero(),
        }
    }
}

impl<S: Scalar> DeviceNode<S> {
    pub fn center(&self) -> Vec3<S> {
        self.position + self.dimensions * S::from_f64(0.5)
    }
}

/// One data-parallel pass. Counts are explicit because scratch buffers are
/// usually larger than the live prefix.
#[derive(Debug)]
pub enum Kernel<S: Scalar> {
    /// One work item per node. Leaf-nodes fold their own leaves into a
    /// moment about the node center and report themselves completed;
    /// internal nodes wait for the wavefront passes.
    MomentsFromLeaves {
        node_count: u32,
        leaves: Buffer<DeviceLeaf<S>>,
        nodes: Buffer<DeviceNode<S>>,
        completions: Buffer<u32>,
    },
    /// One work item per wavefront entry: a node whose children all have
    /// their moments. Folds the children, shifted to the parent center.
    MomentsFromNodes {
        wave_count: u32,
        nodes: Buffer<DeviceNode<S>>,
        wavefront: Buffer<u32>,
        completions: Buffer<u32>,
    },
    /// `pair_count x 64` lanes: every refinable pair fans out into its
    /// candidate child pairs, each classified in place. Unused lanes hold
    /// the placeholder pair.
    RefineInteractions {
        pair_count: u32,
        theta: S,
        nodes: Buffer<DeviceNode<S>>,
        pairs: Buffer<Interaction>,
        candidates: Buffer<Interaction>,
    },
    /// One tile per near pair: direct softened contributions of every leaf
    /// of one side onto every leaf of the other, stored into pre-assigned
    /// slots.
    NearFields {
        pair_count: u32,
        softening: S,
        leaves: Buffer<DeviceLeaf<S>>,
        nodes: Buffer<DeviceNode<S>>,
        pairs: Buffer<Interaction>,
        slot_bases: Buffer<u32>,
        peer_extents: Buffer<u32>,
        fields: Buffer<Vec3<S>>,
    },
    /// One work item per far pair: evaluates the peer's multipole expansion
    /// at each leaf of both sides.
    FarFields {
        pair_count: u32,
        leaves: Buffer<DeviceLeaf<S>>,
        nodes: Buffer<DeviceNode<S>>,
        pairs: Buffer<Interaction>,
        slot_bases: Buffer<u32>,
        inherited: Buffer<u32>,
        fields: Buffer<Vec3<S>>,
    },
    /// One work item per leaf: folds the leaf's field slots into its force,
    /// accumulating across batches.
    ForcesFromFields {
        leaf_count: u32,
        force_constant: S,
        leaves: Buffer<DeviceLeaf<S>>,
        slot_bases: Buffer<u32>,
        fields: Buffer<Vec3<S>>,
        forces: Buffer<Vec3<S>>,
    },
    /// One work item per leaf: kick the velocity with the current force,
    /// drift the position with the pre-kick velocity.
    Leapfrog {
        leaf_count: u32,
        time_step: S,
        leaves: Buffer<DeviceLeaf<S>>,
        forces: Buffer<Vec3<S>>,
        new_positions: Buffer<Vec3<S>>,
        new_velocities: Buffer<Vec3<S>>,
    },
}

pub(crate) fn execute<S: Scalar>(executor: &mut CpuExecutor, launch: Launch<S>) -> Result<(), Error> {
    trace!(global = ?launch.global, local = ?launch.local, "kernel launch");
    match launch.kernel {
        Kernel::MomentsFromLeaves {
            node_count,
            leaves,
            nodes,
            completions,
        } => moments_from_leaves(executor, node_count, leaves, nodes, completions),
        Kernel::MomentsFromNodes {
            wave_count,
            nodes,
            wavefront,
            completions,
        } => moments_from_nodes(executor, wave_count, nodes, wavefront, completions),
        Kernel::RefineInteractions {
            pair_count,
            theta,
            nodes,
            pairs,
            candidates,
        } => refine_interactions(executor, pair_count, theta, nodes, pairs, candidates),
        Kernel::NearFields {
            pair_count,
            softening,
            leaves,
            nodes,
            pairs,
            slot_bases,
            peer_extents,
            fields,
        } => near_fields(
            executor,
            pair_count,
            softening,
            leaves,
            nodes,
            pairs,
            slot_bases,
            peer_extents,
            fields,
        ),
        Kernel::FarFields {
            pair_count,
            leaves,
            nodes,
            pairs,
            slot_bases,
            inherited,
            fields,
        } => far_fields(
            executor,
            pair_count,
            leaves,
            nodes,
            pairs,
            slot_bases,
            inherited,
            fields,
        ),
        Kernel::ForcesFromFields {
            leaf_count,
            force_constant,
            leaves,
            slot_bases,
            fields,
            forces,
        } => forces_from_fields(
            executor,
            leaf_count,
            force_constant,
            leaves,
            slot_bases,
            fields,
            forces,
        ),
        Kernel::Leapfrog {
            leaf_count,
            time_step,
            leaves,
            forces,
            new_positions,
            new_velocities,
        } => leapfrog(
            executor,
            leaf_count,
            time_step,
            leaves,
            forces,
            new_positions,
            new_velocities,
        ),
    }
}

fn moments_from_leaves<S: Scalar>(
    executor: &mut CpuExecutor,
    node_count: u32,
    leaves: Buffer<DeviceLeaf<S>>,
    nodes: Buffer<DeviceNode<S>>,
    completions: Buffer<u32>,
) -> Result<(), Error> {
    let mut node_values = executor.take_values(nodes)?;
    let mut completion_values = executor.take_values(completions)?;
    let leaf_values = executor.values(leaves)?;

    let count = node_count as usize;
    node_values[..count]
        .par_iter_mut()
        .zip(&mut completion_values[..count])
        .enumerate()
        .for_each(|(index, (node, done))| {
            *done = 0;
            if node.has_children {
                return;
            }
            let center = node.center();
            let mut moment = NodeMoment::zero();
            let start = node.leaf_start as usize;
            for leaf in &leaf_values[start..start + node.leaf_count as usize] {
                moment.accumulate(NodeMoment::from_point_charge(
                    leaf.charge,
                    leaf.position - center,
                ));
            }
            node.moment = moment;
            *done = index as u32 + 1;
        });

    executor.put_values(nodes, node_values);
    executor.put_values(completions, completion_values);
    Ok(())
}

fn moments_from_nodes<S: Scalar>(
    executor: &mut CpuExecutor,
    wave_count: u32,
    nodes: Buffer<DeviceNode<S>>,
    wavefront: Buffer<u32>,
    completions: Buffer<u32>,
) -> Result<(), Error> {
    let mut node_values = executor.take_values(nodes)?;
    let mut completion_values = executor.take_values(completions)?;
    let wave_values = executor.values(wavefront)?;

    // Disjointness: the wavefront holds distinct nodes, and a node's
    // children always completed in an earlier wave, so reads of children
    // never race the writes of parents.
    let cell = SyncSlice::new(&mut node_values);
    wave_values[..wave_count as usize]
        .par_iter()
        .zip(&mut completion_values[..wave_count as usize])
        .for_each(|(&parent, done)| unsafe {
            let entry = *cell.get(parent as usize);
            let center = entry.center();
            let mut moment = NodeMoment::zero();
            for child in 0..NODE_CHILDREN {
                let child_entry = *cell.get(parent as usize + entry.child_offsets[child] as usize);
                moment.accumulate(
                    child_entry
                        .moment
                        .translated(child_entry.center() - center),
                );
            }
            (*cell.get_mut(parent as usize)).moment = moment;
            *done = parent + 1;
        });
    drop(cell);

    executor.put_values(nodes, node_values);
    executor.put_values(completions, completion_values);
    Ok(())
}

fn refine_interactions<S: Scalar>(
    executor: &mut CpuExecutor,
    pair_count: u32,
    theta: S,
    nodes: Buffer<DeviceNode<S>>,
    pairs: Buffer<Interaction>,
    candidates: Buffer<Interaction>,
) -> Result<(), Error> {
    let mut candidate_values = executor.take_values(candidates)?;
    let node_values = executor.values(nodes)?;
    let pair_values = executor.values(pairs)?;

    let lanes = NODE_CHILDREN * NODE_CHILDREN;
    candidate_values[..pair_count as usize * lanes]
        .par_chunks_mut(lanes)
        .zip(&pair_values[..pair_count as usize])
        .for_each(|(out, pair)| {
            let a = pair.a_index;
            let b = pair.b_index;
            let node_a = &node_values[a as usize];
            let node_b = &node_values[b as usize];
            for (lane, (child_a, child_b)) in
                iproduct!(0..NODE_CHILDREN, 0..NODE_CHILDREN).enumerate()
            {
                let candidate = if a == b {
                    // Self pair: upper-triangular child combinations only,
                    // so symmetric duplicates are never generated.
                    (child_a <= child_b).then(|| {
                        classify(
                            node_values,
                            a + node_a.child_offsets[child_a],
                            a + node_a.child_offsets[child_b],
                            theta,
                        )
                    })
                    .flatten()
                } else {
                    // Distinct pair: refine whichever sides have children;
                    // a side without children passes through unchanged.
                    match (node_a.has_children, node_b.has_children) {
                        (true, true) => classify(
                            node_values,
                            a + node_a.child_offsets[child_a],
                            b + node_b.child_offsets[child_b],
                            theta,
                        ),
                        (true, false) if child_b == 0 => classify(
                            node_values,
                            a + node_a.child_offsets[child_a],
                            b,
                            theta,
                        ),
                        (false, true) if child_a == 0 => classify(
                            node_values,
                            a,
                            b + node_b.child_offsets[child_b],
                            theta,
                        ),
                        _ => None,
                    }
                };
                out[lane] = candidate.unwrap_or_default();
            }
        });

    executor.put_values(candidates, candidate_values);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn near_fields<S: Scalar>(
    executor: &mut CpuExecutor,
    pair_count: u32,
    softening: S,
    leaves: Buffer<DeviceLeaf<S>>,
    nodes: Buffer<DeviceNode<S>>,
    pairs: Buffer<Interaction>,
    slot_bases: Buffer<u32>,
    peer_extents: Buffer<u32>,
    fields: Buffer<Vec3<S>>,
) -> Result<(), Error> {
    let mut field_values = executor.take_values(fields)?;
    let leaf_values = executor.values(leaves)?;
    let node_values = executor.values(nodes)?;
    let pair_values = executor.values(pairs)?;
    let base_values = executor.values(slot_bases)?;
    let extent_values = executor.values(peer_extents)?;

    let softening2 = softening * softening;
    // Slots are assigned so that (pair, target leaf, source lane) is unique
    // across the whole batch; see the interaction planner.
    let cell = SyncSlice::new(&mut field_values);
    pair_values[..pair_count as usize].par_iter().for_each(|pair| {
        let a = pair.a_index as usize;
        let b = pair.b_index as usize;
        let node_a = &node_values[a];
        let node_b = &node_values[b];
        for (i, j) in iproduct!(0..node_a.leaf_count as usize, 0..node_b.leaf_count as usize) {
            let target = node_a.leaf_start as usize + i;
            let source = node_b.leaf_start as usize + j;
            if target == source {
                continue;
            }
            let target_leaf = &leaf_values[target];
            let source_leaf = &leaf_values[source];
            let delta = source_leaf.position - target_leaf.position;
            let r2 = delta.magnitude_squared() + softening2;
            let inv = S::one() / (r2 * r2.sqrt());
            unsafe {
                let slot = base_values[target] as usize
                    + pair.a_slot as usize * extent_values[a] as usize
                    + j;
                *cell.get_mut(slot) = delta * (source_leaf.charge * inv);
                if a != b {
                    let slot = base_values[source] as usize
                        + pair.b_slot as usize * extent_values[b] as usize
                        + i;
                    *cell.get_mut(slot) = -delta * (target_leaf.charge * inv);
                }
            }
        }
    });
    drop(cell);

    executor.put_values(fields, field_values);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn far_fields<S: Scalar>(
    executor: &mut CpuExecutor,
    pair_count: u32,
    leaves: Buffer<DeviceLeaf<S>>,
    nodes: Buffer<DeviceNode<S>>,
    pairs: Buffer<Interaction>,
    slot_bases: Buffer<u32>,
    inherited: Buffer<u32>,
    fields: Buffer<Vec3<S>>,
) -> Result<(), Error> {
    let mut field_values = executor.take_values(fields)?;
    let leaf_values = executor.values(leaves)?;
    let node_values = executor.values(nodes)?;
    let pair_values = executor.values(pairs)?;
    let base_values = executor.values(slot_bases)?;
    let inherited_values = executor.values(inherited)?;

    let cell = SyncSlice::new(&mut field_values);
    pair_values[..pair_count as usize].par_iter().for_each(|pair| {
        // Both sides receive the peer's expansion; forces stay symmetric.
        let sides = [
            (pair.a_index as usize, pair.b_index as usize, pair.a_slot),
            (pair.b_index as usize, pair.a_index as usize, pair.b_slot),
        ];
        for (target_node, source_node, slot) in sides {
            let node = &node_values[target_node];
            let peer = &node_values[source_node];
            let offset = inherited_values[target_node] + slot;
            for i in 0..node.leaf_count as usize {
                let leaf = node.leaf_start as usize + i;
                let field = peer
                    .moment
                    .field_at(peer.center() - leaf_values[leaf].position);
                unsafe {
                    *cell.get_mut(base_values[leaf] as usize + offset as usize) = field;
                }
            }
        }
    });
    drop(cell);

    executor.put_values(fields, field_values);
    Ok(())
}

fn forces_from_fields<S: Scalar>(
    executor: &mut CpuExecutor,
    leaf_count: u32,
    force_constant: S,
    leaves: Buffer<DeviceLeaf<S>>,
    slot_bases: Buffer<u32>,
    fields: Buffer<Vec3<S>>,
    forces: Buffer<Vec3<S>>,
) -> Result<(), Error> {
    let mut force_values = executor.take_values(forces)?;
    let leaf_values = executor.values(leaves)?;
    let base_values = executor.values(slot_bases)?;
    let field_values = executor.values(fields)?;

    force_values[..leaf_count as usize]
        .par_iter_mut()
        .enumerate()
        .for_each(|(leaf, force)| {
            let mut sum = Vec3::zero();
            for slot in base_values[leaf]..base_values[leaf + 1] {
                sum += field_values[slot as usize];
            }
            *force += sum * (force_constant * leaf_values[leaf].charge);
        });

    executor.put_values(forces, force_values);
    Ok(())
}

fn leapfrog<S: Scalar>(
    executor: &mut CpuExecutor,
    leaf_count: u32,
    time_step: S,
    leaves: Buffer<DeviceLeaf<S>>,
    forces: Buffer<Vec3<S>>,
    new_positions: Buffer<Vec3<S>>,
    new_velocities: Buffer<Vec3<S>>,
) -> Result<(), Error> {
    let mut position_values = executor.take_values(new_positions)?;
    let mut velocity_values = executor.take_values(new_velocities)?;
    let leaf_values = executor.values(leaves)?;
    let force_values = executor.values(forces)?;

    let count = leaf_count as usize;
    position_values[..count]
        .par_iter_mut()
        .zip(&mut velocity_values[..count])
        .enumerate()
        .for_each(|(index, (position, velocity))| {
            let leaf = &leaf_values[index];
            *velocity = leaf.velocity + force_values[index] * (time_step / leaf.mass);
            // Drift with the pre-kick velocity; exact and reversible at F=0.
            *position = leaf.position + leaf.velocity * time_step;
        });

    executor.put_values(new_positions, position_values);
    executor.put_values(new_velocities, velocity_values);
    Ok(())
}
