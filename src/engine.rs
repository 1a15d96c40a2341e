//! The step driver: owns the tree and the executor, and runs one time step
//! as a fixed sequence of data-parallel phases.
//!
//! A step is atomic. The tree is cloned before anything runs; any phase
//! failure (allocation, executor error, cancellation, a body escaping the
//! bounds) restores the snapshot and leaves time untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bincode::{Decode, Encode};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::device::{Access, Executor, Launch, Scratch};
use crate::error::Error;
use crate::interaction::{self, Interaction};
use crate::kernel::{DeviceLeaf, DeviceNode, Kernel, NODE_CHILDREN};
use crate::moment::NodeMoment;
use crate::orthtree::{Orthtree, TreeConfig};
use crate::vector::{Scalar, Vec3};

const CANDIDATE_LANES: usize = NODE_CHILDREN * NODE_CHILDREN;

// Below this there is no room for even one refinement batch.
const MIN_DEVICE_BUDGET: u64 = 4096;

/// A body as the caller sees it.
#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
pub struct Particle<S: Scalar> {
    pub position: Vec3<S>,
    pub velocity: Vec3<S>,
    pub mass: S,
    pub charge: S,
}

/// Per-leaf payload stored in the tree: everything but the position, which
/// the tree owns.
#[derive(Clone, Copy, Debug)]
pub struct Body<S: Scalar> {
    pub velocity: Vec3<S>,
    pub mass: S,
    pub charge: S,
}

/// The simulation tree: an octree of bodies with multipole aggregates.
pub type Octree<S> = Orthtree<S, Body<S>, NodeMoment<S>, 3>;

/// Where the driver currently is. Outside `step` it is always `Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Aggregating,
    Interacting,
    FieldEval,
    Integrating,
    Rebuilding,
}

/// Cloneable handle for cancelling a running step from another thread. The
/// driver checks it between phases; a cancelled step rolls back. The flag
/// stays set until [`CancelFlag::reset`].
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters from the last completed step.
#[derive(Clone, Debug)]
pub struct StepStats<S: Scalar> {
    /// Moment aggregation waves, the leaf pass included.
    pub moment_waves: u32,
    /// Refinement kernel rounds until no refinable pairs remained.
    pub refine_rounds: u32,
    pub near_pairs: usize,
    pub far_pairs: usize,
    pub near_batches: u32,
    pub far_batches: u32,
    /// Softening length used by the near-field kernel this step.
    pub softening: S,
    /// Root monopole: the total charge of the system.
    pub root_charge: S,
    /// Root dipole about the root center.
    pub root_dipole: Vec3<S>,
}

impl<S: Scalar> StepStats<S> {
    fn empty() -> Self {
        Self {
            moment_waves: 0,
            refine_rounds: 0,
            near_pairs: 0,
            far_pairs: 0,
            near_batches: 0,
            far_batches: 0,
            softening: S::zero(),
            root_charge: S::zero(),
            root_dipole: Vec3::zero(),
        }
    }
}

#[derive(Encode, Decode)]
struct SnapshotData<S: Scalar> {
    time: S,
    particles: Vec<Particle<S>>,
}

struct StepScratch<S: Scalar> {
    leaves: Scratch<DeviceLeaf<S>>,
    nodes: Scratch<DeviceNode<S>>,
    completions: Scratch<u32>,
    wavefront: Scratch<u32>,
    pairs: Scratch<Interaction>,
    candidates: Scratch<Interaction>,
    slot_bases: Scratch<u32>,
    peer_extents: Scratch<u32>,
    inherited: Scratch<u32>,
    fields: Scratch<Vec3<S>>,
    forces: Scratch<Vec3<S>>,
    new_positions: Scratch<Vec3<S>>,
    new_velocities: Scratch<Vec3<S>>,
}

impl<S: Scalar> StepScratch<S> {
    fn new() -> Self {
        Self {
            leaves: Scratch::new(Access::Read),
            nodes: Scratch::new(Access::ReadWrite),
            completions: Scratch::new(Access::Write),
            wavefront: Scratch::new(Access::Read),
            pairs: Scratch::new(Access::Read),
            candidates: Scratch::new(Access::Write),
            slot_bases: Scratch::new(Access::Read),
            peer_extents: Scratch::new(Access::Read),
            inherited: Scratch::new(Access::Read),
            fields: Scratch::new(Access::ReadWrite),
            forces: Scratch::new(Access::ReadWrite),
            new_positions: Scratch::new(Access::Write),
            new_velocities: Scratch::new(Access::Write),
        }
    }
}

/// The simulation engine. Generic over scalar precision and the executor
/// that runs its kernels.
pub struct Engine<S: Scalar, E: Executor<S> = crate::device::CpuExecutor> {
    config: EngineConfig<S>,
    executor: E,
    tree: Octree<S>,
    time: S,
    phase: Phase,
    cancel: CancelFlag,
    budget: u64,
    scratch: StepScratch<S>,
    stats: Option<StepStats<S>>,
}

impl<S: Scalar, E: Executor<S>> Engine<S, E> {
    pub fn new(config: EngineConfig<S>, executor: E) -> Result<Self, Error> {
        let config = config.validated()?;
        let budget = config
            .device_max_buffer_bytes
            .min(executor.max_single_alloc_bytes());
        if budget < MIN_DEVICE_BUDGET {
            return Err(Error::InvalidConfig(format!(
                "device buffer limit of {budget} bytes is too small"
            )));
        }
        let tree = Orthtree::new(
            config.bounds_position,
            config.bounds_dimensions,
            TreeConfig {
                node_capacity: config.node_capacity,
                max_depth: config.max_depth,
                adjust: config.adjust,
            },
        )?;
        Ok(Self {
            config,
            executor,
            tree,
            time: S::zero(),
            phase: Phase::Idle,
            cancel: CancelFlag::default(),
            budget,
            scratch: StepScratch::new(),
            stats: None,
        })
    }

    pub fn config(&self) -> &EngineConfig<S> {
        &self.config
    }

    pub fn time(&self) -> S {
        self.time
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn particle_count(&self) -> usize {
        self.tree.leaf_count()
    }

    /// Read access to the simulation tree, mainly for inspection and tests.
    pub fn tree(&self) -> &Octree<S> {
        &self.tree
    }

    /// Counters from the last completed step, if any step has completed.
    pub fn last_step_stats(&self) -> Option<&StepStats<S>> {
        self.stats.as_ref()
    }

    /// Handle for cancelling a running step from elsewhere.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Adds a body. Intended for populating the system before stepping, but
    /// valid at any time between steps.
    pub fn insert(&mut self, particle: Particle<S>) -> Result<(), Error> {
        if !(particle.mass > S::zero()) || !particle.mass.is_finite() {
            return Err(Error::InvalidConfig("particle mass must be positive".into()));
        }
        self.tree.insert(
            Body {
                velocity: particle.velocity,
                mass: particle.mass,
                charge: particle.charge,
            },
            particle.position,
        )?;
        Ok(())
    }

    /// Snapshot of every body in current leaf order. Positions and
    /// velocities reflect the last completed step.
    pub fn particles(&self) -> impl Iterator<Item = Particle<S>> + '_ {
        self.tree.leaves().iter().map(|leaf| Particle {
            position: leaf.position(),
            velocity: leaf.value.velocity,
            mass: leaf.value.mass,
            charge: leaf.value.charge,
        })
    }

    /// Serializes the simulation state. The layout round-trips exactly:
    /// restoring and serializing again yields identical bytes.
    pub fn snapshot(&self) -> Result<Vec<u8>, Error> {
        let data = SnapshotData {
            time: self.time,
            particles: self.particles().collect(),
        };
        bincode::encode_to_vec(data, bincode::config::standard())
            .map_err(|error| Error::InvalidConfig(error.to_string()))
    }

    /// Replaces the simulation state with a snapshot taken from an engine
    /// with the same configuration.
    pub fn restore(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let (data, _): (SnapshotData<S>, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|error| Error::InvalidConfig(error.to_string()))?;
        let tree = Orthtree::bulk_load(
            self.config.bounds_position,
            self.config.bounds_dimensions,
            TreeConfig {
                node_capacity: self.config.node_capacity,
                max_depth: self.config.max_depth,
                adjust: self.config.adjust,
            },
            data.particles.iter().map(|particle| {
                (
                    Body {
                        velocity: particle.velocity,
                        mass: particle.mass,
                        charge: particle.charge,
                    },
                    particle.position,
                )
            }),
        )?;
        self.tree = tree;
        self.time = data.time;
        self.stats = None;
        Ok(())
    }

    /// Advances the system by one time step and returns the new time.
    /// On any error the engine state is exactly what it was before the call.
    pub fn step(&mut self) -> Result<S, Error> {
        let saved_tree = self.tree.clone();
        let saved_time = self.time;
        match self.run_step() {
            Ok(stats) => {
                self.stats = Some(stats);
                self.time += self.config.time_step;
                self.phase = Phase::Idle;
                Ok(self.time)
            }
            Err(error) => {
                self.tree = saved_tree;
                self.time = saved_time;
                self.phase = Phase::Idle;
                Err(error)
            }
        }
    }

    fn enter(&mut self, phase: Phase) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.phase = phase;
        debug!(?phase, time = %self.time, "entering phase");
        Ok(())
    }

    fn run_step(&mut self) -> Result<StepStats<S>, Error> {
        let mut stats = StepStats::empty();
        let leaf_total = self.tree.leaf_count();
        let node_total = self.tree.node_count();

        self.enter(Phase::Aggregating)?;
        if leaf_total == 0 {
            debug!("no bodies; the step is trivial");
            return Ok(stats);
        }

        let host_leaves: Vec<DeviceLeaf<S>> = self
            .tree
            .leaves()
            .iter()
            .map(|leaf| DeviceLeaf {
                position: leaf.position(),
                velocity: leaf.value.velocity,
                mass: leaf.value.mass,
                charge: leaf.value.charge,
            })
            .collect();
        let mut host_nodes: Vec<DeviceNode<S>> = Vec::with_capacity(node_total);
        let mut parents: Vec<Option<u32>> = Vec::with_capacity(node_total);
        let mut min_extent = self.config.bounds_dimensions.min_element();
        for (index, entry) in self.tree.node_entries().iter().enumerate() {
            let mut child_offsets = [0u32; NODE_CHILDREN];
            child_offsets.copy_from_slice(&entry.child_offsets[..NODE_CHILDREN]);
            host_nodes.push(DeviceNode {
                position: entry.position,
                dimensions: entry.dimensions,
                depth: entry.depth,
                has_children: entry.has_children,
                child_offsets,
                leaf_start: entry.leaf_start,
                leaf_count: entry.leaf_count,
                moment: NodeMoment::zero(),
            });
            parents.push(
                entry
                    .has_parent
                    .then(|| (index as i64 + entry.parent_offset as i64) as u32),
            );
            if !entry.has_children {
                min_extent = min_extent.min(entry.dimensions.min_element());
            }
        }
        stats.softening = min_extent * S::from_f64(1e-3);

        let leaves_buf = self.scratch.leaves.ensure(&mut self.executor, leaf_total)?;
        self.executor.write(leaves_buf, &host_leaves)?;
        let nodes_buf = self.scratch.nodes.ensure(&mut self.executor, node_total)?;
        self.executor.write(nodes_buf, &host_nodes)?;

        // Bottom-up moment aggregation, one wave at a time. The first wave
        // settles every leaf-node; each completion that finishes a parent's
        // last child queues the parent for the next wave.
        let completions = self.scratch.completions.ensure(&mut self.executor, node_total)?;
        self.executor.launch(Launch::linear(
            node_total,
            64,
            Kernel::MomentsFromLeaves {
                node_count: node_total as u32,
                leaves: leaves_buf,
                nodes: nodes_buf,
                completions,
            },
        ))?;
        let mut done = vec![0u32; node_total];
        self.executor.read(completions, &mut done)?;
        stats.moment_waves = 1;

        let mut remaining: Vec<u32> = host_nodes
            .iter()
            .map(|node| if node.has_children { NODE_CHILDREN as u32 } else { 0 })
            .collect();
        let mut wave: Vec<u32> = Vec::new();
        let mut completed_any = false;
        for &entry in &done {
            if entry == 0 {
                continue;
            }
            completed_any = true;
            if let Some(parent) = parents[(entry - 1) as usize] {
                remaining[parent as usize] -= 1;
                if remaining[parent as usize] == 0 {
                    wave.push(parent);
                }
            }
        }
        assert!(completed_any, "moment wavefront starved with bodies present");

        while !wave.is_empty() {
            let wavefront = self.scratch.wavefront.ensure(&mut self.executor, wave.len())?;
            self.executor.write(wavefront, &wave)?;
            let completions = self.scratch.completions.ensure(&mut self.executor, wave.len())?;
            self.executor.launch(Launch::linear(
                wave.len(),
                64,
                Kernel::MomentsFromNodes {
                    wave_count: wave.len() as u32,
                    nodes: nodes_buf,
                    wavefront,
                    completions,
                },
            ))?;
            done.resize(wave.len(), 0);
            self.executor.read(completions, &mut done)?;
            wave.clear();
            for &entry in done.iter() {
                debug_assert_ne!(entry, 0, "wavefront nodes always complete");
                if entry == 0 {
                    continue;
                }
                if let Some(parent) = parents[(entry - 1) as usize] {
                    remaining[parent as usize] -= 1;
                    if remaining[parent as usize] == 0 {
                        wave.push(parent);
                    }
                }
            }
            stats.moment_waves += 1;
        }

        self.executor.read(nodes_buf, &mut host_nodes)?;
        for (value, device) in self.tree.node_values_mut().zip(&host_nodes) {
            *value = device.moment;
        }
        stats.root_charge = host_nodes[0].moment.charge;
        stats.root_dipole = host_nodes[0].moment.dipole;
        if let Err(overflow) = self.tree.check_capacity() {
            warn!(%overflow, "leaf capacity exceeded at maximum depth");
        }

        // Refine cell pairs breadth-first from the root self-pair until
        // everything is either near (direct) or far (admissible).
        self.enter(Phase::Interacting)?;
        let theta = self.config.theta;
        let mut queue: Vec<Interaction> = Vec::new();
        let mut near: Vec<Interaction> = Vec::new();
        let mut far: Vec<Interaction> = Vec::new();
        if let Some(root_pair) = interaction::classify(&host_nodes, 0, 0, theta) {
            if root_pair.refinable {
                queue.push(root_pair);
            } else {
                near.push(root_pair);
            }
        }
        let refine_limit = interaction::refine_batch_limit(self.budget);
        let mut host_candidates: Vec<Interaction> = Vec::new();
        while !queue.is_empty() {
            let take = queue.len().min(refine_limit);
            let batch: Vec<Interaction> = queue.split_off(queue.len() - take);
            let pairs_buf = self.scratch.pairs.ensure(&mut self.executor, take)?;
            self.executor.write(pairs_buf, &batch)?;
            let candidates_buf = self
                .scratch
                .candidates
                .ensure(&mut self.executor, take * CANDIDATE_LANES)?;
            self.executor.launch(Launch::tiled(
                take,
                NODE_CHILDREN as u32,
                Kernel::RefineInteractions {
                    pair_count: take as u32,
                    theta,
                    nodes: nodes_buf,
                    pairs: pairs_buf,
                    candidates: candidates_buf,
                },
            ))?;
            host_candidates.resize(take * CANDIDATE_LANES, Interaction::default());
            self.executor.read(candidates_buf, &mut host_candidates)?;
            for candidate in &host_candidates {
                if candidate.is_placeholder() {
                    continue;
                }
                if candidate.refinable {
                    queue.push(*candidate);
                } else if candidate.admissible {
                    far.push(*candidate);
                } else {
                    near.push(*candidate);
                }
            }
            stats.refine_rounds += 1;
        }
        stats.near_pairs = near.len();
        stats.far_pairs = far.len();

        // Evaluate fields batch by batch under the buffer budget, folding
        // each batch's slots into the accumulated per-leaf forces.
        self.enter(Phase::FieldEval)?;
        let forces_buf = self.scratch.forces.ensure(&mut self.executor, leaf_total)?;
        self.executor.fill_zero(forces_buf)?;
        while !near.is_empty() {
            let batch = interaction::plan_near_batch(&host_nodes, leaf_total, &mut near, self.budget);
            let field_bytes = (batch.slot_count * std::mem::size_of::<Vec3<S>>()) as u64;
            if field_bytes > self.budget {
                return Err(Error::OutOfMemory {
                    requested: field_bytes,
                    limit: self.budget,
                });
            }
            let pairs_buf = self.scratch.pairs.ensure(&mut self.executor, batch.pairs.len())?;
            self.executor.write(pairs_buf, &batch.pairs)?;
            let bases_buf = self
                .scratch
                .slot_bases
                .ensure(&mut self.executor, leaf_total + 1)?;
            self.executor.write(bases_buf, &batch.slot_bases)?;
            let extents_buf = self
                .scratch
                .peer_extents
                .ensure(&mut self.executor, node_total)?;
            self.executor.write(extents_buf, &batch.peer_extents)?;
            let fields_buf = self.scratch.fields.ensure(&mut self.executor, batch.slot_count)?;
            self.executor.fill_zero(fields_buf)?;
            self.executor.launch(Launch::tiled(
                batch.pairs.len(),
                NODE_CHILDREN as u32,
                Kernel::NearFields {
                    pair_count: batch.pairs.len() as u32,
                    softening: stats.softening,
                    leaves: leaves_buf,
                    nodes: nodes_buf,
                    pairs: pairs_buf,
                    slot_bases: bases_buf,
                    peer_extents: extents_buf,
                    fields: fields_buf,
                },
            ))?;
            self.executor.launch(Launch::linear(
                leaf_total,
                64,
                Kernel::ForcesFromFields {
                    leaf_count: leaf_total as u32,
                    force_constant: self.config.force_constant,
                    leaves: leaves_buf,
                    slot_bases: bases_buf,
                    fields: fields_buf,
                    forces: forces_buf,
                },
            ))?;
            stats.near_batches += 1;
        }
        while !far.is_empty() {
            let batch = interaction::plan_far_batch(&host_nodes, leaf_total, &mut far, self.budget);
            let field_bytes = (batch.slot_count * std::mem::size_of::<Vec3<S>>()) as u64;
            if field_bytes > self.budget {
                return Err(Error::OutOfMemory {
                    requested: field_bytes,
                    limit: self.budget,
                });
            }
            let pairs_buf = self.scratch.pairs.ensure(&mut self.executor, batch.pairs.len())?;
            self.executor.write(pairs_buf, &batch.pairs)?;
            let bases_buf = self
                .scratch
                .slot_bases
                .ensure(&mut self.executor, leaf_total + 1)?;
            self.executor.write(bases_buf, &batch.slot_bases)?;
            let inherited_buf = self
                .scratch
                .inherited
                .ensure(&mut self.executor, node_total)?;
            self.executor.write(inherited_buf, &batch.inherited)?;
            let fields_buf = self.scratch.fields.ensure(&mut self.executor, batch.slot_count)?;
            self.executor.fill_zero(fields_buf)?;
            self.executor.launch(Launch::linear(
                batch.pairs.len() * 2,
                64,
                Kernel::FarFields {
                    pair_count: batch.pairs.len() as u32,
                    leaves: leaves_buf,
                    nodes: nodes_buf,
                    pairs: pairs_buf,
                    slot_bases: bases_buf,
                    inherited: inherited_buf,
                    fields: fields_buf,
                },
            ))?;
            self.executor.launch(Launch::linear(
                leaf_total,
                64,
                Kernel::ForcesFromFields {
                    leaf_count: leaf_total as u32,
                    force_constant: self.config.force_constant,
                    leaves: leaves_buf,
                    slot_bases: bases_buf,
                    fields: fields_buf,
                    forces: forces_buf,
                },
            ))?;
            stats.far_batches += 1;
        }

        self.enter(Phase::Integrating)?;
        let positions_buf = self
            .scratch
            .new_positions
            .ensure(&mut self.executor, leaf_total)?;
        let velocities_buf = self
            .scratch
            .new_velocities
            .ensure(&mut self.executor, leaf_total)?;
        self.executor.launch(Launch::linear(
            leaf_total,
            64,
            Kernel::Leapfrog {
                leaf_count: leaf_total as u32,
                time_step: self.config.time_step,
                leaves: leaves_buf,
                forces: forces_buf,
                new_positions: positions_buf,
                new_velocities: velocities_buf,
            },
        ))?;
        let mut new_positions = vec![Vec3::zero(); leaf_total];
        let mut new_velocities = vec![Vec3::zero(); leaf_total];
        self.executor.read(positions_buf, &mut new_positions)?;
        self.executor.read(velocities_buf, &mut new_velocities)?;

        self.enter(Phase::Rebuilding)?;
        for (body, velocity) in self.tree.leaf_values_mut().zip(&new_velocities) {
            body.velocity = *velocity;
        }
        self.tree.rebuild_positions(&new_positions)?;

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuExecutor;
    use approx::assert_relative_eq;

    fn engine() -> Engine<f64> {
        Engine::new(EngineConfig::default(), CpuExecutor::new()).unwrap()
    }

    fn particle(position: [f64; 3], charge: f64) -> Particle<f64> {
        Particle {
            position: Vec3::from(position),
            velocity: Vec3::zero(),
            mass: 1.0,
            charge,
        }
    }

    #[test]
    fn rejects_undersized_device_budgets() {
        let config = EngineConfig::<f64> {
            device_max_buffer_bytes: 128,
            ..Default::default()
        };
        assert!(matches!(
            Engine::new(config, CpuExecutor::new()),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn insert_validates_bodies() {
        let mut engine = engine();
        let mut bad = particle([0.5, 0.5, 0.5], 1.0);
        bad.mass = 0.0;
        assert!(matches!(engine.insert(bad), Err(Error::InvalidConfig(_))));
        assert!(matches!(
            engine.insert(particle([2.0, 0.5, 0.5], 1.0)),
            Err(Error::OutOfBounds)
        ));
        engine.insert(particle([0.5, 0.5, 0.5], 1.0)).unwrap();
        assert_eq!(engine.particle_count(), 1);
    }

    #[test]
    fn stepping_an_empty_system_just_advances_time() {
        let mut engine = engine();
        let time = engine.step().unwrap();
        assert_relative_eq!(time, 1e-3);
        assert_relative_eq!(engine.time(), 1e-3);
    }

    #[test]
    fn a_lone_body_drifts_freely() {
        let mut engine = engine();
        let mut body = particle([0.5, 0.5, 0.5], 1.0);
        body.velocity = Vec3::new(0.1, 0.0, -0.1);
        engine.insert(body).unwrap();
        engine.step().unwrap();
        let after: Vec<_> = engine.particles().collect();
        assert_relative_eq!(after[0].position.x(), 0.5 + 0.1 * 1e-3);
        assert_relative_eq!(after[0].position.z(), 0.5 - 0.1 * 1e-3);
        assert_eq!(after[0].velocity, body.velocity);
        let stats = engine.last_step_stats().unwrap();
        assert_eq!(stats.moment_waves, 1);
        assert_eq!(stats.near_pairs, 0);
        assert_eq!(stats.far_pairs, 0);
    }

    #[test]
    fn cancellation_rolls_the_step_back() {
        let mut engine = engine();
        engine.insert(particle([0.25, 0.5, 0.5], 1.0)).unwrap();
        engine.insert(particle([0.75, 0.5, 0.5], 1.0)).unwrap();
        let flag = engine.cancel_flag();
        flag.cancel();
        assert!(matches!(engine.step(), Err(Error::Cancelled)));
        assert_relative_eq!(engine.time(), 0.0);
        let before: Vec<_> = engine.particles().collect();

        flag.reset();
        engine.step().unwrap();
        let after: Vec<_> = engine.particles().collect();
        assert_ne!(before[0].velocity, after[0].velocity);
    }

    #[test]
    fn escaping_the_bounds_fails_and_rolls_back() {
        let config = EngineConfig::<f64> {
            time_step: 10.0,
            ..Default::default()
        };
        let mut engine = Engine::new(config, CpuExecutor::new()).unwrap();
        let mut runaway = particle([0.5, 0.5, 0.5], 1.0);
        runaway.velocity = Vec3::new(1.0, 0.0, 0.0);
        engine.insert(runaway).unwrap();
        assert!(matches!(engine.step(), Err(Error::OutOfBounds)));
        assert_relative_eq!(engine.time(), 0.0);
        let state: Vec<_> = engine.particles().collect();
        assert_relative_eq!(state[0].position.x(), 0.5);
        assert_eq!(state[0].velocity, runaway.velocity);
    }

    #[test]
    fn snapshots_round_trip_bytes_exactly() {
        let mut engine = engine();
        for index in 0..12 {
            let t = index as f64 / 12.0;
            engine
                .insert(particle([0.1 + 0.8 * t, 0.2 + 0.6 * t * t, 0.5], 1.0 - t))
                .unwrap();
        }
        engine.step().unwrap();
        let bytes = engine.snapshot().unwrap();
        engine.restore(&bytes).unwrap();
        let again = engine.snapshot().unwrap();
        assert_eq!(bytes, again);
    }
}
