//! Hierarchical multipole n-body simulation over a flat-array orthtree.
//!
//! Computing all pairwise forces between `N` bodies directly costs O(N^2).
//! This crate groups distant bodies into tree cells and evaluates whole
//! cells through truncated multipole expansions (monopole, dipole,
//! quadrupole), which brings a step down to roughly O(N log N) at a
//! controllable accuracy knob `theta`. Canonical use cases include gravity
//! and charged particle simulations.
//!
//! The two load-bearing pieces:
//!
//! - [`Orthtree`]: a dimension-generic quadtree/octree kept in two flat
//!   arrays (leaves and nodes) in depth-first order, with relative links so
//!   splits and merges are cheap bulk edits. Supports insertion, erasure,
//!   movement, and rebalancing under a per-node capacity and a depth bound.
//! - [`Engine`]: the step driver. Each step aggregates moments bottom-up in
//!   waves, refines cell pairs into near and far interaction lists, runs
//!   the field, force, and leapfrog passes as data-parallel kernels through
//!   an [`Executor`], and rebuilds the tree at the new positions. Steps are
//!   atomic: any failure rolls back to the pre-step state.
//!
//! The bundled [`CpuExecutor`] runs kernels on rayon; the [`Executor`] and
//! [`DeviceMemory`] traits are the seam for plugging in a GPU backend.
//!
//! ```
//! use treecode::{CpuExecutor, Engine, EngineConfig, Particle, Vec3};
//!
//! let mut engine = Engine::new(EngineConfig::<f64>::default(), CpuExecutor::new())?;
//! engine.insert(Particle {
//!     position: Vec3::new(0.25, 0.5, 0.5),
//!     velocity: Vec3::zero(),
//!     mass: 1.0,
//!     charge: 1.0,
//! })?;
//! engine.insert(Particle {
//!     position: Vec3::new(0.75, 0.5, 0.5),
//!     velocity: Vec3::zero(),
//!     mass: 1.0,
//!     charge: 1.0,
//! })?;
//! let time = engine.step()?;
//! assert!(time > 0.0);
//! # Ok::<(), treecode::Error>(())
//! ```

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod interaction;
pub mod kernel;
pub mod moment;
pub mod orthtree;
pub mod vector;

pub use config::EngineConfig;
pub use device::{Access, Buffer, CpuExecutor, DeviceMemory, DeviceValue, Executor, Launch};
pub use engine::{Body, CancelFlag, Engine, Octree, Particle, Phase, StepStats};
pub use error::Error;
pub use interaction::Interaction;
pub use kernel::{DeviceLeaf, DeviceNode, Kernel};
pub use moment::NodeMoment;
pub use orthtree::{
    LeafEntry, LeafHandle, LeafId, NodeHandle, NodeId, Orthtree, TreeConfig, TreeDefect,
};
pub use vector::{Scalar, Vec3, Vector};
