//! Engine configuration.

use crate::error::Error;
use crate::vector::{Scalar, Vec3};

/// Everything the engine needs to know up front. Construct with
/// `..Default::default()` and override what matters.
#[derive(Clone, Debug)]
pub struct EngineConfig<S: Scalar> {
    /// Lower corner of the root box. Bodies must stay inside the half-open
    /// box for the lifetime of the simulation.
    pub bounds_position: Vec3<S>,
    pub bounds_dimensions: Vec3<S>,
    /// Leaves per tree node before it splits. 0 is treated as 1.
    pub node_capacity: u32,
    /// Subdivision limit. Defaults to the scalar's bit width, deep enough
    /// that two distinct positions can always be separated.
    pub max_depth: u32,
    /// Whether tree mutations rebalance on their own.
    pub adjust: bool,
    /// Multipole opening angle: a cell pair is evaluated through the
    /// expansion when `size / distance <= theta`. 0 disables approximation.
    pub theta: S,
    pub time_step: S,
    /// Overall coupling strength. Positive attracts like charges (gravity
    /// convention); use a negative constant for electrostatic repulsion.
    pub force_constant: S,
    /// Upper bound on any single device allocation; interaction batches are
    /// sized to respect it.
    pub device_max_buffer_bytes: u64,
}

impl<S: Scalar> Default for EngineConfig<S> {
    fn default() -> Self {
        Self {
            bounds_position: Vec3::zero(),
            bounds_dimensions: Vec3::splat(S::one()),
            node_capacity: 8,
            max_depth: (8 * std::mem::size_of::<S>()) as u32,
            adjust: true,
            theta: S::from_f64(0.5),
            time_step: S::from_f64(1e-3),
            force_constant: S::one(),
            device_max_buffer_bytes: 256 * 1024 * 1024,
        }
    }
}

impl<S: Scalar> EngineConfig<S> {
    /// Normalizes and checks the configuration. Capacity 0 is clamped to
    /// the documented minimum of 1; everything else invalid is rejected.
    pub fn validated(mut self) -> Result<Self, Error> {
        if !(self.bounds_dimensions.min_element() > S::zero()) {
            return Err(Error::InvalidConfig(
                "bounds dimensions must be positive in every axis".into(),
            ));
        }
        if !(self.theta >= S::zero()) || !self.theta.is_finite() {
            return Err(Error::InvalidConfig(
                "theta must be finite and non-negative".into(),
            ));
        }
        if !(self.time_step > S::zero()) || !self.time_step.is_finite() {
            return Err(Error::InvalidConfig("time step must be positive".into()));
        }
        if !self.force_constant.is_finite() {
            return Err(Error::InvalidConfig("force constant must be finite".into()));
        }
        self.node_capacity = self.node_capacity.max(1);
        Ok(self)
    }
}
