use thiserror::Error;

/// Everything that can go wrong while mutating the tree or running a step.
///
/// Tree mutations surface their error directly and leave the tree unchanged.
/// Step-phase failures additionally roll the engine back to the snapshot
/// taken at the start of the step, so a failed step never moves time forward.
#[derive(Debug, Error)]
pub enum Error {
    /// An insert or move targeted a position outside the root bounding box.
    /// The box is half-open, so a point exactly on the upper face is out.
    #[error("position lies outside the root bounds")]
    OutOfBounds,

    /// A leaf node at maximum depth holds more leaves than the configured
    /// capacity. This is a condition to inspect, not a failure: the depth
    /// bound wins over the capacity bound.
    #[error("node {node} holds {leaf_count} leaves at maximum depth")]
    CapacityExceeded { node: u32, leaf_count: u32 },

    /// An allocation request exceeded the device buffer limit.
    #[error("allocation of {requested} bytes exceeds the device limit of {limit}")]
    OutOfMemory { requested: u64, limit: u64 },

    /// The executor failed to service a buffer operation or kernel launch.
    #[error("executor error {code}: {message}")]
    Executor { code: i32, message: String },

    /// The step was cancelled between phases via the cancel flag.
    #[error("step cancelled")]
    Cancelled,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
