//! Error types for the mesh core.

use thiserror::Error;

/// Result type alias using [`MeshError`].
pub type Result<T> = std::result::Result<T, MeshError>;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum MeshError {
    /// A malformed input, e.g. an empty vertex list passed to a simplex
    /// query, a non-uniform scaling factor or a marker set on a ghost cell.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An unknown cell, vertex or interface id.
    #[error("entity not found: {0}")]
    NotFound(i64),

    /// The patch and the octree disagree in a way that is not locally
    /// recoverable, e.g. a sync after an unmapped adaption.
    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    /// A collective operation failed during partitioning or load balance.
    #[error("partition error: {0}")]
    PartitionError(String),
}
