use thiserror::Error;

use crate::{mesh::MeshError, shape::ShapeBroadcastingError};

#[derive(Error, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// Error returned when a method of the base SPMD rule contract is invoked on a rule that does not
    /// provide its own implementation for it.
    #[error("`{operation}` must be implemented by a concrete SPMD rule but `{rule}` does not implement it")]
    Unimplemented { rule: String, operation: String },

    /// Error returned when the same tensor axis is sharded along two different mesh dimensions.
    #[error("tensor axis '{axis}' is sharded by two different mesh dimensions [{first}] and [{second}]")]
    Conflict { axis: char, first: usize, second: usize },

    #[error("axis notation '{notation}' has {notation_rank} axes but the sharding has {sharding_rank} entries")]
    RankMismatch { notation: String, notation_rank: usize, sharding_rank: usize },

    #[error("dims mapping has {mapping_rank} entries but the tensor has rank {tensor_rank}")]
    DimsMappingRankMismatch { tensor_rank: usize, mapping_rank: usize },

    #[error("dynamic dims has {flag_count} entries but the tensor has rank {tensor_rank}")]
    DynamicDimsRankMismatch { tensor_rank: usize, flag_count: usize },

    #[error("invalid axis label '{label}' in axis notation '{notation}'")]
    InvalidAxisLabel { notation: String, label: char },

    #[error("invalid mesh dimension {value}; expected -1 (replicated) or a non-negative mesh dimension")]
    InvalidMeshDimension { value: i64 },

    #[error("mesh dimension {dimension} is out of range for a process mesh with {mesh_rank} dimension(s)")]
    MeshDimensionOutOfRange { dimension: usize, mesh_rank: usize },

    #[error("mesh dimension {dimension} shards more than one tensor dimension")]
    DuplicateMeshDimension { dimension: usize },

    #[error("batch dimension {batch_dim} is out of range for a tensor with rank {rank}")]
    InvalidBatchDimension { batch_dim: usize, rank: usize },

    #[error("partial mesh dimension {dimension} is invalid: {reason}")]
    InvalidPartialDimension { dimension: usize, reason: String },

    #[error("expected {expected} tensor spec(s) but got {got}")]
    InvalidSpecCount { expected: String, got: usize },

    #[error("all tensors of an operator must be placed on the same process mesh")]
    MeshMismatch,

    #[error("incompatible tensor shapes: {message}")]
    ShapeMismatch { message: String },

    #[error(transparent)]
    Broadcasting(#[from] ShapeBroadcastingError),

    #[error("no SPMD rule is registered for operator '{kind}'")]
    UnknownOperator { kind: String },

    #[error("missing required attribute '{name}'")]
    MissingAttribute { name: String },

    #[error("attribute '{name}' has type {got} but {expected} was expected")]
    InvalidAttributeType { name: String, expected: String, got: String },

    #[error("invalid value for attribute '{name}': {message}")]
    InvalidAttribute { name: String, message: String },

    #[error(transparent)]
    Mesh(#[from] MeshError),
}
