//! Logical process meshes that tensors are distributed over.
//!
//! A [`ProcessMesh`] arranges a set of processes (one per device) into a multi-dimensional grid where each
//! dimension has a human-readable name and a size. Sharding decisions never refer to mesh dimensions by name;
//! they use the dimension index (e.g., mesh dimension `0` is the first axis of the mesh), and so the rules only
//! consult the mesh to validate those indices.

use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
};

use thiserror::Error;

/// Error type for process mesh construction.
#[derive(Error, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MeshError {
    /// Error returned when a mesh axis name is empty.
    #[error("mesh axis names must be non-empty")]
    EmptyMeshAxisName,

    /// Error returned when a mesh axis has size `0`.
    #[error("mesh axis '{axis_name}' must have size > 0")]
    InvalidMeshAxisSize { axis_name: String },

    /// Error returned when mesh axis names are not unique.
    #[error("mesh axis '{axis_name}' appears more than once")]
    DuplicateMeshAxisName { axis_name: String },

    /// Error returned when process IDs in a mesh are not unique.
    #[error("process id {process_id} appears more than once in the mesh")]
    DuplicateProcessId { process_id: usize },

    /// Error returned when the number of processes does not match the product of axis sizes.
    #[error("mesh has {actual_process_count} process(es), but axis sizes imply {expected_process_count} process(es)")]
    ProcessCountMismatch { expected_process_count: usize, actual_process_count: usize },

    /// Error returned when arithmetic overflows while computing the mesh size.
    #[error("overflow while {context}")]
    Overflow { context: String },
}

/// A named dimension of a [`ProcessMesh`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MeshAxis {
    name: String,
    size: usize,
}

impl MeshAxis {
    /// Creates a mesh axis.
    pub fn new<N: Into<String>>(name: N, size: usize) -> Result<Self, MeshError> {
        let name = name.into();
        if name.is_empty() {
            return Err(MeshError::EmptyMeshAxisName);
        }
        if size == 0 {
            return Err(MeshError::InvalidMeshAxisSize { axis_name: name });
        }
        Ok(Self { name, size })
    }

    /// Name of this axis.
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Number of processes along this axis.
    pub fn size(&self) -> usize {
        self.size
    }
}

/// Logical mesh of processes that distributed tensors are placed on.
///
/// Meshes are owned outside of the sharding rules and are typically shared between many tensor
/// distribution attributes through an [`Arc`](std::sync::Arc).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessMesh {
    axes: Vec<MeshAxis>,
    process_ids: Vec<usize>,
}

impl ProcessMesh {
    /// Creates a process mesh from named axes and row-major process IDs.
    ///
    /// The expected number of `process_ids` is the product of all `axes` sizes. For an empty axis list the
    /// expected process count is `1`.
    pub fn new(axes: Vec<MeshAxis>, process_ids: Vec<usize>) -> Result<Self, MeshError> {
        let mut seen_axis_names = HashMap::with_capacity(axes.len());
        for (axis_index, axis) in axes.iter().enumerate() {
            if seen_axis_names.insert(axis.name.as_str(), axis_index).is_some() {
                return Err(MeshError::DuplicateMeshAxisName { axis_name: axis.name.clone() });
            }
        }

        let expected_process_count = axes.iter().try_fold(1usize, |count, axis| {
            count.checked_mul(axis.size).ok_or_else(|| MeshError::Overflow {
                context: "computing the mesh process count from axis sizes".to_string(),
            })
        })?;
        if process_ids.len() != expected_process_count {
            return Err(MeshError::ProcessCountMismatch {
                expected_process_count,
                actual_process_count: process_ids.len(),
            });
        }

        let mut seen_process_ids = HashSet::with_capacity(process_ids.len());
        if let Some(process_id) = process_ids.iter().find(|process_id| !seen_process_ids.insert(**process_id)) {
            return Err(MeshError::DuplicateProcessId { process_id: *process_id });
        }

        Ok(Self { axes, process_ids })
    }

    /// Creates a mesh with the provided `(name, size)` dimensions over processes `0..N`.
    pub fn from_shape<N: Into<String>, I: IntoIterator<Item = (N, usize)>>(shape: I) -> Result<Self, MeshError> {
        let axes = shape.into_iter().map(|(name, size)| MeshAxis::new(name, size)).collect::<Result<Vec<_>, _>>()?;
        let process_count = axes.iter().try_fold(1usize, |count, axis| {
            count.checked_mul(axis.size).ok_or_else(|| MeshError::Overflow {
                context: "computing the mesh process count from axis sizes".to_string(),
            })
        })?;
        Self::new(axes, (0..process_count).collect())
    }

    /// Returns the axes of this mesh.
    pub fn axes(&self) -> &[MeshAxis] {
        self.axes.as_slice()
    }

    /// Returns the number of mesh dimensions.
    pub fn ndim(&self) -> usize {
        self.axes.len()
    }

    /// Returns the axis sizes (i.e., the shape of the mesh).
    pub fn shape(&self) -> Vec<usize> {
        self.axes.iter().map(MeshAxis::size).collect()
    }

    /// Returns the size of mesh dimension `dimension`, if it exists.
    pub fn dim_size(&self, dimension: usize) -> Option<usize> {
        self.axes.get(dimension).map(MeshAxis::size)
    }
}

impl Display for ProcessMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shape = self.axes.iter().map(|axis| format!("{}={}", axis.name, axis.size)).collect::<Vec<_>>();
        write!(f, "ProcessMesh([{}], process_ids={:?})", shape.join(", "), self.process_ids)
    }
}
