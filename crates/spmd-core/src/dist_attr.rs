//! Distribution attributes of tensors placed on a [`ProcessMesh`].

use std::{collections::BTreeSet, fmt::Display, sync::Arc};

use crate::{
    errors::Error,
    mesh::ProcessMesh,
    notation::{MeshDimension, ShardingVector, format_sharding_vector},
    shape::Shape,
};

/// Describes how a tensor is distributed over a [`ProcessMesh`].
///
/// The `dims_mapping` has one entry per tensor dimension describing the mesh dimension that dimension is sharded
/// along (if any), and `partial_dims` contains the mesh dimensions along which the tensor holds partial values that
/// still need to be reduced across processes. The `annotated` flag records whether the attributes were provided by
/// the user rather than inferred.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TensorDistAttr {
    process_mesh: Arc<ProcessMesh>,
    dims_mapping: ShardingVector,
    batch_dim: usize,
    dynamic_dims: Vec<bool>,
    annotated: bool,
    partial_dims: BTreeSet<usize>,
}

impl TensorDistAttr {
    /// Creates distribution attributes for a tensor on `process_mesh` with the provided `dims_mapping`. All tensor
    /// dimensions are static, the batch dimension is `0`, and the attributes are not annotated.
    pub fn new(process_mesh: Arc<ProcessMesh>, dims_mapping: ShardingVector) -> Self {
        let dynamic_dims = vec![false; dims_mapping.len()];
        Self { process_mesh, dims_mapping, batch_dim: 0, dynamic_dims, annotated: false, partial_dims: BTreeSet::new() }
    }

    /// Creates fully replicated distribution attributes for a tensor with rank `rank`.
    pub fn replicated(process_mesh: Arc<ProcessMesh>, rank: usize) -> Self {
        Self::new(process_mesh, vec![MeshDimension::Replicated; rank])
    }

    pub fn process_mesh(&self) -> &Arc<ProcessMesh> {
        &self.process_mesh
    }

    pub fn dims_mapping(&self) -> &[MeshDimension] {
        self.dims_mapping.as_slice()
    }

    pub fn batch_dim(&self) -> usize {
        self.batch_dim
    }

    pub fn dynamic_dims(&self) -> &[bool] {
        self.dynamic_dims.as_slice()
    }

    pub fn is_annotated(&self) -> bool {
        self.annotated
    }

    /// Mesh dimensions along which the tensor holds partial values, in ascending order.
    pub fn partial_dims(&self) -> &BTreeSet<usize> {
        &self.partial_dims
    }

    /// Returns `true` if the tensor holds partial values along any mesh dimension.
    pub fn is_partial(&self) -> bool {
        !self.partial_dims.is_empty()
    }

    pub fn set_process_mesh(&mut self, process_mesh: Arc<ProcessMesh>) {
        self.process_mesh = process_mesh;
    }

    pub fn set_dims_mapping(&mut self, dims_mapping: ShardingVector) {
        self.dims_mapping = dims_mapping;
    }

    pub fn set_batch_dim(&mut self, batch_dim: usize) {
        self.batch_dim = batch_dim;
    }

    pub fn set_dynamic_dims(&mut self, dynamic_dims: Vec<bool>) {
        self.dynamic_dims = dynamic_dims;
    }

    pub fn set_annotated(&mut self, annotated: bool) {
        self.annotated = annotated;
    }

    /// Replaces the partial mesh dimensions of this tensor.
    pub fn set_partial_dims<I: IntoIterator<Item = usize>>(&mut self, partial_dims: I) {
        self.partial_dims = partial_dims.into_iter().collect();
    }

    pub fn with_dims_mapping(mut self, dims_mapping: ShardingVector) -> Self {
        self.dims_mapping = dims_mapping;
        self
    }

    pub fn with_batch_dim(mut self, batch_dim: usize) -> Self {
        self.batch_dim = batch_dim;
        self
    }

    pub fn with_dynamic_dims(mut self, dynamic_dims: Vec<bool>) -> Self {
        self.dynamic_dims = dynamic_dims;
        self
    }

    pub fn with_annotated(mut self, annotated: bool) -> Self {
        self.annotated = annotated;
        self
    }

    pub fn with_partial_dims<I: IntoIterator<Item = usize>>(mut self, partial_dims: I) -> Self {
        self.set_partial_dims(partial_dims);
        self
    }

    /// Checks that these attributes are consistent with each other and with a tensor of shape `shape`.
    pub fn verify(&self, shape: &Shape) -> Result<(), Error> {
        let rank = shape.rank();
        if self.dims_mapping.len() != rank {
            return Err(Error::DimsMappingRankMismatch { tensor_rank: rank, mapping_rank: self.dims_mapping.len() });
        }
        if self.dynamic_dims.len() != rank {
            return Err(Error::DynamicDimsRankMismatch { tensor_rank: rank, flag_count: self.dynamic_dims.len() });
        }
        if rank > 0 && self.batch_dim >= rank {
            return Err(Error::InvalidBatchDimension { batch_dim: self.batch_dim, rank });
        }

        let mesh_rank = self.process_mesh.ndim();
        let mut sharded_dims = BTreeSet::new();
        for dimension in self.dims_mapping.iter().filter_map(MeshDimension::index) {
            if dimension >= mesh_rank {
                return Err(Error::MeshDimensionOutOfRange { dimension, mesh_rank });
            }
            if !sharded_dims.insert(dimension) {
                return Err(Error::DuplicateMeshDimension { dimension });
            }
        }

        for dimension in self.partial_dims.iter().copied() {
            if dimension >= mesh_rank {
                return Err(Error::InvalidPartialDimension {
                    dimension,
                    reason: format!("the process mesh only has {mesh_rank} dimension(s)"),
                });
            }
            if sharded_dims.contains(&dimension) {
                return Err(Error::InvalidPartialDimension {
                    dimension,
                    reason: "it also shards a tensor dimension".to_string(),
                });
            }
        }

        Ok(())
    }
}

impl Display for TensorDistAttr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{process_mesh: {}, dims_mapping: {}, batch_dim: {}, dynamic_dims: {:?}, annotated: {}, partial: {:?}}}",
            self.process_mesh,
            format_sharding_vector(&self.dims_mapping),
            self.batch_dim,
            self.dynamic_dims,
            self.annotated,
            self.partial_dims,
        )
    }
}

/// Creates distribution attributes for an output derived from a tensor with attributes `source`.
///
/// The process mesh, batch dimension, and dynamic dimensions are inherited from `source`. The result is never
/// annotated, and its dims mapping and partial dimensions are left empty for the operator rule to fill in.
pub fn copy_tensor_dist_attr_for_output(source: &TensorDistAttr) -> TensorDistAttr {
    TensorDistAttr {
        process_mesh: Arc::clone(&source.process_mesh),
        dims_mapping: Vec::new(),
        batch_dim: source.batch_dim,
        dynamic_dims: source.dynamic_dims.clone(),
        annotated: false,
        partial_dims: BTreeSet::new(),
    }
}

/// Shape and distribution attributes of a tensor that participates in an operator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistTensorSpec {
    shape: Shape,
    dist_attr: TensorDistAttr,
}

impl DistTensorSpec {
    pub fn new(shape: Shape, dist_attr: TensorDistAttr) -> Self {
        Self { shape, dist_attr }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dist_attr(&self) -> &TensorDistAttr {
        &self.dist_attr
    }

    pub fn dims_mapping(&self) -> &[MeshDimension] {
        self.dist_attr.dims_mapping()
    }

    pub fn process_mesh(&self) -> &Arc<ProcessMesh> {
        self.dist_attr.process_mesh()
    }

    /// Checks the distribution attributes of this spec against its shape. Refer to [`TensorDistAttr::verify`].
    pub fn verify(&self) -> Result<(), Error> {
        self.dist_attr.verify(&self.shape)
    }

    pub fn into_parts(self) -> (Shape, TensorDistAttr) {
        (self.shape, self.dist_attr)
    }
}

impl Display for DistTensorSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{shape: {}, dist_attr: {}}}", self.shape, self.dist_attr)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    use crate::notation::sharding_vector;

    fn test_mesh_2x4() -> Arc<ProcessMesh> {
        Arc::new(ProcessMesh::from_shape([("x", 2), ("y", 4)]).unwrap())
    }

    #[test]
    fn test_copy_tensor_dist_attr_for_output() {
        let mesh = test_mesh_2x4();
        for annotated in [false, true] {
            let source = TensorDistAttr::new(mesh.clone(), sharding_vector(&[0, 1]).unwrap())
                .with_batch_dim(2)
                .with_dynamic_dims(vec![false, true])
                .with_annotated(annotated)
                .with_partial_dims([1]);
            let snapshot = source.clone();
            let output = copy_tensor_dist_attr_for_output(&source);
            assert!(Arc::ptr_eq(output.process_mesh(), &mesh));
            assert_eq!(output.batch_dim(), 2);
            assert_eq!(output.dynamic_dims(), &[false, true]);
            assert!(!output.is_annotated());
            assert!(output.dims_mapping().is_empty());
            assert!(!output.is_partial());
            assert_eq!(source, snapshot);
        }
    }

    #[test]
    fn test_tensor_dist_attr_verify() {
        let mesh = test_mesh_2x4();
        let shape = Shape::of(&[8, 16]);

        let dist_attr = TensorDistAttr::new(mesh.clone(), sharding_vector(&[1, -1]).unwrap()).with_partial_dims([0]);
        assert_eq!(dist_attr.verify(&shape), Ok(()));

        let dist_attr = TensorDistAttr::replicated(mesh.clone(), 3);
        assert_eq!(dist_attr.verify(&shape), Err(Error::DimsMappingRankMismatch { tensor_rank: 2, mapping_rank: 3 }));

        let dist_attr = TensorDistAttr::replicated(mesh.clone(), 2).with_dynamic_dims(vec![true]);
        assert_eq!(dist_attr.verify(&shape), Err(Error::DynamicDimsRankMismatch { tensor_rank: 2, flag_count: 1 }));

        let dist_attr = TensorDistAttr::replicated(mesh.clone(), 2).with_batch_dim(2);
        assert_eq!(dist_attr.verify(&shape), Err(Error::InvalidBatchDimension { batch_dim: 2, rank: 2 }));

        let dist_attr = TensorDistAttr::new(mesh.clone(), sharding_vector(&[2, -1]).unwrap());
        assert_eq!(dist_attr.verify(&shape), Err(Error::MeshDimensionOutOfRange { dimension: 2, mesh_rank: 2 }));

        let dist_attr = TensorDistAttr::new(mesh.clone(), sharding_vector(&[0, 0]).unwrap());
        assert_eq!(dist_attr.verify(&shape), Err(Error::DuplicateMeshDimension { dimension: 0 }));

        let dist_attr = TensorDistAttr::new(mesh.clone(), sharding_vector(&[0, -1]).unwrap()).with_partial_dims([0]);
        assert!(matches!(dist_attr.verify(&shape), Err(Error::InvalidPartialDimension { dimension: 0, .. })));

        let dist_attr = TensorDistAttr::replicated(mesh.clone(), 2).with_partial_dims([5]);
        assert!(matches!(dist_attr.verify(&shape), Err(Error::InvalidPartialDimension { dimension: 5, .. })));

        let scalar = DistTensorSpec::new(Shape::scalar(), TensorDistAttr::replicated(mesh, 0));
        assert_eq!(scalar.verify(), Ok(()));
    }

    #[test]
    fn test_dist_tensor_spec_accessors_and_display() {
        let mesh = Arc::new(ProcessMesh::from_shape([("x", 2)]).unwrap());
        let dist_attr = TensorDistAttr::new(mesh.clone(), sharding_vector(&[0, -1]).unwrap());
        let spec = DistTensorSpec::new(Shape::of(&[4, 3]), dist_attr.clone());
        assert_eq!(spec.rank(), 2);
        assert_eq!(spec.dims_mapping(), &[MeshDimension::Sharded(0), MeshDimension::Replicated]);
        assert!(Arc::ptr_eq(spec.process_mesh(), &mesh));
        assert_eq!(
            spec.to_string(),
            "{shape: [4, 3], dist_attr: {process_mesh: ProcessMesh([x=2], process_ids=[0, 1]), dims_mapping: [0, -1], \
             batch_dim: 0, dynamic_dims: [false, false], annotated: false, partial: {}}}",
        );
        assert_eq!(spec.into_parts(), (Shape::of(&[4, 3]), dist_attr));
    }
}
