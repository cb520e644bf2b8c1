pub use spmd_core as core;

pub use spmd_core::attributes::Attribute;
pub use spmd_core::attributes::AttributeMap;
pub use spmd_core::dist_attr::DistTensorSpec;
pub use spmd_core::dist_attr::TensorDistAttr;
pub use spmd_core::dist_attr::copy_tensor_dist_attr_for_output;
pub use spmd_core::errors::Error;
pub use spmd_core::merge::CollisionPolicy;
pub use spmd_core::merge::FirstAxisPolicy;
pub use spmd_core::merge::FnPolicy;
pub use spmd_core::merge::sharding_merge_for_axis;
pub use spmd_core::merge::sharding_merge_for_tensors;
pub use spmd_core::merge::sharding_merge_for_tensors_with_policy;
pub use spmd_core::mesh::ProcessMesh;
pub use spmd_core::notation::AxisNotation;
pub use spmd_core::notation::AxisToMeshDimMap;
pub use spmd_core::notation::MeshDimension;
pub use spmd_core::partial::resolve_output_partial_dimension;
pub use spmd_core::rules::SpmdRule;
pub use spmd_core::rules::SpmdRuleBase;
pub use spmd_core::rules::SpmdRuleRegistry;
pub use spmd_core::shape::Shape;
pub use spmd_core::shape::Size;
