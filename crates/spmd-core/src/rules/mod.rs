//! SPMD rules infer how the tensors of an operator should be distributed.
//!
//! Every operator kind has an [`SpmdRule`] that supports two kinds of inference:
//!
//!   - **Forward inference** takes the distributed specs of the operator inputs and infers the distributed specs of
//!     its outputs.
//!   - **Backward inference** takes the distributed specs of the operator outputs and infers the distributed specs of
//!     its inputs.
//!
//! Rules assign an [`AxisNotation`](crate::notation::AxisNotation) to every tensor according to the semantics of the
//! operator and then rely on the shared primitives of this crate (i.e., [`crate::merge`], [`crate::partial`], and
//! [`copy_tensor_dist_attr_for_output`](crate::dist_attr::copy_tensor_dist_attr_for_output)) to resolve the
//! sharding. Rules are looked up by operator kind in an explicit, caller-owned [`SpmdRuleRegistry`].

use std::{
    collections::{BTreeSet, HashMap, hash_map::Entry},
    fmt::Debug,
    sync::Arc,
};

use dyn_clone::{DynClone, clone_trait_object};

use crate::{
    attributes::AttributeMap,
    dist_attr::DistTensorSpec,
    errors::Error,
    mesh::ProcessMesh,
    notation::{AxisNotation, MeshDimension},
};

pub mod elementwise;
pub mod matmul;
pub mod reduction;

pub use elementwise::ElementwiseRule;
pub use matmul::MatmulRule;
pub use reduction::ReductionRule;

/// Contract implemented by all operator-specific sharding rules.
///
/// Both methods fail with [`Error::Unimplemented`] by default. There is no generic inference that works for all
/// operators and so every concrete rule must override the methods it supports.
pub trait SpmdRule: Debug + DynClone + Send + Sync {
    /// Infers the distributed specs of the operator outputs from the distributed specs of its inputs.
    fn infer_forward(
        &self,
        _input_specs: &[DistTensorSpec],
        _attributes: &AttributeMap,
    ) -> Result<Vec<DistTensorSpec>, Error> {
        Err(Error::Unimplemented {
            rule: std::any::type_name::<Self>().to_string(),
            operation: "infer_forward".to_string(),
        })
    }

    /// Infers the distributed specs of the operator inputs from the distributed specs of its outputs.
    fn infer_backward(
        &self,
        _output_specs: &[DistTensorSpec],
        _attributes: &AttributeMap,
    ) -> Result<Vec<DistTensorSpec>, Error> {
        Err(Error::Unimplemented {
            rule: std::any::type_name::<Self>().to_string(),
            operation: "infer_backward".to_string(),
        })
    }
}

impl SpmdRule for Box<dyn SpmdRule> {
    fn infer_forward(
        &self,
        input_specs: &[DistTensorSpec],
        attributes: &AttributeMap,
    ) -> Result<Vec<DistTensorSpec>, Error> {
        (**self).infer_forward(input_specs, attributes)
    }

    fn infer_backward(
        &self,
        output_specs: &[DistTensorSpec],
        attributes: &AttributeMap,
    ) -> Result<Vec<DistTensorSpec>, Error> {
        (**self).infer_backward(output_specs, attributes)
    }
}

clone_trait_object!(SpmdRule);

/// The base [`SpmdRule`] contract without any operator-specific inference.
#[derive(Copy, Clone, Debug, Default)]
pub struct SpmdRuleBase;

impl SpmdRule for SpmdRuleBase {}

/// Registry of [`SpmdRule`]s keyed by operator kind.
#[derive(Clone, Debug, Default)]
pub struct SpmdRuleRegistry {
    rules: HashMap<String, Box<dyn SpmdRule>>,
}

impl SpmdRuleRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the elementwise, matrix multiplication, and reduction rules registered for their
    /// respective operator kinds.
    pub fn with_default_rules() -> Self {
        let mut registry = Self::new();
        for kind in ElementwiseRule::OPERATOR_KINDS {
            registry.register(*kind, ElementwiseRule);
        }
        for kind in MatmulRule::OPERATOR_KINDS {
            registry.register(*kind, MatmulRule);
        }
        for kind in ReductionRule::OPERATOR_KINDS {
            registry.register(*kind, ReductionRule);
        }
        registry
    }

    /// Registers `rule` for operator kind `kind`, returning the previously registered rule, if any.
    pub fn register<K, R>(&mut self, kind: K, rule: R) -> Option<Box<dyn SpmdRule>>
    where
        K: Into<String>,
        R: SpmdRule + 'static,
    {
        match self.rules.entry(kind.into()) {
            Entry::Occupied(mut entry) => {
                tracing::debug!(operator = %entry.key(), "replacing registered SPMD rule");
                Some(entry.insert(Box::new(rule)))
            }
            Entry::Vacant(entry) => {
                entry.insert(Box::new(rule));
                None
            }
        }
    }

    /// Returns `true` if a rule is registered for operator kind `kind`.
    pub fn contains(&self, kind: &str) -> bool {
        self.rules.contains_key(kind)
    }

    /// Returns the rule registered for operator kind `kind`.
    pub fn get(&self, kind: &str) -> Result<&dyn SpmdRule, Error> {
        self.rules
            .get(kind)
            .map(|rule| rule.as_ref())
            .ok_or_else(|| Error::UnknownOperator { kind: kind.to_string() })
    }

    /// Returns the registered operator kinds in ascending order.
    pub fn operator_kinds(&self) -> Vec<&str> {
        let mut kinds = self.rules.keys().map(String::as_str).collect::<Vec<_>>();
        kinds.sort_unstable();
        kinds
    }

    /// Runs forward inference using the rule registered for operator kind `kind`.
    pub fn infer_forward(
        &self,
        kind: &str,
        input_specs: &[DistTensorSpec],
        attributes: &AttributeMap,
    ) -> Result<Vec<DistTensorSpec>, Error> {
        let output_specs = self.get(kind)?.infer_forward(input_specs, attributes)?;
        tracing::trace!(operator = kind, inputs = input_specs.len(), outputs = output_specs.len(), "inferred forward");
        Ok(output_specs)
    }

    /// Runs backward inference using the rule registered for operator kind `kind`.
    pub fn infer_backward(
        &self,
        kind: &str,
        output_specs: &[DistTensorSpec],
        attributes: &AttributeMap,
    ) -> Result<Vec<DistTensorSpec>, Error> {
        let input_specs = self.get(kind)?.infer_backward(output_specs, attributes)?;
        tracing::trace!(operator = kind, inputs = input_specs.len(), outputs = output_specs.len(), "inferred backward");
        Ok(input_specs)
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by the concrete rules
// ---------------------------------------------------------------------------

/// Labels available to rules for the axes of their tensors.
pub(crate) const AXIS_LABELS: &str = "abcdefghijklmnopqrstuvwxyz";

/// Returns an [`Error::InvalidSpecCount`] unless `specs` contains exactly `expected` specs.
pub(crate) fn check_spec_count(specs: &[DistTensorSpec], expected: usize) -> Result<(), Error> {
    if specs.len() != expected {
        return Err(Error::InvalidSpecCount { expected: expected.to_string(), got: specs.len() });
    }
    Ok(())
}

/// Checks that every spec has a dims mapping that matches its rank and that all specs share one process mesh,
/// returning that mesh.
pub(crate) fn check_specs(specs: &[DistTensorSpec]) -> Result<Arc<ProcessMesh>, Error> {
    let first = specs.first().ok_or_else(|| Error::InvalidSpecCount { expected: "at least 1".to_string(), got: 0 })?;
    for spec in specs {
        if spec.dims_mapping().len() != spec.rank() {
            return Err(Error::DimsMappingRankMismatch {
                tensor_rank: spec.rank(),
                mapping_rank: spec.dims_mapping().len(),
            });
        }
        if spec.process_mesh() != first.process_mesh() {
            return Err(Error::MeshMismatch);
        }
    }
    Ok(Arc::clone(first.process_mesh()))
}

/// Pairs the notation of a tensor with its sharding, as expected by the sharding merge.
pub(crate) fn notation_and_sharding(
    notation: &AxisNotation,
    sharding: &[MeshDimension],
) -> (AxisNotation, Vec<MeshDimension>) {
    (notation.clone(), sharding.to_vec())
}

/// Returns the partial mesh dimensions of an output: the `resolved` dimensions of the contracted or reduced axes plus
/// every partial dimension carried by `input_specs`. Output dimensions in `dims_mapping` that are sharded along one of
/// the returned mesh dimensions are replaced with [`MeshDimension::Replicated`], since a mesh dimension cannot both
/// shard and reduce the same tensor.
pub(crate) fn output_partial_dims(
    input_specs: &[DistTensorSpec],
    resolved: impl IntoIterator<Item = usize>,
    dims_mapping: &mut [MeshDimension],
) -> BTreeSet<usize> {
    let partial_dims = input_specs
        .iter()
        .flat_map(|spec| spec.dist_attr().partial_dims().iter().copied())
        .chain(resolved)
        .collect::<BTreeSet<_>>();
    for (tensor_dim, dimension) in dims_mapping.iter_mut().enumerate() {
        match *dimension {
            MeshDimension::Sharded(mesh_dim) if partial_dims.contains(&mesh_dim) => {
                tracing::debug!(tensor_dim, mesh_dim, "replicating output dimension sharded along a partial dimension");
                *dimension = MeshDimension::Replicated;
            }
            _ => {}
        }
    }
    partial_dims
}
