use crate::{
    attributes::{AttributeMap, get_int},
    dist_attr::{DistTensorSpec, TensorDistAttr, copy_tensor_dist_attr_for_output},
    errors::Error,
    merge::sharding_merge_for_tensors,
    notation::{AxisNotation, MeshDimension},
    partial::resolve_output_partial_dimension,
    shape::{Shape, Size},
};

use super::{AXIS_LABELS, SpmdRule, check_spec_count, check_specs, output_partial_dims};

/// [`SpmdRule`] for elementwise operators with NumPy-style broadcasting.
///
/// The output of an elementwise operator has the broadcast rank `r` of its inputs and is labeled with the first `r`
/// axis labels. Each input of rank `q` is labeled with the trailing `q` labels of the output. Input dimensions of
/// static size `1` that are broadcast against a larger dimension are always treated as replicated. The output is
/// partial along every mesh dimension along which some input is partial.
#[derive(Copy, Clone, Debug, Default)]
pub struct ElementwiseRule;

impl ElementwiseRule {
    /// Operator kinds that [`SpmdRuleRegistry::with_default_rules`](super::SpmdRuleRegistry::with_default_rules)
    /// registers this rule for.
    pub const OPERATOR_KINDS: &'static [&'static str] = &[
        "add", "subtract", "multiply", "divide", "maximum", "minimum", "relu", "gelu", "exp", "tanh", "sqrt", "neg",
        "cast",
    ];

    /// Name of the attribute holding the number of operator inputs for backward inference.
    pub const INPUT_COUNT_ATTRIBUTE: &'static str = "input_count";

    /// Largest value of [`Self::INPUT_COUNT_ATTRIBUTE`] accepted by backward inference.
    pub const MAX_INPUT_COUNT: usize = 1024;
}

fn output_notation(rank: usize) -> Result<AxisNotation, Error> {
    if rank > AXIS_LABELS.len() {
        return Err(Error::ShapeMismatch {
            message: format!("elementwise operators support at most {} dimensions but got {rank}", AXIS_LABELS.len()),
        });
    }
    AxisNotation::from_labels(AXIS_LABELS.chars().take(rank))
}

impl SpmdRule for ElementwiseRule {
    fn infer_forward(&self, input_specs: &[DistTensorSpec], _: &AttributeMap) -> Result<Vec<DistTensorSpec>, Error> {
        check_specs(input_specs)?;
        let output_shape = Shape::broadcast(&input_specs.iter().map(DistTensorSpec::shape).collect::<Vec<_>>())?;
        let output_rank = output_shape.rank();
        let output_notation = output_notation(output_rank)?;

        let tensors = input_specs
            .iter()
            .map(|spec| {
                let offset = output_rank - spec.rank();
                let notation = AxisNotation::from_labels(output_notation.labels()[offset..].iter().copied())?;
                let sharding = spec
                    .shape()
                    .dimensions
                    .iter()
                    .zip(&output_shape.dimensions[offset..])
                    .zip(spec.dims_mapping())
                    .map(|((size, output_size), dimension)| match (size, output_size) {
                        (Size::Static(1), output_size) if *output_size != Size::Static(1) => MeshDimension::Replicated,
                        _ => *dimension,
                    })
                    .collect::<Vec<_>>();
                Ok((notation, sharding))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let axis_to_dim_map = sharding_merge_for_tensors(&tensors)?;

        let source = input_specs[0].dist_attr();
        let batch_dim = match input_specs[0].rank() {
            0 => 0,
            rank => source.batch_dim() + output_rank - rank,
        };
        let mut dims_mapping = axis_to_dim_map.dims_mapping_for(&output_notation);
        let partial_dims = output_partial_dims(
            input_specs,
            resolve_output_partial_dimension(&axis_to_dim_map, &output_notation),
            &mut dims_mapping,
        );
        let output_dist_attr = copy_tensor_dist_attr_for_output(source)
            .with_dims_mapping(dims_mapping)
            .with_batch_dim(batch_dim)
            .with_dynamic_dims(output_shape.dynamic_dims())
            .with_partial_dims(partial_dims);
        tracing::trace!(
            inputs = input_specs.len(),
            notation = %output_notation,
            axis_to_dim_map = %axis_to_dim_map,
            "resolved elementwise sharding"
        );
        Ok(vec![DistTensorSpec::new(output_shape, output_dist_attr)])
    }

    fn infer_backward(
        &self,
        output_specs: &[DistTensorSpec],
        attributes: &AttributeMap,
    ) -> Result<Vec<DistTensorSpec>, Error> {
        check_spec_count(output_specs, 1)?;
        let process_mesh = check_specs(output_specs)?;
        let input_count = get_int(attributes, Self::INPUT_COUNT_ATTRIBUTE, 2)?;
        let input_count = match usize::try_from(input_count) {
            Ok(count) if (1..=Self::MAX_INPUT_COUNT).contains(&count) => count,
            _ => {
                return Err(Error::InvalidAttribute {
                    name: Self::INPUT_COUNT_ATTRIBUTE.to_string(),
                    message: format!("expected between 1 and {} inputs but got {input_count}", Self::MAX_INPUT_COUNT),
                });
            }
        };

        let output_spec = &output_specs[0];
        let notation = output_notation(output_spec.rank())?;
        let axis_to_dim_map = sharding_merge_for_tensors(&[(notation.clone(), output_spec.dims_mapping().to_vec())])?;
        let input_spec = DistTensorSpec::new(
            output_spec.shape().clone(),
            TensorDistAttr::new(process_mesh, axis_to_dim_map.dims_mapping_for(&notation))
                .with_batch_dim(output_spec.dist_attr().batch_dim())
                .with_dynamic_dims(output_spec.shape().dynamic_dims()),
        );
        Ok(vec![input_spec; input_count])
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, sync::Arc};

    use pretty_assertions::assert_eq;
    use tracing_test::traced_test;

    use super::*;

    use crate::{attributes::Attribute, mesh::ProcessMesh, notation::sharding_vector};

    use MeshDimension::*;

    fn test_mesh() -> Arc<ProcessMesh> {
        Arc::new(ProcessMesh::from_shape([("x", 2), ("y", 4)]).unwrap())
    }

    fn spec(mesh: &Arc<ProcessMesh>, shape: &[usize], dims_mapping: &[i64]) -> DistTensorSpec {
        DistTensorSpec::new(Shape::of(shape), TensorDistAttr::new(mesh.clone(), sharding_vector(dims_mapping).unwrap()))
    }

    #[test]
    fn test_elementwise_forward_same_shapes() {
        let mesh = test_mesh();
        let inputs = vec![spec(&mesh, &[8, 16], &[0, -1]), spec(&mesh, &[8, 16], &[-1, 1])];
        let outputs = ElementwiseRule.infer_forward(&inputs, &AttributeMap::new()).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].shape(), &Shape::of(&[8, 16]));
        assert_eq!(outputs[0].dims_mapping(), &[Sharded(0), Sharded(1)]);
        assert!(!outputs[0].dist_attr().is_partial());
        assert!(!outputs[0].dist_attr().is_annotated());
        assert_eq!(outputs[0].verify(), Ok(()));
    }

    #[test]
    fn test_elementwise_forward_with_broadcasting() {
        let mesh = test_mesh();
        let inputs = vec![spec(&mesh, &[4, 8, 16], &[0, -1, -1]), spec(&mesh, &[16], &[1])];
        let outputs = ElementwiseRule.infer_forward(&inputs, &AttributeMap::new()).unwrap();
        assert_eq!(outputs[0].shape(), &Shape::of(&[4, 8, 16]));
        assert_eq!(outputs[0].dims_mapping(), &[Sharded(0), Replicated, Sharded(1)]);

        // The rank 1 input is aligned with the trailing output dimension and its batch dimension shifts with it.
        let inputs = vec![spec(&mesh, &[16], &[-1]), spec(&mesh, &[4, 8, 16], &[0, -1, -1])];
        let outputs = ElementwiseRule.infer_forward(&inputs, &AttributeMap::new()).unwrap();
        assert_eq!(outputs[0].dims_mapping(), &[Sharded(0), Replicated, Replicated]);
        assert_eq!(outputs[0].dist_attr().batch_dim(), 2);
        assert_eq!(outputs[0].verify(), Ok(()));
    }

    #[test]
    fn test_elementwise_forward_replicates_broadcast_dimensions() {
        let mesh = test_mesh();
        let inputs = vec![spec(&mesh, &[8, 1], &[-1, 1]), spec(&mesh, &[8, 16], &[0, -1])];
        let outputs = ElementwiseRule.infer_forward(&inputs, &AttributeMap::new()).unwrap();
        assert_eq!(outputs[0].shape(), &Shape::of(&[8, 16]));
        assert_eq!(outputs[0].dims_mapping(), &[Sharded(0), Replicated]);
    }

    #[test]
    fn test_elementwise_forward_with_unary_operator_and_dynamic_dimensions() {
        let mesh = test_mesh();
        let shape = Shape::new(vec![Size::Dynamic(None), Size::Static(32)]);
        let input = DistTensorSpec::new(
            shape.clone(),
            TensorDistAttr::new(mesh.clone(), vec![Sharded(0), Sharded(1)]).with_dynamic_dims(vec![true, false]),
        );
        let outputs = ElementwiseRule.infer_forward(&[input], &AttributeMap::new()).unwrap();
        assert_eq!(outputs[0].shape(), &shape);
        assert_eq!(outputs[0].dims_mapping(), &[Sharded(0), Sharded(1)]);
        assert_eq!(outputs[0].dist_attr().dynamic_dims(), &[true, false]);
    }

    #[test]
    #[traced_test]
    fn test_elementwise_forward_keeps_input_partial_dims() {
        let mesh = test_mesh();
        let partial = DistTensorSpec::new(
            Shape::of(&[8, 16]),
            TensorDistAttr::new(mesh.clone(), vec![Sharded(0), Replicated]).with_partial_dims([1]),
        );
        let inputs = vec![partial.clone(), spec(&mesh, &[16], &[-1])];
        let outputs = ElementwiseRule.infer_forward(&inputs, &AttributeMap::new()).unwrap();
        assert_eq!(outputs[0].dims_mapping(), &[Sharded(0), Replicated]);
        assert_eq!(outputs[0].dist_attr().partial_dims(), &BTreeSet::from([1]));
        assert_eq!(outputs[0].verify(), Ok(()));

        let inputs = vec![partial, spec(&mesh, &[8, 16], &[-1, 1])];
        let outputs = ElementwiseRule.infer_forward(&inputs, &AttributeMap::new()).unwrap();
        assert_eq!(outputs[0].dims_mapping(), &[Sharded(0), Replicated]);
        assert_eq!(outputs[0].dist_attr().partial_dims(), &BTreeSet::from([1]));
        assert_eq!(outputs[0].verify(), Ok(()));
        assert!(logs_contain("replicating output dimension sharded along a partial dimension"));
    }

    #[test]
    fn test_elementwise_forward_collision_keeps_first_axis() {
        let mesh = test_mesh();
        let inputs = vec![spec(&mesh, &[8, 16], &[0, -1]), spec(&mesh, &[8, 16], &[-1, 0])];
        let outputs = ElementwiseRule.infer_forward(&inputs, &AttributeMap::new()).unwrap();
        assert_eq!(outputs[0].dims_mapping(), &[Sharded(0), Replicated]);
    }

    #[test]
    fn test_elementwise_forward_errors() {
        let mesh = test_mesh();
        let other_mesh = Arc::new(ProcessMesh::from_shape([("x", 8)]).unwrap());
        let attributes = AttributeMap::new();
        assert!(matches!(ElementwiseRule.infer_forward(&[], &attributes), Err(Error::InvalidSpecCount { .. })));
        assert_eq!(
            ElementwiseRule.infer_forward(
                &[spec(&mesh, &[8, 16], &[0, -1]), spec(&mesh, &[8, 16], &[1, -1])],
                &attributes,
            ),
            Err(Error::Conflict { axis: 'a', first: 1, second: 0 }),
        );
        assert!(matches!(
            ElementwiseRule.infer_forward(
                &[spec(&mesh, &[8, 16], &[0, -1]), spec(&mesh, &[4, 16], &[-1, -1])],
                &attributes,
            ),
            Err(Error::Broadcasting(_)),
        ));
        assert_eq!(
            ElementwiseRule.infer_forward(&[spec(&mesh, &[8], &[0]), spec(&other_mesh, &[8], &[-1])], &attributes),
            Err(Error::MeshMismatch),
        );
    }

    #[test]
    fn test_elementwise_backward() {
        let mesh = test_mesh();
        let output = spec(&mesh, &[8, 16], &[1, 0]);
        let inputs = ElementwiseRule.infer_backward(&[output.clone()], &AttributeMap::new()).unwrap();
        assert_eq!(inputs.len(), 2);
        for input in &inputs {
            assert_eq!(input.shape(), output.shape());
            assert_eq!(input.dims_mapping(), &[Sharded(1), Sharded(0)]);
            assert_eq!(input.verify(), Ok(()));
        }

        let attributes = AttributeMap::from([("input_count".to_string(), Attribute::from(1i64))]);
        assert_eq!(ElementwiseRule.infer_backward(&[output.clone()], &attributes).unwrap().len(), 1);

        for input_count in [0, -1, ElementwiseRule::MAX_INPUT_COUNT as i64 + 1, i64::MAX] {
            let attributes = AttributeMap::from([("input_count".to_string(), Attribute::from(input_count))]);
            assert!(matches!(
                ElementwiseRule.infer_backward(&[output.clone()], &attributes),
                Err(Error::InvalidAttribute { .. }),
            ));
        }
        let max_input_count = ElementwiseRule::MAX_INPUT_COUNT as i64;
        let attributes = AttributeMap::from([("input_count".to_string(), Attribute::from(max_input_count))]);
        assert_eq!(
            ElementwiseRule.infer_backward(&[output.clone()], &attributes).unwrap().len(),
            ElementwiseRule::MAX_INPUT_COUNT,
        );
        assert!(matches!(
            ElementwiseRule.infer_backward(&[output.clone(), output], &AttributeMap::new()),
            Err(Error::InvalidSpecCount { got: 2, .. }),
        ));
    }
}
