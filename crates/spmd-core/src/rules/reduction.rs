use std::collections::BTreeSet;

use crate::{
    attributes::{AttributeMap, get_bool, get_ints},
    dist_attr::{DistTensorSpec, TensorDistAttr, copy_tensor_dist_attr_for_output},
    errors::Error,
    merge::sharding_merge_for_tensors,
    notation::{AxisNotation, MeshDimension},
    partial::resolve_output_partial_dimension,
    shape::{Shape, Size},
};

use super::{AXIS_LABELS, SpmdRule, check_spec_count, check_specs, notation_and_sharding, output_partial_dims};

/// [`SpmdRule`] for reductions over a subset of the axes of a single tensor (e.g., `reduce_sum`).
///
/// The reduced axes are provided through the `axis` attribute, which may contain negative axes that count from the
/// end. An empty (or missing) `axis` reduces all axes. Reduced axes are dropped from the output unless the `keep_dim`
/// attribute is set, in which case they are kept as replicated dimensions of size `1`. Mesh dimensions that shard a
/// reduced axis become partial dimensions of the output, alongside any partial dimensions of the input.
#[derive(Copy, Clone, Debug, Default)]
pub struct ReductionRule;

impl ReductionRule {
    /// Operator kinds that [`SpmdRuleRegistry::with_default_rules`](super::SpmdRuleRegistry::with_default_rules)
    /// registers this rule for.
    pub const OPERATOR_KINDS: &'static [&'static str] =
        &["reduce_sum", "reduce_mean", "reduce_max", "reduce_min", "reduce_prod"];

    pub const AXIS_ATTRIBUTE: &'static str = "axis";
    pub const KEEP_DIM_ATTRIBUTE: &'static str = "keep_dim";
}

fn axes_attribute(attributes: &AttributeMap) -> Result<Vec<i64>, Error> {
    if attributes.contains_key(ReductionRule::AXIS_ATTRIBUTE) {
        get_ints(attributes, ReductionRule::AXIS_ATTRIBUTE)
    } else {
        Ok(Vec::new())
    }
}

/// Normalizes the (possibly negative) `axes` of a tensor with rank `rank`. An empty list selects all axes.
fn reduced_axes(axes: &[i64], rank: usize) -> Result<BTreeSet<usize>, Error> {
    if axes.is_empty() {
        return Ok((0..rank).collect());
    }
    axes.iter()
        .map(|axis| {
            let normalized = if *axis < 0 { *axis + rank as i64 } else { *axis };
            if (0..rank as i64).contains(&normalized) {
                Ok(normalized as usize)
            } else {
                Err(Error::InvalidAttribute {
                    name: ReductionRule::AXIS_ATTRIBUTE.to_string(),
                    message: format!("axis {axis} is out of range for a tensor with rank {rank}"),
                })
            }
        })
        .collect()
}

fn input_notation(rank: usize) -> Result<AxisNotation, Error> {
    if rank > AXIS_LABELS.len() {
        return Err(Error::ShapeMismatch {
            message: format!("reductions support at most {} dimensions but got {rank}", AXIS_LABELS.len()),
        });
    }
    AxisNotation::from_labels(AXIS_LABELS.chars().take(rank))
}

/// Returns the notation made up of the labels of `notation` that are not in `reduced_axes`.
fn kept_notation(notation: &AxisNotation, reduced_axes: &BTreeSet<usize>) -> Result<AxisNotation, Error> {
    AxisNotation::from_labels(
        notation.iter().enumerate().filter(|(index, _)| !reduced_axes.contains(index)).map(|(_, label)| label),
    )
}

impl SpmdRule for ReductionRule {
    fn infer_forward(
        &self,
        input_specs: &[DistTensorSpec],
        attributes: &AttributeMap,
    ) -> Result<Vec<DistTensorSpec>, Error> {
        check_spec_count(input_specs, 1)?;
        check_specs(input_specs)?;
        let keep_dim = get_bool(attributes, Self::KEEP_DIM_ATTRIBUTE, false)?;
        let input = &input_specs[0];
        let reduced_axes = reduced_axes(&axes_attribute(attributes)?, input.rank())?;

        let notation = input_notation(input.rank())?;
        let output_notation = kept_notation(&notation, &reduced_axes)?;
        let axis_to_dim_map = sharding_merge_for_tensors(&[notation_and_sharding(&notation, input.dims_mapping())])?;
        let resolved_partial_dims = resolve_output_partial_dimension(&axis_to_dim_map, &output_notation);

        let (output_shape, mut dims_mapping) = if keep_dim {
            let dimensions = input
                .shape()
                .dimensions
                .iter()
                .enumerate()
                .map(|(index, size)| if reduced_axes.contains(&index) { Size::Static(1) } else { *size })
                .collect::<Vec<_>>();
            let dims_mapping = notation
                .iter()
                .enumerate()
                .map(|(index, label)| {
                    if reduced_axes.contains(&index) {
                        MeshDimension::Replicated
                    } else {
                        axis_to_dim_map.get(label).unwrap_or_default()
                    }
                })
                .collect::<Vec<_>>();
            (Shape::new(dimensions), dims_mapping)
        } else {
            let dimensions = input
                .shape()
                .dimensions
                .iter()
                .enumerate()
                .filter(|(index, _)| !reduced_axes.contains(index))
                .map(|(_, size)| *size)
                .collect::<Vec<_>>();
            (Shape::new(dimensions), axis_to_dim_map.dims_mapping_for(&output_notation))
        };

        let partial_dims = output_partial_dims(input_specs, resolved_partial_dims, &mut dims_mapping);
        let source = input.dist_attr();
        let batch_dim = match (keep_dim, reduced_axes.contains(&source.batch_dim())) {
            (true, _) => source.batch_dim(),
            (false, true) => 0,
            (false, false) => source.batch_dim() - reduced_axes.range(..source.batch_dim()).count(),
        };
        let output_dist_attr = copy_tensor_dist_attr_for_output(source)
            .with_dims_mapping(dims_mapping)
            .with_batch_dim(batch_dim)
            .with_dynamic_dims(output_shape.dynamic_dims())
            .with_partial_dims(partial_dims.iter().copied());
        tracing::trace!(
            notation = %notation,
            output_notation = %output_notation,
            keep_dim,
            partial_dims = ?partial_dims,
            "resolved reduction sharding"
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
        let keep_dim = get_bool(attributes, Self::KEEP_DIM_ATTRIBUTE, false)?;
        let output = &output_specs[0];
        let axes = axes_attribute(attributes)?;

        let input_rank = if keep_dim {
            output.rank()
        } else if axes.is_empty() {
            return Err(Error::InvalidAttribute {
                name: Self::AXIS_ATTRIBUTE.to_string(),
                message: "cannot infer the input rank of a reduction over all axes without 'keep_dim'".to_string(),
            });
        } else {
            output.rank() + axes.iter().collect::<BTreeSet<_>>().len()
        };
        let reduced_axes = reduced_axes(&axes, input_rank)?;
        if input_rank - reduced_axes.len() != output.rank() && !keep_dim {
            return Err(Error::InvalidAttribute {
                name: Self::AXIS_ATTRIBUTE.to_string(),
                message: format!("axes {axes:?} refer to the same dimension of a tensor with rank {input_rank}"),
            });
        }

        let notation = input_notation(input_rank)?;
        let kept_notation = kept_notation(&notation, &reduced_axes)?;
        let kept_dims_mapping = if keep_dim {
            output
                .dims_mapping()
                .iter()
                .enumerate()
                .filter(|(index, _)| !reduced_axes.contains(index))
                .map(|(_, dimension)| *dimension)
                .collect::<Vec<_>>()
        } else {
            output.dims_mapping().to_vec()
        };
        let axis_to_dim_map = sharding_merge_for_tensors(&[notation_and_sharding(&kept_notation, &kept_dims_mapping)])?;

        let mut kept_sizes = output
            .shape()
            .dimensions
            .iter()
            .enumerate()
            .filter(|(index, _)| !keep_dim || !reduced_axes.contains(index))
            .map(|(_, size)| *size);
        let dimensions = (0..input_rank)
            .map(|index| match reduced_axes.contains(&index) {
                false => kept_sizes.next(),
                true => None,
            })
            .map(|size| size.unwrap_or(Size::Dynamic(None)))
            .collect::<Vec<_>>();
        let shape = Shape::new(dimensions);

        let batch_dim = output.dist_attr().batch_dim();
        let batch_dim = if keep_dim {
            batch_dim
        } else {
            (0..input_rank).filter(|index| !reduced_axes.contains(index)).nth(batch_dim).unwrap_or(0)
        };
        let dist_attr = TensorDistAttr::new(process_mesh, axis_to_dim_map.dims_mapping_for(&notation))
            .with_batch_dim(batch_dim)
            .with_dynamic_dims(shape.dynamic_dims());
        Ok(vec![DistTensorSpec::new(shape, dist_attr)])
    }
}
