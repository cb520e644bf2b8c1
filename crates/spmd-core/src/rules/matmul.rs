use crate::{
    attributes::{AttributeMap, get_bool},
    dist_attr::{DistTensorSpec, TensorDistAttr, copy_tensor_dist_attr_for_output},
    errors::Error,
    merge::sharding_merge_for_tensors,
    notation::{AxisNotation, MeshDimension},
    partial::resolve_output_partial_dimension,
    shape::{Shape, Size},
};

use super::{AXIS_LABELS, SpmdRule, check_spec_count, check_specs, notation_and_sharding, output_partial_dims};

/// [`SpmdRule`] for (batched) matrix multiplications.
///
/// The operands are labeled `[batch]mk` and `[batch]kn` (or `[batch]km` and `[batch]nk` when transposed through the
/// `trans_x` and `trans_y` attributes) and the output is labeled `[batch]mn`. Rank 1 operands are vectors labeled
/// only with `k`, in which case the corresponding output dimension is dropped. Batch dimensions broadcast like they
/// do for elementwise operators and mesh dimensions that shard the contracted `k` axis become partial dimensions of
/// the output.
#[derive(Copy, Clone, Debug, Default)]
pub struct MatmulRule;

impl MatmulRule {
    /// Operator kinds that [`SpmdRuleRegistry::with_default_rules`](super::SpmdRuleRegistry::with_default_rules)
    /// registers this rule for.
    pub const OPERATOR_KINDS: &'static [&'static str] = &["matmul"];
}

const CONTRACTED_AXIS: char = 'k';

/// Labels available for batch dimensions (i.e., all axis labels except for `k`, `m`, and `n`).
fn batch_labels(batch_rank: usize) -> Result<Vec<char>, Error> {
    let labels =
        AXIS_LABELS.chars().filter(|label| !matches!(label, 'k' | 'm' | 'n')).take(batch_rank).collect::<Vec<_>>();
    if labels.len() < batch_rank {
        return Err(Error::ShapeMismatch {
            message: format!("matmul supports at most {} batch dimensions but got {batch_rank}", labels.len()),
        });
    }
    Ok(labels)
}

/// Builds the notation of a matmul operand with rank `rank`. `inner` holds the labels of the two matrix dimensions in
/// their non-transposed order.
fn operand_notation(
    batch_labels: &[char],
    rank: usize,
    inner: [char; 2],
    transposed: bool,
) -> Result<AxisNotation, Error> {
    if rank == 1 {
        return AxisNotation::from_labels([CONTRACTED_AXIS]);
    }
    let batch = &batch_labels[batch_labels.len() - (rank - 2)..];
    let inner = if transposed { [inner[1], inner[0]] } else { inner };
    AxisNotation::from_labels(batch.iter().copied().chain(inner))
}

fn operand_rank(spec: &DistTensorSpec, operand: &str) -> Result<usize, Error> {
    match spec.rank() {
        0 => Err(Error::ShapeMismatch { message: format!("matmul operand '{operand}' cannot be a scalar") }),
        rank => Ok(rank),
    }
}

impl SpmdRule for MatmulRule {
    fn infer_forward(
        &self,
        input_specs: &[DistTensorSpec],
        attributes: &AttributeMap,
    ) -> Result<Vec<DistTensorSpec>, Error> {
        check_spec_count(input_specs, 2)?;
        check_specs(input_specs)?;
        let trans_x = get_bool(attributes, "trans_x", false)?;
        let trans_y = get_bool(attributes, "trans_y", false)?;
        let (x, y) = (&input_specs[0], &input_specs[1]);
        let x_rank = operand_rank(x, "x")?;
        let y_rank = operand_rank(y, "y")?;

        let batch_rank = x_rank.saturating_sub(2).max(y_rank.saturating_sub(2));
        let batch_labels = batch_labels(batch_rank)?;
        let x_notation = operand_notation(&batch_labels, x_rank, ['m', CONTRACTED_AXIS], trans_x && x_rank > 1)?;
        let y_notation = operand_notation(&batch_labels, y_rank, [CONTRACTED_AXIS, 'n'], trans_y && y_rank > 1)?;

        let size_of = |spec: &DistTensorSpec, notation: &AxisNotation, label: char| {
            notation.position(label).map(|position| spec.shape().dimensions[position])
        };
        let x_k = size_of(x, &x_notation, CONTRACTED_AXIS);
        let y_k = size_of(y, &y_notation, CONTRACTED_AXIS);
        match (x_k, y_k) {
            (Some(Size::Static(x_k)), Some(Size::Static(y_k))) if x_k != y_k => {
                return Err(Error::ShapeMismatch {
                    message: format!(
                        "the contracted dimension of matmul operands '{}' and '{}' differs ({x_k} != {y_k})",
                        x.shape(),
                        y.shape(),
                    ),
                });
            }
            _ => {}
        }

        // Batch dimensions of static size 1 that are broadcast against larger ones are replicated.
        let batch_shape = |spec: &DistTensorSpec, rank: usize| match rank {
            1 => Shape::scalar(),
            _ => Shape::new(spec.shape().dimensions[..rank - 2].to_vec()),
        };
        let x_batch_shape = batch_shape(x, x_rank);
        let y_batch_shape = batch_shape(y, y_rank);
        let output_batch_shape = Shape::broadcast(&[&x_batch_shape, &y_batch_shape])?;
        let operand_sharding = |spec: &DistTensorSpec, operand_batch_shape: &Shape| {
            let offset = output_batch_shape.rank() - operand_batch_shape.rank();
            spec.dims_mapping()
                .iter()
                .enumerate()
                .map(|(index, dimension)| match operand_batch_shape.dimensions.get(index) {
                    Some(Size::Static(1)) if output_batch_shape.dimensions[offset + index] != Size::Static(1) => {
                        MeshDimension::Replicated
                    }
                    _ => *dimension,
                })
                .collect::<Vec<_>>()
        };
        let x_sharding = operand_sharding(x, &x_batch_shape);
        let y_sharding = operand_sharding(y, &y_batch_shape);

        let axis_to_dim_map = sharding_merge_for_tensors(&[
            notation_and_sharding(&x_notation, &x_sharding),
            notation_and_sharding(&y_notation, &y_sharding),
        ])?;

        let mut output_labels = batch_labels.clone();
        let mut output_dimensions = output_batch_shape.dimensions.clone();
        if x_rank > 1 {
            output_labels.push('m');
            output_dimensions.extend(size_of(x, &x_notation, 'm'));
        }
        if y_rank > 1 {
            output_labels.push('n');
            output_dimensions.extend(size_of(y, &y_notation, 'n'));
        }
        let output_notation = AxisNotation::from_labels(output_labels)?;
        let output_shape = Shape::new(output_dimensions);
        let output_rank = output_shape.rank();

        let source = x.dist_attr();
        let batch_dim = if x_rank > 1 && output_rank > 0 {
            (source.batch_dim() + output_rank - x_rank.min(output_rank)).min(output_rank - 1)
        } else {
            0
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
            .with_partial_dims(partial_dims.iter().copied());
        tracing::trace!(
            x_notation = %x_notation,
            y_notation = %y_notation,
            output_notation = %output_notation,
            axis_to_dim_map = %axis_to_dim_map,
            partial_dims = ?partial_dims,
            "resolved matmul sharding"
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
        let trans_x = get_bool(attributes, "trans_x", false)?;
        let trans_y = get_bool(attributes, "trans_y", false)?;
        let output = &output_specs[0];
        let rank = output.rank();
        if rank < 2 {
            return Err(Error::ShapeMismatch {
                message: format!(
                    "matmul backward inference requires an output of rank 2 or more but got '{}'",
                    output.shape(),
                ),
            });
        }

        let batch_labels = batch_labels(rank - 2)?;
        let output_notation = AxisNotation::from_labels(batch_labels.iter().copied().chain(['m', 'n']))?;
        let x_notation = operand_notation(&batch_labels, rank, ['m', CONTRACTED_AXIS], trans_x)?;
        let y_notation = operand_notation(&batch_labels, rank, [CONTRACTED_AXIS, 'n'], trans_y)?;
        let axis_to_dim_map =
            sharding_merge_for_tensors(&[notation_and_sharding(&output_notation, output.dims_mapping())])?;

        let operand_spec = |notation: &AxisNotation| {
            let dimensions = notation
                .iter()
                .map(|label| match output_notation.position(label) {
                    Some(position) => output.shape().dimensions[position],
                    None => Size::Dynamic(None),
                })
                .collect::<Vec<_>>();
            let shape = Shape::new(dimensions);
            let dist_attr = TensorDistAttr::new(process_mesh.clone(), axis_to_dim_map.dims_mapping_for(notation))
                .with_batch_dim(output.dist_attr().batch_dim())
                .with_dynamic_dims(shape.dynamic_dims());
            DistTensorSpec::new(shape, dist_attr)
        };
        Ok(vec![operand_spec(&x_notation), operand_spec(&y_notation)])
    }
}
