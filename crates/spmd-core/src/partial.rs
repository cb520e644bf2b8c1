use crate::notation::{AxisNotation, AxisToMeshDimMap, MeshDimension};

/// Returns the mesh dimensions along which an output with notation `output_notation` must be produced as a partial
/// (i.e., not yet reduced) result.
///
/// A mesh dimension is partial when it shards an input axis that does not appear in the output, which happens for
/// contracted or reduced axes (e.g., `k` in `ik,kj->ij`). Replicated axes never produce partial dimensions. The
/// result follows the iteration order of `input_axis_to_dim_map`, which is ascending by axis label.
///
/// # Examples
///
/// ```rust
/// # use spmd_core::{merge::sharding_merge_for_tensors, notation::*, partial::resolve_output_partial_dimension};
/// let x = (AxisNotation::new("ik").unwrap(), sharding_vector(&[0, 1]).unwrap());
/// let y = (AxisNotation::new("kj").unwrap(), sharding_vector(&[1, -1]).unwrap());
/// let map = sharding_merge_for_tensors(&[x, y]).unwrap();
/// assert_eq!(resolve_output_partial_dimension(&map, &AxisNotation::new("ij").unwrap()), vec![1]);
/// ```
pub fn resolve_output_partial_dimension(
    input_axis_to_dim_map: &AxisToMeshDimMap,
    output_notation: &AxisNotation,
) -> Vec<usize> {
    input_axis_to_dim_map
        .iter()
        .filter(|(axis, _)| !output_notation.contains(*axis))
        .filter_map(|(_, dimension)| match dimension {
            MeshDimension::Sharded(dimension) => Some(dimension),
            MeshDimension::Replicated => None,
        })
        .collect()
}
