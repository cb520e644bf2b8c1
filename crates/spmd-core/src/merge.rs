//! Sharding merge across the tensors that participate in an operator.
//!
//! Two rules govern how the sharding of the same logical axis is combined:
//!
//!   1. A replicated axis can be merged with any sharded axis, and the result is sharded.
//!   2. A tensor axis can be sharded along at most one mesh dimension. Merging two different mesh dimensions for
//!      the same axis results in an [`Error::Conflict`].
//!
//! The symmetric situation, where the same mesh dimension ends up sharding more than one axis, is not an error.
//! It is resolved by a [`CollisionPolicy`] that picks the axis that keeps the mesh dimension while all other
//! axes become replicated. The default [`FirstAxisPolicy`] keeps the first axis that claimed the dimension.

use std::{collections::BTreeMap, fmt::Debug};

use crate::{
    errors::Error,
    notation::{AxisNotation, AxisToMeshDimMap, MeshDimension},
};

/// Merges two candidate mesh dimensions for tensor axis `axis` into one.
///
/// # Examples
///
/// ```rust
/// # use spmd_core::{merge::sharding_merge_for_axis, notation::MeshDimension::*};
/// assert_eq!(sharding_merge_for_axis('k', Replicated, Sharded(1)), Ok(Sharded(1)));
/// assert_eq!(sharding_merge_for_axis('k', Sharded(1), Sharded(1)), Ok(Sharded(1)));
/// assert!(sharding_merge_for_axis('k', Sharded(0), Sharded(1)).is_err());
/// ```
pub fn sharding_merge_for_axis(
    axis: char,
    first: MeshDimension,
    second: MeshDimension,
) -> Result<MeshDimension, Error> {
    match (first, second) {
        (first, second) if first == second => Ok(first),
        (MeshDimension::Replicated, sharded) | (sharded, MeshDimension::Replicated) => Ok(sharded),
        (MeshDimension::Sharded(first), MeshDimension::Sharded(second)) => {
            Err(Error::Conflict { axis, first, second })
        }
    }
}

/// Policy used to resolve a mesh dimension that was claimed by more than one tensor axis.
///
/// Implementations receive the claimants in the order in which they first claimed `mesh_dimension` and must return
/// the label of the axis that keeps it. This is the hook for a cost-aware resolver; the sharding merge itself never
/// needs to change.
pub trait CollisionPolicy: Debug {
    fn resolve(&self, mesh_dimension: usize, claimants: &[char]) -> char;
}

/// [`CollisionPolicy`] that keeps the first axis that claimed a mesh dimension.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct FirstAxisPolicy;

impl CollisionPolicy for FirstAxisPolicy {
    fn resolve(&self, _: usize, claimants: &[char]) -> char {
        claimants[0]
    }
}

impl<P: CollisionPolicy + ?Sized> CollisionPolicy for &P {
    fn resolve(&self, mesh_dimension: usize, claimants: &[char]) -> char {
        (**self).resolve(mesh_dimension, claimants)
    }
}

impl<P: CollisionPolicy + ?Sized> CollisionPolicy for Box<P> {
    fn resolve(&self, mesh_dimension: usize, claimants: &[char]) -> char {
        (**self).resolve(mesh_dimension, claimants)
    }
}

/// [`CollisionPolicy`] backed by an arbitrary function.
pub struct FnPolicy<F>(pub F);

impl<F> Debug for FnPolicy<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FnPolicy")
    }
}

impl<F: Fn(usize, &[char]) -> char> CollisionPolicy for FnPolicy<F> {
    fn resolve(&self, mesh_dimension: usize, claimants: &[char]) -> char {
        (self.0)(mesh_dimension, claimants)
    }
}

/// Merges the shardings of all tensors that participate in an operator into a single resolved mesh dimension per
/// axis label, using the [`FirstAxisPolicy`] for mesh dimensions that are claimed by more than one axis.
///
/// `tensors` contains one `(notation, sharding)` pair per tensor and the order of the pairs matters: it determines
/// which axis keeps a mesh dimension when a collision is resolved.
///
/// # Examples
///
/// ```rust
/// # use spmd_core::{merge::sharding_merge_for_tensors, notation::{AxisNotation, MeshDimension::*, sharding_vector}};
/// let x = (AxisNotation::new("ik").unwrap(), sharding_vector(&[0, 1]).unwrap());
/// let y = (AxisNotation::new("kj").unwrap(), sharding_vector(&[1, -1]).unwrap());
/// let map = sharding_merge_for_tensors(&[x, y]).unwrap();
/// assert_eq!(map.get('i'), Some(Sharded(0)));
/// assert_eq!(map.get('k'), Some(Sharded(1)));
/// assert_eq!(map.get('j'), Some(Replicated));
/// ```
pub fn sharding_merge_for_tensors(tensors: &[(AxisNotation, Vec<MeshDimension>)]) -> Result<AxisToMeshDimMap, Error> {
    sharding_merge_for_tensors_with_policy(tensors, &FirstAxisPolicy)
}

/// Same as [`sharding_merge_for_tensors`] but with a custom [`CollisionPolicy`].
pub fn sharding_merge_for_tensors_with_policy<P: CollisionPolicy + ?Sized>(
    tensors: &[(AxisNotation, Vec<MeshDimension>)],
    policy: &P,
) -> Result<AxisToMeshDimMap, Error> {
    let mut axis_to_dim_map = AxisToMeshDimMap::new();

    // Axes claiming each concrete mesh dimension, in the order in which they first claimed it.
    let mut dim_to_axes_map = BTreeMap::<usize, Vec<char>>::new();

    for (notation, sharding) in tensors {
        if notation.rank() != sharding.len() {
            return Err(Error::RankMismatch {
                notation: notation.to_string(),
                notation_rank: notation.rank(),
                sharding_rank: sharding.len(),
            });
        }

        for (axis, mesh_dimension) in notation.iter().zip(sharding.iter().copied()) {
            let merged_dimension = match axis_to_dim_map.get(axis) {
                None => mesh_dimension,
                Some(current_dimension) => sharding_merge_for_axis(axis, mesh_dimension, current_dimension)?,
            };
            axis_to_dim_map.insert(axis, merged_dimension);

            if let MeshDimension::Sharded(dimension) = merged_dimension {
                let claimants = dim_to_axes_map.entry(dimension).or_default();
                if !claimants.contains(&axis) {
                    claimants.push(axis);
                }
            }
        }
    }

    // An axis is sharded along at most one mesh dimension and so it can only appear in one claimant list. Demoting
    // the losers of one collision can therefore never affect the resolution of another, and a single pass suffices.
    for (dimension, claimants) in dim_to_axes_map.iter().filter(|(_, claimants)| claimants.len() > 1) {
        let resolved = policy.resolve(*dimension, claimants.as_slice());
        let winner = if claimants.contains(&resolved) { resolved } else { claimants[0] };
        let demoted = claimants.iter().copied().filter(|axis| *axis != winner).collect::<Vec<_>>();
        tracing::debug!(
            mesh_dimension = *dimension,
            claimants = %claimants.iter().collect::<String>(),
            winner = %winner,
            demoted = %demoted.iter().collect::<String>(),
            "mesh dimension shards multiple tensor axes; keeping one and replicating the rest"
        );
        for axis in demoted {
            axis_to_dim_map.insert(axis, MeshDimension::Replicated);
        }
    }

    Ok(axis_to_dim_map)
}
