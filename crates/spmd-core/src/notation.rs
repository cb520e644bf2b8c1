//! Einsum-style axis notation used by the sharding rules.
//!
//! Every tensor that participates in an operator is described by an [`AxisNotation`], which assigns a single
//! character label to each of its dimensions, and by a [`ShardingVector`], which assigns a [`MeshDimension`] to
//! each of those labels. Equal labels across tensors denote the *same* logical axis. For example, a matrix
//! multiplication `x @ y` is described by the notations `"mk"`, `"kn"`, and `"mn"`, where `k` is the contracted
//! axis.
//!
//! The sharding merge (see [`crate::merge`]) folds the sharding vectors of all participating tensors into an
//! [`AxisToMeshDimMap`] that resolves each label to a single mesh dimension.

use std::{
    collections::{BTreeMap, btree_map},
    fmt::Display,
    str::FromStr,
};

use crate::errors::Error;

/// Sharding of a single tensor dimension: either replicated across the mesh or partitioned along one mesh dimension.
///
/// The surrounding system encodes mesh dimensions as integers where `-1` means replicated. The [`TryFrom<i64>`] and
/// [`From<MeshDimension>`] implementations convert between the two representations and the [`Display`]
/// implementation renders that integer encoding.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum MeshDimension {
    /// The tensor dimension is not partitioned.
    #[default]
    Replicated,

    /// The tensor dimension is partitioned along the mesh dimension with the provided index.
    Sharded(usize),
}

impl MeshDimension {
    /// Returns `true` if this is [`MeshDimension::Replicated`].
    #[inline]
    pub fn is_replicated(&self) -> bool {
        matches!(self, Self::Replicated)
    }

    /// Returns `true` if this is a [`MeshDimension::Sharded`] dimension.
    #[inline]
    pub fn is_sharded(&self) -> bool {
        !self.is_replicated()
    }

    /// Returns the mesh dimension index for sharded dimensions and `None` for replicated ones.
    #[inline]
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::Replicated => None,
            Self::Sharded(dimension) => Some(*dimension),
        }
    }
}

impl TryFrom<i64> for MeshDimension {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Replicated),
            value if value >= 0 => Ok(Self::Sharded(value as usize)),
            value => Err(Error::InvalidMeshDimension { value }),
        }
    }
}

impl From<MeshDimension> for i64 {
    fn from(value: MeshDimension) -> Self {
        match value {
            MeshDimension::Replicated => -1,
            MeshDimension::Sharded(dimension) => dimension as i64,
        }
    }
}

impl Display for MeshDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", i64::from(*self))
    }
}

/// Per-dimension sharding of a tensor, aligned with the tensor's [`AxisNotation`].
pub type ShardingVector = Vec<MeshDimension>;

/// Converts a sharding vector from the integer encoding (`-1` for replicated dimensions).
///
/// # Examples
///
/// ```rust
/// # use spmd_core::notation::{MeshDimension, sharding_vector};
/// assert_eq!(sharding_vector(&[0, -1]).unwrap(), vec![MeshDimension::Sharded(0), MeshDimension::Replicated]);
/// assert!(sharding_vector(&[-2]).is_err());
/// ```
pub fn sharding_vector(dims_mapping: &[i64]) -> Result<ShardingVector, Error> {
    dims_mapping.iter().map(|dimension| MeshDimension::try_from(*dimension)).collect()
}

/// Renders a sharding vector using the integer encoding (e.g., `[0, -1]`).
pub fn format_sharding_vector(sharding: &[MeshDimension]) -> String {
    format!("[{}]", sharding.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))
}

/// Ordered sequence of single-character axis labels, one per tensor dimension.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct AxisNotation {
    labels: Vec<char>,
}

impl AxisNotation {
    /// Creates an axis notation from a string with one ASCII letter per tensor dimension.
    pub fn new<S: AsRef<str>>(notation: S) -> Result<Self, Error> {
        let notation = notation.as_ref();
        let labels = notation.chars().collect::<Vec<_>>();
        if let Some(label) = labels.iter().find(|label| !label.is_ascii_alphabetic()) {
            return Err(Error::InvalidAxisLabel { notation: notation.to_string(), label: *label });
        }
        Ok(Self { labels })
    }

    /// Creates an axis notation from the provided labels.
    pub fn from_labels<I: IntoIterator<Item = char>>(labels: I) -> Result<Self, Error> {
        Self::new(labels.into_iter().collect::<String>())
    }

    /// Returns the labels of this notation.
    #[inline]
    pub fn labels(&self) -> &[char] {
        self.labels.as_slice()
    }

    /// Returns the number of tensor dimensions described by this notation.
    #[inline]
    pub fn rank(&self) -> usize {
        self.labels.len()
    }

    /// Returns `true` if `label` labels any dimension of this notation.
    #[inline]
    pub fn contains(&self, label: char) -> bool {
        self.labels.contains(&label)
    }

    /// Returns the position of the first dimension labeled `label`, if any.
    #[inline]
    pub fn position(&self, label: char) -> Option<usize> {
        self.labels.iter().position(|candidate| *candidate == label)
    }

    /// Returns an iterator over the labels of this notation.
    pub fn iter(&self) -> impl Iterator<Item = char> + '_ {
        self.labels.iter().copied()
    }
}

impl FromStr for AxisNotation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Display for AxisNotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.labels.iter().collect::<String>())
    }
}

/// Resolved mesh dimension for every axis label that appears in a set of [`AxisNotation`]s.
///
/// Entries are kept ordered by label which makes every iteration over this map (and every result derived from it)
/// deterministic.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct AxisToMeshDimMap {
    entries: BTreeMap<char, MeshDimension>,
}

impl AxisToMeshDimMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mesh dimension resolved for `axis`, if present.
    #[inline]
    pub fn get(&self, axis: char) -> Option<MeshDimension> {
        self.entries.get(&axis).copied()
    }

    /// Sets the mesh dimension of `axis`, returning the previous value, if any.
    #[inline]
    pub fn insert(&mut self, axis: char, dimension: MeshDimension) -> Option<MeshDimension> {
        self.entries.insert(axis, dimension)
    }

    /// Returns `true` if `axis` has been resolved.
    #[inline]
    pub fn contains(&self, axis: char) -> bool {
        self.entries.contains_key(&axis)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns an iterator over `(label, mesh dimension)` pairs in ascending label order.
    pub fn iter(&self) -> impl Iterator<Item = (char, MeshDimension)> + '_ {
        self.entries.iter().map(|(axis, dimension)| (*axis, *dimension))
    }

    /// Builds the sharding vector of a tensor with the provided notation from this map. Labels that
    /// were never resolved are replicated.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use spmd_core::notation::{AxisNotation, AxisToMeshDimMap, MeshDimension};
    /// let map = AxisToMeshDimMap::from_iter([('i', MeshDimension::Sharded(0)), ('k', MeshDimension::Sharded(1))]);
    /// let notation = AxisNotation::new("ij").unwrap();
    /// assert_eq!(map.dims_mapping_for(&notation), vec![MeshDimension::Sharded(0), MeshDimension::Replicated]);
    /// ```
    pub fn dims_mapping_for(&self, notation: &AxisNotation) -> ShardingVector {
        notation.iter().map(|axis| self.get(axis).unwrap_or_default()).collect()
    }
}

impl FromIterator<(char, MeshDimension)> for AxisToMeshDimMap {
    fn from_iter<T: IntoIterator<Item = (char, MeshDimension)>>(iter: T) -> Self {
        Self { entries: iter.into_iter().collect() }
    }
}

impl IntoIterator for AxisToMeshDimMap {
    type Item = (char, MeshDimension);
    type IntoIter = btree_map::IntoIter<char, MeshDimension>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl Display for AxisToMeshDimMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.iter().map(|(axis, dimension)| format!("{axis}: {dimension}")).collect::<Vec<_>>();
        write!(f, "{{{}}}", entries.join(", "))
    }
}
