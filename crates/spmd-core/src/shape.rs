//! Tensor shapes as seen by the sharding rules.

use std::fmt::Display;

use thiserror::Error;

/// Size of a single tensor dimension.
///
/// Rules run before the program does, so a size is either known up front ([`Size::Static`]) or only at runtime
/// ([`Size::Dynamic`], possibly with an exclusive upper bound). Static sizes render as plain numbers, bounded dynamic
/// sizes as `<` followed by the bound, and unbounded dynamic sizes as `*`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Size {
    Static(usize),
    Dynamic(Option<usize>),
}

impl Size {
    #[inline]
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic(_))
    }

    /// Size of a dimension that `self` and `other` both broadcast to, or `None` if they are incompatible.
    fn broadcast_with(self, other: Self) -> Option<Self> {
        match (self, other) {
            (size, Self::Static(1)) | (Self::Static(1), size) => Some(size),
            (lhs, rhs) if lhs == rhs => Some(lhs),
            _ => None,
        }
    }
}

impl Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(size) => write!(f, "{size}"),
            Self::Dynamic(Some(upper_bound)) => write!(f, "<{upper_bound}"),
            Self::Dynamic(None) => write!(f, "*"),
        }
    }
}

/// Ordered [`Size`]s of the dimensions of a tensor, outermost first.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Shape {
    pub dimensions: Vec<Size>,
}

impl Shape {
    #[inline]
    pub fn new(dimensions: Vec<Size>) -> Self {
        Self { dimensions }
    }

    /// Shape of a rank 0 tensor.
    #[inline]
    pub fn scalar() -> Self {
        Self::new(Vec::new())
    }

    /// Constructs a fully static [`Shape`].
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use spmd_core::shape::{Shape, Size};
    /// assert_eq!(Shape::of(&[4, 8]), Shape::new(vec![Size::Static(4), Size::Static(8)]));
    /// ```
    #[inline]
    pub fn of(sizes: &[usize]) -> Self {
        Self::new(sizes.iter().copied().map(Size::Static).collect())
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.dimensions.len()
    }

    /// Per-dimension flags that are `true` for [`Size::Dynamic`] dimensions.
    pub fn dynamic_dims(&self) -> Vec<bool> {
        self.dimensions.iter().map(Size::is_dynamic).collect()
    }

    /// Broadcasts `shapes` against each other using NumPy semantics: shapes are aligned on their trailing dimensions,
    /// missing leading dimensions count as size `1`, and size `1` stretches to match the other size.
    ///
    /// # Examples
    ///
    /// ```rust
    /// # use spmd_core::shape::{Shape, Size};
    /// let x = Shape::of(&[8, 1, 6]);
    /// let y = Shape::new(vec![Size::Dynamic(None), Size::Static(1)]);
    /// assert_eq!(Shape::broadcast(&[&x, &y]), Ok(Shape::new(vec![8.into(), Size::Dynamic(None), 6.into()])));
    /// assert!(Shape::broadcast(&[&x, &Shape::of(&[5])]).is_err());
    /// ```
    pub fn broadcast(shapes: &[&Self]) -> Result<Self, ShapeBroadcastingError> {
        let (first, rest) = shapes.split_first().ok_or(ShapeBroadcastingError::Empty)?;
        let mut broadcast = (*first).clone();
        for shape in rest {
            let rank = broadcast.rank().max(shape.rank());
            let padded = |padded_shape: &Shape, index: usize| {
                let padding = rank - padded_shape.rank();
                if index < padding { Size::Static(1) } else { padded_shape.dimensions[index - padding] }
            };
            let dimensions = (0..rank)
                .map(|index| padded(&broadcast, index).broadcast_with(padded(*shape, index)))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| ShapeBroadcastingError::Incompatible { lhs: broadcast.clone(), rhs: (*shape).clone() })?;
            broadcast = Shape::new(dimensions);
        }
        Ok(broadcast)
    }
}

impl From<usize> for Size {
    fn from(value: usize) -> Self {
        Self::Static(value)
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let dimensions = self.dimensions.iter().map(ToString::to_string).collect::<Vec<_>>();
        write!(f, "[{}]", dimensions.join(", "))
    }
}

/// Error returned when a collection of [`Shape`]s cannot be broadcast together.
#[derive(Error, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ShapeBroadcastingError {
    #[error("cannot construct a broadcast shape from an empty collection of shapes")]
    Empty,

    #[error("cannot broadcast shape `{lhs}` with shape `{rhs}`")]
    Incompatible { lhs: Shape, rhs: Shape },
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_size_display() {
        assert_eq!(Size::Static(4).to_string(), "4");
        assert_eq!(Size::Dynamic(Some(10)).to_string(), "<10");
        assert_eq!(Size::Dynamic(None).to_string(), "*");
        assert_eq!(Shape::new(vec![Size::Dynamic(None), Size::Static(42)]).to_string(), "[*, 42]");
    }

    #[test]
    fn test_shape_dynamic_dims() {
        let shape = Shape::new(vec![Size::Static(2), Size::Dynamic(None), Size::Dynamic(Some(8))]);
        assert_eq!(shape.rank(), 3);
        assert_eq!(shape.dynamic_dims(), vec![false, true, true]);
        assert!(Shape::scalar().dynamic_dims().is_empty());
    }

    #[test]
    fn test_shape_broadcast() {
        let x = Shape::of(&[8, 1, 6]);
        let y = Shape::of(&[7, 1]);
        assert_eq!(Shape::broadcast(&[&x, &y]), Ok(Shape::of(&[8, 7, 6])));
        assert_eq!(Shape::broadcast(&[&y, &x]), Ok(Shape::of(&[8, 7, 6])));
        assert_eq!(Shape::broadcast(&[&Shape::scalar()]), Ok(Shape::scalar()));
        assert_eq!(Shape::broadcast(&[&Shape::scalar(), &y]), Ok(y.clone()));
        let dynamic = Shape::new(vec![Size::Dynamic(Some(10))]);
        assert_eq!(
            Shape::broadcast(&[&Shape::of(&[4, 1]), &dynamic]),
            Ok(Shape::new(vec![4.into(), Size::Dynamic(Some(10))])),
        );
        assert!(Shape::broadcast(&[&Shape::of(&[10]), &dynamic]).is_err());
        assert_eq!(Shape::broadcast(&[]), Err(ShapeBroadcastingError::Empty));
        assert_eq!(
            Shape::broadcast(&[&Shape::of(&[3]), &Shape::of(&[4])]),
            Err(ShapeBroadcastingError::Incompatible { lhs: Shape::of(&[3]), rhs: Shape::of(&[4]) }),
        );
    }
}
