// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use core::fmt;

/// Ordered tensor dimensions.
///
/// Operations treat a shape as a matrix: the last axis is the column axis and
/// every leading axis is folded into rows. A scalar shape (`[]`) is `1 x 1`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    /// Two-dimensional `rows x cols` shape.
    pub fn matrix(rows: usize, cols: usize) -> Self {
        Self(vec![rows, cols])
    }

    /// A single row of `cols` values, i.e. `[1, cols]`.
    pub fn row(cols: usize) -> Self {
        Self::matrix(1, cols)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of scalar elements.
    pub fn numel(&self) -> usize {
        self.0.iter().product()
    }

    /// Size in bytes of an `f32` buffer holding this shape.
    pub fn byte_len(&self) -> usize {
        self.numel() * std::mem::size_of::<f32>()
    }

    /// Extent of the last axis (`1` for scalars).
    pub fn cols(&self) -> usize {
        self.0.last().copied().unwrap_or(1)
    }

    /// Product of every axis but the last.
    pub fn rows(&self) -> usize {
        match self.0.split_last() {
            Some((_, leading)) => leading.iter().product(),
            None => 1,
        }
    }

    /// `(rows, cols)` view used by the matrix kernels.
    pub fn as_matrix(&self) -> (usize, usize) {
        (self.rows(), self.cols())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, dim) in self.0.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{dim}")?;
        }
        f.write_str("]")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Self(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Self(dims.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Self(dims.to_vec())
    }
}

impl From<(usize, usize)> for Shape {
    fn from((rows, cols): (usize, usize)) -> Self {
        Self::matrix(rows, cols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_view_folds_leading_axes() {
        let shape = Shape::new([2, 3, 4]);
        assert_eq!(shape.as_matrix(), (6, 4));
        assert_eq!(shape.numel(), 24);
        assert_eq!(shape.byte_len(), 96);
    }

    #[test]
    fn degenerate_shapes() {
        assert_eq!(Shape::new([]).as_matrix(), (1, 1));
        assert_eq!(Shape::matrix(0, 0).numel(), 0);
        assert_eq!(Shape::matrix(0, 0).as_matrix(), (0, 0));
        assert_eq!(Shape::new([5]).as_matrix(), (1, 5));
    }

    #[test]
    fn display_lists_dims() {
        assert_eq!(Shape::matrix(3, 7).to_string(), "[3, 7]");
    }
}
