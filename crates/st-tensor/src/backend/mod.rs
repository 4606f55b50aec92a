// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! The numeric contract shared by every execution target.
//!
//! All operations write into a caller-supplied destination. Only `zeros`,
//! `from_host` and `duplicate` allocate. A backend holds no tensors of its own;
//! whoever receives a tensor from it owns that tensor until handing it to
//! [`MathBackend::release`] or dropping it.

pub mod cpu_dense;

#[cfg(feature = "wgpu")]
pub mod wgpu_dense;

#[cfg(feature = "wgpu")]
pub(crate) mod wgpu_util;

use core::fmt;

use crate::error::{PureResult, TensorError};
use crate::shape::Shape;

/// Anything a backend hands out as a tensor.
pub trait TensorHandle: fmt::Debug {
    fn shape(&self) -> &Shape;

    fn numel(&self) -> usize {
        self.shape().numel()
    }

    fn byte_len(&self) -> usize {
        self.shape().byte_len()
    }
}

/// In-place tensor math over one execution target.
///
/// Implementations must agree numerically: `1e-5` relative error between CPU
/// paths, `1e-3` between a device and the CPU reference.
pub trait MathBackend: Clone + fmt::Debug {
    type Tensor: TensorHandle;

    /// Short label used in diagnostics and op events.
    fn name(&self) -> &'static str;

    /// Whether tensors live in device memory.
    fn is_device(&self) -> bool;

    // -- allocation -------------------------------------------------------

    fn zeros(&self, shape: &Shape) -> PureResult<Self::Tensor>;

    fn from_host(&self, data: &[f32], shape: &Shape) -> PureResult<Self::Tensor>;

    /// Allocating clone.
    fn duplicate(&self, src: &Self::Tensor) -> PureResult<Self::Tensor>;

    /// Row-major copy of the tensor contents.
    fn to_host(&self, src: &Self::Tensor) -> PureResult<Vec<f32>>;

    /// Frees the tensor's storage. Device backends may report failures.
    fn release(&self, tensor: Self::Tensor) -> PureResult<()>;

    fn copy(&self, dst: &mut Self::Tensor, src: &Self::Tensor) -> PureResult<()>;

    fn fill(&self, dst: &mut Self::Tensor, value: f32) -> PureResult<()>;

    // -- linear algebra ---------------------------------------------------

    /// `dst = lhs · rhs`
    fn matmul(
        &self,
        dst: &mut Self::Tensor,
        lhs: &Self::Tensor,
        rhs: &Self::Tensor,
    ) -> PureResult<()>;

    /// `dst = lhsᵀ · rhs` without materialising the transpose.
    fn matmul_transpose_lhs(
        &self,
        dst: &mut Self::Tensor,
        lhs: &Self::Tensor,
        rhs: &Self::Tensor,
    ) -> PureResult<()>;

    /// `dst = lhs · rhsᵀ` without materialising the transpose.
    fn matmul_transpose_rhs(
        &self,
        dst: &mut Self::Tensor,
        lhs: &Self::Tensor,
        rhs: &Self::Tensor,
    ) -> PureResult<()>;

    fn add(
        &self,
        dst: &mut Self::Tensor,
        lhs: &Self::Tensor,
        rhs: &Self::Tensor,
    ) -> PureResult<()>;

    fn sub(
        &self,
        dst: &mut Self::Tensor,
        lhs: &Self::Tensor,
        rhs: &Self::Tensor,
    ) -> PureResult<()>;

    /// Elementwise (Hadamard) product.
    fn mul(
        &self,
        dst: &mut Self::Tensor,
        lhs: &Self::Tensor,
        rhs: &Self::Tensor,
    ) -> PureResult<()>;

    /// Adds the single row `row` to every row of `matrix`.
    fn add_row_broadcast(
        &self,
        dst: &mut Self::Tensor,
        matrix: &Self::Tensor,
        row: &Self::Tensor,
    ) -> PureResult<()>;

    /// `dst = src · scalar`
    fn scale(&self, dst: &mut Self::Tensor, src: &Self::Tensor, scalar: f32) -> PureResult<()>;

    /// `dst += src · scalar`
    fn add_scaled(
        &self,
        dst: &mut Self::Tensor,
        src: &Self::Tensor,
        scalar: f32,
    ) -> PureResult<()>;

    /// `dst -= src · scalar`
    fn sub_scaled(
        &self,
        dst: &mut Self::Tensor,
        src: &Self::Tensor,
        scalar: f32,
    ) -> PureResult<()>;

    fn transpose(&self, dst: &mut Self::Tensor, src: &Self::Tensor) -> PureResult<()>;

    // -- activations ------------------------------------------------------

    fn sigmoid(&self, dst: &mut Self::Tensor, src: &Self::Tensor) -> PureResult<()>;

    fn tanh(&self, dst: &mut Self::Tensor, src: &Self::Tensor) -> PureResult<()>;

    /// `y · (1 - y)` where `activated` already holds `y = sigmoid(x)`.
    fn sigmoid_derivative(
        &self,
        dst: &mut Self::Tensor,
        activated: &Self::Tensor,
    ) -> PureResult<()>;

    /// `1 - y²` where `activated` already holds `y = tanh(x)`.
    fn tanh_derivative(
        &self,
        dst: &mut Self::Tensor,
        activated: &Self::Tensor,
    ) -> PureResult<()>;

    /// Softmax over the last axis.
    fn softmax_rows(&self, dst: &mut Self::Tensor, src: &Self::Tensor) -> PureResult<()>;

    // -- sequence helpers -------------------------------------------------

    /// Copies row `row` of `batch` into `dst`.
    fn slice_row(
        &self,
        dst: &mut Self::Tensor,
        batch: &Self::Tensor,
        row: usize,
    ) -> PureResult<()>;

    /// Overwrites row `row` of `batch` with `src`.
    fn set_row(
        &self,
        batch: &mut Self::Tensor,
        row: usize,
        src: &Self::Tensor,
    ) -> PureResult<()>;

    /// Copies embedding row `index` of `table` into `dst`.
    fn embedding_lookup(
        &self,
        dst: &mut Self::Tensor,
        table: &Self::Tensor,
        index: usize,
    ) -> PureResult<()>;

    /// Adds `src` into row `index` of `table`; the rest of the table is untouched.
    fn accumulate_row(
        &self,
        table: &mut Self::Tensor,
        index: usize,
        src: &Self::Tensor,
    ) -> PureResult<()>;

    // -- training helpers -------------------------------------------------

    /// Clamps every element of `src` into `[min, max]`.
    fn clip(
        &self,
        dst: &mut Self::Tensor,
        src: &Self::Tensor,
        min: f32,
        max: f32,
    ) -> PureResult<()>;

    /// `dst = predictions - onehot(targets)`, one target index per row.
    fn softmax_cross_entropy_grad(
        &self,
        dst: &mut Self::Tensor,
        predictions: &Self::Tensor,
        targets: &[usize],
    ) -> PureResult<()>;
}

pub(crate) fn ensure_same(op: &'static str, left: &Shape, right: &Shape) -> PureResult<()> {
    if left.numel() != right.numel() || left.as_matrix() != right.as_matrix() {
        return Err(TensorError::shape_mismatch(op, left, right));
    }
    Ok(())
}

pub(crate) fn ensure_row_width(op: &'static str, row: &Shape, cols: usize) -> PureResult<()> {
    if row.numel() != cols {
        return Err(TensorError::shape_mismatch(op, row, &Shape::row(cols)));
    }
    Ok(())
}

pub(crate) fn ensure_row_index(op: &'static str, index: usize, rows: usize) -> PureResult<()> {
    if index >= rows {
        return Err(TensorError::IndexOutOfRange {
            op,
            index,
            bound: rows,
        });
    }
    Ok(())
}

/// Matrix product geometry `(m, k, n)` after optional transposition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct GemmDims {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub transpose_lhs: bool,
    pub transpose_rhs: bool,
}

pub(crate) fn gemm_dims(
    op: &'static str,
    dst: &Shape,
    lhs: &Shape,
    rhs: &Shape,
    transpose_lhs: bool,
    transpose_rhs: bool,
) -> PureResult<GemmDims> {
    let (lr, lc) = lhs.as_matrix();
    let (rr, rc) = rhs.as_matrix();
    let (m, k) = if transpose_lhs { (lc, lr) } else { (lr, lc) };
    let (k2, n) = if transpose_rhs { (rc, rr) } else { (rr, rc) };
    if k != k2 {
        return Err(TensorError::shape_mismatch(op, lhs, rhs));
    }
    if dst.as_matrix() != (m, n) {
        return Err(TensorError::shape_mismatch(op, dst, &Shape::matrix(m, n)));
    }
    Ok(GemmDims {
        m,
        k,
        n,
        transpose_lhs,
        transpose_rhs,
    })
}

pub(crate) fn ensure_host_len(data: &[f32], shape: &Shape) -> PureResult<()> {
    if data.len() != shape.numel() {
        return Err(TensorError::DataLength {
            expected: shape.numel(),
            got: data.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemm_dims_follow_transpose_flags() {
        let dims = gemm_dims(
            "t",
            &Shape::matrix(4, 3),
            &Shape::matrix(2, 4),
            &Shape::matrix(2, 3),
            true,
            false,
        )
        .unwrap();
        assert_eq!((dims.m, dims.k, dims.n), (4, 2, 3));

        let err = gemm_dims(
            "t",
            &Shape::matrix(1, 1),
            &Shape::matrix(1, 2),
            &Shape::matrix(3, 1),
            false,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { op: "t", .. }));
    }

    #[test]
    fn row_helpers_reject_bad_geometry() {
        assert!(ensure_row_index("r", 3, 3).is_err());
        assert!(ensure_row_index("r", 2, 3).is_ok());
        assert!(ensure_row_width("w", &Shape::row(4), 5).is_err());
    }
}
