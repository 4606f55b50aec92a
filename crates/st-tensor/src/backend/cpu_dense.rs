// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Reference backend over host memory.

use rayon::prelude::*;

use super::{
    ensure_host_len, ensure_row_index, ensure_row_width, ensure_same, gemm_dims, GemmDims,
    MathBackend, TensorHandle,
};
use crate::error::{PureResult, TensorError};
use crate::observability::emit_tensor_op;
use crate::shape::Shape;

const BACKEND: &str = "cpu";

/// Matmul volumes (`m·k·n`) at or above this run row-parallel on rayon.
const DEFAULT_PARALLEL_VOLUME: usize = 1 << 16;

/// Host-resident tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct CpuTensor {
    shape: Shape,
    data: Vec<f32>,
}

impl CpuTensor {
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

impl TensorHandle for CpuTensor {
    fn shape(&self) -> &Shape {
        &self.shape
    }
}

/// CPU reference implementation of [`MathBackend`].
#[derive(Clone, Debug)]
pub struct CpuBackend {
    parallel_volume: usize,
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuBackend {
    pub fn new() -> Self {
        let parallel_volume = if spiral_config::determinism::lock_reduction_order() {
            usize::MAX
        } else {
            DEFAULT_PARALLEL_VOLUME
        };
        Self { parallel_volume }
    }

    /// Backend whose matmul never leaves the calling thread.
    pub fn serial() -> Self {
        Self {
            parallel_volume: usize::MAX,
        }
    }

    /// Overrides the `m·k·n` volume from which matmul runs row-parallel.
    pub fn with_parallel_volume(mut self, volume: usize) -> Self {
        self.parallel_volume = volume.max(1);
        self
    }

    pub fn parallel_volume(&self) -> usize {
        self.parallel_volume
    }

    fn gemm(
        &self,
        op: &'static str,
        dst: &mut CpuTensor,
        lhs: &CpuTensor,
        rhs: &CpuTensor,
        transpose_lhs: bool,
        transpose_rhs: bool,
    ) -> PureResult<()> {
        let dims = gemm_dims(
            op,
            &dst.shape,
            &lhs.shape,
            &rhs.shape,
            transpose_lhs,
            transpose_rhs,
        )?;
        if dims.m == 0 || dims.n == 0 {
            emit_tensor_op(BACKEND, op, &dst.shape);
            return Ok(());
        }
        let parallel = dims.m > 1 && dims.m * dims.k * dims.n >= self.parallel_volume;
        let (lhs, rhs) = (lhs.data(), rhs.data());
        if parallel {
            dst.data
                .par_chunks_mut(dims.n)
                .enumerate()
                .for_each(|(row, out)| gemm_row(out, row, lhs, rhs, &dims));
        } else {
            dst.data
                .chunks_mut(dims.n)
                .enumerate()
                .for_each(|(row, out)| gemm_row(out, row, lhs, rhs, &dims));
        }
        emit_tensor_op(BACKEND, op, &dst.shape);
        Ok(())
    }

    fn unary(
        &self,
        op: &'static str,
        dst: &mut CpuTensor,
        src: &CpuTensor,
        f: impl Fn(f32) -> f32,
    ) -> PureResult<()> {
        ensure_same(op, &dst.shape, &src.shape)?;
        for (out, value) in dst.data.iter_mut().zip(src.data.iter()) {
            *out = f(*value);
        }
        emit_tensor_op(BACKEND, op, &dst.shape);
        Ok(())
    }

    fn binary(
        &self,
        op: &'static str,
        dst: &mut CpuTensor,
        lhs: &CpuTensor,
        rhs: &CpuTensor,
        f: impl Fn(f32, f32) -> f32,
    ) -> PureResult<()> {
        ensure_same(op, &lhs.shape, &rhs.shape)?;
        ensure_same(op, &dst.shape, &lhs.shape)?;
        for ((out, a), b) in dst.data.iter_mut().zip(lhs.data.iter()).zip(rhs.data.iter()) {
            *out = f(*a, *b);
        }
        emit_tensor_op(BACKEND, op, &dst.shape);
        Ok(())
    }

    fn accumulate(
        &self,
        op: &'static str,
        dst: &mut CpuTensor,
        src: &CpuTensor,
        scalar: f32,
    ) -> PureResult<()> {
        ensure_same(op, &dst.shape, &src.shape)?;
        for (out, value) in dst.data.iter_mut().zip(src.data.iter()) {
            *out += scalar * value;
        }
        emit_tensor_op(BACKEND, op, &dst.shape);
        Ok(())
    }
}

#[inline]
fn gemm_row(out: &mut [f32], row: usize, lhs: &[f32], rhs: &[f32], dims: &GemmDims) {
    let GemmDims {
        m,
        k,
        n,
        transpose_lhs,
        transpose_rhs,
    } = *dims;
    out.fill(0.0);
    for p in 0..k {
        let a = if transpose_lhs {
            lhs[p * m + row]
        } else {
            lhs[row * k + p]
        };
        if a == 0.0 {
            continue;
        }
        if transpose_rhs {
            for (col, slot) in out.iter_mut().enumerate() {
                *slot += a * rhs[col * k + p];
            }
        } else {
            let rhs_row = &rhs[p * n..(p + 1) * n];
            for (slot, b) in out.iter_mut().zip(rhs_row.iter()) {
                *slot += a * b;
            }
        }
    }
}

#[inline]
fn sigmoid(value: f32) -> f32 {
    if value >= 0.0 {
        1.0 / (1.0 + (-value).exp())
    } else {
        let e = value.exp();
        e / (1.0 + e)
    }
}

impl MathBackend for CpuBackend {
    type Tensor = CpuTensor;

    fn name(&self) -> &'static str {
        BACKEND
    }

    fn is_device(&self) -> bool {
        false
    }

    fn zeros(&self, shape: &Shape) -> PureResult<CpuTensor> {
        Ok(CpuTensor {
            shape: shape.clone(),
            data: vec![0.0; shape.numel()],
        })
    }

    fn from_host(&self, data: &[f32], shape: &Shape) -> PureResult<CpuTensor> {
        ensure_host_len(data, shape)?;
        Ok(CpuTensor {
            shape: shape.clone(),
            data: data.to_vec(),
        })
    }

    fn duplicate(&self, src: &CpuTensor) -> PureResult<CpuTensor> {
        Ok(src.clone())
    }

    fn to_host(&self, src: &CpuTensor) -> PureResult<Vec<f32>> {
        Ok(src.data.clone())
    }

    fn release(&self, tensor: CpuTensor) -> PureResult<()> {
        drop(tensor);
        Ok(())
    }

    fn copy(&self, dst: &mut CpuTensor, src: &CpuTensor) -> PureResult<()> {
        ensure_same("copy", &dst.shape, &src.shape)?;
        dst.data.copy_from_slice(&src.data);
        emit_tensor_op(BACKEND, "copy", &dst.shape);
        Ok(())
    }

    fn fill(&self, dst: &mut CpuTensor, value: f32) -> PureResult<()> {
        dst.data.fill(value);
        emit_tensor_op(BACKEND, "fill", &dst.shape);
        Ok(())
    }

    fn matmul(&self, dst: &mut CpuTensor, lhs: &CpuTensor, rhs: &CpuTensor) -> PureResult<()> {
        self.gemm("matmul", dst, lhs, rhs, false, false)
    }

    fn matmul_transpose_lhs(
        &self,
        dst: &mut CpuTensor,
        lhs: &CpuTensor,
        rhs: &CpuTensor,
    ) -> PureResult<()> {
        self.gemm("matmul_transpose_lhs", dst, lhs, rhs, true, false)
    }

    fn matmul_transpose_rhs(
        &self,
        dst: &mut CpuTensor,
        lhs: &CpuTensor,
        rhs: &CpuTensor,
    ) -> PureResult<()> {
        self.gemm("matmul_transpose_rhs", dst, lhs, rhs, false, true)
    }

    fn add(&self, dst: &mut CpuTensor, lhs: &CpuTensor, rhs: &CpuTensor) -> PureResult<()> {
        self.binary("add", dst, lhs, rhs, |a, b| a + b)
    }

    fn sub(&self, dst: &mut CpuTensor, lhs: &CpuTensor, rhs: &CpuTensor) -> PureResult<()> {
        self.binary("sub", dst, lhs, rhs, |a, b| a - b)
    }

    fn mul(&self, dst: &mut CpuTensor, lhs: &CpuTensor, rhs: &CpuTensor) -> PureResult<()> {
        self.binary("mul", dst, lhs, rhs, |a, b| a * b)
    }

    fn add_row_broadcast(
        &self,
        dst: &mut CpuTensor,
        matrix: &CpuTensor,
        row: &CpuTensor,
    ) -> PureResult<()> {
        ensure_same("add_row_broadcast", &dst.shape, &matrix.shape)?;
        let cols = matrix.shape.cols();
        ensure_row_width("add_row_broadcast", &row.shape, cols)?;
        if cols > 0 {
            for (out, src) in dst
                .data
                .chunks_mut(cols)
                .zip(matrix.data.chunks(cols))
            {
                for ((slot, value), bias) in out.iter_mut().zip(src.iter()).zip(row.data.iter()) {
                    *slot = value + bias;
                }
            }
        }
        emit_tensor_op(BACKEND, "add_row_broadcast", &dst.shape);
        Ok(())
    }

    fn scale(&self, dst: &mut CpuTensor, src: &CpuTensor, scalar: f32) -> PureResult<()> {
        self.unary("scale", dst, src, |v| v * scalar)
    }

    fn add_scaled(&self, dst: &mut CpuTensor, src: &CpuTensor, scalar: f32) -> PureResult<()> {
        self.accumulate("add_scaled", dst, src, scalar)
    }

    fn sub_scaled(&self, dst: &mut CpuTensor, src: &CpuTensor, scalar: f32) -> PureResult<()> {
        self.accumulate("sub_scaled", dst, src, -scalar)
    }

    fn transpose(&self, dst: &mut CpuTensor, src: &CpuTensor) -> PureResult<()> {
        let (rows, cols) = src.shape.as_matrix();
        if dst.shape.as_matrix() != (cols, rows) {
            return Err(TensorError::shape_mismatch(
                "transpose",
                &dst.shape,
                &Shape::matrix(cols, rows),
            ));
        }
        for r in 0..rows {
            for c in 0..cols {
                dst.data[c * rows + r] = src.data[r * cols + c];
            }
        }
        emit_tensor_op(BACKEND, "transpose", &dst.shape);
        Ok(())
    }

    fn sigmoid(&self, dst: &mut CpuTensor, src: &CpuTensor) -> PureResult<()> {
        self.unary("sigmoid", dst, src, sigmoid)
    }

    fn tanh(&self, dst: &mut CpuTensor, src: &CpuTensor) -> PureResult<()> {
        self.unary("tanh", dst, src, f32::tanh)
    }

    fn sigmoid_derivative(&self, dst: &mut CpuTensor, activated: &CpuTensor) -> PureResult<()> {
        self.unary("sigmoid_derivative", dst, activated, |y| y * (1.0 - y))
    }

    fn tanh_derivative(&self, dst: &mut CpuTensor, activated: &CpuTensor) -> PureResult<()> {
        self.unary("tanh_derivative", dst, activated, |y| 1.0 - y * y)
    }

    fn softmax_rows(&self, dst: &mut CpuTensor, src: &CpuTensor) -> PureResult<()> {
        ensure_same("softmax_rows", &dst.shape, &src.shape)?;
        let cols = src.shape.cols();
        if cols > 0 {
            for (out, row) in dst.data.chunks_mut(cols).zip(src.data.chunks(cols)) {
                let peak = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let mut total = 0.0f32;
                for (slot, value) in out.iter_mut().zip(row.iter()) {
                    *slot = (value - peak).exp();
                    total += *slot;
                }
                for slot in out.iter_mut() {
                    *slot /= total;
                }
            }
        }
        emit_tensor_op(BACKEND, "softmax_rows", &dst.shape);
        Ok(())
    }

    fn slice_row(&self, dst: &mut CpuTensor, batch: &CpuTensor, row: usize) -> PureResult<()> {
        let (rows, cols) = batch.shape.as_matrix();
        ensure_row_index("slice_row", row, rows)?;
        ensure_row_width("slice_row", &dst.shape, cols)?;
        dst.data_mut()
            .copy_from_slice(&batch.data[row * cols..(row + 1) * cols]);
        emit_tensor_op(BACKEND, "slice_row", &dst.shape);
        Ok(())
    }

    fn set_row(&self, batch: &mut CpuTensor, row: usize, src: &CpuTensor) -> PureResult<()> {
        let (rows, cols) = batch.shape.as_matrix();
        ensure_row_index("set_row", row, rows)?;
        ensure_row_width("set_row", &src.shape, cols)?;
        batch.data[row * cols..(row + 1) * cols].copy_from_slice(&src.data);
        emit_tensor_op(BACKEND, "set_row", &batch.shape);
        Ok(())
    }

    fn embedding_lookup(
        &self,
        dst: &mut CpuTensor,
        table: &CpuTensor,
        index: usize,
    ) -> PureResult<()> {
        let (rows, cols) = table.shape.as_matrix();
        ensure_row_index("embedding_lookup", index, rows)?;
        ensure_row_width("embedding_lookup", &dst.shape, cols)?;
        dst.data_mut()
            .copy_from_slice(&table.data[index * cols..(index + 1) * cols]);
        emit_tensor_op(BACKEND, "embedding_lookup", &dst.shape);
        Ok(())
    }

    fn accumulate_row(
        &self,
        table: &mut CpuTensor,
        index: usize,
        src: &CpuTensor,
    ) -> PureResult<()> {
        let (rows, cols) = table.shape.as_matrix();
        ensure_row_index("accumulate_row", index, rows)?;
        ensure_row_width("accumulate_row", &src.shape, cols)?;
        for (slot, value) in table.data[index * cols..(index + 1) * cols]
            .iter_mut()
            .zip(src.data.iter())
        {
            *slot += value;
        }
        emit_tensor_op(BACKEND, "accumulate_row", &table.shape);
        Ok(())
    }

    fn clip(&self, dst: &mut CpuTensor, src: &CpuTensor, min: f32, max: f32) -> PureResult<()> {
        if min > max {
            return Err(TensorError::InvalidValue {
                label: "clip range is inverted",
            });
        }
        self.unary("clip", dst, src, |v| v.clamp(min, max))
    }

    fn softmax_cross_entropy_grad(
        &self,
        dst: &mut CpuTensor,
        predictions: &CpuTensor,
        targets: &[usize],
    ) -> PureResult<()> {
        ensure_same("softmax_cross_entropy_grad", &dst.shape, &predictions.shape)?;
        let (rows, cols) = predictions.shape.as_matrix();
        if targets.len() != rows {
            return Err(TensorError::DataLength {
                expected: rows,
                got: targets.len(),
            });
        }
        for &target in targets {
            ensure_row_index("softmax_cross_entropy_grad", target, cols)?;
        }
        dst.data.copy_from_slice(&predictions.data);
        for (row, &target) in targets.iter().enumerate() {
            dst.data[row * cols + target] -= 1.0;
        }
        emit_tensor_op(BACKEND, "softmax_cross_entropy_grad", &dst.shape);
        Ok(())
    }
}
