// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Per-step targets and the `[len, width]` sequence tensor built from them.

use st_tensor::{MathBackend, PureResult, Shape, TensorError, TensorHandle};

/// Supervision for one sequence.
#[derive(Debug)]
pub enum Targets<'a, T> {
    /// One class index per step.
    Indices(&'a [usize]),
    /// A `[len, output]` tensor holding one target distribution per step.
    Distribution(&'a T),
}

impl<T> Clone for Targets<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Targets<'_, T> {}

impl<T: TensorHandle> Targets<'_, T> {
    /// Number of supervised steps.
    pub fn len(&self) -> usize {
        match self {
            Targets::Indices(indices) => indices.len(),
            Targets::Distribution(tensor) => tensor.shape().rows(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stacks per-step row tensors into one `[len, width]` tensor.
///
/// An empty list yields a `[0, 0]` tensor. Every row must hold the same
/// number of elements.
pub fn sequence_tensor<B: MathBackend>(backend: &B, rows: &[B::Tensor]) -> PureResult<B::Tensor> {
    let Some(first) = rows.first() else {
        return backend.zeros(&Shape::matrix(0, 0));
    };
    let width = first.numel();
    let mut batch = backend.zeros(&Shape::matrix(rows.len(), width))?;
    for (index, row) in rows.iter().enumerate() {
        if row.numel() != width {
            let mismatch = TensorError::shape_mismatch("sequence_tensor", row.shape(), first.shape());
            if let Err(err) = backend.release(batch) {
                tracing::warn!(error = %err, "failed to release partial sequence tensor");
            }
            return Err(mismatch);
        }
        backend.set_row(&mut batch, index, row)?;
    }
    Ok(batch)
}

/// A `[1, width]` one-hot row.
pub fn one_hot<B: MathBackend>(backend: &B, index: usize, width: usize) -> PureResult<B::Tensor> {
    if index >= width {
        return Err(TensorError::IndexOutOfRange {
            op: "one_hot",
            index,
            bound: width,
        });
    }
    let mut data = vec![0.0; width];
    data[index] = 1.0;
    backend.from_host(&data, &Shape::row(width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use st_tensor::CpuBackend;

    #[test]
    fn empty_list_gives_empty_matrix() {
        let cpu = CpuBackend::new();
        let tensor = sequence_tensor(&cpu, &[]).unwrap();
        assert_eq!(tensor.shape(), &Shape::matrix(0, 0));
    }

    #[test]
    fn rows_are_stacked_in_order() {
        let cpu = CpuBackend::new();
        let rows = vec![one_hot(&cpu, 2, 3).unwrap(), one_hot(&cpu, 0, 3).unwrap()];
        let tensor = sequence_tensor(&cpu, &rows).unwrap();
        assert_eq!(tensor.shape(), &Shape::matrix(2, 3));
        assert_eq!(tensor.data(), &[0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
        assert_eq!(Targets::Distribution(&tensor).len(), 2);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let cpu = CpuBackend::new();
        let rows = vec![one_hot(&cpu, 0, 3).unwrap(), one_hot(&cpu, 0, 4).unwrap()];
        assert!(matches!(
            sequence_tensor(&cpu, &rows),
            Err(TensorError::ShapeMismatch { .. })
        ));
        assert!(one_hot(&cpu, 3, 3).is_err());
    }
}
