// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use crate::shape::Shape;

/// Result alias used throughout the tensor crate.
pub type PureResult<T> = Result<T, TensorError>;

/// Errors emitted by backends and the tensor pool.
///
/// Shape and index errors signal a caller bug. Nothing in the workspace
/// retries or recovers from them; they travel up unchanged.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TensorError {
    /// An operator was asked to combine tensors of incompatible shapes.
    #[error("{op}: shape mismatch, {left} cannot be combined with {right}")]
    ShapeMismatch {
        op: &'static str,
        left: Shape,
        right: Shape,
    },
    /// A row or token index points outside the addressed tensor.
    #[error("{op}: index {index} out of range for {bound} rows")]
    IndexOutOfRange {
        op: &'static str,
        index: usize,
        bound: usize,
    },
    /// Host data does not match the requested shape.
    #[error("data length mismatch: expected {expected}, got {got}")]
    DataLength { expected: usize, got: usize },
    /// Execution failed on a backend (allocation, submission, readback, release).
    #[error("{backend} backend failure: {message}")]
    Backend {
        backend: &'static str,
        message: String,
    },
    /// Generic configuration violation.
    #[error("invalid value: {label}")]
    InvalidValue { label: &'static str },
}

impl TensorError {
    pub fn shape_mismatch(op: &'static str, left: &Shape, right: &Shape) -> Self {
        TensorError::ShapeMismatch {
            op,
            left: left.clone(),
            right: right.clone(),
        }
    }

    pub fn backend(backend: &'static str, message: impl Into<String>) -> Self {
        TensorError::Backend {
            backend,
            message: message.into(),
        }
    }
}
