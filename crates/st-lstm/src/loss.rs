// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Softmax cross-entropy summed over the steps of a sequence.

use st_tensor::{MathBackend, Shape, TensorError, TensorHandle};

use crate::error::{EngineError, EngineResult};
use crate::sequence::Targets;

/// Probabilities are floored here before the logarithm.
pub const PROB_FLOOR: f32 = 1e-9;

/// Summed cross-entropy of `predictions` (`[len, output]` softmax rows)
/// against `targets`.
pub fn sequence_cross_entropy<B: MathBackend>(
    backend: &B,
    predictions: &B::Tensor,
    targets: Targets<'_, B::Tensor>,
) -> EngineResult<f32> {
    let (rows, classes) = predictions.shape().as_matrix();
    if targets.len() != rows {
        return Err(EngineError::TargetLength {
            expected: rows,
            got: targets.len(),
        });
    }
    if rows == 0 {
        return Ok(0.0);
    }
    let probs = backend.to_host(predictions)?;
    let mut total = 0.0f64;
    match targets {
        Targets::Indices(indices) => {
            for (step, (&target, row)) in indices.iter().zip(probs.chunks(classes)).enumerate() {
                if target >= classes {
                    return Err(EngineError::TargetOutOfRange {
                        step,
                        target,
                        classes,
                    });
                }
                total -= f64::from(row[target].max(PROB_FLOOR).ln());
            }
        }
        Targets::Distribution(tensor) => {
            if tensor.shape().as_matrix() != (rows, classes) {
                return Err(TensorError::shape_mismatch(
                    "sequence_cross_entropy",
                    tensor.shape(),
                    &Shape::matrix(rows, classes),
                )
                .into());
            }
            let expected = backend.to_host(tensor)?;
            for (q, p) in expected.iter().zip(probs.iter()) {
                if *q != 0.0 {
                    total -= f64::from(*q) * f64::from(p.max(PROB_FLOOR).ln());
                }
            }
        }
    }
    Ok(total as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use st_tensor::CpuBackend;

    #[test]
    fn index_and_distribution_targets_agree() {
        let cpu = CpuBackend::new();
        let probs = cpu
            .from_host(&[0.7, 0.2, 0.1, 0.1, 0.1, 0.8], &Shape::matrix(2, 3))
            .unwrap();
        let by_index = sequence_cross_entropy(&cpu, &probs, Targets::Indices(&[0, 2])).unwrap();
        let expected = -(0.7f32.ln() + 0.8f32.ln());
        assert!((by_index - expected).abs() < 1e-6);

        let dist = cpu
            .from_host(&[1.0, 0.0, 0.0, 0.0, 0.0, 1.0], &Shape::matrix(2, 3))
            .unwrap();
        let by_dist = sequence_cross_entropy(&cpu, &probs, Targets::Distribution(&dist)).unwrap();
        assert!((by_index - by_dist).abs() < 1e-6);
    }

    #[test]
    fn zero_probability_is_floored() {
        let cpu = CpuBackend::new();
        let probs = cpu.from_host(&[1.0, 0.0], &Shape::matrix(1, 2)).unwrap();
        let loss = sequence_cross_entropy(&cpu, &probs, Targets::Indices(&[1])).unwrap();
        assert!(loss.is_finite());
        assert!((loss - (-PROB_FLOOR.ln())).abs() < 1e-3);
    }

    #[test]
    fn mismatched_targets_are_rejected() {
        let cpu = CpuBackend::new();
        let probs = cpu.from_host(&[0.5, 0.5], &Shape::matrix(1, 2)).unwrap();
        assert!(matches!(
            sequence_cross_entropy(&cpu, &probs, Targets::Indices(&[0, 1])),
            Err(EngineError::TargetLength { expected: 1, got: 2 })
        ));
        assert!(matches!(
            sequence_cross_entropy(&cpu, &probs, Targets::Indices(&[2])),
            Err(EngineError::TargetOutOfRange { target: 2, .. })
        ));
    }
}
