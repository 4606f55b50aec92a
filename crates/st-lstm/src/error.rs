// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::path::PathBuf;

use spiral_config::ConfigError;
use st_tensor::TensorError;
use thiserror::Error;

use crate::params::ParamName;

pub type EngineResult<T> = Result<T, EngineError>;

/// Failures raised by the training engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("weight `{0}` is not set")]
    MissingWeight(ParamName),
    #[error("token {token} at step {step} is outside the vocabulary of {vocab}")]
    TokenOutOfRange {
        step: usize,
        token: usize,
        vocab: usize,
    },
    #[error("target {target} at step {step} is outside the {classes} output classes")]
    TargetOutOfRange {
        step: usize,
        target: usize,
        classes: usize,
    },
    #[error("sequence has {expected} steps but {got} targets were supplied")]
    TargetLength { expected: usize, got: usize },
    #[error("gradient keys do not match the weights (missing {missing:?}, unexpected {unexpected:?})")]
    GradientMismatch {
        missing: Vec<ParamName>,
        unexpected: Vec<ParamName>,
    },
    #[error("engine has been torn down")]
    TornDown,
}

/// Failures raised while saving or loading a model document.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed model document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model document has no weight `{0}`")]
    MissingWeight(ParamName),
    #[error("weight `{name}` has shape {found:?}, hyperparameters require {expected:?}")]
    Shape {
        name: ParamName,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("weight `{name}` stores {got} values, its shape needs {expected}")]
    DataLength {
        name: ParamName,
        expected: usize,
        got: usize,
    },
    #[error("weight `{name}` holds a non-finite value at index {index}")]
    NonFinite { name: ParamName, index: usize },
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl PersistError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<TensorError> for PersistError {
    fn from(err: TensorError) -> Self {
        Self::Engine(EngineError::Tensor(err))
    }
}
