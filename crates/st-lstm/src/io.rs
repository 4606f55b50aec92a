// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! JSON model documents.
//!
//! The document is a flat object: the four hyperparameters under
//! `vocabSize`/`embeddingSize`/`hiddenSize`/`outputSize`, plus one
//! `{ "shape": [...], "data": [...] }` entry per weight name.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use st_tensor::{MathBackend, Shape, TensorHandle};

use crate::config::{LstmConfig, TrainingConfig};
use crate::engine::LstmEngine;
use crate::error::{EngineError, PersistError};
use crate::params::{ParamName, WeightSet};

#[derive(Clone, Debug, Serialize, Deserialize)]
struct StoredTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelDocument {
    vocab_size: usize,
    embedding_size: usize,
    hidden_size: usize,
    output_size: usize,
    #[serde(flatten)]
    weights: BTreeMap<String, StoredTensor>,
}

impl ModelDocument {
    fn config(&self) -> LstmConfig {
        LstmConfig::new(
            self.vocab_size,
            self.embedding_size,
            self.hidden_size,
            self.output_size,
        )
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

fn to_document<B: MathBackend>(engine: &LstmEngine<B>) -> Result<ModelDocument, PersistError> {
    let backend = engine.backend();
    let mut weights = BTreeMap::new();
    for name in ParamName::ALL {
        let tensor = engine.weights().get(name)?;
        let data = backend.to_host(tensor)?;
        // JSON has no NaN or infinity; serde_json would write them as null.
        if let Some(index) = data.iter().position(|v| !v.is_finite()) {
            return Err(PersistError::NonFinite { name, index });
        }
        weights.insert(
            name.as_str().to_string(),
            StoredTensor {
                shape: tensor.shape().dims().to_vec(),
                data,
            },
        );
    }
    let config = engine.config();
    Ok(ModelDocument {
        vocab_size: config.vocab_size,
        embedding_size: config.embedding_size,
        hidden_size: config.hidden_size,
        output_size: config.output_size,
        weights,
    })
}

fn upload<B: MathBackend>(
    backend: &B,
    document: &mut ModelDocument,
) -> Result<WeightSet<B::Tensor>, PersistError> {
    let config = document.config();
    let mut weights = WeightSet::new();
    for name in ParamName::ALL {
        let stored = document
            .weights
            .remove(name.as_str())
            .ok_or(PersistError::MissingWeight(name))?;
        let expected = name.shape(&config);
        if stored.shape != expected.dims() {
            return Err(PersistError::Shape {
                name,
                expected: expected.dims().to_vec(),
                found: stored.shape,
            });
        }
        if stored.data.len() != expected.numel() {
            return Err(PersistError::DataLength {
                name,
                expected: expected.numel(),
                got: stored.data.len(),
            });
        }
        let tensor = backend.from_host(&stored.data, &Shape::new(stored.shape))?;
        weights.insert(name, tensor);
    }
    for extra in document.weights.keys() {
        tracing::debug!(key = %extra, "ignoring unknown entry in model document");
    }
    Ok(weights)
}

impl<B: MathBackend> LstmEngine<B> {
    /// Writes the hyperparameters and every weight to `path` as JSON.
    ///
    /// The document is serialised in memory, written to a sibling `.tmp`
    /// file and renamed over `path`, so a failed save never leaves a
    /// truncated model behind.
    pub fn save_model(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let path = path.as_ref();
        let document = to_document(self)?;
        let text = serde_json::to_string_pretty(&document)?;
        let tmp = temp_path(path);
        fs::write(&tmp, text).map_err(|err| PersistError::io(&tmp, err))?;
        if let Err(err) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(PersistError::io(path, err));
        }
        tracing::info!(path = %path.display(), "saved lstm model");
        Ok(())
    }

    /// Inverse of [`save_model`](Self::save_model), with default training
    /// settings. Any failure is logged and yields `None`.
    pub fn load_model(path: impl AsRef<Path>, backend: B) -> Option<Self> {
        Self::load_model_with(path, backend, TrainingConfig::default())
    }

    pub fn load_model_with(
        path: impl AsRef<Path>,
        backend: B,
        training: TrainingConfig,
    ) -> Option<Self> {
        let path = path.as_ref();
        match Self::try_load(path, backend, training) {
            Ok(engine) => Some(engine),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "could not load lstm model");
                None
            }
        }
    }

    /// Like [`load_model_with`](Self::load_model_with) but reports why
    /// loading failed.
    pub fn try_load(
        path: impl AsRef<Path>,
        backend: B,
        training: TrainingConfig,
    ) -> Result<Self, PersistError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| PersistError::io(path, err))?;
        let mut document: ModelDocument = serde_json::from_str(&text)?;
        let config = document.config();
        config.validate().map_err(EngineError::from)?;
        let weights = upload(&backend, &mut document)?;
        Ok(LstmEngine::from_parts(backend, config, training, weights)?)
    }
}
